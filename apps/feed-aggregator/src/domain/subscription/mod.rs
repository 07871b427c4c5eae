//! Subscription Patterns and Index
//!
//! Consumers subscribe with a symbol pattern rather than a fixed symbol list.
//! The index keeps exact patterns in a hash map and wildcard patterns in a
//! short list, so routing one update costs one lookup plus a scan of the
//! wildcard subscriptions.
//!
//! # Pattern Syntax
//!
//! - `*` matches any run of characters, including none
//! - `?` matches exactly one character
//! - everything else matches itself (case-sensitive)

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::domain::market::Symbol;

// =============================================================================
// Types
// =============================================================================

/// Opaque handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id.
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Invalid symbol pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    /// Pattern was empty or whitespace.
    #[error("symbol pattern cannot be empty")]
    Empty,
    /// Pattern contained whitespace.
    #[error("symbol pattern `{0}` contains whitespace")]
    Whitespace(String),
}

/// A glob over canonical symbols.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolPattern {
    raw: String,
    wildcard: bool,
}

impl SymbolPattern {
    /// Parse a pattern.
    ///
    /// # Errors
    ///
    /// Returns `PatternError` if the pattern is empty or contains whitespace.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.trim().is_empty() {
            return Err(PatternError::Empty);
        }
        if pattern.chars().any(char::is_whitespace) {
            return Err(PatternError::Whitespace(pattern.to_string()));
        }
        Ok(Self {
            raw: pattern.to_string(),
            wildcard: pattern.contains(['*', '?']),
        })
    }

    /// Pattern matching every symbol.
    #[must_use]
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            wildcard: true,
        }
    }

    /// The pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern contains wildcards.
    #[must_use]
    pub const fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// Test a symbol against the pattern.
    #[must_use]
    pub fn matches(&self, symbol: &str) -> bool {
        if !self.wildcard {
            return self.raw == symbol;
        }
        glob_match(self.raw.as_bytes(), symbol.as_bytes())
    }
}

impl fmt::Display for SymbolPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Iterative glob matcher with single-star backtracking.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut star_text = 0;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            star_text = t;
            p += 1;
        } else if let Some(star_at) = star {
            p = star_at + 1;
            star_text += 1;
            t = star_text;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

// =============================================================================
// Subscription Index
// =============================================================================

/// Routes symbols to the subscriptions whose pattern matches them.
///
/// Not synchronized; the dispatcher owns it behind a lock.
///
/// # Example
///
/// ```rust
/// use feed_aggregator::domain::subscription::{SubscriptionHandle, SubscriptionIndex, SymbolPattern};
///
/// let mut index = SubscriptionIndex::default();
/// index.insert(SubscriptionHandle::new(1), SymbolPattern::parse("BTC*").unwrap());
/// index.insert(SubscriptionHandle::new(2), SymbolPattern::parse("ETHUSD").unwrap());
///
/// assert_eq!(index.matching("BTCUSD"), vec![SubscriptionHandle::new(1)]);
/// assert_eq!(index.matching("ETHUSD"), vec![SubscriptionHandle::new(2)]);
/// assert!(index.matching("SOLUSD").is_empty());
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    /// Exact symbol to subscriptions.
    exact: HashMap<Symbol, HashSet<SubscriptionHandle>>,
    /// Wildcard subscriptions, scanned per update.
    wildcard: Vec<(SubscriptionHandle, SymbolPattern)>,
    /// Every handle with its pattern.
    patterns: HashMap<SubscriptionHandle, SymbolPattern>,
}

impl SubscriptionIndex {
    /// Register a subscription. Re-inserting a handle replaces its pattern.
    pub fn insert(&mut self, handle: SubscriptionHandle, pattern: SymbolPattern) {
        self.remove(handle);

        if pattern.is_wildcard() {
            self.wildcard.push((handle, pattern.clone()));
        } else {
            self.exact
                .entry(pattern.as_str().to_string())
                .or_default()
                .insert(handle);
        }
        self.patterns.insert(handle, pattern);
    }

    /// Remove a subscription. Returns its pattern if it was present.
    pub fn remove(&mut self, handle: SubscriptionHandle) -> Option<SymbolPattern> {
        let pattern = self.patterns.remove(&handle)?;

        if pattern.is_wildcard() {
            self.wildcard.retain(|(h, _)| *h != handle);
        } else if let Some(handles) = self.exact.get_mut(pattern.as_str()) {
            handles.remove(&handle);
            // Clean up empty symbol entry
            if handles.is_empty() {
                self.exact.remove(pattern.as_str());
            }
        }

        Some(pattern)
    }

    /// Handles whose pattern matches `symbol`, in ascending order.
    #[must_use]
    pub fn matching(&self, symbol: &str) -> Vec<SubscriptionHandle> {
        let mut handles: Vec<SubscriptionHandle> = self
            .exact
            .get(symbol)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        handles.extend(
            self.wildcard
                .iter()
                .filter(|(_, pattern)| pattern.matches(symbol))
                .map(|(handle, _)| *handle),
        );
        handles.sort_unstable();
        handles
    }

    /// Pattern registered for a handle.
    #[must_use]
    pub fn pattern(&self, handle: SubscriptionHandle) -> Option<&SymbolPattern> {
        self.patterns.get(&handle)
    }

    /// Whether a handle is registered.
    #[must_use]
    pub fn contains(&self, handle: SubscriptionHandle) -> bool {
        self.patterns.contains_key(&handle)
    }

    /// Index statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            subscription_count: self.patterns.len(),
            exact_symbol_count: self.exact.len(),
            wildcard_count: self.wildcard.len(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Subscription index statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Registered subscriptions.
    pub subscription_count: usize,
    /// Distinct symbols with exact subscriptions.
    pub exact_symbol_count: usize,
    /// Wildcard subscriptions.
    pub wildcard_count: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn handle(id: u64) -> SubscriptionHandle {
        SubscriptionHandle::new(id)
    }

    fn pattern(p: &str) -> SymbolPattern {
        SymbolPattern::parse(p).unwrap()
    }

    // =========================================================================
    // Pattern Tests
    // =========================================================================

    #[test_case("BTCUSD", "BTCUSD", true ; "exact match")]
    #[test_case("BTCUSD", "BTCUSDT", false ; "exact is not prefix")]
    #[test_case("BTC*", "BTCUSD", true ; "trailing star")]
    #[test_case("BTC*", "BTC", true ; "star matches empty")]
    #[test_case("*USD", "ETHUSD", true ; "leading star")]
    #[test_case("*USD", "ETHUSDT", false ; "leading star anchored at end")]
    #[test_case("B?CUSD", "BTCUSD", true ; "single char wildcard")]
    #[test_case("B?CUSD", "BCUSD", false ; "question mark needs one char")]
    #[test_case("*", "ANYTHING", true ; "match all")]
    #[test_case("*T*USD", "BTCTUSD", true ; "multiple stars backtrack")]
    #[test_case("btc*", "BTCUSD", false ; "case sensitive")]
    fn pattern_matching(p: &str, symbol: &str, expected: bool) {
        assert_eq!(pattern(p).matches(symbol), expected);
    }

    #[test]
    fn empty_pattern_rejected() {
        assert_eq!(SymbolPattern::parse(""), Err(PatternError::Empty));
        assert_eq!(SymbolPattern::parse("  "), Err(PatternError::Empty));
    }

    #[test]
    fn whitespace_pattern_rejected() {
        assert!(matches!(
            SymbolPattern::parse("BTC USD"),
            Err(PatternError::Whitespace(_))
        ));
    }

    #[test]
    fn any_pattern_is_wildcard() {
        let any = SymbolPattern::any();
        assert!(any.is_wildcard());
        assert!(any.matches("AAPL"));
    }

    // =========================================================================
    // Index Tests
    // =========================================================================

    #[test]
    fn exact_and_wildcard_routing() {
        let mut index = SubscriptionIndex::default();
        index.insert(handle(1), pattern("BTCUSD"));
        index.insert(handle(2), pattern("BTC*"));
        index.insert(handle(3), pattern("ETH*"));
        index.insert(handle(4), pattern("*"));

        assert_eq!(index.matching("BTCUSD"), vec![handle(1), handle(2), handle(4)]);
        assert_eq!(index.matching("ETHUSD"), vec![handle(3), handle(4)]);
    }

    #[test]
    fn multiple_exact_subscribers_same_symbol() {
        let mut index = SubscriptionIndex::default();
        index.insert(handle(1), pattern("AAPL"));
        index.insert(handle(2), pattern("AAPL"));

        assert_eq!(index.matching("AAPL"), vec![handle(1), handle(2)]);
        assert_eq!(index.stats().exact_symbol_count, 1);
    }

    #[test]
    fn remove_cleans_up() {
        let mut index = SubscriptionIndex::default();
        index.insert(handle(1), pattern("AAPL"));
        index.insert(handle(2), pattern("A*"));

        assert_eq!(index.remove(handle(1)), Some(pattern("AAPL")));
        assert_eq!(index.remove(handle(2)), Some(pattern("A*")));
        assert_eq!(index.remove(handle(2)), None);

        assert!(index.matching("AAPL").is_empty());
        assert_eq!(index.stats(), SubscriptionStats::default());
    }

    #[test]
    fn reinsert_replaces_pattern() {
        let mut index = SubscriptionIndex::default();
        index.insert(handle(1), pattern("AAPL"));
        index.insert(handle(1), pattern("MSFT"));

        assert!(index.matching("AAPL").is_empty());
        assert_eq!(index.matching("MSFT"), vec![handle(1)]);
        assert_eq!(index.stats().subscription_count, 1);
    }

    #[test]
    fn handle_display() {
        assert_eq!(handle(7).to_string(), "sub-7");
        assert_eq!(handle(7).id(), 7);
    }
}
