//! Subscription Dispatcher
//!
//! Fans published views out to consumers without ever blocking the
//! aggregation path.
//!
//! # Delivery Model
//!
//! Every subscription owns a mailbox holding at most one pending view per
//! symbol. `publish` overwrites the pending view (coalescing whatever the
//! subscriber has not consumed yet) and wakes the subscription's delivery
//! task. The task drains the mailbox and invokes the callback.
//!
//! - Per subscriber and symbol, `last_update` of delivered views strictly
//!   increases; anything not newer than the last delivery is skipped.
//! - Callbacks returning an error or panicking are counted and logged, and
//!   never affect other subscriptions.
//! - The dispatcher holds subscribers weakly. A dropped subscriber, or one
//!   failing `failure_limit` times in a row, is pruned.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::domain::market::{AggregatedSymbolView, Symbol};
use crate::domain::subscription::{SubscriptionHandle, SubscriptionIndex, SubscriptionStats, SymbolPattern};
use crate::domain::time::EpochMillis;
use crate::infrastructure::metrics::{DeliveryOutcome, record_delivery};

// =============================================================================
// Subscriber Contract
// =============================================================================

/// Failure reported by a subscriber callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriberError {
    /// The consumer refused the update.
    #[error("subscriber rejected update: {0}")]
    Rejected(String),
}

/// Dispatcher-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The dispatcher has been shut down.
    #[error("dispatcher is shut down")]
    Closed,

    /// `subscribe` was called outside a Tokio runtime.
    #[error("subscribe requires a running Tokio runtime")]
    NoRuntime,
}

/// A consumer of aggregated views.
///
/// Invoked from the subscription's own delivery task, one view at a time.
/// Any `Fn(&AggregatedSymbolView) -> Result<(), SubscriberError>` closure
/// implements this trait.
pub trait Subscriber: Send + Sync {
    /// Handle one update.
    ///
    /// # Errors
    ///
    /// Returns `SubscriberError` if the consumer cannot accept the update.
    fn on_update(&self, view: &AggregatedSymbolView) -> Result<(), SubscriberError>;
}

impl<F> Subscriber for F
where
    F: Fn(&AggregatedSymbolView) -> Result<(), SubscriberError> + Send + Sync,
{
    fn on_update(&self, view: &AggregatedSymbolView) -> Result<(), SubscriberError> {
        self(view)
    }
}

// =============================================================================
// Configuration and Statistics
// =============================================================================

/// Dispatcher configuration.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Consecutive failures after which a subscription is removed.
    pub failure_limit: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { failure_limit: 10 }
    }
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Subscription index statistics.
    pub subscriptions: SubscriptionStats,
    /// Views accepted by `publish`.
    pub published: u64,
    /// Successful callback invocations.
    pub delivered: u64,
    /// Failed or panicking callback invocations.
    pub failed: u64,
    /// Pending views overwritten before delivery.
    pub coalesced: u64,
    /// Subscriptions removed by the dispatcher.
    pub pruned: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    coalesced: AtomicU64,
    pruned: AtomicU64,
}

// =============================================================================
// Subscription Slot
// =============================================================================

struct Slot {
    subscriber: Weak<dyn Subscriber>,
    pending: Mutex<HashMap<Symbol, AggregatedSymbolView>>,
    notify: Notify,
    cancel: CancellationToken,
}

impl Slot {
    /// Store the view, replacing an older pending one. Returns whether an
    /// undelivered view was overwritten.
    fn offer(&self, view: &AggregatedSymbolView) -> bool {
        let mut pending = self.pending.lock();
        let coalesced = match pending.get(&view.symbol) {
            Some(existing) if existing.last_update >= view.last_update => return false,
            Some(_) => true,
            None => false,
        };
        pending.insert(view.symbol.clone(), view.clone());
        drop(pending);
        self.notify.notify_one();
        coalesced
    }

    fn take_pending(&self) -> Vec<AggregatedSymbolView> {
        let mut batch: Vec<_> = self.pending.lock().drain().map(|(_, view)| view).collect();
        batch.sort_by_key(|view| view.last_update);
        batch
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

struct Inner {
    config: DispatcherConfig,
    next_id: AtomicU64,
    index: RwLock<SubscriptionIndex>,
    slots: RwLock<HashMap<SubscriptionHandle, Arc<Slot>>>,
    counters: Counters,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Inner {
    fn remove(&self, handle: SubscriptionHandle) -> bool {
        self.index.write().remove(handle);
        let slot = self.slots.write().remove(&handle);
        slot.is_some_and(|slot| {
            slot.cancel.cancel();
            true
        })
    }

    fn prune(&self, handle: SubscriptionHandle, reason: &'static str) {
        if self.remove(handle) {
            self.counters.pruned.fetch_add(1, Ordering::Relaxed);
            tracing::info!(subscription = %handle, reason, "Pruned subscription");
        }
    }
}

/// Pattern-routed, coalescing fan-out of aggregated views.
///
/// Cloning yields another handle to the same dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                next_id: AtomicU64::new(1),
                index: RwLock::new(SubscriptionIndex::default()),
                slots: RwLock::new(HashMap::new()),
                counters: Counters::default(),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Register a subscriber for every symbol matching `pattern`.
    ///
    /// The dispatcher keeps only a weak reference; dropping the last `Arc`
    /// ends the subscription.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Closed` after shutdown and
    /// `DispatchError::NoRuntime` outside a Tokio runtime.
    pub fn subscribe<S>(&self, pattern: SymbolPattern, subscriber: &Arc<S>) -> Result<SubscriptionHandle, DispatchError>
    where
        S: Subscriber + 'static,
    {
        if self.inner.cancel.is_cancelled() {
            return Err(DispatchError::Closed);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;

        let handle = SubscriptionHandle::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let weak: Weak<dyn Subscriber> = Arc::downgrade(subscriber) as Weak<dyn Subscriber>;
        let slot = Arc::new(Slot {
            subscriber: weak,
            pending: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            cancel: self.inner.cancel.child_token(),
        });

        self.inner.slots.write().insert(handle, Arc::clone(&slot));
        self.inner.index.write().insert(handle, pattern.clone());

        let inner = Arc::clone(&self.inner);
        self.inner
            .tracker
            .spawn_on(delivery_loop(inner, handle, slot), &runtime);

        tracing::debug!(subscription = %handle, pattern = %pattern, "Subscription added");
        Ok(handle)
    }

    /// Remove a subscription. Unknown handles are ignored.
    ///
    /// Returns whether the handle was registered.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = self.inner.remove(handle);
        if removed {
            tracing::debug!(subscription = %handle, "Subscription removed");
        }
        removed
    }

    /// Offer a view to every matching subscription. Never blocks on
    /// subscribers.
    ///
    /// Returns the number of subscriptions the view was routed to.
    pub fn publish(&self, view: &AggregatedSymbolView) -> usize {
        if self.inner.cancel.is_cancelled() {
            return 0;
        }
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);

        let handles = self.inner.index.read().matching(&view.symbol);
        if handles.is_empty() {
            return 0;
        }

        let slots = self.inner.slots.read();
        let mut routed = 0;
        for handle in handles {
            if let Some(slot) = slots.get(&handle) {
                routed += 1;
                if slot.offer(view) {
                    self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    record_delivery(DeliveryOutcome::Coalesced);
                }
            }
        }
        routed
    }

    /// Whether a handle is registered.
    #[must_use]
    pub fn is_subscribed(&self, handle: SubscriptionHandle) -> bool {
        self.inner.index.read().contains(handle)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        let counters = &self.inner.counters;
        DispatcherStats {
            subscriptions: self.inner.index.read().stats(),
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            pruned: counters.pruned.load(Ordering::Relaxed),
        }
    }

    /// Stop all delivery tasks and wait for them to exit.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.slots.write().clear();
        *self.inner.index.write() = SubscriptionIndex::default();
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

// =============================================================================
// Delivery Task
// =============================================================================

async fn delivery_loop(inner: Arc<Inner>, handle: SubscriptionHandle, slot: Arc<Slot>) {
    let mut delivered: HashMap<Symbol, EpochMillis> = HashMap::new();
    let mut consecutive_failures: u32 = 0;

    loop {
        tokio::select! {
            biased;
            () = slot.cancel.cancelled() => break,
            () = slot.notify.notified() => {}
        }

        for view in slot.take_pending() {
            if slot.cancel.is_cancelled() {
                return;
            }
            let Some(subscriber) = slot.subscriber.upgrade() else {
                inner.prune(handle, "subscriber dropped");
                return;
            };

            if delivered
                .get(&view.symbol)
                .is_some_and(|&last| view.last_update <= last)
            {
                continue;
            }
            delivered.insert(view.symbol.clone(), view.last_update);

            match catch_unwind(AssertUnwindSafe(|| subscriber.on_update(&view))) {
                Ok(Ok(())) => {
                    consecutive_failures = 0;
                    inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    record_delivery(DeliveryOutcome::Delivered);
                }
                Ok(Err(e)) => {
                    consecutive_failures += 1;
                    inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                    record_delivery(DeliveryOutcome::Failed);
                    tracing::warn!(
                        subscription = %handle,
                        symbol = %view.symbol,
                        error = %e,
                        consecutive_failures,
                        "Subscriber callback failed"
                    );
                }
                Err(panic) => {
                    consecutive_failures += 1;
                    inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                    record_delivery(DeliveryOutcome::Failed);
                    tracing::warn!(
                        subscription = %handle,
                        symbol = %view.symbol,
                        panic = panic_message(panic.as_ref()),
                        consecutive_failures,
                        "Subscriber callback panicked"
                    );
                }
            }

            if inner.config.failure_limit > 0 && consecutive_failures >= inner.config.failure_limit {
                inner.prune(handle, "failure limit reached");
                return;
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use rust_decimal::Decimal;

    use super::*;

    fn view(symbol: &str, last_update: EpochMillis) -> AggregatedSymbolView {
        AggregatedSymbolView {
            symbol: symbol.to_string(),
            merged_price: Decimal::from(last_update),
            merged_volume: Decimal::ONE,
            spread: None,
            contributing_sources: BTreeSet::new(),
            last_update,
            stale: false,
            sequence: u64::try_from(last_update).unwrap_or_default(),
        }
    }

    fn recorder() -> (Arc<impl Subscriber>, Arc<Mutex<Vec<AggregatedSymbolView>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscriber = Arc::new(move |v: &AggregatedSymbolView| -> Result<(), SubscriberError> {
            sink.lock().push(v.clone());
            Ok(())
        });
        (subscriber, seen)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn routes_by_pattern() {
        let dispatcher = Dispatcher::default();
        let (btc, btc_seen) = recorder();
        let (all, all_seen) = recorder();

        dispatcher.subscribe(SymbolPattern::parse("BTC*").unwrap(), &btc).unwrap();
        dispatcher.subscribe(SymbolPattern::any(), &all).unwrap();

        assert_eq!(dispatcher.publish(&view("BTCUSD", 1)), 2);
        assert_eq!(dispatcher.publish(&view("ETHUSD", 2)), 1);
        settle().await;

        assert_eq!(btc_seen.lock().len(), 1);
        assert_eq!(all_seen.lock().len(), 2);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_affect_others() {
        let dispatcher = Dispatcher::new(DispatcherConfig { failure_limit: 0 });
        let failing = Arc::new(|_: &AggregatedSymbolView| -> Result<(), SubscriberError> {
            Err(SubscriberError::Rejected("nope".to_string()))
        });
        let panicking = Arc::new(|_: &AggregatedSymbolView| -> Result<(), SubscriberError> {
            panic!("boom");
        });
        let (healthy, seen) = recorder();

        dispatcher.subscribe(SymbolPattern::any(), &failing).unwrap();
        dispatcher.subscribe(SymbolPattern::any(), &panicking).unwrap();
        dispatcher.subscribe(SymbolPattern::any(), &healthy).unwrap();

        for i in 1..=5 {
            dispatcher.publish(&view("BTCUSD", i));
            settle().await;
        }

        assert_eq!(seen.lock().len(), 5);
        assert_eq!(dispatcher.stats().failed, 10);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn coalesces_for_slow_subscriber() {
        let dispatcher = Dispatcher::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(0));
        let (c, l) = (Arc::clone(&calls), Arc::clone(&last));
        let slow = Arc::new(move |v: &AggregatedSymbolView| -> Result<(), SubscriberError> {
            std::thread::sleep(Duration::from_millis(20));
            c.fetch_add(1, Ordering::SeqCst);
            *l.lock() = v.last_update;
            Ok(())
        });
        dispatcher.subscribe(SymbolPattern::any(), &slow).unwrap();

        for i in 1..=50 {
            dispatcher.publish(&view("BTCUSD", i));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(calls.load(Ordering::SeqCst) < 50);
        assert_eq!(*last.lock(), 50);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn delivery_never_goes_backwards() {
        let dispatcher = Dispatcher::default();
        let (sub, seen) = recorder();
        dispatcher.subscribe(SymbolPattern::any(), &sub).unwrap();

        dispatcher.publish(&view("BTCUSD", 10));
        settle().await;
        dispatcher.publish(&view("BTCUSD", 5));
        dispatcher.publish(&view("BTCUSD", 10));
        dispatcher.publish(&view("BTCUSD", 11));
        settle().await;

        let updates: Vec<_> = seen.lock().iter().map(|v| v.last_update).collect();
        assert_eq!(updates, vec![10, 11]);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn repeated_failures_prune_subscription() {
        let dispatcher = Dispatcher::new(DispatcherConfig { failure_limit: 3 });
        let failing = Arc::new(|_: &AggregatedSymbolView| -> Result<(), SubscriberError> {
            Err(SubscriberError::Rejected("down".to_string()))
        });
        let handle = dispatcher.subscribe(SymbolPattern::any(), &failing).unwrap();

        for i in 1..=3 {
            dispatcher.publish(&view("BTCUSD", i));
            settle().await;
        }

        assert!(!dispatcher.is_subscribed(handle));
        assert_eq!(dispatcher.stats().pruned, 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let dispatcher = Dispatcher::default();
        let (sub, _seen) = recorder();
        let handle = dispatcher.subscribe(SymbolPattern::any(), &sub).unwrap();
        drop(sub);

        dispatcher.publish(&view("BTCUSD", 1));
        settle().await;

        assert!(!dispatcher.is_subscribed(handle));
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let dispatcher = Dispatcher::default();
        let (sub, seen) = recorder();
        let handle = dispatcher.subscribe(SymbolPattern::any(), &sub).unwrap();

        assert!(dispatcher.unsubscribe(handle));
        assert!(!dispatcher.unsubscribe(handle));
        assert_eq!(dispatcher.publish(&view("BTCUSD", 1)), 0);
        settle().await;

        assert!(seen.lock().is_empty());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn subscribe_after_shutdown_fails() {
        let dispatcher = Dispatcher::default();
        dispatcher.shutdown().await;
        let (sub, _seen) = recorder();
        assert_eq!(
            dispatcher.subscribe(SymbolPattern::any(), &sub),
            Err(DispatchError::Closed)
        );
    }

    #[test]
    fn subscribe_outside_runtime_fails() {
        let dispatcher = Dispatcher::default();
        let (sub, _seen) = recorder();
        assert_eq!(
            dispatcher.subscribe(SymbolPattern::any(), &sub),
            Err(DispatchError::NoRuntime)
        );
    }
}
