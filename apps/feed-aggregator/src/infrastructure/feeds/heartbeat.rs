//! Ping/Pong Liveness
//!
//! Tracks transport-level liveness of a streaming session. The session loop
//! calls [`Heartbeat::on_tick`] on every ping interval and acts on the
//! returned [`HeartbeatAction`]; inbound pongs and data frames are fed back
//! through [`Heartbeat::on_pong`] and [`Heartbeat::on_frame`].
//!
//! This is distinct from data silence: a source can answer pings while
//! sending no market data. The supervisor watches data silence separately.

use std::time::Duration;

use tokio::time::Instant;

use crate::infrastructure::config::EngineSettings;

/// Ping cadence and pong deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Time allowed for a pong after a ping.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(20),
        }
    }
}

impl HeartbeatConfig {
    /// Build from process settings.
    #[must_use]
    pub const fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            ping_interval: settings.ping_interval,
            pong_timeout: settings.pong_timeout,
        }
    }
}

/// What the session loop should do on a ping tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping frame.
    SendPing,
    /// A ping is outstanding and still within its deadline.
    Wait,
    /// The outstanding ping went unanswered past the deadline.
    Expired(Duration),
}

/// Liveness state for one session.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    ping_sent_at: Option<Instant>,
    last_inbound: Instant,
}

impl Heartbeat {
    /// Fresh state for a session opened at `now`.
    #[must_use]
    pub const fn new(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            ping_sent_at: None,
            last_inbound: now,
        }
    }

    /// Configured ping interval.
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        self.config.ping_interval
    }

    /// Decide what to do on a ping tick.
    pub fn on_tick(&mut self, now: Instant) -> HeartbeatAction {
        if let Some(sent) = self.ping_sent_at {
            let waited = now.saturating_duration_since(sent);
            if waited > self.config.pong_timeout {
                return HeartbeatAction::Expired(waited);
            }
            return HeartbeatAction::Wait;
        }
        self.ping_sent_at = Some(now);
        HeartbeatAction::SendPing
    }

    /// A pong arrived.
    pub fn on_pong(&mut self, now: Instant) {
        self.ping_sent_at = None;
        self.last_inbound = now;
    }

    /// Any other inbound frame arrived. Data proves the link is alive, so an
    /// outstanding ping is considered answered.
    pub fn on_frame(&mut self, now: Instant) {
        self.on_pong(now);
    }

    /// Whether a ping is awaiting its pong.
    #[must_use]
    pub const fn is_waiting_for_pong(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn since_last_inbound(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_inbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(20));
        assert_eq!(config.pong_timeout, Duration::from_secs(20));
    }

    #[test]
    fn first_tick_sends_ping() {
        let start = Instant::now();
        let mut hb = Heartbeat::new(config(), start);
        assert_eq!(hb.on_tick(start), HeartbeatAction::SendPing);
        assert!(hb.is_waiting_for_pong());
    }

    #[test]
    fn pong_clears_outstanding_ping() {
        let start = Instant::now();
        let mut hb = Heartbeat::new(config(), start);
        hb.on_tick(start);
        hb.on_pong(start + Duration::from_secs(1));
        assert!(!hb.is_waiting_for_pong());
        assert_eq!(hb.on_tick(start + Duration::from_secs(10)), HeartbeatAction::SendPing);
    }

    #[test]
    fn unanswered_ping_expires_after_timeout() {
        let start = Instant::now();
        let mut hb = Heartbeat::new(config(), start);
        hb.on_tick(start);
        assert_eq!(hb.on_tick(start + Duration::from_secs(5)), HeartbeatAction::Wait);
        assert_eq!(
            hb.on_tick(start + Duration::from_secs(6)),
            HeartbeatAction::Expired(Duration::from_secs(6))
        );
    }

    #[test]
    fn data_frame_counts_as_liveness() {
        let start = Instant::now();
        let mut hb = Heartbeat::new(config(), start);
        hb.on_tick(start);
        hb.on_frame(start + Duration::from_secs(3));
        assert!(!hb.is_waiting_for_pong());
        assert_eq!(hb.since_last_inbound(start + Duration::from_secs(4)), Duration::from_secs(1));
    }
}
