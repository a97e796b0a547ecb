// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Named SIP timers with RFC 3261 defaults.
//!
//! [`TimerTable`] maps the lettered timers of RFC 3261 §17 (plus Timer L/M of
//! RFC 6026 and Timer N of RFC 6665) to durations, collapsing the wait timers
//! to zero over reliable transports. [`schedule`] arms a cancelable one-shot
//! on the tokio runtime; a canceled handle makes the pending firing a no-op.

use std::time::Duration;

use tokio::sync::oneshot;

/// Base timer values per RFC 3261 Table 4. T1 is the RTT estimate and must
/// not be configured below 500 ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSettings {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// The lettered transaction timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipTimer {
    /// INVITE client retransmit interval.
    A,
    /// INVITE client transaction timeout.
    B,
    /// Wait for response retransmits after a non-2xx INVITE final.
    D,
    /// Non-INVITE client retransmit interval.
    E,
    /// Non-INVITE client transaction timeout.
    F,
    /// INVITE server final-response retransmit interval.
    G,
    /// Wait for ACK receipt.
    H,
    /// Wait for ACK retransmits.
    I,
    /// Wait for request retransmits (non-INVITE server).
    J,
    /// Wait for response retransmits (non-INVITE client).
    K,
    /// Wait in Accepted for 2xx retransmits (INVITE server, RFC 6026).
    L,
    /// Wait in Accepted for 2xx retransmits (INVITE client, RFC 6026).
    M,
    /// Wait for the initial NOTIFY after SUBSCRIBE (RFC 6665).
    N,
}

/// Computes timer durations for one transport flavor.
#[derive(Debug, Clone, Copy)]
pub struct TimerTable {
    settings: TimerSettings,
    reliable: bool,
}

impl TimerTable {
    pub fn new(reliable: bool) -> Self {
        Self {
            settings: TimerSettings::default(),
            reliable,
        }
    }

    pub fn with_settings(reliable: bool, settings: TimerSettings) -> Self {
        Self { settings, reliable }
    }

    pub fn t1(&self) -> Duration {
        self.settings.t1
    }

    pub fn t2(&self) -> Duration {
        self.settings.t2
    }

    pub fn t4(&self) -> Duration {
        self.settings.t4
    }

    /// True when retransmission timers apply at all.
    pub fn retransmits(&self) -> bool {
        !self.reliable
    }

    /// Returns the duration for a named timer on this transport.
    pub fn duration(&self, timer: SipTimer) -> Duration {
        let t64 = self.settings.t1.saturating_mul(64);
        match timer {
            SipTimer::A | SipTimer::E | SipTimer::G => {
                if self.reliable {
                    Duration::ZERO
                } else {
                    self.settings.t1
                }
            }
            SipTimer::B | SipTimer::F | SipTimer::H | SipTimer::L | SipTimer::M | SipTimer::N => {
                t64
            }
            SipTimer::D => {
                if self.reliable {
                    Duration::ZERO
                } else {
                    // RFC 3261 mandates at least 32 seconds.
                    Duration::from_secs(32)
                }
            }
            SipTimer::I | SipTimer::K => {
                if self.reliable {
                    Duration::ZERO
                } else {
                    self.settings.t4
                }
            }
            SipTimer::J => {
                if self.reliable {
                    Duration::ZERO
                } else {
                    t64
                }
            }
        }
    }
}

/// Handle to a scheduled one-shot. Dropping the handle does NOT cancel the
/// timer; call [`TimerHandle::cancel`].
#[derive(Debug)]
pub struct TimerHandle {
    cancel: Option<oneshot::Sender<()>>,
}

impl TimerHandle {
    /// A handle that never fires; useful as an initial placeholder.
    pub fn disarmed() -> Self {
        Self { cancel: None }
    }

    /// Cancels the pending firing. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }

    /// True while the timer can still fire.
    pub fn is_armed(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }
}

/// Arms a cancelable one-shot that runs `on_fire` after `delay`.
///
/// A zero `delay` still defers the firing to the executor, keeping callback
/// ordering consistent with the event loop.
pub fn schedule<F>(delay: Duration, on_fire: F) -> TimerHandle
where
    F: FnOnce() + Send + 'static,
{
    let (cancel_tx, cancel_rx) = oneshot::channel();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => on_fire(),
            _ = cancel_rx => {}
        }
    });
    TimerHandle {
        cancel: Some(cancel_tx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_rfc3261_table4() {
        let settings = TimerSettings::default();
        assert_eq!(settings.t1, Duration::from_millis(500));
        assert_eq!(settings.t2, Duration::from_secs(4));
        assert_eq!(settings.t4, Duration::from_secs(5));
    }

    #[test]
    fn timeout_timers_are_64_t1_everywhere() {
        for reliable in [false, true] {
            let table = TimerTable::new(reliable);
            for timer in [SipTimer::B, SipTimer::F, SipTimer::H, SipTimer::L, SipTimer::M] {
                assert_eq!(table.duration(timer), Duration::from_secs(32));
            }
        }
    }

    #[test]
    fn wait_timers_collapse_on_reliable_transport() {
        let reliable = TimerTable::new(true);
        for timer in [SipTimer::D, SipTimer::I, SipTimer::J, SipTimer::K] {
            assert_eq!(reliable.duration(timer), Duration::ZERO);
        }
        let unreliable = TimerTable::new(false);
        assert_eq!(unreliable.duration(SipTimer::D), Duration::from_secs(32));
        assert_eq!(unreliable.duration(SipTimer::I), Duration::from_secs(5));
        assert_eq!(unreliable.duration(SipTimer::J), Duration::from_secs(32));
        assert_eq!(unreliable.duration(SipTimer::K), Duration::from_secs(5));
    }

    #[test]
    fn retransmit_base_is_t1() {
        let table = TimerTable::new(false);
        assert_eq!(table.duration(SipTimer::A), Duration::from_millis(500));
        assert_eq!(table.duration(SipTimer::E), Duration::from_millis(500));
        assert_eq!(table.duration(SipTimer::G), Duration::from_millis(500));
        assert!(table.retransmits());
        assert!(!TimerTable::new(true).retransmits());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_timer_fires() {
        let (tx, rx) = oneshot::channel();
        let _handle = schedule(Duration::from_millis(100), move || {
            let _ = tx.send(());
        });
        tokio::time::advance(Duration::from_millis(150)).await;
        rx.await.expect("timer fired");
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_timer_never_fires() {
        let (tx, mut rx) = oneshot::channel::<()>();
        let mut handle = schedule(Duration::from_millis(100), move || {
            let _ = tx.send(());
        });
        handle.cancel();
        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let mut handle = schedule(Duration::from_secs(1), || {});
        handle.cancel();
        handle.cancel();
        assert!(!handle.is_armed());
    }
}
