//! ReconnectScheduler: at most one pending retry per session.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::LinkSignal;

/// Delay between an unexpected close and the next connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Same delay every time.
    Fixed { delay: Duration },
    /// `base * 2^attempt`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed {
            delay: Duration::from_secs(3),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed { delay } => delay,
            ReconnectPolicy::Exponential { base, max } => {
                let factor = 1u32 << attempt.min(6);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

struct Armed {
    generation: u64,
    cancel: CancellationToken,
}

/// Cancellable single-shot retry timer.
///
/// Arming while already armed is a no-op, so a burst of close notifications
/// yields one retry. Expiry is delivered as [`LinkSignal::ReconnectDue`] and
/// must be confirmed with [`ReconnectScheduler::fire`] before reconnecting.
pub struct ReconnectScheduler {
    policy: ReconnectPolicy,
    signals: mpsc::UnboundedSender<LinkSignal>,
    armed: Option<Armed>,
    attempt: u32,
}

impl ReconnectScheduler {
    pub fn new(policy: ReconnectPolicy, signals: mpsc::UnboundedSender<LinkSignal>) -> Self {
        Self {
            policy,
            signals,
            armed: None,
            attempt: 0,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Retries since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Schedule a retry for the connection `generation` that just closed.
    /// Returns false if a retry was already pending.
    pub fn arm(&mut self, generation: u64) -> bool {
        if self.armed.is_some() {
            debug!(generation, "reconnect already scheduled");
            return false;
        }

        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        info!(
            attempt = self.attempt,
            ?delay,
            "scheduling reconnect"
        );

        let cancel = CancellationToken::new();
        let timer_cancel = cancel.clone();
        let signals = self.signals.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer_cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = signals.send(LinkSignal::ReconnectDue { generation });
                }
            }
        });

        self.armed = Some(Armed { generation, cancel });
        true
    }

    /// Consume an expiry. False when the timer it came from was cancelled or
    /// replaced in the meantime.
    pub fn fire(&mut self, generation: u64) -> bool {
        match &self.armed {
            Some(armed) if armed.generation == generation && !armed.cancel.is_cancelled() => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    /// Drop any pending retry. Safe to call when nothing is armed.
    pub fn cancel(&mut self) {
        if let Some(armed) = self.armed.take() {
            debug!(generation = armed.generation, "reconnect cancelled");
            armed.cancel.cancel();
        }
    }

    /// A connection opened: the next failure starts from the first delay.
    pub fn reset_backoff(&mut self) {
        self.attempt = 0;
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(policy: ReconnectPolicy) -> (ReconnectScheduler, mpsc::UnboundedReceiver<LinkSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ReconnectScheduler::new(policy, tx), rx)
    }

    #[test]
    fn fixed_delay_never_grows() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(3));
        assert_eq!(policy.delay_for(20), Duration::from_secs(3));
    }

    #[test]
    fn exponential_delay_is_capped() {
        let policy = ReconnectPolicy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let (mut scheduler, mut signals) = scheduler(ReconnectPolicy::default());
        assert!(scheduler.arm(1));
        assert!(!scheduler.arm(1));
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_millis(2999)).await;
        assert!(signals.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(2)).await;
        let signal = signals.recv().await.unwrap();
        assert!(matches!(signal, LinkSignal::ReconnectDue { generation: 1 }));
        assert!(scheduler.fire(1));
        assert!(!scheduler.is_armed());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(signals.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (mut scheduler, mut signals) = scheduler(ReconnectPolicy::default());
        scheduler.arm(1);
        scheduler.cancel();
        scheduler.cancel();

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(signals.try_recv().is_err());
        assert!(!scheduler.fire(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_expiry_is_rejected() {
        let (mut scheduler, _signals) = scheduler(ReconnectPolicy::default());
        scheduler.arm(2);
        assert!(!scheduler.fire(1));
        assert!(scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_until_reset() {
        let (mut scheduler, _signals) = scheduler(ReconnectPolicy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        });
        for generation in 1..=3 {
            scheduler.arm(generation);
            scheduler.cancel();
        }
        assert_eq!(scheduler.attempt(), 3);

        scheduler.reset_backoff();
        assert_eq!(scheduler.attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_delays_arm_without_overflow() {
        let policy = ReconnectPolicy::Exponential {
            base: Duration::MAX,
            max: Duration::MAX,
        };
        assert_eq!(policy.delay_for(6), Duration::MAX);

        let (mut scheduler, mut signals) = scheduler(policy);
        assert!(scheduler.arm(1));
        assert!(scheduler.is_armed());

        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        tokio::task::yield_now().await;
        assert!(signals.try_recv().is_err());
        scheduler.cancel();
        assert!(!scheduler.is_armed());
    }
}
