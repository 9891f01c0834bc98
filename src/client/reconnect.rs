//! Resilient reconnection controller
//!
//! Generic over "a socket that delivers typed frames": the controller never
//! sees payloads or error taxonomies, only the fact that the socket closed
//! and whether the close code is terminal. Backoff is exponential with a
//! fixed base, capped attempts, and an upper delay bound. A successful open
//! resets the counter; exhausting the cap is terminal until the caller
//! explicitly resets.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

const CLOSE_CODE_NORMAL: u16 = 1000;
/// Policy violation; the gateway uses it for auth failures.
const CLOSE_CODE_POLICY: u16 = 1008;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnection attempts per outage.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// How a socket ended, as far as the controller cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Clean close; the peer is done with us.
    Normal,
    /// Terminal by policy (auth/authz rejection). Never retried.
    Terminal,
    /// Anything else: network error, timeout, abnormal close.
    Abnormal,
}

impl CloseKind {
    pub fn from_close_code(code: Option<u16>) -> Self {
        match code {
            Some(CLOSE_CODE_NORMAL) => CloseKind::Normal,
            Some(CLOSE_CODE_POLICY) => CloseKind::Terminal,
            _ => CloseKind::Abnormal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Clean end; do nothing.
    Stop,
    /// Terminal state reached; no further attempts until reset.
    GiveUp,
    /// Retry after the given backoff delay.
    RetryAfter(Duration),
}

pub struct ReconnectController {
    policy: ReconnectPolicy,
    /// Monotonic within one outage; reset only by a successful open.
    attempts: AtomicU32,
    gave_up: AtomicBool,
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: AtomicU32::new(0),
            gave_up: AtomicBool::new(false),
        }
    }

    /// The socket opened successfully; the outage (if any) is over.
    pub fn on_connected(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.gave_up.store(false, Ordering::SeqCst);
    }

    /// The socket closed; decide what happens next.
    pub fn on_close(&self, kind: CloseKind) -> ReconnectDecision {
        if self.gave_up.load(Ordering::SeqCst) {
            return ReconnectDecision::GiveUp;
        }
        match kind {
            CloseKind::Normal => ReconnectDecision::Stop,
            CloseKind::Terminal => {
                self.gave_up.store(true, Ordering::SeqCst);
                ReconnectDecision::GiveUp
            }
            CloseKind::Abnormal => {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt > self.policy.max_attempts {
                    self.gave_up.store(true, Ordering::SeqCst);
                    ReconnectDecision::GiveUp
                } else {
                    ReconnectDecision::RetryAfter(self.delay_for(attempt))
                }
            }
        }
    }

    /// Explicit restart after `gave-up` (the user's manual reconnect).
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.gave_up.store(false, Ordering::SeqCst);
    }

    pub fn gave_up(&self) -> bool {
        self.gave_up.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.policy.initial_delay.as_millis() as f64;
        let delay = base * self.policy.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = delay.min(self.policy.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> ReconnectController {
        ReconnectController::new(ReconnectPolicy::default())
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let c = controller();
        assert_eq!(
            c.on_close(CloseKind::Abnormal),
            ReconnectDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            c.on_close(CloseKind::Abnormal),
            ReconnectDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            c.on_close(CloseKind::Abnormal),
            ReconnectDecision::RetryAfter(Duration::from_secs(4))
        );

        let long = ReconnectController::new(ReconnectPolicy {
            max_attempts: 20,
            ..ReconnectPolicy::default()
        });
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            if let ReconnectDecision::RetryAfter(d) = long.on_close(CloseKind::Abnormal) {
                last = d;
            }
        }
        assert_eq!(last, Duration::from_secs(30));
    }

    #[test]
    fn gives_up_after_max_attempts_and_stays_there() {
        let c = controller();
        for _ in 0..5 {
            assert!(matches!(
                c.on_close(CloseKind::Abnormal),
                ReconnectDecision::RetryAfter(_)
            ));
        }
        assert_eq!(c.on_close(CloseKind::Abnormal), ReconnectDecision::GiveUp);
        assert!(c.gave_up());

        // No further attempts are counted once terminal.
        let before = c.attempts();
        assert_eq!(c.on_close(CloseKind::Abnormal), ReconnectDecision::GiveUp);
        assert_eq!(c.attempts(), before);
    }

    #[test]
    fn successful_open_resets_the_counter() {
        let c = controller();
        c.on_close(CloseKind::Abnormal);
        c.on_close(CloseKind::Abnormal);
        assert_eq!(c.attempts(), 2);

        c.on_connected();
        assert_eq!(c.attempts(), 0);
        // Fresh outage starts at the initial delay again.
        assert_eq!(
            c.on_close(CloseKind::Abnormal),
            ReconnectDecision::RetryAfter(Duration::from_secs(1))
        );
    }

    #[test]
    fn terminal_close_is_never_retried() {
        let c = controller();
        assert_eq!(c.on_close(CloseKind::Terminal), ReconnectDecision::GiveUp);
        assert!(c.gave_up());
    }

    #[test]
    fn normal_close_stops_without_giving_up() {
        let c = controller();
        assert_eq!(c.on_close(CloseKind::Normal), ReconnectDecision::Stop);
        assert!(!c.gave_up());
    }

    #[test]
    fn reset_reenables_retries() {
        let c = ReconnectController::new(ReconnectPolicy {
            max_attempts: 1,
            ..ReconnectPolicy::default()
        });
        c.on_close(CloseKind::Abnormal);
        assert_eq!(c.on_close(CloseKind::Abnormal), ReconnectDecision::GiveUp);

        c.reset();
        assert!(!c.gave_up());
        assert!(matches!(
            c.on_close(CloseKind::Abnormal),
            ReconnectDecision::RetryAfter(_)
        ));
    }

    #[test]
    fn close_codes_classify() {
        assert_eq!(CloseKind::from_close_code(Some(1000)), CloseKind::Normal);
        assert_eq!(CloseKind::from_close_code(Some(1008)), CloseKind::Terminal);
        assert_eq!(CloseKind::from_close_code(Some(1011)), CloseKind::Abnormal);
        assert_eq!(CloseKind::from_close_code(None), CloseKind::Abnormal);
    }
}
