//! Producer flow control.
//!
//! Each session may carry a credit accountant limiting the rate at which a
//! producer pushes messages. Credit is granted in `message.flow` frames and
//! replenished from wall-clock elapsed time; a producer that keeps sending
//! with no credit left is told to `message.stop`. When credit cannot be
//! granted immediately the session asks the broker timer for a retry after
//! `min(50/rate, 500ms)`.

use tokio::time::{Duration, Instant};

/// Most messages of initial credit granted on attach.
const INITIAL_CREDIT_CAP: u32 = 300;

/// Upper bound on the scheduled credit retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Flow-control configuration for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowConfig {
    /// Sustained message rate allowed for the producer, per second.
    pub rate: u32,
}

/// Decision taken when a message is admitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowDecision {
    /// Nothing to do; the producer still holds enough credit.
    Continue,
    /// Grant `credit` additional messages via `message.flow`.
    Grant {
        /// Messages of new credit to issue.
        credit: u32,
    },
    /// No credit can be issued yet; retry after the given delay.
    Defer {
        /// Delay before the scheduled credit retry.
        retry_after: Duration,
    },
    /// The producer violated flow control; issue `message.stop`.
    Stop,
}

/// Per-session producer credit accountant.
///
/// All decisions are deterministic in `rate` and the supplied instants, so
/// the controller is testable under a paused clock.
#[derive(Debug)]
pub struct FlowController {
    rate: u32,
    /// Credit currently held by the producer.
    outstanding: u32,
    /// Window cap: credit the producer may hold at once.
    window: u32,
    last_issue: Instant,
}

impl FlowController {
    /// Create a controller for `rate` messages per second.
    ///
    /// A zero rate disables flow control and should be represented by not
    /// constructing a controller at all.
    #[must_use]
    pub fn new(config: FlowConfig, now: Instant) -> Self {
        let rate = config.rate.max(1);
        Self {
            rate,
            outstanding: 0,
            window: rate,
            last_issue: now,
        }
    }

    /// Configured rate in messages per second.
    #[must_use]
    pub const fn rate(&self) -> u32 { self.rate }

    /// Credit currently held by the producer.
    #[must_use]
    pub const fn outstanding(&self) -> u32 { self.outstanding }

    /// Credit granted when the session becomes ready to send.
    ///
    /// Heuristic: one second's worth, capped at 300 messages.
    #[must_use]
    pub fn initial_credit(&mut self, now: Instant) -> u32 {
        let credit = self.rate.min(INITIAL_CREDIT_CAP);
        self.outstanding = credit;
        self.last_issue = now;
        credit
    }

    /// Account for one admitted message and decide what to do next.
    #[must_use]
    pub fn on_message(&mut self, now: Instant) -> FlowDecision {
        if self.outstanding == 0 {
            // The producer is sending without credit.
            return FlowDecision::Stop;
        }
        self.outstanding -= 1;
        self.issue(now)
    }

    /// Scheduled retry: attempt to issue credit without admitting a message.
    ///
    /// Returns [`FlowDecision::Defer`] again when throttling must continue.
    #[must_use]
    pub fn retry(&mut self, now: Instant) -> FlowDecision { self.issue(now) }

    fn issue(&mut self, now: Instant) -> FlowDecision {
        let accrued = self.accrued(now);
        let headroom = self.window - self.outstanding;
        let issuable = accrued.min(headroom);
        // Issue in meaningful chunks rather than dribbling single credits,
        // but never leave a stopped producer waiting when credit exists.
        let threshold = if self.outstanding == 0 {
            1
        } else {
            (self.window / 2).max(1)
        };
        if issuable >= threshold {
            self.consume_accrual(now, issuable);
            self.outstanding += issuable;
            return FlowDecision::Grant { credit: issuable };
        }
        if self.outstanding == 0 {
            return FlowDecision::Defer {
                retry_after: self.retry_delay(),
            };
        }
        FlowDecision::Continue
    }

    /// Time for 50 messages at the configured rate, capped at 500ms.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(50.0 / f64::from(self.rate)).min(MAX_RETRY_DELAY)
    }

    fn accrued(&self, now: Instant) -> u32 {
        let elapsed_ms = now.saturating_duration_since(self.last_issue).as_millis();
        let accrued = elapsed_ms.saturating_mul(u128::from(self.rate)) / 1000;
        u32::try_from(accrued.min(u128::from(self.window))).unwrap_or(self.window)
    }

    fn consume_accrual(&mut self, now: Instant, issued: u32) {
        // Advance the issue mark by the time the issued credit represents,
        // keeping fractional accrual instead of discarding it. Clamp to
        // `now` so a capped accrual cannot leave the mark in the past
        // forever.
        let advance_ms = u64::from(issued) * 1000 / u64::from(self.rate).max(1);
        self.last_issue = (self.last_issue + Duration::from_millis(advance_ms)).min(now);
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::time::{self, Duration, Instant};

    use super::*;

    fn controller(rate: u32) -> FlowController {
        FlowController::new(FlowConfig { rate }, Instant::now())
    }

    #[rstest]
    #[case(100, 100)]
    #[case(1000, 300)]
    #[case(7, 7)]
    fn initial_credit_is_capped(#[case] rate: u32, #[case] expected: u32) {
        let mut flow = controller(rate);
        assert_eq!(flow.initial_credit(Instant::now()), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn producing_without_credit_stops() {
        let mut flow = controller(10);
        assert_eq!(flow.on_message(Instant::now()), FlowDecision::Stop);
    }

    #[tokio::test(start_paused = true)]
    async fn credit_accrues_with_time() {
        let mut flow = controller(100);
        let granted = flow.initial_credit(Instant::now());
        // Burn the whole window instantly.
        for _ in 0..granted - 1 {
            let decision = flow.on_message(Instant::now());
            assert!(
                matches!(decision, FlowDecision::Continue),
                "unexpected decision: {decision:?}"
            );
        }
        // The last message leaves the producer with no credit and no accrual.
        let decision = flow.on_message(Instant::now());
        assert!(matches!(decision, FlowDecision::Defer { .. }));

        time::advance(Duration::from_secs(1)).await;
        match flow.retry(Instant::now()) {
            FlowDecision::Grant { credit } => assert_eq!(credit, 100),
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn admitted_rate_is_bounded() {
        let rate = 50u32;
        let mut flow = controller(rate);
        let initial = flow.initial_credit(Instant::now());
        let seconds = 4u64;
        let mut admitted = 0u64;
        // A producer hammering at well over 2x the configured rate.
        for _ in 0..seconds * 1000 {
            time::advance(Duration::from_millis(1)).await;
            match flow.on_message(Instant::now()) {
                FlowDecision::Stop => {}
                _ => admitted += 1,
            }
        }
        assert!(
            admitted <= u64::from(rate) * seconds + u64::from(initial),
            "admitted {admitted} messages"
        );
    }

    #[rstest]
    #[case(100, Duration::from_millis(500))]
    #[case(1000, Duration::from_millis(50))]
    #[case(10, Duration::from_millis(500))]
    fn retry_delay_follows_heuristic(#[case] rate: u32, #[case] expected: Duration) {
        let flow = controller(rate);
        assert_eq!(flow.retry_delay(), expected);
    }
}
