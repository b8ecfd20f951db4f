//! Per-page retry policy.
//!
//! A failed or timed-out task is retried in two phases: first we start a
//! timer, then when the timer fires we reschedule the task. The attempt
//! counter lives in the `control` field of each scheduled task, and the timer
//! carries the ID of the scheduled task it is retrying, so a freshly started
//! decider can always work out where it was from the history alone.

use rand::Rng as _;

use crate::codec::TaskInput;

/// Upper bound (exclusive) on the random jitter added to retry delays.
const JITTER_SECS: u64 = 30;

/// Cap on the exponent used for backoff, to keep delays sane.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// What to do about a failed or timed-out task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryAction {
    /// Wait this long, then retry.
    Delay { delay_secs: u64 },

    /// We've tried enough times. Fail the workflow.
    GiveUp,
}

/// How we retry tasks.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    /// Create a policy allowing up to `max_attempts` attempts per page. Values
    /// below 1 are treated as 1.
    pub fn new(max_attempts: i64) -> Self {
        let max_attempts = u32::try_from(max_attempts.max(1)).unwrap_or(u32::MAX);
        Self { max_attempts }
    }

    /// How many attempts we allow per page.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide what to do after attempt number `attempt` failed or timed out.
    pub fn after_failure(&self, attempt: u32) -> RetryAction {
        if attempt >= self.max_attempts {
            RetryAction::GiveUp
        } else {
            RetryAction::Delay {
                delay_secs: backoff_secs(attempt),
            }
        }
    }

    /// Build the input and attempt number for the retry of a task, once its
    /// timer has fired. Timeouts shrink the image, plain failures don't.
    pub fn retry_input(
        &self,
        attempt: u32,
        input: &TaskInput,
        timed_out: bool,
    ) -> (TaskInput, u32) {
        let next = if timed_out {
            input.with_reduced_scale()
        } else {
            input.clone()
        };
        (next, attempt.saturating_add(1))
    }
}

/// `2^attempt` seconds plus a random jitter in `[0, JITTER_SECS)`.
pub fn backoff_secs(attempt: u32) -> u64 {
    let base = 1u64 << attempt.min(MAX_BACKOFF_EXPONENT);
    base + rand::rng().random_range(0..JITTER_SECS)
}

/// Parse the attempt counter from a scheduled task's `control` field.
/// Missing or garbled counters count as a first attempt.
pub fn parse_attempt(control: Option<&str>) -> u32 {
    control
        .and_then(|c| c.trim().parse::<u32>().ok())
        .filter(|&n| n >= 1)
        .unwrap_or(1)
}
