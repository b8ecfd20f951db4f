//! The workflow decider: replays OCR workflow histories and decides what to
//! do next.

pub mod decisions;
pub mod events;
pub mod finalize;
pub mod poll;
pub mod replay;
pub mod retry_policy;
#[cfg(test)]
pub mod testing;

pub use self::{
    decisions::{Decision, DecisionBuilder},
    events::{EventAttributes, HistoryEvent},
    finalize::{Finalization, Finalizer, OcrPage, RequestOutput, StagingCleanup},
    poll::{DecisionTaskPage, Poller, WorkflowService},
    replay::ReplayEngine,
    retry_policy::RetryPolicy,
};
