//! Single-task coordinator
//!
//! Every external trigger (submissions, edits, deletions, pauses, queries and
//! timer fires) becomes an [`Event`] on one channel, consumed one at a time
//! by the task spawned with [`Coordinator::spawn`]. The duplicate check and
//! the insert that follows it therefore never interleave with another
//! submission, and the engine's timer state needs no lock.

mod handle;
mod messages;
mod runner;

pub use handle::CoordinatorHandle;
pub use messages::{
    Event, Reply, StatusReport, SubmissionInfo, SubmissionOutcome, SubmitRequest,
};
pub use runner::{Collaborators, Coordinator};
