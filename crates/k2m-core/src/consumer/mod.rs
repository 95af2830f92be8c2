//! Consumer-group runtime: lifecycle, per-partition workers and commits.

mod commit;
mod group;
mod state;
mod worker;

pub use commit::Committer;
pub use group::{GroupConsumer, GroupConsumerBuilder};
pub use state::{ConsumerState, StateMachine};
