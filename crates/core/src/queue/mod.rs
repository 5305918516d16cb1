//! Queue order and the policy that enforces it.

mod order;
mod policy;

pub use order::{QueueError, QueueOrder};
pub use policy::{
    compute_ratio, plan_transitions, seeds_to_demote, QueueAction, QueueEntry, QueueReport,
    RatioAction,
};
