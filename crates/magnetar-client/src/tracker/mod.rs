//! Ack bookkeeping owned by the consumer actor.
//!
//! The trackers are plain data structures; their periodic work is driven by
//! ticker tasks that post into the owning engine's inbox, so no tracker
//! state is ever touched off the actor.

mod ack_grouping;
mod negative_ack;
mod unacked;

pub(crate) use ack_grouping::{AckBatch, AckGroupingTracker};
pub(crate) use negative_ack::NegativeAckTracker;
pub(crate) use unacked::UnackedMessageTracker;
