//! Restrained consensus: agreement confined to the senders of conflicting
//! commits.
//!
//! When the first CAC instance delivers a conflict set larger than one, only
//! the members that actually *sent* conflicting commits run this protocol.
//! Each participant signs every non-empty subset of the conflict set that
//! contains itself and broadcasts the signatures to the other participants.
//! A participant that never proposed — it learned of the conflict from
//! someone else first — *retracts* instead, pruning every subset it appears
//! in. The uniquely largest surviving subset, once fully signed by its own
//! members, is the decision. Everything else degrades to ⊥, handing the
//! epoch over to the next cascade stage.

mod error;
mod message;
mod restrained_consensus;

pub use self::error::FaultKind;
pub use self::message::{ConflictSet, ParticipateContent, RcMessage};
pub use self::restrained_consensus::{power_set, Output, RestrainedConsensus, Step, Timer};
