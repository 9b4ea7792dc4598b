//! Simplified Practical Byzantine Fault Tolerance, the last stage of the
//! cascade.
//!
//! The instance decides a single value per epoch: no checkpoints, no
//! sequence numbers. A deterministic leader per view collects proposals and
//! pre-prepares one; members prepare, then commit, and deliver on a commit
//! quorum. Two timeouts drive liveness: a silent leader makes members
//! broadcast their proposal to everyone, and continued silence triggers a
//! view change.

mod error;
mod full_consensus;
mod message;

pub use self::error::FaultKind;
pub use self::full_consensus::{FullConsensus, Step, Timer};
pub use self::message::FcMessage;
