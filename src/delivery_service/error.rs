use failure::Fail;

use crate::{cascade, gossip};

/// A delivery service error.
#[derive(Clone, PartialEq, Debug, Fail)]
pub enum Error {
    /// A commit was proposed although the epoch's broadcast already
    /// started.
    #[fail(display = "Cannot propose a commit: {}", _0)]
    ProposeCommit(#[cause] cascade::Error),
}

/// A delivery service result.
pub type Result<T> = std::result::Result<T, Error>;

/// Faults observable by the delivery service, wrapping those of its
/// sub-protocols.
#[derive(Clone, Debug, Fail, PartialEq)]
pub enum FaultKind {
    /// A fault in the gossip broadcast.
    #[fail(display = "Gossip fault: {}", _0)]
    GossipFault(#[cause] gossip::FaultKind),
    /// A fault in the cascade.
    #[fail(display = "Cascade fault: {}", _0)]
    CascadeFault(#[cause] cascade::FaultKind),
    /// A welcome received although we are already a group member.
    #[fail(display = "Received a welcome while already in the group.")]
    UnexpectedWelcome,
    /// A cascade envelope that is not a valid application message of the
    /// current epoch, or whose plaintext does not decode.
    #[fail(display = "Received an invalid cascade envelope.")]
    InvalidCascadePayload,
}
