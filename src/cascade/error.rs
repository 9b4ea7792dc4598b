use failure::Fail;

use crate::{cac, full_consensus, restrained_consensus};

/// A cascade error.
#[derive(Clone, PartialEq, Debug, Fail)]
pub enum Error {
    /// A commit was proposed after the epoch's broadcast already started.
    #[fail(display = "Commit proposed too late: {}", _0)]
    ProposeCommit(#[cause] cac::Error),
}

/// A cascade result.
pub type Result<T> = std::result::Result<T, Error>;

/// Faults observable by the cascade, wrapping those of its sub-protocols.
#[derive(Clone, Debug, Fail, PartialEq)]
pub enum FaultKind {
    /// A fault in one of the two CAC instances.
    #[fail(display = "CAC fault: {}", _0)]
    CacFault(#[cause] cac::FaultKind),
    /// A fault in the restrained consensus.
    #[fail(display = "Restrained consensus fault: {}", _0)]
    RcFault(#[cause] restrained_consensus::FaultKind),
    /// A fault in the full consensus.
    #[fail(display = "Full consensus fault: {}", _0)]
    ConsensusFault(#[cause] full_consensus::FaultKind),
}
