use failure::Fail;

/// A CAC broadcast error.
#[derive(Clone, PartialEq, Debug, Fail)]
pub enum Error {
    /// `broadcast` was called after this instance already signed a statement
    /// for the epoch.
    #[fail(display = "Already signed a statement this epoch")]
    MultipleInputs,
}

/// A CAC broadcast result.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents each reason why a CAC message could be faulty.
#[derive(Clone, Debug, Fail, PartialEq)]
pub enum FaultKind {
    /// `CacBroadcast` received a signature that does not verify against the
    /// current epoch's membership.
    #[fail(display = "`CacBroadcast` received an unverifiable signature.")]
    InvalidSignature,
    /// `CacBroadcast` received a fresh signature reusing an already
    /// processed sequence number.
    #[fail(display = "`CacBroadcast` received a signature with a reused sequence number.")]
    ReusedSequence,
}
