use failure::Fail;

/// Represents each reason why a full-consensus message could be faulty.
#[derive(Clone, Debug, Fail, PartialEq)]
pub enum FaultKind {
    /// A signed part does not verify against the current epoch's
    /// membership, or its payload does not decode.
    #[fail(display = "`FullConsensus` received an unverifiable signed content.")]
    InvalidSignature,
    /// A pre-prepare from a member that is not the current view's leader.
    #[fail(display = "`FullConsensus` received a pre-prepare from a non-leader.")]
    PrePrepareFromNonLeader,
    /// A pre-prepare whose signed reference does not match the value it
    /// carries.
    #[fail(display = "`FullConsensus` received a pre-prepare referencing a different value.")]
    PrePrepareRefMismatch,
}
