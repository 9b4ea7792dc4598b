use failure::Fail;

/// Represents each reason why a restrained consensus message could be
/// faulty. Any fault in a participate message also aborts the instance.
#[derive(Clone, Debug, Fail, PartialEq)]
pub enum FaultKind {
    /// A participate message carried a proof that is not a valid CAC
    /// signature.
    #[fail(display = "`RestrainedConsensus` received an invalid conflict proof.")]
    InvalidProof,
    /// A participate message's proofs leave a gap in some sender's
    /// signature sequence.
    #[fail(display = "`RestrainedConsensus` received proofs with a sequence gap.")]
    ProofSequenceGap,
    /// A participate message's signature set is empty, unverifiable or not
    /// all from the same member.
    #[fail(display = "`RestrainedConsensus` received an invalid signature set.")]
    InvalidSigSet,
    /// A retract message that does not verify against the current epoch.
    #[fail(display = "`RestrainedConsensus` received an invalid retract.")]
    InvalidRetract,
}
