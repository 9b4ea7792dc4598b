use serde_derive::{Deserialize, Serialize};

use crate::group_state::{AuthContent, LeafIndex, MessageRef};

/// The conflict set handed to the restrained consensus: one `(sender,
/// reference)` pair per conflicting commit, in reference order.
pub type ConflictSet = Vec<(LeafIndex, MessageRef)>;

/// The initial broadcast of a participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipateContent {
    /// The participant's signatures, one per power-set element containing
    /// it.
    pub sig_set: Vec<AuthContent>,
    /// The power set of the conflict set as seen by the participant.
    pub power_set: Vec<ConflictSet>,
    /// The CAC signatures proving that the conflict is real.
    pub proofs: Vec<AuthContent>,
}

/// A restrained consensus message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RcMessage {
    /// A participant's signed power-set contribution.
    Participate(ParticipateContent),
    /// A member's signed abstention.
    Retract(AuthContent),
}
