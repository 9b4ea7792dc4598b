use serde_derive::{Deserialize, Serialize};

use super::SigRole;
use crate::group_state::AuthContent;

/// A CAC broadcast message: the announcement kind, every valid signature the
/// sender has collected, and optionally the payload the announcement is
/// about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacMessage<C> {
    /// Whether this message announces a `Witness` or a `Ready` signature.
    pub role: SigRole,
    /// All valid signatures known to the sender, in auth-reference order.
    pub sigs: Vec<AuthContent>,
    /// The piggybacked payload, present on initial witness announcements.
    pub payload: Option<C>,
}
