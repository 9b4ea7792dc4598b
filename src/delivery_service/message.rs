use serde_derive::{Deserialize, Serialize};

use crate::gossip::GossipMessage;
use crate::group_state::{GroupMessage, Welcome};

/// The outer wire envelope exchanged between delivery services.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DdsMessage<N> {
    /// A group welcome for a newly added member.
    Welcome(Welcome),
    /// A gossip-broadcast message (subscription or payload).
    Gossip(GossipMessage<N>),
    /// A cascade-consensus message, wrapped in an application-protected
    /// group message so only current members can read it and cross-epoch
    /// replay fails validation.
    Cascade(GroupMessage),
}
