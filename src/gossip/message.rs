use serde_derive::{Deserialize, Serialize};

use crate::group_state::GroupMessage;

/// The two kinds of message exchanged by the gossip broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipMessage<N> {
    /// A request to be added to the recipient's sample, carrying the
    /// subscriber's identifier.
    Subscribe(N),
    /// A gossiped proposal or application message.
    Gossip(GroupMessage),
}
