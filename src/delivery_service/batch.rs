use crate::group_state::{Epoch, GroupMessage};

/// The result of one epoch: the agreed commit and its effects.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch<N> {
    /// The epoch the group advanced *to*.
    pub epoch: Epoch,
    /// The agreed commit.
    pub commit: GroupMessage,
    /// Members added by the commit.
    pub added: Vec<N>,
    /// Members removed by the commit.
    pub removed: Vec<N>,
    /// Whether the agreed commit is the one we proposed.
    pub own_commit: bool,
}
