use serde_derive::{Deserialize, Serialize};

use crate::group_state::{AuthContent, MessageRef};

/// A full-consensus message. The signed parts carry a [`RoundContent`] or a
/// [`ViewChangeContent`] as their payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FcMessage<C> {
    /// A proposal, unicast to the view's leader (or broadcast when the
    /// leader is suspected).
    Propose {
        /// The proposer's current view.
        view: u32,
        /// The proposed value.
        content: C,
    },
    /// The leader's pre-prepare: a signed `(view, reference)` plus the
    /// proposed value itself.
    PrePrepare {
        /// Signed [`RoundContent`].
        signed: AuthContent,
        /// The value the signed reference points to.
        content: C,
    },
    /// A member's prepare vote: a signed `(view, reference)`.
    Prepare {
        /// Signed [`RoundContent`].
        signed: AuthContent,
    },
    /// A member's commit vote: a signed `(view, reference)`.
    Commit {
        /// Signed [`RoundContent`].
        signed: AuthContent,
    },
    /// A vote to move to the next view: a signed [`ViewChangeContent`].
    ViewChange {
        /// Signed [`ViewChangeContent`].
        signed: AuthContent,
    },
}

/// The payload signed inside pre-prepare, prepare and commit messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundContent {
    /// The view the vote belongs to.
    pub view: u32,
    /// The reference of the value being agreed on.
    pub msg_ref: MessageRef,
}

/// The payload signed inside view-change messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeContent {
    /// The view the sender wants to move to.
    pub view: u32,
}
