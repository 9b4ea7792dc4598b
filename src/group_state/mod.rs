//! The opaque group-state facade.
//!
//! The delivery service and the consensus stack never look inside the CGKA:
//! they consume it exclusively through the [`GroupState`] trait — epoch and
//! membership bookkeeping, signing and verification of authenticated
//! contents, content-addressed references, and validation of the three
//! content types (proposal, commit, application). A real deployment
//! implements the trait on top of an MLS-like state; the [`basic`] module
//! provides a deterministic, non-cryptographic implementation for tests,
//! simulation and the demo client.

pub mod basic;

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use failure::Fail;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::Deserialize;

use crate::fmt::HexBytes;
use crate::NodeIdT;

pub use self::basic::BasicGroupState;

/// The group epoch: advanced exactly when a commit is delivered.
pub type Epoch = u64;

/// Reference label for group messages (proposals, commits, application
/// messages).
pub const MESSAGE_REF_LABEL: &str = "dds 1.0 message";

/// The position of a member in the current group. Stable within an epoch
/// only.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LeafIndex(pub u32);

impl fmt::Display for LeafIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An opaque member identifier: globally unique and stable across epochs.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub Vec<u8>);

impl MemberId {
    /// Creates a member identifier from a human-readable name.
    pub fn from_name(name: &str) -> Self {
        MemberId(name.as_bytes().to_vec())
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(name) if name.chars().all(|c| c.is_ascii_graphic()) => write!(f, "{}", name),
            _ => write!(f, "{:?}", HexBytes(&self.0)),
        }
    }
}

/// A content-addressed message reference: the cipher suite's labelled hash
/// over the canonical encoding. Equality is byte equality.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageRef(pub [u8; 32]);

impl AsRef<[u8]> for MessageRef {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageRef({:?})", HexBytes(&self.0))
    }
}

/// A reference to a proposal, as listed by a commit.
pub type ProposalRef = MessageRef;

/// A signed triple of sender, epoch and payload, verifiable through the
/// group state.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthContent {
    /// The leaf index of the signing member.
    pub sender: LeafIndex,
    /// The epoch the content was signed in.
    pub epoch: Epoch,
    /// The signed payload.
    pub payload: Vec<u8>,
    /// The signature over `(sender, epoch, payload)`.
    pub signature: Vec<u8>,
}

// The canonical order sorts by payload bytes first, so that signature lists
// inside content-addressed values hash identically on every member.
impl Ord for AuthContent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.payload
            .cmp(&other.payload)
            .then_with(|| self.sender.cmp(&other.sender))
            .then_with(|| self.epoch.cmp(&other.epoch))
            .then_with(|| self.signature.cmp(&other.signature))
    }
}

impl PartialOrd for AuthContent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for AuthContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AuthContent {{ sender: {}, epoch: {}, payload: {:?} }}",
            self.sender,
            self.epoch,
            HexBytes(&self.payload)
        )
    }
}

/// An opaque group message: a proposal, commit or application message. The
/// delivery service reads only the epoch; everything else is interpreted by
/// the group state.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupMessage {
    /// The epoch the message belongs to.
    pub epoch: Epoch,
    /// The protected body, opaque to the delivery service.
    pub body: Vec<u8>,
}

impl fmt::Debug for GroupMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GroupMessage {{ epoch: {}, body: {:?} }}",
            self.epoch,
            HexBytes(&self.body)
        )
    }
}

/// An opaque welcome blob allowing an added member to join the group.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome(pub Vec<u8>);

impl fmt::Debug for Welcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Welcome({:?})", HexBytes(&self.0))
    }
}

/// A group-state error.
#[derive(Clone, Debug, Fail, PartialEq)]
pub enum Error {
    /// The commit does not apply to the current group state.
    #[fail(display = "The commit is not valid in the current epoch")]
    InvalidCommit,
    /// The welcome blob could not be decoded or does not include us.
    #[fail(display = "The welcome blob is not addressed to this member")]
    InvalidWelcome,
}

/// The interface through which the delivery service and the consensus stack
/// consume the CGKA.
pub trait GroupState: fmt::Debug + Send + Sync + Sized {
    /// The member identifier type.
    type NodeId: NodeIdT + Serialize + DeserializeOwned;

    /// The current epoch.
    fn epoch(&self) -> Epoch;

    /// Our own member identifier.
    fn our_id(&self) -> &Self::NodeId;

    /// Our own leaf index in the current epoch.
    fn our_index(&self) -> LeafIndex;

    /// The identifiers of all current members, optionally excluding our own.
    fn members(&self, exclude_self: bool) -> Vec<Self::NodeId>;

    /// The leaf indices of all current members.
    fn member_indices(&self) -> Vec<LeafIndex>;

    /// Maps a leaf index to the member's identifier.
    fn member_id(&self, index: LeafIndex) -> Option<Self::NodeId>;

    /// Signs a payload as an application-type authenticated content.
    fn sign(&self, payload: &[u8]) -> AuthContent;

    /// Verifies an authenticated content against the current epoch's
    /// membership. Wrong-epoch and unknown-sender contents are rejected.
    fn verify(&self, auth: &AuthContent) -> bool;

    /// The cipher suite's labelled hash, used for content addressing.
    fn msg_ref(&self, label: &str, data: &[u8]) -> MessageRef;

    /// Checks that `msg` is a valid proposal for the current epoch and
    /// returns its reference.
    fn validate_proposal(&self, msg: &GroupMessage) -> Option<ProposalRef>;

    /// Checks that `msg` is a valid commit for the current epoch and returns
    /// the references of the proposals it commits.
    fn validate_commit(&self, msg: &GroupMessage) -> Option<BTreeSet<ProposalRef>>;

    /// Checks that `msg` is a valid application message for the current
    /// epoch and returns its plaintext.
    fn validate_application(&self, msg: &GroupMessage) -> Option<Vec<u8>>;

    /// The leaf index of the member that created the commit.
    fn commit_sender(&self, commit: &GroupMessage) -> Option<LeafIndex>;

    /// The leaf index of the member that created the proposal.
    fn proposal_sender(&self, proposal: &GroupMessage) -> Option<LeafIndex>;

    /// The number of proposals the commit carries.
    fn commit_proposal_count(&self, commit: &GroupMessage) -> usize;

    /// The identifiers added and removed by the commit.
    fn commit_membership_delta(
        &self,
        commit: &GroupMessage,
    ) -> (Vec<Self::NodeId>, Vec<Self::NodeId>);

    /// Wraps a plaintext in an application-protected group message for the
    /// current epoch, so that only current members accept it and replay
    /// across epochs fails validation.
    fn protect(&self, plaintext: &[u8]) -> GroupMessage;

    /// Applies a valid commit, producing the state of the next epoch.
    fn apply_commit(&self, commit: &GroupMessage) -> Result<Self, Error>;
}

/// The content-addressed reference of a group message.
pub fn message_ref<S: GroupState>(state: &S, msg: &GroupMessage) -> MessageRef {
    let encoded = bincode::serialize(msg).expect("failed to serialize group message");
    state.msg_ref(MESSAGE_REF_LABEL, &encoded)
}
