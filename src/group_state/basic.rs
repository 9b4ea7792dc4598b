//! A deterministic, non-cryptographic group state.
//!
//! `BasicGroupState` implements the [`GroupState`](super::GroupState) trait
//! with labelled SHA-256 digests in place of real signatures and protection:
//! every member (and any observer) can recompute them, so this provides **no
//! security whatsoever**. It exists to make the consensus stack testable and
//! runnable — deterministic signatures, trivial verification — and backs the
//! virtual-network tests and the demo client.
//!
//! The miniature CGKA it implements: proposals add, remove or update
//! members; commits inline the proposals they reference; applying a commit
//! advances the epoch and ratchets an epoch authenticator that all protected
//! payloads are bound to, so diverged states reject each other's traffic.

use std::collections::BTreeSet;

use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{
    AuthContent, Epoch, Error, GroupMessage, GroupState, LeafIndex, MemberId, MessageRef,
    ProposalRef, Welcome,
};

/// Reference label for proposals.
const PROPOSAL_REF_LABEL: &str = "dds 1.0 proposal";

/// A membership operation carried by a proposal.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BasicOp {
    /// Adds the member to the group.
    Add(MemberId),
    /// Removes the member from the group.
    Remove(MemberId),
    /// Refreshes the proposer's leaf.
    Update,
}

/// A proposal: one membership operation, unique per `(sender, nonce)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BasicProposal {
    /// The proposing member's leaf index.
    pub sender: LeafIndex,
    /// The proposed operation.
    pub op: BasicOp,
    /// Disambiguates otherwise identical proposals.
    pub nonce: u64,
}

/// A commit: the sender plus the full list of committed proposals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicCommit {
    /// The committing member's leaf index.
    pub sender: LeafIndex,
    /// The committed proposals, inlined.
    pub proposals: Vec<BasicProposal>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum BasicContent {
    Proposal(BasicProposal),
    Commit(BasicCommit),
    Application { sender: LeafIndex, data: Vec<u8> },
}

/// The decoded body of a `GroupMessage`: content plus an epoch-bound tag.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct BasicBody {
    content: BasicContent,
    tag: [u8; 32],
}

/// The group snapshot a welcome blob carries.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Snapshot {
    group_id: Vec<u8>,
    epoch: Epoch,
    members: Vec<MemberId>,
    epoch_auth: [u8; 32],
}

/// A deterministic group state without real cryptography.
#[derive(Clone, Debug)]
pub struct BasicGroupState {
    group_id: Vec<u8>,
    epoch: Epoch,
    /// Members in leaf order; a member's index is its position.
    members: Vec<MemberId>,
    /// Ratcheted on every commit; binds protected payloads to this state.
    epoch_auth: [u8; 32],
    our_id: MemberId,
    our_index: LeafIndex,
}

fn digest(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.input(&(part.len() as u64).to_be_bytes());
        hasher.input(part);
    }
    let mut out = [0; 32];
    out.copy_from_slice(&hasher.result());
    out
}

impl BasicGroupState {
    /// Creates a new group containing only ourselves.
    pub fn create(group_id: Vec<u8>, our_id: MemberId) -> Self {
        let epoch_auth = digest(&[b"dds basic group", &group_id]);
        BasicGroupState {
            group_id,
            epoch: 0,
            members: vec![our_id.clone()],
            epoch_auth,
            our_id,
            our_index: LeafIndex(0),
        }
    }

    /// Joins a group from a welcome blob.
    pub fn join(our_id: MemberId, welcome: &Welcome) -> Result<Self, Error> {
        let snapshot: Snapshot =
            bincode::deserialize(&welcome.0).map_err(|_| Error::InvalidWelcome)?;
        let our_index = snapshot
            .members
            .iter()
            .position(|id| *id == our_id)
            .map(|idx| LeafIndex(idx as u32))
            .ok_or(Error::InvalidWelcome)?;
        Ok(BasicGroupState {
            group_id: snapshot.group_id,
            epoch: snapshot.epoch,
            members: snapshot.members,
            epoch_auth: snapshot.epoch_auth,
            our_id,
            our_index,
        })
    }

    /// Produces the welcome blob for members added by a commit that leads to
    /// this state.
    pub fn welcome(&self) -> Welcome {
        let snapshot = Snapshot {
            group_id: self.group_id.clone(),
            epoch: self.epoch,
            members: self.members.clone(),
            epoch_auth: self.epoch_auth,
        };
        Welcome(bincode::serialize(&snapshot).expect("failed to serialize welcome"))
    }

    /// Creates a proposal message for the given operation.
    pub fn propose(&self, op: BasicOp, nonce: u64) -> GroupMessage {
        self.wrap(BasicContent::Proposal(BasicProposal {
            sender: self.our_index,
            op,
            nonce,
        }))
    }

    /// Creates a commit message over the given proposals.
    pub fn make_commit(&self, proposals: Vec<BasicProposal>) -> GroupMessage {
        self.wrap(BasicContent::Commit(BasicCommit {
            sender: self.our_index,
            proposals,
        }))
    }

    /// Decodes a valid proposal message into its content.
    pub fn decode_proposal(&self, msg: &GroupMessage) -> Option<BasicProposal> {
        match self.unwrap_content(msg)? {
            BasicContent::Proposal(proposal) => Some(proposal),
            _ => None,
        }
    }

    fn tag(&self, content: &BasicContent) -> [u8; 32] {
        let encoded = bincode::serialize(content).expect("failed to serialize content");
        digest(&[
            b"dds basic tag",
            &self.group_id,
            &self.epoch_auth,
            &self.epoch.to_be_bytes(),
            &encoded,
        ])
    }

    fn wrap(&self, content: BasicContent) -> GroupMessage {
        let tag = self.tag(&content);
        let body = BasicBody { content, tag };
        GroupMessage {
            epoch: self.epoch,
            body: bincode::serialize(&body).expect("failed to serialize body"),
        }
    }

    /// Decodes and authenticates a message against the current epoch.
    fn unwrap_content(&self, msg: &GroupMessage) -> Option<BasicContent> {
        if msg.epoch != self.epoch {
            return None;
        }
        let body: BasicBody = bincode::deserialize(&msg.body).ok()?;
        if body.tag != self.tag(&body.content) {
            return None;
        }
        let sender = match &body.content {
            BasicContent::Proposal(proposal) => proposal.sender,
            BasicContent::Commit(commit) => commit.sender,
            BasicContent::Application { sender, .. } => *sender,
        };
        if sender.0 as usize >= self.members.len() {
            return None;
        }
        Some(body.content)
    }

    fn proposal_ref(&self, proposal: &BasicProposal) -> ProposalRef {
        let encoded = bincode::serialize(proposal).expect("failed to serialize proposal");
        self.msg_ref(PROPOSAL_REF_LABEL, &encoded)
    }

    fn commit_of(&self, msg: &GroupMessage) -> Option<BasicCommit> {
        match self.unwrap_content(msg)? {
            BasicContent::Commit(commit) => Some(commit),
            _ => None,
        }
    }
}

impl GroupState for BasicGroupState {
    type NodeId = MemberId;

    fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn our_id(&self) -> &MemberId {
        &self.our_id
    }

    fn our_index(&self) -> LeafIndex {
        self.our_index
    }

    fn members(&self, exclude_self: bool) -> Vec<MemberId> {
        self.members
            .iter()
            .filter(|id| !exclude_self || **id != self.our_id)
            .cloned()
            .collect()
    }

    fn member_indices(&self) -> Vec<LeafIndex> {
        (0..self.members.len() as u32).map(LeafIndex).collect()
    }

    fn member_id(&self, index: LeafIndex) -> Option<MemberId> {
        self.members.get(index.0 as usize).cloned()
    }

    fn sign(&self, payload: &[u8]) -> AuthContent {
        let signature = digest(&[
            b"dds basic signature",
            &self.group_id,
            &self.epoch_auth,
            &self.epoch.to_be_bytes(),
            &self.our_index.0.to_be_bytes(),
            payload,
        ]);
        AuthContent {
            sender: self.our_index,
            epoch: self.epoch,
            payload: payload.to_vec(),
            signature: signature.to_vec(),
        }
    }

    fn verify(&self, auth: &AuthContent) -> bool {
        if auth.epoch != self.epoch || auth.sender.0 as usize >= self.members.len() {
            return false;
        }
        let expected = digest(&[
            b"dds basic signature",
            &self.group_id,
            &self.epoch_auth,
            &self.epoch.to_be_bytes(),
            &auth.sender.0.to_be_bytes(),
            &auth.payload,
        ]);
        auth.signature == expected
    }

    fn msg_ref(&self, label: &str, data: &[u8]) -> MessageRef {
        MessageRef(digest(&[b"dds basic ref", label.as_bytes(), data]))
    }

    fn validate_proposal(&self, msg: &GroupMessage) -> Option<ProposalRef> {
        match self.unwrap_content(msg)? {
            BasicContent::Proposal(proposal) => Some(self.proposal_ref(&proposal)),
            _ => None,
        }
    }

    fn validate_commit(&self, msg: &GroupMessage) -> Option<BTreeSet<ProposalRef>> {
        let commit = self.commit_of(msg)?;
        Some(
            commit
                .proposals
                .iter()
                .map(|proposal| self.proposal_ref(proposal))
                .collect(),
        )
    }

    fn validate_application(&self, msg: &GroupMessage) -> Option<Vec<u8>> {
        match self.unwrap_content(msg)? {
            BasicContent::Application { data, .. } => Some(data),
            _ => None,
        }
    }

    fn commit_sender(&self, commit: &GroupMessage) -> Option<LeafIndex> {
        Some(self.commit_of(commit)?.sender)
    }

    fn proposal_sender(&self, proposal: &GroupMessage) -> Option<LeafIndex> {
        match self.unwrap_content(proposal)? {
            BasicContent::Proposal(proposal) => Some(proposal.sender),
            _ => None,
        }
    }

    fn commit_proposal_count(&self, commit: &GroupMessage) -> usize {
        self.commit_of(commit)
            .map_or(0, |commit| commit.proposals.len())
    }

    fn commit_membership_delta(&self, commit: &GroupMessage) -> (Vec<MemberId>, Vec<MemberId>) {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        if let Some(commit) = self.commit_of(commit) {
            for proposal in &commit.proposals {
                match &proposal.op {
                    BasicOp::Add(id) => added.push(id.clone()),
                    BasicOp::Remove(id) => removed.push(id.clone()),
                    BasicOp::Update => {}
                }
            }
        }
        (added, removed)
    }

    fn protect(&self, plaintext: &[u8]) -> GroupMessage {
        self.wrap(BasicContent::Application {
            sender: self.our_index,
            data: plaintext.to_vec(),
        })
    }

    fn apply_commit(&self, commit: &GroupMessage) -> Result<Self, Error> {
        let content = self.commit_of(commit).ok_or(Error::InvalidCommit)?;

        let mut members = self.members.clone();
        for proposal in &content.proposals {
            match &proposal.op {
                BasicOp::Add(id) => {
                    if !members.contains(id) {
                        members.push(id.clone());
                    }
                }
                BasicOp::Remove(id) => members.retain(|member| member != id),
                BasicOp::Update => {}
            }
        }
        let our_index = members
            .iter()
            .position(|id| *id == self.our_id)
            .map(|idx| LeafIndex(idx as u32))
            // A commit removing us still yields a state, but only to report
            // the final batch; the client must stop using it afterwards.
            .unwrap_or(LeafIndex(u32::max_value()));

        let commit_ref = self.msg_ref(
            super::MESSAGE_REF_LABEL,
            &bincode::serialize(commit).expect("failed to serialize commit"),
        );
        let epoch_auth = digest(&[
            b"dds basic epoch",
            &self.epoch_auth,
            &commit_ref.0,
            &(self.epoch + 1).to_be_bytes(),
        ]);

        Ok(BasicGroupState {
            group_id: self.group_id.clone(),
            epoch: self.epoch + 1,
            members,
            epoch_auth,
            our_id: self.our_id.clone(),
            our_index,
        })
    }
}
