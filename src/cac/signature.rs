use std::cmp::Ordering;
use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::group_state::{AuthContent, GroupState, LeafIndex, MessageRef};

/// Reference label for authenticated contents.
pub const AUTH_REF_LABEL: &str = "dds 1.0 auth content";

/// The two quorum-building roles of a CAC signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SigRole {
    /// The signer vouches that the referenced message is a valid candidate.
    Witness,
    /// The signer vouches that a witness quorum exists for the reference.
    Ready,
}

/// The structured payload carried inside a CAC signature's auth content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct SigData {
    sequence: u32,
    role: SigRole,
    msg_ref: MessageRef,
}

/// A verified CAC signature: the decoded `(sequence, role, reference)`
/// statement together with the authenticated content that carries it.
///
/// Instances only exist for contents that verified against the group state,
/// either because we signed them ourselves or because
/// [`CacSignature::verify`] accepted them.
#[derive(Clone, Eq)]
pub struct CacSignature {
    /// The signer's per-epoch sequence number.
    pub sequence: u32,
    /// Whether this is a witness or a ready signature.
    pub role: SigRole,
    /// The message reference the statement is about.
    pub msg_ref: MessageRef,
    /// The signed content, as it travels on the wire.
    pub auth: AuthContent,
    /// The auth content's own reference, used as identity.
    pub auth_ref: MessageRef,
}

impl CacSignature {
    /// Signs a new `(sequence, role, msg_ref)` statement.
    pub fn sign<S: GroupState>(
        state: &S,
        sequence: u32,
        role: SigRole,
        msg_ref: MessageRef,
    ) -> Self {
        let data = SigData {
            sequence,
            role,
            msg_ref,
        };
        let payload = bincode::serialize(&data).expect("failed to serialize signature data");
        let auth = state.sign(&payload);
        let auth_ref = auth_content_ref(state, &auth);
        CacSignature {
            sequence,
            role,
            msg_ref,
            auth,
            auth_ref,
        }
    }

    /// Verifies an authenticated content and decodes it into a CAC
    /// signature. Returns `None` on an invalid signature, wrong epoch,
    /// unknown sender or undecodable statement.
    pub fn verify<S: GroupState>(state: &S, auth: &AuthContent) -> Option<Self> {
        if !state.verify(auth) {
            return None;
        }
        let data: SigData = bincode::deserialize(&auth.payload).ok()?;
        Some(CacSignature {
            sequence: data.sequence,
            role: data.role,
            msg_ref: data.msg_ref,
            auth: auth.clone(),
            auth_ref: auth_content_ref(state, auth),
        })
    }

    /// The leaf index of the signer.
    pub fn sender(&self) -> LeafIndex {
        self.auth.sender
    }

    /// Returns `true` for a witness signature.
    pub fn is_witness(&self) -> bool {
        self.role == SigRole::Witness
    }

    /// Returns `true` for a ready signature.
    pub fn is_ready(&self) -> bool {
        self.role == SigRole::Ready
    }
}

/// The content-addressed reference of an authenticated content.
pub fn auth_content_ref<S: GroupState>(state: &S, auth: &AuthContent) -> MessageRef {
    let encoded = bincode::serialize(auth).expect("failed to serialize auth content");
    state.msg_ref(AUTH_REF_LABEL, &encoded)
}

// Identity, ordering and equality all follow the auth content reference.
impl PartialEq for CacSignature {
    fn eq(&self, other: &Self) -> bool {
        self.auth_ref == other.auth_ref
    }
}

impl Ord for CacSignature {
    fn cmp(&self, other: &Self) -> Ordering {
        self.auth_ref.cmp(&other.auth_ref)
    }
}

impl PartialOrd for CacSignature {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for CacSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(s:{},seq:{},{:?},{:?})",
            self.sender().0,
            self.sequence,
            self.role,
            self.msg_ref
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group_state::basic::BasicGroupState;
    use crate::group_state::MemberId;

    #[test]
    fn sign_verify_round_trip() {
        let state = BasicGroupState::create(b"grp".to_vec(), MemberId::from_name("alice"));
        let msg_ref = state.msg_ref("test", b"payload");
        let sig = CacSignature::sign(&state, 3, SigRole::Witness, msg_ref);

        let verified = CacSignature::verify(&state, &sig.auth).expect("verifies");
        assert_eq!(verified, sig);
        assert_eq!(verified.sequence, 3);
        assert!(verified.is_witness());
        assert_eq!(verified.msg_ref, msg_ref);
        assert_eq!(verified.sender(), state.our_index());
    }

    #[test]
    fn tampered_contents_do_not_verify() {
        let state = BasicGroupState::create(b"grp".to_vec(), MemberId::from_name("alice"));
        let msg_ref = state.msg_ref("test", b"payload");
        let sig = CacSignature::sign(&state, 0, SigRole::Ready, msg_ref);

        let mut wrong_epoch = sig.auth.clone();
        wrong_epoch.epoch += 1;
        assert!(CacSignature::verify(&state, &wrong_epoch).is_none());

        let mut wrong_payload = sig.auth.clone();
        wrong_payload.payload[0] ^= 1;
        assert!(CacSignature::verify(&state, &wrong_payload).is_none());
    }
}
