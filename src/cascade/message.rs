use serde_derive::{Deserialize, Serialize};

use crate::cac::{CacContribution, CacMessage};
use crate::full_consensus::FcMessage;
use crate::group_state::{
    AuthContent, GroupMessage, GroupState, LeafIndex, MessageRef, MESSAGE_REF_LABEL,
};
use crate::restrained_consensus::RcMessage;

/// A cascade message, dispatched to one of the four sub-protocols.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CascadeMessage {
    /// First CAC instance, over commits.
    Cac(CacMessage<GroupMessage>),
    /// Restrained consensus among conflicting senders.
    Rc(RcMessage),
    /// Second CAC instance, over conflict outcomes.
    Cac2(CacMessage<Cac2Content>),
    /// Full-consensus fallback.
    Consensus(FcMessage<Cac2Content>),
}

/// The value fed into the second CAC instance and, if needed, the full
/// consensus: a set of conflicting commit references together with the
/// signatures justifying it.
///
/// Both lists are canonically sorted on construction, so that members
/// reaching the same decision produce byte-identical — and therefore
/// hash-identical — contents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cac2Content {
    /// The references of the conflicting commits, in reference order.
    pub conflicting: Vec<MessageRef>,
    /// Supporting signatures (power-set signatures or CAC proofs, then any
    /// retractions), each list in canonical auth-content order.
    pub signatures: Vec<AuthContent>,
}

impl Cac2Content {
    /// Builds a canonically ordered content from an outcome's parts.
    pub fn new(
        refs: Vec<MessageRef>,
        sigs: Vec<AuthContent>,
        retractions: Vec<AuthContent>,
    ) -> Self {
        let mut conflicting = refs;
        conflicting.sort();
        conflicting.dedup();
        let mut signatures = sigs;
        signatures.sort();
        let mut retractions = retractions;
        retractions.sort();
        signatures.extend(retractions);
        Cac2Content {
            conflicting,
            signatures,
        }
    }
}

impl<S: GroupState> CacContribution<S> for Cac2Content {
    const REF_LABEL: &'static str = "dds 1.0 cac2 content";

    /// The choice among CAC2 candidates is semantically arbitrary: any
    /// lingering disagreement is resolved by the full consensus.
    fn choose<'a, I>(_state: &S, candidates: I) -> Option<&'a Self>
    where
        I: IntoIterator<Item = &'a Self>,
    {
        candidates.into_iter().next()
    }
}

impl<S: GroupState> CacContribution<S> for GroupMessage {
    const REF_LABEL: &'static str = MESSAGE_REF_LABEL;

    /// Prefers the commit carrying the most proposals, tie-breaking on the
    /// smaller sender leaf index.
    fn choose<'a, I>(state: &S, candidates: I) -> Option<&'a Self>
    where
        I: IntoIterator<Item = &'a Self>,
    {
        let key = |commit: &GroupMessage| {
            let sender = state
                .commit_sender(commit)
                .unwrap_or(LeafIndex(u32::max_value()));
            (state.commit_proposal_count(commit), sender)
        };
        let mut best: Option<(&Self, (usize, LeafIndex))> = None;
        for candidate in candidates {
            let candidate_key = key(candidate);
            best = match best {
                Some((_, best_key))
                    if candidate_key.0 > best_key.0
                        || (candidate_key.0 == best_key.0 && candidate_key.1 < best_key.1) =>
                {
                    Some((candidate, candidate_key))
                }
                None => Some((candidate, candidate_key)),
                other => other,
            };
        }
        best.map(|(commit, _)| commit)
    }
}

#[cfg(test)]
mod tests {
    use super::Cac2Content;
    use crate::cac::contribution_ref;
    use crate::group_state::basic::BasicGroupState;
    use crate::group_state::{GroupState, MemberId};

    #[test]
    fn permuted_inputs_hash_identically() {
        let state = BasicGroupState::create(b"grp".to_vec(), MemberId::from_name("alice"));
        let r1 = state.msg_ref("t", b"one");
        let r2 = state.msg_ref("t", b"two");
        let s1 = state.sign(b"sig-one");
        let s2 = state.sign(b"sig-two");
        let retract = state.sign(b"RETRACT");

        let a = Cac2Content::new(
            vec![r1, r2],
            vec![s1.clone(), s2.clone()],
            vec![retract.clone()],
        );
        let b = Cac2Content::new(vec![r2, r1], vec![s2, s1], vec![retract]);
        assert_eq!(a, b);
        assert_eq!(
            contribution_ref(&state, &a),
            contribution_ref(&state, &b)
        );
    }
}
