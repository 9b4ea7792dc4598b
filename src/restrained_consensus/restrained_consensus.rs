use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, result};

use log::{debug, warn};

use super::{ConflictSet, FaultKind, ParticipateContent, RcMessage};
use crate::cac::CacSignature;
use crate::fault_log::Fault;
use crate::group_state::{AuthContent, GroupState, LeafIndex, MessageRef};
use crate::{Target, TimerCmd};

/// A `RestrainedConsensus` step.
pub type Step<S> = crate::Step<RcMessage, Output, <S as GroupState>::NodeId, FaultKind, Timer>;

/// The timers a `RestrainedConsensus` instance arms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timer {
    /// Convergence deadline: fires ⊥ after two round trips.
    Abort,
    /// Deferred initial broadcast, armed only under `TEST_RC_DELAY`.
    Participate,
}

/// The outcomes of a `RestrainedConsensus` instance.
#[derive(Clone, Debug, PartialEq)]
pub enum Output {
    /// The uniquely largest surviving power-set element was fully signed.
    Decide {
        /// The references of the agreed element, in conflict-set order.
        refs: Vec<MessageRef>,
        /// One signature per member of the element.
        sigs: Vec<AuthContent>,
        /// Every retraction observed.
        retractions: Vec<AuthContent>,
    },
    /// ⊥: the instance cannot converge; fall through to the next cascade
    /// stage.
    Abort,
}

/// All non-empty subsets of `input`, each preserving the input's order.
pub fn power_set<T: Clone>(input: &[T]) -> Vec<Vec<T>> {
    let mut subsets: Vec<Vec<T>> = vec![Vec::new()];
    for item in input {
        let count = subsets.len();
        for idx in 0..count {
            let mut subset = subsets[idx].clone();
            subset.push(item.clone());
            subsets.push(subset);
        }
    }
    subsets.retain(|subset| !subset.is_empty());
    subsets
}

/// Restrained consensus instance. One instance serves one epoch.
pub struct RestrainedConsensus<S: GroupState> {
    /// Shared group state.
    state: Arc<S>,
    /// The network round-trip estimate; the abort deadline is twice this.
    rtt: Duration,
    /// Test knob: delay the initial participate broadcast.
    participate_delay: Option<Duration>,
    /// Whether we retracted: a retracting instance never decides.
    retracted_self: bool,
    /// Whether we proposed (participated).
    proposed: bool,
    /// Whether the instance reached a terminal state.
    finished: bool,
    /// The surviving power-set elements.
    power_set: Vec<ConflictSet>,
    /// Collected signatures per element.
    signed: BTreeMap<BTreeSet<(LeafIndex, MessageRef)>, BTreeMap<LeafIndex, AuthContent>>,
    /// Observed retractions, in arrival order.
    retractions: Vec<AuthContent>,
    /// The deferred participate broadcast, present only under
    /// `TEST_RC_DELAY` between `propose` and the `Participate` timer.
    pending_participate: Option<(BTreeSet<S::NodeId>, RcMessage)>,
}

impl<S: GroupState> RestrainedConsensus<S> {
    /// Creates a new instance for the state's current epoch.
    pub fn new(state: Arc<S>, rtt: Duration, participate_delay: Option<Duration>) -> Self {
        RestrainedConsensus {
            state,
            rtt,
            participate_delay,
            retracted_self: false,
            proposed: false,
            finished: false,
            power_set: Vec::new(),
            signed: BTreeMap::new(),
            retractions: Vec::new(),
            pending_participate: None,
        }
    }

    /// Returns `true` once the instance decided or aborted.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Starts participating: signs every power-set element containing us,
    /// broadcasts the participate message to the other participants and arms
    /// the abort deadline.
    pub fn propose(&mut self, conflict_set: ConflictSet, proofs: &[CacSignature]) -> Step<S> {
        if self.retracted_self || self.proposed {
            return Step::<S>::default();
        }
        self.proposed = true;

        let mut step = Step::<S>::default();
        self.power_set = power_set(&conflict_set);

        let our_index = self.state.our_index();
        let mut sig_set = Vec::new();
        for element in &self.power_set {
            if element.iter().any(|(index, _)| *index == our_index) {
                let encoded =
                    bincode::serialize(element).expect("failed to serialize power-set element");
                let sig = self.state.sign(&encoded);
                sig_set.push(sig.clone());
                self.signed
                    .entry(element.iter().cloned().collect())
                    .or_default()
                    .insert(our_index, sig);
            }
        }

        // Retractions that arrived before we proposed prune immediately.
        let buffered: Vec<LeafIndex> = self.retractions.iter().map(|auth| auth.sender).collect();
        for retracted in buffered {
            self.prune_retracted(retracted);
        }

        let content = ParticipateContent {
            sig_set,
            power_set: self.power_set.clone(),
            proofs: proofs.iter().map(|sig| sig.auth.clone()).collect(),
        };
        let recipients = self.participants(conflict_set.iter().map(|(index, _)| *index));
        let message = RcMessage::Participate(content);
        match self.participate_delay {
            Some(delay) => {
                self.pending_participate = Some((recipients, message));
                step.timers.push(TimerCmd::Schedule(Timer::Participate, delay));
            }
            None => {
                step.messages.push(Target::Nodes(recipients).message(message));
            }
        }
        step.timers
            .push(TimerCmd::Schedule(Timer::Abort, 2 * self.rtt));

        self.check_completion(&mut step);
        step
    }

    /// Handles a message received from `sender_id`.
    pub fn handle_message(&mut self, sender_id: &S::NodeId, message: RcMessage) -> Step<S> {
        if self.finished {
            return Step::<S>::default();
        }
        match message {
            RcMessage::Participate(content) => self.handle_participate(sender_id, content),
            RcMessage::Retract(auth) => self.handle_retract(sender_id, auth),
        }
    }

    /// Handles the expiration of one of our timers.
    pub fn handle_timer(&mut self, timer: Timer) -> Step<S> {
        match timer {
            Timer::Abort => {
                let mut step = Step::<S>::default();
                self.abort(&mut step);
                step
            }
            Timer::Participate => {
                let mut step = Step::<S>::default();
                if let Some((recipients, message)) = self.pending_participate.take() {
                    if !self.finished {
                        step.messages.push(Target::Nodes(recipients).message(message));
                    }
                }
                step
            }
        }
    }

    fn handle_participate(
        &mut self,
        sender_id: &S::NodeId,
        content: ParticipateContent,
    ) -> Step<S> {
        let mut step = Step::<S>::default();

        // Every proof must be a valid CAC signature.
        let mut proofs = Vec::new();
        for auth in &content.proofs {
            match CacSignature::verify(&*self.state, auth) {
                Some(sig) => proofs.push(sig),
                None => {
                    step.fault_log
                        .append(sender_id.clone(), FaultKind::InvalidProof);
                    self.abort(&mut step);
                    return step;
                }
            }
        }

        // The proofs must leave no sequence gap for any sender.
        let mut sequences: BTreeMap<LeafIndex, BTreeSet<u32>> = BTreeMap::new();
        for sig in &proofs {
            sequences.entry(sig.sender()).or_default().insert(sig.sequence);
        }
        for seqs in sequences.values() {
            let highest = *seqs.iter().next_back().expect("sequence set is non-empty");
            if highest as usize > seqs.len() - 1 {
                step.fault_log
                    .append(sender_id.clone(), FaultKind::ProofSequenceGap);
                self.abort(&mut step);
                return step;
            }
        }

        // The signature set must be non-empty and entirely from one member.
        let rc_sender = match content.sig_set.first() {
            Some(first) if self.state.member_id(first.sender).is_some() => first.sender,
            _ => {
                step.fault_log
                    .append(sender_id.clone(), FaultKind::InvalidSigSet);
                self.abort(&mut step);
                return step;
            }
        };
        let mut signed_set: BTreeMap<BTreeSet<(LeafIndex, MessageRef)>, AuthContent> =
            BTreeMap::new();
        for auth in &content.sig_set {
            let element: ConflictSet = match bincode::deserialize(&auth.payload) {
                Ok(element) => element,
                Err(_) => {
                    step.fault_log
                        .append(sender_id.clone(), FaultKind::InvalidSigSet);
                    self.abort(&mut step);
                    return step;
                }
            };
            if !self.state.verify(auth) || auth.sender != rc_sender {
                step.fault_log
                    .append(sender_id.clone(), FaultKind::InvalidSigSet);
                self.abort(&mut step);
                return step;
            }
            signed_set.insert(element.into_iter().collect(), auth.clone());
        }

        if self.proposed {
            for (element, sig) in signed_set {
                self.signed.entry(element).or_default().insert(rc_sender, sig);
            }
            self.check_completion(&mut step);
        } else {
            // We did not propose: abstain so the actual participants can
            // settle among themselves. The abort deadline is deliberately
            // not re-armed here.
            debug!("{:?} RC retracting", self.state.our_id());
            self.retracted_self = true;
            let retract = self.state.sign(b"RETRACT");
            let recipients = self.participants(
                content
                    .power_set
                    .iter()
                    .filter(|element| element.len() == 1)
                    .map(|element| element[0].0),
            );
            step.messages
                .push(Target::Nodes(recipients).message(RcMessage::Retract(retract)));
        }
        step
    }

    fn handle_retract(&mut self, sender_id: &S::NodeId, auth: AuthContent) -> Step<S> {
        let mut step = Step::<S>::default();
        if self.state.member_id(auth.sender).is_none()
            || auth.epoch != self.state.epoch()
            || !self.state.verify(&auth)
        {
            return Fault::new(sender_id.clone(), FaultKind::InvalidRetract).into();
        }
        if self.retractions.iter().any(|r| r.sender == auth.sender) {
            return step;
        }
        let retracted = auth.sender;
        self.retractions.push(auth);
        self.prune_retracted(retracted);
        self.check_completion(&mut step);
        step
    }

    /// Removes every power-set element containing the retracted member.
    fn prune_retracted(&mut self, retracted: LeafIndex) {
        self.power_set
            .retain(|element| !element.iter().any(|(index, _)| *index == retracted));
    }

    /// Decides if a uniquely largest element is fully signed; aborts if no
    /// unique largest element exists.
    fn check_completion(&mut self, step: &mut Step<S>) {
        if self.power_set.is_empty() || self.finished {
            return;
        }
        let mut biggest = &self.power_set[0];
        let mut unique = true;
        for element in &self.power_set[1..] {
            if element.len() > biggest.len() {
                biggest = element;
                unique = true;
            } else if element.len() == biggest.len() {
                unique = false;
            }
        }
        if !unique {
            self.abort(step);
            return;
        }

        let key: BTreeSet<(LeafIndex, MessageRef)> = biggest.iter().cloned().collect();
        let sigs = match self.signed.get(&key) {
            Some(sigs) if sigs.len() == biggest.len() => sigs,
            _ => return,
        };
        self.finished = true;
        debug!(
            "{:?} RC deciding on {} commits",
            self.state.our_id(),
            biggest.len()
        );
        let output = Output::Decide {
            refs: biggest.iter().map(|(_, mref)| *mref).collect(),
            sigs: sigs.values().cloned().collect(),
            retractions: self.retractions.clone(),
        };
        step.output.push(output);
        step.timers.push(TimerCmd::Cancel(Timer::Abort));
        step.timers.push(TimerCmd::Cancel(Timer::Participate));
    }

    /// ⊥: gives up on this instance.
    fn abort(&mut self, step: &mut Step<S>) {
        if self.finished {
            return;
        }
        self.finished = true;
        step.output.push(Output::Abort);
        step.timers.push(TimerCmd::Cancel(Timer::Abort));
        step.timers.push(TimerCmd::Cancel(Timer::Participate));
    }

    /// Maps participant leaf indices to identifiers, excluding ourselves.
    fn participants<I: IntoIterator<Item = LeafIndex>>(&self, indices: I) -> BTreeSet<S::NodeId> {
        let mut recipients = BTreeSet::new();
        for index in indices {
            match self.state.member_id(index) {
                Some(id) => {
                    if id != *self.state.our_id() {
                        recipients.insert(id);
                    }
                }
                None => warn!(
                    "{:?} RC participant {} has no identifier",
                    self.state.our_id(),
                    index
                ),
            }
        }
        recipients
    }
}

impl<S: GroupState> fmt::Debug for RestrainedConsensus<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> result::Result<(), fmt::Error> {
        f.debug_struct("RestrainedConsensus")
            .field("our_id", self.state.our_id())
            .field("proposed", &self.proposed)
            .field("retracted", &self.retracted_self)
            .field("finished", &self.finished)
            .field("elements", &self.power_set.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::RcMessage;
    use super::{power_set, Output, RestrainedConsensus, Timer};
    use crate::cac::{CacSignature, SigRole};
    use crate::group_state::basic::{BasicGroupState, BasicOp};
    use crate::group_state::{GroupState, LeafIndex, MemberId};

    fn states(names: &[&str]) -> Vec<Arc<BasicGroupState>> {
        let creator = BasicGroupState::create(b"grp".to_vec(), MemberId::from_name(names[0]));
        let proposals = names[1..]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let msg = creator.propose(BasicOp::Add(MemberId::from_name(name)), i as u64);
                creator.decode_proposal(&msg).expect("decode proposal")
            })
            .collect();
        let commit = creator.make_commit(proposals);
        let creator = creator.apply_commit(&commit).expect("apply");
        let welcome = creator.welcome();
        names
            .iter()
            .map(|name| {
                let id = MemberId::from_name(name);
                if id == *creator.our_id() {
                    Arc::new(creator.clone())
                } else {
                    Arc::new(BasicGroupState::join(id, &welcome).expect("join"))
                }
            })
            .collect()
    }

    fn proofs_for(state: &BasicGroupState, refs: &[crate::group_state::MessageRef]) -> Vec<CacSignature> {
        refs.iter()
            .enumerate()
            .map(|(seq, mref)| CacSignature::sign(state, seq as u32, SigRole::Witness, *mref))
            .collect()
    }

    #[test]
    fn power_set_contains_all_non_empty_subsets() {
        let subsets = power_set(&[1, 2, 3]);
        assert_eq!(subsets.len(), 7);
        assert!(subsets.contains(&vec![1, 2, 3]));
        assert!(subsets.contains(&vec![2]));
        assert!(!subsets.contains(&Vec::new()));
    }

    #[test]
    fn two_participants_decide_on_the_pair() {
        let states = states(&["a", "b", "c", "d"]);
        let ra = states[0].msg_ref("t", b"commit-a");
        let rb = states[1].msg_ref("t", b"commit-b");
        let conflict = vec![(LeafIndex(0), ra), (LeafIndex(1), rb)];

        let mut alice = RestrainedConsensus::new(states[0].clone(), Duration::from_millis(10), None);
        let mut bob = RestrainedConsensus::new(states[1].clone(), Duration::from_millis(10), None);

        let step_a = alice.propose(conflict.clone(), &proofs_for(&states[0], &[ra, rb]));
        let step_b = bob.propose(conflict.clone(), &proofs_for(&states[1], &[ra, rb]));
        assert!(step_a.output.is_empty());
        assert!(step_b.output.is_empty());

        let msg_a = step_a.messages[0].message.clone();
        let msg_b = step_b.messages[0].message.clone();

        let step = alice.handle_message(states[1].our_id(), msg_b);
        let decided_a = step.output;
        let step = bob.handle_message(states[0].our_id(), msg_a);
        let decided_b = step.output;

        for decided in &[&decided_a, &decided_b] {
            match decided.as_slice() {
                [Output::Decide { refs, sigs, retractions }] => {
                    assert_eq!(refs, &vec![ra, rb]);
                    assert_eq!(sigs.len(), 2);
                    assert!(retractions.is_empty());
                }
                other => panic!("expected a decision, got {:?}", other),
            }
        }
    }

    #[test]
    fn non_proposer_retracts_and_the_singleton_wins() {
        let states = states(&["a", "b", "c", "d"]);
        let ra = states[0].msg_ref("t", b"commit-a");
        let rb = states[1].msg_ref("t", b"commit-b");
        let conflict = vec![(LeafIndex(0), ra), (LeafIndex(1), rb)];

        let mut alice = RestrainedConsensus::new(states[0].clone(), Duration::from_millis(10), None);
        let mut bob = RestrainedConsensus::new(states[1].clone(), Duration::from_millis(10), None);

        // Only Alice proposes; Bob sees her participate message first.
        let step_a = alice.propose(conflict.clone(), &proofs_for(&states[0], &[ra, rb]));
        let msg_a = step_a.messages[0].message.clone();

        let step = bob.handle_message(states[0].our_id(), msg_a);
        let retract = match &step.messages[0].message {
            msg @ RcMessage::Retract(_) => msg.clone(),
            other => panic!("expected a retract, got {:?}", other),
        };

        let step = alice.handle_message(states[1].our_id(), retract);
        match step.output.as_slice() {
            [Output::Decide { refs, retractions, .. }] => {
                assert_eq!(refs, &vec![ra]);
                assert_eq!(retractions.len(), 1);
            }
            other => panic!("expected a decision, got {:?}", other),
        }
    }

    #[test]
    fn abort_timer_yields_bottom_once() {
        let states = states(&["a", "b", "c"]);
        let ra = states[0].msg_ref("t", b"commit-a");
        let rb = states[1].msg_ref("t", b"commit-b");
        let conflict = vec![(LeafIndex(0), ra), (LeafIndex(1), rb)];

        let mut alice = RestrainedConsensus::new(states[0].clone(), Duration::from_millis(10), None);
        let _ = alice.propose(conflict, &proofs_for(&states[0], &[ra, rb]));

        let step = alice.handle_timer(Timer::Abort);
        assert_eq!(step.output, vec![Output::Abort]);
        let step = alice.handle_timer(Timer::Abort);
        assert!(step.output.is_empty());
    }

    #[test]
    fn invalid_proofs_abort_the_instance() {
        let states = states(&["a", "b", "c"]);
        let ra = states[0].msg_ref("t", b"commit-a");
        let rb = states[1].msg_ref("t", b"commit-b");
        let conflict = vec![(LeafIndex(0), ra), (LeafIndex(1), rb)];

        let mut alice = RestrainedConsensus::new(states[0].clone(), Duration::from_millis(10), None);
        let mut bob = RestrainedConsensus::new(states[1].clone(), Duration::from_millis(10), None);
        let _ = alice.propose(conflict.clone(), &proofs_for(&states[0], &[ra, rb]));

        // Bob sends a participate message whose proofs skip sequence 0.
        let bad_proofs = vec![CacSignature::sign(&*states[1], 5, SigRole::Witness, rb)];
        let step_b = bob.propose(conflict, &bad_proofs);
        let msg_b = step_b.messages[0].message.clone();

        let step = alice.handle_message(states[1].our_id(), msg_b);
        assert_eq!(step.output, vec![Output::Abort]);
        assert_eq!(step.fault_log.0.len(), 1);
    }
}
