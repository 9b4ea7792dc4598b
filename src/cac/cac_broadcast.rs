use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::{fmt, result};

use log::{debug, warn};
use rand::Rng;

use super::{
    contribution_ref, CacContribution, CacMessage, CacSignature, Error, FaultKind, Result, SigRole,
};
use crate::group_state::{AuthContent, GroupState, LeafIndex, MessageRef};
use crate::quorum::QuorumParams;
use crate::{ConsensusProtocol, NoTimer, Target};

/// A `CacBroadcast` step.
pub type Step<C, S> =
    crate::Step<CacMessage<C>, Output<C>, <S as GroupState>::NodeId, FaultKind, NoTimer>;

/// The inputs a `CacBroadcast` accepts.
#[derive(Debug)]
pub enum Input<C> {
    /// Broadcast our own payload. Only allowed before any local signature.
    Broadcast(C),
    /// The upper layer asserts that the payload passes its domain checks.
    Validate(C),
}

/// The outputs of a `CacBroadcast`.
#[derive(Clone, Debug, PartialEq)]
pub enum Output<C> {
    /// A payload referenced by received signatures surfaced for the first
    /// time; the upper layer must examine it and eventually feed back
    /// `Input::Validate` if it passes the domain checks.
    Candidate(C),
    /// A payload reached the delivery condition.
    Deliver {
        /// The delivered payload.
        payload: C,
        /// All references that gathered at least `k` witnesses, in
        /// reference order.
        conflict: Vec<MessageRef>,
        /// Every valid signature collected, in auth-reference order.
        signatures: Vec<CacSignature>,
    },
}

/// Witness and ready signers of one referenced message.
#[derive(Clone, Debug, Default)]
struct SigTally {
    witness: BTreeSet<LeafIndex>,
    ready: BTreeSet<LeafIndex>,
}

/// CAC broadcast instance, parameterised by the payload type `C`.
///
/// One instance serves one epoch; the cascade creates fresh instances when
/// the epoch advances.
#[derive(Debug)]
pub struct CacBroadcast<C, S: GroupState> {
    /// Shared group state.
    state: Arc<S>,
    /// The quorum thresholds for this epoch's group size.
    quorum: QuorumParams,
    /// The local signature sequence counter.
    sig_count: u32,
    /// Whether we have multicast a `Ready` announcement.
    ready_sent: bool,
    /// FIFO serialisation of message handling: emitting a local
    /// announcement re-enters the receive path, so messages are queued and
    /// drained only at the outermost frame.
    queue: VecDeque<(Option<<S as GroupState>::NodeId>, CacMessage<C>)>,
    draining: bool,
    /// Payloads by reference.
    payloads: BTreeMap<MessageRef, C>,
    /// All valid signatures, keyed (and thus canonically ordered) by their
    /// auth content reference.
    signatures: BTreeMap<MessageRef, CacSignature>,
    /// References approved by the upper layer.
    validated: BTreeSet<MessageRef>,
    /// References already surfaced to the upper layer (or locally
    /// originated).
    surfaced: BTreeSet<MessageRef>,
    /// References witnessed by others, awaiting upper-layer validation.
    waiting: BTreeSet<MessageRef>,
    /// References already delivered.
    delivered: BTreeSet<MessageRef>,
    /// Per sender, the number of contiguously processed signatures; equal to
    /// the next acceptable sequence number.
    next_seq: BTreeMap<LeafIndex, u32>,
    /// Witness/ready signers per referenced message.
    tallies: BTreeMap<MessageRef, SigTally>,
}

impl<C, S> CacBroadcast<C, S>
where
    C: CacContribution<S>,
    S: GroupState,
{
    /// Creates a new broadcast instance for the state's current epoch.
    pub fn new(state: Arc<S>, k: usize) -> Self {
        let quorum = QuorumParams::new(state.members(false).len(), k);
        CacBroadcast {
            state,
            quorum,
            sig_count: 0,
            ready_sent: false,
            queue: VecDeque::new(),
            draining: false,
            payloads: BTreeMap::new(),
            signatures: BTreeMap::new(),
            validated: BTreeSet::new(),
            surfaced: BTreeSet::new(),
            waiting: BTreeSet::new(),
            delivered: BTreeSet::new(),
            next_seq: BTreeMap::new(),
            tallies: BTreeMap::new(),
        }
    }

    /// Returns `true` once this instance has signed any statement for the
    /// epoch, i.e. the broadcast has started.
    pub fn has_started(&self) -> bool {
        self.sig_count > 0
    }

    /// The quorum thresholds in use.
    pub fn quorum(&self) -> &QuorumParams {
        &self.quorum
    }

    /// The payloads seen so far, by reference.
    pub fn payloads(&self) -> &BTreeMap<MessageRef, C> {
        &self.payloads
    }

    /// Every valid signature collected, in auth-reference order.
    pub fn valid_signatures(&self) -> Vec<CacSignature> {
        self.signatures.values().cloned().collect()
    }

    /// Broadcasts our own payload. Allowed only before any local signature.
    pub fn broadcast(&mut self, payload: C) -> Result<Step<C, S>> {
        if self.sig_count > 0 {
            return Err(Error::MultipleInputs);
        }
        let mref = contribution_ref(&*self.state, &payload);
        self.payloads.insert(mref, payload.clone());
        self.surfaced.insert(mref);
        self.validated.insert(mref);

        let mut step = Step::<C, S>::default();
        self.emit_signature(SigRole::Witness, mref);
        self.broadcast_message(SigRole::Witness, Some(payload), &mut step);
        self.drain(&mut step);
        Ok(step)
    }

    /// Marks a payload as approved by the upper layer, possibly witnessing
    /// it.
    pub fn validate(&mut self, payload: C) -> Step<C, S> {
        let mref = contribution_ref(&*self.state, &payload);
        self.payloads.entry(mref).or_insert_with(|| payload.clone());
        self.validated.insert(mref);

        let mut step = Step::<C, S>::default();
        if self.sig_count == 0 {
            if let Some(chosen_ref) = self.choose_validated() {
                let chosen = self.payloads[&chosen_ref].clone();
                self.waiting.remove(&chosen_ref);
                self.emit_signature(SigRole::Witness, chosen_ref);
                self.broadcast_message(SigRole::Witness, Some(chosen), &mut step);
            }
        }
        if self.waiting.remove(&mref) {
            self.emit_signature(SigRole::Witness, mref);
            self.broadcast_message(SigRole::Witness, None, &mut step);
        }
        self.drain(&mut step);
        step
    }

    /// Handles a message received from `sender_id`.
    pub fn handle_message(
        &mut self,
        sender_id: &S::NodeId,
        message: CacMessage<C>,
    ) -> Step<C, S> {
        self.queue.push_back((Some(sender_id.clone()), message));
        let mut step = Step::<C, S>::default();
        self.drain(&mut step);
        step
    }

    /// Processes queued messages in FIFO order unless a drain is already in
    /// progress higher up the call stack.
    fn drain(&mut self, step: &mut Step<C, S>) {
        if self.draining {
            return;
        }
        self.draining = true;
        while let Some((sender, message)) = self.queue.pop_front() {
            self.process_message(sender, message, step);
        }
        self.draining = false;
    }

    fn process_message(
        &mut self,
        sender: Option<S::NodeId>,
        message: CacMessage<C>,
        step: &mut Step<C, S>,
    ) {
        let role = message.role;
        if let Some(payload) = message.payload {
            let mref = contribution_ref(&*self.state, &payload);
            self.payloads.entry(mref).or_insert(payload);
        }

        // Signatures are not necessarily listed in sequence order: higher
        // sequences are parked and retried to a fixed point once the gap
        // closes. Piggybacked signature sets are cumulative, so anything
        // still missing returns with the next message.
        let mut parked: BTreeSet<CacSignature> = BTreeSet::new();
        for auth in message.sigs {
            match self.screen_signature(&auth) {
                Screened::Known => {}
                Screened::Invalid(kind) => {
                    if let Some(ref id) = sender {
                        step.fault_log.append(id.clone(), kind);
                    }
                }
                Screened::Parked(sig) => {
                    parked.insert(sig);
                }
                Screened::Ready(sig) => self.record_signature(sig),
            }
        }
        loop {
            let now_ready: Vec<CacSignature> = parked
                .iter()
                .filter(|sig| sig.sequence == self.expected_seq(sig.sender()))
                .cloned()
                .collect();
            if now_ready.is_empty() {
                break;
            }
            for sig in now_ready {
                parked.remove(&sig);
                self.record_signature(sig);
            }
        }

        match role {
            SigRole::Witness => self.on_witness(step),
            SigRole::Ready => self.on_ready(step),
        }
    }

    /// Verifies one auth content and decides what to do with the signature.
    fn screen_signature(&self, auth: &AuthContent) -> Screened {
        let auth_ref = super::signature::auth_content_ref(&*self.state, auth);
        if self.signatures.contains_key(&auth_ref) {
            return Screened::Known;
        }
        let sig = match CacSignature::verify(&*self.state, auth) {
            Some(sig) => sig,
            None => return Screened::Invalid(FaultKind::InvalidSignature),
        };
        let expected = self.expected_seq(sig.sender());
        if sig.sequence > expected {
            Screened::Parked(sig)
        } else if sig.sequence < expected {
            // A fresh signature below the contiguous range reuses a
            // sequence number: the sender equivocated.
            Screened::Invalid(FaultKind::ReusedSequence)
        } else {
            Screened::Ready(sig)
        }
    }

    fn expected_seq(&self, sender: LeafIndex) -> u32 {
        self.next_seq.get(&sender).cloned().unwrap_or(0)
    }

    /// Accepts a verified, in-sequence signature into the tallies.
    fn record_signature(&mut self, sig: CacSignature) {
        *self.next_seq.entry(sig.sender()).or_insert(0) += 1;
        let tally = self.tallies.entry(sig.msg_ref).or_default();
        match sig.role {
            SigRole::Witness => tally.witness.insert(sig.sender()),
            SigRole::Ready => tally.ready.insert(sig.sender()),
        };
        self.signatures.insert(sig.auth_ref, sig);
    }

    /// Signs a statement ourselves and counts it.
    fn emit_signature(&mut self, role: SigRole, msg_ref: MessageRef) {
        let sig = CacSignature::sign(&*self.state, self.sig_count, role, msg_ref);
        self.sig_count += 1;
        debug!("{:?} CAC emitting {:?}", self.state.our_id(), sig);
        let tally = self.tallies.entry(msg_ref).or_default();
        match role {
            SigRole::Witness => tally.witness.insert(sig.sender()),
            SigRole::Ready => tally.ready.insert(sig.sender()),
        };
        self.signatures.insert(sig.auth_ref, sig);
    }

    /// Multicasts an announcement carrying every valid signature, and queues
    /// it for local processing (the network does not echo to self).
    fn broadcast_message(&mut self, role: SigRole, payload: Option<C>, step: &mut Step<C, S>) {
        if role == SigRole::Ready {
            self.ready_sent = true;
        }
        let message = CacMessage {
            role,
            sigs: self.auth_contents(),
            payload,
        };
        step.messages
            .push(Target::All.message(message.clone()));
        self.queue.push_back((None, message));
    }

    fn auth_contents(&self) -> Vec<AuthContent> {
        self.signatures.values().map(|sig| sig.auth.clone()).collect()
    }

    /// Progress rules evaluated after processing a witness announcement.
    fn on_witness(&mut self, step: &mut Step<C, S>) {
        // 1. Surface every signed-about payload the upper layer has not
        // examined yet.
        let to_surface: Vec<MessageRef> = self
            .tallies
            .keys()
            .filter(|mref| !self.surfaced.contains(mref) && self.payloads.contains_key(mref))
            .cloned()
            .collect();
        for mref in to_surface {
            self.surfaced.insert(mref);
            step.output.push(Output::Candidate(self.payloads[&mref].clone()));
        }

        // 2. First local signature: witness a validated candidate.
        if self.sig_count == 0 && !self.validated.is_empty() {
            if let Some(chosen_ref) = self.choose_validated() {
                let chosen = self.payloads[&chosen_ref].clone();
                self.emit_signature(SigRole::Witness, chosen_ref);
                self.broadcast_message(SigRole::Witness, Some(chosen), &mut *step);
            }
        }

        // 3. Witness majority reached for some message: send `Ready` for
        // every message with a witness quorum, and in the `n > 5t` regime
        // deliver immediately when a single message holds all witnesses.
        let majority = self.quorum.witness_majority();
        if self
            .tallies
            .values()
            .any(|tally| tally.witness.len() >= majority)
        {
            for mref in self.refs_with_witness_at_least(self.quorum.q_witness) {
                if !self.has_own_ready(&mref) {
                    self.emit_signature(SigRole::Ready, mref);
                    self.broadcast_message(SigRole::Ready, None, &mut *step);
                }
                if self.quorum.immediate_regime()
                    && self.witness_count(&mref) >= self.quorum.seen_threshold()
                    && self.tallies.len() == 1
                    && !self.delivered.contains(&mref)
                {
                    self.deliver(mref, vec![mref], step);
                }
            }
        }

        // 4. Enough distinct signing processes seen: make sure we witness
        // something, so the broadcast cannot stall on us.
        let seen_processes = self.next_seq.len() + 1;
        if seen_processes >= self.quorum.seen_threshold() && !self.ready_sent {
            let min_unique = seen_processes.saturating_sub(2 * self.quorum.t);
            let unique_choice = self
                .tallies
                .iter()
                .find(|(_, tally)| tally.witness.len() >= min_unique)
                .map(|(mref, _)| *mref);

            let own = self.state.our_index();
            match unique_choice {
                Some(mref)
                    if self.quorum.immediate_regime()
                        && !self.tallies[&mref].witness.contains(&own)
                        && self.validated.contains(&mref) =>
                {
                    self.emit_signature(SigRole::Witness, mref);
                    self.broadcast_message(SigRole::Witness, None, &mut *step);
                }
                _ => {
                    let witnessed: Vec<MessageRef> = self.refs_with_witness_at_least(1);
                    let min_required = (self.quorum.n as i64
                        - self.quorum.t as i64 * (witnessed.len() as i64 + 1))
                        .max(1) as usize;
                    for mref in witnessed {
                        if self.witness_count(&mref) >= min_required
                            && !self.waiting.contains(&mref)
                            && !self.tallies[&mref].witness.contains(&own)
                        {
                            if self.validated.contains(&mref) {
                                self.emit_signature(SigRole::Witness, mref);
                                self.broadcast_message(SigRole::Witness, None, &mut *step);
                            } else {
                                self.waiting.insert(mref);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Progress rules evaluated after processing a ready announcement.
    fn on_ready(&mut self, step: &mut Step<C, S>) {
        let ready_msgs = self.refs_with_witness_at_least(self.quorum.q_witness);
        if ready_msgs.is_empty() {
            return;
        }

        for mref in &ready_msgs {
            if !self.has_own_ready(mref) {
                self.emit_signature(SigRole::Ready, *mref);
                self.broadcast_message(SigRole::Ready, None, &mut *step);
            }
        }

        // Everything with at least k witnesses belongs to the conflict set.
        let conflict_set = self.refs_with_witness_at_least(self.quorum.k);
        for mref in &conflict_set {
            if self.ready_count(mref) >= self.quorum.q_ready && !self.delivered.contains(mref) {
                self.deliver(*mref, conflict_set.clone(), step);
            }
        }
    }

    fn deliver(&mut self, mref: MessageRef, conflict: Vec<MessageRef>, step: &mut Step<C, S>) {
        let payload = match self.payloads.get(&mref) {
            Some(payload) => payload.clone(),
            None => {
                // The payload never arrived; delivery re-fires once a
                // piggybacking message supplies it.
                warn!(
                    "{:?} CAC cannot deliver unknown payload {:?}",
                    self.state.our_id(),
                    mref
                );
                return;
            }
        };
        self.delivered.insert(mref);
        debug!(
            "{:?} CAC delivering {:?}, conflict set of {}",
            self.state.our_id(),
            mref,
            conflict.len()
        );
        step.output.push(Output::Deliver {
            payload,
            conflict,
            signatures: self.valid_signatures(),
        });
    }

    /// Picks the reference to witness among the validated candidates.
    fn choose_validated(&self) -> Option<MessageRef> {
        let candidates: Vec<&C> = self
            .validated
            .iter()
            .filter_map(|mref| self.payloads.get(mref))
            .collect();
        let chosen = C::choose(&*self.state, candidates)?;
        Some(contribution_ref(&*self.state, chosen))
    }

    /// References whose witness count is at least `threshold`, in reference
    /// order.
    fn refs_with_witness_at_least(&self, threshold: usize) -> Vec<MessageRef> {
        self.tallies
            .iter()
            .filter(|(_, tally)| tally.witness.len() >= threshold)
            .map(|(mref, _)| *mref)
            .collect()
    }

    fn witness_count(&self, mref: &MessageRef) -> usize {
        self.tallies.get(mref).map_or(0, |tally| tally.witness.len())
    }

    fn ready_count(&self, mref: &MessageRef) -> usize {
        self.tallies.get(mref).map_or(0, |tally| tally.ready.len())
    }

    fn has_own_ready(&self, mref: &MessageRef) -> bool {
        self.tallies
            .get(mref)
            .map_or(false, |tally| tally.ready.contains(&self.state.our_index()))
    }
}

/// The result of screening one received signature.
enum Screened {
    /// Already known; ignore.
    Known,
    /// Rejected.
    Invalid(FaultKind),
    /// Valid but ahead of the sender's contiguous range.
    Parked(CacSignature),
    /// Valid and next in sequence.
    Ready(CacSignature),
}

impl<C, S> ConsensusProtocol for CacBroadcast<C, S>
where
    C: CacContribution<S>,
    S: GroupState,
{
    type NodeId = S::NodeId;
    type Input = Input<C>;
    type Output = Output<C>;
    type Message = CacMessage<C>;
    type Timer = NoTimer;
    type Error = Error;
    type FaultKind = FaultKind;

    fn handle_input<R: Rng>(&mut self, input: Self::Input, _rng: &mut R) -> Result<Step<C, S>> {
        match input {
            Input::Broadcast(payload) => self.broadcast(payload),
            Input::Validate(payload) => Ok(self.validate(payload)),
        }
    }

    fn handle_message<R: Rng>(
        &mut self,
        sender_id: &Self::NodeId,
        message: Self::Message,
        _rng: &mut R,
    ) -> Result<Step<C, S>> {
        Ok(self.handle_message(sender_id, message))
    }

    fn terminated(&self) -> bool {
        false
    }

    fn our_id(&self) -> &Self::NodeId {
        self.state.our_id()
    }
}

impl<C, S: GroupState> fmt::Display for CacBroadcast<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> result::Result<(), fmt::Error> {
        write!(
            f,
            "{:?} CacBroadcast(epoch {})",
            self.state.our_id(),
            self.state.epoch()
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::{contribution_ref, CacContribution, CacMessage, CacSignature, SigRole};
    use super::{CacBroadcast, Output};
    use crate::group_state::basic::{BasicGroupState, BasicOp};
    use crate::group_state::{GroupState, MemberId, MessageRef};

    /// A minimal contribution for unit testing: choice is lexicographic.
    #[derive(
        Clone,
        Debug,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        serde_derive::Serialize,
        serde_derive::Deserialize,
    )]
    struct Blob(Vec<u8>);

    impl<S: GroupState> CacContribution<S> for Blob {
        const REF_LABEL: &'static str = "test 1.0 blob";

        fn choose<'a, I>(_state: &S, candidates: I) -> Option<&'a Self>
        where
            I: IntoIterator<Item = &'a Self>,
        {
            candidates.into_iter().min()
        }
    }

    /// Builds one `BasicGroupState` per member of a fresh group.
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

    /// Runs all instances to quiescence, routing every `Target::All` message
    /// to every other instance, and returns the deliveries per node.
    fn run_to_quiescence(
        nodes: &mut Vec<CacBroadcast<Blob, BasicGroupState>>,
        mut pending: Vec<(usize, CacMessage<Blob>)>,
    ) -> Vec<Vec<Output<Blob>>> {
        let ids: Vec<MemberId> = nodes.iter().map(|n| n.state.our_id().clone()).collect();
        let mut outputs: Vec<Vec<Output<Blob>>> = vec![Vec::new(); nodes.len()];
        while let Some((from, message)) = pending.pop() {
            for (idx, node) in nodes.iter_mut().enumerate() {
                if idx == from {
                    continue;
                }
                let step = node.handle_message(&ids[from], message.clone());
                for msg in step.messages {
                    pending.push((idx, msg.message));
                }
                for out in step.output {
                    // Candidates are validated unconditionally in this test.
                    if let Output::Candidate(blob) = &out {
                        let vstep = node.validate(blob.clone());
                        for msg in vstep.messages {
                            pending.push((idx, msg.message));
                        }
                        outputs[idx].extend(vstep.output);
                    }
                    outputs[idx].push(out);
                }
            }
        }
        outputs
    }

    #[test]
    fn single_broadcast_delivers_everywhere() {
        let states = states(&["a", "b", "c", "d"]);
        let mut nodes: Vec<_> = states
            .iter()
            .map(|state| CacBroadcast::<Blob, _>::new(state.clone(), 1))
            .collect();

        let step = nodes[0].broadcast(Blob(b"value".to_vec())).expect("broadcast");
        let pending: Vec<_> = step.messages.into_iter().map(|tm| (0, tm.message)).collect();
        assert!(step
            .output
            .iter()
            .all(|out| !matches!(out, Output::Deliver { .. })));

        let outputs = run_to_quiescence(&mut nodes, pending);
        for (idx, outs) in outputs.iter().enumerate() {
            let delivered: Vec<_> = outs
                .iter()
                .filter_map(|out| match out {
                    Output::Deliver {
                        payload, conflict, ..
                    } => Some((payload.clone(), conflict.clone())),
                    _ => None,
                })
                .collect();
            assert_eq!(delivered.len(), 1, "node {} delivered {:?}", idx, delivered);
            assert_eq!(delivered[0].0, Blob(b"value".to_vec()));
            assert_eq!(delivered[0].1.len(), 1);
        }
    }

    #[test]
    fn out_of_order_signatures_are_parked_and_recovered() {
        let states = states(&["a", "b", "c", "d"]);
        let mut sender = CacBroadcast::<Blob, _>::new(states[0].clone(), 1);
        let mut receiver = CacBroadcast::<Blob, _>::new(states[1].clone(), 1);

        // Produce three signatures from the same sender.
        let _ = sender.broadcast(Blob(b"x".to_vec())).expect("broadcast");
        let r1 = contribution_ref(&*states[0], &Blob(b"x".to_vec()));
        sender.emit_signature(SigRole::Ready, r1);
        sender.emit_signature(SigRole::Ready, r1);
        let mut sigs: Vec<_> = sender.valid_signatures();
        sigs.sort_by_key(|sig| sig.sequence);
        assert_eq!(sigs.len(), 3);

        // Deliver them in wire order {2, 0, 1} within one message.
        let shuffled = vec![sigs[2].auth.clone(), sigs[0].auth.clone(), sigs[1].auth.clone()];
        let message = CacMessage {
            role: SigRole::Witness,
            sigs: shuffled,
            payload: Some(Blob(b"x".to_vec())),
        };
        let step = receiver.handle_message(states[0].our_id(), message);
        assert!(step.fault_log.is_empty());
        assert_eq!(receiver.expected_seq(states[0].our_index()), 3);
        assert_eq!(receiver.signatures.len(), 3 + receiver.sig_count as usize);
    }

    #[test]
    fn duplicate_signatures_cause_no_state_change() {
        let states = states(&["a", "b", "c", "d"]);
        let mut sender = CacBroadcast::<Blob, _>::new(states[0].clone(), 1);
        let mut receiver = CacBroadcast::<Blob, _>::new(states[1].clone(), 1);

        let step = sender.broadcast(Blob(b"x".to_vec())).expect("broadcast");
        let message = step.messages[0].message.clone();
        let _ = receiver.handle_message(states[0].our_id(), message.clone());
        let sigs_before = receiver.signatures.len();
        let tally_before = receiver
            .tallies
            .values()
            .map(|t| (t.witness.len(), t.ready.len()))
            .collect::<Vec<_>>();

        let step = receiver.handle_message(states[0].our_id(), message);
        assert!(step.fault_log.is_empty());
        assert_eq!(receiver.signatures.len(), sigs_before);
        assert_eq!(
            receiver
                .tallies
                .values()
                .map(|t| (t.witness.len(), t.ready.len()))
                .collect::<Vec<_>>(),
            tally_before
        );
    }

    #[test]
    fn at_most_one_witness_and_ready_per_reference() {
        let states = states(&["a", "b", "c", "d"]);
        let mut nodes: Vec<_> = states
            .iter()
            .map(|state| CacBroadcast::<Blob, _>::new(state.clone(), 1))
            .collect();
        let step = nodes[1].broadcast(Blob(b"v".to_vec())).expect("broadcast");
        let pending: Vec<_> = step.messages.into_iter().map(|tm| (1, tm.message)).collect();
        let _ = run_to_quiescence(&mut nodes, pending);

        for node in &nodes {
            let mut witnessed: Vec<(MessageRef, _)> = Vec::new();
            let mut readied: Vec<(MessageRef, _)> = Vec::new();
            for sig in node.signatures.values() {
                let entry = (sig.msg_ref, sig.sender());
                if sig.is_witness() {
                    assert!(!witnessed.contains(&entry), "duplicate witness {:?}", entry);
                    witnessed.push(entry);
                } else {
                    assert!(!readied.contains(&entry), "duplicate ready {:?}", entry);
                    readied.push(entry);
                }
            }
        }
    }

    #[test]
    fn equivocating_sequence_reuse_is_fault_logged() {
        let states = states(&["a", "b", "c", "d"]);
        let mut receiver = CacBroadcast::<Blob, _>::new(states[1].clone(), 1);

        let other = states[0].clone();
        let r1 = contribution_ref(&*other, &Blob(b"one".to_vec()));
        let r2 = contribution_ref(&*other, &Blob(b"two".to_vec()));
        let sig_a = CacSignature::sign(&*other, 0, SigRole::Witness, r1);
        let sig_b = CacSignature::sign(&*other, 0, SigRole::Witness, r2);

        let message = |auth| CacMessage::<Blob> {
            role: SigRole::Witness,
            sigs: vec![auth],
            payload: None,
        };
        let step = receiver.handle_message(other.our_id(), message(sig_a.auth.clone()));
        assert!(step.fault_log.is_empty());
        let step = receiver.handle_message(other.our_id(), message(sig_b.auth.clone()));
        assert_eq!(step.fault_log.0.len(), 1);
    }
}
