use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, result};

use log::{debug, warn};

use super::message::{RoundContent, ViewChangeContent};
use super::{FaultKind, FcMessage};
use crate::cac::{contribution_ref, CacContribution};
use crate::group_state::{AuthContent, GroupState, LeafIndex, MessageRef};
use crate::{util, Target, TimerCmd};

/// A `FullConsensus` step; the output is the decided value.
pub type Step<C, S> = crate::Step<FcMessage<C>, C, <S as GroupState>::NodeId, FaultKind, Timer>;

/// The timers a `FullConsensus` instance arms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timer {
    /// The leader did not answer our proposal within one round trip:
    /// broadcast the proposal to everyone.
    Propose,
    /// The round still made no progress: vote for a view change.
    Forward,
}

/// Full-consensus instance, deciding one value of type `C` per epoch.
pub struct FullConsensus<C, S: GroupState> {
    /// Shared group state.
    state: Arc<S>,
    /// The network round-trip estimate; both timeouts use it.
    rtt: Duration,
    /// The number of tolerated faulty members.
    f: usize,
    /// The current view.
    view: u32,
    /// The current view's leader.
    leader_index: LeafIndex,
    /// Messages for future views, replayed on view change.
    future: BTreeMap<u32, VecDeque<(S::NodeId, FcMessage<C>)>>,
    /// Values by reference. Assumed small; kept across views.
    contents: BTreeMap<MessageRef, C>,
    preprepare_sent: bool,
    prepare_sent: bool,
    commit_sent: bool,
    /// Whether this instance already delivered its single decision.
    delivered: bool,
    /// Prepare signers per reference.
    prepares: BTreeMap<MessageRef, BTreeSet<LeafIndex>>,
    /// Commit signers per reference.
    commits: BTreeMap<MessageRef, BTreeSet<LeafIndex>>,
    /// Members that voted to leave the current view.
    view_changes: BTreeSet<LeafIndex>,
    /// The value we were asked to propose.
    proposed: Option<C>,
    /// The value the leader pre-prepared in this view.
    pre_prepared: Option<C>,
}

impl<C, S> FullConsensus<C, S>
where
    C: CacContribution<S>,
    S: GroupState,
{
    /// Creates a new instance for the state's current epoch, in view 0.
    pub fn new(state: Arc<S>, rtt: Duration) -> Self {
        let f = util::max_faulty(state.members(false).len());
        let leader_index = Self::leader_for(&state, 0);
        FullConsensus {
            state,
            rtt,
            f,
            view: 0,
            leader_index,
            future: BTreeMap::new(),
            contents: BTreeMap::new(),
            preprepare_sent: false,
            prepare_sent: false,
            commit_sent: false,
            delivered: false,
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            view_changes: BTreeSet::new(),
            proposed: None,
            pre_prepared: None,
        }
    }

    /// The deterministic leader of `view`: the member leaf indices in
    /// sorted order, rotated by view and epoch.
    fn leader_for(state: &S, view: u32) -> LeafIndex {
        let mut members = state.member_indices();
        members.sort();
        let position = (u64::from(view) + state.epoch()) % members.len() as u64;
        members[position as usize]
    }

    /// The current view.
    pub fn view(&self) -> u32 {
        self.view
    }

    /// The current leader's leaf index.
    pub fn leader(&self) -> LeafIndex {
        self.leader_index
    }

    /// Proposes a value for this epoch's decision.
    pub fn propose(&mut self, content: C) -> Step<C, S> {
        if self.proposed.is_some() {
            return Step::<C, S>::default();
        }
        self.proposed = Some(content);
        let mut step = Step::<C, S>::default();
        if !self.prepare_sent {
            self.propose_current(&mut step);
        }
        step
    }

    /// Handles a message received from `sender_id`.
    pub fn handle_message(&mut self, sender_id: &S::NodeId, message: FcMessage<C>) -> Step<C, S> {
        let mut step = Step::<C, S>::default();
        self.dispatch(sender_id.clone(), message, &mut step);
        step
    }

    /// Handles the expiration of one of our timers.
    pub fn handle_timer(&mut self, timer: Timer) -> Step<C, S> {
        let mut step = Step::<C, S>::default();
        match timer {
            Timer::Propose => self.on_propose_timeout(&mut step),
            Timer::Forward => self.on_forward_timeout(&mut step),
        }
        step
    }

    fn dispatch(&mut self, sender_id: S::NodeId, message: FcMessage<C>, step: &mut Step<C, S>) {
        match message {
            FcMessage::Propose { view, content } => {
                if view == self.view {
                    self.handle_propose(content, step);
                } else if view > self.view {
                    self.future
                        .entry(view)
                        .or_default()
                        .push_back((sender_id, FcMessage::Propose { view, content }));
                }
            }
            FcMessage::PrePrepare { signed, content } => {
                let signer = signed.sender;
                let message = FcMessage::PrePrepare {
                    signed: signed.clone(),
                    content: content.clone(),
                };
                if let Some(round) = self.screen(&sender_id, signed, message, step) {
                    self.handle_preprepare(&sender_id, signer, round, content, step);
                }
            }
            FcMessage::Prepare { signed } => {
                let sender = signed.sender;
                let message = FcMessage::Prepare {
                    signed: signed.clone(),
                };
                if let Some(round) = self.screen(&sender_id, signed, message, step) {
                    self.handle_prepare(sender, round, step);
                }
            }
            FcMessage::Commit { signed } => {
                let sender = signed.sender;
                let message = FcMessage::Commit {
                    signed: signed.clone(),
                };
                if let Some(round) = self.screen(&sender_id, signed, message, step) {
                    self.handle_commit(sender, round, step);
                }
            }
            FcMessage::ViewChange { signed } => {
                self.handle_view_change_signed(sender_id, signed, step);
            }
        }
    }

    /// Verifies a signed round content. Returns it if it belongs to the
    /// current view; queues the original message if it belongs to a future
    /// one.
    fn screen(
        &mut self,
        sender_id: &S::NodeId,
        signed: AuthContent,
        original: FcMessage<C>,
        step: &mut Step<C, S>,
    ) -> Option<RoundContent> {
        if !self.state.verify(&signed) {
            step.fault_log
                .append(sender_id.clone(), FaultKind::InvalidSignature);
            return None;
        }
        let round: RoundContent = match bincode::deserialize(&signed.payload) {
            Ok(round) => round,
            Err(_) => {
                step.fault_log
                    .append(sender_id.clone(), FaultKind::InvalidSignature);
                return None;
            }
        };
        if round.view == self.view {
            Some(round)
        } else {
            if round.view > self.view {
                self.future
                    .entry(round.view)
                    .or_default()
                    .push_back((sender_id.clone(), original));
            }
            None
        }
    }

    /// Routes our proposal to the current leader, or pre-prepares it if we
    /// lead.
    fn propose_current(&mut self, step: &mut Step<C, S>) {
        let content = match &self.proposed {
            Some(content) => content.clone(),
            None => return,
        };
        if self.leader_index == self.state.our_index() {
            self.handle_propose(content, step);
        } else if let Some(leader_id) = self.state.member_id(self.leader_index) {
            step.messages.push(Target::Node(leader_id).message(FcMessage::Propose {
                view: self.view,
                content,
            }));
            step.timers
                .push(TimerCmd::Schedule(Timer::Propose, self.rtt));
        }
    }

    /// A proposal reached us (as leader, or forwarded around a suspected
    /// one).
    fn handle_propose(&mut self, content: C, step: &mut Step<C, S>) {
        let mref = contribution_ref(&*self.state, &content);
        self.contents.insert(mref, content.clone());

        if self.leader_index == self.state.our_index() {
            if !self.preprepare_sent {
                self.preprepare_sent = true;
                let signed = self.sign_round(mref);
                step.messages.push(Target::All.message(FcMessage::PrePrepare {
                    signed,
                    content,
                }));
            }
        } else {
            if let Some(leader_id) = self.state.member_id(self.leader_index) {
                step.messages.push(Target::Node(leader_id).message(FcMessage::Propose {
                    view: self.view,
                    content,
                }));
            }
            step.timers
                .push(TimerCmd::Schedule(Timer::Forward, self.rtt));
        }
    }

    fn handle_preprepare(
        &mut self,
        sender_id: &S::NodeId,
        signer: LeafIndex,
        round: RoundContent,
        content: C,
        step: &mut Step<C, S>,
    ) {
        if self.leader_index == self.state.our_index() {
            return;
        }
        if signer != self.leader_index {
            step.fault_log
                .append(sender_id.clone(), FaultKind::PrePrepareFromNonLeader);
            return;
        }
        if round.msg_ref != contribution_ref(&*self.state, &content) {
            step.fault_log
                .append(sender_id.clone(), FaultKind::PrePrepareRefMismatch);
            return;
        }
        self.contents.insert(round.msg_ref, content.clone());
        self.cancel_timers(step);

        if !self.prepare_sent {
            self.prepare_sent = true;
            self.pre_prepared = Some(content);
            step.timers
                .push(TimerCmd::Schedule(Timer::Propose, self.rtt));

            let signed = self.sign_round(round.msg_ref);
            step.messages
                .push(Target::All.message(FcMessage::Prepare { signed }));
            // The transport does not echo broadcasts, so our own vote is
            // tallied here.
            self.handle_prepare(self.state.our_index(), round, step);
        }
    }

    fn handle_prepare(&mut self, sender: LeafIndex, round: RoundContent, step: &mut Step<C, S>) {
        self.prepares.entry(round.msg_ref).or_default().insert(sender);

        if self.prepares[&round.msg_ref].len() >= 2 * self.f + 1 && !self.commit_sent {
            self.commit_sent = true;
            self.cancel_timers(step);
            let signed = self.sign_round(round.msg_ref);
            step.messages
                .push(Target::All.message(FcMessage::Commit { signed }));
            self.handle_commit(self.state.our_index(), round, step);
        }
    }

    fn handle_commit(&mut self, sender: LeafIndex, round: RoundContent, step: &mut Step<C, S>) {
        self.commits.entry(round.msg_ref).or_default().insert(sender);

        if self.commits[&round.msg_ref].len() >= 2 * self.f + 1 && !self.delivered {
            match self.contents.get(&round.msg_ref) {
                Some(content) => {
                    self.delivered = true;
                    debug!(
                        "{:?} full consensus delivering in view {}",
                        self.state.our_id(),
                        self.view
                    );
                    self.cancel_timers(step);
                    step.output.push(content.clone());
                }
                None => warn!(
                    "{:?} full consensus has a commit quorum for unknown value {:?}",
                    self.state.our_id(),
                    round.msg_ref
                ),
            }
        }
    }

    fn handle_view_change_signed(
        &mut self,
        sender_id: S::NodeId,
        signed: AuthContent,
        step: &mut Step<C, S>,
    ) {
        if !self.state.verify(&signed) {
            step.fault_log
                .append(sender_id, FaultKind::InvalidSignature);
            return;
        }
        let content: ViewChangeContent = match bincode::deserialize(&signed.payload) {
            Ok(content) => content,
            Err(_) => {
                step.fault_log
                    .append(sender_id, FaultKind::InvalidSignature);
                return;
            }
        };
        if content.view == self.view + 1 {
            self.view_changes.insert(signed.sender);
            if self.view_changes.len() >= 2 * self.f + 1 {
                self.new_view(content.view, step);
            }
        } else if content.view > self.view {
            self.future
                .entry(content.view)
                .or_default()
                .push_back((sender_id, FcMessage::ViewChange { signed }));
        }
    }

    /// Moves to `view`, resets the view-local state and replays queued
    /// messages.
    fn new_view(&mut self, view: u32, step: &mut Step<C, S>) {
        debug!("{:?} full consensus moving to view {}", self.state.our_id(), view);
        self.view = view;
        self.leader_index = Self::leader_for(&self.state, view);
        self.pre_prepared = None;
        self.preprepare_sent = false;
        self.prepare_sent = false;
        self.commit_sent = false;
        self.prepares.clear();
        self.commits.clear();
        self.view_changes.clear();
        self.cancel_timers(step);

        if let Some(queued) = self.future.remove(&view) {
            for (sender_id, message) in queued {
                self.dispatch(sender_id, message, step);
            }
        }

        if self.proposed.is_some() && !self.prepare_sent && !self.preprepare_sent {
            self.propose_current(step);
        }
    }

    /// The leader stayed silent: broadcast the value to everyone so any
    /// member can forward it, and arm the view-change timeout.
    fn on_propose_timeout(&mut self, step: &mut Step<C, S>) {
        let content = match self.pre_prepared.clone().or_else(|| self.proposed.clone()) {
            Some(content) => content,
            None => return,
        };
        step.messages.push(Target::All.message(FcMessage::Propose {
            view: self.view,
            content,
        }));
        step.timers
            .push(TimerCmd::Schedule(Timer::Forward, self.rtt));
    }

    /// Still no progress: vote to change the view.
    fn on_forward_timeout(&mut self, step: &mut Step<C, S>) {
        let payload = bincode::serialize(&ViewChangeContent {
            view: self.view + 1,
        })
        .expect("failed to serialize view change");
        let signed = self.state.sign(&payload);
        step.messages
            .push(Target::All.message(FcMessage::ViewChange { signed }));
        self.view_changes.insert(self.state.our_index());
        if self.view_changes.len() >= 2 * self.f + 1 {
            self.new_view(self.view + 1, step);
        }
    }

    fn sign_round(&self, msg_ref: MessageRef) -> AuthContent {
        let payload = bincode::serialize(&RoundContent {
            view: self.view,
            msg_ref,
        })
        .expect("failed to serialize round content");
        self.state.sign(&payload)
    }

    fn cancel_timers(&self, step: &mut Step<C, S>) {
        step.timers.push(TimerCmd::Cancel(Timer::Propose));
        step.timers.push(TimerCmd::Cancel(Timer::Forward));
    }
}

impl<C, S: GroupState> fmt::Debug for FullConsensus<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> result::Result<(), fmt::Error> {
        f.debug_struct("FullConsensus")
            .field("our_id", self.state.our_id())
            .field("view", &self.view)
            .field("leader", &self.leader_index)
            .field("delivered", &self.delivered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::FcMessage;
    use super::{FullConsensus, Step, Timer};
    use crate::cac::CacContribution;
    use crate::group_state::basic::{BasicGroupState, BasicOp};
    use crate::group_state::{GroupState, LeafIndex, MemberId};
    use crate::{Target, TargetedMessage};

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

    use itertools::Itertools;

    /// Routes messages among the nodes until quiescence; returns decisions.
    fn run(
        states: &[Arc<BasicGroupState>],
        nodes: &mut Vec<FullConsensus<Blob, BasicGroupState>>,
        initial: Vec<(usize, TargetedMessage<FcMessage<Blob>, MemberId>)>,
    ) -> Vec<Vec<Blob>> {
        let ids: Vec<MemberId> = states.iter().map(|s| s.our_id().clone()).collect();
        let mut outputs: Vec<Vec<Blob>> = vec![Vec::new(); nodes.len()];
        let mut pending = initial;
        while let Some((from, tm)) = pending.pop() {
            let recipients: Vec<usize> = match &tm.target {
                Target::All => (0..nodes.len()).filter(|i| *i != from).collect(),
                Target::Node(id) => ids.iter().positions(|x| x == id).collect(),
                Target::Nodes(set) => ids
                    .iter()
                    .enumerate()
                    .filter(|(_, id)| set.contains(*id))
                    .map(|(i, _)| i)
                    .collect(),
                Target::AllExcept(set) => ids
                    .iter()
                    .enumerate()
                    .filter(|(i, id)| *i != from && !set.contains(*id))
                    .map(|(i, _)| i)
                    .collect(),
            };
            for idx in recipients {
                let step: Step<Blob, BasicGroupState> =
                    nodes[idx].handle_message(&ids[from], tm.message.clone());
                outputs[idx].extend(step.output);
                pending.extend(step.messages.into_iter().map(|m| (idx, m)));
            }
        }
        outputs
    }

    #[test]
    fn leader_rotation_is_deterministic() {
        let states = states(&["a", "b", "c", "d"]);
        // Epoch 1, 4 members: view v is led by member (v + 1) mod 4.
        assert_eq!(
            FullConsensus::<Blob, _>::leader_for(&*states[0], 0),
            LeafIndex(1)
        );
        assert_eq!(
            FullConsensus::<Blob, _>::leader_for(&*states[0], 1),
            LeafIndex(2)
        );
        assert_eq!(
            FullConsensus::<Blob, _>::leader_for(&*states[0], 4),
            LeafIndex(1)
        );
    }

    #[test]
    fn all_deliver_the_leaders_choice() {
        let states = states(&["a", "b", "c", "d"]);
        let mut nodes: Vec<_> = states
            .iter()
            .map(|s| FullConsensus::<Blob, _>::new(s.clone(), Duration::from_millis(10)))
            .collect();

        let mut initial = Vec::new();
        for (idx, node) in nodes.iter_mut().enumerate() {
            let step = node.propose(Blob(format!("value-{}", idx).into_bytes()));
            initial.extend(step.messages.into_iter().map(|m| (idx, m)));
        }
        let outputs = run(&states, &mut nodes, initial);

        let mut decisions: Vec<&Blob> = Vec::new();
        for outs in &outputs {
            assert_eq!(outs.len(), 1, "every node delivers exactly once");
            decisions.push(&outs[0]);
        }
        assert!(decisions.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn second_proposal_is_ignored() {
        let states = states(&["a", "b", "c", "d"]);
        let mut node = FullConsensus::<Blob, _>::new(states[0].clone(), Duration::from_millis(10));
        let step = node.propose(Blob(b"one".to_vec()));
        assert!(!step.messages.is_empty());
        let step = node.propose(Blob(b"two".to_vec()));
        assert!(step.is_empty());
    }

    #[test]
    fn view_change_quorum_moves_the_view() {
        let states = states(&["a", "b", "c", "d"]);
        let ids: Vec<MemberId> = states.iter().map(|s| s.our_id().clone()).collect();
        let mut node = FullConsensus::<Blob, _>::new(states[0].clone(), Duration::from_millis(10));

        for peer in &[1usize, 2, 3] {
            let step = FullConsensus::<Blob, _>::new(states[*peer].clone(), Duration::from_millis(10))
                .handle_timer(Timer::Forward);
            let message = step.messages[0].message.clone();
            let _ = node.handle_message(&ids[*peer], message);
        }
        assert_eq!(node.view(), 1);
        assert_eq!(node.leader(), LeafIndex(2));
    }
}
