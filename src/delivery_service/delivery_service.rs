use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::{fmt, result};

use log::{debug, warn};
use rand::Rng;

use super::{Batch, DdsMessage, DeliveryServiceBuilder, Error, FaultKind, Result};
use crate::cascade::{self, CascadeConsensus, CascadeMessage, Params};
use crate::fault_log::Fault;
use crate::gossip::{self, Gossip};
use crate::group_state::{
    message_ref, GroupMessage, GroupState, MessageRef, ProposalRef, Welcome,
};
use crate::{ConsensusProtocol, Target, TimerCmd};

/// A `DeliveryService` step.
pub type Step<S> = crate::Step<
    DdsMessage<<S as GroupState>::NodeId>,
    Output<<S as GroupState>::NodeId>,
    <S as GroupState>::NodeId,
    FaultKind,
    cascade::Timer,
>;

/// The inputs a `DeliveryService` accepts.
#[derive(Debug)]
pub enum Input {
    /// Disseminate a proposal or application message best-effort.
    Broadcast(GroupMessage),
    /// Propose a commit for the current epoch, together with the welcome
    /// for any members it adds.
    ProposeCommit {
        /// The commit message.
        commit: GroupMessage,
        /// The welcome blob sent to added members once the commit wins.
        welcome: Option<Welcome>,
    },
}

/// The outputs of a `DeliveryService`.
#[derive(Clone, Debug, PartialEq)]
pub enum Output<N> {
    /// A proposal or application message, delivered best-effort at most
    /// once per epoch.
    Message(GroupMessage),
    /// A commit was agreed on and applied: the epoch advanced.
    Batch(Batch<N>),
}

/// The delivery service: one per group member process.
pub struct DeliveryService<S: GroupState> {
    state: Arc<S>,
    params: Params,
    gossip: Gossip<S>,
    cascade: CascadeConsensus<S>,
    /// References of the proposals seen this epoch.
    received_proposals: BTreeSet<ProposalRef>,
    /// Commits waiting for proposals they reference, keyed by commit
    /// reference, with the still-missing proposal references.
    incomplete_commits: BTreeMap<MessageRef, (GroupMessage, BTreeSet<ProposalRef>)>,
    /// Proposals and application messages from future epochs.
    future_proposals: Vec<GroupMessage>,
    /// Cascade envelopes from future epochs, with their transport sender.
    future_cascade: Vec<(S::NodeId, GroupMessage)>,
    /// The commit we proposed this epoch, with the welcome to send if it
    /// wins.
    proposed_commit: Option<(MessageRef, Option<Welcome>)>,
}

impl<S: GroupState> DeliveryService<S> {
    /// Returns a new builder for a service around the given state.
    pub fn builder(state: Arc<S>) -> DeliveryServiceBuilder<S> {
        DeliveryServiceBuilder::new(state)
    }

    /// Creates a new service. The returned step carries the initial gossip
    /// subscriptions.
    pub fn new<R: Rng>(state: Arc<S>, params: Params, rng: &mut R) -> (Self, Step<S>) {
        let (gossip, gossip_step) = Gossip::new(state.clone(), rng);
        let cascade = CascadeConsensus::new(state.clone(), params.clone());
        let mut service = DeliveryService {
            state,
            params,
            gossip,
            cascade,
            received_proposals: BTreeSet::new(),
            incomplete_commits: BTreeMap::new(),
            future_proposals: Vec::new(),
            future_cascade: Vec::new(),
            proposed_commit: None,
        };
        let mut step = Step::<S>::default();
        service.absorb_gossip(gossip_step, &mut step, rng);
        (service, step)
    }

    /// The current group state.
    pub fn state(&self) -> &Arc<S> {
        &self.state
    }

    /// Returns `true` while a commit may still be proposed for this epoch.
    pub fn can_propose_commit(&self) -> bool {
        !self.cascade.has_started()
    }

    /// The number of future-epoch proposals currently parked.
    pub fn parked_proposals(&self) -> usize {
        self.future_proposals.len()
    }

    /// The number of future-epoch cascade envelopes currently parked.
    pub fn parked_cascade_messages(&self) -> usize {
        self.future_cascade.len()
    }

    /// Handles a wire message received from `sender_id`.
    pub fn handle_message<R: Rng>(
        &mut self,
        sender_id: &S::NodeId,
        message: DdsMessage<S::NodeId>,
        rng: &mut R,
    ) -> Step<S> {
        let mut step = Step::<S>::default();
        match message {
            DdsMessage::Welcome(_) => {
                return Fault::new(sender_id.clone(), FaultKind::UnexpectedWelcome).into();
            }
            DdsMessage::Gossip(gmsg) => {
                let sub = self.gossip.handle_message(sender_id, gmsg, rng);
                self.absorb_gossip(sub, &mut step, rng);
            }
            DdsMessage::Cascade(protected) => {
                self.route_cascade(sender_id.clone(), protected, &mut step, rng);
            }
        }
        step
    }

    /// Handles the expiration of a cascade timer.
    pub fn handle_timer<R: Rng>(&mut self, timer: cascade::Timer, rng: &mut R) -> Step<S> {
        let mut step = Step::<S>::default();
        let sub = self.cascade.handle_timer(timer);
        self.absorb_cascade(sub, &mut step, rng);
        step
    }

    /// Disseminates a local proposal or application message.
    pub fn broadcast<R: Rng>(&mut self, msg: GroupMessage, rng: &mut R) -> Step<S> {
        let sub = self.gossip.dispatch(msg);
        let mut step = Step::<S>::default();
        self.absorb_gossip(sub, &mut step, rng);
        step
    }

    /// Proposes a commit for the current epoch.
    pub fn propose_commit<R: Rng>(
        &mut self,
        commit: GroupMessage,
        welcome: Option<Welcome>,
        rng: &mut R,
    ) -> Result<Step<S>> {
        let cref = message_ref(&*self.state, &commit);
        self.proposed_commit = Some((cref, welcome));
        let sub = self
            .cascade
            .propose_commit(commit, rng)
            .map_err(Error::ProposeCommit)?;
        let mut step = Step::<S>::default();
        self.absorb_cascade(sub, &mut step, rng);
        Ok(step)
    }

    /// Absorbs a gossip step; its outputs are epoch-routed deliveries.
    fn absorb_gossip<R: Rng>(&mut self, sub: gossip::Step<S>, step: &mut Step<S>, rng: &mut R) {
        let outputs = sub_to_main::<S>(sub, step);
        for msg in outputs {
            self.route_proposal(msg, step, rng);
        }
    }

    /// Epoch-routes a gossip-delivered message.
    fn route_proposal<R: Rng>(&mut self, msg: GroupMessage, step: &mut Step<S>, rng: &mut R) {
        if msg.epoch < self.state.epoch() {
            debug!("{:?} dropping stale proposal", self.state.our_id());
        } else if msg.epoch > self.state.epoch() {
            self.future_proposals.push(msg);
        } else {
            self.handle_proposal(msg, step, rng);
        }
    }

    /// Delivers a current-epoch proposal or application message and nudges
    /// any commit waiting on it.
    fn handle_proposal<R: Rng>(&mut self, msg: GroupMessage, step: &mut Step<S>, rng: &mut R) {
        if let Some(pref) = self.state.validate_proposal(&msg) {
            step.output.push(Output::Message(msg));
            self.received_proposals.insert(pref);
            self.unlock_commits(pref, step, rng);
        } else if self.state.validate_application(&msg).is_some() {
            step.output.push(Output::Message(msg));
        } else {
            debug!(
                "{:?} dropping gossip payload that validates neither as \
                 proposal nor as application message",
                self.state.our_id()
            );
        }
    }

    /// Completes commits that were waiting on the given proposal.
    fn unlock_commits<R: Rng>(&mut self, pref: ProposalRef, step: &mut Step<S>, rng: &mut R) {
        let mut completed = Vec::new();
        for (cref, (_, missing)) in &mut self.incomplete_commits {
            missing.remove(&pref);
            if missing.is_empty() {
                completed.push(*cref);
            }
        }
        for cref in completed {
            let (commit, _) = self
                .incomplete_commits
                .remove(&cref)
                .expect("completed commit is present");
            let sub = self.cascade.validate_commit(commit, rng);
            self.absorb_cascade(sub, step, rng);
        }
    }

    /// Epoch-routes a cascade envelope.
    fn route_cascade<R: Rng>(
        &mut self,
        sender_id: S::NodeId,
        protected: GroupMessage,
        step: &mut Step<S>,
        rng: &mut R,
    ) {
        if protected.epoch < self.state.epoch() {
            debug!("{:?} dropping stale cascade message", self.state.our_id());
        } else if protected.epoch > self.state.epoch() {
            self.future_cascade.push((sender_id, protected));
        } else {
            self.handle_cascade_payload(sender_id, protected, step, rng);
        }
    }

    /// Unwraps and dispatches a current-epoch cascade envelope.
    fn handle_cascade_payload<R: Rng>(
        &mut self,
        sender_id: S::NodeId,
        protected: GroupMessage,
        step: &mut Step<S>,
        rng: &mut R,
    ) {
        let plaintext = match self.state.validate_application(&protected) {
            Some(plaintext) => plaintext,
            None => {
                step.fault_log
                    .append(sender_id, FaultKind::InvalidCascadePayload);
                return;
            }
        };
        let message: CascadeMessage = match bincode::deserialize(&plaintext) {
            Ok(message) => message,
            Err(err) => {
                debug!(
                    "{:?} received an undecodable cascade message: {}",
                    self.state.our_id(),
                    err
                );
                step.fault_log
                    .append(sender_id, FaultKind::InvalidCascadePayload);
                return;
            }
        };
        let sub = self.cascade.handle_message(&sender_id, message, rng);
        self.absorb_cascade(sub, step, rng);
    }

    /// Absorbs a cascade step: wraps its messages into protected envelopes
    /// and reacts to candidates and deliveries.
    fn absorb_cascade<R: Rng>(
        &mut self,
        sub: cascade::Step<S>,
        step: &mut Step<S>,
        rng: &mut R,
    ) {
        let state = self.state.clone();
        let outputs = step.extend_with(
            sub,
            FaultKind::CascadeFault,
            |cmsg| {
                let plaintext =
                    bincode::serialize(&cmsg).expect("failed to serialize cascade message");
                DdsMessage::Cascade(state.protect(&plaintext))
            },
            |timer| timer,
        );
        for output in outputs {
            match output {
                cascade::Output::Candidate(commit) => {
                    self.handle_commit_candidate(commit, step, rng)
                }
                cascade::Output::Deliver(commit) => self.apply_commit(commit, step, rng),
            }
        }
    }

    /// Checks a surfaced commit for validity and completeness.
    fn handle_commit_candidate<R: Rng>(
        &mut self,
        commit: GroupMessage,
        step: &mut Step<S>,
        rng: &mut R,
    ) {
        let referenced = match self.state.validate_commit(&commit) {
            Some(referenced) => referenced,
            None => {
                warn!(
                    "{:?} surfaced commit is not valid in this epoch",
                    self.state.our_id()
                );
                return;
            }
        };
        let missing: BTreeSet<ProposalRef> = referenced
            .difference(&self.received_proposals)
            .cloned()
            .collect();
        if missing.is_empty() {
            let sub = self.cascade.validate_commit(commit, rng);
            self.absorb_cascade(sub, step, rng);
        } else {
            let cref = message_ref(&*self.state, &commit);
            self.incomplete_commits.insert(cref, (commit, missing));
        }
    }

    /// Applies the epoch's agreed commit: welcome new members, advance the
    /// state, restart gossip and cascade, and replay parked messages.
    fn apply_commit<R: Rng>(&mut self, commit: GroupMessage, step: &mut Step<S>, rng: &mut R) {
        let (added, removed) = self.state.commit_membership_delta(&commit);
        let next = match self.state.apply_commit(&commit) {
            Ok(next) => Arc::new(next),
            Err(err) => {
                warn!(
                    "{:?} agreed commit failed to apply: {}",
                    self.state.our_id(),
                    err
                );
                return;
            }
        };

        let cref = message_ref(&*self.state, &commit);
        let own_commit = self
            .proposed_commit
            .as_ref()
            .map_or(false, |(proposed, _)| *proposed == cref);
        if own_commit && !added.is_empty() {
            if let Some((_, Some(welcome))) = self.proposed_commit.take() {
                step.messages.push(
                    Target::Nodes(added.iter().cloned().collect())
                        .message(DdsMessage::Welcome(welcome)),
                );
            }
        }

        // Terminal transition: every timer the old cascade may have armed
        // is explicitly cancelled.
        step.timers.extend(
            cascade::ALL_TIMERS
                .iter()
                .cloned()
                .map(TimerCmd::Cancel),
        );

        self.state = next;
        self.received_proposals.clear();
        self.incomplete_commits.clear();
        self.proposed_commit = None;
        self.cascade = CascadeConsensus::new(self.state.clone(), self.params.clone());
        let gossip_step = self
            .gossip
            .start_epoch(self.state.clone(), &removed, rng);
        self.absorb_gossip(gossip_step, step, rng);

        step.output.push(Output::Batch(Batch {
            epoch: self.state.epoch(),
            commit,
            added,
            removed,
            own_commit,
        }));

        self.replay_future(step, rng);
    }

    /// Drains parked messages whose epoch has been reached; drops the ones
    /// the epoch advance made stale.
    fn replay_future<R: Rng>(&mut self, step: &mut Step<S>, rng: &mut R) {
        let epoch = self.state.epoch();
        let proposals = std::mem::replace(&mut self.future_proposals, Vec::new());
        for msg in proposals {
            self.route_proposal(msg, step, rng);
        }
        let cascade_msgs = std::mem::replace(&mut self.future_cascade, Vec::new());
        for (sender_id, protected) in cascade_msgs {
            self.route_cascade(sender_id, protected, step, rng);
        }
        debug!(
            "{:?} epoch {}: {} proposals / {} cascade messages still parked",
            self.state.our_id(),
            epoch,
            self.future_proposals.len(),
            self.future_cascade.len()
        );
    }
}

/// Absorbs a gossip sub-step into a service step, returning the delivered
/// messages.
fn sub_to_main<S: GroupState>(sub: gossip::Step<S>, step: &mut Step<S>) -> Vec<GroupMessage> {
    step.extend_with(sub, FaultKind::GossipFault, DdsMessage::Gossip, |timer| {
        match timer {}
    })
}

impl<S: GroupState> ConsensusProtocol for DeliveryService<S> {
    type NodeId = S::NodeId;
    type Input = Input;
    type Output = Output<S::NodeId>;
    type Message = DdsMessage<S::NodeId>;
    type Timer = cascade::Timer;
    type Error = Error;
    type FaultKind = FaultKind;

    fn handle_input<R: Rng>(&mut self, input: Input, rng: &mut R) -> Result<Step<S>> {
        match input {
            Input::Broadcast(msg) => Ok(self.broadcast(msg, rng)),
            Input::ProposeCommit { commit, welcome } => {
                self.propose_commit(commit, welcome, rng)
            }
        }
    }

    fn handle_message<R: Rng>(
        &mut self,
        sender_id: &Self::NodeId,
        message: Self::Message,
        rng: &mut R,
    ) -> Result<Step<S>> {
        Ok(self.handle_message(sender_id, message, rng))
    }

    fn handle_timer<R: Rng>(&mut self, timer: Self::Timer, rng: &mut R) -> Result<Step<S>> {
        Ok(self.handle_timer(timer, rng))
    }

    fn terminated(&self) -> bool {
        false
    }

    fn our_id(&self) -> &Self::NodeId {
        self.state.our_id()
    }
}

impl<S: GroupState> fmt::Debug for DeliveryService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> result::Result<(), fmt::Error> {
        f.debug_struct("DeliveryService")
            .field("our_id", self.state.our_id())
            .field("epoch", &self.state.epoch())
            .field("proposals", &self.received_proposals.len())
            .field("incomplete_commits", &self.incomplete_commits.len())
            .field("future_proposals", &self.future_proposals.len())
            .field("future_cascade", &self.future_cascade.len())
            .finish()
    }
}
