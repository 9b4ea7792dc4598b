use std::collections::VecDeque;
use std::sync::Arc;
use std::{fmt, result};

use log::{debug, info, warn};
use rand::Rng;

use super::{Cac2Content, CascadeMessage, Error, FaultKind, Params, Result};
use crate::cac::{self, CacBroadcast, CacContribution, CacSignature};
use crate::full_consensus::{self, FullConsensus};
use crate::group_state::{message_ref, GroupMessage, GroupState, MessageRef};
use crate::restrained_consensus::{self, ConflictSet, RestrainedConsensus};
use crate::{ConsensusProtocol, TimerCmd};

/// A `CascadeConsensus` step.
pub type Step<S> =
    crate::Step<CascadeMessage, Output, <S as GroupState>::NodeId, FaultKind, Timer>;

/// The timers the cascade and its sub-protocols arm.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timer {
    /// Armed by conflict non-participants: if the restrained consensus does
    /// not conclude within three round trips, fall through as if it aborted.
    RcFallback,
    /// A restrained-consensus timer.
    Rc(restrained_consensus::Timer),
    /// A full-consensus timer.
    Consensus(full_consensus::Timer),
}

/// All timer values the cascade can have armed, for wholesale cancellation
/// on epoch advance.
pub(crate) const ALL_TIMERS: [Timer; 5] = [
    Timer::RcFallback,
    Timer::Rc(restrained_consensus::Timer::Abort),
    Timer::Rc(restrained_consensus::Timer::Participate),
    Timer::Consensus(full_consensus::Timer::Propose),
    Timer::Consensus(full_consensus::Timer::Forward),
];

/// The inputs a `CascadeConsensus` accepts.
#[derive(Debug)]
pub enum Input {
    /// Broadcast our own commit.
    Propose(GroupMessage),
    /// The delivery facade confirmed that a surfaced commit is valid and
    /// complete.
    Validate(GroupMessage),
}

/// The outputs of a `CascadeConsensus`.
#[derive(Clone, Debug, PartialEq)]
pub enum Output {
    /// A commit surfaced by the broadcast; the facade must check validity
    /// and completeness and feed back `Input::Validate` when satisfied.
    Candidate(GroupMessage),
    /// The epoch's agreed commit.
    Deliver(GroupMessage),
}

/// Cascade consensus instance. One instance serves one epoch; the delivery
/// facade replaces it when the epoch advances.
pub struct CascadeConsensus<S: GroupState> {
    state: Arc<S>,
    params: Params,
    /// First CAC instance, over commits.
    cac1: CacBroadcast<GroupMessage, S>,
    /// Second CAC instance, over conflict outcomes.
    cac2: CacBroadcast<Cac2Content, S>,
    restrained: RestrainedConsensus<S>,
    consensus: FullConsensus<Cac2Content, S>,
    /// References CAC1 delivered, in delivery order.
    delivered_refs: Vec<MessageRef>,
    /// Whether the non-participant fallback timer is armed.
    rc_fallback_armed: bool,
    /// Whether we already handed a value to the full consensus.
    consensus_proposed: bool,
}

impl<S: GroupState> CascadeConsensus<S> {
    /// Creates a new cascade for the state's current epoch.
    pub fn new(state: Arc<S>, params: Params) -> Self {
        let cac1 = CacBroadcast::new(state.clone(), params.cac_k);
        let cac2 = CacBroadcast::new(state.clone(), params.cac_k);
        let restrained = RestrainedConsensus::new(state.clone(), params.rtt, params.rc_delay);
        let consensus = FullConsensus::new(state.clone(), params.rtt);
        CascadeConsensus {
            state,
            params,
            cac1,
            cac2,
            restrained,
            consensus,
            delivered_refs: Vec::new(),
            rc_fallback_armed: false,
            consensus_proposed: false,
        }
    }

    /// Returns `true` once the commit broadcast has started, i.e. it is too
    /// late to propose a commit for this epoch.
    pub fn has_started(&self) -> bool {
        self.cac1.has_started()
    }

    /// Proposes our own commit for this epoch.
    pub fn propose_commit<R: Rng>(&mut self, commit: GroupMessage, rng: &mut R) -> Result<Step<S>> {
        let sub = self.cac1.broadcast(commit).map_err(Error::ProposeCommit)?;
        let mut step = Step::<S>::default();
        self.absorb_cac1(sub, &mut step, rng);
        Ok(step)
    }

    /// Marks a surfaced commit as validated by the facade.
    pub fn validate_commit<R: Rng>(&mut self, commit: GroupMessage, rng: &mut R) -> Step<S> {
        let sub = self.cac1.validate(commit);
        let mut step = Step::<S>::default();
        self.absorb_cac1(sub, &mut step, rng);
        step
    }

    /// Handles a message received from `sender_id`.
    pub fn handle_message<R: Rng>(
        &mut self,
        sender_id: &S::NodeId,
        message: CascadeMessage,
        rng: &mut R,
    ) -> Step<S> {
        let mut step = Step::<S>::default();
        match message {
            CascadeMessage::Cac(msg) => {
                let sub = self.cac1.handle_message(sender_id, msg);
                self.absorb_cac1(sub, &mut step, rng);
            }
            CascadeMessage::Rc(msg) => {
                let sub = self.restrained.handle_message(sender_id, msg);
                self.absorb_rc(sub, &mut step);
            }
            CascadeMessage::Cac2(msg) => {
                let sub = self.cac2.handle_message(sender_id, msg);
                self.absorb_cac2(sub, &mut step);
            }
            CascadeMessage::Consensus(msg) => {
                let sub = self.consensus.handle_message(sender_id, msg);
                self.absorb_consensus(sub, &mut step);
            }
        }
        step
    }

    /// Handles the expiration of a cascade timer.
    pub fn handle_timer(&mut self, timer: Timer) -> Step<S> {
        let mut step = Step::<S>::default();
        match timer {
            Timer::RcFallback => {
                self.rc_fallback_armed = false;
                self.broadcast_own_outcome(&mut step);
            }
            Timer::Rc(timer) => {
                let sub = self.restrained.handle_timer(timer);
                self.absorb_rc(sub, &mut step);
            }
            Timer::Consensus(timer) => {
                let sub = self.consensus.handle_timer(timer);
                self.absorb_consensus(sub, &mut step);
            }
        }
        step
    }

    /// Absorbs a CAC1 step, reacting to candidates and deliveries.
    fn absorb_cac1<R: Rng>(
        &mut self,
        sub: cac::Step<GroupMessage, S>,
        step: &mut Step<S>,
        rng: &mut R,
    ) {
        let outputs = step.extend_with(sub, FaultKind::CacFault, CascadeMessage::Cac, |timer| {
            match timer {}
        });
        for output in outputs {
            match output {
                cac::Output::Candidate(commit) => step.output.push(Output::Candidate(commit)),
                cac::Output::Deliver {
                    payload,
                    conflict,
                    signatures,
                } => self.handle_cac1_delivery(payload, conflict, signatures, step, rng),
            }
        }
    }

    fn handle_cac1_delivery<R: Rng>(
        &mut self,
        commit: GroupMessage,
        conflict: Vec<MessageRef>,
        signatures: Vec<CacSignature>,
        step: &mut Step<S>,
        rng: &mut R,
    ) {
        self.delivered_refs.push(message_ref(&*self.state, &commit));

        if conflict.len() == 1 {
            step.output.push(Output::Deliver(commit));
            return;
        }
        info!(
            "{:?} CAC1 delivered a conflict between {} commits",
            self.state.our_id(),
            conflict.len()
        );

        if let Some(n) = self.params.rc_crash {
            if rng.gen_range(0, n) == 0 {
                info!("TEST_RC_CRASH: exiting before restrained consensus");
                std::process::exit(0);
            }
        }

        if self.state.commit_sender(&commit) == Some(self.state.our_index()) {
            let conflict_set = self.sender_conflict_set(&conflict);
            let sub = self.restrained.propose(conflict_set, &signatures);
            self.absorb_rc(sub, step);
        } else if !self.rc_fallback_armed {
            self.rc_fallback_armed = true;
            step.timers
                .push(TimerCmd::Schedule(Timer::RcFallback, 3 * self.params.rtt));
        }
    }

    /// Pairs each conflicting reference with its commit's sender.
    fn sender_conflict_set(&self, conflict: &[MessageRef]) -> ConflictSet {
        let mut conflict_set = Vec::new();
        for mref in conflict {
            match self
                .cac1
                .payloads()
                .get(mref)
                .and_then(|commit| self.state.commit_sender(commit))
            {
                Some(sender) => conflict_set.push((sender, *mref)),
                None => warn!(
                    "{:?} conflicting commit {:?} has no known sender",
                    self.state.our_id(),
                    mref
                ),
            }
        }
        conflict_set
    }

    /// Absorbs a restrained-consensus step.
    fn absorb_rc(&mut self, sub: restrained_consensus::Step<S>, step: &mut Step<S>) {
        let outputs = step.extend_with(sub, FaultKind::RcFault, CascadeMessage::Rc, Timer::Rc);
        for output in outputs {
            match output {
                restrained_consensus::Output::Decide {
                    refs,
                    sigs,
                    retractions,
                } => {
                    let content = Cac2Content::new(refs, sigs, retractions);
                    self.broadcast_outcome(content, step);
                }
                restrained_consensus::Output::Abort => self.broadcast_own_outcome(step),
            }
        }
    }

    /// Feeds an agreed restrained-consensus outcome into CAC2.
    fn broadcast_outcome(&mut self, content: Cac2Content, step: &mut Step<S>) {
        match self.cac2.broadcast(content) {
            Ok(sub) => self.absorb_cac2(sub, step),
            // CAC2 already signed a statement; our outcome no longer
            // matters.
            Err(cac::Error::MultipleInputs) => {
                debug!("{:?} CAC2 already started", self.state.our_id())
            }
        }
    }

    /// ⊥ continuation: feeds our own delivered set into CAC2.
    fn broadcast_own_outcome(&mut self, step: &mut Step<S>) {
        let refs = self.delivered_refs.clone();
        let sigs = self
            .cac1
            .valid_signatures()
            .into_iter()
            .map(|sig| sig.auth)
            .collect();
        let content = Cac2Content::new(refs, sigs, Vec::new());
        self.broadcast_outcome(content, step);
    }

    /// Absorbs a CAC2 step: candidates are validated right away, deliveries
    /// finish the epoch or escalate to the full consensus.
    fn absorb_cac2(&mut self, sub: cac::Step<Cac2Content, S>, step: &mut Step<S>) {
        let mut outputs: VecDeque<cac::Output<Cac2Content>> = step
            .extend_with(sub, FaultKind::CacFault, CascadeMessage::Cac2, |timer| {
                match timer {}
            })
            .into();
        while let Some(output) = outputs.pop_front() {
            match output {
                cac::Output::Candidate(content) => {
                    let sub = self.cac2.validate(content);
                    outputs.extend(step.extend_with(
                        sub,
                        FaultKind::CacFault,
                        CascadeMessage::Cac2,
                        |timer| match timer {},
                    ));
                }
                cac::Output::Deliver {
                    payload, conflict, ..
                } => self.handle_cac2_delivery(payload, conflict, step),
            }
        }
    }

    fn handle_cac2_delivery(
        &mut self,
        content: Cac2Content,
        conflict: Vec<MessageRef>,
        step: &mut Step<S>,
    ) {
        if self.rc_fallback_armed {
            self.rc_fallback_armed = false;
            step.timers.push(TimerCmd::Cancel(Timer::RcFallback));
        }

        if conflict.len() == 1 {
            debug!(
                "{:?} CAC2 agreement on a set of {} commits",
                self.state.our_id(),
                content.conflicting.len()
            );
            self.deliver_chosen(&content, step);
        } else if !self.consensus_proposed {
            self.consensus_proposed = true;
            info!(
                "{:?} CAC2 delivered a conflict between {} outcomes",
                self.state.our_id(),
                conflict.len()
            );
            let sub = self.consensus.propose(content);
            self.absorb_consensus(sub, step);
        }
    }

    /// Absorbs a full-consensus step; its decision ends the epoch.
    fn absorb_consensus(&mut self, sub: full_consensus::Step<Cac2Content, S>, step: &mut Step<S>) {
        let outputs = step.extend_with(
            sub,
            FaultKind::ConsensusFault,
            CascadeMessage::Consensus,
            Timer::Consensus,
        );
        for content in outputs {
            info!("{:?} full consensus agreement reached", self.state.our_id());
            self.deliver_chosen(&content, step);
        }
    }

    /// Delivers the chosen commit among the known commits an agreed content
    /// references.
    fn deliver_chosen(&mut self, content: &Cac2Content, step: &mut Step<S>) {
        let mut choices: Vec<&GroupMessage> = Vec::new();
        for mref in &content.conflicting {
            match self.cac1.payloads().get(mref) {
                Some(commit) => choices.push(commit),
                None => warn!(
                    "{:?} agreed set references unknown commit {:?}",
                    self.state.our_id(),
                    mref
                ),
            }
        }
        match <GroupMessage as CacContribution<S>>::choose(&*self.state, choices) {
            Some(commit) => step.output.push(Output::Deliver(commit.clone())),
            None => warn!(
                "{:?} agreed set contains no known commit",
                self.state.our_id()
            ),
        }
    }
}

impl<S: GroupState> ConsensusProtocol for CascadeConsensus<S> {
    type NodeId = S::NodeId;
    type Input = Input;
    type Output = Output;
    type Message = CascadeMessage;
    type Timer = Timer;
    type Error = Error;
    type FaultKind = FaultKind;

    fn handle_input<R: Rng>(&mut self, input: Input, rng: &mut R) -> Result<Step<S>> {
        match input {
            Input::Propose(commit) => self.propose_commit(commit, rng),
            Input::Validate(commit) => Ok(self.validate_commit(commit, rng)),
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

    fn handle_timer<R: Rng>(&mut self, timer: Timer, _rng: &mut R) -> Result<Step<S>> {
        Ok(self.handle_timer(timer))
    }

    fn terminated(&self) -> bool {
        false
    }

    fn our_id(&self) -> &Self::NodeId {
        self.state.our_id()
    }
}

impl<S: GroupState> fmt::Debug for CascadeConsensus<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> result::Result<(), fmt::Error> {
        f.debug_struct("CascadeConsensus")
            .field("our_id", self.state.our_id())
            .field("epoch", &self.state.epoch())
            .field("started", &self.has_started())
            .field("delivered_refs", &self.delivered_refs.len())
            .finish()
    }
}
