//! Common supertraits and the step type shared by all protocol machines.
//!
//! Every protocol in this crate is a sans-IO state machine: it consumes an
//! input, a peer message or a timer expiration, and returns a [`Step`]
//! describing everything the caller must do on its behalf — messages to
//! send, outputs to hand to the upper layer, faults to record and timers to
//! arm or cancel. The machines never touch sockets or the clock.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::iter::once;
use std::time::Duration;

use failure::Fail;
use rand::Rng;

use crate::fault_log::{Fault, FaultLog};

/// A peer node's unique identifier.
pub trait NodeIdT: Eq + Ord + Clone + Debug + Hash + Send + Sync {}
impl<N> NodeIdT for N where N: Eq + Ord + Clone + Debug + Hash + Send + Sync {}

/// Messages exchanged between instances of a protocol.
pub trait Message: Debug + Send + Sync {}
impl<M> Message for M where M: Debug + Send + Sync {}

/// A timer value a machine can arm. Cancellation is by value equality, so a
/// machine re-arming the same timer value replaces the pending one.
pub trait TimerT: Eq + Clone + Debug + Send + Sync {}
impl<T> TimerT for T where T: Eq + Clone + Debug + Send + Sync {}

/// The timer type of machines that never arm a timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoTimer {}

/// The intended recipient(s) of a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target<N> {
    /// The message must be sent to all remote nodes.
    All,
    /// The message must be sent to all remote nodes except the given ones.
    AllExcept(BTreeSet<N>),
    /// The message must be sent to each of the given nodes.
    Nodes(BTreeSet<N>),
    /// The message must be sent to the given node.
    Node(N),
}

impl<N> Target<N> {
    /// Returns a `TargetedMessage` with this target, and the given message.
    pub fn message<M>(self, message: M) -> TargetedMessage<M, N> {
        TargetedMessage {
            target: self,
            message,
        }
    }
}

/// A message along with its intended recipient(s).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetedMessage<M, N> {
    /// The node or nodes the message is addressed to.
    pub target: Target<N>,
    /// The content of the message.
    pub message: M,
}

impl<M, N> TargetedMessage<M, N> {
    /// Applies the given transformation of messages, preserving the target.
    pub fn map<M2, F: Fn(M) -> M2>(self, f: F) -> TargetedMessage<M2, N> {
        TargetedMessage {
            target: self.target,
            message: f(self.message),
        }
    }
}

/// A request to the driver to arm or cancel a timeout on a machine's behalf.
///
/// Timer values are first-class data: the driver keys each scheduled timer by
/// a monotonically allocated ID, fires it at most once, and feeds the
/// expiration back through `ConsensusProtocol::handle_timer`. Machines must
/// cancel every timer they armed on each of their terminal transitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimerCmd<T> {
    /// Arm `timer` to fire after `delay`.
    Schedule(T, Duration),
    /// Cancel any pending occurrence of `timer`.
    Cancel(T),
}

impl<T> TimerCmd<T> {
    /// Applies the given transformation of timer values.
    pub fn map<T2, F: Fn(T) -> T2>(self, f: F) -> TimerCmd<T2> {
        match self {
            TimerCmd::Schedule(timer, delay) => TimerCmd::Schedule(f(timer), delay),
            TimerCmd::Cancel(timer) => TimerCmd::Cancel(f(timer)),
        }
    }
}

/// The result of one step of a protocol machine.
///
/// A step must never be dropped: the caller is responsible for dispatching
/// its messages, acting on its outputs and timer commands, and propagating
/// its fault log.
#[must_use = "The protocol step result must be used."]
#[derive(Debug)]
pub struct Step<M, O, N, F, T>
where
    F: Fail,
{
    /// Values output to the caller of the machine.
    pub output: Vec<O>,
    /// Peer misbehaviour observed during the step.
    pub fault_log: FaultLog<N, F>,
    /// Messages to be dispatched to other nodes.
    pub messages: Vec<TargetedMessage<M, N>>,
    /// Timers to arm or cancel.
    pub timers: Vec<TimerCmd<T>>,
}

impl<M, O, N, F, T> Default for Step<M, O, N, F, T>
where
    F: Fail,
{
    fn default() -> Self {
        Step {
            output: Vec::new(),
            fault_log: FaultLog::default(),
            messages: Vec::new(),
            timers: Vec::new(),
        }
    }
}

impl<M, O, N, F, T> Step<M, O, N, F, T>
where
    F: Fail,
{
    /// Returns the same step, with the given additional output.
    pub fn with_output<U: Into<Option<O>>>(mut self, output: U) -> Self {
        self.output.extend(output.into());
        self
    }

    /// Adds the outputs, fault logs, messages and timer commands of `other`
    /// to `self`.
    pub fn extend(&mut self, other: Self) {
        self.output.extend(other.output);
        self.fault_log.extend(other.fault_log);
        self.messages.extend(other.messages);
        self.timers.extend(other.timers);
    }

    /// Extends this step with `other` and returns the result.
    pub fn join(mut self, other: Self) -> Self {
        self.extend(other);
        self
    }

    /// Absorbs the messages, faults and timer commands of a sub-machine's
    /// step, given conversions for each, and returns the sub-machine's
    /// outputs for the caller to interpret.
    pub fn extend_with<M2, O2, F2, T2, FF, FM, FT>(
        &mut self,
        other: Step<M2, O2, N, F2, T2>,
        f_fault: FF,
        f_msg: FM,
        f_timer: FT,
    ) -> Vec<O2>
    where
        F2: Fail,
        FF: Fn(F2) -> F,
        FM: Fn(M2) -> M,
        FT: Fn(T2) -> T,
    {
        self.fault_log.extend(other.fault_log.map(f_fault));
        self.messages
            .extend(other.messages.into_iter().map(|tm| tm.map(&f_msg)));
        self.timers
            .extend(other.timers.into_iter().map(|tc| tc.map(&f_timer)));
        other.output
    }

    /// Converts this step into one of another protocol, given conversions for
    /// outputs, faults, messages and timers.
    pub fn map<M2, O2, F2, T2, FO, FF, FM, FT>(
        self,
        f_out: FO,
        f_fault: FF,
        f_msg: FM,
        f_timer: FT,
    ) -> Step<M2, O2, N, F2, T2>
    where
        F2: Fail,
        FO: Fn(O) -> O2,
        FF: Fn(F) -> F2,
        FM: Fn(M) -> M2,
        FT: Fn(T) -> T2,
    {
        Step {
            output: self.output.into_iter().map(f_out).collect(),
            fault_log: self.fault_log.map(f_fault),
            messages: self.messages.into_iter().map(|tm| tm.map(&f_msg)).collect(),
            timers: self.timers.into_iter().map(|tc| tc.map(&f_timer)).collect(),
        }
    }

    /// Returns `true` if there are no outputs, faults, messages or timer
    /// commands.
    pub fn is_empty(&self) -> bool {
        self.output.is_empty()
            && self.fault_log.is_empty()
            && self.messages.is_empty()
            && self.timers.is_empty()
    }
}

impl<M, O, N, F: Fail, T> From<FaultLog<N, F>> for Step<M, O, N, F, T> {
    fn from(fault_log: FaultLog<N, F>) -> Self {
        Step {
            fault_log,
            ..Step::default()
        }
    }
}

impl<M, O, N, F: Fail, T> From<Fault<N, F>> for Step<M, O, N, F, T> {
    fn from(fault: Fault<N, F>) -> Self {
        Step {
            fault_log: fault.into(),
            ..Step::default()
        }
    }
}

impl<M, O, N, F: Fail, T> From<TargetedMessage<M, N>> for Step<M, O, N, F, T> {
    fn from(msg: TargetedMessage<M, N>) -> Self {
        Step {
            messages: once(msg).collect(),
            ..Step::default()
        }
    }
}

impl<M, O, N, F: Fail, T> From<TimerCmd<T>> for Step<M, O, N, F, T> {
    fn from(cmd: TimerCmd<T>) -> Self {
        Step {
            timers: once(cmd).collect(),
            ..Step::default()
        }
    }
}

/// The step type of a protocol machine `D`.
pub type CpStep<D> = Step<
    <D as ConsensusProtocol>::Message,
    <D as ConsensusProtocol>::Output,
    <D as ConsensusProtocol>::NodeId,
    <D as ConsensusProtocol>::FaultKind,
    <D as ConsensusProtocol>::Timer,
>;

/// A distributed protocol that defines a message flow.
pub trait ConsensusProtocol: Send + Sync {
    /// Unique node identifier.
    type NodeId: NodeIdT;
    /// The input provided by the user.
    type Input;
    /// The output type. Some protocols output once, others repeatedly.
    type Output;
    /// The messages exchanged between instances on the participating nodes.
    type Message: Message;
    /// The timers this protocol arms, if any.
    type Timer: TimerT;
    /// The errors that can occur during execution.
    type Error: Fail;
    /// The kinds of peer misbehaviour this protocol can observe.
    type FaultKind: Fail;

    /// Handles an input provided by the user of this protocol instance.
    fn handle_input<R: Rng>(
        &mut self,
        input: Self::Input,
        rng: &mut R,
    ) -> Result<CpStep<Self>, Self::Error>
    where
        Self: Sized;

    /// Handles a message received from the node `sender_id`.
    fn handle_message<R: Rng>(
        &mut self,
        sender_id: &Self::NodeId,
        message: Self::Message,
        rng: &mut R,
    ) -> Result<CpStep<Self>, Self::Error>
    where
        Self: Sized;

    /// Handles the expiration of a timer this instance armed.
    fn handle_timer<R: Rng>(
        &mut self,
        _timer: Self::Timer,
        _rng: &mut R,
    ) -> Result<CpStep<Self>, Self::Error>
    where
        Self: Sized,
    {
        Ok(Step::default())
    }

    /// Returns `true` if execution has completed and the instance can be
    /// dropped.
    fn terminated(&self) -> bool;

    /// Returns this node's own ID.
    fn our_id(&self) -> &Self::NodeId;
}
