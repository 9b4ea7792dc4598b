//! # cascade-dds
//!
//! A Byzantine-tolerant distributed delivery service for continuous group
//! key agreement: an open-membership group keeps a shared cryptographic
//! state whose evolution is driven by commits, without a central sequencer
//! and despite up to *t* Byzantine members.
//!
//! Proposals and application messages travel best-effort over a sampled
//! [`gossip`] broadcast. Commits go through the [`cascade`]: a CAC
//! (Consistent Authenticated Communication) reliable broadcast first; if
//! concurrent commits conflict, a [`restrained_consensus`] among the
//! conflicting senders; its outcome through a second CAC instance; and a
//! single-shot [`full_consensus`] (simplified PBFT) as the last resort.
//! Cheap optimistic paths run first, stronger agreement only when needed —
//! every correct member delivers the same sequence of commits.
//!
//! All protocols are sans-IO state machines (see [`ConsensusProtocol`] and
//! [`Step`]): they return the messages to send, the outputs to act on, a
//! log of observed peer faults and timer commands, and never touch sockets
//! or clocks themselves. The [`delivery_service`] module composes the full
//! stack for one group member; the [`network`] module and the `client` /
//! `directory` binaries provide the IO driver around it.
//!
//! The group's cryptography is consumed only through the opaque
//! [`group_state::GroupState`] trait. A deterministic, **non-cryptographic**
//! implementation ([`group_state::BasicGroupState`]) backs the tests and the
//! demo client.

pub mod cac;
pub mod cascade;
pub mod delivery_service;
pub mod fault_log;
mod fmt;
pub mod full_consensus;
pub mod gossip;
pub mod group_state;
pub mod network;
pub mod quorum;
pub mod restrained_consensus;
mod traits;
pub mod util;

pub use crate::fault_log::{Fault, FaultLog};
pub use crate::quorum::QuorumParams;
pub use crate::traits::{
    ConsensusProtocol, CpStep, Message, NoTimer, NodeIdT, Step, Target, TargetedMessage, TimerCmd,
    TimerT,
};
