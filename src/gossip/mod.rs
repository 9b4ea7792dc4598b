//! Best-effort dissemination of proposals and application messages.
//!
//! Commits never travel through this module; they go through the cascade.
//! Every member keeps a small *sample* of peers it forwards to. New members
//! subscribe to randomly drawn peers, and a peer replays its cached messages
//! of the current epoch to every new subscriber, so late subscribers catch
//! up on what the epoch has seen so far.

mod gossip;
mod message;

mod error;

pub use self::error::FaultKind;
pub use self::gossip::{target_sample_size, Gossip, Step};
pub use self::message::GossipMessage;
