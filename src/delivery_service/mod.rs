//! The delivery service facade.
//!
//! Routes wire messages to the gossip broadcast or the cascade, enforces
//! epoch discipline (stale messages are dropped, future ones parked and
//! replayed exactly when their epoch is reached), tracks commit
//! completeness against the proposals seen so far, and applies agreed
//! commits to the group state — advancing the epoch, re-keying the gossip
//! sample and replacing the cascade.

mod batch;
mod builder;
mod delivery_service;
mod error;
mod message;

pub use self::batch::Batch;
pub use self::builder::DeliveryServiceBuilder;
pub use self::delivery_service::{DeliveryService, Input, Output, Step};
pub use self::error::{Error, FaultKind, Result};
pub use self::message::DdsMessage;
