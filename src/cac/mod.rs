//! Consistent Authenticated Communication: a Byzantine reliable broadcast
//! with piggybacked signature sets.
//!
//! Members sign `WITNESS` and `READY` statements about message references;
//! each outgoing message carries every valid signature seen so far, so the
//! signature sets converge even over lossy gossip. A message is delivered
//! once it accumulates a ready quorum, together with the *conflict set* of
//! all references that gathered at least `k` witnesses. With at most `k`
//! well-behaved concurrent broadcasters the conflict set is a singleton; the
//! cascade resolves larger ones downstream.
//!
//! The broadcast is instantiated twice by the cascade: over commits, and
//! over the conflict outcomes fed back from the restrained consensus.

mod cac_broadcast;
mod error;
mod message;
mod signature;

pub use self::cac_broadcast::{CacBroadcast, Input, Output, Step};
pub use self::error::{Error, FaultKind, Result};
pub use self::message::CacMessage;
pub use self::signature::{CacSignature, SigRole, AUTH_REF_LABEL};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

use crate::group_state::{GroupState, MessageRef};

/// A payload type that can be broadcast through a [`CacBroadcast`] instance.
pub trait CacContribution<S: GroupState>:
    Clone + Debug + Eq + Send + Sync + Serialize + DeserializeOwned
{
    /// The domain label under which payloads are content-addressed.
    const REF_LABEL: &'static str;

    /// Picks which of several validated candidates to witness. The choice
    /// must be deterministic in its inputs.
    fn choose<'a, I>(state: &S, candidates: I) -> Option<&'a Self>
    where
        I: IntoIterator<Item = &'a Self>,
        Self: 'a;
}

/// The content-addressed reference of a contribution.
pub fn contribution_ref<S: GroupState, C: CacContribution<S>>(state: &S, c: &C) -> MessageRef {
    let encoded = bincode::serialize(c).expect("failed to serialize contribution");
    state.msg_ref(C::REF_LABEL, &encoded)
}
