//! The cascade consensus: linearising commits without a sequencer.
//!
//! Four machines run in cascade, cheapest first. Commits are broadcast
//! through a first CAC instance; if it delivers a singleton conflict set the
//! commit is final. Otherwise the *senders* of the conflicting commits run a
//! restrained consensus among themselves, everyone feeds the outcome (or ⊥)
//! into a second CAC instance, and any disagreement that survives is settled
//! by a single-shot PBFT. This module owns the four machines, wires their
//! outputs together and manages the fallback timeouts.

mod cascade;
mod error;
mod message;

pub(crate) use self::cascade::ALL_TIMERS;
pub use self::cascade::{CascadeConsensus, Input, Output, Step, Timer};
pub use self::error::{Error, FaultKind, Result};
pub use self::message::{Cac2Content, CascadeMessage};

use std::time::Duration;

/// Cascade configuration.
#[derive(Clone, Debug)]
pub struct Params {
    /// Round-trip estimate to the farthest member; all cascade timeouts are
    /// multiples of it.
    pub rtt: Duration,
    /// The CAC concurrency parameter `k`.
    pub cac_k: usize,
    /// Test knob: delay the initial restrained-consensus broadcast.
    pub rc_delay: Option<Duration>,
    /// Test knob: on a CAC1 conflict, exit the process with probability
    /// `1/n` before the restrained consensus starts.
    pub rc_crash: Option<u32>,
}

impl Params {
    /// Production parameters: `k = 1`, no test knobs.
    pub fn new(rtt: Duration) -> Self {
        Params {
            rtt,
            cac_k: 1,
            rc_delay: None,
            rc_crash: None,
        }
    }

    /// Parameters with the `TEST_RC_DELAY` and `TEST_RC_CRASH` environment
    /// knobs applied.
    pub fn from_env(rtt: Duration) -> Self {
        let mut params = Params::new(rtt);
        if let Some(ms) = std::env::var("TEST_RC_DELAY")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            params.rc_delay = Some(Duration::from_millis(ms));
        }
        if let Some(n) = std::env::var("TEST_RC_CRASH")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            params.rc_crash = Some(n);
        }
        params
    }
}
