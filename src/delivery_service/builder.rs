use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use super::{DeliveryService, Step};
use crate::cascade::Params;
use crate::group_state::GroupState;

/// A builder of a `DeliveryService`: configures the cascade parameters and
/// creates the instance.
pub struct DeliveryServiceBuilder<S: GroupState> {
    state: Arc<S>,
    params: Params,
}

impl<S: GroupState> DeliveryServiceBuilder<S> {
    /// Returns a new builder with a half-second round-trip estimate and no
    /// test knobs.
    pub fn new(state: Arc<S>) -> Self {
        DeliveryServiceBuilder {
            state,
            params: Params::new(Duration::from_millis(500)),
        }
    }

    /// Sets the round-trip estimate to the farthest member.
    pub fn rtt(mut self, rtt: Duration) -> Self {
        self.params.rtt = rtt;
        self
    }

    /// Replaces the cascade parameters wholesale.
    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Creates the service. The returned step carries the initial gossip
    /// subscriptions.
    pub fn build<R: Rng>(self, rng: &mut R) -> (DeliveryService<S>, Step<S>) {
        DeliveryService::new(self.state, self.params, rng)
    }
}
