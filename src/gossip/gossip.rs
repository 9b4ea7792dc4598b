use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::{fmt, result};

use log::debug;
use rand::seq::IteratorRandom;
use rand::Rng;

use super::{FaultKind, GossipMessage};
use crate::fault_log::Fault;
use crate::group_state::{message_ref, GroupMessage, GroupState, MessageRef};
use crate::{NoTimer, Target};

/// A `Gossip` step, containing one output per message delivered this step.
pub type Step<S> = crate::Step<
    GossipMessage<<S as GroupState>::NodeId>,
    GroupMessage,
    <S as GroupState>::NodeId,
    FaultKind,
    NoTimer,
>;

/// The minimum sample size.
const MINIMUM_PEERS: usize = 6;

/// The target sample size for a group of `n` members: `log10(n)` rounded up,
/// but never less than six.
pub fn target_sample_size(n: usize) -> usize {
    MINIMUM_PEERS.max((n as f64).log10().ceil() as usize)
}

/// Gossip broadcast instance.
///
/// The sample persists across epochs; only the message cache is per-epoch.
pub struct Gossip<S: GroupState> {
    /// Shared group state.
    state: Arc<S>,
    /// The peers we forward to and that forward to us.
    sample: BTreeSet<S::NodeId>,
    /// Every message delivered in the current epoch, by reference.
    received: BTreeMap<MessageRef, GroupMessage>,
}

impl<S: GroupState> Gossip<S> {
    /// Creates a new gossip instance and subscribes to an initial sample.
    pub fn new<R: Rng>(state: Arc<S>, rng: &mut R) -> (Self, Step<S>) {
        let mut instance = Gossip {
            state,
            sample: BTreeSet::new(),
            received: BTreeMap::new(),
        };
        let step = instance.refill_sample(rng);
        (instance, step)
    }

    /// Moves the instance into a new epoch: clears the cache, drops removed
    /// members from the sample and refills it if below target.
    pub fn start_epoch<R: Rng>(
        &mut self,
        state: Arc<S>,
        removed: &[S::NodeId],
        rng: &mut R,
    ) -> Step<S> {
        self.state = state;
        self.received.clear();
        for id in removed {
            self.sample.remove(id);
        }
        self.refill_sample(rng)
    }

    /// The current sample.
    pub fn sample(&self) -> &BTreeSet<S::NodeId> {
        &self.sample
    }

    /// Disseminates a local proposal or application message: caches it, fans
    /// it out to the sample and delivers it to the upper layer.
    pub fn dispatch(&mut self, msg: GroupMessage) -> Step<S> {
        let mref = message_ref(&*self.state, &msg);
        self.received.insert(mref, msg.clone());

        let mut step = Step::<S>::default();
        if !self.sample.is_empty() {
            step.messages.push(
                Target::Nodes(self.sample.clone()).message(GossipMessage::Gossip(msg.clone())),
            );
        }
        step.output.push(msg);
        step
    }

    /// Handles a message received from `sender_id`.
    pub fn handle_message<R: Rng>(
        &mut self,
        sender_id: &S::NodeId,
        message: GossipMessage<S::NodeId>,
        _rng: &mut R,
    ) -> Step<S> {
        match message {
            GossipMessage::Gossip(msg) => {
                if self.received.contains_key(&message_ref(&*self.state, &msg)) {
                    Step::<S>::default()
                } else {
                    self.dispatch(msg)
                }
            }
            GossipMessage::Subscribe(id) => self.handle_subscribe(sender_id, id),
        }
    }

    /// Adds a subscriber to the sample and replays the epoch's cache to it.
    fn handle_subscribe(&mut self, sender_id: &S::NodeId, id: S::NodeId) -> Step<S> {
        if id == *self.state.our_id() || self.sample.contains(&id) {
            return Step::<S>::default();
        }
        if !self.state.members(false).contains(&id) {
            return Fault::new(sender_id.clone(), FaultKind::UnknownSubscriber).into();
        }
        debug!(
            "{:?} gossip: new subscriber {:?}, replaying {} messages",
            self.state.our_id(),
            id,
            self.received.len()
        );
        self.sample.insert(id.clone());

        let mut step = Step::<S>::default();
        for msg in self.received.values() {
            step.messages
                .push(Target::Node(id.clone()).message(GossipMessage::Gossip(msg.clone())));
        }
        step
    }

    /// Draws uniformly random candidates from the members outside the sample
    /// and subscribes to them, until the sample reaches its target size.
    fn refill_sample<R: Rng>(&mut self, rng: &mut R) -> Step<S> {
        let target = target_sample_size(self.state.members(false).len());
        if self.sample.len() >= target {
            return Step::<S>::default();
        }

        let missing = target - self.sample.len();
        let sample = &self.sample;
        let candidates = self
            .state
            .members(true)
            .into_iter()
            .filter(|id| !sample.contains(id))
            .choose_multiple(rng, missing);

        let mut step = Step::<S>::default();
        for id in candidates {
            self.sample.insert(id.clone());
            step.messages.push(
                Target::Node(id).message(GossipMessage::Subscribe(self.state.our_id().clone())),
            );
        }
        step
    }
}

impl<S: GroupState> fmt::Debug for Gossip<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> result::Result<(), fmt::Error> {
        f.debug_struct("Gossip")
            .field("our_id", self.state.our_id())
            .field("sample", &self.sample)
            .field("cached", &self.received.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::super::GossipMessage;
    use super::{target_sample_size, Gossip};
    use crate::group_state::basic::{BasicGroupState, BasicOp};
    use crate::group_state::{GroupState, MemberId};

    fn group(names: &[&str]) -> BasicGroupState {
        let state = BasicGroupState::create(b"grp".to_vec(), MemberId::from_name(names[0]));
        let proposals = names[1..]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let msg = state.propose(BasicOp::Add(MemberId::from_name(name)), i as u64);
                state.decode_proposal(&msg).expect("decode proposal")
            })
            .collect();
        let commit = state.make_commit(proposals);
        state.apply_commit(&commit).expect("apply commit")
    }

    #[test]
    fn sample_size_follows_the_membership() {
        assert_eq!(target_sample_size(4), 6);
        assert_eq!(target_sample_size(1_000), 6);
        assert_eq!(target_sample_size(10_000_000), 7);
    }

    #[test]
    fn sample_is_capped_by_the_other_members() {
        let mut rng = StdRng::seed_from_u64(7);
        let state = Arc::new(group(&["a", "b", "c", "d"]));
        let (gossip, step) = Gossip::new(state, &mut rng);
        assert_eq!(gossip.sample().len(), 3);
        assert_eq!(step.messages.len(), 3);
    }

    #[test]
    fn duplicate_gossip_is_delivered_once() {
        let mut rng = StdRng::seed_from_u64(7);
        let state = Arc::new(group(&["a", "b", "c", "d"]));
        let sender = MemberId::from_name("b");
        let msg = state.protect(b"payload");

        let (mut gossip, _) = Gossip::new(state, &mut rng);
        let step = gossip.handle_message(&sender, GossipMessage::Gossip(msg.clone()), &mut rng);
        assert_eq!(step.output.len(), 1);
        let step = gossip.handle_message(&sender, GossipMessage::Gossip(msg), &mut rng);
        assert!(step.is_empty());
    }

    #[test]
    fn subscriber_gets_the_cached_messages() {
        let mut rng = StdRng::seed_from_u64(7);
        let state = Arc::new(group(&["a", "b", "c", "d"]));
        let sender = MemberId::from_name("c");
        let msg = state.protect(b"payload");

        let (mut gossip, _) = Gossip::new(state, &mut rng);
        let _ = gossip.handle_message(&sender, GossipMessage::Gossip(msg), &mut rng);

        // The sample already contains everyone, so re-subscribing "b" only
        // replays; an unknown subscriber is a fault.
        gossip.sample.remove(&MemberId::from_name("b"));
        let step = gossip.handle_message(
            &sender,
            GossipMessage::Subscribe(MemberId::from_name("b")),
            &mut rng,
        );
        assert_eq!(step.messages.len(), 1);

        let step = gossip.handle_message(
            &sender,
            GossipMessage::Subscribe(MemberId::from_name("zz")),
            &mut rng,
        );
        assert_eq!(step.fault_log.0.len(), 1);
    }

    #[test]
    fn epoch_change_clears_the_cache_and_drops_removed_peers() {
        let mut rng = StdRng::seed_from_u64(7);
        let state = Arc::new(group(&["a", "b", "c", "d"]));
        let sender = MemberId::from_name("d");
        let msg = state.protect(b"payload");

        let (mut gossip, _) = Gossip::new(state.clone(), &mut rng);
        let _ = gossip.handle_message(&sender, GossipMessage::Gossip(msg.clone()), &mut rng);

        let removal = state
            .decode_proposal(&state.propose(BasicOp::Remove(MemberId::from_name("b")), 9))
            .expect("decode");
        let commit = state.make_commit(vec![removal]);
        let next = Arc::new(state.apply_commit(&commit).expect("apply"));

        let removed = vec![MemberId::from_name("b")];
        let _ = gossip.start_epoch(next.clone(), &removed, &mut rng);
        assert!(!gossip.sample().contains(&MemberId::from_name("b")));

        // The old epoch's message is unseen again, but fails validation at
        // the upper layer; here it is simply cached anew.
        assert!(gossip.received.is_empty());
    }
}
