//! A deterministic virtual network of delivery services.
//!
//! Nodes exchange `DdsMessage`s through a FIFO queue and share a virtual
//! clock: timers fire only when no message is in flight, earliest deadline
//! first. Everything is driven by a seeded RNG, so failures reproduce.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;

use cascade_dds::cascade::{CascadeMessage, Params, Timer};
use cascade_dds::delivery_service::{DdsMessage, DeliveryService, Output};
use cascade_dds::group_state::basic::{BasicGroupState, BasicOp, BasicProposal};
use cascade_dds::group_state::{GroupMessage, GroupState, MemberId, Welcome};
use cascade_dds::network::TimerWheel;
use cascade_dds::Target;

/// A message in flight.
pub struct Envelope {
    pub from: MemberId,
    pub to: MemberId,
    pub message: DdsMessage<MemberId>,
}

/// Decides whether an envelope is dropped. Receives the recipient's state
/// so tests can peek inside protected payloads.
pub type DropFilter = Box<dyn FnMut(&Envelope, &BasicGroupState) -> bool>;

struct TestNode {
    service: DeliveryService<BasicGroupState>,
    timers: TimerWheel<Timer>,
    outputs: Vec<Output<MemberId>>,
    rng: StdRng,
}

/// The virtual network.
pub struct VirtualNet {
    nodes: BTreeMap<MemberId, TestNode>,
    queue: VecDeque<Envelope>,
    /// Frames addressed to members that have not joined yet.
    parked: BTreeMap<MemberId, Vec<Envelope>>,
    clock: Instant,
    rtt: Duration,
    drop_filter: Option<DropFilter>,
    seed: u64,
    next_node: u64,
}

impl VirtualNet {
    /// Creates a group of the given members, all at epoch 1: the first
    /// member creates the group, adds the others in one commit, and everyone
    /// joins from the resulting welcome.
    pub fn new(names: &[&str], rtt: Duration, seed: u64) -> Self {
        let creator = BasicGroupState::create(b"test-group".to_vec(), MemberId::from_name(names[0]));
        let proposals = names[1..]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let msg = creator.propose(BasicOp::Add(MemberId::from_name(name)), i as u64);
                creator.decode_proposal(&msg).expect("decode proposal")
            })
            .collect();
        let commit = creator.make_commit(proposals);
        let creator = creator.apply_commit(&commit).expect("apply commit");
        let welcome = creator.welcome();

        let mut net = VirtualNet {
            nodes: BTreeMap::new(),
            queue: VecDeque::new(),
            parked: BTreeMap::new(),
            clock: Instant::now(),
            rtt,
            drop_filter: None,
            seed,
            next_node: 0,
        };
        for name in names {
            let id = MemberId::from_name(name);
            let state = if id == *creator.our_id() {
                creator.clone()
            } else {
                BasicGroupState::join(id.clone(), &welcome).expect("join")
            };
            net.add_node(id, state);
        }
        net
    }

    fn add_node(&mut self, id: MemberId, state: BasicGroupState) {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.next_node));
        self.next_node += 1;
        let (service, step) =
            DeliveryService::new(Arc::new(state), Params::new(self.rtt), &mut rng);
        let mut node = TestNode {
            service,
            timers: TimerWheel::new(),
            outputs: Vec::new(),
            rng,
        };
        let parked = self.parked.remove(&id).unwrap_or_default();
        self.absorb(&id, &mut node, step);
        self.nodes.insert(id.clone(), node);
        for envelope in parked {
            self.queue.push_back(envelope);
        }
    }

    /// Installs a drop filter; envelopes it returns `true` for are lost.
    pub fn set_drop_filter(&mut self, filter: DropFilter) {
        self.drop_filter = Some(filter);
    }

    /// Removes a node: its timers die and nothing reaches it any more.
    /// Frames it already sent stay in flight.
    pub fn crash(&mut self, name: &str) {
        self.nodes.remove(&MemberId::from_name(name));
    }

    /// The current group state of a node.
    pub fn state(&self, name: &str) -> Arc<BasicGroupState> {
        self.nodes[&MemberId::from_name(name)]
            .service
            .state()
            .clone()
    }

    /// Direct access to a node's service.
    pub fn service(&self, name: &str) -> &DeliveryService<BasicGroupState> {
        &self.nodes[&MemberId::from_name(name)].service
    }

    /// Whether the node exists (has joined and not crashed).
    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.contains_key(&MemberId::from_name(name))
    }

    /// The node names currently alive, in order.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes
            .keys()
            .map(|id| String::from_utf8_lossy(&id.0).into_owned())
            .collect()
    }

    /// Everything the node's service output so far.
    pub fn outputs(&self, name: &str) -> &[Output<MemberId>] {
        &self.nodes[&MemberId::from_name(name)].outputs
    }

    /// The commits a node delivered, as `(epoch, commit)` pairs.
    pub fn batches(&self, name: &str) -> Vec<(u64, GroupMessage)> {
        self.outputs(name)
            .iter()
            .filter_map(|output| match output {
                Output::Batch(batch) => Some((batch.epoch, batch.commit.clone())),
                Output::Message(_) => None,
            })
            .collect()
    }

    /// Gossips a proposal from `name` and returns its decoded content.
    pub fn gossip_proposal(&mut self, name: &str, op: BasicOp, nonce: u64) -> BasicProposal {
        let state = self.state(name);
        let msg = state.propose(op, nonce);
        let proposal = state.decode_proposal(&msg).expect("decode proposal");
        self.broadcast(name, msg);
        proposal
    }

    /// Gossips an application message from `name`.
    pub fn gossip_application(&mut self, name: &str, text: &[u8]) {
        let state = self.state(name);
        let msg = state.protect(text);
        self.broadcast(name, msg);
    }

    fn broadcast(&mut self, name: &str, msg: GroupMessage) {
        let id = MemberId::from_name(name);
        let step = {
            let node = self.nodes.get_mut(&id).expect("node exists");
            node.service.broadcast(msg, &mut node.rng)
        };
        self.take_step(&id, step);
    }

    /// Proposes a commit from `name`, with a welcome for any added members.
    pub fn propose_commit(&mut self, name: &str, proposals: Vec<BasicProposal>) -> GroupMessage {
        let state = self.state(name);
        let commit = state.make_commit(proposals);
        let welcome = state
            .apply_commit(&commit)
            .ok()
            .map(|next| next.welcome());
        let id = MemberId::from_name(name);
        let step = {
            let node = self.nodes.get_mut(&id).expect("node exists");
            node.service
                .propose_commit(commit.clone(), welcome, &mut node.rng)
                .expect("propose commit")
        };
        self.take_step(&id, step);
        commit
    }

    /// Runs until no message is in flight and no timer is pending, or the
    /// crank limit is exhausted.
    pub fn run(&mut self) {
        for _ in 0..100_000 {
            if !self.crank() {
                return;
            }
        }
        panic!("virtual net did not quiesce within the crank limit");
    }

    /// Delivers in-flight messages only; pending timers never fire.
    pub fn run_messages(&mut self) {
        for _ in 0..100_000 {
            if !self.deliver_one() {
                return;
            }
        }
        panic!("virtual net did not quiesce within the crank limit");
    }

    /// Delivers one message, or fires the earliest timer if none is in
    /// flight. Returns `false` once fully quiescent.
    fn crank(&mut self) -> bool {
        if self.deliver_one() {
            return true;
        }
        // Advance the clock to the earliest pending deadline.
        let due = self
            .nodes
            .iter()
            .filter_map(|(id, node)| node.timers.next_deadline().map(|at| (at, id.clone())))
            .min_by_key(|(at, _)| *at);
        let (at, id) = match due {
            Some(due) => due,
            None => return false,
        };
        self.clock = at;
        let clock = self.clock;
        let steps: Vec<_> = {
            let node = self.nodes.get_mut(&id).expect("node exists");
            let timers = node.timers.expire(clock);
            timers
                .into_iter()
                .map(|timer| node.service.handle_timer(timer, &mut node.rng))
                .collect()
        };
        for step in steps {
            self.take_step(&id, step);
        }
        true
    }

    fn deliver_one(&mut self) -> bool {
        let envelope = match self.queue.pop_front() {
            Some(envelope) => envelope,
            None => return false,
        };
        let to = envelope.to.clone();

        if !self.nodes.contains_key(&to) {
            match &envelope.message {
                DdsMessage::Welcome(welcome) => self.handle_offline_welcome(&to, welcome.clone()),
                // Park everything else until (if ever) the member joins.
                _ => self.parked.entry(to).or_default().push(envelope),
            }
            return true;
        }

        if let Some(mut filter) = self.drop_filter.take() {
            let dropped = filter(&envelope, &*self.nodes[&to].service.state());
            self.drop_filter = Some(filter);
            if dropped {
                return true;
            }
        }

        let step = {
            let node = self.nodes.get_mut(&to).expect("node exists");
            node.service
                .handle_message(&envelope.from, envelope.message, &mut node.rng)
        };
        self.take_step(&to, step);
        true
    }

    fn handle_offline_welcome(&mut self, to: &MemberId, welcome: Welcome) {
        match BasicGroupState::join(to.clone(), &welcome) {
            Ok(state) => self.add_node(to.clone(), state),
            Err(err) => panic!("welcome for {:?} does not apply: {}", to, err),
        }
    }

    fn take_step(
        &mut self,
        id: &MemberId,
        step: cascade_dds::delivery_service::Step<BasicGroupState>,
    ) {
        // The node may have crashed while its step was in flight.
        if let Some(mut node) = self.nodes.remove(id) {
            self.absorb(id, &mut node, step);
            self.nodes.insert(id.clone(), node);
        }
    }

    fn absorb(
        &mut self,
        id: &MemberId,
        node: &mut TestNode,
        step: cascade_dds::delivery_service::Step<BasicGroupState>,
    ) {
        node.timers.apply(step.timers, self.clock);
        node.outputs.extend(step.output);
        for tm in step.messages {
            let recipients: Vec<MemberId> = match tm.target {
                Target::Node(to) => vec![to],
                Target::Nodes(set) => set.into_iter().collect(),
                Target::All => node
                    .service
                    .state()
                    .members(true)
                    .into_iter()
                    .collect(),
                Target::AllExcept(except) => node
                    .service
                    .state()
                    .members(true)
                    .into_iter()
                    .filter(|member| !except.contains(member))
                    .collect(),
            };
            for to in recipients {
                if to == *id {
                    continue;
                }
                self.queue.push_back(Envelope {
                    from: id.clone(),
                    to,
                    message: tm.message.clone(),
                });
            }
        }
    }
}

/// Decodes a cascade envelope with the recipient's state, for drop filters.
pub fn decode_cascade(
    message: &DdsMessage<MemberId>,
    state: &BasicGroupState,
) -> Option<CascadeMessage> {
    match message {
        DdsMessage::Cascade(protected) => {
            let plaintext = state.validate_application(protected)?;
            bincode::deserialize(&plaintext).ok()
        }
        _ => None,
    }
}
