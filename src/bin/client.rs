//! An interactive group member.
//!
//! Publishes its identity and prekeys to the directory, then runs the
//! delivery service over a single-threaded event loop: reader threads feed
//! inbound frames and stdin lines into one channel, and the loop interleaves
//! them with timer expirations. Commands: `create`, `add <id[,id,…]>`,
//! `remove <id>`, `update`, `message <text>`, `stop`.
//!
//! The group state is the deterministic `BasicGroupState` — suitable for
//! demos and benchmarks, not for protecting real traffic.

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use docopt::Docopt;
use log::{debug, info, warn};
use rand::rngs::ThreadRng;
use rand::Rng;
use serde_derive::Deserialize;

use cascade_dds::cascade::{self, Params};
use cascade_dds::delivery_service::{DdsMessage, DeliveryService, Output};
use cascade_dds::group_state::basic::{BasicGroupState, BasicOp, BasicProposal};
use cascade_dds::group_state::{GroupMessage, GroupState, MemberId, Welcome};
use cascade_dds::network::{read_frame, DirectoryClient, PeerLinks, TimerWheel};
use cascade_dds::{Target, TimerCmd};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "
Distributed delivery service client

Usage:
  client <identity> <pki-addr> <rtt-ms>
  client (--help | -h)
  client --version
";

const GROUP_ID: &[u8] = b"cascade-dds";
const PREKEY_COUNT: usize = 16;

#[derive(Debug, Deserialize)]
struct Args {
    arg_identity: String,
    arg_pki_addr: String,
    arg_rtt_ms: u64,
}

/// Everything the event loop can wake up on.
enum Event {
    /// A frame arrived on some inbound connection.
    Frame(Vec<u8>),
    /// A line was typed on stdin.
    Command(String),
    /// Stdin was closed.
    Eof,
}

/// Timers owned by the driver: the cascade's plus the local commit trigger.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ClientTimer {
    Cascade(cascade::Timer),
    Commit,
}

struct Client {
    identity: String,
    id: MemberId,
    rtt: Duration,
    directory: DirectoryClient,
    links: PeerLinks,
    service: Option<DeliveryService<BasicGroupState>>,
    timers: TimerWheel<ClientTimer>,
    /// Frames that arrived before we joined a group.
    parked_frames: Vec<DdsMessage<MemberId>>,
    /// Proposals delivered this epoch, to be committed when the timer
    /// fires.
    pending_proposals: Vec<BasicProposal>,
    proposal_nonce: u64,
    rng: ThreadRng,
}

impl Client {
    fn new(identity: String, pki_addr: &str, rtt: Duration) -> Self {
        let directory = DirectoryClient::new(pki_addr);
        let links = PeerLinks::new(directory.clone());
        Client {
            id: MemberId::from_name(&identity),
            identity,
            rtt,
            directory,
            links,
            service: None,
            timers: TimerWheel::new(),
            parked_frames: Vec::new(),
            pending_proposals: Vec::new(),
            proposal_nonce: 0,
            rng: rand::thread_rng(),
        }
    }

    /// Installs a delivery service around `state` and replays parked
    /// frames.
    fn enter_group(&mut self, state: BasicGroupState) {
        for member in state.members(true) {
            let _ = self.links.connect(&name_of(&member));
        }
        let params = Params::from_env(self.rtt);
        let (service, step) = DeliveryService::builder(Arc::new(state))
            .params(params)
            .build(&mut self.rng);
        self.service = Some(service);
        self.run_step(step);

        for message in std::mem::replace(&mut self.parked_frames, Vec::new()) {
            self.handle_dds_message(message);
        }
    }

    fn handle_frame(&mut self, frame: Vec<u8>) {
        let message: DdsMessage<MemberId> = match bincode::deserialize(&frame) {
            Ok(message) => message,
            Err(err) => {
                warn!("dropping undecodable frame: {}", err);
                return;
            }
        };
        self.handle_dds_message(message);
    }

    fn handle_dds_message(&mut self, message: DdsMessage<MemberId>) {
        if self.service.is_none() {
            match message {
                DdsMessage::Welcome(welcome) => self.handle_welcome(welcome),
                other => self.parked_frames.push(other),
            }
            return;
        }
        // Inbound links carry no authenticated identity; protocol-level
        // senders are taken from the signed contents, this one only feeds
        // the fault log.
        let link_id = MemberId::from_name("<link>");
        let service = self.service.as_mut().expect("service is present");
        let step = service.handle_message(&link_id, message, &mut self.rng);
        self.run_step(step);
    }

    fn handle_welcome(&mut self, welcome: Welcome) {
        match BasicGroupState::join(self.id.clone(), &welcome) {
            Ok(state) => {
                println!("Joined group epoch {}", state.epoch());
                self.enter_group(state);
            }
            Err(err) => warn!("ignoring welcome: {}", err),
        }
    }

    fn handle_command(&mut self, line: &str) -> bool {
        let mut parts = line.trim().splitn(2, ' ');
        let command = parts.next().unwrap_or("");
        let arg = parts.next().unwrap_or("").trim();
        match command {
            "create" => self.cmd_create(),
            "add" if !arg.is_empty() => self.cmd_add(arg),
            "remove" if !arg.is_empty() => self.cmd_remove(arg),
            "update" => self.cmd_update(),
            "message" if !arg.is_empty() => self.cmd_message(arg),
            "add" | "remove" | "message" => {
                println!("Error: missing argument for command {}", command)
            }
            "stop" => return false,
            "" => {}
            _ => println!("Invalid command"),
        }
        true
    }

    fn cmd_create(&mut self) {
        if self.service.is_some() {
            return;
        }
        let state = BasicGroupState::create(GROUP_ID.to_vec(), self.id.clone());
        info!("created group epoch {}", state.epoch());
        self.enter_group(state);
    }

    fn cmd_add(&mut self, ids: &str) {
        for id in ids.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            // The prekey itself is unused by the basic state, but the
            // lookup both checks the member exists and drains one key, as a
            // real CGKA add would.
            if self.directory.query(id).is_err() {
                println!("User not found: {}", id);
                continue;
            }
            self.propose(BasicOp::Add(MemberId::from_name(id)));
        }
    }

    fn cmd_remove(&mut self, id: &str) {
        self.propose(BasicOp::Remove(MemberId::from_name(id)));
    }

    fn cmd_update(&mut self) {
        self.propose(BasicOp::Update);
    }

    fn cmd_message(&mut self, text: &str) {
        let msg = match self.state() {
            Some(state) => state.protect(text.as_bytes()),
            None => return,
        };
        self.broadcast(msg);
    }

    fn propose(&mut self, op: BasicOp) {
        let msg = match self.state() {
            Some(state) => {
                let nonce = self.proposal_nonce;
                self.proposal_nonce += 1;
                state.propose(op, nonce)
            }
            None => return,
        };
        self.broadcast(msg);
    }

    fn state(&self) -> Option<Arc<BasicGroupState>> {
        self.service.as_ref().map(|service| service.state().clone())
    }

    fn broadcast(&mut self, msg: GroupMessage) {
        if let Some(service) = self.service.as_mut() {
            let step = service.broadcast(msg, &mut self.rng);
            self.run_step(step);
        }
    }

    fn handle_timer(&mut self, timer: ClientTimer) {
        match timer {
            ClientTimer::Cascade(timer) => {
                if let Some(service) = self.service.as_mut() {
                    let step = service.handle_timer(timer, &mut self.rng);
                    self.run_step(step);
                }
            }
            ClientTimer::Commit => self.commit(),
        }
    }

    /// Builds a commit from the epoch's pending proposals and hands it to
    /// the cascade.
    fn commit(&mut self) {
        let state = match self.state() {
            Some(state) => state,
            None => return,
        };
        let service = self.service.as_mut().expect("service is present");
        if !service.can_propose_commit() || self.pending_proposals.is_empty() {
            return;
        }
        let commit = state.make_commit(self.pending_proposals.clone());
        let adds_members = self
            .pending_proposals
            .iter()
            .any(|proposal| match proposal.op {
                BasicOp::Add(_) => true,
                _ => false,
            });
        let welcome = if adds_members {
            match state.apply_commit(&commit) {
                Ok(next) => Some(next.welcome()),
                Err(err) => {
                    warn!("own commit does not apply: {}", err);
                    return;
                }
            }
        } else {
            None
        };
        match service.propose_commit(commit, welcome, &mut self.rng) {
            Ok(step) => self.run_step(step),
            Err(err) => debug!("commit no longer possible: {}", err),
        }
    }

    /// Acts on one step: dispatches messages, applies timer commands and
    /// interprets outputs.
    fn run_step(&mut self, step: cascade_dds::delivery_service::Step<BasicGroupState>) {
        let now = Instant::now();
        self.timers.apply(
            step.timers
                .into_iter()
                .map(|cmd| cmd.map(ClientTimer::Cascade)),
            now,
        );
        for fault in step.fault_log {
            warn!("fault of {:?}: {}", fault.node_id, fault.kind);
        }
        for tm in step.messages {
            self.dispatch(tm.target, &tm.message);
        }
        for output in step.output {
            self.handle_output(output);
        }
    }

    fn dispatch(&mut self, target: Target<MemberId>, message: &DdsMessage<MemberId>) {
        let payload = bincode::serialize(message).expect("failed to serialize wire message");
        let members: Vec<MemberId> = self
            .state()
            .map_or_else(Vec::new, |state| state.members(true));
        let names = |ids: &BTreeSet<MemberId>| -> Vec<String> {
            ids.iter().map(|id| name_of(id)).collect()
        };
        match target {
            Target::Node(id) => self.links.send(&name_of(&id), &payload),
            Target::Nodes(ids) => {
                for name in names(&ids) {
                    self.links.send(&name, &payload);
                }
            }
            Target::All => {
                for member in members {
                    self.links.send(&name_of(&member), &payload);
                }
            }
            Target::AllExcept(except) => {
                for member in members {
                    if !except.contains(&member) {
                        self.links.send(&name_of(&member), &payload);
                    }
                }
            }
        }
    }

    fn handle_output(&mut self, output: Output<MemberId>) {
        match output {
            Output::Message(msg) => self.handle_delivered_message(msg),
            Output::Batch(batch) => {
                for added in &batch.added {
                    println!("Added: {}", name_of(added));
                    let _ = self.links.connect(&name_of(added));
                }
                for removed in &batch.removed {
                    println!("Removed: {}", name_of(removed));
                    self.links.disconnect(&name_of(removed));
                }
                println!(
                    "{} commit new epoch {}",
                    if batch.own_commit { "Local" } else { "Remote" },
                    batch.epoch
                );
                self.pending_proposals.clear();
                self.timers.cancel(&ClientTimer::Commit);
                if batch.removed.contains(&self.id) {
                    println!("We were removed from the group");
                    process::exit(0);
                }
            }
        }
    }

    /// A best-effort delivery: print application messages, collect
    /// proposals and arm the commit trigger.
    fn handle_delivered_message(&mut self, msg: GroupMessage) {
        let state = match self.state() {
            Some(state) => state,
            None => return,
        };
        if let Some(plaintext) = state.validate_application(&msg) {
            println!("Message: {}", String::from_utf8_lossy(&plaintext));
            return;
        }
        if let Some(proposal) = state.decode_proposal(&msg) {
            let own = proposal.sender == state.our_index();
            self.pending_proposals.push(proposal);
            // The first proposal of the epoch arms the commit trigger: one
            // round trip for our own proposal, two for a peer's, so the
            // proposer usually commits first.
            let can_commit = self
                .service
                .as_ref()
                .map_or(false, DeliveryService::can_propose_commit);
            if can_commit && !self.timers.is_pending(&ClientTimer::Commit) {
                let delay = if own { self.rtt } else { 2 * self.rtt };
                self.timers.apply(
                    Some(TimerCmd::Schedule(ClientTimer::Commit, delay)),
                    Instant::now(),
                );
            }
        }
    }

    /// The blocking event loop. Returns on `stop` or stdin EOF.
    fn run(&mut self, events: Receiver<Event>) {
        loop {
            let timeout = self
                .timers
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or_else(|| Duration::from_secs(3600));
            match events.recv_timeout(timeout) {
                Ok(Event::Frame(frame)) => self.handle_frame(frame),
                Ok(Event::Command(line)) => {
                    if !self.handle_command(&line) {
                        return;
                    }
                }
                Ok(Event::Eof) => return,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
            for timer in self.timers.expire(Instant::now()) {
                self.handle_timer(timer);
            }
        }
    }
}

fn name_of(id: &MemberId) -> String {
    String::from_utf8_lossy(&id.0).into_owned()
}

/// Accepts inbound connections, spawning a frame-reader thread per peer.
fn spawn_listener(listener: TcpListener, events: Sender<Event>) {
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    continue;
                }
            };
            let events = events.clone();
            thread::spawn(move || loop {
                match read_frame(&mut stream) {
                    Ok(frame) => {
                        if events.send(Event::Frame(frame)).is_err() {
                            return;
                        }
                    }
                    // Connection closed or broken: drop it and its state.
                    Err(err) => {
                        debug!("inbound connection closed: {}", err);
                        return;
                    }
                }
            });
        }
    });
}

/// Forwards stdin lines into the event channel.
fn spawn_stdin(events: Sender<Event>) {
    thread::spawn(move || {
        use std::io::BufRead;
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if events.send(Event::Command(line)).is_err() {
                        return;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = events.send(Event::Eof);
    });
}

fn main() {
    env_logger::init();
    let args: Args = Docopt::new(USAGE)
        .and_then(|docopt| docopt.version(Some(VERSION.to_string())).deserialize())
        .unwrap_or_else(|err| err.exit());

    let listener = match TcpListener::bind("0.0.0.0:0") {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("client: cannot open a listening socket: {}", err);
            process::exit(1);
        }
    };
    let port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(err) => {
            eprintln!("client: cannot read the listening address: {}", err);
            process::exit(1);
        }
    };

    let mut client = Client::new(
        args.arg_identity.clone(),
        &args.arg_pki_addr,
        Duration::from_millis(args.arg_rtt_ms),
    );

    // Publish our address and a batch of prekeys so peers can add us.
    let mut rng = rand::thread_rng();
    let prekeys: Vec<Vec<u8>> = (0..PREKEY_COUNT)
        .map(|_| (0..32).map(|_| rng.gen()).collect())
        .collect();
    if let Err(err) = client
        .directory
        .publish(&client.identity, port, &prekeys)
    {
        eprintln!("client: cannot publish to the directory: {}", err);
        process::exit(1);
    }

    let (tx, rx) = unbounded();
    spawn_listener(listener, tx.clone());
    spawn_stdin(tx);

    println!(
        "Client is running, you can now use the commands: \
         create, add, remove, update and message"
    );
    client.run(rx);
}
