//! End-to-end scenarios of the delivery service over a virtual network:
//! the happy path, concurrent commits, the fallthrough to full consensus,
//! a crashed proposer and a late joiner.

pub mod net;

use std::time::Duration;

use cascade_dds::cascade::CascadeMessage;
use cascade_dds::delivery_service::Output;
use cascade_dds::group_state::basic::BasicOp;
use cascade_dds::group_state::{GroupMessage, GroupState, MemberId};
use cascade_dds::restrained_consensus::RcMessage;

use crate::net::{decode_cascade, VirtualNet};

const RTT: Duration = Duration::from_millis(20);

fn assert_single_batch(net: &VirtualNet, names: &[&str], epoch: u64, commit: &GroupMessage) {
    for name in names {
        let batches = net.batches(name);
        assert_eq!(
            batches.len(),
            1,
            "{} delivered {} commits, expected one",
            name,
            batches.len()
        );
        assert_eq!(batches[0].0, epoch, "{} is at the wrong epoch", name);
        assert_eq!(&batches[0].1, commit, "{} delivered the wrong commit", name);
    }
}

/// Happy path: one member commits a single Add; everyone delivers it, the
/// epoch advances and the added member joins from the welcome.
#[test]
fn happy_path_single_commit() {
    let _ = env_logger::try_init();
    let mut net = VirtualNet::new(&["a", "b", "c", "d"], RTT, 1);

    let add = net.gossip_proposal("a", BasicOp::Add(MemberId::from_name("e")), 0);
    net.run_messages();

    // Each member delivered the proposal exactly once.
    for name in &["a", "b", "c", "d"] {
        let messages = net
            .outputs(name)
            .iter()
            .filter(|output| match output {
                Output::Message(_) => true,
                _ => false,
            })
            .count();
        assert_eq!(messages, 1, "{} delivered {} messages", name, messages);
    }

    let commit = net.propose_commit("a", vec![add]);
    net.run();

    assert_single_batch(&net, &["a", "b", "c", "d"], 2, &commit);
    for name in &["a", "b", "c", "d"] {
        assert_eq!(net.state(name).epoch(), 2);
    }

    // The added member received the welcome and joined the new epoch.
    assert!(net.has_node("e"));
    assert_eq!(net.state("e").epoch(), 2);
    assert_eq!(net.service("e").parked_proposals(), 0);
    assert_eq!(net.service("e").parked_cascade_messages(), 0);
}

/// Two members commit concurrently: the broadcast reports the conflict, the
/// restrained consensus (or its ⊥ continuation) settles it, and every
/// member delivers the same commit.
#[test]
fn concurrent_commits_converge() {
    let _ = env_logger::try_init();
    let mut net = VirtualNet::new(&["a", "b", "c", "d"], RTT, 2);

    let pa = net.gossip_proposal("a", BasicOp::Update, 10);
    let pb = net.gossip_proposal("b", BasicOp::Update, 11);
    net.run_messages();

    let commit_a = net.propose_commit("a", vec![pa]);
    let commit_b = net.propose_commit("b", vec![pb]);
    net.run();

    let reference = net.batches("a");
    assert_eq!(reference.len(), 1);
    assert_eq!(reference[0].0, 2);
    assert!(
        reference[0].1 == commit_a || reference[0].1 == commit_b,
        "the delivered commit is one of the two proposed"
    );
    let winner = reference[0].1.clone();
    assert_single_batch(&net, &["a", "b", "c", "d"], 2, &winner);
}

/// The restrained consensus cannot conclude cleanly: one participate
/// message is lost, so depending on the race either a participant times
/// out to ⊥ and the outcomes diverge into the full consensus, or a retract
/// settles it. Every member must still deliver the same commit.
#[test]
fn rc_fallthrough_converges() {
    let _ = env_logger::try_init();
    let mut net = VirtualNet::new(&["a", "b", "c", "d"], RTT, 3);

    let pa = net.gossip_proposal("a", BasicOp::Update, 10);
    let pb = net.gossip_proposal("b", BasicOp::Update, 11);
    net.run_messages();

    // Lose A's restrained-consensus participate on its way to B: B either
    // retracts or can only time out to ⊥, never agree with A directly.
    net.set_drop_filter(Box::new(|envelope, state| {
        envelope.from == MemberId::from_name("a")
            && envelope.to == MemberId::from_name("b")
            && match decode_cascade(&envelope.message, state) {
                Some(CascadeMessage::Rc(RcMessage::Participate(_))) => true,
                _ => false,
            }
    }));

    let commit_a = net.propose_commit("a", vec![pa]);
    let commit_b = net.propose_commit("b", vec![pb]);
    net.run();

    let reference = net.batches("a");
    assert_eq!(reference.len(), 1);
    assert_eq!(reference[0].0, 2);
    assert!(
        reference[0].1 == commit_a || reference[0].1 == commit_b,
        "the delivered commit is one of the two proposed"
    );
    let winner = reference[0].1.clone();
    assert_single_batch(&net, &["a", "b", "c", "d"], 2, &winner);
}

/// A proposer crashes right after broadcasting its conflicting commit. The
/// group needs a size where the quorums tolerate one silent member; the
/// survivors fall through ⊥ and the second CAC instance to agreement, and
/// the richer commit wins the choice.
#[test]
fn crashed_proposer_mid_conflict() {
    let _ = env_logger::try_init();
    let names = ["a", "b", "c", "d", "e", "f"];
    let mut net = VirtualNet::new(&names, RTT, 4);

    let pa = net.gossip_proposal("a", BasicOp::Update, 20);
    let pb1 = net.gossip_proposal("b", BasicOp::Update, 21);
    let pb2 = net.gossip_proposal("b", BasicOp::Update, 22);
    net.run_messages();

    let _commit_a = net.propose_commit("a", vec![pa]);
    net.crash("a");
    let commit_b = net.propose_commit("b", vec![pb1, pb2]);
    net.run();

    let survivors = ["b", "c", "d", "e", "f"];
    assert_single_batch(&net, &survivors, 2, &commit_b);
    // No membership change: the crashed proposer is merely behind.
    for name in &survivors {
        assert_eq!(net.state(name).members(false).len(), 6);
    }
}

/// A member added at epoch e+1 participates in the next agreement and never
/// holds a future-queue entry past its epoch.
#[test]
fn late_joiner_follows_the_next_commit() {
    let _ = env_logger::try_init();
    let mut net = VirtualNet::new(&["a", "b", "c", "d"], RTT, 5);

    let add = net.gossip_proposal("a", BasicOp::Add(MemberId::from_name("e")), 0);
    net.run_messages();
    let _commit1 = net.propose_commit("a", vec![add]);
    net.run();
    assert!(net.has_node("e"));
    assert_eq!(net.state("e").epoch(), 2);

    // Next round: the late joiner must deliver the next commit like any
    // other member.
    let update = net.gossip_proposal("b", BasicOp::Update, 30);
    net.run_messages();
    let commit2 = net.propose_commit("b", vec![update]);
    net.run();

    for name in &["a", "b", "c", "d", "e"] {
        let batches = net.batches(name);
        let last = batches.last().expect("delivered at least one commit");
        assert_eq!(last.0, 3, "{} did not reach epoch 3", name);
        assert_eq!(&last.1, &commit2, "{} delivered the wrong commit", name);
        assert_eq!(net.service(name).parked_proposals(), 0);
        assert_eq!(net.service(name).parked_cascade_messages(), 0);
    }

    // Gossip keeps every member's sample at the capped target size.
    for name in &["a", "b", "c", "d", "e"] {
        let members = net.state(name).members(false).len();
        assert_eq!(members, 5);
    }
}

/// An application message reaches every member exactly once and never
/// affects the epoch.
#[test]
fn application_messages_are_best_effort_only() {
    let _ = env_logger::try_init();
    let mut net = VirtualNet::new(&["a", "b", "c", "d"], RTT, 6);

    net.gossip_application("c", b"hello group");
    net.run_messages();

    for name in &["a", "b", "c", "d"] {
        let messages: Vec<_> = net
            .outputs(name)
            .iter()
            .filter_map(|output| match output {
                Output::Message(msg) => net.state(name).validate_application(msg),
                _ => None,
            })
            .collect();
        assert_eq!(messages, vec![b"hello group".to_vec()]);
        assert_eq!(net.state(name).epoch(), 1);
    }
}
