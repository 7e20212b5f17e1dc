// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

struct Cluster {
    hub: Hub,
    cfg: Config,
    coordinator: Arc<Coordinator>,
    nodes: Vec<ReplicaNode>,
}

impl Cluster {
    fn new(replicas: usize) -> Cluster {
        let _ = pretty_env_logger::try_init();
        let hub = Hub::new();
        let cfg = Config {
            rpc_timeout: Duration::from_secs(2),
            state_timeout: Duration::from_secs(2),
            join_retry_delay: Duration::from_millis(10),
            ..Config::default()
        };
        let accounts = StaticAccounts::new()
            .with("bob", "bob@example.com")
            .with("carol", "carol@example.com");
        let coordinator = Coordinator::start(&hub, &cfg, Arc::new(accounts)).unwrap();
        let mut c = Cluster {
            hub,
            cfg,
            coordinator,
            nodes: vec![],
        };
        for _ in 0..replicas {
            c.add_node();
        }
        c
    }

    fn add_node(&mut self) {
        let n = ReplicaNode::start(&self.hub, &self.cfg).unwrap();
        debug!("started replica {}", n.address());
        self.nodes.push(n);
    }

    fn fingerprints(&self) -> Vec<i64> {
        self.nodes.iter().map(|n| n.replica().fingerprint()).collect()
    }

    /// Polls until every replica reports the same fingerprint.
    fn converged(&self) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let fps = self.fingerprints();
            if fps.iter().all(|f| *f == fps[0]) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    /// Waits until the coordinator has heard every replica's announcement.
    fn announced(&self) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.nodes.iter().all(|n| {
                n.rpc_address()
                    .and_then(|rpc| self.coordinator.correlate(&rpc))
                    == Some(n.address())
            }) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

#[test]
fn end_to_end() {
    let c = Cluster::new(3);
    let co = &c.coordinator;
    assert_eq!(co.listings().unwrap(), "There are no listings.");

    let id = co.create_auction("alice", 10.0, "item", 50.0).unwrap();
    assert_eq!(id, 1000);
    assert_eq!(co.place_bid(id, 40.0, "bob").unwrap(), BidOutcome::Accepted);
    assert_eq!(co.place_bid(id, 5.0, "bob").unwrap(), BidOutcome::TooLow);
    assert_eq!(co.place_bid(id + 1, 99.0, "bob").unwrap(), BidOutcome::NoSuchAuction);

    let listing = co.listings().unwrap();
    assert!(listing.contains("1000"));
    assert!(listing.contains("bob"));
    assert!(listing.contains("item"));

    match co.close_auction("alice", id).unwrap() {
        CloseOutcome::ReserveNotMet {
            reserve,
            final_price,
        } => {
            assert_eq!(reserve, 50.0);
            assert_eq!(final_price, 40.0);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        co.close_auction("alice", id).unwrap(),
        CloseOutcome::NotPermittedOrAbsent(id)
    );
    assert!(c.converged());
    assert!(c.nodes.iter().all(|n| n.replica().is_empty()));
}

#[test]
fn winners_get_their_email_from_their_account() {
    let c = Cluster::new(2);
    let co = &c.coordinator;
    let id = co.create_auction("alice", 1.0, "lamp", 2.0).unwrap();
    assert!(co.place_bid(id, 3.0, "carol").unwrap().is_accepted());
    match co.close_auction("alice", id).unwrap() {
        CloseOutcome::Sold {
            winner_name,
            winner_email,
            final_price,
        } => {
            assert_eq!(winner_name, "carol");
            assert_eq!(winner_email, "carol@example.com");
            assert_eq!(final_price, 3.0);
        }
        other => panic!("unexpected {:?}", other),
    }

    let id = co.create_auction("alice", 1.0, "vase", 2.0).unwrap();
    assert!(co.place_bid(id, 3.0, "mallory").unwrap().is_accepted());
    match co.close_auction("alice", id).unwrap() {
        CloseOutcome::Sold { winner_email, .. } => assert_eq!(winner_email, NO_EMAIL),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn only_the_owner_may_close() {
    let c = Cluster::new(3);
    let co = &c.coordinator;
    let id = co.create_auction("alice", 1.0, "lamp", 2.0).unwrap();
    let before = c.fingerprints();
    assert_eq!(
        co.close_auction("bob", id).unwrap(),
        CloseOutcome::NotPermittedOrAbsent(id)
    );
    assert_eq!(c.fingerprints(), before);
    assert!(c.nodes.iter().all(|n| n.replica().len() == 1));
}

#[test]
fn stale_minority_is_repaired() {
    let c = Cluster::new(3);
    assert!(c.announced());
    let co = &c.coordinator;
    co.create_auction("alice", 1.0, "lamp", 2.0).unwrap();

    let victim = c.nodes[2].rpc_address().unwrap();
    c.hub.isolate(victim);
    co.create_auction("alice", 5.0, "vase", 10.0).unwrap();
    assert_eq!(c.nodes[2].replica().len(), 1);
    assert_ne!(c.fingerprints()[2], c.fingerprints()[0]);

    c.hub.heal(victim);
    let majority = co.verify_fingerprints();
    assert_eq!(majority, Some(c.nodes[0].replica().fingerprint()));
    assert!(c.converged());
    assert_eq!(c.nodes[2].replica().snapshot(), c.nodes[0].replica().snapshot());
}

#[test]
fn no_replicas_no_answer() {
    let c = Cluster::new(0);
    match c.coordinator.listings() {
        Err(Error::NoReplies) => (),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(c.coordinator.verify_fingerprints(), None);
}

#[test]
fn replicas_come_and_go() {
    let mut c = Cluster::new(2);
    let id = c.coordinator.create_auction("alice", 1.0, "lamp", 2.0).unwrap();

    let first = c.nodes.remove(0);
    first.shutdown();
    assert_eq!(c.hub.rpc_view().len(), 1);

    c.add_node();
    assert_eq!(c.hub.rpc_view().len(), 2);
    assert_eq!(c.nodes[1].replica().snapshot(), c.nodes[0].replica().snapshot());
    assert!(c.announced());

    assert!(c.coordinator.place_bid(id, 3.0, "bob").unwrap().is_accepted());
    assert!(c.converged());
    let next = c.coordinator.create_auction("alice", 1.0, "vase", 2.0).unwrap();
    assert_eq!(next, id + 1);
}

#[test]
fn sessions_drive_the_coordinator() {
    let c = Cluster::new(3);
    let store = SessionStore::new(c.coordinator.clone());
    let alice = store.open("Seller".parse().unwrap(), "alice");
    let bob = store.open("Bidder".parse().unwrap(), "bob");
    let seller = alice.as_seller().unwrap();
    let bidder = bob.as_bidder().unwrap();

    let id = seller.create_auction(-5.0, "chair", -1.0).unwrap();
    let snap = c.nodes[0].replica().snapshot();
    assert_eq!(snap.auctions[&id].current_price(), 0.0);
    assert_eq!(snap.auctions[&id].reserve_price(), 0.0);

    assert!(bidder.bid(id, 1.0).unwrap().is_accepted());
    assert!(bidder.listings().unwrap().contains("chair"));
    match seller.close_auction(id).unwrap() {
        CloseOutcome::Sold {
            winner_name,
            winner_email,
            ..
        } => {
            assert_eq!(winner_name, "bob");
            assert_eq!(winner_email, "bob@example.com");
        }
        other => panic!("unexpected {:?}", other),
    }

    assert!(store.logout(SessionKind::Bidder, "bob"));
    assert_eq!(store.len(), 1);
}

#[test]
fn seeded_first_replica_shares_its_rows() {
    let _ = pretty_env_logger::try_init();
    let path = std::env::temp_dir().join(format!("quorate-seed-{}.csv", std::process::id()));
    std::fs::write(&path, "1.00, desk, 5.00\n2.50, rug, 3.00\n").unwrap();
    let hub = Hub::new();
    let cfg = Config {
        seed_file: Some(path.clone()),
        ..Config::default()
    };
    let a = ReplicaNode::start(&hub, &cfg).unwrap();
    let b = ReplicaNode::start(&hub, &cfg).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(a.replica().len(), 2);
    assert_eq!(b.replica().snapshot(), a.replica().snapshot());
    assert!(a.replica().listings().contains("desk"));
}

#[test]
fn only_the_minority_is_told_to_sync() {
    // Five scripted members: three answer 7, two answer 9.
    let c = Cluster::new(0);
    let mut members = vec![];
    for fp in [7, 9, 7, 9, 7] {
        let (m, rx) = c.hub.join(Arc::new(|| Snapshot {
            next_id: 1000,
            auctions: im::OrdMap::new(),
            fingerprint: 0,
        }));
        let rpc = m.join_rpc(Arc::new(move |_req: Request| Reply::Fingerprint(fp)));
        m.announce(rpc).unwrap();
        members.push((m, rpc, rx));
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while !members
        .iter()
        .all(|(m, rpc, _)| c.coordinator.correlate(rpc) == Some(m.address()))
    {
        assert!(Instant::now() < deadline, "announcements never arrived");
        thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(c.coordinator.verify_fingerprints(), Some(7));
    let source = members[0].0.address();
    for (i, (_, _, rx)) in members.iter().enumerate() {
        let syncs: Vec<Address> = rx
            .try_iter()
            .filter_map(|e| match e {
                GroupEvent::Message {
                    body:
                        Multicast::Command {
                            command: Command::Sync,
                            peer,
                        },
                    ..
                } => Some(peer),
                _ => None,
            })
            .collect();
        if i % 2 == 1 {
            assert_eq!(syncs, vec![source]);
        } else {
            assert!(syncs.is_empty());
        }
    }
}
