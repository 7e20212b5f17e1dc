// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use quorate::{
    Accounts, Bidder, Config, Coordinator, DirectoryAccounts, Hub, ReplicaNode, Result, Seller,
    SessionKind, SessionStore, StaticAccounts,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn fingerprints(nodes: &[ReplicaNode]) -> Vec<i64> {
    nodes.iter().map(|n| n.replica().fingerprint()).collect()
}

fn wait_for_agreement(nodes: &[ReplicaNode], within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        let fps = fingerprints(nodes);
        if fps.windows(2).all(|w| w[0] == w[1]) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

fn run(replicas: usize) -> Result<()> {
    let cfg = Config::from_env();
    let accounts: Arc<dyn Accounts> = match &cfg.accounts_dir {
        Some(dir) => Arc::new(DirectoryAccounts::new(dir)),
        None => Arc::new(StaticAccounts::new().with("bob", "bob@example.com")),
    };
    let hub = Hub::new();

    // The coordinator has to be listening before replicas announce themselves.
    let coordinator = Coordinator::start(&hub, &cfg, accounts)?;
    let mut nodes = Vec::with_capacity(replicas);
    for _ in 0..replicas {
        nodes.push(ReplicaNode::start(&hub, &cfg)?);
    }
    info!("{} replicas up, rpc {}", nodes.len(), hub.rpc_view());

    let sessions = SessionStore::new(coordinator.clone());
    let alice = sessions.open("Seller".parse::<SessionKind>()?, "alice");
    let bob = sessions.open("Bidder".parse::<SessionKind>()?, "bob");
    let (seller, bidder) = match (alice.as_seller(), bob.as_bidder()) {
        (Some(s), Some(b)) => (s, b),
        _ => unreachable!("sessions opened with the wrong kind"),
    };

    let id = seller.create_auction(10.0, "item", 50.0)?;
    info!("alice listed auction {}", id);
    info!("bid of 40: {:?}", bidder.bid(id, 40.0)?);
    info!("bid of 5: {:?}", bidder.bid(id, 5.0)?);
    print!("{}", bidder.listings()?);
    info!("closing: {}", seller.close_auction(id)?);

    // With a single replica there is nobody left to vote once it is cut off.
    let victim = nodes.last().filter(|_| nodes.len() > 1).and_then(|n| n.rpc_address());
    if let Some(victim) = victim {
        hub.isolate(victim);
        let id = seller.create_auction(1.0, "lamp", 2.0)?;
        info!("listed {} while {} was cut off: {:?}", id, victim, fingerprints(&nodes));
        hub.heal(victim);
        coordinator.verify_fingerprints();
        if wait_for_agreement(&nodes, cfg.rpc_timeout) {
            info!("replicas agree again: {:?}", fingerprints(&nodes));
        } else {
            warn!("replicas still disagree: {:?}", fingerprints(&nodes));
        }
    }

    info!("evicted {} idle sessions", sessions.evict_idle(cfg.max_idle));
    for n in nodes {
        n.shutdown();
    }
    coordinator.shutdown();
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let replicas = match std::env::args().nth(1).map(|s| s.parse::<usize>()) {
        None => 3,
        Some(Ok(n)) if n > 0 => n,
        Some(_) => {
            error!("usage: quorate [replicas]");
            std::process::exit(2);
        }
    };
    if let Err(e) = run(replicas) {
        error!("{}", e);
        std::process::exit(1);
    }
}
