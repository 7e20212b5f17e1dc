// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    Address, Command, Config, GroupEvent, GroupMember, Hub, Multicast, Replica, Reply, Request,
    Result,
};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// A running auction server: a `Replica` plus its memberships.
///
/// Startup order matters. The node joins the multicast group first, pulls a
/// snapshot from the oldest other member (retrying for as long as it takes),
/// and only then joins the RPC group, so the coordinator never sees a replica
/// that hasn't caught up. Finally it announces its address pair so that
/// sync commands can find it.
pub struct ReplicaNode {
    replica: Arc<Replica>,
    member: Arc<GroupMember>,
    listener: Option<JoinHandle<()>>,
}

impl ReplicaNode {
    pub fn start(hub: &Hub, cfg: &Config) -> Result<ReplicaNode> {
        let replica = Arc::new(Replica::new(cfg));
        let provider = replica.clone();
        let (member, events) = hub.join(Arc::new(move || provider.snapshot()));
        let member = Arc::new(member);

        initialise_state(&member, &replica, cfg)?;

        let handler = replica.clone();
        let rpc = member.join_rpc(Arc::new(move |req: Request| serve(&handler, req)));
        member.announce(rpc)?;

        let listener = {
            let (member, replica) = (member.clone(), replica.clone());
            let timeout = cfg.state_timeout;
            thread::Builder::new()
                .name(format!("{}-events", member.address()))
                .spawn(move || listen(&member, &replica, events, timeout))?
        };
        info!(
            "replica {} serving as {} with {} auctions",
            member.address(),
            rpc,
            replica.len()
        );
        Ok(ReplicaNode {
            replica,
            member,
            listener: Some(listener),
        })
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    pub fn address(&self) -> Address {
        self.member.address()
    }

    pub fn rpc_address(&self) -> Option<Address> {
        self.member.rpc_address()
    }

    /// Leaves both groups and waits for the event listener to drain.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.member.leave();
        if let Some(h) = self.listener.take() {
            let _ = h.join();
        }
    }
}

impl Drop for ReplicaNode {
    fn drop(&mut self) {
        self.stop();
    }
}

fn initialise_state(member: &GroupMember, replica: &Replica, cfg: &Config) -> Result<()> {
    let me = member.address();
    loop {
        // Re-read the view on each attempt: the member we were waiting on may
        // have gone away in the meantime.
        let source = match member.view().oldest_other(&me) {
            Some(s) => s,
            None => {
                info!("replica {} is the first member, starting fresh", me);
                if let Some(path) = &cfg.seed_file {
                    replica.seed_from_file(path)?;
                }
                return Ok(());
            }
        };
        match member.request_snapshot(source, cfg.state_timeout) {
            Ok(snapshot) => {
                replica.restore(&snapshot);
                info!("replica {} took state from {}", me, source);
                return Ok(());
            }
            Err(e) => {
                warn!("replica {} could not get state from {}: {}", me, source, e);
                thread::sleep(cfg.join_retry_delay);
            }
        }
    }
}

/// Applies one request to the local replica.
pub fn serve(replica: &Replica, req: Request) -> Reply {
    trace!("serving {:?}", req);
    match req {
        Request::Fingerprint => Reply::Fingerprint(replica.fingerprint()),
        Request::AddAuction(a) => Reply::Added(replica.add_auction(a)),
        Request::RemoveAuction { requester, id } => {
            Reply::Removed(replica.remove_auction(&requester, id))
        }
        Request::PlaceBid {
            id,
            amount,
            name,
            email,
        } => Reply::Bid(replica.place_bid(id, amount, &name, &email)),
        Request::Listings => Reply::Listings(replica.listings()),
    }
}

fn listen(member: &GroupMember, replica: &Replica, events: Receiver<GroupEvent>, timeout: Duration) {
    let me = member.address();
    for event in events.iter() {
        match event {
            GroupEvent::Message {
                from,
                body:
                    Multicast::Command {
                        command: Command::Sync,
                        peer,
                    },
            } => {
                info!("replica {} syncing with {} at the request of {}", me, peer, from);
                match member.request_snapshot(peer, timeout) {
                    Ok(snapshot) => replica.restore(&snapshot),
                    Err(e) => warn!("replica {} failed to sync with {}: {}", me, peer, e),
                }
            }
            GroupEvent::MulticastView(view) => debug!("replica {} sees {}", me, view),
            other => trace!("replica {} ignoring {:?}", me, other),
        }
    }
    debug!("replica {} event queue closed", me);
}
