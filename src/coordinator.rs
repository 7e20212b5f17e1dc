// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    Accounts, Address, Auction, AuctionId, BidOutcome, CloseOutcome, Config, Error, GroupEvent,
    GroupMember, Hub, Multicast, Reply, Request, Result, View,
};
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// `VoteTable` groups the replies to one fan-out by value: each distinct
/// reply, in first-seen order, with the respondents that gave it.
///
/// Values only need `PartialEq`: replies hold floating-point prices, so they
/// can't be hashed, and the number of distinct answers is tiny anyway.
#[derive(Clone, Debug, PartialEq)]
pub struct VoteTable<V> {
    entries: Vec<(V, Vec<Address>)>,
}

impl<V: PartialEq> VoteTable<V> {
    pub fn tally<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = (Address, V)>,
    {
        let mut entries: Vec<(V, Vec<Address>)> = Vec::new();
        for (address, value) in replies {
            match entries.iter_mut().find(|(v, _)| *v == value) {
                Some((_, who)) => who.push(address),
                None => entries.push((value, vec![address])),
            }
        }
        VoteTable { entries }
    }

    fn majority_index(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, (_, who)) in self.entries.iter().enumerate() {
            // Strictly greater: on a tie the earlier entry keeps it.
            if best.map_or(true, |b| who.len() > self.entries[b].1.len()) {
                best = Some(i);
            }
        }
        best
    }

    /// The most common reply and who gave it.
    pub fn majority(&self) -> Option<(&V, &[Address])> {
        self.majority_index()
            .map(|i| (&self.entries[i].0, self.entries[i].1.as_slice()))
    }

    /// Everyone who disagreed with the majority.
    pub fn dissenters(&self) -> Vec<Address> {
        let m = self.majority_index();
        self.entries
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != m)
            .flat_map(|(_, (_, who))| who.iter().copied())
            .collect()
    }

    pub fn into_majority(mut self) -> Option<V> {
        let i = self.majority_index()?;
        Some(self.entries.swap_remove(i).0)
    }

    pub fn distinct_values(&self) -> usize {
        self.entries.len()
    }

    pub fn respondents(&self) -> usize {
        self.entries.iter().map(|(_, who)| who.len()).sum()
    }
}

/// Works out which sync commands repair a table: every dissenter is told to
/// pull from the first majority respondent. Both ends are translated from
/// RPC addresses to multicast addresses through `mappings`; dissenters with
/// no known translation are skipped, and if the source has none nothing can
/// be repaired. Returns `(target, source)` pairs.
pub fn repair_plan<V: PartialEq>(
    table: &VoteTable<V>,
    mappings: &HashMap<Address, Address>,
) -> Vec<(Address, Address)> {
    let source = match table.majority().and_then(|(_, who)| who.first()) {
        Some(s) => s,
        None => return Vec::new(),
    };
    let source = match mappings.get(source) {
        Some(s) => *s,
        None => {
            warn!("no multicast address known for sync source {}", source);
            return Vec::new();
        }
    };
    table
        .dissenters()
        .into_iter()
        .filter_map(|d| match mappings.get(&d) {
            Some(target) => Some((*target, source)),
            None => {
                warn!("no multicast address known for {}, cannot repair it", d);
                None
            }
        })
        .collect()
}

/// Orders replies by the respondent's position in `view`, so that ties in the
/// vote go to whichever value the longest-standing member gave. Respondents
/// missing from the view sort last, by address.
fn in_view_order<V>(mut replies: Vec<(Address, V)>, view: &View) -> Vec<(Address, V)> {
    replies.sort_by_key(|(a, _)| (view.position(a).unwrap_or(usize::MAX), *a));
    replies
}

fn rebuild_mappings(old: &HashMap<Address, Address>, view: &View) -> HashMap<Address, Address> {
    view.members
        .iter()
        .filter_map(|rpc| old.get(rpc).map(|mc| (*rpc, *mc)))
        .collect()
}

/// The front door for every client-facing operation.
///
/// Each operation first runs a fingerprint round purely to catch and repair
/// drift, then sends the real request to every replica, takes the most
/// common answer as the result and tells every replica that answered
/// differently to copy state from one that answered with the majority.
///
/// None of this is consensus. A majority of replicas that are stale in the
/// same way wins the vote, and repair happens after the answer has already
/// been returned. Nothing stops two coordinators from interleaving their
/// operations differently on different replicas either; deployments are
/// expected to run one.
pub struct Coordinator {
    member: Arc<GroupMember>,
    mappings: Arc<RwLock<HashMap<Address, Address>>>,
    accounts: Arc<dyn Accounts>,
    rpc_timeout: Duration,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Attaches to the groups. Should happen before replicas start, so that
    /// their address announcements are seen.
    pub fn start(hub: &Hub, cfg: &Config, accounts: Arc<dyn Accounts>) -> Result<Arc<Coordinator>> {
        let (member, events) = hub.attach();
        let member = Arc::new(member);
        let mappings = Arc::new(RwLock::new(HashMap::new()));
        let listener = {
            let (me, mappings) = (member.address(), mappings.clone());
            thread::Builder::new()
                .name(format!("{}-coordinator", me))
                .spawn(move || track_addresses(me, &mappings, events))?
        };
        info!("coordinator {} attached", member.address());
        Ok(Arc::new(Coordinator {
            member,
            mappings,
            accounts,
            rpc_timeout: cfg.rpc_timeout,
            listener: Mutex::new(Some(listener)),
        }))
    }

    pub fn create_auction(
        &self,
        owner: &str,
        start_price: f64,
        description: &str,
        min_price: f64,
    ) -> Result<AuctionId> {
        let a = Auction::new(owner, start_price, description, min_price);
        match self.invoke(Request::AddAuction(a))? {
            Reply::Added(Some(id)) => Ok(id),
            Reply::Added(None) => Err(Error::CapacityExhausted),
            other => Err(unexpected(other)),
        }
    }

    pub fn close_auction(&self, owner: &str, id: AuctionId) -> Result<CloseOutcome> {
        let req = Request::RemoveAuction {
            requester: owner.to_string(),
            id,
        };
        match self.invoke(req)? {
            Reply::Removed(Some(a)) => Ok(a.conclude()),
            Reply::Removed(None) => Ok(CloseOutcome::NotPermittedOrAbsent(id)),
            other => Err(unexpected(other)),
        }
    }

    /// Bids on behalf of `bidder`, whose email comes from their account.
    pub fn place_bid(&self, id: AuctionId, amount: f64, bidder: &str) -> Result<BidOutcome> {
        let req = Request::PlaceBid {
            id,
            amount,
            name: bidder.to_string(),
            email: self.accounts.email_or_placeholder(bidder),
        };
        match self.invoke(req)? {
            Reply::Bid(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    pub fn listings(&self) -> Result<String> {
        match self.invoke(Request::Listings)? {
            Reply::Listings(text) => Ok(text),
            other => Err(unexpected(other)),
        }
    }

    /// Runs a fingerprint round and repairs whoever disagrees. Returns the
    /// majority fingerprint, if anyone answered.
    pub fn verify_fingerprints(&self) -> Option<i64> {
        match self.coordinate(&Request::Fingerprint) {
            Ok(Reply::Fingerprint(fp)) => Some(fp),
            Ok(other) => {
                warn!("fingerprint round answered with {:?}", other);
                None
            }
            Err(e) => {
                warn!("fingerprint round failed: {}", e);
                None
            }
        }
    }

    pub fn address(&self) -> Address {
        self.member.address()
    }

    /// The multicast address a replica announced for `rpc`, if any.
    pub fn correlate(&self, rpc: &Address) -> Option<Address> {
        self.mappings.read().get(rpc).copied()
    }

    fn invoke(&self, req: Request) -> Result<Reply> {
        self.verify_fingerprints();
        self.coordinate(&req)
    }

    fn coordinate(&self, req: &Request) -> Result<Reply> {
        let replies = self.member.call_all(req, self.rpc_timeout);
        self.consistency_check(replies)
    }

    fn consistency_check(&self, replies: Vec<(Address, Reply)>) -> Result<Reply> {
        let replies = in_view_order(replies, &self.member.rpc_view());
        for (who, value) in replies.iter() {
            debug!("[{}] gives {:?}", who, value);
        }
        let table = VoteTable::tally(replies);
        if let Some((value, who)) = table.majority() {
            trace!("majority {:?} from [{}]", value, who.iter().join(", "));
        }
        self.sync_replicas(&table);
        table.into_majority().ok_or(Error::NoReplies)
    }

    fn sync_replicas<V: PartialEq>(&self, table: &VoteTable<V>) {
        if table.distinct_values() < 2 {
            return;
        }
        let plan = repair_plan(table, &self.mappings.read());
        for (target, source) in plan {
            info!("telling {} to sync with {}", target, source);
            if let Err(e) = self.member.send_sync_command(target, source) {
                warn!("could not send sync command to {}: {}", target, e);
            }
        }
    }

    /// Detaches from the groups and stops tracking addresses.
    pub fn shutdown(&self) {
        self.member.leave();
        if let Some(h) = self.listener.lock().take() {
            let _ = h.join();
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn unexpected(reply: Reply) -> Error {
    Error::UnexpectedReply(format!("{:?}", reply))
}

fn track_addresses(
    me: Address,
    mappings: &RwLock<HashMap<Address, Address>>,
    events: Receiver<GroupEvent>,
) {
    for event in events.iter() {
        match event {
            GroupEvent::Message {
                body: Multicast::Announce { rpc, multicast },
                ..
            } => {
                info!("coordinator {} added {} -> {}", me, rpc, multicast);
                mappings.write().insert(rpc, multicast);
            }
            GroupEvent::RpcView(view) => {
                let mut m = mappings.write();
                let rebuilt = rebuild_mappings(&m, &view);
                *m = rebuilt;
                debug!(
                    "coordinator {} sees rpc {}, mappings [{}]",
                    me,
                    view,
                    m.iter().map(|(r, c)| format!("{} -> {}", r, c)).join(", ")
                );
            }
            other => trace!("coordinator {} ignoring {:?}", me, other),
        }
    }
}
