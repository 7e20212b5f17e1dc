// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The group layer gives every process two memberships: one in a multicast
//! group, used for state transfer and sync commands, and one in an RPC group,
//! used by the coordinator to fan requests out to every replica. Both groups
//! publish ordered views (oldest member first) whenever membership changes.
//!
//! `Hub` is an in-process implementation of that layer. Every request, reply,
//! multicast envelope and snapshot crossing it is pushed through the wire
//! codec, so a payload that wouldn't survive a real network doesn't survive
//! here either. Each receiving member has a single FIFO event queue, which
//! gives per-sender FIFO delivery and no ordering across senders.
//!
//! Addresses can be isolated to simulate a partitioned or crashed member:
//! traffic to or from them is silently dropped at send time.

use crate::message::{decode, encode};
use crate::{Command, Envelope, Error, Multicast, Reply, Request, Result, Snapshot};
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Channel {
    Rpc,
    Multicast,
}

/// A member's address on one of the two groups. A process that belongs to
/// both groups has two unrelated addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    pub channel: Channel,
    pub id: u64,
}

impl Address {
    pub fn new(channel: Channel, id: u64) -> Self {
        Address { channel, id }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel {
            Channel::Rpc => write!(f, "rpc#{}", self.id),
            Channel::Multicast => write!(f, "mc#{}", self.id),
        }
    }
}

/// Live members of one group, oldest first. Views are replaced wholesale on
/// every change and `id` increases each time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct View {
    pub id: u64,
    pub members: im::Vector<Address>,
}

impl View {
    pub fn contains(&self, a: &Address) -> bool {
        self.members.contains(a)
    }

    pub fn position(&self, a: &Address) -> Option<usize> {
        self.members.iter().position(|m| m == a)
    }

    /// The member that has been around longest, other than `me`. This is
    /// where a newcomer gets its state from.
    pub fn oldest_other(&self, me: &Address) -> Option<Address> {
        self.members.iter().find(|m| *m != me).copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view #{} [{}]", self.id, self.members.iter().join(", "))
    }
}

/// What a member's event queue delivers, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum GroupEvent {
    MulticastView(View),
    RpcView(View),
    Message { from: Address, body: Multicast },
}

/// Produces this member's state when someone asks for a transfer.
pub type StateProvider = Arc<dyn Fn() -> Snapshot + Send + Sync>;

/// Serves one RPC. Invoked on its own thread per request.
pub type RpcHandler = Arc<dyn Fn(Request) -> Reply + Send + Sync>;

struct Subscriber {
    address: Address,
    events: Sender<GroupEvent>,
    provider: Option<StateProvider>,
}

#[derive(Default)]
struct Groups {
    next_id: u64,
    multicast_view: View,
    rpc_view: View,
    subscribers: Vec<Subscriber>,
    handlers: HashMap<Address, RpcHandler>,
    isolated: HashSet<Address>,
}

impl Groups {
    fn allocate(&mut self, channel: Channel) -> Address {
        self.next_id += 1;
        Address::new(channel, self.next_id)
    }

    fn reachable(&self, a: &Address) -> bool {
        !self.isolated.contains(a)
    }

    fn publish(&self, event: GroupEvent) {
        for s in self.subscribers.iter() {
            let _ = s.events.send(event.clone());
        }
    }

    fn set_multicast_members(&mut self, members: im::Vector<Address>) {
        self.multicast_view = View {
            id: self.multicast_view.id + 1,
            members,
        };
        debug!("multicast group now {}", self.multicast_view);
        self.publish(GroupEvent::MulticastView(self.multicast_view.clone()));
    }

    fn set_rpc_members(&mut self, members: im::Vector<Address>) {
        self.rpc_view = View {
            id: self.rpc_view.id + 1,
            members,
        };
        debug!("rpc group now {}", self.rpc_view);
        self.publish(GroupEvent::RpcView(self.rpc_view.clone()));
    }
}

/// Shared handle on both groups. Cloning it is cheap and every clone refers
/// to the same groups.
#[derive(Clone, Default)]
pub struct Hub {
    groups: Arc<Mutex<Groups>>,
}

impl Hub {
    pub fn new() -> Self {
        Hub::default()
    }

    /// Joins the multicast group as a state-holding member. The returned
    /// queue starts with the view that includes the newcomer.
    pub fn join(&self, provider: StateProvider) -> (GroupMember, Receiver<GroupEvent>) {
        let (tx, rx) = channel();
        let mut g = self.groups.lock();
        let address = g.allocate(Channel::Multicast);
        g.subscribers.push(Subscriber {
            address,
            events: tx,
            provider: Some(provider),
        });
        let mut members = g.multicast_view.members.clone();
        members.push_back(address);
        g.set_multicast_members(members);
        (self.member(address), rx)
    }

    /// Attaches without joining the multicast view: the member can post
    /// messages, fan out RPCs and observe both groups, but holds no state.
    /// The returned queue starts with the current views.
    pub fn attach(&self) -> (GroupMember, Receiver<GroupEvent>) {
        let (tx, rx) = channel();
        let mut g = self.groups.lock();
        let address = g.allocate(Channel::Multicast);
        let _ = tx.send(GroupEvent::MulticastView(g.multicast_view.clone()));
        let _ = tx.send(GroupEvent::RpcView(g.rpc_view.clone()));
        g.subscribers.push(Subscriber {
            address,
            events: tx,
            provider: None,
        });
        debug!("observer {} attached", address);
        (self.member(address), rx)
    }

    fn member(&self, address: Address) -> GroupMember {
        GroupMember {
            hub: self.clone(),
            address,
            rpc: Mutex::new(None),
        }
    }

    pub fn isolate(&self, a: Address) {
        debug!("isolating {}", a);
        self.groups.lock().isolated.insert(a);
    }

    pub fn heal(&self, a: Address) {
        debug!("healing {}", a);
        self.groups.lock().isolated.remove(&a);
    }

    pub fn multicast_view(&self) -> View {
        self.groups.lock().multicast_view.clone()
    }

    pub fn rpc_view(&self) -> View {
        self.groups.lock().rpc_view.clone()
    }
}

/// One process's handle on the groups.
pub struct GroupMember {
    hub: Hub,
    address: Address,
    rpc: Mutex<Option<Address>>,
}

impl GroupMember {
    /// This member's multicast-group address.
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn rpc_address(&self) -> Option<Address> {
        *self.rpc.lock()
    }

    pub fn view(&self) -> View {
        self.hub.multicast_view()
    }

    pub fn rpc_view(&self) -> View {
        self.hub.rpc_view()
    }

    /// Joins the RPC group; from here on `handler` answers every fan-out.
    pub fn join_rpc(&self, handler: RpcHandler) -> Address {
        let mut g = self.hub.groups.lock();
        let address = g.allocate(Channel::Rpc);
        g.handlers.insert(address, handler);
        let mut members = g.rpc_view.members.clone();
        members.push_back(address);
        g.set_rpc_members(members);
        *self.rpc.lock() = Some(address);
        address
    }

    /// Leaves both groups. Dropping out of the subscriber list closes this
    /// member's event queue.
    pub fn leave(&self) {
        let mut g = self.hub.groups.lock();
        let before = g.subscribers.len();
        g.subscribers.retain(|s| s.address != self.address);
        if g.subscribers.len() == before {
            return;
        }
        debug!("member {} leaving", self.address);
        if g.multicast_view.contains(&self.address) {
            let members = g
                .multicast_view
                .members
                .iter()
                .filter(|m| **m != self.address)
                .copied()
                .collect();
            g.set_multicast_members(members);
        }
        if let Some(rpc) = self.rpc.lock().take() {
            g.handlers.remove(&rpc);
            let members = g
                .rpc_view
                .members
                .iter()
                .filter(|m| **m != rpc)
                .copied()
                .collect();
            g.set_rpc_members(members);
        }
    }

    /// Posts `body` on the multicast group, to `to` only or to everyone else.
    pub fn send(&self, to: Option<Address>, body: Multicast) -> Result<()> {
        let envelope = Envelope {
            from: self.address,
            to,
            body,
        };
        let bytes = encode(&envelope)?;
        let g = self.hub.groups.lock();
        if let Some(t) = to {
            if !g.subscribers.iter().any(|s| s.address == t) {
                return Err(Error::Unreachable(t));
            }
        }
        if !g.reachable(&self.address) {
            trace!("{} is isolated, dropping {:?}", self.address, envelope.body);
            return Ok(());
        }
        for s in g.subscribers.iter() {
            if s.address == self.address || !g.reachable(&s.address) {
                continue;
            }
            if to.map_or(true, |t| t == s.address) {
                let Envelope { from, body, .. } = decode::<Envelope>(&bytes)?;
                let _ = s.events.send(GroupEvent::Message { from, body });
            }
        }
        Ok(())
    }

    /// Tells `target` to replace its state with a snapshot pulled from
    /// `source`.
    pub fn send_sync_command(&self, target: Address, source: Address) -> Result<()> {
        debug!("{} asking {} to sync from {}", self.address, target, source);
        self.send(
            Some(target),
            Multicast::Command {
                command: Command::Sync,
                peer: source,
            },
        )
    }

    /// Publishes the pairing of this member's RPC and multicast addresses.
    pub fn announce(&self, rpc: Address) -> Result<()> {
        self.send(
            None,
            Multicast::Announce {
                rpc,
                multicast: self.address,
            },
        )
    }

    /// Fetches `from`'s current state, giving up after `timeout`.
    pub fn request_snapshot(&self, from: Address, timeout: Duration) -> Result<Snapshot> {
        let provider = {
            let g = self.hub.groups.lock();
            if !g.reachable(&self.address) || !g.reachable(&from) {
                return Err(Error::Unreachable(from));
            }
            g.subscribers
                .iter()
                .find(|s| s.address == from)
                .and_then(|s| s.provider.clone())
                .ok_or(Error::Unreachable(from))?
        };
        let (tx, rx) = channel();
        thread::spawn(move || {
            let _ = tx.send(encode(&provider()));
        });
        let bytes = rx.recv_timeout(timeout).map_err(|_| Error::Timeout(from))??;
        debug!("{} received {} bytes of state from {}", self.address, bytes.len(), from);
        decode(&bytes)
    }

    /// Sends `request` to every reachable RPC-group member and collects
    /// whatever replies arrive before `timeout`. Members that stay silent
    /// are simply missing from the result.
    pub fn call_all(&self, request: &Request, timeout: Duration) -> Vec<(Address, Reply)> {
        let bytes = match encode(request) {
            Ok(b) => b,
            Err(e) => {
                warn!("{} could not encode {:?}: {}", self.address, request, e);
                return Vec::new();
            }
        };
        let targets: Vec<(Address, RpcHandler)> = {
            let g = self.hub.groups.lock();
            if !g.reachable(&self.address) {
                return Vec::new();
            }
            g.rpc_view
                .members
                .iter()
                .filter(|a| g.reachable(a))
                .filter_map(|a| g.handlers.get(a).map(|h| (*a, h.clone())))
                .collect()
        };
        let (tx, rx) = channel();
        for (address, handler) in targets.iter() {
            let (address, handler, tx, bytes) = (*address, handler.clone(), tx.clone(), bytes.clone());
            thread::spawn(move || {
                let reply = decode(&bytes).map(|req| handler(req)).and_then(|rep| encode(&rep));
                let _ = tx.send((address, reply));
            });
        }
        drop(tx);

        let deadline = Instant::now() + timeout;
        let mut answered = 0;
        let mut replies = Vec::with_capacity(targets.len());
        while answered < targets.len() {
            let left = deadline.saturating_duration_since(Instant::now());
            let (address, reply) = match rx.recv_timeout(left) {
                Ok(r) => r,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "{} got {} of {} replies before timing out",
                        self.address,
                        answered,
                        targets.len()
                    );
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            answered += 1;
            match reply.and_then(|b| decode::<Reply>(&b)) {
                Ok(r) => replies.push((address, r)),
                Err(e) => warn!("dropping reply from {}: {}", address, e),
            }
        }
        replies
    }
}
