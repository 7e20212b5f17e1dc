// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate is a small actively-replicated auction service. A single
 * coordinator fronts any number of identical replicas, and every client
 * operation is executed on _all_ of them:
 *
 *   - The coordinator first asks every replica for a cheap fingerprint of its
 *     state, purely to spot drift.
 *
 *   - It then sends the real request to every replica, collects whatever
 *     replies arrive before a timeout, and takes the most common reply as the
 *     answer.
 *
 *   - Every replica that answered differently is told to throw its state away
 *     and copy a replica that answered with the majority.
 *
 * New replicas join by pulling a snapshot from the longest-standing existing
 * replica before they start answering requests, so a cluster can grow and
 * shrink while it runs.
 *
 * This is _not_ consensus, and doesn't try to be. A majority of replicas that
 * are wrong in the same way will win the vote and "repair" the correct ones,
 * repair happens after the answer has already been returned, and the
 * fingerprint is additive and so can't tell every pair of different states
 * apart. What you get in exchange is a very small amount of machinery.
 *
 * ## Layout
 *
 * The group layer (`Hub`, `GroupMember`, views) lives in `group`, and every
 * payload crossing it goes through the `bincode` codec in `message`. A
 * replica's data lives in `replica`, and `node` glues a replica onto the
 * groups. The voting and repair logic is in `coordinator`; `session` layers
 * per-user seller and bidder capabilities on top of it.
 *
 * ## Name
 *
 * Something is _quorate_ when enough members are present for its decisions
 * to count.
 */

mod accounts;
mod auction;
mod config;
mod coordinator;
mod error;
mod fingerprint;
mod group;
pub mod message;
mod node;
mod replica;
mod session;

pub use accounts::{Accounts, DirectoryAccounts, StaticAccounts};
pub use auction::{format_listings, Auction, AuctionId, BidOutcome, CloseOutcome, NO_BIDDER, NO_EMAIL};
pub use config::Config;
pub use coordinator::{repair_plan, Coordinator, VoteTable};
pub use error::{Error, Result};
pub use fingerprint::Fingerprint;
pub use group::{
    Address, Channel, GroupEvent, GroupMember, Hub, RpcHandler, StateProvider, View,
};
pub use message::{Command, Envelope, Multicast, Reply, Request};
pub use node::{serve, ReplicaNode};
pub use replica::{Replica, Snapshot};
pub use session::{
    Bidder, BidderSession, Seller, SellerSession, Session, SessionKind, SessionStore,
};

#[cfg(test)]
mod tests;
