// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Address, Auction, AuctionId, BidOutcome, Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Requests fanned out by the coordinator over the RPC group. Every replica
/// answers every request with exactly one `Reply`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Fingerprint,
    AddAuction(Auction),
    RemoveAuction {
        requester: String,
        id: AuctionId,
    },
    PlaceBid {
        id: AuctionId,
        amount: f64,
        name: String,
        email: String,
    },
    Listings,
}

/// Replies are compared for equality when the coordinator tallies votes, so
/// they carry the whole answer (a removed `Auction`, the full listing text)
/// rather than a summary of it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Fingerprint(i64),
    Added(Option<AuctionId>),
    Removed(Option<Auction>),
    Bid(BidOutcome),
    Listings(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Pull a snapshot from `peer` and replace local state with it.
    Sync,
}

/// Bodies posted on the multicast group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Multicast {
    Command { command: Command, peer: Address },
    /// Sent by a replica once it serves RPCs, so that the coordinator can
    /// translate RPC-group addresses into multicast-group addresses.
    Announce { rpc: Address, multicast: Address },
}

/// A multicast message. `to` narrows delivery to a single member; `None`
/// means everyone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: Address,
    pub to: Option<Address>,
    pub body: Multicast,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| Error::Codec(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| Error::Codec(e.to_string()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Channel, Snapshot};

    #[test]
    fn snapshot_survives_the_wire() {
        let mut snap = Snapshot {
            next_id: 1002,
            auctions: im::OrdMap::new(),
            fingerprint: -17,
        };
        snap.auctions.insert(1000, Auction::new("alice", 1.25, "lamp", 3.0));
        snap.auctions.insert(1001, Auction::new("bob", 0.0, "chair", 0.0));
        let back: Snapshot = decode(&encode(&snap).unwrap()).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn sync_command_survives_the_wire() {
        let env = Envelope {
            from: Address::new(Channel::Multicast, 1),
            to: Some(Address::new(Channel::Multicast, 4)),
            body: Multicast::Command {
                command: Command::Sync,
                peer: Address::new(Channel::Multicast, 2),
            },
        };
        let back: Envelope = decode(&encode(&env).unwrap()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        match decode::<Reply>(&[0xff, 0xff, 0xff]) {
            Err(Error::Codec(_)) => (),
            other => panic!("unexpected {:?}", other),
        }
    }
}
