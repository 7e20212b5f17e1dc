// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A `Fingerprint` is a cheap, additive digest of everything a replica has
//! done to its state. It is not a hash of the state: each mutation adds a
//! contribution (code points of the strings it touched, prices scaled by 100
//! and floored, and the auction id involved) and nothing is ever subtracted.
//!
//! Two consequences worth keeping in mind:
//!
//!   - Addition commutes, so replicas that apply the same set of mutations in
//!     different orders agree.
//!
//!   - It is path-dependent. Two replicas that reach equal auction maps by
//!     different histories (say one saw an extra losing-then-superseded bid)
//!     will disagree, and will get repaired even though their data matches.
//!
//! Collisions are possible and accepted; this is a drift detector, and the
//! coordinator still compares full replies on every operation.

use crate::{Auction, AuctionId};
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Default)]
pub struct Fingerprint(AtomicI64);

impl Fingerprint {
    pub fn value(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self, value: i64) {
        self.0.store(value, Ordering::SeqCst)
    }

    fn add(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn record_insert(&self, id: AuctionId, a: &Auction) {
        self.add(auction_weight(a) + i64::from(id));
    }

    pub fn record_remove(&self, id: AuctionId, requester: &str) {
        self.add(text_weight(requester) + i64::from(id));
    }

    pub fn record_bid(&self, amount: f64, name: &str, email: &str) {
        self.add(price_weight(amount) + text_weight(name) + text_weight(email));
    }
}

pub fn text_weight(s: &str) -> i64 {
    s.chars().map(|c| i64::from(u32::from(c))).sum()
}

pub fn price_weight(p: f64) -> i64 {
    (p * 100.0).floor() as i64
}

pub fn auction_weight(a: &Auction) -> i64 {
    text_weight(a.bidder_email())
        + text_weight(a.bidder_name())
        + text_weight(a.description())
        + text_weight(a.owner())
        + price_weight(a.current_price())
        + price_weight(a.reserve_price())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights() {
        assert_eq!(text_weight("ab"), 97 + 98);
        assert_eq!(text_weight(""), 0);
        assert_eq!(price_weight(12.345), 1234);
        assert_eq!(price_weight(0.0), 0);
    }

    #[test]
    fn insert_counts_fields_and_id() {
        let a = Auction::new("o", 1.5, "d", 2.0);
        let fp = Fingerprint::default();
        fp.record_insert(1000, &a);
        let expected = text_weight(crate::NO_EMAIL)
            + text_weight(crate::NO_BIDDER)
            + text_weight("d")
            + text_weight("o")
            + 150
            + 200
            + 1000;
        assert_eq!(fp.value(), expected);
    }

    #[test]
    fn contributions_commute() {
        let a = Auction::new("o", 1.0, "d", 2.0);
        let x = Fingerprint::default();
        x.record_insert(1000, &a);
        x.record_bid(3.0, "n", "e");
        x.record_remove(1000, "o");
        let y = Fingerprint::default();
        y.record_remove(1000, "o");
        y.record_insert(1000, &a);
        y.record_bid(3.0, "n", "e");
        assert_eq!(x.value(), y.value());
    }
}
