// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type AuctionId = u32;

/// Bidder name carried by an auction nobody has bid on yet.
pub const NO_BIDDER: &str = "***No one***";
/// Bidder email carried by an auction nobody has bid on yet.
pub const NO_EMAIL: &str = "***No Email***";

/// A single auction. Equality is field-wise, which is what the coordinator
/// relies on when it compares replies from different replicas: two copies of
/// an auction held by two replicas are "the same" only if every field
/// matches.
///
/// The reserve price, description and owner are fixed at construction. The
/// current price only ever rises, and only through `record_bid`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Auction {
    current_price: f64,
    reserve_price: f64,
    description: String,
    owner: String,
    bidder_name: String,
    bidder_email: String,
}

impl Auction {
    pub fn new(owner: &str, start_price: f64, description: &str, reserve_price: f64) -> Self {
        Auction {
            current_price: start_price,
            reserve_price,
            description: description.to_string(),
            owner: owner.to_string(),
            bidder_name: NO_BIDDER.to_string(),
            bidder_email: NO_EMAIL.to_string(),
        }
    }

    pub fn current_price(&self) -> f64 {
        self.current_price
    }
    pub fn reserve_price(&self) -> f64 {
        self.reserve_price
    }
    pub fn description(&self) -> &str {
        &self.description
    }
    pub fn owner(&self) -> &str {
        &self.owner
    }
    pub fn bidder_name(&self) -> &str {
        &self.bidder_name
    }
    pub fn bidder_email(&self) -> &str {
        &self.bidder_email
    }

    /// Accepts the bid iff `amount` strictly exceeds the current price.
    pub(crate) fn record_bid(&mut self, amount: f64, name: &str, email: &str) -> bool {
        if amount > self.current_price {
            self.current_price = amount;
            self.bidder_name = name.to_string();
            self.bidder_email = email.to_string();
            true
        } else {
            false
        }
    }

    /// What closing this auction amounts to. The reserve has to be strictly
    /// beaten for the item to count as sold.
    pub fn conclude(&self) -> CloseOutcome {
        if self.reserve_price < self.current_price {
            CloseOutcome::Sold {
                winner_name: self.bidder_name.clone(),
                winner_email: self.bidder_email.clone(),
                final_price: self.current_price,
            }
        } else {
            CloseOutcome::ReserveNotMet {
                reserve: self.reserve_price,
                final_price: self.current_price,
            }
        }
    }
}

/// Result of asking to close an auction.
#[derive(Clone, Debug, PartialEq)]
pub enum CloseOutcome {
    Sold {
        winner_name: String,
        winner_email: String,
        final_price: f64,
    },
    ReserveNotMet {
        reserve: f64,
        final_price: f64,
    },
    /// The auction does not exist, is already closed, or belongs to someone
    /// else. These cases are deliberately indistinguishable.
    NotPermittedOrAbsent(AuctionId),
}

impl fmt::Display for CloseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseOutcome::Sold {
                winner_name,
                winner_email,
                ..
            } => write!(
                f,
                "[Auction Closed]\nThe winner is: {} with email: {}",
                winner_name, winner_email
            ),
            CloseOutcome::ReserveNotMet {
                reserve,
                final_price,
            } => write!(
                f,
                "[Auction Closed]\nThis auction failed to meet its reserved price of {} with highest bid {}",
                reserve, final_price
            ),
            CloseOutcome::NotPermittedOrAbsent(id) => write!(
                f,
                "You can't remove auction with auctionID {}. This may be because it does not exist, \
                 has already been removed or you don't own it.",
                id
            ),
        }
    }
}

/// Result of a bid as seen by one replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BidOutcome {
    Accepted,
    TooLow,
    NoSuchAuction,
}

impl BidOutcome {
    pub fn is_accepted(&self) -> bool {
        *self == BidOutcome::Accepted
    }
}

const SEPARATOR: &str =
    "------------------------------------------------------------------------------";

/// Formats the listing table for a sequence of `(id, auction)` pairs. The
/// caller decides the row order.
pub fn format_listings<'a, I>(rows: I) -> String
where
    I: IntoIterator<Item = (AuctionId, &'a Auction)>,
{
    let rows = rows
        .into_iter()
        .map(|(id, a)| {
            format!(
                "|{:<10}|{:<11.2}|{:<12}|{:<40}|",
                id, a.current_price, a.bidder_name, a.description
            )
        })
        .collect::<Vec<String>>();
    if rows.is_empty() {
        return "There are no listings.".to_string();
    }
    let header = format!(
        "|{:<10}|{:<11}|{:<12}|{:<40}|",
        "Auction ID", "Highest Bid", "Name", "Description"
    );
    std::iter::once(SEPARATOR.to_string())
        .chain(std::iter::once(header))
        .chain(std::iter::once(SEPARATOR.to_string()))
        .chain(rows)
        .chain(std::iter::once(SEPARATOR.to_string()))
        .map(|line| line + "\n")
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_auction_has_no_bidder() {
        let a = Auction::new("alice", 10.0, "item", 50.0);
        assert_eq!(a.bidder_name(), NO_BIDDER);
        assert_eq!(a.bidder_email(), NO_EMAIL);
        assert_eq!(a.current_price(), 10.0);
    }

    #[test]
    fn only_strictly_higher_bids_are_recorded() {
        let mut a = Auction::new("alice", 10.0, "item", 50.0);
        assert!(!a.record_bid(10.0, "bob", "bob@example.com"));
        assert_eq!(a.bidder_name(), NO_BIDDER);
        assert!(a.record_bid(40.0, "bob", "bob@example.com"));
        assert_eq!(a.current_price(), 40.0);
        assert_eq!(a.bidder_email(), "bob@example.com");
        assert!(!a.record_bid(5.0, "carol", "carol@example.com"));
        assert_eq!(a.bidder_name(), "bob");
    }

    #[test]
    fn equality_is_field_wise() {
        let a = Auction::new("alice", 10.0, "item", 50.0);
        let mut b = Auction::new("alice", 10.0, "item", 50.0);
        assert_eq!(a, b);
        b.record_bid(11.0, "bob", "b@x");
        assert_ne!(a, b);
        assert_ne!(a, Auction::new("mallory", 10.0, "item", 50.0));
    }

    #[test]
    fn conclude_requires_beating_reserve() {
        let mut a = Auction::new("alice", 10.0, "item", 50.0);
        a.record_bid(50.0, "bob", "b@x");
        assert_eq!(
            a.conclude(),
            CloseOutcome::ReserveNotMet {
                reserve: 50.0,
                final_price: 50.0
            }
        );
        a.record_bid(51.0, "carol", "c@x");
        assert_eq!(
            a.conclude(),
            CloseOutcome::Sold {
                winner_name: "carol".into(),
                winner_email: "c@x".into(),
                final_price: 51.0
            }
        );
        assert!(a.conclude().to_string().contains("The winner is: carol with email: c@x"));
    }

    #[test]
    fn listing_table_layout() {
        assert_eq!(format_listings(std::iter::empty()), "There are no listings.");
        let a = Auction::new("alice", 10.0, "lamp", 50.0);
        let table = format_listings(vec![(1000, &a)]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], SEPARATOR);
        assert!(lines[1].starts_with("|Auction ID|Highest Bid|Name        |Description"));
        assert!(lines[3].starts_with("|1000      |10.00      |***No one***|lamp"));
        assert_eq!(lines[4], SEPARATOR);
    }
}
