// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{format_listings, Auction, AuctionId, BidOutcome, Config, Error, Fingerprint, Result};
use im::OrdMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything a joining or repairing replica needs to take over another
/// replica's state wholesale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub next_id: AuctionId,
    pub auctions: OrdMap<AuctionId, Auction>,
    pub fingerprint: i64,
}

// The map lock guards structure (which ids exist, and the allocator); each
// record has its own lock guarding its fields. Whenever both are held, the
// map lock is taken first.
struct Table {
    next_id: AuctionId,
    auctions: OrdMap<AuctionId, Arc<Mutex<Auction>>>,
}

/// `Replica` is the replicated state machine held by every auction server.
/// Every operation here is purely local; the coordinator is responsible for
/// invoking the same operation on every replica and reconciling the answers.
///
/// Negative answers (capacity exhausted, not the owner, no such auction, bid
/// too low) are returned as values, never as errors, so that they can be
/// voted on like any other reply.
pub struct Replica {
    table: RwLock<Table>,
    fingerprint: Fingerprint,
    probe_limit: u32,
}

impl Replica {
    pub fn new(cfg: &Config) -> Self {
        Replica {
            table: RwLock::new(Table {
                next_id: cfg.first_auction_id,
                auctions: OrdMap::new(),
            }),
            fingerprint: Fingerprint::default(),
            probe_limit: cfg.id_probe_limit,
        }
    }

    /// Inserts `a` under the next free id. Returns `None` once `probe_limit`
    /// consecutive ids turn out to be taken.
    pub fn add_auction(&self, a: Auction) -> Option<AuctionId> {
        let mut table = self.table.write();
        let mut attempts = 0;
        while table.auctions.contains_key(&table.next_id) {
            if attempts >= self.probe_limit {
                warn!("gave up allocating an id after {} probes", attempts);
                return None;
            }
            table.next_id = table.next_id.checked_add(1)?;
            attempts += 1;
        }
        let id = table.next_id;
        self.fingerprint.record_insert(id, &a);
        table.auctions.insert(id, Arc::new(Mutex::new(a)));
        debug!("added auction #{}", id);
        Some(id)
    }

    /// Removes auction `id` if `requester` owns it. Absence and a foreign
    /// owner both give `None` and leave the state untouched.
    pub fn remove_auction(&self, requester: &str, id: AuctionId) -> Option<Auction> {
        let mut table = self.table.write();
        let record = table.auctions.get(&id)?.clone();
        let removed = {
            let a = record.lock();
            if a.owner() != requester {
                debug!("{} may not remove auction #{}", requester, id);
                return None;
            }
            a.clone()
        };
        self.fingerprint.record_remove(id, requester);
        table.auctions.remove(&id);
        debug!("removed auction #{}", id);
        Some(removed)
    }

    pub fn place_bid(&self, id: AuctionId, amount: f64, name: &str, email: &str) -> BidOutcome {
        // Held across the record update so that snapshot and restore, which
        // take the map exclusively, never see a bid half-applied.
        let table = self.table.read();
        let mut a = match table.auctions.get(&id) {
            Some(r) => r.lock(),
            None => return BidOutcome::NoSuchAuction,
        };
        if a.record_bid(amount, name, email) {
            self.fingerprint.record_bid(amount, name, email);
            debug!("auction #{} now at {} from {}", id, amount, name);
            BidOutcome::Accepted
        } else {
            BidOutcome::TooLow
        }
    }

    /// The listing table, rows in ascending id order.
    pub fn listings(&self) -> String {
        let rows: Vec<(AuctionId, Auction)> = self
            .table
            .read()
            .auctions
            .iter()
            .map(|(id, r)| (*id, r.lock().clone()))
            .collect();
        format_listings(rows.iter().map(|(id, a)| (*id, a)))
    }

    pub fn fingerprint(&self) -> i64 {
        self.fingerprint.value()
    }

    pub fn len(&self) -> usize {
        self.table.read().auctions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Snapshot {
        let table = self.table.write();
        let auctions = table
            .auctions
            .iter()
            .map(|(id, r)| (*id, r.lock().clone()))
            .collect();
        Snapshot {
            next_id: table.next_id,
            auctions,
            fingerprint: self.fingerprint.value(),
        }
    }

    pub fn restore(&self, snapshot: &Snapshot) {
        let mut table = self.table.write();
        table.next_id = snapshot.next_id;
        table.auctions = snapshot
            .auctions
            .iter()
            .map(|(id, a)| (*id, Arc::new(Mutex::new(a.clone()))))
            .collect();
        self.fingerprint.reset(snapshot.fingerprint);
        info!("{} auctions loaded from snapshot", table.auctions.len());
    }

    /// Loads test auctions from `start_price, description, min_price` rows,
    /// numbering them from 0. Ids already in use are overwritten. The
    /// allocator is left alone.
    pub fn seed_from<R: BufRead>(&self, reader: R) -> Result<usize> {
        let mut rows = Vec::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            rows.push(parse_seed_row(n + 1, &line)?);
        }
        let mut table = self.table.write();
        for (id, a) in (0..).zip(rows.iter()) {
            self.fingerprint.record_insert(id, a);
            table.auctions.insert(id, Arc::new(Mutex::new(a.clone())));
        }
        info!("added {} test auctions", rows.len());
        Ok(rows.len())
    }

    pub fn seed_from_file(&self, path: &Path) -> Result<usize> {
        self.seed_from(BufReader::new(File::open(path)?))
    }
}

fn parse_seed_row(line: usize, text: &str) -> Result<Auction> {
    let bad = |reason: &str| Error::BadSeedRow {
        line,
        reason: reason.to_string(),
    };
    let fields: Vec<&str> = text.split(',').map(str::trim).collect();
    if fields.len() != 3 {
        return Err(bad("expected start price, description, min price"));
    }
    let start: f64 = fields[0].parse().map_err(|_| bad("start price is not a number"))?;
    let min: f64 = fields[2].parse().map_err(|_| bad("min price is not a number"))?;
    Ok(Auction::new("Test", start, fields[1], min))
}
