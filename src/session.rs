// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{AuctionId, BidOutcome, CloseOutcome, Coordinator, Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// The capability set a client asks for when its session is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Seller,
    Bidder,
}

impl FromStr for SessionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Seller" => Ok(SessionKind::Seller),
            "Bidder" => Ok(SessionKind::Bidder),
            other => Err(Error::UnknownSessionKind(other.to_string())),
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Seller => write!(f, "Seller"),
            SessionKind::Bidder => write!(f, "Bidder"),
        }
    }
}

pub trait Seller {
    fn create_auction(&self, start_price: f64, description: &str, min_price: f64)
        -> Result<AuctionId>;
    fn close_auction(&self, id: AuctionId) -> Result<CloseOutcome>;
}

pub trait Bidder {
    fn bid(&self, id: AuctionId, amount: f64) -> Result<BidOutcome>;
    fn listings(&self) -> Result<String>;
}

/// Shared by both kinds of session: who the caller is and when they last
/// did anything.
struct Activity {
    user: String,
    coordinator: Arc<Coordinator>,
    last_active: Mutex<Instant>,
}

impl Activity {
    fn new(user: &str, coordinator: Arc<Coordinator>) -> Self {
        Activity {
            user: user.to_string(),
            coordinator,
            last_active: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) -> &Coordinator {
        *self.last_active.lock() = Instant::now();
        &self.coordinator
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_active.lock())
    }
}

/// A seller acting as an already-authenticated user.
pub struct SellerSession(Activity);

impl SellerSession {
    pub fn user(&self) -> &str {
        &self.0.user
    }
}

impl Seller for SellerSession {
    /// Negative prices are treated as zero.
    fn create_auction(
        &self,
        start_price: f64,
        description: &str,
        min_price: f64,
    ) -> Result<AuctionId> {
        let c = self.0.touch();
        c.create_auction(&self.0.user, start_price.max(0.0), description, min_price.max(0.0))
    }

    fn close_auction(&self, id: AuctionId) -> Result<CloseOutcome> {
        self.0.touch().close_auction(&self.0.user, id)
    }
}

/// A bidder acting as an already-authenticated user.
pub struct BidderSession(Activity);

impl BidderSession {
    pub fn user(&self) -> &str {
        &self.0.user
    }
}

impl Bidder for BidderSession {
    fn bid(&self, id: AuctionId, amount: f64) -> Result<BidOutcome> {
        self.0.touch().place_bid(id, amount, &self.0.user)
    }

    fn listings(&self) -> Result<String> {
        self.0.touch().listings()
    }
}

#[derive(Clone)]
pub enum Session {
    Seller(Arc<SellerSession>),
    Bidder(Arc<BidderSession>),
}

impl Session {
    pub fn kind(&self) -> SessionKind {
        match self {
            Session::Seller(_) => SessionKind::Seller,
            Session::Bidder(_) => SessionKind::Bidder,
        }
    }

    pub fn as_seller(&self) -> Option<&SellerSession> {
        match self {
            Session::Seller(s) => Some(s.as_ref()),
            Session::Bidder(_) => None,
        }
    }

    pub fn as_bidder(&self) -> Option<&BidderSession> {
        match self {
            Session::Bidder(b) => Some(b.as_ref()),
            Session::Seller(_) => None,
        }
    }

    fn activity(&self) -> &Activity {
        match self {
            Session::Seller(s) => &s.0,
            Session::Bidder(b) => &b.0,
        }
    }
}

/// Every open session in the coordinator process, keyed by kind and user.
///
/// Callers reach this store only after authenticating, so `open` takes the
/// user name on trust. Opening a session that already exists hands back the
/// existing one.
pub struct SessionStore {
    coordinator: Arc<Coordinator>,
    sessions: RwLock<HashMap<(SessionKind, String), Session>>,
}

impl SessionStore {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        SessionStore {
            coordinator,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn open(&self, kind: SessionKind, user: &str) -> Session {
        let mut sessions = self.sessions.write();
        let key = (kind, user.to_string());
        if let Some(s) = sessions.get(&key) {
            s.activity().touch();
            return s.clone();
        }
        let activity = Activity::new(user, self.coordinator.clone());
        let session = match kind {
            SessionKind::Seller => Session::Seller(Arc::new(SellerSession(activity))),
            SessionKind::Bidder => Session::Bidder(Arc::new(BidderSession(activity))),
        };
        info!("opened {} session for {}", kind, user);
        sessions.insert(key, session.clone());
        session
    }

    pub fn get(&self, kind: SessionKind, user: &str) -> Option<Session> {
        self.sessions.read().get(&(kind, user.to_string())).cloned()
    }

    /// Returns whether there was a session to close.
    pub fn logout(&self, kind: SessionKind, user: &str) -> bool {
        let gone = self.sessions.write().remove(&(kind, user.to_string())).is_some();
        if gone {
            info!("{} session for {} logged out", kind, user);
        }
        gone
    }

    /// Drops every session idle for longer than `max_idle`, returning how
    /// many went.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|(kind, user), s| {
            let keep = s.activity().idle_for(now) <= max_idle;
            if !keep {
                debug!("evicting idle {} session for {}", kind, user);
            }
            keep
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
