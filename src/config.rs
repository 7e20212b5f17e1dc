// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::AuctionId;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Knobs shared by the coordinator and the replicas.
#[derive(Clone, Debug)]
pub struct Config {
    /// How long a fan-out waits for replies.
    pub rpc_timeout: Duration,
    /// How long a single snapshot request may take.
    pub state_timeout: Duration,
    /// Pause between failed snapshot attempts while joining.
    pub join_retry_delay: Duration,
    pub first_auction_id: AuctionId,
    /// Consecutive taken ids after which allocation gives up.
    pub id_probe_limit: u32,
    /// Sessions idle longer than this are evicted.
    pub max_idle: Duration,
    /// `start_price, description, min_price` rows loaded by the first
    /// replica.
    pub seed_file: Option<PathBuf>,
    /// Directory of per-user `<user>/Details.csv` account files.
    pub accounts_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rpc_timeout: Duration::from_secs(5),
            state_timeout: Duration::from_secs(5),
            join_retry_delay: Duration::from_millis(100),
            first_auction_id: 1000,
            id_probe_limit: 5000,
            max_idle: Duration::from_secs(30 * 60),
            seed_file: None,
            accounts_dir: None,
        }
    }
}

impl Config {
    /// Defaults, overridden by any `QUORATE_*` variables that are set.
    pub fn from_env() -> Self {
        Config::default().overlay(|k| std::env::var(k).ok())
    }

    fn overlay<F: Fn(&str) -> Option<String>>(mut self, var: F) -> Self {
        let millis = |k: &str| {
            let v = var(k)?;
            match v.parse::<u64>() {
                Ok(ms) => Some(Duration::from_millis(ms)),
                Err(_) => {
                    warn!("ignoring {}={:?}: not a number of milliseconds", k, v);
                    None
                }
            }
        };
        if let Some(d) = millis("QUORATE_RPC_TIMEOUT_MS") {
            self.rpc_timeout = d;
        }
        if let Some(d) = millis("QUORATE_STATE_TIMEOUT_MS") {
            self.state_timeout = d;
        }
        if let Some(p) = var("QUORATE_SEED_FILE") {
            self.seed_file = Some(p.into());
        }
        if let Some(p) = var("QUORATE_ACCOUNTS_DIR") {
            self.accounts_dir = Some(p.into());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn overlay_replaces_only_what_is_set() {
        let mut env = HashMap::new();
        env.insert("QUORATE_RPC_TIMEOUT_MS", "250");
        env.insert("QUORATE_STATE_TIMEOUT_MS", "soon");
        env.insert("QUORATE_SEED_FILE", "auctions.csv");
        let cfg = Config::default().overlay(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.rpc_timeout, Duration::from_millis(250));
        assert_eq!(cfg.state_timeout, Duration::from_secs(5));
        assert_eq!(cfg.seed_file, Some(PathBuf::from("auctions.csv")));
        assert_eq!(cfg.accounts_dir, None);
        assert_eq!(cfg.first_auction_id, 1000);
    }
}
