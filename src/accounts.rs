// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::NO_EMAIL;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

/// Where bidder contact details come from. Bidders never supply their own
/// email; the server looks it up from their account.
pub trait Accounts: Send + Sync {
    fn email_of(&self, user: &str) -> Option<String>;

    fn email_or_placeholder(&self, user: &str) -> String {
        self.email_of(user).unwrap_or_else(|| NO_EMAIL.to_string())
    }
}

#[derive(Clone, Debug, Default)]
pub struct StaticAccounts {
    emails: im::HashMap<String, String>,
}

impl StaticAccounts {
    pub fn new() -> Self {
        StaticAccounts::default()
    }

    pub fn with(mut self, user: &str, email: &str) -> Self {
        self.emails.insert(user.to_string(), email.to_string());
        self
    }
}

impl Accounts for StaticAccounts {
    fn email_of(&self, user: &str) -> Option<String> {
        self.emails.get(user).cloned()
    }
}

/// Account files laid out as `<root>/<user>/Details.csv`, email on the
/// first line.
#[derive(Clone, Debug)]
pub struct DirectoryAccounts {
    root: PathBuf,
}

impl DirectoryAccounts {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        DirectoryAccounts { root: root.into() }
    }
}

impl Accounts for DirectoryAccounts {
    fn email_of(&self, user: &str) -> Option<String> {
        let path = self.root.join(user).join("Details.csv");
        match fs::read_to_string(&path) {
            Ok(text) => text.lines().next().map(|l| l.trim().to_string()),
            Err(e) => {
                warn!("no account details for {} at {}: {}", user, path.display(), e);
                None
            }
        }
    }
}
