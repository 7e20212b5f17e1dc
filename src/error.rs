// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::Address;

/// Failures that are not ordinary operation outcomes. Ownership mismatches,
/// missing auctions and losing bids are reported through `CloseOutcome` and
/// `BidOutcome` instead, so that callers can tell a valid negative answer
/// apart from a transport problem.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no replica replied within the timeout")]
    NoReplies,

    #[error("auction id space exhausted")]
    CapacityExhausted,

    #[error("member {0} is unreachable")]
    Unreachable(Address),

    #[error("timed out waiting for state from {0}")]
    Timeout(Address),

    #[error("wire codec error: {0}")]
    Codec(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad seed row on line {line}: {reason}")]
    BadSeedRow { line: usize, reason: String },

    #[error("unexpected reply {0}")]
    UnexpectedReply(String),

    #[error("unknown session kind {0:?}")]
    UnknownSessionKind(String),
}

pub type Result<T> = std::result::Result<T, Error>;
