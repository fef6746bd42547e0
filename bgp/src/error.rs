// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::messages::{MessageType, Prefix4};
use std::fmt::Display;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("message too small")]
    TooSmall,

    #[error("message too large")]
    TooLarge,

    #[error("no marker")]
    NoMarker,

    #[error("invalid message type {0}")]
    InvalidMessageType(u8),

    #[error("bad version")]
    BadVersion,

    #[error("invalid code {0}")]
    InvalidCode(u8),

    #[error("bad length: expected {expected} found {found}")]
    BadLength { expected: u8, found: u8 },

    #[error("unexpected message type {0:?}")]
    UnexpectedMessage(MessageType),

    #[error("unexpected ASN: {0}")]
    UnexpectedAsn(ExpectationMismatch<u32>),

    #[error("hold time too small")]
    HoldTimeTooSmall,

    #[error("hold time too large")]
    HoldTimeTooLarge,

    #[error("invalid prefix {0}")]
    InvalidPrefix(String),

    #[error("invalid prefix length {0}")]
    InvalidPrefixLength(u8),

    #[error("invalid NLRI prefix {0}")]
    InvalidNlriPrefix(Prefix4),

    #[error("too many communities: max {max}, got {got}")]
    TooManyCommunities { max: usize, got: usize },

    #[error("unsupported path attribute type code {0:?}")]
    UnsupportedPathAttributeTypeCode(crate::messages::PathAttributeTypeCode),

    #[error("unsupported capability {0:?}")]
    UnsupportedCapability(crate::messages::Capability),

    #[error("io {0}")]
    Io(#[from] std::io::Error),

    #[error("session closed")]
    Closed,
}

#[derive(Debug)]
pub struct ExpectationMismatch<T: Display> {
    pub expected: T,
    pub got: T,
}

impl<T: Display> Display for ExpectationMismatch<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected: {} got: {}", self.expected, self.got)
    }
}
