// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

/// Identity of the local speaker.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RouterConfig {
    /// Local autonomous system number.
    pub asn: u32,

    /// BGP identifier placed in outgoing OPEN messages.
    pub id: Ipv4Addr,
}

/// The single upstream peer a session announces to.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct PeerConfig {
    pub host: SocketAddr,

    /// ASN the peer is required to present in its OPEN.
    pub asn: u32,

    /// Hold time proposed to the peer, in seconds. Zero disables
    /// keepalives, otherwise must be at least 3 per RFC 4271 §4.2.
    pub hold_time: u64,
}
