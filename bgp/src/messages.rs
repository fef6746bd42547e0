// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// BGP Message types.
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum MessageType {
    /// The first message sent by each side once a TCP connection is
    /// established.
    ///
    /// RFC 4271 §4.2
    Open = 1,

    /// Used to transfer routing information between BGP peers.
    ///
    /// RFC 4271 §4.3
    Update = 2,

    /// Sent when an error condition is detected.
    ///
    /// RFC 4271 §4.5
    Notification = 3,

    /// Exchanged between peers often enough not to cause the hold timer to
    /// expire.
    ///
    /// RFC 4271 §4.4
    KeepAlive = 4,
}

/// According to RFC 4271 §4.1 the header marker is all ones.
pub const MARKER: [u8; 16] = [0xffu8; 16];

/// Size of the fixed message header: marker, length and type.
pub const HEADER_LEN: usize = 19;

/// Largest message RFC 4271 §4.1 allows, header included.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Each BGP message has a fixed sized header.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |                                                               |
///   +                                                               +
///   |                                                               |
///   +                                                               +
///   |                           Marker                              |
///   +                                                               +
///   |                                                               |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |          Length               |      Type     |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, PartialEq, Eq)]
pub struct Header {
    /// Total length of the message, including the header. May be no larger
    /// than 4096.
    pub length: u16,

    /// Indicates the type of message.
    pub typ: MessageType,
}

impl Header {
    /// Serialize the header to wire format.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = MARKER.to_vec();
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.push(self.typ as u8);
        buf
    }

    /// Deserialize a header from wire format.
    pub fn from_wire(buf: &[u8]) -> Result<Header, Error> {
        if buf.len() < HEADER_LEN {
            return Err(Error::TooSmall);
        }
        if buf[..16] != MARKER {
            return Err(Error::NoMarker);
        }

        let typ = match MessageType::try_from(buf[18]) {
            Ok(typ) => typ,
            Err(_) => return Err(Error::InvalidMessageType(buf[18])),
        };

        Ok(Header {
            length: u16::from_be_bytes([buf[16], buf[17]]),
            typ,
        })
    }

    /// Read and deserialize a header from a stream.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Header, Error> {
        let mut buf = [0u8; HEADER_LEN];
        r.read_exact(&mut buf)?;
        Self::from_wire(&buf)
    }
}

/// The autonomous system number used in OPEN messages and AS_PATH segments
/// when the real ASN does not fit in two bytes.
///
/// Ref: RFC 6793 §9
pub const AS_TRANS: u16 = 23456;

/// The version number for BGP-4.
pub const BGP4: u8 = 4;

/// A framed BGP message.
#[derive(Debug, PartialEq, Eq)]
pub enum Message {
    Open(OpenMessage),
    Update(UpdateMessage),
    Notification(NotificationMessage),
    KeepAlive,
}

impl Message {
    pub fn typ(&self) -> MessageType {
        match self {
            Self::Open(_) => MessageType::Open,
            Self::Update(_) => MessageType::Update,
            Self::Notification(_) => MessageType::Notification,
            Self::KeepAlive => MessageType::KeepAlive,
        }
    }

    /// Serialize a message to wire format, header included.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let body = match self {
            Self::Open(m) => m.to_wire()?,
            Self::Update(m) => m.to_wire()?,
            Self::Notification(m) => m.to_wire(),
            Self::KeepAlive => Vec::new(),
        };
        let length = HEADER_LEN + body.len();
        if length > MAX_MESSAGE_LEN {
            return Err(Error::TooLarge);
        }
        let mut buf = Header {
            length: length as u16,
            typ: self.typ(),
        }
        .to_wire();
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Serialize and write a message to a stream.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        w.write_all(&self.to_wire()?)?;
        Ok(())
    }

    /// Read one framed message off a stream and deserialize it.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Message, Error> {
        let hdr = Header::read_from(r)?;
        let length = hdr.length as usize;
        if length < HEADER_LEN {
            return Err(Error::TooSmall);
        }
        if length > MAX_MESSAGE_LEN {
            return Err(Error::TooLarge);
        }
        let mut body = vec![0u8; length - HEADER_LEN];
        r.read_exact(&mut body)?;
        Ok(match hdr.typ {
            MessageType::Open => Message::Open(OpenMessage::from_wire(&body)?),
            MessageType::Update => {
                Message::Update(UpdateMessage::from_wire(&body)?)
            }
            MessageType::Notification => {
                Message::Notification(NotificationMessage::from_wire(&body)?)
            }
            MessageType::KeepAlive => Message::KeepAlive,
        })
    }
}

/// The first message sent by each side once a TCP connection is established.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    Version    |     My Autonomous System      |   Hold Time   :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :               |                BGP Identifier                 :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :               | Opt Parm Len  |     Optional Parameters       :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :                                                               :
/// :             Optional Parameters (cont, variable)              :
/// :                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Ref: RFC 4271 §4.2
#[derive(Debug, PartialEq, Eq)]
pub struct OpenMessage {
    /// BGP protocol version.
    pub version: u8,

    /// Autonomous system number of the sender. When the sender's ASN does
    /// not fit in two bytes this is AS_TRANS and the real ASN travels in a
    /// four-octet-AS capability.
    ///
    /// Ref: RFC 6793 §9
    pub asn: u16,

    /// Number of seconds the sender proposes for the hold timer.
    pub hold_time: u16,

    /// BGP identifier of the sender.
    pub id: u32,

    /// A list of optional parameters.
    pub parameters: Vec<OptionalParameter>,
}

impl OpenMessage {
    /// Create a new open message for a sender with a 2-byte ASN.
    pub fn new2(asn: u16, hold_time: u16, id: u32) -> OpenMessage {
        OpenMessage {
            version: BGP4,
            asn,
            hold_time,
            id,
            parameters: Vec::new(),
        }
    }

    /// Create a new open message for a sender with a 4-byte ASN.
    pub fn new4(asn: u32, hold_time: u16, id: u32) -> OpenMessage {
        OpenMessage {
            version: BGP4,
            asn: AS_TRANS,
            hold_time,
            id,
            parameters: vec![Capability::FourOctetAs { asn }.into()],
        }
    }

    /// The sender's ASN, preferring a four-octet-AS capability over the
    /// fixed header field.
    pub fn effective_asn(&self) -> u32 {
        for p in &self.parameters {
            if let OptionalParameter::Capability(Capability::FourOctetAs {
                asn,
            }) = p
            {
                return *asn;
            }
        }
        u32::from(self.asn)
    }

    /// Serialize an open message to wire format.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();

        // version
        buf.push(self.version);

        // as
        buf.extend_from_slice(&self.asn.to_be_bytes());

        // hold time
        buf.extend_from_slice(&self.hold_time.to_be_bytes());

        // id
        buf.extend_from_slice(&self.id.to_be_bytes());

        // opt param len
        let opt_buf = self.parameters_to_wire()?;
        if opt_buf.len() > u8::MAX as usize {
            return Err(Error::TooLarge);
        }
        buf.push(opt_buf.len() as u8);
        buf.extend_from_slice(&opt_buf);

        Ok(buf)
    }

    fn parameters_to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        for p in &self.parameters {
            buf.extend_from_slice(&p.to_wire()?);
        }
        Ok(buf)
    }

    /// Deserialize an open message from wire format.
    pub fn from_wire(buf: &[u8]) -> Result<OpenMessage, Error> {
        if buf.len() < 10 {
            return Err(Error::TooSmall);
        }

        // version
        let version = buf[0];
        if version != BGP4 {
            return Err(Error::BadVersion);
        }

        // as
        let asn = u16::from_be_bytes([buf[1], buf[2]]);

        // hold time
        let hold_time = u16::from_be_bytes([buf[3], buf[4]]);

        // id
        let id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);

        // parameters
        let param_len = buf[9] as usize;
        if buf.len() < 10 + param_len {
            return Err(Error::TooSmall);
        }
        let parameters = Self::parameters_from_wire(&buf[10..10 + param_len])?;

        Ok(OpenMessage {
            version,
            asn,
            hold_time,
            id,
            parameters,
        })
    }

    pub fn parameters_from_wire(
        mut buf: &[u8],
    ) -> Result<Vec<OptionalParameter>, Error> {
        let mut result = Vec::new();

        while !buf.is_empty() {
            if buf.len() < 2 {
                return Err(Error::TooSmall);
            }
            let code = buf[0];
            let len = buf[1] as usize;
            if buf.len() < 2 + len {
                return Err(Error::TooSmall);
            }
            let value = &buf[2..2 + len];

            match OptionalParameterCode::try_from(code) {
                Ok(OptionalParameterCode::Capability) => {
                    // One capability parameter may carry several TLVs.
                    let mut v = value;
                    while !v.is_empty() {
                        let (cap, n) = Capability::from_wire(v)?;
                        result.push(OptionalParameter::Capability(cap));
                        v = &v[n..];
                    }
                }
                // Parameters we do not handle are carried opaquely, not
                // rejected. The peer is free to offer what it likes.
                _ => result.push(OptionalParameter::Unassigned { code }),
            }

            buf = &buf[2 + len..];
        }

        Ok(result)
    }
}

/// The IANA/IETF currently defines the following optional parameter types.
#[derive(Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum OptionalParameterCode {
    Reserved = 0,

    /// RFC 4217, RFC 5492 (deprecated)
    Authentication = 1,

    /// RFC 5492
    Capability = 2,

    /// RFC 9072
    ExtendedLength = 255,
}

#[derive(Debug, PartialEq, Eq)]
pub enum OptionalParameter {
    /// Code 2: RFC 5492
    Capability(Capability),

    /// Anything this speaker does not understand.
    Unassigned { code: u8 },
}

impl From<Capability> for OptionalParameter {
    fn from(c: Capability) -> OptionalParameter {
        OptionalParameter::Capability(c)
    }
}

impl OptionalParameter {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Capability(c) => {
                let cbuf = c.to_wire()?;
                let mut buf = vec![OptionalParameterCode::Capability as u8];
                buf.push(cbuf.len() as u8);
                buf.extend_from_slice(&cbuf);
                Ok(buf)
            }
            Self::Unassigned { code } => Err(Error::InvalidCode(*code)),
        }
    }
}

/// Capability codes from the IANA registry that this speaker can name.
/// Everything else round-trips as unassigned.
///
/// Ref: RFC 5492
#[derive(Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum CapabilityCode {
    /// RFC 5492
    Reserved = 0,

    /// RFC 2858
    MultiprotocolExtensions = 1,

    /// RFC 2918
    RouteRefresh = 2,

    /// RFC 5291
    OutboundRouteFiltering = 3,

    /// RFC 8950
    ExtendedNextHopEncoding = 5,

    /// RFC 8654
    BGPExtendedMessage = 6,

    /// RFC 4724
    GracefulRestart = 64,

    /// RFC 6793
    FourOctetAs = 65,

    /// RFC 7911
    AddPath = 69,

    /// RFC 7313
    EnhancedRouteRefresh = 70,

    /// draft-walton-bgp-hostname-capability
    Fqdn = 73,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Capability {
    /// RFC 6793
    FourOctetAs { asn: u32 },

    /// A capability this speaker does not use. Kept so an OPEN carrying it
    /// still parses.
    Unassigned { code: u8 },
}

impl Capability {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::FourOctetAs { asn } => {
                let mut buf = vec![CapabilityCode::FourOctetAs as u8, 4];
                buf.extend_from_slice(&asn.to_be_bytes());
                Ok(buf)
            }
            Self::Unassigned { .. } => {
                Err(Error::UnsupportedCapability(self.clone()))
            }
        }
    }

    pub fn from_wire(buf: &[u8]) -> Result<(Capability, usize), Error> {
        if buf.len() < 2 {
            return Err(Error::TooSmall);
        }
        let code = buf[0];
        let len = buf[1] as usize;
        if buf.len() < 2 + len {
            return Err(Error::TooSmall);
        }

        let cap = match CapabilityCode::try_from(code) {
            Ok(CapabilityCode::FourOctetAs) => {
                if len != 4 {
                    return Err(Error::BadLength {
                        expected: 4,
                        found: len as u8,
                    });
                }
                Capability::FourOctetAs {
                    asn: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
                }
            }
            _ => Capability::Unassigned { code },
        };

        Ok((cap, 2 + len))
    }
}

/// An update message is used to advertise feasible routes that share common
/// path attributes to a peer, or to withdraw multiple unfeasible routes from
/// service.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |        Withdrawn Length       |       Withdrawn Routes        :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :                                                               :
/// :                Withdrawn Routes (cont, variable)              :
/// :                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    Path Attribute Length      |       Path Attributes         :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :                                                               :
/// :                Path Attributes (cont, variable)               :
/// :                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :                                                               :
/// :       Network Layer Reachability Information (variable)       :
/// :                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Ref: RFC 4271 §4.3
#[derive(Debug, PartialEq, Eq)]
pub struct UpdateMessage {
    pub withdrawn: Vec<Prefix4>,
    pub path_attributes: Vec<PathAttribute>,
    pub nlri: Vec<Prefix4>,
}

impl UpdateMessage {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();

        // withdrawn
        let withdrawn = self.prefixes_to_wire(&self.withdrawn)?;
        if withdrawn.len() > u16::MAX as usize {
            return Err(Error::TooLarge);
        }
        let len = withdrawn.len() as u16;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&withdrawn);

        // path attributes
        let attrs = self.path_attrs_to_wire()?;
        if attrs.len() > u16::MAX as usize {
            return Err(Error::TooLarge);
        }
        let len = attrs.len() as u16;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&attrs);

        // nlri
        buf.extend_from_slice(&self.prefixes_to_wire(&self.nlri)?);

        Ok(buf)
    }

    fn prefixes_to_wire(&self, prefixes: &[Prefix4]) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        for p in prefixes {
            buf.extend_from_slice(&p.to_wire()?);
        }
        Ok(buf)
    }

    fn path_attrs_to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        for p in &self.path_attributes {
            buf.extend_from_slice(&p.to_wire(
                p.typ.flags & PathAttributeFlags::ExtendedLength as u8 != 0,
            )?);
        }
        Ok(buf)
    }

    pub fn from_wire(buf: &[u8]) -> Result<UpdateMessage, Error> {
        // withdrawn
        if buf.len() < 2 {
            return Err(Error::TooSmall);
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        let buf = &buf[2..];
        if buf.len() < len {
            return Err(Error::TooSmall);
        }
        let withdrawn = Self::prefixes_from_wire(&buf[..len])?;
        let buf = &buf[len..];

        // path attributes
        if buf.len() < 2 {
            return Err(Error::TooSmall);
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        let buf = &buf[2..];
        if buf.len() < len {
            return Err(Error::TooSmall);
        }
        let path_attributes = Self::path_attrs_from_wire(&buf[..len])?;
        let buf = &buf[len..];

        // nlri
        let nlri = Self::prefixes_from_wire(buf)?;

        Ok(UpdateMessage {
            withdrawn,
            path_attributes,
            nlri,
        })
    }

    fn prefixes_from_wire(mut buf: &[u8]) -> Result<Vec<Prefix4>, Error> {
        let mut result = Vec::new();
        while !buf.is_empty() {
            let (pfx, n) = Prefix4::from_wire(buf)?;
            result.push(pfx);
            buf = &buf[n..];
        }
        Ok(result)
    }

    fn path_attrs_from_wire(
        mut buf: &[u8],
    ) -> Result<Vec<PathAttribute>, Error> {
        let mut result = Vec::new();
        while !buf.is_empty() {
            let (pa, n) = PathAttribute::from_wire(buf)?;
            result.push(pa);
            buf = &buf[n..];
        }
        Ok(result)
    }
}

/// An IPv4 prefix: address plus mask length. The canonical form used
/// everywhere in this crate, including as the map key for advertisements.
#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq,
)]
pub struct Prefix4 {
    pub value: Ipv4Addr,
    pub length: u8,
}

impl PartialOrd for Prefix4 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Prefix4 {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.value != other.value {
            return self.value.cmp(&other.value);
        }
        self.length.cmp(&other.length)
    }
}

impl Prefix4 {
    /// Create a new `Prefix4` from an IP address and mask length. Host bits
    /// are zeroed on creation.
    pub fn new(ip: Ipv4Addr, length: u8) -> Self {
        let mask = match length {
            0 => 0,
            1..=31 => (!0u32) << (32 - length),
            _ => !0u32,
        };
        Self {
            value: Ipv4Addr::from(u32::from(ip) & mask),
            length,
        }
    }

    /// Serialize to NLRI wire format: one length octet followed by the
    /// minimal number of address octets.
    ///
    /// Ref: RFC 4271 §4.3
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        if self.length > 32 {
            return Err(Error::InvalidPrefixLength(self.length));
        }
        let n = (self.length as usize + 7) / 8;
        let mut buf = vec![self.length];
        buf.extend_from_slice(&self.value.octets()[..n]);
        Ok(buf)
    }

    /// Deserialize from NLRI wire format, returning the prefix and the
    /// number of octets consumed.
    pub fn from_wire(buf: &[u8]) -> Result<(Prefix4, usize), Error> {
        if buf.is_empty() {
            return Err(Error::TooSmall);
        }
        let length = buf[0];
        if length > 32 {
            return Err(Error::InvalidPrefixLength(length));
        }
        let n = (length as usize + 7) / 8;
        if buf.len() < 1 + n {
            return Err(Error::TooSmall);
        }
        let mut octets = [0u8; 4];
        octets[..n].copy_from_slice(&buf[1..1 + n]);
        Ok((Prefix4::new(Ipv4Addr::from(octets), length), 1 + n))
    }
}

impl fmt::Display for Prefix4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.length)
    }
}

impl FromStr for Prefix4 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (value, length) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidPrefix(s.to_string()))?;
        let value: Ipv4Addr = value
            .parse()
            .map_err(|_| Error::InvalidPrefix(s.to_string()))?;
        let length: u8 = length
            .parse()
            .map_err(|_| Error::InvalidPrefix(s.to_string()))?;
        if length > 32 {
            return Err(Error::InvalidPrefixLength(length));
        }
        Ok(Prefix4::new(value, length))
    }
}

/// Largest number of communities a single advertisement may carry: 63 tags
/// of four octets each still fit the one-octet attribute length.
pub const MAX_COMMUNITIES: usize = 63;

#[derive(Debug, PartialEq, Eq)]
pub struct PathAttribute {
    pub typ: PathAttributeType,
    pub value: PathAttributeValue,
}

impl PathAttribute {
    pub fn to_wire(&self, extended_length: bool) -> Result<Vec<u8>, Error> {
        let mut buf = self.typ.to_wire();
        let val = &self.value.to_wire()?;
        if extended_length {
            if val.len() > u16::MAX as usize {
                return Err(Error::TooLarge);
            }
            let len = val.len() as u16;
            buf.extend_from_slice(&len.to_be_bytes())
        } else {
            if val.len() > u8::MAX as usize {
                return Err(Error::TooLarge);
            }
            buf.push(val.len() as u8);
        }
        buf.extend_from_slice(val);
        Ok(buf)
    }

    fn from_wire(buf: &[u8]) -> Result<(PathAttribute, usize), Error> {
        if buf.len() < 2 {
            return Err(Error::TooSmall);
        }
        let typ = PathAttributeType::from_wire(&buf[..2])?;
        let mut buf = &buf[2..];
        let mut n = 2;
        let len = if typ.flags & PathAttributeFlags::ExtendedLength as u8 != 0
        {
            if buf.len() < 2 {
                return Err(Error::TooSmall);
            }
            let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            buf = &buf[2..];
            n += 2;
            len
        } else {
            if buf.is_empty() {
                return Err(Error::TooSmall);
            }
            let len = buf[0] as usize;
            buf = &buf[1..];
            n += 1;
            len
        };
        if buf.len() < len {
            return Err(Error::TooSmall);
        }
        let buf = &buf[..len];
        let value = PathAttributeValue::from_wire(buf, typ.type_code)?;
        Ok((PathAttribute { typ, value }, n + len))
    }
}

impl From<PathAttributeValue> for PathAttribute {
    fn from(value: PathAttributeValue) -> PathAttribute {
        let flags = match value {
            // Communities are optional transitive, the rest of what we
            // emit is well-known.
            PathAttributeValue::Communities(_) => {
                PathAttributeFlags::Optional | PathAttributeFlags::Transitive
            }
            _ => PathAttributeFlags::Transitive as u8,
        };
        let type_code = match value {
            PathAttributeValue::Origin(_) => PathAttributeTypeCode::Origin,
            PathAttributeValue::AsPath(_) => PathAttributeTypeCode::AsPath,
            PathAttributeValue::NextHop(_) => PathAttributeTypeCode::NextHop,
            PathAttributeValue::LocalPref(_) => {
                PathAttributeTypeCode::LocalPref
            }
            PathAttributeValue::Communities(_) => {
                PathAttributeTypeCode::Communities
            }
        };
        PathAttribute {
            typ: PathAttributeType { flags, type_code },
            value,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct PathAttributeType {
    pub flags: u8,
    pub type_code: PathAttributeTypeCode,
}

impl PathAttributeType {
    pub fn to_wire(&self) -> Vec<u8> {
        vec![self.flags, self.type_code as u8]
    }

    pub fn from_wire(buf: &[u8]) -> Result<PathAttributeType, Error> {
        Ok(PathAttributeType {
            flags: buf[0],
            type_code: match PathAttributeTypeCode::try_from(buf[1]) {
                Ok(tc) => tc,
                Err(_) => {
                    return Err(Error::InvalidCode(buf[1]));
                }
            },
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PathAttributeFlags {
    Optional = 0b10000000,
    Transitive = 0b01000000,
    Partial = 0b00100000,
    ExtendedLength = 0b00010000,
}

impl std::ops::BitOr<PathAttributeFlags> for PathAttributeFlags {
    type Output = u8;
    fn bitor(self, other: PathAttributeFlags) -> u8 {
        self as u8 | other as u8
    }
}

impl std::ops::BitAnd<PathAttributeFlags> for PathAttributeFlags {
    type Output = u8;
    fn bitand(self, other: PathAttributeFlags) -> u8 {
        self as u8 & other as u8
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum PathAttributeTypeCode {
    /// RFC 4271
    Origin = 1,
    AsPath = 2,
    NextHop = 3,
    MultiExitDisc = 4,
    LocalPref = 5,
    AtomicAggregate = 6,
    Aggregator = 7,

    /// RFC 1997
    Communities = 8,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PathAttributeValue {
    Origin(PathOrigin),
    AsPath(Vec<AsPathSegment>),
    NextHop(Ipv4Addr),
    LocalPref(u32),
    Communities(Vec<u32>),
}

impl PathAttributeValue {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Origin(o) => Ok(vec![*o as u8]),
            Self::AsPath(segments) => {
                let mut buf = Vec::new();
                for s in segments {
                    buf.extend_from_slice(&s.to_wire()?);
                }
                Ok(buf)
            }
            Self::NextHop(addr) => Ok(addr.octets().to_vec()),
            Self::LocalPref(pref) => Ok(pref.to_be_bytes().to_vec()),
            Self::Communities(communities) => {
                if communities.len() > MAX_COMMUNITIES {
                    return Err(Error::TooLarge);
                }
                let mut buf = Vec::new();
                for c in communities {
                    buf.extend_from_slice(&c.to_be_bytes());
                }
                Ok(buf)
            }
        }
    }

    pub fn from_wire(
        mut buf: &[u8],
        type_code: PathAttributeTypeCode,
    ) -> Result<PathAttributeValue, Error> {
        match type_code {
            PathAttributeTypeCode::Origin => {
                if buf.is_empty() {
                    return Err(Error::TooSmall);
                }
                match PathOrigin::try_from(buf[0]) {
                    Ok(o) => Ok(PathAttributeValue::Origin(o)),
                    Err(_) => Err(Error::InvalidCode(buf[0])),
                }
            }
            PathAttributeTypeCode::AsPath => {
                let mut segments = Vec::new();
                while !buf.is_empty() {
                    let (seg, n) = AsPathSegment::from_wire(buf)?;
                    segments.push(seg);
                    buf = &buf[n..];
                }
                Ok(PathAttributeValue::AsPath(segments))
            }
            PathAttributeTypeCode::NextHop => {
                if buf.len() != 4 {
                    return Err(Error::BadLength {
                        expected: 4,
                        found: buf.len() as u8,
                    });
                }
                Ok(PathAttributeValue::NextHop(Ipv4Addr::new(
                    buf[0], buf[1], buf[2], buf[3],
                )))
            }
            PathAttributeTypeCode::LocalPref => {
                if buf.len() != 4 {
                    return Err(Error::BadLength {
                        expected: 4,
                        found: buf.len() as u8,
                    });
                }
                Ok(PathAttributeValue::LocalPref(u32::from_be_bytes([
                    buf[0], buf[1], buf[2], buf[3],
                ])))
            }
            PathAttributeTypeCode::Communities => {
                if buf.len() % 4 != 0 {
                    return Err(Error::TooSmall);
                }
                let communities = buf
                    .chunks_exact(4)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                Ok(PathAttributeValue::Communities(communities))
            }
            code => Err(Error::UnsupportedPathAttributeTypeCode(code)),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum PathOrigin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

/// An AS_PATH segment carrying 2-byte ASNs.
///
/// Ref: RFC 4271 §4.3, RFC 6793 §4
#[derive(Debug, PartialEq, Eq)]
pub struct AsPathSegment {
    pub typ: AsPathType,
    pub value: Vec<u16>,
}

impl AsPathSegment {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        if self.value.len() > u8::MAX as usize {
            return Err(Error::TooLarge);
        }
        let mut buf = vec![self.typ as u8, self.value.len() as u8];
        for v in &self.value {
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Ok(buf)
    }

    pub fn from_wire(buf: &[u8]) -> Result<(AsPathSegment, usize), Error> {
        if buf.len() < 2 {
            return Err(Error::TooSmall);
        }
        let typ = match AsPathType::try_from(buf[0]) {
            Ok(t) => t,
            Err(_) => {
                return Err(Error::InvalidCode(buf[0]));
            }
        };
        let len = buf[1] as usize * 2;
        let buf = &buf[2..];
        if buf.len() < len {
            return Err(Error::TooSmall);
        }
        let value = buf[..len]
            .chunks_exact(2)
            .map(|v| u16::from_be_bytes([v[0], v[1]]))
            .collect();
        Ok((AsPathSegment { typ, value }, 2 + len))
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum AsPathType {
    AsSet = 1,
    AsSequence = 2,
}

/// Sent when an error condition is detected. This speaker never acts on
/// inbound notifications, but decodes them so a session teardown can be
/// understood from a message trace.
///
/// Ref: RFC 4271 §4.5
#[derive(Debug, PartialEq, Eq)]
pub struct NotificationMessage {
    pub error_code: u8,
    pub error_subcode: u8,
    pub data: Vec<u8>,
}

impl NotificationMessage {
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = vec![self.error_code, self.error_subcode];
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Result<NotificationMessage, Error> {
        if buf.len() < 2 {
            return Err(Error::TooSmall);
        }
        Ok(NotificationMessage {
            error_code: buf[0],
            error_subcode: buf[1],
            data: buf[2..].to_vec(),
        })
    }
}
