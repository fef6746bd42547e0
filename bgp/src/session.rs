// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::config::{PeerConfig, RouterConfig};
use crate::error::{Error, ExpectationMismatch};
use crate::messages::{
    AsPathSegment, AsPathType, Message, OpenMessage, PathAttributeValue,
    PathOrigin, Prefix4, UpdateMessage, AS_TRANS, HEADER_LEN, MARKER,
    MAX_COMMUNITIES,
};
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, Logger};
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{
    sync_channel, Receiver, RecvTimeoutError, SyncSender,
};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{sleep, spawn};
use std::time::{Duration, Instant};

macro_rules! lock {
    ($mtx:expr) => {
        $mtx.lock().expect("lock mutex")
    };
}

/// How long to wait between connection attempts.
const BACKOFF: Duration = Duration::from_secs(2);

/// One route this speaker wants installed at the peer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Advertisement {
    /// The prefix being announced. Also the unique key of an advertisement
    /// set.
    pub prefix: Prefix4,

    /// Address the peer should forward traffic for the prefix to.
    pub next_hop: Ipv4Addr,

    /// LOCAL_PREF value attached to the announcement.
    pub local_pref: u32,

    /// Community tags attached to the announcement, at most 63.
    pub communities: Vec<u32>,
}

impl Advertisement {
    /// Build the UPDATE announcing this route. An `asn` of zero stands for
    /// an iBGP session and yields an empty AS_PATH.
    fn update(&self, asn: u32) -> UpdateMessage {
        let as_path = match asn {
            0 => Vec::new(),
            asn => vec![AsPathSegment {
                typ: AsPathType::AsSequence,
                value: vec![u16::try_from(asn).unwrap_or(AS_TRANS)],
            }],
        };
        let mut path_attributes = vec![
            PathAttributeValue::Origin(PathOrigin::Igp).into(),
            PathAttributeValue::AsPath(as_path).into(),
            PathAttributeValue::NextHop(self.next_hop).into(),
            PathAttributeValue::LocalPref(self.local_pref).into(),
        ];
        if !self.communities.is_empty() {
            path_attributes.push(
                PathAttributeValue::Communities(self.communities.clone())
                    .into(),
            );
        }
        UpdateMessage {
            withdrawn: Vec::new(),
            path_attributes,
            nlri: vec![self.prefix],
        }
    }
}

/// Per-session gauges and counters, exposed to whatever sink the caller
/// wires up. These are side effects only, nothing in the session reads them
/// back.
#[derive(Default)]
pub struct SessionCounters {
    /// 1 while a connection to the peer is live, 0 otherwise.
    pub session_up: AtomicU64,

    /// Number of prefixes currently believed installed at the peer.
    pub advertised_prefixes: AtomicU64,

    /// Number of prefixes in a desired set the writer has not consumed yet.
    pub pending_prefixes: AtomicU64,

    // Message counters
    pub opens_sent: AtomicU64,
    pub updates_sent: AtomicU64,
    pub keepalives_sent: AtomicU64,

    /// Total failed connection attempts.
    pub connection_retries: AtomicU64,
}

struct State {
    closed: bool,
    conn: Option<Arc<TcpStream>>,
    actual_hold_time: Duration,
    advertised: BTreeMap<Prefix4, Advertisement>,

    /// The desired set the writer has yet to reconcile. `None` means no new
    /// desire since the writer last looked, in contrast to `Some` of an
    /// empty map which means "withdraw everything".
    pending: Option<BTreeMap<Prefix4, Advertisement>>,
}

/// A BGP session to a single upstream peer.
///
/// A session dials the peer, exchanges OPENs, keeps the connection alive and
/// converges the peer onto whatever advertisement set was last passed to
/// [`Session::set`], reconnecting with a fixed backoff for as long as the
/// session is open. Errors after construction are handled internally;
/// the only way a session ends is [`Session::close`].
pub struct Session {
    asn: u32,
    router_id: Ipv4Addr,
    peer: SocketAddr,
    peer_asn: u32,
    hold_time: Duration,

    state: Mutex<State>,
    cond: Condvar,

    /// One-slot signal to the keepalive loop that `actual_hold_time`
    /// changed. Sends into a full slot are dropped, the loop reads the
    /// newest value when it wakes.
    new_hold_time: SyncSender<()>,

    pub counters: SessionCounters,
    log: Logger,
}

impl Session {
    /// Create a session and start its connector and keepalive threads. The
    /// session keeps dialing `peer.host` until [`Session::close`] is
    /// called.
    pub fn new(
        router: RouterConfig,
        peer: PeerConfig,
        log: Logger,
    ) -> Result<Arc<Session>, Error> {
        if peer.hold_time != 0 && peer.hold_time < 3 {
            return Err(Error::HoldTimeTooSmall);
        }
        if peer.hold_time > u64::from(u16::MAX) {
            return Err(Error::HoldTimeTooLarge);
        }

        let (hold_tx, hold_rx) = sync_channel(1);
        let session = Arc::new(Session {
            asn: router.asn,
            router_id: router.id,
            peer: peer.host,
            peer_asn: peer.asn,
            hold_time: Duration::from_secs(peer.hold_time),
            state: Mutex::new(State {
                closed: false,
                conn: None,
                actual_hold_time: Duration::ZERO,
                advertised: BTreeMap::new(),
                pending: None,
            }),
            cond: Condvar::new(),
            new_hold_time: hold_tx,
            counters: SessionCounters::default(),
            log: log.new(slog::o!("peer" => peer.host.to_string())),
        });

        let s = session.clone();
        spawn(move || s.keepalive_loop(hold_rx));
        let s = session.clone();
        spawn(move || s.run());

        Ok(session)
    }

    /// Replace the set of advertisements this session wants installed at
    /// the peer. Later calls supersede earlier ones entirely; an empty set
    /// withdraws everything. The actual traffic happens asynchronously on
    /// the writer.
    pub fn set(&self, advs: &[Advertisement]) -> Result<(), Error> {
        let mut pending = BTreeMap::new();
        for adv in advs {
            if adv.prefix.length > 32 {
                return Err(Error::InvalidNlriPrefix(adv.prefix));
            }
            if adv.communities.len() > MAX_COMMUNITIES {
                return Err(Error::TooManyCommunities {
                    max: MAX_COMMUNITIES,
                    got: adv.communities.len(),
                });
            }
            pending.insert(adv.prefix, adv.clone());
        }

        let mut state = lock!(self.state);
        self.counters
            .pending_prefixes
            .store(pending.len() as u64, Ordering::Relaxed);
        state.pending = Some(pending);
        self.cond.notify_all();
        Ok(())
    }

    /// Shut the session down for good. Idempotent.
    pub fn close(&self) {
        let mut state = lock!(self.state);
        state.closed = true;
        self.abort(&mut state);
        // Wake the keepalive loop so it can observe the closed state even
        // if no connection was ever established.
        let _ = self.new_hold_time.try_send(());
    }

    /// Connector loop: dial, hand the established connection to the
    /// writer, repeat until closed.
    fn run(self: Arc<Self>) {
        loop {
            match self.connect() {
                Err(Error::Closed) => return,
                Err(e) => {
                    error!(self.log, "connect: {e}");
                    self.counters
                        .connection_retries
                        .fetch_add(1, Ordering::Relaxed);
                    sleep(BACKOFF);
                    continue;
                }
                Ok(conn) => {
                    let s = self.clone();
                    spawn(move || s.consume_bgp(conn));
                }
            }
            self.counters.session_up.store(1, Ordering::Relaxed);
            info!(self.log, "BGP session established");

            match self.send_updates() {
                Err(Error::Closed) => return,
                Err(e) => error!(self.log, "session: {e}"),
                Ok(()) => {}
            }
            self.counters.session_up.store(0, Ordering::Relaxed);
            info!(self.log, "BGP session down");
        }
    }

    /// One connection attempt: TCP connect, OPEN exchange, peer ASN check,
    /// accepting keepalive, hold time negotiation. On success the
    /// connection is published on the session and also returned so the
    /// caller can bind a reader to it.
    fn connect(&self) -> Result<Arc<TcpStream>, Error> {
        let mut state = lock!(self.state);
        if state.closed {
            return Err(Error::Closed);
        }

        let conn = TcpStream::connect(self.peer)?;

        let open = self.open_message();
        Message::Open(open).write_to(&mut &conn)?;
        self.counters.opens_sent.fetch_add(1, Ordering::Relaxed);

        let peer_open = match Message::read_from(&mut &conn)? {
            Message::Open(o) => o,
            m => return Err(Error::UnexpectedMessage(m.typ())),
        };
        let peer_asn = peer_open.effective_asn();
        if peer_asn != self.peer_asn {
            return Err(Error::UnexpectedAsn(ExpectationMismatch {
                expected: self.peer_asn,
                got: peer_asn,
            }));
        }

        // Send one keepalive to say that yes, we accept the OPEN.
        Message::KeepAlive.write_to(&mut &conn)?;
        self.counters.keepalives_sent.fetch_add(1, Ordering::Relaxed);

        // Set up regular keepalives from now on.
        state.actual_hold_time = self
            .hold_time
            .min(Duration::from_secs(u64::from(peer_open.hold_time)));
        let _ = self.new_hold_time.try_send(());

        let conn = Arc::new(conn);
        state.conn = Some(conn.clone());
        Ok(conn)
    }

    fn open_message(&self) -> OpenMessage {
        let hold_time = self.hold_time.as_secs() as u16;
        let id = u32::from(self.router_id);
        match u16::try_from(self.asn) {
            Ok(asn) => OpenMessage::new2(asn, hold_time, id),
            Err(_) => OpenMessage::new4(self.asn, hold_time, id),
        }
    }

    /// Writer: push the full advertised set at a fresh peer, then emit
    /// diffs as new desired sets arrive, until the connection dies or the
    /// session closes. Holds the session lock throughout, including across
    /// sends; a single peer never needs concurrent writes.
    fn send_updates(&self) -> Result<(), Error> {
        let mut state = lock!(self.state);

        let asn = if self.peer_asn == self.asn { 0 } else { self.asn };

        if let Some(pending) = state.pending.take() {
            state.advertised = pending;
            self.counters.pending_prefixes.store(0, Ordering::Relaxed);
        }

        let conn = match state.conn {
            Some(ref c) => c.clone(),
            None => return Ok(()),
        };
        for adv in state.advertised.values() {
            if let Err(e) =
                Message::Update(adv.update(asn)).write_to(&mut &*conn)
            {
                self.abort(&mut state);
                return Err(e);
            }
            self.counters.updates_sent.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .advertised_prefixes
            .store(state.advertised.len() as u64, Ordering::Relaxed);

        loop {
            while state.pending.is_none() && state.conn.is_some() {
                state = self.cond.wait(state).expect("condvar wait");
            }

            if state.closed {
                return Err(Error::Closed);
            }
            let conn = match state.conn {
                Some(ref c) => c.clone(),
                None => return Ok(()),
            };
            let pending = match state.pending.take() {
                Some(pending) => pending,
                None => continue,
            };

            for (prefix, adv) in &pending {
                if let Some(prev) = state.advertised.get(prefix) {
                    if prev.next_hop == adv.next_hop
                        && prev.communities == adv.communities
                    {
                        // Peer already has correct state for this
                        // advertisement, nothing to do.
                        continue;
                    }
                }
                if let Err(e) =
                    Message::Update(adv.update(asn)).write_to(&mut &*conn)
                {
                    state.pending = Some(pending);
                    self.abort(&mut state);
                    return Err(e);
                }
                self.counters.updates_sent.fetch_add(1, Ordering::Relaxed);
            }

            let withdrawn: Vec<Prefix4> = state
                .advertised
                .keys()
                .filter(|prefix| !pending.contains_key(*prefix))
                .copied()
                .collect();
            if !withdrawn.is_empty() {
                let update = UpdateMessage {
                    withdrawn,
                    path_attributes: Vec::new(),
                    nlri: Vec::new(),
                };
                if let Err(e) = Message::Update(update).write_to(&mut &*conn)
                {
                    state.pending = Some(pending);
                    self.abort(&mut state);
                    return Err(e);
                }
                self.counters.updates_sent.fetch_add(1, Ordering::Relaxed);
            }

            state.advertised = pending;
            self.counters.pending_prefixes.store(0, Ordering::Relaxed);
            self.counters
                .advertised_prefixes
                .store(state.advertised.len() as u64, Ordering::Relaxed);
        }
    }

    /// Keepalive loop, alive for the whole session. Reconfigures its period
    /// to a third of the hold time whenever the connector publishes a new
    /// one; a hold time of zero leaves it idle.
    fn keepalive_loop(self: Arc<Self>, new_hold_time: Receiver<()>) {
        let mut interval: Option<Duration> = None;
        let mut deadline = Instant::now();

        loop {
            let reconfigure = match interval {
                Some(_) => {
                    let timeout =
                        deadline.saturating_duration_since(Instant::now());
                    match new_hold_time.recv_timeout(timeout) {
                        Ok(()) => true,
                        Err(RecvTimeoutError::Timeout) => false,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
                None => match new_hold_time.recv() {
                    Ok(()) => true,
                    Err(_) => return,
                },
            };

            if reconfigure {
                let hold_time = {
                    let state = lock!(self.state);
                    if state.closed {
                        return;
                    }
                    state.actual_hold_time
                };
                interval = match hold_time.is_zero() {
                    true => None,
                    false => Some(hold_time / 3),
                };
            } else {
                match self.send_keepalive() {
                    Err(Error::Closed) => return,
                    Err(e) => error!(self.log, "keepalive: {e}"),
                    Ok(()) => {}
                }
            }
            if let Some(interval) = interval {
                deadline = Instant::now() + interval;
            }
        }
    }

    fn send_keepalive(&self) -> Result<(), Error> {
        let mut state = lock!(self.state);
        if state.closed {
            return Err(Error::Closed);
        }
        let conn = match state.conn {
            Some(ref c) => c.clone(),
            // No connection established, nothing to do.
            None => return Ok(()),
        };
        if let Err(e) = Message::KeepAlive.write_to(&mut &*conn) {
            self.abort(&mut state);
            return Err(e);
        }
        self.counters.keepalives_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Reader bound to one connection: consume inbound messages until the
    /// connection dies, then tear the session down, but only if the
    /// session's current connection is still the one this reader was
    /// started with.
    fn consume_bgp(self: Arc<Self>, conn: Arc<TcpStream>) {
        if let Err(e) = Self::drain(&conn) {
            debug!(self.log, "drain: {e}");
        }
        let mut state = lock!(self.state);
        match state.conn {
            Some(ref current) if Arc::ptr_eq(current, &conn) => {
                self.abort(&mut state);
            }
            _ => {
                let _ = conn.shutdown(Shutdown::Both);
            }
        }
    }

    /// Read framed messages forever, validating nothing but the marker and
    /// discarding the bodies. Inbound routing information is deliberately
    /// ignored; the return value only reports why reading stopped.
    fn drain(conn: &TcpStream) -> Result<(), Error> {
        let mut stream: &TcpStream = conn;
        loop {
            let mut hdr = [0u8; HEADER_LEN];
            stream.read_exact(&mut hdr)?;
            if hdr[..16] != MARKER {
                return Err(Error::NoMarker);
            }
            let length = u16::from_be_bytes([hdr[16], hdr[17]]);
            if (length as usize) < HEADER_LEN {
                return Err(Error::TooSmall);
            }
            let body = u64::from(length) - HEADER_LEN as u64;
            io::copy(&mut stream.take(body), &mut io::sink())?;
        }
    }

    /// Kill the current connection, if any, and collapse any pending
    /// desired set into the advertised set so the next connection skips
    /// straight to the latest desired end state.
    fn abort(&self, state: &mut MutexGuard<'_, State>) {
        if let Some(conn) = state.conn.take() {
            let _ = conn.shutdown(Shutdown::Both);
            self.counters.session_up.store(0, Ordering::Relaxed);
        }
        if let Some(pending) = state.pending.take() {
            state.advertised = pending;
            self.counters.pending_prefixes.store(0, Ordering::Relaxed);
            self.counters
                .advertised_prefixes
                .store(state.advertised.len() as u64, Ordering::Relaxed);
        }
        self.cond.notify_all();
    }
}
