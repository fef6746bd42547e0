// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::config::{PeerConfig, RouterConfig};
use crate::error::Error;
use crate::log::init_logger;
use crate::messages::{
    AsPathSegment, AsPathType, Message, OpenMessage, PathAttribute,
    PathAttributeValue, PathOrigin, UpdateMessage,
};
use crate::session::{Advertisement, Session};
use pretty_assertions::assert_eq;
use std::io::{ErrorKind, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

const ROUTER_ID: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// The upstream router half of a session under test: a real listener the
/// session dials, plus just enough protocol to hold up our end of the
/// conversation.
struct Upstream {
    listener: TcpListener,
}

impl Upstream {
    fn start() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").expect("bind"),
        }
    }

    fn start_at(addr: SocketAddr) -> Self {
        // The port was used moments ago, give the kernel a beat.
        for _ in 0..50 {
            match TcpListener::bind(addr) {
                Ok(listener) => return Self { listener },
                Err(_) => sleep(Duration::from_millis(100)),
            }
        }
        panic!("rebind {addr}");
    }

    fn addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("local addr")
    }

    /// Accept a connection and exchange OPENs, returning before the
    /// session has accepted ours.
    fn open_only(&self, asn: u32, hold_time: u16) -> (TcpStream, OpenMessage) {
        let (conn, _) = self.listener.accept().expect("accept");
        conn.set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");

        let open = match Message::read_from(&mut &conn).expect("read open") {
            Message::Open(open) => open,
            m => panic!("expected open, got {m:?}"),
        };
        Message::Open(OpenMessage::new4(asn, hold_time, 0x01020304))
            .write_to(&mut &conn)
            .expect("write open");
        (conn, open)
    }

    /// Drive the full peer half of the handshake: exchange OPENs, then
    /// consume the keepalive accepting ours.
    fn establish(&self, asn: u32, hold_time: u16) -> TcpStream {
        let (conn, _) = self.open_only(asn, hold_time);
        match Message::read_from(&mut &conn).expect("read keepalive") {
            Message::KeepAlive => {}
            m => panic!("expected keepalive, got {m:?}"),
        }
        conn
    }
}

/// Read messages until an UPDATE arrives, skipping keepalives.
fn read_update(mut conn: &TcpStream) -> UpdateMessage {
    loop {
        match Message::read_from(&mut conn).expect("read message") {
            Message::Update(update) => return update,
            Message::KeepAlive => continue,
            m => panic!("unexpected message {m:?}"),
        }
    }
}

/// Assert that nothing but keepalives shows up for a little over a second.
fn assert_no_update(mut conn: &TcpStream) {
    conn.set_read_timeout(Some(Duration::from_millis(1200)))
        .expect("read timeout");
    loop {
        match Message::read_from(&mut conn) {
            Ok(Message::KeepAlive) => continue,
            Ok(m) => panic!("unexpected message {m:?}"),
            Err(Error::Io(e))
                if e.kind() == ErrorKind::WouldBlock
                    || e.kind() == ErrorKind::TimedOut =>
            {
                break;
            }
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    conn.set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
}

fn session_to(
    upstream: SocketAddr,
    asn: u32,
    peer_asn: u32,
    hold_time: u64,
) -> Arc<Session> {
    Session::new(
        RouterConfig { asn, id: ROUTER_ID },
        PeerConfig {
            host: upstream,
            asn: peer_asn,
            hold_time,
        },
        init_logger(),
    )
    .expect("session")
}

fn adv(prefix: &str, next_hop: Ipv4Addr, communities: &[u32]) -> Advertisement {
    Advertisement {
        prefix: prefix.parse().expect("prefix"),
        next_hop,
        local_pref: 100,
        communities: communities.to_vec(),
    }
}

#[test]
fn open_carries_local_identity() {
    let upstream = Upstream::start();
    let session = session_to(upstream.addr(), 65001, 65002, 90);
    let (_conn, open) = upstream.open_only(65002, 90);

    assert_eq!(open.effective_asn(), 65001);
    assert_eq!(open.hold_time, 90);
    assert_eq!(open.id, u32::from(ROUTER_ID));

    session.close();
}

#[test]
fn announce_after_open() {
    let upstream = Upstream::start();
    let session = session_to(upstream.addr(), 65001, 65002, 90);
    let conn = upstream.establish(65002, 90);

    session
        .set(&[adv("10.1.0.0/24", Ipv4Addr::new(10, 0, 0, 1), &[100])])
        .expect("set");

    let update = read_update(&conn);
    assert_eq!(update.withdrawn, vec![]);
    assert_eq!(update.nlri, vec!["10.1.0.0/24".parse().unwrap()]);
    let want: Vec<PathAttribute> = vec![
        PathAttributeValue::Origin(PathOrigin::Igp).into(),
        PathAttributeValue::AsPath(vec![AsPathSegment {
            typ: AsPathType::AsSequence,
            value: vec![65001],
        }])
        .into(),
        PathAttributeValue::NextHop(Ipv4Addr::new(10, 0, 0, 1)).into(),
        PathAttributeValue::LocalPref(100).into(),
        PathAttributeValue::Communities(vec![100]).into(),
    ];
    assert_eq!(update.path_attributes, want);

    session.close();
}

#[test]
fn converge_incrementally() {
    let upstream = Upstream::start();
    let session = session_to(upstream.addr(), 65001, 65002, 90);
    let conn = upstream.establish(65002, 90);
    let next_hop = Ipv4Addr::new(10, 0, 0, 1);

    session
        .set(&[adv("10.1.0.0/24", next_hop, &[100])])
        .expect("set");
    assert_eq!(
        read_update(&conn).nlri,
        vec!["10.1.0.0/24".parse().unwrap()]
    );

    // Adding a prefix must not retransmit what the peer already has.
    session
        .set(&[
            adv("10.1.0.0/24", next_hop, &[100]),
            adv("10.2.0.0/24", next_hop, &[]),
        ])
        .expect("set");
    assert_eq!(
        read_update(&conn).nlri,
        vec!["10.2.0.0/24".parse().unwrap()]
    );
    assert_no_update(&conn);

    // Dropping a prefix yields one withdraw and nothing else.
    session
        .set(&[adv("10.2.0.0/24", next_hop, &[])])
        .expect("set");
    let update = read_update(&conn);
    assert_eq!(update.withdrawn, vec!["10.1.0.0/24".parse().unwrap()]);
    assert_eq!(update.nlri, vec![]);
    assert_eq!(update.path_attributes, vec![]);
    assert_no_update(&conn);

    session.close();
}

#[test]
fn resync_after_reconnect() {
    let upstream = Upstream::start();
    let session = session_to(upstream.addr(), 65001, 65002, 90);
    let conn = upstream.establish(65002, 90);
    let next_hop = Ipv4Addr::new(10, 0, 0, 1);

    session
        .set(&[adv("10.2.0.0/24", next_hop, &[])])
        .expect("set");
    read_update(&conn);

    // Peer-side teardown. The session must come back and re-announce the
    // full desired set.
    drop(conn);
    let conn = upstream.establish(65002, 90);
    assert_eq!(
        read_update(&conn).nlri,
        vec!["10.2.0.0/24".parse().unwrap()]
    );

    session.close();
}

#[test]
fn replacement_supersedes_pending() {
    let upstream = Upstream::start();
    let addr = upstream.addr();
    drop(upstream);

    // With nothing listening the connector sits in its backoff loop,
    // leaving the desired set free to be replaced before any connection
    // exists.
    let session = session_to(addr, 65001, 65002, 90);
    sleep(Duration::from_millis(200));
    let next_hop = Ipv4Addr::new(10, 0, 0, 1);
    session
        .set(&[adv("10.1.0.0/24", next_hop, &[])])
        .expect("set");
    session
        .set(&[adv("10.2.0.0/24", next_hop, &[])])
        .expect("set");

    let upstream = Upstream::start_at(addr);
    let conn = upstream.establish(65002, 90);

    // Only the later desire may ever hit the wire.
    assert_eq!(
        read_update(&conn).nlri,
        vec!["10.2.0.0/24".parse().unwrap()]
    );
    assert_no_update(&conn);

    session.close();
}

#[test]
fn empty_set_withdraws_all() {
    let upstream = Upstream::start();
    let session = session_to(upstream.addr(), 65001, 65002, 90);
    let conn = upstream.establish(65002, 90);
    let next_hop = Ipv4Addr::new(10, 0, 0, 1);

    session
        .set(&[
            adv("10.1.0.0/24", next_hop, &[]),
            adv("10.2.0.0/24", next_hop, &[]),
        ])
        .expect("set");
    read_update(&conn);
    read_update(&conn);

    // An empty set is a real desire, not a no-op.
    session.set(&[]).expect("set");
    let update = read_update(&conn);
    assert_eq!(
        update.withdrawn,
        vec![
            "10.1.0.0/24".parse().unwrap(),
            "10.2.0.0/24".parse().unwrap(),
        ]
    );
    assert_eq!(update.nlri, vec![]);
    assert_no_update(&conn);

    session.close();
}

#[test]
fn session_without_set_is_quiet() {
    let upstream = Upstream::start();
    let session = session_to(upstream.addr(), 65001, 65002, 90);
    let conn = upstream.establish(65002, 90);

    assert_no_update(&conn);

    session.close();
}

#[test]
fn re_set_equivalent_is_quiet() {
    let upstream = Upstream::start();
    let session = session_to(upstream.addr(), 65001, 65002, 90);
    let conn = upstream.establish(65002, 90);
    let next_hop = Ipv4Addr::new(10, 0, 0, 1);

    session
        .set(&[adv("10.1.0.0/24", next_hop, &[100, 200])])
        .expect("set");
    read_update(&conn);

    session
        .set(&[adv("10.1.0.0/24", next_hop, &[100, 200])])
        .expect("set");
    assert_no_update(&conn);

    // A local preference change alone does not reach the wire either.
    let mut changed = adv("10.1.0.0/24", next_hop, &[100, 200]);
    changed.local_pref = 300;
    session.set(&[changed]).expect("set");
    assert_no_update(&conn);

    session.close();
}

#[test]
fn ibgp_updates_have_empty_as_path() {
    let upstream = Upstream::start();
    let session = session_to(upstream.addr(), 65001, 65001, 90);
    let conn = upstream.establish(65001, 90);

    session
        .set(&[adv("10.1.0.0/24", Ipv4Addr::new(10, 0, 0, 1), &[])])
        .expect("set");

    let update = read_update(&conn);
    let want: PathAttribute = PathAttributeValue::AsPath(vec![]).into();
    assert_eq!(update.path_attributes[1], want);

    session.close();
}

#[test]
fn negotiated_hold_time_drives_keepalives() {
    let upstream = Upstream::start();
    let session = session_to(upstream.addr(), 65001, 65002, 90);

    // Peer wants 3s, we offered 90s: keepalives must tick at 1s.
    let conn = upstream.establish(65002, 3);
    conn.set_read_timeout(Some(Duration::from_secs(2)))
        .expect("read timeout");
    match Message::read_from(&mut &conn).expect("read keepalive") {
        Message::KeepAlive => {}
        m => panic!("expected keepalive, got {m:?}"),
    }

    session.close();
}

#[test]
fn peer_hold_zero_disables_keepalives() {
    let upstream = Upstream::start();
    let session = session_to(upstream.addr(), 65001, 65002, 90);

    let conn = upstream.establish(65002, 0);
    conn.set_read_timeout(Some(Duration::from_millis(1500)))
        .expect("read timeout");
    match Message::read_from(&mut &conn) {
        Err(Error::Io(e))
            if e.kind() == ErrorKind::WouldBlock
                || e.kind() == ErrorKind::TimedOut => {}
        other => panic!("expected silence, got {other:?}"),
    }

    session.close();
}

#[test]
fn bad_marker_forces_reconnect() {
    let upstream = Upstream::start();
    let session = session_to(upstream.addr(), 65001, 65002, 90);
    let mut conn = upstream.establish(65002, 90);

    let mut garbage = vec![0xeeu8; 16];
    garbage.extend_from_slice(&[0, 19, 4]);
    conn.write_all(&garbage).expect("write garbage");

    // The reader gives up on the marker and the session starts over.
    let conn = upstream.establish(65002, 90);
    assert_no_update(&conn);

    session.close();
}

#[test]
fn peer_asn_mismatch_rejected() {
    let upstream = Upstream::start();
    let session = session_to(upstream.addr(), 65001, 65002, 90);

    let (conn, _) = upstream.open_only(65099, 90);
    match Message::read_from(&mut &conn) {
        Err(_) => {}
        Ok(m) => panic!("expected teardown, got {m:?}"),
    }

    // The retry presents the configured ASN and is accepted.
    let _conn = upstream.establish(65002, 90);

    session.close();
}

#[test]
fn close_shuts_down_session() {
    let upstream = Upstream::start();
    let session = session_to(upstream.addr(), 65001, 65002, 90);
    let conn = upstream.establish(65002, 90);

    session
        .set(&[adv("10.1.0.0/24", Ipv4Addr::new(10, 0, 0, 1), &[])])
        .expect("set");
    read_update(&conn);

    session.close();
    match Message::read_from(&mut &conn) {
        Err(_) => {}
        Ok(m) => panic!("expected teardown, got {m:?}"),
    }

    // No reconnect attempt outlives the close.
    upstream
        .listener
        .set_nonblocking(true)
        .expect("nonblocking");
    sleep(Duration::from_secs(3));
    match upstream.listener.accept() {
        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
        other => panic!("expected no connection, got {other:?}"),
    }

    // The control surface stays callable, it just produces no traffic.
    session
        .set(&[adv("10.2.0.0/24", Ipv4Addr::new(10, 0, 0, 1), &[])])
        .expect("set");
}

#[test]
fn set_validates_communities() {
    let upstream = Upstream::start();
    let session = session_to(upstream.addr(), 65001, 65002, 90);
    let conn = upstream.establish(65002, 90);
    let next_hop = Ipv4Addr::new(10, 0, 0, 1);

    session
        .set(&[adv("10.1.0.0/24", next_hop, &[100])])
        .expect("set");
    read_update(&conn);

    let communities: Vec<u32> = (0..64).collect();
    match session.set(&[adv("10.2.0.0/24", next_hop, &communities)]) {
        Err(Error::TooManyCommunities { max: 63, got: 64 }) => {}
        other => panic!("expected validation error, got {other:?}"),
    }

    // The failed set must not have disturbed the converged state.
    assert_no_update(&conn);

    session.close();
}

#[test]
fn new_validates_hold_time() {
    let router = RouterConfig {
        asn: 65001,
        id: ROUTER_ID,
    };
    let peer = |hold_time| PeerConfig {
        host: "127.0.0.1:179".parse().unwrap(),
        asn: 65002,
        hold_time,
    };

    assert!(matches!(
        Session::new(router, peer(1), init_logger()),
        Err(Error::HoldTimeTooSmall)
    ));
    assert!(matches!(
        Session::new(router, peer(1 << 16), init_logger()),
        Err(Error::HoldTimeTooLarge)
    ));
}
