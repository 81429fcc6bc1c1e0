use crate::db::ClientCert;
use crate::Db;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    collections::HashMap,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::watch;

const PING_PAYLOAD: &[u8] = b"HELLO-R-U-THERE";
const READ_TIMEOUT: Duration = Duration::from_secs(3);
const TICK: Duration = Duration::from_secs(5);

const ECHO_REQUEST: u8 = 8;
const ECHO_REPLY: u8 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PingRecord {
    pub reachable: bool,
    pub rtt: Duration,
}

/// Per-peer liveness, written by the prober and read by the client listing.
/// Entries appear on the first probe and are removed when a peer is deleted.
#[derive(Default)]
pub struct LivenessMap {
    inner: Mutex<HashMap<IpAddr, PingRecord>>,
}

impl LivenessMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, ip: &IpAddr) -> (bool, Duration) {
        match self.inner.lock().get(ip) {
            Some(record) => (record.reachable, record.rtt),
            None => (false, Duration::ZERO),
        }
    }

    pub fn write(&self, ip: IpAddr, reachable: bool, rtt: Duration) {
        self.inner.lock().insert(ip, PingRecord { reachable, rtt });
    }

    pub fn delete(&self, ip: &IpAddr) {
        self.inner.lock().remove(ip);
    }
}

/// One raw ICMP conversation. The factory is the injectable seam that lets
/// tests drive the socket end-to-end.
pub trait IcmpSocket: Send {
    fn send_to(&mut self, packet: &[u8], target: Ipv4Addr) -> io::Result<usize>;
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

pub trait SocketFactory: Send + Sync {
    fn listen(&self) -> io::Result<Box<dyn IcmpSocket>>;
}

pub struct RawSocketFactory;

struct RawIcmpSocket {
    socket: Socket,
}

impl SocketFactory for RawSocketFactory {
    fn listen(&self) -> io::Result<Box<dyn IcmpSocket>> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        let bind_addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
        socket.bind(&bind_addr.into())?;
        Ok(Box::new(RawIcmpSocket { socket }))
    }
}

impl IcmpSocket for RawIcmpSocket {
    fn send_to(&mut self, packet: &[u8], target: Ipv4Addr) -> io::Result<usize> {
        let addr: SocketAddr = (target, 0).into();
        self.socket.send_to(packet, &addr.into())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.socket.set_read_timeout(Some(timeout))
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        self.socket.read(buf)
    }
}

/// RFC 1071 internet checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub(crate) fn echo_request(id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![ECHO_REQUEST, 0, 0, 0];
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(payload);
    let ck = checksum(&packet);
    packet[2..4].copy_from_slice(&ck.to_be_bytes());
    packet
}

/// A raw ICMP socket hands back the full IPv4 packet; the ICMP type sits
/// right after the variable-length IP header.
fn reply_icmp_type(buf: &[u8]) -> Option<u8> {
    if buf.len() < 20 {
        return None;
    }
    let header_len = usize::from(buf[0] & 0x0f) * 4;
    buf.get(header_len).copied()
}

/// Sends one echo request and records the outcome: a reply within the
/// deadline writes `(true, rtt)`, a timeout writes `(false, 0)`, and any
/// other failure leaves the map untouched.
pub fn probe(target: IpAddr, factory: &dyn SocketFactory, liveness: &LivenessMap) {
    let IpAddr::V4(target_v4) = target else {
        return;
    };

    let packet = echo_request((std::process::id() & 0xffff) as u16, 1, PING_PAYLOAD);

    let mut socket = match factory.listen() {
        Ok(socket) => socket,
        Err(e) => {
            log::debug!("ping {target}: cannot open icmp socket: {e}");
            return;
        }
    };

    let start = Instant::now();
    if let Err(e) = socket.send_to(&packet, target_v4) {
        log::debug!("ping {target}: send: {e}");
        return;
    }
    if let Err(e) = socket.set_read_timeout(READ_TIMEOUT) {
        log::debug!("ping {target}: deadline: {e}");
        return;
    }

    let mut reply = [0u8; 1500];
    let read = match socket.recv(&mut reply) {
        Ok(read) => read,
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            liveness.write(target, false, Duration::ZERO);
            return;
        }
        Err(e) => {
            log::debug!("ping {target}: recv: {e}");
            return;
        }
    };
    let rtt = start.elapsed();

    match reply_icmp_type(&reply[..read]) {
        Some(ECHO_REPLY) => liveness.write(target, true, rtt),
        Some(_) => liveness.write(target, false, Duration::ZERO),
        None => log::debug!("ping {target}: short reply ({read} bytes)"),
    }
}

/// Probes every known peer each tick, waiting for the whole batch before the
/// next one. Exits between ticks when the shutdown channel fires; in-flight
/// probes run out through their own read deadline.
pub async fn ping_loop(
    db: Db,
    liveness: Arc<LivenessMap>,
    factory: Arc<dyn SocketFactory>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(TICK);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                log::info!("ping loop: exiting");
                return;
            }
            _ = interval.tick() => {}
        }

        let clients = match ClientCert::list(&db.lock()) {
            Ok(clients) => clients,
            Err(e) => {
                log::error!("ping loop: {e}");
                continue;
            }
        };

        let mut probes = Vec::with_capacity(clients.len());
        for client in clients {
            let Some(ip) = client
                .ip
                .split('/')
                .next()
                .and_then(|raw| raw.parse::<IpAddr>().ok())
            else {
                continue;
            };
            let liveness = liveness.clone();
            let factory = factory.clone();
            probes.push(tokio::task::spawn_blocking(move || {
                probe(ip, factory.as_ref(), &liveness)
            }));
        }
        for handle in probes {
            handle.await.ok();
        }
    }
}
