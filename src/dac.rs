//! Items related to Ether Dream DACs and their discovery on the LAN.
//!
//! DACs broadcast a 36-byte packet on UDP port 7654 roughly once per second.
//! The listener keeps a directory of every DAC heard recently and notifies
//! subscribers with an immutable snapshot whenever the directory changes.

use crate::protocol::{self, DacBroadcast};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

/// How long a receive may block before the listener re-checks for expiries.
const RECV_TIMEOUT: Duration = Duration::from_millis(1200);
/// A DAC that has not broadcast for this long is dropped from the directory.
const DAC_TTL: Duration = Duration::from_secs(3);

/// An immutable view of the DACs currently broadcasting, keyed by id.
pub type DacSnapshot = HashMap<String, DetectedDac>;

/// Callback functions that may be passed to the `subscribe_dacs` function.
pub trait DacDirectoryCallback: FnMut(&DacSnapshot) + Send {}
impl<F> DacDirectoryCallback for F where F: FnMut(&DacSnapshot) + Send {}

/// An Ether Dream DAC observed on the LAN via its broadcast packets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectedDac {
    /// Six hex characters formed from the trailing half of the MAC address.
    pub id: String,
    /// The address the DAC's broadcasts arrive from.
    pub ip_addr: IpAddr,
    pub hw_revision: u16,
    pub sw_revision: u16,
    /// Capacity of the on-device point buffer.
    pub buffer_capacity: u16,
    /// The maximum point rate allowed by the DAC.
    pub max_point_rate: u32,
}

impl DetectedDac {
    /// Construct the identity of a DAC from a broadcast packet and the
    /// address it arrived from.
    pub fn from_broadcast(broadcast: &DacBroadcast, source_addr: SocketAddr) -> Self {
        let mac = &broadcast.mac_address;
        let id = format!("{:02x}{:02x}{:02x}", mac[3], mac[4], mac[5]);
        DetectedDac {
            id,
            ip_addr: source_addr.ip(),
            hw_revision: broadcast.hw_revision,
            sw_revision: broadcast.sw_revision,
            buffer_capacity: broadcast.buffer_capacity,
            max_point_rate: broadcast.max_point_rate,
        }
    }

    /// The address of the DAC's TCP control channel.
    pub fn stream_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_addr, protocol::STREAM_PORT)
    }
}

// The directory of recently heard DACs.
//
// Kept separate from the socket loop so expiry can be driven by explicit
// timestamps.
pub(crate) struct Directory {
    dacs: HashMap<String, (DetectedDac, Instant)>,
}

impl Directory {
    pub(crate) fn new() -> Self {
        Directory {
            dacs: HashMap::new(),
        }
    }

    /// Record a broadcast heard at `now`. Returns `true` iff the id was
    /// previously absent.
    pub(crate) fn insert(&mut self, dac: DetectedDac, now: Instant) -> bool {
        self.dacs.insert(dac.id.clone(), (dac, now)).is_none()
    }

    /// Drop every entry not heard from within the TTL. Returns `true` iff any
    /// entry was dropped.
    pub(crate) fn expire(&mut self, now: Instant) -> bool {
        let before = self.dacs.len();
        self.dacs
            .retain(|_, (_, last_seen)| now.duration_since(*last_seen) < DAC_TTL);
        self.dacs.len() != before
    }

    pub(crate) fn snapshot(&self) -> DacSnapshot {
        self.dacs
            .iter()
            .map(|(id, (dac, _))| (id.clone(), dac.clone()))
            .collect()
    }
}

type Subscribers = Arc<Mutex<Vec<Box<dyn DacDirectoryCallback>>>>;

/// The broadcast listener and its subscriber list.
///
/// The listener thread is started by the first subscription and runs for the
/// lifetime of the process; the socket is bound once to the fixed broadcast
/// port, so the thread is not restarted if the socket fails.
pub(crate) struct Discovery {
    subscribers: Subscribers,
    started: Once,
}

impl Discovery {
    pub(crate) fn new() -> Self {
        Discovery {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            started: Once::new(),
        }
    }

    pub(crate) fn subscribe(&self, callback: Box<dyn DacDirectoryCallback>) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(callback);
        }
        let subscribers = self.subscribers.clone();
        self.started.call_once(move || match bind_broadcast_socket() {
            Ok(socket) => {
                std::thread::Builder::new()
                    .name("laser_wav-dac-listener".to_string())
                    .spawn(move || run_listener(socket, subscribers))
                    .expect("failed to spawn DAC listener thread");
            }
            Err(err) => log::error!("failed to bind DAC broadcast socket: {}", err),
        });
    }
}

// Bind the broadcast port with address reuse so we can share it with other
// listening processes on the host.
fn bind_broadcast_socket() -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], protocol::BROADCAST_PORT));
    socket.bind(&addr.into())?;
    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    Ok(socket)
}

fn run_listener(socket: UdpSocket, subscribers: Subscribers) {
    let mut directory = Directory::new();
    let mut buf = [0u8; 256];
    loop {
        let mut changed = false;
        match socket.recv_from(&mut buf) {
            Ok((len, source_addr)) if len == protocol::BROADCAST_BYTES => {
                let mut packet = [0u8; protocol::BROADCAST_BYTES];
                packet.copy_from_slice(&buf[..len]);
                let broadcast = DacBroadcast::read_from(&packet);
                let dac = DetectedDac::from_broadcast(&broadcast, source_addr);
                changed = directory.insert(dac, Instant::now());
            }
            // Packets of any other length are not broadcasts.
            Ok(_) => (),
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => {
                log::error!("DAC broadcast listener terminating: {}", err);
                return;
            }
        }
        if directory.expire(Instant::now()) {
            changed = true;
        }
        if changed {
            let snapshot = directory.snapshot();
            let mut subscribers = match subscribers.lock() {
                Ok(subscribers) => subscribers,
                Err(_) => return,
            };
            for callback in subscribers.iter_mut() {
                callback(&snapshot);
            }
        }
    }
}
