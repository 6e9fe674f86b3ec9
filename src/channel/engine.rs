//! Per-channel descrambling engine.
//!
//! Each live channel is owned by one long-lived task: it reads RTP
//! datagrams from the channel's socket (opened by the registry's socket
//! factory, normally a multicast-group join), runs them through the
//! descrambling pipeline and hands the result to its output — the
//! fan-out ring for HTTP subscribers, or a unicast socket for the RTP
//! relay mode, which forwards the whole datagram (RTP header intact)
//! after the TS payload has been descrambled in place.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{error, info};
use socket2::{Domain, InterfaceIndexOrAddress, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time;

use crate::channel::ring::PacketRing;
use crate::descramble::{Descrambler, DescrambleError, TS_PACKET_SIZE};

/// Largest datagram the multicast reader accepts.
const MAX_DATAGRAM: usize = 1500;

/// How long a multicast read may stall before the engine gives up.
const READ_DEADLINE: Duration = Duration::from_secs(5);

/// Errors that terminate a channel engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Descramble(#[from] DescrambleError),

    #[error("no data within {}s read deadline", READ_DEADLINE.as_secs())]
    ReadTimeout,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Handle to one channel's descrambling task.
///
/// The mutable descrambling state lives inside the task; this handle
/// carries only what other tasks need: the subscriber refcount, the
/// failure latch, the stop signal and the fan-out ring (HTTP engines
/// only — unicast relays have no subscribers to fan out to).
pub struct ChannelEngine {
    endpoint: String,
    master_key: [u8; 16],
    ring: Option<Arc<PacketRing>>,
    clients: AtomicU32,
    failed: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl ChannelEngine {
    /// Create an engine handle with one initial client.
    pub fn new(endpoint: String, master_key: [u8; 16], ring: Option<Arc<PacketRing>>) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            endpoint,
            master_key,
            ring,
            clients: AtomicU32::new(1),
            failed: AtomicBool::new(false),
            stop_tx,
        })
    }

    /// Register one more client; returns the new count.
    pub fn retain_client(&self) -> u32 {
        self.clients.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop one client; returns how many remain.
    pub fn release_client(&self) -> u32 {
        self.clients.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn client_count(&self) -> u32 {
        self.clients.load(Ordering::SeqCst)
    }

    /// Ask the engine task to exit at its next loop iteration. The signal
    /// is level-triggered: a stop requested before the task first checks
    /// it is still observed.
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Whether the engine died from an I/O or stream-format error.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// The engine task body. Runs until stopped or until the first error,
    /// then closes the ring so every subscriber observes end-of-stream.
    ///
    /// `socket` is the outcome of opening the channel's read source (see
    /// [`ChannelRegistry::open_socket`](crate::channel::ChannelRegistry));
    /// an `Err` is the engine's startup failure and takes the same
    /// terminal path as any later read error.
    pub async fn run(self: Arc<Self>, socket: io::Result<UdpSocket>, unicast_dest: Option<UdpSocket>) {
        info!("start descrambling channel @ {}", self.endpoint);
        let result = match socket {
            Ok(socket) => self.read_loop(socket, unicast_dest).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => {
                info!("no more clients, stop descrambling channel @ {}", self.endpoint);
            }
            Err(e) => {
                error!("{} @ {}", e, self.endpoint);
                self.failed.store(true, Ordering::SeqCst);
            }
        }
        if let Some(ring) = &self.ring {
            ring.close();
        }
        info!("done @ {}", self.endpoint);
    }

    async fn read_loop(&self, socket: UdpSocket, unicast_dest: Option<UdpSocket>) -> Result<(), EngineError> {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut descrambler = Descrambler::new(&self.master_key);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let n = tokio::select! {
                _ = stop_rx.wait_for(|stop| *stop) => return Ok(()),
                read = time::timeout(READ_DEADLINE, socket.recv_from(&mut buf)) => match read {
                    Ok(Ok((n, _))) => n,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(EngineError::ReadTimeout),
                },
            };

            let datagram = &mut buf[..n];
            let offset = descrambler.process_datagram(datagram)?;

            if let Some(ring) = &self.ring {
                for pkt in datagram[offset..].chunks_exact(TS_PACKET_SIZE) {
                    ring.publish(Bytes::copy_from_slice(pkt));
                }
            } else if let Some(dest) = &unicast_dest {
                dest.send(datagram).await?;
            }
        }
    }
}

/// Bind a nonblocking UDP socket on the channel endpoint and join its
/// multicast group on the given interface.
pub(crate) fn join_multicast(endpoint: &str, ifindex: u32) -> io::Result<UdpSocket> {
    let addr: SocketAddr = endpoint.parse().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("bad channel endpoint {endpoint}: {e}"),
        )
    })?;
    let IpAddr::V4(group) = addr.ip() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "only IPv4 multicast is supported",
        ));
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.join_multicast_v4_n(&group, &InterfaceIndexOrAddress::Index(ifindex))?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}
