//! Registry of running channel engines.
//!
//! One engine per multicast endpoint, shared by every HTTP subscriber of
//! that channel. The registry owns the live engines; engines know nothing
//! about the registry, they only honor their stop signal.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use log::{debug, error, info};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::channel::engine::{join_multicast, ChannelEngine};
use crate::channel::ring::{PacketRing, RingReader};

/// Builds the datagram socket an engine reads from, given the channel's
/// multicast endpoint. Injectable so engines can be driven from plain
/// sockets instead of live multicast groups.
pub type SocketFactory = dyn Fn(&str) -> io::Result<UdpSocket> + Send + Sync;

struct EngineEntry {
    engine: Arc<ChannelEngine>,
    ring: Arc<PacketRing>,
    task: JoinHandle<()>,
}

/// Process-wide map from multicast endpoint to its running engine.
pub struct ChannelRegistry {
    make_socket: Box<SocketFactory>,
    entries: Mutex<HashMap<String, EngineEntry>>,
}

impl ChannelRegistry {
    /// Create a registry whose engines join multicast groups on the given
    /// interface.
    pub fn new(ifindex: u32) -> Self {
        Self::with_socket_factory(Box::new(move |endpoint| join_multicast(endpoint, ifindex)))
    }

    /// Create a registry with a custom read-socket source.
    pub fn with_socket_factory(make_socket: Box<SocketFactory>) -> Self {
        Self {
            make_socket,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Open the read socket for a channel endpoint.
    pub fn open_socket(&self, endpoint: &str) -> io::Result<UdpSocket> {
        (self.make_socket)(endpoint)
    }

    /// Subscribe to a channel, starting its engine if this is the first
    /// client.
    pub async fn acquire(&self, endpoint: &str, master_key: [u8; 16]) -> RingReader {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(endpoint) {
            let clients = entry.engine.retain_client();
            debug!("reusing engine @ {endpoint}, clients={clients}");
            return entry.ring.subscribe();
        }

        let ring = Arc::new(PacketRing::new());
        let engine = ChannelEngine::new(endpoint.to_string(), master_key, Some(Arc::clone(&ring)));
        let socket = self.open_socket(endpoint);
        let task = tokio::spawn(Arc::clone(&engine).run(socket, None));
        let reader = ring.subscribe();
        entries.insert(
            endpoint.to_string(),
            EngineEntry { engine, ring, task },
        );
        reader
    }

    /// Drop one subscription. When the last client leaves, the engine is
    /// told to stop, its task is awaited (the "stopped" acknowledgement —
    /// immediate if the engine already died of an I/O error) and the
    /// entry is removed.
    pub async fn release(&self, endpoint: &str) {
        let mut entries = self.entries.lock().await;

        let Some(entry) = entries.get(endpoint) else {
            return;
        };
        let remaining = entry.engine.release_client();
        debug!("released client @ {endpoint}, clients={remaining}");
        if remaining > 0 {
            return;
        }

        if let Some(entry) = entries.remove(endpoint) {
            if entry.engine.is_failed() {
                debug!("engine @ {endpoint} already terminated, reaping it");
            } else {
                info!("last client left, stopping engine @ {endpoint}");
            }
            entry.engine.request_stop();
            if let Err(e) = entry.task.await {
                error!("engine task for {endpoint} aborted: {e}");
            }
        }
    }

    /// Look up the running engine for an endpoint.
    pub async fn get(&self, endpoint: &str) -> Option<Arc<ChannelEngine>> {
        self.entries
            .lock()
            .await
            .get(endpoint)
            .map(|entry| Arc::clone(&entry.engine))
    }

    /// Number of running engines.
    pub async fn engine_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}
