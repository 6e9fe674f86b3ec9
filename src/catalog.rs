//! Channel catalog: which channels exist, where their multicast streams
//! live, and the master key that unlocks their ECMs.
//!
//! The catalog is fetched from a configured URL as a JSON document of the
//! form `{"date": "...", "channels": [[name, "igmp://host:port", key],
//! ...]}` and refreshed hourly. Readers always see a complete map: each
//! refresh builds a new map and swaps it in whole.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// How often the catalog is refetched.
const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Address prefix every playable catalog entry carries.
const IGMP_SCHEME: &str = "igmp://";

/// One playable channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Multicast endpoint, `host:port`.
    pub addr: String,
    /// AES-128 master key for the channel's ECMs.
    pub master_key: [u8; 16],
}

/// Channel name → channel info.
pub type ChannelMap = HashMap<String, ChannelInfo>;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("catalog decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct CatalogDocument {
    date: String,
    channels: Vec<CatalogEntry>,
}

/// `[name, addr, key]` triple as published by the catalog server.
#[derive(Deserialize)]
struct CatalogEntry(String, String, KeyField);

/// The key field is either a hex string or a numeric placeholder for
/// channels that cannot be descrambled; numeric entries are dropped.
#[derive(Deserialize)]
#[serde(untagged)]
enum KeyField {
    Hex(String),
    Numeric(serde::de::IgnoredAny),
}

/// Shared, atomically replaceable channel map.
pub struct Catalog {
    channels: RwLock<Arc<ChannelMap>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(Arc::new(ChannelMap::new())),
        }
    }

    /// Look up one channel by name.
    pub async fn get(&self, name: &str) -> Option<ChannelInfo> {
        self.channels.read().await.get(name).cloned()
    }

    /// Current map, as an immutable snapshot.
    pub async fn snapshot(&self) -> Arc<ChannelMap> {
        Arc::clone(&*self.channels.read().await)
    }

    /// Swap in a freshly built map.
    pub async fn replace(&self, map: ChannelMap) {
        *self.channels.write().await = Arc::new(map);
    }

    /// Fetch the catalog document and publish the channels it lists.
    pub async fn refresh_from(&self, url: &str) -> Result<(), CatalogError> {
        let body = reqwest::get(url).await?.error_for_status()?.text().await?;
        let (date, map) = parse_catalog(&body)?;
        let count = map.len();
        self.replace(map).await;
        info!("{count} channels loaded, last updated on {date}");
        Ok(())
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a catalog document into a channel map.
///
/// Entries are dropped (with a warning where it points at a data problem)
/// when the key is numeric, the address does not carry the `igmp://`
/// scheme, or the key does not decode to exactly 16 bytes.
pub fn parse_catalog(body: &str) -> Result<(String, ChannelMap), CatalogError> {
    let doc: CatalogDocument = serde_json::from_str(body)?;

    let mut map = ChannelMap::new();
    for CatalogEntry(name, addr, key) in doc.channels {
        let KeyField::Hex(key_hex) = key else {
            continue;
        };
        let Some(addr) = addr.strip_prefix(IGMP_SCHEME) else {
            warn!("skipping channel {name}: unsupported address {addr}");
            continue;
        };
        let master_key = match hex::decode(&key_hex) {
            Ok(bytes) if bytes.len() == 16 => {
                let mut key = [0u8; 16];
                key.copy_from_slice(&bytes);
                key
            }
            _ => {
                warn!("skipping channel {name}: master key is not 16 hex-encoded bytes");
                continue;
            }
        };
        map.insert(
            name,
            ChannelInfo {
                addr: addr.to_string(),
                master_key,
            },
        );
    }
    Ok((doc.date, map))
}

/// Fetch the catalog now and then once per hour, forever. A failed fetch
/// keeps the previous map and is retried at the next tick.
pub fn spawn_refresh(catalog: Arc<Catalog>, url: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = catalog.refresh_from(&url).await {
                error!("{e}");
            }
        }
    })
}
