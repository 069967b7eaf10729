//! # Session Store
//!
//! Holds the current session key material and the ranked server list, and persists both
//! across restarts.
//!
//! ## Features
//! - **Atomic swap**: the current session is an `Arc` published through a watch channel;
//!   readers see the old or the new material, never a mix
//! - **Two cache artifacts** per account: `session.bin` (bincode) and `servers.txt`
//!   (one `host:port` per line, best first)
//! - **Non-fatal loading**: missing, corrupt or expired caches are logged and ignored
//! - **Default servers**: an empty list refills from the compiled-in defaults
//!
//! ## Usage
//! ```ignore
//! let store = SessionStore::new("10001", Some(cache_root), default_servers());
//! store.load_from_cache().await;
//! store.load_server_list_from_cache().await;
//!
//! store.override_session(Some(material), true).await?;
//! let current = store.current();
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, Result};
use crate::utils::crypto::SymmetricKey;
use crate::utils::time::{expiry_from_now, is_past};

const SESSION_FILE: &str = "session.bin";
const SERVER_LIST_FILE: &str = "servers.txt";

/// Compiled-in fallback addresses
pub const DEFAULT_SERVERS: &[(&str, u16)] = &[
    ("42.81.169.46", 8080),
    ("42.81.172.81", 80),
    ("114.221.148.59", 14000),
    ("42.81.172.147", 443),
    ("125.94.60.146", 80),
    ("114.221.144.215", 80),
    ("msfwifi.3g.qq.com", 8080),
    ("42.81.172.22", 80),
];

pub fn default_servers() -> Vec<ServerAddress> {
    DEFAULT_SERVERS
        .iter()
        .map(|(host, port)| ServerAddress::new(*host, *port))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| ProtocolError::ConfigError(format!("Missing port in '{s}'")))?;
        if host.is_empty() {
            return Err(ProtocolError::ConfigError(format!("Missing host in '{s}'")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid port in '{s}'")))?;
        Ok(Self::new(host, port))
    }
}

/// Symmetric session plus the exchange values it came from.
///
/// The ephemeral private key is never part of this; it dies with the handshake.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeyMaterial {
    pub shared_secret: Vec<u8>,
    pub public_key: Vec<u8>,
    pub session_key: SymmetricKey,
    /// Unix milliseconds
    pub created_at: u64,
    /// Unix milliseconds
    pub expires_at: u64,
}

impl SessionKeyMaterial {
    pub fn new(
        shared_secret: Vec<u8>,
        public_key: Vec<u8>,
        session_key: SymmetricKey,
        ttl: Duration,
    ) -> Result<Self> {
        let (created_at, expires_at) = expiry_from_now(ttl)?;
        Ok(Self {
            shared_secret,
            public_key,
            session_key,
            created_at,
            expires_at,
        })
    }

    pub fn is_expired(&self) -> bool {
        is_past(self.expires_at)
    }
}

impl fmt::Debug for SessionKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeyMaterial")
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Session and server-list state for one account
pub struct SessionStore {
    account: String,
    /// Account-scoped cache directory; `None` keeps everything in memory
    dir: Option<PathBuf>,
    defaults: Vec<ServerAddress>,
    session: watch::Sender<Option<Arc<SessionKeyMaterial>>>,
    servers: Mutex<Vec<ServerAddress>>,
}

impl SessionStore {
    /// Create an empty store; caches live under `<cache_root>/<account>/`
    pub fn new(
        account: impl Into<String>,
        cache_root: Option<PathBuf>,
        defaults: Vec<ServerAddress>,
    ) -> Self {
        let account = account.into();
        let dir = cache_root.map(|root| root.join(&account));
        let (session, _) = watch::channel(None);
        Self {
            servers: Mutex::new(defaults.clone()),
            account,
            dir,
            defaults,
            session,
        }
    }

    /// In-memory store with the default server list
    pub fn memory(account: impl Into<String>) -> Self {
        Self::new(account, None, default_servers())
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn session_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(SESSION_FILE))
    }

    fn server_list_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(SERVER_LIST_FILE))
    }

    /// Current material, expired or not
    pub fn current(&self) -> Option<Arc<SessionKeyMaterial>> {
        self.session.borrow().clone()
    }

    /// Current material if it has not expired
    pub fn valid_session(&self) -> Option<Arc<SessionKeyMaterial>> {
        self.current().filter(|m| !m.is_expired())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<SessionKeyMaterial>>> {
        self.session.subscribe()
    }

    /// Wait until some session material is published
    pub async fn wait_for_session(&self) -> Result<Arc<SessionKeyMaterial>> {
        let mut rx = self.session.subscribe();
        let guard = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        guard.clone().ok_or(ProtocolError::ConnectionClosed)
    }

    /// Replace the current session; the only mutator of the session reference.
    ///
    /// `None` forgets the session. With `persist`, the cache file follows.
    pub async fn override_session(
        &self,
        material: Option<SessionKeyMaterial>,
        persist: bool,
    ) -> Result<()> {
        self.session.send_replace(material.map(Arc::new));
        debug!(account = %self.account, "Session overridden");
        if persist {
            self.save_to_cache().await?;
        }
        Ok(())
    }

    /// Load session material from the cache. Returns whether a usable session was loaded.
    pub async fn load_from_cache(&self) -> bool {
        let Some(path) = self.session_path() else {
            return false;
        };
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No session cache");
                return false;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read session cache");
                return false;
            }
        };
        match bincode::deserialize::<SessionKeyMaterial>(&bytes) {
            Ok(material) if material.is_expired() => {
                debug!(path = %path.display(), "Cached session expired");
                false
            }
            Ok(material) => {
                self.session.send_replace(Some(Arc::new(material)));
                debug!(path = %path.display(), "Session loaded from cache");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt session cache ignored");
                false
            }
        }
    }

    /// Write the current session (or remove the file when there is none)
    pub async fn save_to_cache(&self) -> Result<()> {
        let Some(path) = self.session_path() else {
            trace!("Session cache disabled");
            return Ok(());
        };
        match self.current() {
            Some(material) => {
                let bytes = bincode::serialize(material.as_ref())?;
                write_atomic(&path, &bytes).await
            }
            None => match tokio::fs::remove_file(&path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
        }
    }

    /// Load the ranked server list. Returns whether a non-empty list was loaded.
    pub async fn load_server_list_from_cache(&self) -> bool {
        let Some(path) = self.server_list_path() else {
            return false;
        };
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to read server list cache");
                }
                return false;
            }
        };

        let mut loaded = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match line.parse::<ServerAddress>() {
                Ok(addr) if !loaded.contains(&addr) => loaded.push(addr),
                Ok(_) => {}
                Err(e) => warn!(line, error = %e, "Skipping bad server list entry"),
            }
        }
        if loaded.is_empty() {
            return false;
        }
        debug!(count = loaded.len(), "Server list loaded from cache");
        *self.servers.lock().await = loaded;
        true
    }

    pub async fn save_server_list_to_cache(&self) -> Result<()> {
        let Some(path) = self.server_list_path() else {
            trace!("Server list cache disabled");
            return Ok(());
        };
        let text = self
            .servers
            .lock()
            .await
            .iter()
            .map(|s| format!("{s}\n"))
            .collect::<String>();
        write_atomic(&path, text.as_bytes()).await
    }

    /// Ranked servers; refilled from the defaults when empty
    pub async fn servers(&self) -> Vec<ServerAddress> {
        let mut servers = self.servers.lock().await;
        if servers.is_empty() {
            debug!("Server list exhausted, restoring defaults");
            servers.clone_from(&self.defaults);
        }
        servers.clone()
    }

    /// Best-ranked server
    pub async fn next_server(&self) -> Option<ServerAddress> {
        self.servers().await.into_iter().next()
    }

    /// Put `added` at the front in the given order, dropping duplicates
    pub async fn add_servers(&self, added: Vec<ServerAddress>, persist: bool) -> Result<()> {
        {
            let mut servers = self.servers.lock().await;
            servers.retain(|s| !added.contains(s));
            let rest = std::mem::take(&mut *servers);
            let mut merged = Vec::with_capacity(added.len() + rest.len());
            for addr in added.into_iter().chain(rest) {
                if !merged.contains(&addr) {
                    merged.push(addr);
                }
            }
            *servers = merged;
        }
        if persist {
            self.save_server_list_to_cache().await?;
        }
        Ok(())
    }

    /// Drop a server that failed to connect
    pub async fn remove_server(&self, addr: &ServerAddress) {
        self.servers.lock().await.retain(|s| s != addr);
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn material(ttl: Duration) -> SessionKeyMaterial {
        SessionKeyMaterial::new(vec![1; 32], vec![2; 32], [3; 32], ttl).unwrap()
    }

    #[test]
    fn test_server_address_parse() {
        let addr: ServerAddress = "msfwifi.3g.qq.com:8080".parse().unwrap();
        assert_eq!(addr, ServerAddress::new("msfwifi.3g.qq.com", 8080));
        assert_eq!(addr.to_string(), "msfwifi.3g.qq.com:8080");
        assert!("nohost".parse::<ServerAddress>().is_err());
        assert!(":80".parse::<ServerAddress>().is_err());
        assert!("h:99999".parse::<ServerAddress>().is_err());
    }

    #[tokio::test]
    async fn test_session_round_trip_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new("10001", Some(dir.path().to_path_buf()), default_servers());
        store
            .override_session(Some(material(Duration::from_secs(60))), true)
            .await
            .unwrap();
        assert!(dir.path().join("10001").join(SESSION_FILE).exists());

        let reloaded = SessionStore::new("10001", Some(dir.path().to_path_buf()), default_servers());
        assert!(reloaded.load_from_cache().await);
        assert_eq!(reloaded.current().unwrap().session_key, [3; 32]);
    }

    #[tokio::test]
    async fn test_corrupt_and_expired_cache_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new("acc", Some(dir.path().to_path_buf()), default_servers());
        tokio::fs::create_dir_all(dir.path().join("acc")).await.unwrap();
        tokio::fs::write(dir.path().join("acc").join(SESSION_FILE), b"\x01garbage")
            .await
            .unwrap();
        assert!(!store.load_from_cache().await);
        assert!(store.current().is_none());

        store
            .override_session(Some(material(Duration::ZERO)), true)
            .await
            .unwrap();
        let fresh = SessionStore::new("acc", Some(dir.path().to_path_buf()), default_servers());
        assert!(!fresh.load_from_cache().await);
    }

    #[tokio::test]
    async fn test_override_is_visible_to_waiters() {
        let store = Arc::new(SessionStore::memory("acc"));
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for_session().await })
        };
        tokio::task::yield_now().await;
        store
            .override_session(Some(material(Duration::from_secs(5))), false)
            .await
            .unwrap();
        let seen = waiter.await.unwrap().unwrap();
        assert_eq!(seen.public_key, vec![2; 32]);
    }

    #[tokio::test]
    async fn test_server_list_ranking_and_refill() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = vec![ServerAddress::new("a", 1), ServerAddress::new("b", 2)];
        let store = SessionStore::new("acc", Some(dir.path().to_path_buf()), defaults.clone());

        store
            .add_servers(vec![ServerAddress::new("c", 3), ServerAddress::new("b", 2)], true)
            .await
            .unwrap();
        let ranked = store.servers().await;
        assert_eq!(store.next_server().await, Some(ServerAddress::new("c", 3)));
        assert_eq!(
            ranked,
            vec![
                ServerAddress::new("c", 3),
                ServerAddress::new("b", 2),
                ServerAddress::new("a", 1)
            ]
        );

        let reloaded = SessionStore::new("acc", Some(dir.path().to_path_buf()), defaults.clone());
        assert!(reloaded.load_server_list_from_cache().await);
        assert_eq!(reloaded.servers().await, ranked);

        for addr in &ranked {
            reloaded.remove_server(addr).await;
        }
        assert_eq!(reloaded.servers().await, defaults);
        assert_eq!(reloaded.next_server().await, Some(ServerAddress::new("a", 1)));
    }

    #[tokio::test]
    async fn test_memory_store_saves_are_noops() {
        let store = SessionStore::memory("acc");
        store.save_to_cache().await.unwrap();
        store.save_server_list_to_cache().await.unwrap();
        assert!(!store.load_from_cache().await);
        assert_eq!(store.servers().await.len(), DEFAULT_SERVERS.len());
    }
}
