//! SSH connection pool
//!
//! At most one live client per fingerprint key. Entries are
//! reference-counted; acquire/release are serialised per key, so two
//! concurrent commands against the same host share one TCP connection.
//! Reused clients are liveness-probed first, and a failed probe triggers one
//! transparent reconnect. Idle clients are swept after `idle_timeout`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use russh::client;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::adapters::Emitter;
use crate::command::{SshAuth, SshOptions};
use crate::error::{Error, Result};
use crate::events::Event;

/// Client-side handler. Host keys are accepted; known-hosts verification is
/// the caller's concern (the engine executes where it is pointed).
pub struct ClientHandler;

#[async_trait::async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Shared handle to one live SSH session.
pub(crate) type SharedHandle = Arc<AsyncMutex<client::Handle<ClientHandler>>>;

pub(crate) struct PoolEntry {
    pub handle: SharedHandle,
    pub refcount: usize,
    pub last_used: Instant,
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Bounds concurrent channels on one transport. One permit when
    /// multiplexing is off.
    pub channels: Arc<tokio::sync::Semaphore>,
}

#[derive(Default)]
struct KeySlot {
    entry: Option<PoolEntry>,
}

/// Reference-counted cache of live SSH clients keyed by fingerprint.
pub struct SshPool {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<KeySlot>>>>,
    idle_timeout: Duration,
    emitter: Emitter,
}

/// Compute the pool key for a set of SSH options.
///
/// The fingerprint folds in host, port, user and the auth material's
/// identity. It never appears in logs or event payloads.
pub fn fingerprint(opts: &SshOptions) -> String {
    let mut hasher = Sha256::new();
    hasher.update(opts.host.as_bytes());
    hasher.update([0]);
    hasher.update(opts.port.to_be_bytes());
    hasher.update([0]);
    hasher.update(opts.user.as_bytes());
    hasher.update([0]);
    match &opts.auth {
        SshAuth::Key { path, .. } => {
            hasher.update(b"key");
            hasher.update(path.to_string_lossy().as_bytes());
        }
        SshAuth::KeyData { data, .. } => {
            hasher.update(b"keydata");
            hasher.update(data.as_bytes());
        }
        SshAuth::Password(password) => {
            hasher.update(b"password");
            hasher.update(password.as_bytes());
        }
        SshAuth::Agent => hasher.update(b"agent"),
    }
    hex::encode(hasher.finalize())
}

/// Result of an acquire: the shared session plus its channel gate.
pub(crate) struct AcquiredClient {
    pub key: String,
    pub handle: SharedHandle,
    pub channels: Arc<tokio::sync::Semaphore>,
}

impl SshPool {
    pub fn new(idle_timeout: Duration, emitter: Emitter) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            idle_timeout,
            emitter,
        }
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<KeySlot>> {
        self.slots
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Acquire the client for `opts`, reusing a live one when possible.
    ///
    /// A reused client is probed first; on probe failure the entry is evicted
    /// and one fresh connection is established transparently.
    pub(crate) async fn acquire(&self, opts: &SshOptions) -> Result<AcquiredClient> {
        let key = fingerprint(opts);
        let slot = self.slot(&key);
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.entry.as_mut() {
            if probe(&entry.handle).await {
                entry.refcount += 1;
                entry.last_used = Instant::now();
                debug!(host = %entry.host, refcount = entry.refcount, "reusing pooled SSH client");
                return Ok(AcquiredClient {
                    key,
                    handle: entry.handle.clone(),
                    channels: entry.channels.clone(),
                });
            }

            // Dead connection: evict and fall through to a fresh connect.
            warn!(host = %entry.host, "pooled SSH client failed liveness probe, reconnecting");
            let stale = guard.entry.take();
            if let Some(stale) = stale {
                self.close_entry(stale).await;
            }
        }

        let entry = self.connect(opts).await?;
        let acquired = AcquiredClient {
            key,
            handle: entry.handle.clone(),
            channels: entry.channels.clone(),
        };
        guard.entry = Some(entry);
        Ok(acquired)
    }

    /// Decrement the refcount for `key`.
    pub(crate) async fn release(&self, key: &str) {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        if let Some(entry) = guard.entry.as_mut() {
            entry.refcount = entry.refcount.saturating_sub(1);
            entry.last_used = Instant::now();
        }
    }

    /// Force-close the client for `key`.
    pub(crate) async fn evict(&self, key: &str) {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        if let Some(entry) = guard.entry.take() {
            self.close_entry(entry).await;
        }
    }

    /// Close clients that have sat unreferenced past the idle timeout.
    pub(crate) async fn sweep_idle(&self) {
        let slots: Vec<(String, Arc<AsyncMutex<KeySlot>>)> = self
            .slots
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (_key, slot) in slots {
            let mut guard = slot.lock().await;
            let idle = guard
                .entry
                .as_ref()
                .is_some_and(|e| e.refcount == 0 && e.last_used.elapsed() >= self.idle_timeout);
            if idle {
                if let Some(entry) = guard.entry.take() {
                    debug!(host = %entry.host, "closing idle SSH client");
                    self.close_entry(entry).await;
                }
            }
        }
    }

    /// Close every client. Idempotent.
    pub(crate) async fn dispose(&self) {
        let slots: Vec<Arc<AsyncMutex<KeySlot>>> =
            self.slots.lock().values().cloned().collect();
        for slot in slots {
            let mut guard = slot.lock().await;
            if let Some(entry) = guard.entry.take() {
                self.close_entry(entry).await;
            }
        }
        self.slots.lock().clear();
    }

    /// Number of live pooled clients.
    pub(crate) async fn live_connections(&self) -> usize {
        let slots: Vec<Arc<AsyncMutex<KeySlot>>> =
            self.slots.lock().values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.entry.is_some() {
                count += 1;
            }
        }
        count
    }

    async fn close_entry(&self, entry: PoolEntry) {
        let handle = entry.handle.lock().await;
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
        drop(handle);
        self.emitter.emit(Event::SshClose {
            host: entry.host,
            port: entry.port,
            user: entry.user,
        });
    }

    async fn connect(&self, opts: &SshOptions) -> Result<PoolEntry> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_millis(opts.keep_alive_ms)),
            keepalive_max: opts.keep_alive_max_fail as usize,
            ..Default::default()
        });

        let ready_timeout = Duration::from_millis(opts.ready_timeout_ms);
        let mut handle = tokio::time::timeout(
            ready_timeout,
            client::connect(config, (opts.host.as_str(), opts.port), ClientHandler),
        )
        .await
        .map_err(|_| {
            Error::Connection(format!(
                "connect to {}:{} timed out after {:?}",
                opts.host, opts.port, ready_timeout
            ))
        })?
        .map_err(Error::from)?;

        authenticate(&mut handle, opts).await?;

        info!(host = %opts.host, port = opts.port, user = %opts.user, "SSH connection established");
        self.emitter.emit(Event::SshConnect {
            host: opts.host.clone(),
            port: opts.port,
            user: opts.user.clone(),
        });

        let channel_cap = opts.multiplex.unwrap_or(1).max(1);
        Ok(PoolEntry {
            handle: Arc::new(AsyncMutex::new(handle)),
            refcount: 1,
            last_used: Instant::now(),
            host: opts.host.clone(),
            port: opts.port,
            user: opts.user.clone(),
            channels: Arc::new(tokio::sync::Semaphore::new(channel_cap)),
        })
    }
}

async fn authenticate(
    handle: &mut client::Handle<ClientHandler>,
    opts: &SshOptions,
) -> Result<()> {
    let authenticated = match &opts.auth {
        SshAuth::Password(password) => handle
            .authenticate_password(&opts.user, password)
            .await
            .map_err(Error::from)?,
        SshAuth::Key { path, passphrase } => {
            let key = russh_keys::load_secret_key(path, passphrase.as_deref())
                .map_err(|e| Error::Auth(format!("cannot load key {}: {}", path.display(), e)))?;
            handle
                .authenticate_publickey(&opts.user, Arc::new(key))
                .await
                .map_err(Error::from)?
        }
        SshAuth::KeyData { data, passphrase } => {
            let key = decode_inline_key(data, passphrase.as_deref())?;
            handle
                .authenticate_publickey(&opts.user, Arc::new(key))
                .await
                .map_err(Error::from)?
        }
        SshAuth::Agent => authenticate_with_agent(handle, &opts.user).await?,
    };

    if !authenticated {
        return Err(Error::Auth(format!(
            "authentication rejected for {}@{}",
            opts.user, opts.host
        )));
    }
    Ok(())
}

/// Parse inline key material: PEM as-is, or base64-wrapped PEM.
fn decode_inline_key(
    data: &str,
    passphrase: Option<&str>,
) -> Result<russh_keys::key::KeyPair> {
    use base64::Engine as _;

    let pem = if data.trim_start().starts_with("-----BEGIN") {
        data.to_string()
    } else {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(data.split_whitespace().collect::<String>())
            .map_err(|e| Error::Auth(format!("inline key is neither PEM nor base64: {}", e)))?;
        String::from_utf8(decoded)
            .map_err(|_| Error::Auth("decoded inline key is not UTF-8".to_string()))?
    };

    russh_keys::decode_secret_key(&pem, passphrase)
        .map_err(|e| Error::Auth(format!("cannot parse inline key: {}", e)))
}

/// Try every identity the local SSH agent offers.
async fn authenticate_with_agent(
    handle: &mut client::Handle<ClientHandler>,
    user: &str,
) -> Result<bool> {
    let mut agent = russh_keys::agent::client::AgentClient::connect_env()
        .await
        .map_err(|e| Error::Auth(format!("cannot reach SSH agent: {}", e)))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| Error::Auth(format!("agent identity listing failed: {}", e)))?;

    for key in identities {
        let (returned_agent, result) = handle.authenticate_future(user, key, agent).await;
        agent = returned_agent;
        if let Ok(true) = result {
            return Ok(true);
        }
    }
    Ok(false)
}

/// One-shot liveness probe with a 1 second budget.
async fn probe(handle: &SharedHandle) -> bool {
    let probe = async {
        let guard = handle.lock().await;
        let mut channel = guard.channel_open_session().await.ok()?;
        drop(guard);
        channel.exec(true, "echo xec-liveness").await.ok()?;
        while let Some(msg) = channel.wait().await {
            if let russh::ChannelMsg::ExitStatus { exit_status } = msg {
                return (exit_status == 0).then_some(());
            }
        }
        None
    };
    matches!(
        tokio::time::timeout(Duration::from_secs(1), probe).await,
        Ok(Some(()))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(host: &str, user: &str, port: u16) -> SshOptions {
        let mut o = SshOptions::new(host, user, SshAuth::Agent);
        o.port = port;
        o
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = fingerprint(&opts("db1", "deploy", 22));
        let b = fingerprint(&opts("db1", "deploy", 22));
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_varies_by_field() {
        let base = fingerprint(&opts("db1", "deploy", 22));
        assert_ne!(base, fingerprint(&opts("db2", "deploy", 22)));
        assert_ne!(base, fingerprint(&opts("db1", "admin", 22)));
        assert_ne!(base, fingerprint(&opts("db1", "deploy", 2222)));

        let mut with_key = opts("db1", "deploy", 22);
        with_key.auth = SshAuth::Key {
            path: "/home/deploy/.ssh/id_ed25519".into(),
            passphrase: None,
        };
        assert_ne!(base, fingerprint(&with_key));
    }

    #[test]
    fn test_fingerprint_does_not_leak_material() {
        let mut o = opts("db1", "deploy", 22);
        o.auth = SshAuth::Password("hunter2".to_string());
        let fp = fingerprint(&o);
        assert!(!fp.contains("hunter2"));
        assert!(!fp.contains("db1"));
        assert_eq!(fp.len(), 64);
    }

    #[test]
    fn test_inline_key_rejects_garbage() {
        let err = decode_inline_key("not base64 and not pem!!", None).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn test_inline_key_base64_roundtrip_detection() {
        use base64::Engine as _;
        // Valid base64 of non-key text decodes, then fails at PEM parsing.
        let wrapped = base64::engine::general_purpose::STANDARD.encode("hello");
        let err = decode_inline_key(&wrapped, None).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn test_empty_pool_dispose_is_idempotent() {
        let pool = SshPool::new(
            Duration::from_secs(60),
            Emitter::detached(
                crate::events::EventBus::new(),
                Arc::new(crate::mask::Masker::new()),
            ),
        );
        assert_eq!(pool.live_connections().await, 0);
        pool.dispose().await;
        pool.dispose().await;
        assert_eq!(pool.live_connections().await, 0);
    }
}
