//! Pooled remote-shell channels
//!
//! Channels are keyed by `(resource_id, credential_id)` and kept warm between
//! sessions: closing a tab releases the channel, reopening the same target
//! reattaches to the same shell with no new network or vault round trip.
//!
//! # Lifecycle
//!
//! - `acquire`: reuse a live idle entry (probe first; a dead entry is evicted
//!   and replaced transparently), or decrypt + connect on a miss. A key whose
//!   entry is busy gets a fresh unpooled channel - interactive shells cannot
//!   be time-shared, and waiting would stall the second tab.
//! - `release`: mark idle and refresh last-used; the channel stays open.
//! - `invalidate`: force-close and remove, after a fatal channel error.
//! - idle sweep: a periodic task closes entries unused past the idle timeout.
//!   This is the only unsolicited closure.
//!
//! All per-key mutations happen under that key's slot lock, so hand-out,
//! probing, and sweep eviction are mutually exclusive.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::CallerIdentity;
use crate::directory::ResourceRecord;
use crate::ssh::{self, ShellHandle, SshError};
use crate::vault::{DecryptedSecret, SecretResolver, VaultError};

/// PTY dimensions a fresh channel starts with; the session applies the real
/// viewport right after the `connected` frame.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// One reusable channel slot per `(resource, credential)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub resource_id: i64,
    pub credential_id: i64,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connect + authenticate budget for a single open.
    pub connect_timeout: Duration,
    /// Idle entries older than this are swept.
    pub idle_timeout: Duration,
    /// How often the sweeper runs.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("connection timed out")]
    ConnectTimeout,

    #[error("host unreachable: {0}")]
    Unreachable(String),

    /// Terminal for this credential until it changes.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("channel setup failed: {0}")]
    Channel(String),
}

impl PoolError {
    /// Whether the caller may sensibly retry (user-initiated for terminals,
    /// automatic for the metrics channel).
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::ConnectTimeout | PoolError::Unreachable(_))
    }

    fn classify(err: SshError) -> Self {
        match err {
            SshError::ConnectTimeout => PoolError::ConnectTimeout,
            SshError::Unreachable(msg) => PoolError::Unreachable(msg),
            SshError::AuthenticationFailed(msg) | SshError::KeyError(msg) => {
                PoolError::AuthFailed(msg)
            }
            other => PoolError::Channel(other.to_string()),
        }
    }
}

/// Seam between the pool and the SSH stack; tests substitute fakes.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open(
        &self,
        resource: &ResourceRecord,
        secret: DecryptedSecret,
    ) -> Result<ShellHandle, SshError>;
}

/// Production opener: connect, authenticate, request PTY + shell.
pub struct SshOpener {
    connect_timeout: Duration,
}

impl SshOpener {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ChannelOpener for SshOpener {
    async fn open(
        &self,
        resource: &ResourceRecord,
        secret: DecryptedSecret,
    ) -> Result<ShellHandle, SshError> {
        let handle = ssh::connect(resource, &secret, self.connect_timeout).await?;
        // Secret drops here; only the authenticated handle survives.
        ssh::open_shell(handle, DEFAULT_COLS, DEFAULT_ROWS).await
    }
}

/// A channel leased to exactly one session. Return it with
/// [`ChannelPool::release`] or [`ChannelPool::invalidate`].
#[derive(Debug)]
pub struct PooledChannel {
    key: PoolKey,
    handle: ShellHandle,
    pooled: bool,
}

impl PooledChannel {
    pub fn key(&self) -> PoolKey {
        self.key
    }

    pub fn handle(&self) -> &ShellHandle {
        &self.handle
    }
}

struct LiveEntry {
    handle: ShellHandle,
    in_use: bool,
    last_used: Instant,
}

#[derive(Default)]
struct Slot {
    entry: Option<LiveEntry>,
    /// A miss is being filled; concurrent acquires go unpooled instead of
    /// queueing behind the connect.
    opening: bool,
}

/// Result of a credential reachability test (consumed by the credential UI).
#[derive(Debug, Clone, serde::Serialize)]
pub struct TestReport {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

pub struct ChannelPool {
    slots: DashMap<PoolKey, Arc<Mutex<Slot>>>,
    secrets: Arc<dyn SecretResolver>,
    opener: Arc<dyn ChannelOpener>,
    config: PoolConfig,
}

impl ChannelPool {
    /// Create the pool and start its idle sweeper. The sweeper holds a weak
    /// reference and stops when the last `Arc` drops.
    pub fn new(
        secrets: Arc<dyn SecretResolver>,
        opener: Arc<dyn ChannelOpener>,
        config: PoolConfig,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            slots: DashMap::new(),
            secrets,
            opener,
            config,
        });

        let weak = Arc::downgrade(&pool);
        let interval = pool.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick is a no-op
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(pool) => {
                        pool.sweep_once().await;
                    }
                    None => break,
                }
            }
        });

        pool
    }

    /// Hand out a channel for the key, reusing a warm idle entry when one is
    /// alive. A dead idle entry is replaced transparently - the caller sees
    /// success, not an error.
    pub async fn acquire(
        &self,
        resource: &ResourceRecord,
        credential_id: i64,
        caller: &CallerIdentity,
    ) -> Result<PooledChannel, PoolError> {
        let key = PoolKey {
            resource_id: resource.id,
            credential_id,
        };
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        let busy = matches!(&guard.entry, Some(entry) if entry.in_use);
        if busy {
            // Busy key: open a fresh channel rather than wait.
            drop(guard);
            debug!(?key, "key busy, opening unpooled channel");
            let handle = self.open_channel(resource, credential_id, caller).await?;
            return Ok(PooledChannel {
                key,
                handle,
                pooled: false,
            });
        }

        if let Some(entry) = guard.entry.as_mut() {
            if entry.handle.is_open() && entry.handle.probe().await {
                entry.in_use = true;
                entry.last_used = Instant::now();
                info!(?key, channel = entry.handle.id(), "reusing warm channel");
                return Ok(PooledChannel {
                    key,
                    handle: entry.handle.clone(),
                    pooled: true,
                });
            }
        }

        // Reconnect-on-reuse: the idle entry died (revoked credential, remote
        // restart, dropped link). Evict and fall through to a fresh open.
        if let Some(dead) = guard.entry.take() {
            warn!(?key, "idle channel failed liveness probe, evicting");
            dead.handle.close().await;
        }

        if guard.opening {
            drop(guard);
            debug!(?key, "open in flight, opening unpooled channel");
            let handle = self.open_channel(resource, credential_id, caller).await?;
            return Ok(PooledChannel {
                key,
                handle,
                pooled: false,
            });
        }

        guard.opening = true;
        drop(guard);

        let opened = self.open_channel(resource, credential_id, caller).await;

        let mut guard = slot.lock().await;
        guard.opening = false;
        let handle = opened?;
        guard.entry = Some(LiveEntry {
            handle: handle.clone(),
            in_use: true,
            last_used: Instant::now(),
        });
        info!(?key, channel = handle.id(), "channel opened and pooled");
        Ok(PooledChannel {
            key,
            handle,
            pooled: true,
        })
    }

    /// Mark the channel idle and keep it warm. Unpooled channels are closed;
    /// there is only one warm slot per key.
    pub async fn release(&self, channel: PooledChannel) {
        if !channel.pooled {
            channel.handle.close().await;
            return;
        }
        if let Some(slot) = self.slots.get(&channel.key).map(|e| e.value().clone()) {
            let mut guard = slot.lock().await;
            if let Some(entry) = guard.entry.as_mut() {
                if entry.handle.id() == channel.handle.id() {
                    entry.in_use = false;
                    entry.last_used = Instant::now();
                    debug!(key = ?channel.key, "channel released, kept warm");
                    return;
                }
            }
        }
        // Slot was removed or replaced while the lease was out.
        channel.handle.close().await;
    }

    /// Force-close and remove, after the owning session observed a fatal
    /// channel error.
    pub async fn invalidate(&self, channel: PooledChannel) {
        channel.handle.close().await;
        if !channel.pooled {
            return;
        }
        if let Some(slot) = self.slots.get(&channel.key).map(|e| e.value().clone()) {
            let mut guard = slot.lock().await;
            let owned_here = matches!(&guard.entry, Some(entry) if entry.handle.id() == channel.handle.id());
            if owned_here {
                guard.entry = None;
                info!(key = ?channel.key, "channel invalidated");
            }
        }
    }

    /// One sweeper pass: close idle entries past the timeout, drop empty
    /// slots. Returns how many entries were evicted.
    pub async fn sweep_once(&self) -> usize {
        let keys: Vec<PoolKey> = self.slots.iter().map(|e| *e.key()).collect();
        let mut evicted = 0;

        for key in keys {
            let Some(slot) = self.slots.get(&key).map(|e| e.value().clone()) else {
                continue;
            };
            let mut guard = slot.lock().await;
            let expired = matches!(
                &guard.entry,
                Some(entry) if !entry.in_use && entry.last_used.elapsed() >= self.config.idle_timeout
            );
            if expired {
                if let Some(entry) = guard.entry.take() {
                    info!(?key, channel = entry.handle.id(), "idle timeout, closing channel");
                    entry.handle.close().await;
                    evicted += 1;
                }
            }
            let empty = guard.entry.is_none() && !guard.opening;
            drop(guard);
            if empty {
                self.slots.remove_if(&key, |_, slot| {
                    slot.try_lock()
                        .map(|g| g.entry.is_none() && !g.opening)
                        .unwrap_or(false)
                });
            }
        }

        evicted
    }

    /// Prove reachability of a credential by opening a transient channel,
    /// capturing whatever banner the shell prints, and releasing it.
    pub async fn check(
        &self,
        resource: &ResourceRecord,
        credential_id: i64,
        caller: &CallerIdentity,
    ) -> TestReport {
        match self.acquire(resource, credential_id, caller).await {
            Ok(channel) => {
                let mut output = channel.handle().subscribe_output();
                let banner = tokio::time::timeout(Duration::from_millis(800), output.recv())
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
                self.release(channel).await;
                TestReport {
                    success: true,
                    message: format!("shell channel opened on {}", resource.addr()),
                    output: banner,
                }
            }
            Err(e) => TestReport {
                success: false,
                message: e.to_string(),
                output: None,
            },
        }
    }

    /// Number of live pooled entries (idle or in use).
    pub async fn entry_count(&self) -> usize {
        let mut count = 0;
        let slots: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        for slot in slots {
            if slot.lock().await.entry.is_some() {
                count += 1;
            }
        }
        count
    }

    fn slot(&self, key: PoolKey) -> Arc<Mutex<Slot>> {
        self.slots
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
            .value()
            .clone()
    }

    async fn open_channel(
        &self,
        resource: &ResourceRecord,
        credential_id: i64,
        caller: &CallerIdentity,
    ) -> Result<ShellHandle, PoolError> {
        // The vault is consulted only here - never for a warm reuse.
        let secret = self.secrets.resolve_secret(credential_id, caller).await?;
        self.opener
            .open(resource, secret)
            .await
            .map_err(PoolError::classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{NetworkType, ResourceType};
    use crate::ssh::ShellCommand;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{broadcast, mpsc};

    fn resource() -> ResourceRecord {
        ResourceRecord {
            id: 10,
            resource_type: ResourceType::Server,
            name: "web-1".to_string(),
            host: "10.0.0.1".to_string(),
            port: 22,
            network_type: NetworkType::Direct,
        }
    }

    fn caller() -> CallerIdentity {
        CallerIdentity {
            user_id: 1,
            username: "operator".to_string(),
        }
    }

    /// Counts resolutions; the pool must hit it exactly once per real open.
    struct CountingSecrets {
        calls: AtomicUsize,
        deny: bool,
    }

    impl CountingSecrets {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                deny: false,
            })
        }

        fn denying() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                deny: true,
            })
        }
    }

    #[async_trait]
    impl SecretResolver for CountingSecrets {
        async fn resolve_secret(
            &self,
            _credential_id: i64,
            _caller: &CallerIdentity,
        ) -> Result<DecryptedSecret, VaultError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.deny {
                return Err(VaultError::Forbidden);
            }
            Ok(DecryptedSecret::password("root", "pw"))
        }
    }

    /// Spawns echo shells; optionally fails every open with a fixed error.
    struct FakeOpener {
        opens: AtomicUsize,
        fail_with: Option<fn() -> SshError>,
    }

    impl FakeOpener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                fail_with: None,
            })
        }

        fn failing(err: fn() -> SshError) -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                fail_with: Some(err),
            })
        }
    }

    #[async_trait]
    impl ChannelOpener for FakeOpener {
        async fn open(
            &self,
            _resource: &ResourceRecord,
            _secret: DecryptedSecret,
        ) -> Result<ShellHandle, SshError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(make_err) = self.fail_with {
                return Err(make_err());
            }
            let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(64);
            let (output_tx, _) = broadcast::channel::<Bytes>(64);
            let output = output_tx.clone();
            tokio::spawn(async move {
                while let Some(cmd) = cmd_rx.recv().await {
                    match cmd {
                        ShellCommand::Data(data) => {
                            let _ = output.send(Bytes::from(data));
                        }
                        ShellCommand::Probe { reply_tx } => {
                            let _ = reply_tx.send(true);
                        }
                        ShellCommand::Resize { .. } => {}
                        ShellCommand::Close => break,
                    }
                }
            });
            Ok(ShellHandle::from_parts(
                format!("chan-{n}"),
                cmd_tx,
                output_tx,
            ))
        }
    }

    fn pool_with(
        secrets: Arc<CountingSecrets>,
        opener: Arc<FakeOpener>,
        config: PoolConfig,
    ) -> Arc<ChannelPool> {
        ChannelPool::new(secrets, opener, config)
    }

    #[tokio::test]
    async fn warm_reuse_returns_same_channel_without_vault_call() {
        let secrets = CountingSecrets::new();
        let opener = FakeOpener::new();
        let pool = pool_with(secrets.clone(), opener.clone(), PoolConfig::default());

        let first = pool.acquire(&resource(), 5, &caller()).await.unwrap();
        let first_id = first.handle().id().to_string();
        pool.release(first).await;

        let second = pool.acquire(&resource(), 5, &caller()).await.unwrap();
        assert_eq!(second.handle().id(), first_id);
        assert_eq!(secrets.calls.load(Ordering::SeqCst), 1);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn busy_key_gets_a_fresh_channel() {
        let secrets = CountingSecrets::new();
        let opener = FakeOpener::new();
        let pool = pool_with(secrets, opener.clone(), PoolConfig::default());

        let first = pool.acquire(&resource(), 5, &caller()).await.unwrap();
        let second = pool.acquire(&resource(), 5, &caller()).await.unwrap();

        assert_ne!(first.handle().id(), second.handle().id());
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);

        // Releasing the overflow channel closes it; the pooled one stays warm.
        let overflow = second.handle().clone();
        pool.release(second).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!overflow.is_open());

        let first_id = first.handle().id().to_string();
        pool.release(first).await;
        let third = pool.acquire(&resource(), 5, &caller()).await.unwrap();
        assert_eq!(third.handle().id(), first_id);
    }

    #[tokio::test]
    async fn dead_idle_entry_is_replaced_transparently() {
        let secrets = CountingSecrets::new();
        let opener = FakeOpener::new();
        let pool = pool_with(secrets.clone(), opener.clone(), PoolConfig::default());

        let first = pool.acquire(&resource(), 5, &caller()).await.unwrap();
        let stale = first.handle().clone();
        pool.release(first).await;

        // Simulate revocation/remote death while the entry sits idle.
        stale.close().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = pool.acquire(&resource(), 5, &caller()).await.unwrap();
        assert_ne!(second.handle().id(), stale.id());
        assert!(second.handle().is_open());
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
        assert_eq!(secrets.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_removes_the_entry() {
        let pool = pool_with(
            CountingSecrets::new(),
            FakeOpener::new(),
            PoolConfig::default(),
        );

        let channel = pool.acquire(&resource(), 5, &caller()).await.unwrap();
        let handle = channel.handle().clone();
        pool.invalidate(channel).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!handle.is_open());
        assert_eq!(pool.entry_count().await, 0);
    }

    #[tokio::test]
    async fn sweep_evicts_only_expired_idle_entries() {
        let config = PoolConfig {
            idle_timeout: Duration::from_millis(40),
            ..PoolConfig::default()
        };
        let pool = pool_with(CountingSecrets::new(), FakeOpener::new(), config);

        let idle = pool.acquire(&resource(), 5, &caller()).await.unwrap();
        pool.release(idle).await;

        let busy_resource = ResourceRecord {
            id: 11,
            ..resource()
        };
        let _busy = pool.acquire(&busy_resource, 5, &caller()).await.unwrap();

        assert_eq!(pool.sweep_once().await, 0);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(pool.sweep_once().await, 1);
        assert_eq!(pool.entry_count().await, 1);
    }

    #[tokio::test]
    async fn failures_are_classified() {
        let unreachable = pool_with(
            CountingSecrets::new(),
            FakeOpener::failing(|| SshError::Unreachable("no route".to_string())),
            PoolConfig::default(),
        );
        let err = unreachable
            .acquire(&resource(), 5, &caller())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Unreachable(_)));
        assert!(err.is_retryable());

        let denied = pool_with(
            CountingSecrets::new(),
            FakeOpener::failing(|| SshError::AuthenticationFailed("rejected".to_string())),
            PoolConfig::default(),
        );
        let err = denied
            .acquire(&resource(), 5, &caller())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::AuthFailed(_)));
        assert!(!err.is_retryable());
        // A failed open leaves no entry behind.
        assert_eq!(denied.entry_count().await, 0);

        let forbidden = pool_with(
            CountingSecrets::denying(),
            FakeOpener::new(),
            PoolConfig::default(),
        );
        let err = forbidden
            .acquire(&resource(), 5, &caller())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Vault(VaultError::Forbidden)));
    }

    #[tokio::test]
    async fn check_reports_success_and_failure() {
        let pool = pool_with(
            CountingSecrets::new(),
            FakeOpener::new(),
            PoolConfig::default(),
        );
        let report = pool.check(&resource(), 5, &caller()).await;
        assert!(report.success);

        let failing = pool_with(
            CountingSecrets::new(),
            FakeOpener::failing(|| SshError::ConnectTimeout),
            PoolConfig::default(),
        );
        let report = failing.check(&resource(), 5, &caller()).await;
        assert!(!report.success);
        assert!(report.message.contains("timed out"));
    }
}
