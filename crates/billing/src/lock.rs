//! Per-subscription renewal locks
//!
//! A lock is a lease: it expires on its own after `ttl`, so a crashed worker
//! can never block a subscription forever. Holders that need longer must
//! [`LockManager::renew`] before the lease runs out. For any subscription at
//! most one valid token exists at a time.
//!
//! Two backends are provided:
//! - [`InMemoryLockManager`] for single-process deployments and tests
//! - [`RedisLockManager`] for multiple worker processes

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::BillingResult;

/// Proof of lease ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of an acquire call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Acquired(LockToken),
    /// Someone else holds a valid lease
    Busy,
}

/// Result of a renew call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseRenewal {
    Renewed,
    /// The lease ran out (or was taken over); the holder must stop acting
    Expired,
}

/// Mutual exclusion over subscriptions with expiring leases
#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(&self, subscription_id: Uuid, ttl: Duration) -> BillingResult<Acquire>;

    /// Release a lease. Returns false if the token no longer owned it.
    async fn release(&self, subscription_id: Uuid, token: LockToken) -> BillingResult<bool>;

    async fn renew(
        &self,
        subscription_id: Uuid,
        token: LockToken,
        ttl: Duration,
    ) -> BillingResult<LeaseRenewal>;
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: LockToken,
    expires_at: Instant,
}

/// Process-local lock manager
#[derive(Default)]
pub struct InMemoryLockManager {
    leases: Mutex<HashMap<Uuid, Lease>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(&self, subscription_id: Uuid, ttl: Duration) -> BillingResult<Acquire> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;

        if let Some(lease) = leases.get(&subscription_id) {
            if lease.expires_at > now {
                return Ok(Acquire::Busy);
            }
            tracing::debug!(
                subscription_id = %subscription_id,
                "Taking over abandoned renewal lease"
            );
        }

        let token = LockToken::generate();
        leases.insert(
            subscription_id,
            Lease {
                token,
                expires_at: now + ttl,
            },
        );
        Ok(Acquire::Acquired(token))
    }

    async fn release(&self, subscription_id: Uuid, token: LockToken) -> BillingResult<bool> {
        let mut leases = self.leases.lock().await;
        match leases.get(&subscription_id) {
            Some(lease) if lease.token == token => {
                leases.remove(&subscription_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn renew(
        &self,
        subscription_id: Uuid,
        token: LockToken,
        ttl: Duration,
    ) -> BillingResult<LeaseRenewal> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&subscription_id) {
            Some(lease) if lease.token == token && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(LeaseRenewal::Renewed)
            }
            _ => Ok(LeaseRenewal::Expired),
        }
    }
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis-backed lock manager shared by every worker process
///
/// Uses `SET key token NX PX ttl` to acquire. Release and renew compare the
/// stored token inside a Lua script so a stale holder can never touch a
/// lease that has been reacquired by someone else.
#[derive(Clone)]
pub struct RedisLockManager {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisLockManager {
    pub async fn connect(url: &str) -> BillingResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Redis lock manager connected");
        Ok(Self {
            conn,
            key_prefix: "renewal:lock".to_string(),
        })
    }

    fn key(&self, subscription_id: Uuid) -> String {
        format!("{}:{}", self.key_prefix, subscription_id)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(&self, subscription_id: Uuid, ttl: Duration) -> BillingResult<Acquire> {
        let token = LockToken::generate();
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(subscription_id))
            .arg(token.to_string())
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        Ok(match reply {
            Some(_) => Acquire::Acquired(token),
            None => Acquire::Busy,
        })
    }

    async fn release(&self, subscription_id: Uuid, token: LockToken) -> BillingResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.key(subscription_id))
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn renew(
        &self,
        subscription_id: Uuid,
        token: LockToken,
        ttl: Duration,
    ) -> BillingResult<LeaseRenewal> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(self.key(subscription_id))
            .arg(token.to_string())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(if updated == 1 {
            LeaseRenewal::Renewed
        } else {
            LeaseRenewal::Expired
        })
    }
}
