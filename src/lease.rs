//! Garbage-collection leases for a conversion run.
//!
//! A lease pins every object written under it so the store's garbage collector cannot
//! reclaim half-written layers while a conversion is still in flight. [`acquire`] creates
//! the lease and hands back a [`LeaseGuard`]; the guard deletes the lease exactly once,
//! either through [`LeaseGuard::release`] or when it is dropped (unwinding included).

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ConvertError;
use crate::unique::unique_part;

/// Prefix shared by conversion lease names and any correlated snapshot names.
/// External cleanup tooling matches on it, so it must stay stable.
pub const LEASE_NAME_PREFIX: &str = "overlaybd-conv-";

/// Long enough for any single conversion, short enough to bound pinning when release is lost.
pub const DEFAULT_LEASE_TTL: Duration = Duration::hours(1);

/// Builds a lease name from the fixed prefix and a unique part.
pub fn lease_name(unique: &str) -> String {
    format!("{}{}", LEASE_NAME_PREFIX, unique)
}

/// Lease name for a fresh conversion run.
pub fn new_lease_name() -> String {
    lease_name(&unique_part())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(id: &str, ttl: Duration) -> Self {
        let created_at = Utc::now();
        Self {
            id: id.to_string(),
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Store capability for creating and deleting leases.
pub trait LeaseManager: Send + Sync {
    fn create_lease(&self, id: &str, ttl: Duration) -> Result<Lease>;
    fn delete_lease(&self, id: &str) -> Result<()>;
}

/// Context threaded through store writes; objects written with it are pinned to the lease.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseContext {
    lease: Option<String>,
}

impl LeaseContext {
    pub fn with_lease(id: &str) -> Self {
        Self {
            lease: Some(id.to_string()),
        }
    }

    /// Context without a lease; writes made with it are only kept alive by image references.
    pub fn unleased() -> Self {
        Self::default()
    }

    pub fn lease(&self) -> Option<&str> {
        self.lease.as_deref()
    }
}

pub struct LeaseGuard {
    manager: Arc<dyn LeaseManager>,
    lease: Lease,
    context: LeaseContext,
    released: bool,
}

impl LeaseGuard {
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn context(&self) -> &LeaseContext {
        &self.context
    }

    /// Deletes the lease now instead of at drop.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.delete_lease(&self.lease.id)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.manager.delete_lease(&self.lease.id) {
            log::warn!("failed to release lease {}: {:#}", self.lease.id, e);
        }
    }
}

/// Creates the named lease and returns a guard that releases it.
pub fn acquire(
    manager: Arc<dyn LeaseManager>,
    name: &str,
    ttl: Duration,
) -> Result<LeaseGuard, ConvertError> {
    let lease = manager
        .create_lease(name, ttl)
        .map_err(ConvertError::Lease)?;
    log::debug!("acquired lease {} (expires {})", lease.id, lease.expires_at);

    Ok(LeaseGuard {
        context: LeaseContext::with_lease(&lease.id),
        manager,
        lease,
        released: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Counts create/delete calls; optionally refuses to create leases.
    #[derive(Default)]
    pub struct CountingLeases {
        pub acquired: AtomicUsize,
        pub released: AtomicUsize,
        pub names: Mutex<Vec<String>>,
        pub fail_create: bool,
    }

    impl LeaseManager for CountingLeases {
        fn create_lease(&self, id: &str, ttl: Duration) -> Result<Lease> {
            if self.fail_create {
                return Err(anyhow!("store unavailable"));
            }
            self.acquired.fetch_add(1, Ordering::SeqCst);
            self.names.lock().unwrap().push(id.to_string());
            Ok(Lease::new(id, ttl))
        }

        fn delete_lease(&self, _id: &str) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_lease_name_format() {
        assert_eq!(lease_name("123-abcd"), "overlaybd-conv-123-abcd");
        assert!(new_lease_name().starts_with(LEASE_NAME_PREFIX));
        assert_ne!(new_lease_name(), new_lease_name());
    }

    #[test]
    fn test_guard_releases_once_on_drop() {
        let leases = Arc::new(CountingLeases::default());
        {
            let guard = acquire(leases.clone(), "overlaybd-conv-1", DEFAULT_LEASE_TTL).unwrap();
            assert_eq!(guard.context().lease(), Some("overlaybd-conv-1"));
            assert!(guard.lease().expires_at > guard.lease().created_at);
        }
        assert_eq!(leases.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(leases.released.load(Ordering::SeqCst), 1);
        assert_eq!(*leases.names.lock().unwrap(), ["overlaybd-conv-1"]);
    }

    #[test]
    fn test_explicit_release_is_not_repeated_by_drop() {
        let leases = Arc::new(CountingLeases::default());
        let guard = acquire(leases.clone(), "overlaybd-conv-2", DEFAULT_LEASE_TTL).unwrap();
        guard.release().unwrap();
        assert_eq!(leases.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let leases = Arc::new(CountingLeases::default());
        let cloned = leases.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = acquire(cloned, "overlaybd-conv-3", DEFAULT_LEASE_TTL).unwrap();
            panic!("conversion blew up");
        }));
        assert!(result.is_err());
        assert_eq!(leases.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_acquire_failure_is_lease_error() {
        let leases = Arc::new(CountingLeases {
            fail_create: true,
            ..Default::default()
        });
        let err = match acquire(leases.clone(), "overlaybd-conv-4", DEFAULT_LEASE_TTL) {
            Ok(_) => panic!("lease creation should fail"),
            Err(e) => e,
        };
        assert_eq!(err.to_string(), "failed to create lease: store unavailable");
        assert_eq!(leases.released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_lease_expiry() {
        let lease = Lease::new("l", Duration::seconds(10));
        assert!(!lease.is_expired(lease.created_at));
        assert!(lease.is_expired(lease.created_at + Duration::seconds(10)));
    }
}
