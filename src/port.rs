//! Port Allocator (spec §4.2): two independent bounded pools, lease/release
//! with a host-loopback bind probe guarding against ports other processes
//! already hold.

use std::collections::HashSet;
use std::net::TcpListener;

use tokio::sync::Mutex;

use crate::error::{AppError, AppResult};

/// An inclusive `[lo, hi]` range of host TCP ports.
#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    lo: u16,
    hi: u16,
}

impl PortRange {
    pub fn new(lo: u16, hi: u16) -> Self {
        Self { lo, hi }
    }
}

/// A single bounded pool (one of the two disjoint pools in spec §3/§4.2).
pub struct PortPool {
    name: &'static str,
    range: PortRange,
    leased: Mutex<HashSet<u16>>,
}

impl PortPool {
    pub fn new(name: &'static str, range: PortRange) -> Self {
        Self {
            name,
            range,
            leased: Mutex::new(HashSet::new()),
        }
    }

    /// Lease an unused, unbound port. Sequential scan from the low end, as
    /// the spec explicitly permits (no fairness guarantee required).
    pub async fn lease(&self) -> AppResult<u16> {
        let mut leased = self.leased.lock().await;
        for port in self.range.lo..=self.range.hi {
            if leased.contains(&port) {
                continue;
            }
            if !probe_free(port) {
                continue;
            }
            leased.insert(port);
            return Ok(port);
        }
        Err(AppError::PoolExhausted(self.name.to_string()))
    }

    /// Release a leased port. No host-level action is taken (a lease is
    /// bookkeeping only, never a held socket).
    pub async fn release(&self, port: u16) {
        self.leased.lock().await.remove(&port);
    }

    pub async fn is_leased(&self, port: u16) -> bool {
        self.leased.lock().await.contains(&port)
    }

    pub async fn leased_count(&self) -> usize {
        self.leased.lock().await.len()
    }
}

/// Checks whether a port is free to bind on the host loopback. Matches the
/// teacher's `is_port_available` probe (`local/process.rs`), which is what
/// the allocator contract in spec §4.2 calls "a short connect/probe".
fn probe_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Both disjoint pools a sandbox session draws from (spec §3: `api_port`,
/// `code_port`).
pub struct PortAllocator {
    pub api: PortPool,
    pub code: PortPool,
}

impl PortAllocator {
    pub fn new(api_range: PortRange, code_range: PortRange) -> Self {
        Self {
            api: PortPool::new("api", api_range),
            code: PortPool::new("code", code_range),
        }
    }

    /// Lease one port from each pool. If the code-pool lease fails after the
    /// api-pool lease succeeded, the api lease is rolled back so a partial
    /// failure never leaks a port.
    pub async fn lease_pair(&self) -> AppResult<(u16, u16)> {
        let api_port = self.api.lease().await?;
        match self.code.lease().await {
            Ok(code_port) => Ok((api_port, code_port)),
            Err(err) => {
                self.api.release(api_port).await;
                Err(err)
            }
        }
    }

    pub async fn release_pair(&self, api_port: u16, code_port: u16) {
        self.api.release(api_port).await;
        self.code.release(code_port).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn leases_are_distinct_and_in_range() {
        let pool = PortPool::new("test", PortRange::new(20100, 20110));
        let a = pool.lease().await.unwrap();
        let b = pool.lease().await.unwrap();
        assert_ne!(a, b);
        assert!((20100..=20110).contains(&a));
        assert!((20100..=20110).contains(&b));
    }

    #[tokio::test]
    async fn release_allows_release() {
        let pool = PortPool::new("test", PortRange::new(20200, 20200));
        let a = pool.lease().await.unwrap();
        assert!(pool.lease().await.is_err(), "single-port pool should now be exhausted");
        pool.release(a).await;
        let b = pool.lease().await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn exhausted_pool_reports_pool_exhausted() {
        let pool = PortPool::new("api", PortRange::new(20300, 20301));
        let _a = pool.lease().await.unwrap();
        let _b = pool.lease().await.unwrap();
        let err = pool.lease().await.unwrap_err();
        assert!(matches!(err, AppError::PoolExhausted(name) if name == "api"));
    }

    #[tokio::test]
    async fn lease_pair_rolls_back_api_lease_on_code_exhaustion() {
        let allocator = PortAllocator::new(PortRange::new(20400, 20401), PortRange::new(20500, 20500));
        let _hold = allocator.code.lease().await.unwrap();
        let result = allocator.lease_pair().await;
        assert!(result.is_err());
        assert_eq!(allocator.api.leased_count().await, 0);
    }
}
