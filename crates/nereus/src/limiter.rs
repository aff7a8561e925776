//! Per-tenant concurrent execution limit.
//!
//! Rollup executions, diffs and index builds all draw from the same pool. A
//! permit is released when dropped, including on early return or panic
//! unwinding inside the work it guards.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::{Error, LimitType, Result};
use crate::types::TenantId;

/// Counts running executions per tenant and refuses work past the ceiling.
#[derive(Debug, Clone)]
pub struct ExecutionLimiter {
    running: Arc<DashMap<TenantId, usize>>,
    maximum: usize,
}

impl ExecutionLimiter {
    /// Create a limiter allowing `maximum` concurrent executions per tenant.
    #[must_use]
    pub fn new(maximum: usize) -> Self {
        Self {
            running: Arc::new(DashMap::new()),
            maximum,
        }
    }

    /// Take a permit, failing fast when the tenant is at its ceiling.
    pub fn acquire(&self, tenant_id: &TenantId) -> Result<ExecutionPermit> {
        let mut running = self.running.entry(tenant_id.clone()).or_insert(0);
        if *running >= self.maximum {
            return Err(Error::LimitExceeded {
                limit_type: LimitType::ConcurrentExecutions,
                current: *running + 1,
                maximum: self.maximum,
            });
        }
        *running += 1;
        debug!(tenant_id = %tenant_id, running = *running, "Execution permit acquired");
        Ok(ExecutionPermit {
            running: Arc::clone(&self.running),
            tenant_id: tenant_id.clone(),
        })
    }

    /// Executions currently running for a tenant.
    #[must_use]
    pub fn running(&self, tenant_id: &TenantId) -> usize {
        self.running.get(tenant_id).map_or(0, |count| *count)
    }

    /// Configured ceiling.
    #[must_use]
    pub fn maximum(&self) -> usize {
        self.maximum
    }
}

/// Proof of a reserved execution slot.
#[derive(Debug)]
pub struct ExecutionPermit {
    running: Arc<DashMap<TenantId, usize>>,
    tenant_id: TenantId,
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        let now_idle = match self.running.get_mut(&self.tenant_id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if now_idle {
            self.running.remove_if(&self.tenant_id, |_, count| *count == 0);
        }
    }
}
