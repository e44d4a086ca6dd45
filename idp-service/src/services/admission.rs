//! Per-tenant cap on inflight requests.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use super::error::{ServiceError, ServiceResult};

pub struct TenantAdmission {
    max_inflight: usize,
    slots: DashMap<Uuid, Arc<Semaphore>>,
}

impl TenantAdmission {
    pub fn new(max_inflight: usize) -> Self {
        Self {
            max_inflight,
            slots: DashMap::new(),
        }
    }

    /// Never waits. The permit is held for the rest of the request.
    pub fn try_acquire(&self, tenant_id: Uuid) -> ServiceResult<OwnedSemaphorePermit> {
        let semaphore = self
            .slots
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_inflight)))
            .clone();
        semaphore.try_acquire_owned().map_err(|_| {
            metrics::counter!("hellojohn_admission_rejected_total").increment(1);
            tracing::warn!(%tenant_id, "tenant inflight limit reached");
            ServiceError::Overloaded
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturation_is_per_tenant() {
        let admission = TenantAdmission::new(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let p1 = admission.try_acquire(a).unwrap();
        let _p2 = admission.try_acquire(a).unwrap();
        assert!(matches!(admission.try_acquire(a), Err(ServiceError::Overloaded)));
        assert!(admission.try_acquire(b).is_ok());

        drop(p1);
        assert!(admission.try_acquire(a).is_ok());
    }
}
