//! Registry of running jobs' cancel handles.
//!
//! The execution path registers a handle right after spawning and removes it
//! once the job's terminal status is recorded; the cancellation path looks
//! handles up by `(tenant, job)`. It is the only structure both paths share.
//!
//! A cancel takes the handle out of the cancellable set, but the key stays
//! live until the cancelled run itself unregisters. A redelivery of the job
//! during the SIGTERM grace period is therefore still seen as a duplicate.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dispatch_core::{JobId, KEY_DELIMITER, TenantId};

use crate::process::CancelHandle;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("job {job_id} of tenant {tenant_id} is already registered")]
    AlreadyRegistered { tenant_id: TenantId, job_id: JobId },
}

/// Result of a cancel request routed through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Termination was initiated by this request.
    Cancelled,
    /// The process had already exited or was already being cancelled.
    AlreadyStopping,
    /// No running job under that key.
    NotFound,
}

#[derive(Debug)]
struct Entry {
    tenant_id: TenantId,
    job_id: JobId,
    handle: CancelHandle,
}

#[derive(Debug, Default)]
struct Table {
    /// Handles a cancel can still reach.
    cancellable: HashMap<String, Entry>,
    /// Every registered run until it unregisters, cancelled or not.
    live: HashMap<String, CancelHandle>,
}

impl Table {
    fn take_cancellable(&mut self, keep: impl Fn(&Entry) -> bool) -> Vec<CancelHandle> {
        let keys: Vec<String> = self
            .cancellable
            .iter()
            .filter(|(_, e)| !keep(e))
            .map(|(k, _)| k.clone())
            .collect();
        keys.iter()
            .filter_map(|k| self.cancellable.remove(k))
            .map(|e| e.handle)
            .collect()
    }
}

/// Running jobs keyed by `tenant \u{1f} job`.
#[derive(Debug, Default)]
pub struct JobRegistry {
    table: Mutex<Table>,
}

fn key(tenant_id: &TenantId, job_id: JobId) -> String {
    format!("{}{}{}", tenant_id, KEY_DELIMITER, job_id)
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the handle of a freshly spawned job. Rejected while an
    /// earlier run of the same key is live, even one being cancelled.
    pub fn register(
        &self,
        tenant_id: &TenantId,
        job_id: JobId,
        handle: CancelHandle,
    ) -> Result<(), RegistryError> {
        let mut table = self.lock();
        let key = key(tenant_id, job_id);
        if table.live.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered {
                tenant_id: tenant_id.clone(),
                job_id,
            });
        }
        table.live.insert(key.clone(), handle.clone());
        table.cancellable.insert(
            key,
            Entry {
                tenant_id: tenant_id.clone(),
                job_id,
                handle,
            },
        );
        Ok(())
    }

    /// Handle of a job that can still be cancelled.
    pub fn lookup(&self, tenant_id: &TenantId, job_id: JobId) -> Option<CancelHandle> {
        self.lock()
            .cancellable
            .get(&key(tenant_id, job_id))
            .map(|e| e.handle.clone())
    }

    /// Whether a run of the job is registered and has not unregistered yet,
    /// including one that is being cancelled.
    pub fn contains(&self, tenant_id: &TenantId, job_id: JobId) -> bool {
        self.lock().live.contains_key(&key(tenant_id, job_id))
    }

    /// Remove the run owning `handle`. A key since taken over by another
    /// run is left alone. Returns whether anything was removed.
    pub fn unregister(&self, tenant_id: &TenantId, job_id: JobId, handle: &CancelHandle) -> bool {
        let mut table = self.lock();
        let key = key(tenant_id, job_id);
        if !table.live.get(&key).is_some_and(|h| h.same_process(handle)) {
            return false;
        }
        table.live.remove(&key);
        if table
            .cancellable
            .get(&key)
            .is_some_and(|e| e.handle.same_process(handle))
        {
            table.cancellable.remove(&key);
        }
        true
    }

    /// Cancel a running job. A hit makes the job unreachable for further
    /// cancels; the signal is sent outside the lock.
    pub fn cancel(&self, tenant_id: &TenantId, job_id: JobId) -> CancelOutcome {
        let key = key(tenant_id, job_id);
        let entry = {
            let mut table = self.lock();
            match table.cancellable.remove(&key) {
                Some(entry) => entry,
                None if table.live.contains_key(&key) => return CancelOutcome::AlreadyStopping,
                None => return CancelOutcome::NotFound,
            }
        };
        if entry.handle.cancel() {
            CancelOutcome::Cancelled
        } else {
            CancelOutcome::AlreadyStopping
        }
    }

    /// Cancel every running job of a tenant, returning how many were
    /// cancelled by this call.
    pub fn cancel_tenant(&self, tenant_id: &TenantId) -> usize {
        let handles = self.lock().take_cancellable(|e| &e.tenant_id != tenant_id);
        handles.iter().filter(|h| h.cancel()).count()
    }

    /// Cancel every running job on the node.
    pub fn cancel_all(&self) -> usize {
        let handles = self.lock().take_cancellable(|_| false);
        handles.iter().filter(|h| h.cancel()).count()
    }

    /// Cancellable jobs of a tenant, oldest first.
    pub fn jobs_for_tenant(&self, tenant_id: &TenantId) -> Vec<JobId> {
        let mut jobs: Vec<JobId> = self
            .lock()
            .cancellable
            .values()
            .filter(|e| &e.tenant_id == tenant_id)
            .map(|e| e.job_id)
            .collect();
        jobs.sort();
        jobs
    }

    /// Number of cancellable jobs.
    pub fn len(&self) -> usize {
        self.lock().cancellable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().cancellable.is_empty()
    }

    /// Forget every entry without signalling anything.
    pub fn clear(&self) {
        let mut table = self.lock();
        if !table.live.is_empty() {
            tracing::info!("Clearing {} registered jobs", table.live.len());
        }
        table.cancellable.clear();
        table.live.clear();
    }
}
