//! Keel store: the application registry.
//!
//! Writers go through a per-application slot lock, so updates to one application are
//! serialized while different applications update in parallel. Every write republishes an
//! immutable snapshot (lock-free for readers) and bumps an epoch that subscribers can await.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use arc_swap::ArcSwap;
use keel_core::{now_ts, Application, KeelError, SyncCode, SyncStatus};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("application {0} not found")]
    NotFound(String),
    #[error("application {0} already registered")]
    AlreadyExists(String),
    #[error("application {0} already has an operation in progress")]
    OperationInProgress(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Last config-time or pass-level failure, kept alongside the last good status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusError {
    pub kind: String,
    pub message: String,
    pub at: i64,
}

impl From<&KeelError> for StatusError {
    fn from(e: &KeelError) -> Self { Self { kind: e.name().to_string(), message: e.to_string(), at: now_ts() } }
}

/// Marker of a running sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationState {
    pub id: String,
    pub started_at: i64,
    pub manual: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    pub sync: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StatusError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationState>,
}

impl AppStatus {
    /// `Syncing` while an operation runs, the sync code otherwise.
    pub fn phase(&self) -> &'static str {
        if self.operation.is_some() { "Syncing" } else { self.sync.code().as_str() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub app: Application,
    pub status: AppStatus,
}

impl ApplicationRecord {
    pub fn name(&self) -> &str { &self.app.name }
    pub fn code(&self) -> SyncCode { self.status.sync.code() }
}

/// Immutable view of every application, sorted by name.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub epoch: u64,
    pub apps: BTreeMap<String, Arc<ApplicationRecord>>,
}

type Slot = Arc<Mutex<ApplicationRecord>>;

pub struct Registry {
    slots: RwLock<FxHashMap<String, Slot>>,
    snap: ArcSwap<RegistrySnapshot>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for Registry {
    fn default() -> Self { Self::new() }
}

fn lock_slot(slot: &Slot) -> MutexGuard<'_, ApplicationRecord> {
    slot.lock().unwrap_or_else(|p| p.into_inner())
}

impl Registry {
    pub fn new() -> Self {
        let (epoch_tx, _rx) = watch::channel(0u64);
        Self { slots: RwLock::new(FxHashMap::default()), snap: ArcSwap::from_pointee(RegistrySnapshot::default()), epoch_tx }
    }

    fn slot(&self, name: &str) -> Result<Slot> {
        let slots = self.slots.read().unwrap_or_else(|p| p.into_inner());
        slots.get(name).cloned().ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Republish one application (or its removal) into the snapshot.
    fn publish(&self, name: &str, record: Option<ApplicationRecord>) {
        let record = record.map(Arc::new);
        let prev = self.snap.rcu(|cur| {
            let mut apps = cur.apps.clone();
            match &record {
                Some(r) => { apps.insert(name.to_string(), Arc::clone(r)); }
                None => { apps.remove(name); }
            }
            RegistrySnapshot { epoch: cur.epoch + 1, apps }
        });
        let epoch = prev.epoch + 1;
        self.epoch_tx.send_modify(|e| *e = (*e).max(epoch));
        counter!("registry_updates_total", 1u64);
    }

    /// Run `f` on one application's record under its slot lock and publish the result.
    fn update<T>(&self, name: &str, f: impl FnOnce(&mut ApplicationRecord) -> Result<T>) -> Result<T> {
        let slot = self.slot(name)?;
        let mut rec = lock_slot(&slot);
        // deregistered while we waited for the slot
        if !self.slot(name).map(|s| Arc::ptr_eq(&s, &slot)).unwrap_or(false) {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        let out = f(&mut rec)?;
        self.publish(name, Some(rec.clone()));
        Ok(out)
    }

    pub fn register(&self, app: Application) -> Result<()> {
        let name = app.name.clone();
        let record = ApplicationRecord { app, status: AppStatus::default() };
        {
            let mut slots = self.slots.write().unwrap_or_else(|p| p.into_inner());
            if slots.contains_key(&name) { return Err(RegistryError::AlreadyExists(name)); }
            slots.insert(name.clone(), Arc::new(Mutex::new(record.clone())));
            self.publish(&name, Some(record));
        }
        info!(app = %name, "registry: registered");
        Ok(())
    }

    /// Replace an application's definition, keeping its status. Registers it when unknown.
    pub fn upsert(&self, app: Application) -> Result<()> {
        let name = app.name.clone();
        match self.update(&name, |rec| {
            rec.app = app.clone();
            Ok(())
        }) {
            Err(RegistryError::NotFound(_)) => self.register(app),
            other => other,
        }
    }

    pub fn deregister(&self, name: &str) -> Result<ApplicationRecord> {
        let slot = {
            let mut slots = self.slots.write().unwrap_or_else(|p| p.into_inner());
            slots.remove(name).ok_or_else(|| RegistryError::NotFound(name.to_string()))?
        };
        let rec = lock_slot(&slot);
        self.publish(name, None);
        let rec = rec.clone();
        info!(app = %name, "registry: deregistered");
        Ok(rec)
    }

    pub fn get(&self, name: &str) -> Result<ApplicationRecord> {
        self.snap.load().apps.get(name).map(|r| (**r).clone()).ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<ApplicationRecord> { self.snap.load().apps.values().map(|r| (**r).clone()).collect() }

    pub fn names(&self) -> Vec<String> { self.snap.load().apps.keys().cloned().collect() }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> { self.snap.load_full() }

    /// Epoch bumps on every write.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    /// Replace the sync status. A derived status supersedes any recorded error.
    pub fn update_status(&self, name: &str, status: SyncStatus) -> Result<()> {
        let code = status.code();
        self.update(name, |rec| {
            rec.status.sync = status;
            rec.status.last_error = None;
            Ok(())
        })?;
        debug!(app = %name, code = %code, "registry: status updated");
        Ok(())
    }

    /// Record a failure without touching the last derived status.
    pub fn record_error(&self, name: &str, err: &KeelError) -> Result<()> {
        self.update(name, |rec| {
            rec.status.last_error = Some(StatusError::from(err));
            Ok(())
        })
    }

    /// Mark an operation as running. Fails when one already is.
    pub fn begin_operation(&self, name: &str, manual: bool, dry_run: bool) -> Result<OperationState> {
        self.update(name, |rec| {
            if rec.status.operation.is_some() { return Err(RegistryError::OperationInProgress(name.to_string())); }
            let op = OperationState { id: uuid::Uuid::new_v4().to_string(), started_at: now_ts(), manual, dry_run };
            rec.status.operation = Some(op.clone());
            Ok(op)
        })
    }

    /// Clear the operation marker if it still belongs to `op_id`.
    pub fn end_operation(&self, name: &str, op_id: &str) -> Result<()> {
        self.update(name, |rec| {
            if rec.status.operation.as_ref().map(|o| o.id.as_str()) == Some(op_id) { rec.status.operation = None; }
            Ok(())
        })
    }
}
