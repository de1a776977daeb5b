//! Device and Session Model
//!
//! One [`Device`] is one logical unit. Its persistent reservation state
//! lives behind a reader/writer lock: admissibility checks and PERSISTENT
//! RESERVE IN take the read side, every PERSISTENT RESERVE OUT action and
//! persistence take the write side for the whole service action.
//!
//! An [`ItNexus`] is the engine's view of one live I_T nexus on the LU.
//! The front end creates one per session login and attaches it to the
//! device; registrants hold weak bindings to these so a registration can
//! outlive the session that made it.

pub mod hooks;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use thiserror::Error;

use crate::pr::file::PrFileError;
use crate::pr::{PrState, RegId, transport_id};
use hooks::{ClusterError, ClusterOps, DlmClusterOps, ExternalHooks, NoOpClusterOps};

/// Static device characteristics consulted by the reservations engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceOptions {
    /// Use descriptor-format sense in queued unit attentions
    pub d_sense: bool,
    /// TAS: aborted commands report TASK ABORTED status themselves, so no
    /// COMMANDS CLEARED unit attention is queued on their nexuses
    pub tas: bool,
}

#[derive(Debug, Error)]
pub enum NexusError {
    #[error("malformed initiator port transport id")]
    MalformedTransportId,
}

/// One live I_T nexus attachment on a logical unit.
pub struct ItNexus {
    transport_id: Box<[u8]>,
    rel_tgt_id: u16,
    lun: u64,
    registrant: spin::Mutex<Option<RegId>>,
}

impl ItNexus {
    /// Build a nexus handle from the initiator port's TransportID, the
    /// relative id of the target port it logged in through, and the LU
    /// number. The TransportID is copied at its encoded size and secured.
    pub fn new(transport_id: &[u8], rel_tgt_id: u16, lun: u64) -> Result<Arc<Self>, NexusError> {
        let size = transport_id::parse_size(transport_id).ok_or(NexusError::MalformedTransportId)?;
        if size > transport_id.len() {
            return Err(NexusError::MalformedTransportId);
        }
        let mut owned: Box<[u8]> = transport_id[..size].into();
        if !transport_id::secure(&mut owned) {
            return Err(NexusError::MalformedTransportId);
        }
        Ok(Arc::new(ItNexus {
            transport_id: owned,
            rel_tgt_id,
            lun,
            registrant: spin::Mutex::new(None),
        }))
    }

    pub fn transport_id(&self) -> &[u8] {
        &self.transport_id
    }

    pub fn rel_tgt_id(&self) -> u16 {
        self.rel_tgt_id
    }

    pub fn lun(&self) -> u64 {
        self.lun
    }

    /// Whether this nexus currently has a registration
    pub fn is_registered(&self) -> bool {
        self.registrant.lock().is_some()
    }

    pub(crate) fn registrant_id(&self) -> Option<RegId> {
        *self.registrant.lock()
    }

    pub(crate) fn set_registrant(&self, id: Option<RegId>) {
        *self.registrant.lock() = id;
    }

    pub(crate) fn take_registrant(&self) -> Option<RegId> {
        self.registrant.lock().take()
    }
}

/// Synchronizes a PREEMPT AND ABORT with the aborts it fans out.
///
/// The counter starts with one pending and one aborting reference held by
/// the command itself. The task-management layer adds a reference per
/// accepted abort and drops it when that abort has drained; the service
/// action drops its own aborting reference on return and waits for the
/// rest. The dispatcher's completion for the command must be routed
/// through [`PrAbortCounter::command_done`].
pub struct PrAbortCounter {
    pending_abort_cnt: AtomicU32,
    aborting_cnt: AtomicU32,
    aborts_drained: Mutex<bool>,
    cv: Condvar,
}

impl PrAbortCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(PrAbortCounter {
            pending_abort_cnt: AtomicU32::new(1),
            aborting_cnt: AtomicU32::new(1),
            aborts_drained: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    /// The task-management layer accepted one abort on behalf of the
    /// preempting command.
    pub fn abort_scheduled(&self) {
        self.pending_abort_cnt.fetch_add(1, Ordering::SeqCst);
        self.aborting_cnt.fetch_add(1, Ordering::SeqCst);
    }

    /// One scheduled abort has fully drained. Returns true when the
    /// command's saved completion may now run.
    pub fn abort_done(&self) -> bool {
        if self.aborting_cnt.fetch_sub(1, Ordering::SeqCst) == 1 {
            let mut drained = lock_clean(&self.aborts_drained);
            *drained = true;
            self.cv.notify_all();
        }
        self.command_done()
    }

    /// Decrement from the command's own completion path. Returns true
    /// when the saved completion may now run.
    pub fn command_done(&self) -> bool {
        self.pending_abort_cnt.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Drop the service action's own aborting reference and block until
    /// every scheduled abort has drained.
    pub(crate) fn finish_and_wait(&self) {
        if self.aborting_cnt.fetch_sub(1, Ordering::SeqCst) == 1 {
            return;
        }
        let mut drained = lock_clean(&self.aborts_drained);
        while !*drained {
            drained = match self.cv.wait(drained) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

fn lock_clean<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One logical unit and its persistent reservation state.
pub struct Device {
    pub(crate) name: String,
    pub(crate) opts: DeviceOptions,
    pub(crate) hooks: Arc<dyn ExternalHooks>,
    cluster: RwLock<Arc<dyn ClusterOps>>,
    /// Live sessions on this LU; scanned briefly when binding registrants
    pub(crate) sessions: spin::Mutex<Vec<Weak<ItNexus>>>,
    pub(crate) pr: RwLock<PrState>,
}

impl Device {
    pub fn new(
        name: impl Into<String>,
        opts: DeviceOptions,
        hooks: Arc<dyn ExternalHooks>,
    ) -> Self {
        Device {
            name: name.into(),
            opts,
            hooks,
            cluster: RwLock::new(Arc::new(NoOpClusterOps)),
            sessions: spin::Mutex::new(Vec::new()),
            pr: RwLock::new(PrState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current PRGENERATION counter
    pub fn generation(&self) -> u32 {
        self.read_state().generation
    }

    /// Whether a persistent reservation is currently in force
    pub fn is_reserved(&self) -> bool {
        self.read_state().is_set
    }

    // A poisoned lock still guards coherent state: every service action
    // either completes its mutation or rolls it back before unwinding.
    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, PrState> {
        self.pr.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, PrState> {
        self.pr
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn cl_ops(&self) -> Arc<dyn ClusterOps> {
        self.cluster
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Configure the APTPL state file. The path must be absolute and its
    /// parent directory must exist; the shadow copy lives next to it with
    /// a `.1` suffix.
    pub fn set_pr_file_path(&self, path: impl Into<PathBuf>) -> Result<(), PrFileError> {
        let path: PathBuf = path.into();
        if !path.is_absolute() {
            log::error!("PR file path {} must be absolute", path.display());
            return Err(PrFileError::InvalidPath(path));
        }
        match path.parent() {
            Some(parent) if parent.is_dir() => {}
            _ => {
                log::error!(
                    "PR file path {} parent directory doesn't exist",
                    path.display()
                );
                return Err(PrFileError::InvalidPath(path));
            }
        }
        if path.is_dir() {
            log::error!("PR file path {} must be a file", path.display());
            return Err(PrFileError::InvalidPath(path));
        }

        let mut backup = path.clone().into_os_string();
        backup.push(".1");

        let mut state = self.write_state();
        state.file_path = Some(path);
        state.backup_path = Some(PathBuf::from(backup));
        Ok(())
    }

    /// Switch between single-node and clustered operation. The DLM
    /// backend is not available in this build, so enabling cluster mode
    /// reports unsupported and leaves the device single-node.
    pub fn set_cluster_mode(&self, cluster_mode: bool, cl_dev_id: &str) -> Result<(), ClusterError> {
        let mut ops = self
            .cluster
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if ops.clustered() == cluster_mode {
            return Ok(());
        }

        log::info!(
            "{}: changing cluster_mode from {} into {}",
            self.name,
            ops.clustered(),
            cluster_mode
        );
        ops.pr_cleanup(&self.name);
        let new_ops: Arc<dyn ClusterOps> = if cluster_mode {
            Arc::new(DlmClusterOps)
        } else {
            Arc::new(NoOpClusterOps)
        };
        match new_ops.pr_init(&self.name, cl_dev_id) {
            Ok(()) => {
                *ops = new_ops;
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "{}: changing cluster_mode into {} failed: {}",
                    self.name,
                    cluster_mode,
                    e
                );
                *ops = Arc::new(NoOpClusterOps);
                Err(e)
            }
        }
    }

    /// A session logged in on this LU: remember it and, if a registration
    /// for its (TransportID, relative target id) already exists unbound,
    /// bind it to the new session.
    pub fn attach_nexus(&self, nexus: &Arc<ItNexus>) {
        let mut state = self.write_state();

        {
            let mut sessions = self.sessions.lock();
            sessions.retain(|w| w.strong_count() > 0);
            sessions.push(Arc::downgrade(nexus));
        }

        if let Some(idx) = state.find_reg(nexus.transport_id(), nexus.rel_tgt_id()) {
            let reg = &mut state.registrants[idx];
            if reg.nexus.strong_count() == 0 {
                log::debug!(
                    "Assigning reg {}/{} to nexus (dev {})",
                    transport_id::initiator_name(reg.transport_id()),
                    reg.rel_tgt_id(),
                    self.name
                );
                reg.nexus = Arc::downgrade(nexus);
                nexus.set_registrant(Some(reg.id()));
            }
        }
    }

    /// A session is logging out: drop it from the session list and move
    /// its registrant binding to another live session with the same
    /// identity, if one exists.
    pub fn detach_nexus(&self, nexus: &Arc<ItNexus>) {
        let mut state = self.write_state();

        let live: Vec<Arc<ItNexus>> = {
            let mut sessions = self.sessions.lock();
            sessions.retain(|w| match w.upgrade() {
                Some(n) => !Arc::ptr_eq(&n, nexus),
                None => false,
            });
            sessions.iter().filter_map(|w| w.upgrade()).collect()
        };

        let Some(id) = nexus.take_registrant() else {
            return;
        };
        let Some(reg) = state.reg_mut(id) else {
            return;
        };
        reg.nexus = Weak::new();

        // It should not happen that two live sessions share an identity,
        // but rebind if one does.
        for t in &live {
            if t.rel_tgt_id() == reg.rel_tgt_id()
                && transport_id::equal(t.transport_id(), reg.transport_id())
                && t.registrant_id().is_none()
            {
                log::debug!(
                    "Reassigning reg {}/{} to another nexus (dev {})",
                    transport_id::initiator_name(reg.transport_id()),
                    reg.rel_tgt_id(),
                    self.name
                );
                reg.nexus = Arc::downgrade(t);
                t.set_registrant(Some(id));
                break;
            }
        }
    }

    /// Device teardown: drop every registrant and run cluster cleanup.
    pub fn teardown(&self) {
        let mut state = self.write_state();
        self.remove_all_registrants(&mut state);
        self.cl_ops().pr_cleanup(&self.name);
    }
}
