//! Adapter Interfaces to the Surrounding Target Server
//!
//! The reservations engine consumes these interfaces and never provides
//! them: target-port enumeration for ALL_TG_PT expansion, unit-attention
//! queueing, task-abort dispatch, and the cluster hooks a replicated
//! backend can use to observe every state change.

use std::sync::Arc;

use thiserror::Error;

use crate::pr::Registrant;
use crate::target::{ItNexus, PrAbortCounter};

/// Abort dispatch was accepted by the task-management layer but failed.
#[derive(Debug, Error)]
#[error("abort dispatch failed")]
pub struct AbortDispatchError;

/// Services the engine needs from the target core.
///
/// Implementations must not call back into the reservations engine of the
/// same device: every hook is invoked with that device's PR write lock
/// held.
pub trait ExternalHooks: Send + Sync {
    /// Relative target ids of every local target port speaking the given
    /// transport protocol. Ports with a zero relative id and forwarding
    /// ports are already filtered out.
    fn local_target_ports(&self, protocol: u8) -> Vec<u16>;

    /// Relative target ids of remote target ports in this device's target
    /// group, for registration spanning a distributed target.
    fn remote_target_ports(&self) -> Vec<u16>;

    /// Queue a unit attention on the initiator behind the given nexus.
    fn queue_ua(&self, nexus: &Arc<ItNexus>, sense: &[u8]);

    /// Abort every command the nexus has outstanding on its LU. When a
    /// counter is supplied the task-management layer must call
    /// [`PrAbortCounter::abort_scheduled`] for the abort it accepts and
    /// [`PrAbortCounter::abort_done`] once that abort has fully drained;
    /// neither call may take PR locks.
    fn abort_all_for_lun(
        &self,
        nexus: &Arc<ItNexus>,
        counter: Option<&Arc<PrAbortCounter>>,
    ) -> Result<(), AbortDispatchError>;
}

/// Cluster-mode operation was requested but no cluster backend is built in.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster mode unsupported")]
    Unsupported,
}

/// Hooks a clustered lock manager can use to mirror reservation state.
///
/// The engine invokes these on device setup/teardown and on every
/// registrant created or removed; the default single-node variant does
/// nothing.
pub trait ClusterOps: Send + Sync {
    fn clustered(&self) -> bool {
        false
    }

    fn pr_init(&self, dev_name: &str, cl_dev_id: &str) -> Result<(), ClusterError> {
        let _ = (dev_name, cl_dev_id);
        Ok(())
    }

    fn pr_cleanup(&self, dev_name: &str) {
        let _ = dev_name;
    }

    fn pr_init_reg(&self, dev_name: &str, reg: &Registrant) {
        let _ = (dev_name, reg);
    }

    fn pr_rm_reg(&self, dev_name: &str, reg: &Registrant) {
        let _ = (dev_name, reg);
    }
}

/// Single-node cluster ops: every hook is a no-op.
#[derive(Debug, Default)]
pub struct NoOpClusterOps;

impl ClusterOps for NoOpClusterOps {}

/// Placeholder for a distributed-lock-manager backend. Selecting it
/// reports unsupported so callers fall back to single-node operation.
#[derive(Debug, Default)]
pub struct DlmClusterOps;

impl ClusterOps for DlmClusterOps {
    fn clustered(&self) -> bool {
        true
    }

    fn pr_init(&self, dev_name: &str, _cl_dev_id: &str) -> Result<(), ClusterError> {
        log::error!("{dev_name}: DLM cluster mode is not available in this build");
        Err(ClusterError::Unsupported)
    }
}
