//! CrabSCSI - A SCSI-3 persistent reservations engine for a SCSI target
//!
//! This library implements the PERSISTENT RESERVE IN / PERSISTENT RESERVE
//! OUT service-action family of SPC-3/SPC-4 for a SCSI target server: the
//! registrant set of a logical unit, the reservation state machine, the
//! admissibility decision for every command delivered to the LU, and
//! crash-safe APTPL persistence of the whole state.
//!
//! The surrounding target server supplies the transport front end, the
//! command dispatcher, task management and session lifecycle; it talks to
//! the engine through [`Device`], [`ItNexus`] and the
//! [`target::hooks::ExternalHooks`] adapter.

pub mod logger;
pub mod pr;
pub mod scsi;
pub mod target;

#[cfg(test)]
pub(crate) mod testutil;

pub use pr::file::PrFileError;
pub use pr::{PrType, RegId, Registrant, SCOPE_LU};
pub use scsi::{CmdFail, CmdFlags, FieldPointer, InAction, OutAction, SenseCode};
pub use target::hooks::{
    AbortDispatchError, ClusterError, ClusterOps, DlmClusterOps, ExternalHooks, NoOpClusterOps,
};
pub use target::{Device, DeviceOptions, ItNexus, NexusError, PrAbortCounter};
