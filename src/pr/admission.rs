//! Command Admissibility Under Persistent Reservations
//!
//! Called by the dispatcher for every media-access command before
//! execution, and for legacy RESERVE/RELEASE to decide the Compatible
//! Reservation Handling case. Both checks take the read side of the
//! device lock and never block on I/O.

use crate::pr::PrType;
use crate::scsi::CmdFlags;
use crate::target::{Device, ItNexus};

impl Device {
    /// Whether a command from the given nexus may execute under the
    /// current reservation.
    pub fn is_cmd_allowed(&self, nexus: &ItNexus, flags: CmdFlags) -> bool {
        let state = self.read_state();

        // Can change while the caller was waiting for the lock
        if !state.is_set {
            return true;
        }

        let reg = nexus.registrant_id();
        let allowed = match state.pr_type {
            PrType::WriteExclusive => {
                state.is_holder(reg) || flags.contains(CmdFlags::WRITE_EXCL_ALLOWED)
            }
            PrType::ExclusiveAccess => {
                state.is_holder(reg) || flags.contains(CmdFlags::EXCL_ACCESS_ALLOWED)
            }
            PrType::WriteExclusiveRegOnly | PrType::WriteExclusiveAllReg => {
                reg.is_some() || flags.contains(CmdFlags::WRITE_EXCL_ALLOWED)
            }
            PrType::ExclusiveAccessRegOnly | PrType::ExclusiveAccessAllReg => {
                reg.is_some() || flags.contains(CmdFlags::EXCL_ACCESS_ALLOWED)
            }
            PrType::Unspecified => {
                log::error!("Invalid PR type {:x}", state.pr_type.as_u8());
                false
            }
        };

        if !allowed {
            log::debug!(
                "Command from {} rejected due to PR (dev {})",
                crate::pr::transport_id::initiator_name(nexus.transport_id()),
                self.name
            );
        }
        allowed
    }

    /// Compatible Reservation Handling: whether a legacy SCSI-2
    /// RESERVE/RELEASE from this nexus is honored despite an active
    /// persistent reservation.
    pub fn crh_case(&self, nexus: &ItNexus) -> bool {
        let state = self.read_state();

        if !state.is_set {
            return false;
        }

        let reg = nexus.registrant_id();
        match state.pr_type {
            PrType::WriteExclusive | PrType::ExclusiveAccess => state.is_holder(reg),
            PrType::WriteExclusiveRegOnly
            | PrType::ExclusiveAccessRegOnly
            | PrType::WriteExclusiveAllReg
            | PrType::ExclusiveAccessAllReg => reg.is_some(),
            PrType::Unspecified => {
                log::error!("Invalid PR type {:x}", state.pr_type.as_u8());
                false
            }
        }
    }
}
