//! SCSI Constants and Sense Assembly
//!
//! This module collects the SPC-level vocabulary shared by the reservations
//! engine: service-action codes, sense keys and additional sense codes, the
//! command op-flags consulted by the admissibility check, and assembly of
//! fixed- and descriptor-format sense buffers for unit attentions.

use bitflags::bitflags;
use thiserror::Error;

/// PERSISTENT RESERVE OUT service actions (CDB byte 1, low 5 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutAction {
    Register,
    Reserve,
    Release,
    Clear,
    Preempt,
    PreemptAndAbort,
    RegisterAndIgnoreExistingKey,
    RegisterAndMove,
}

impl OutAction {
    /// Decode the service-action field of a PERSISTENT RESERVE OUT CDB
    pub fn from_cdb(sa: u8) -> Option<Self> {
        match sa & 0x1f {
            0x00 => Some(OutAction::Register),
            0x01 => Some(OutAction::Reserve),
            0x02 => Some(OutAction::Release),
            0x03 => Some(OutAction::Clear),
            0x04 => Some(OutAction::Preempt),
            0x05 => Some(OutAction::PreemptAndAbort),
            0x06 => Some(OutAction::RegisterAndIgnoreExistingKey),
            0x07 => Some(OutAction::RegisterAndMove),
            _ => None,
        }
    }
}

/// PERSISTENT RESERVE IN service actions (CDB byte 1, low 5 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InAction {
    ReadKeys,
    ReadReservation,
    ReportCapabilities,
    ReadFullStatus,
}

impl InAction {
    /// Decode the service-action field of a PERSISTENT RESERVE IN CDB
    pub fn from_cdb(sa: u8) -> Option<Self> {
        match sa & 0x1f {
            0x00 => Some(InAction::ReadKeys),
            0x01 => Some(InAction::ReadReservation),
            0x02 => Some(InAction::ReportCapabilities),
            0x03 => Some(InAction::ReadFullStatus),
            _ => None,
        }
    }
}

bitflags! {
    /// Per-opcode properties relevant to reservation admissibility.
    ///
    /// The dispatcher derives these from its opcode table: commands like
    /// READ or INQUIRY carry `WRITE_EXCL_ALLOWED`, and a smaller set
    /// (INQUIRY, REPORT LUNS, ...) also carries `EXCL_ACCESS_ALLOWED`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CmdFlags: u32 {
        /// Command may run on a WRITE EXCLUSIVE reserved LU from a non-holder
        const WRITE_EXCL_ALLOWED = 1 << 0;
        /// Command may run on an EXCLUSIVE ACCESS reserved LU from a non-holder
        const EXCL_ACCESS_ALLOWED = 1 << 1;
    }
}

/// Sense key ILLEGAL REQUEST
pub const SENSE_KEY_ILLEGAL_REQUEST: u8 = 0x05;
/// Sense key UNIT ATTENTION
pub const SENSE_KEY_UNIT_ATTENTION: u8 = 0x06;

/// A (sense key, asc, ascq) triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseCode {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

/// PARAMETER LIST LENGTH ERROR
pub const PARAMETER_LIST_LENGTH_ERROR: SenseCode = SenseCode {
    key: SENSE_KEY_ILLEGAL_REQUEST,
    asc: 0x1a,
    ascq: 0x00,
};

/// INVALID FIELD IN CDB
pub const INVALID_FIELD_IN_CDB: SenseCode = SenseCode {
    key: SENSE_KEY_ILLEGAL_REQUEST,
    asc: 0x24,
    ascq: 0x00,
};

/// INVALID FIELD IN PARAMETER LIST
pub const INVALID_FIELD_IN_PARAMETER_LIST: SenseCode = SenseCode {
    key: SENSE_KEY_ILLEGAL_REQUEST,
    asc: 0x26,
    ascq: 0x00,
};

/// INVALID RELEASE OF PERSISTENT RESERVATION
pub const INVALID_RELEASE: SenseCode = SenseCode {
    key: SENSE_KEY_ILLEGAL_REQUEST,
    asc: 0x26,
    ascq: 0x04,
};

/// RESERVATIONS PREEMPTED unit attention
pub const UA_RESERVATIONS_PREEMPTED: SenseCode = SenseCode {
    key: SENSE_KEY_UNIT_ATTENTION,
    asc: 0x2a,
    ascq: 0x03,
};

/// RESERVATIONS RELEASED unit attention
pub const UA_RESERVATIONS_RELEASED: SenseCode = SenseCode {
    key: SENSE_KEY_UNIT_ATTENTION,
    asc: 0x2a,
    ascq: 0x04,
};

/// REGISTRATIONS PREEMPTED unit attention
pub const UA_REGISTRATIONS_PREEMPTED: SenseCode = SenseCode {
    key: SENSE_KEY_UNIT_ATTENTION,
    asc: 0x2a,
    ascq: 0x05,
};

/// COMMANDS CLEARED BY ANOTHER INITIATOR unit attention
pub const UA_CLEARED_BY_ANOTHER_INITIATOR: SenseCode = SenseCode {
    key: SENSE_KEY_UNIT_ATTENTION,
    asc: 0x2f,
    ascq: 0x00,
};

/// Length of a fixed-format sense buffer as queued for unit attentions
pub const FIXED_SENSE_LEN: usize = 18;

/// Assemble a fixed-format (response code 0x70) sense buffer
pub fn fixed_sense(code: SenseCode) -> [u8; FIXED_SENSE_LEN] {
    let mut b = [0u8; FIXED_SENSE_LEN];
    b[0] = 0x70;
    b[2] = code.key & 0x0f;
    b[7] = (FIXED_SENSE_LEN - 8) as u8;
    b[12] = code.asc;
    b[13] = code.ascq;
    b
}

/// Assemble a descriptor-format (response code 0x72) sense buffer
pub fn descriptor_sense(code: SenseCode) -> [u8; 8] {
    let mut b = [0u8; 8];
    b[0] = 0x72;
    b[1] = code.key & 0x0f;
    b[2] = code.asc;
    b[3] = code.ascq;
    b
}

/// Assemble sense bytes in the format selected by the device D_SENSE setting
pub fn build_sense(d_sense: bool, code: SenseCode) -> Vec<u8> {
    if d_sense {
        descriptor_sense(code).to_vec()
    } else {
        fixed_sense(code).to_vec()
    }
}

/// Location of an offending field reported alongside an ILLEGAL REQUEST
/// sense, mirroring the SPC sense-key-specific field pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldPointer {
    /// True if the field lives in the CDB, false for the parameter list
    pub in_cdb: bool,
    /// Byte offset of the field
    pub byte: u16,
    /// Bit offset within the byte, when meaningful
    pub bit: Option<u8>,
}

/// Disposition of a failed service action.
///
/// The dispatcher owns sense-buffer delivery; the engine only reports what
/// went wrong and where.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CmdFail {
    /// SAM RESERVATION CONFLICT status, no sense
    #[error("reservation conflict")]
    ReservationConflict,
    /// SAM BUSY status, no sense
    #[error("busy")]
    Busy,
    /// CHECK CONDITION with an ILLEGAL REQUEST sense
    #[error("illegal request (asc {:#04x}, ascq {:#04x})", .code.asc, .code.ascq)]
    IllegalRequest {
        code: SenseCode,
        field: Option<FieldPointer>,
    },
}

impl CmdFail {
    pub(crate) fn parameter_list_length() -> Self {
        CmdFail::IllegalRequest {
            code: PARAMETER_LIST_LENGTH_ERROR,
            field: None,
        }
    }

    pub(crate) fn invalid_field_in_cdb(byte: u16, bit: Option<u8>) -> Self {
        CmdFail::IllegalRequest {
            code: INVALID_FIELD_IN_CDB,
            field: Some(FieldPointer {
                in_cdb: true,
                byte,
                bit,
            }),
        }
    }

    pub(crate) fn invalid_field_in_parm_list(byte: u16, bit: Option<u8>) -> Self {
        CmdFail::IllegalRequest {
            code: INVALID_FIELD_IN_PARAMETER_LIST,
            field: Some(FieldPointer {
                in_cdb: false,
                byte,
                bit,
            }),
        }
    }

    pub(crate) fn invalid_parameter_list() -> Self {
        CmdFail::IllegalRequest {
            code: INVALID_FIELD_IN_PARAMETER_LIST,
            field: None,
        }
    }

    pub(crate) fn invalid_cdb() -> Self {
        CmdFail::IllegalRequest {
            code: INVALID_FIELD_IN_CDB,
            field: None,
        }
    }

    pub(crate) fn invalid_release() -> Self {
        CmdFail::IllegalRequest {
            code: INVALID_RELEASE,
            field: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_sense_layout() {
        let b = fixed_sense(UA_RESERVATIONS_PREEMPTED);
        assert_eq!(b[0], 0x70);
        assert_eq!(b[2], SENSE_KEY_UNIT_ATTENTION);
        assert_eq!(b[7], 10);
        assert_eq!(b[12], 0x2a);
        assert_eq!(b[13], 0x03);
    }

    #[test]
    fn descriptor_sense_layout() {
        let b = descriptor_sense(INVALID_FIELD_IN_CDB);
        assert_eq!(b[0], 0x72);
        assert_eq!(b[1], SENSE_KEY_ILLEGAL_REQUEST);
        assert_eq!(b[2], 0x24);
        assert_eq!(b[3], 0x00);
    }

    #[test]
    fn service_action_decoding() {
        assert_eq!(OutAction::from_cdb(0x05), Some(OutAction::PreemptAndAbort));
        assert_eq!(OutAction::from_cdb(0x47), Some(OutAction::RegisterAndMove));
        assert_eq!(OutAction::from_cdb(0x08), None);
        assert_eq!(InAction::from_cdb(0x02), Some(InAction::ReportCapabilities));
        assert_eq!(InAction::from_cdb(0x1f), None);
    }
}
