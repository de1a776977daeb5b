//! SCSI TransportID handling
//!
//! A TransportID names an initiator port. The low four bits of the first
//! byte select the protocol; iSCSI (protocol 5) uses a length-prefixed
//! textual form, every other protocol uses a fixed 24-byte encoding.
//!
//! iSCSI TransportIDs come in two formats, selected by the top two bits of
//! the first byte: 0x00 carries the iSCSI name alone, 0x40 carries the
//! full "name,i,0x<isid>" session identifier. Comparison must be
//! case-insensitive and must cope with the two formats naming the same
//! port.

/// Protocol identifier for iSCSI
pub const PROTOCOL_ID_ISCSI: u8 = 0x05;

/// Size of every non-iSCSI TransportID
pub const TID_COMMON_SIZE: usize = 24;

const ISCSI_FMT_NAME: u8 = 0x00;
const ISCSI_FMT_SESSION: u8 = 0x40;

/// Protocol identifier of a TransportID
pub fn protocol_id(tid: &[u8]) -> u8 {
    tid[0] & 0x0f
}

/// Encoded size of a well-formed TransportID.
///
/// Callers must hold a TransportID that already passed [`parse_size`];
/// registrant-owned buffers always do.
pub fn size(tid: &[u8]) -> usize {
    if protocol_id(tid) == PROTOCOL_ID_ISCSI {
        u16::from_be_bytes([tid[2], tid[3]]) as usize + 4
    } else {
        TID_COMMON_SIZE
    }
}

/// Encoded size of a TransportID at the start of an untrusted buffer.
///
/// Returns `None` when the buffer is too short to even carry the header
/// of its own protocol encoding.
pub fn parse_size(buf: &[u8]) -> Option<usize> {
    if buf.is_empty() {
        return None;
    }
    if protocol_id(buf) == PROTOCOL_ID_ISCSI {
        if buf.len() < 4 {
            return None;
        }
        Some(u16::from_be_bytes([buf[2], buf[3]]) as usize + 4)
    } else {
        Some(TID_COMMON_SIZE)
    }
}

/// Secure a TransportID by null-terminating the textual iSCSI forms.
///
/// Fails when the declared size exceeds the buffer. Non-iSCSI
/// TransportIDs need no termination and always succeed.
pub fn secure(tid: &mut [u8]) -> bool {
    if !tid.is_empty() && protocol_id(tid) == PROTOCOL_ID_ISCSI {
        let Some(size) = parse_size(tid) else {
            return false;
        };
        if size > tid.len() {
            return false;
        }
        tid[size - 1] = 0;
    }
    true
}

fn strnlen(buf: &[u8], max: usize) -> usize {
    let max = max.min(buf.len());
    buf[..max].iter().position(|&c| c == 0).unwrap_or(max)
}

/// Effective length of one side of an iSCSI comparison. `other_fmt` is the
/// format of the opposite side: a session-format name is truncated at the
/// `,i,0x...` separator only when compared against a name-only form.
fn iscsi_len(body: &[u8], max: usize, fmt: u8, other_fmt: u8) -> Option<usize> {
    match fmt {
        ISCSI_FMT_NAME => Some(strnlen(body, max)),
        ISCSI_FMT_SESSION => {
            if fmt != other_fmt {
                let max = max.min(body.len());
                match body[..max].iter().position(|&c| c == b',') {
                    Some(p) => Some(p),
                    None => None,
                }
            } else {
                Some(strnlen(body, max))
            }
        }
        _ => None,
    }
}

/// Compare two TransportIDs for equality.
///
/// Returns false on protocol mismatch. iSCSI names compare
/// case-insensitively over their effective lengths; a malformed
/// session-format name (no separator) never matches anything.
pub fn equal(tid_a: &[u8], tid_b: &[u8]) -> bool {
    if tid_a.is_empty() || tid_b.is_empty() {
        return false;
    }

    if protocol_id(tid_a) != protocol_id(tid_b) {
        log::debug!("Different protocol IDs");
        return false;
    }

    if protocol_id(tid_a) == PROTOCOL_ID_ISCSI {
        let fmt_a = tid_a[0] & 0xc0;
        let fmt_b = tid_b[0] & 0xc0;
        if tid_a.len() < 4 || tid_b.len() < 4 {
            return false;
        }
        let max_a = size(tid_a) - 4;
        let max_b = size(tid_b) - 4;
        let body_a = &tid_a[4..];
        let body_b = &tid_b[4..];

        let Some(len_a) = iscsi_len(body_a, max_a, fmt_a, fmt_b) else {
            log::error!("Invalid initiator port transport id");
            return false;
        };
        let Some(len_b) = iscsi_len(body_b, max_b, fmt_b, fmt_a) else {
            log::error!("Invalid initiator port transport id");
            return false;
        };

        if len_a != len_b {
            return false;
        }

        // iSCSI names are case insensitive
        return body_a[..len_a].eq_ignore_ascii_case(&body_b[..len_b]);
    }

    if tid_a.len() < TID_COMMON_SIZE || tid_b.len() < TID_COMMON_SIZE {
        return false;
    }
    tid_a[..TID_COMMON_SIZE] == tid_b[..TID_COMMON_SIZE]
}

/// Human-readable initiator name for log output
pub fn initiator_name(tid: &[u8]) -> String {
    if !tid.is_empty() && protocol_id(tid) == PROTOCOL_ID_ISCSI && tid.len() > 4 {
        let body = &tid[4..];
        let len = strnlen(body, body.len());
        String::from_utf8_lossy(&body[..len]).into_owned()
    } else {
        format!("<proto {:#x}>", tid.first().copied().unwrap_or(0) & 0x0f)
    }
}
