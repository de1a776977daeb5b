//! PERSISTENT RESERVE IN Service Actions
//!
//! Fixed-layout binary responses assembled into a caller-provided buffer.
//! Each handler returns the number of bytes populated; a buffer smaller
//! than the 8-byte header yields an empty response rather than an error.
//! Lists longer than the buffer are truncated while the length fields
//! still report the full size, so the initiator can re-issue the read
//! with a larger allocation.

use crate::pr::{PrState, transport_id};
use crate::scsi::InAction;
use crate::target::Device;

impl Device {
    /// Execute a PERSISTENT RESERVE IN service action.
    pub fn pr_in(&self, action: InAction, buffer: &mut [u8]) -> usize {
        let state = self.read_state();
        match action {
            InAction::ReadKeys => self.read_keys(&state, buffer),
            InAction::ReadReservation => self.read_reservation(&state, buffer),
            InAction::ReportCapabilities => self.report_capabilities(&state, buffer),
            InAction::ReadFullStatus => self.read_full_status(&state, buffer),
        }
    }

    fn read_keys(&self, state: &PrState, buffer: &mut [u8]) -> usize {
        if buffer.len() < 8 {
            log::debug!("buffer too small: {} (expected >= 8)", buffer.len());
            return 0;
        }

        log::debug!(
            "Read Keys (dev {}): PRGen {}",
            self.name,
            state.generation
        );

        buffer[0..4].copy_from_slice(&state.generation.to_be_bytes());

        let mut offset = 8;
        let mut size = 0usize;
        let size_max = buffer.len() - 8;

        for reg in &state.registrants {
            if size + 8 <= size_max {
                if reg.key() == 0 {
                    log::error!("Zero reservation key for a live registrant");
                }
                buffer[offset..offset + 8].copy_from_slice(&reg.key().to_be_bytes());
                offset += 8;
            }
            size += 8;
        }

        buffer[4..8].copy_from_slice(&(size as u32).to_be_bytes());
        offset
    }

    fn read_reservation(&self, state: &PrState, buffer: &mut [u8]) -> usize {
        if buffer.len() < 8 {
            log::debug!("buffer too small: {} (expected >= 8)", buffer.len());
            return 0;
        }

        let mut b = [0u8; 24];
        b[0..4].copy_from_slice(&state.generation.to_be_bytes());

        let size;
        if !state.is_set {
            log::debug!("Read Reservation: no reservations for dev {}", self.name);
            size = 8;
        } else {
            let key = state
                .holder
                .and_then(|id| state.reg(id))
                .map(|r| r.key())
                .unwrap_or(0);

            b[7] = 0x10;
            b[8..16].copy_from_slice(&key.to_be_bytes());
            b[21] = (state.scope << 4) | state.pr_type.as_u8();
            size = 24;
        }

        let size = size.min(buffer.len());
        buffer[..size].copy_from_slice(&b[..size]);
        buffer[size..].fill(0);
        size
    }

    fn report_capabilities(&self, state: &PrState, buffer: &mut [u8]) -> usize {
        if buffer.len() < 8 {
            log::debug!("buffer too small: {} (expected >= 8)", buffer.len());
            return 0;
        }

        let crh = 1u8;
        let sip_c = 1u8;
        let atp_c = 1u8;
        let ptpl_c = 1u8;

        log::debug!(
            "Reporting capabilities (dev {}): crh {:x}, sip_c {:x}, atp_c {:x}, ptpl_c {:x}, aptpl {}",
            self.name,
            crh,
            sip_c,
            atp_c,
            ptpl_c,
            state.aptpl
        );

        buffer[0] = 0;
        buffer[1] = 8;
        buffer[2] = (crh << 4) | (sip_c << 3) | (atp_c << 2) | ptpl_c;
        buffer[3] = (1 << 7) | (4 << 4) | u8::from(state.aptpl);
        // Bitmap of supported reservation types
        buffer[4] = 0xea;
        buffer[5] = 0x01;
        buffer[6] = 0;
        buffer[7] = 0;

        8
    }

    fn read_full_status(&self, state: &PrState, buffer: &mut [u8]) -> usize {
        if buffer.len() < 8 {
            return 0;
        }

        buffer[0..4].copy_from_slice(&state.generation.to_be_bytes());

        let mut offset = 8;
        let mut size = 0usize;
        let size_max = buffer.len() - 8;

        for reg in &state.registrants {
            let tid_size = transport_id::size(reg.transport_id());
            let rec_len = 24 + tid_size;

            if size + rec_len < size_max {
                buffer[offset..offset + rec_len].fill(0);
                buffer[offset..offset + 8].copy_from_slice(&reg.key().to_be_bytes());

                if state.is_set && state.is_holder(Some(reg.id())) {
                    buffer[offset + 12] = 1;
                    buffer[offset + 13] = (state.scope << 4) | state.pr_type.as_u8();
                }

                buffer[offset + 18..offset + 20].copy_from_slice(&reg.rel_tgt_id().to_be_bytes());
                buffer[offset + 20..offset + 24]
                    .copy_from_slice(&(tid_size as u32).to_be_bytes());
                buffer[offset + 24..offset + rec_len].copy_from_slice(reg.transport_id());

                offset += rec_len;
            }
            size += rec_len;
        }

        buffer[4..8].copy_from_slice(&(size as u32).to_be_bytes());
        offset
    }
}
