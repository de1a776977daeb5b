//! PERSISTENT RESERVE OUT Service Actions
//!
//! The eight mutating service actions. Every handler runs under the
//! device write lock for its whole duration, validates its parameter
//! list before touching any state, and leaves the state untouched on
//! failure. Registration across multiple target ports is transactional:
//! a partial failure rolls every created registrant and every changed
//! key back before the error is reported.

use std::sync::Arc;

use crate::pr::{PrState, PrType, RegId, Registrant, SCOPE_LU, transport_id};
use crate::scsi::{
    CmdFail, OutAction, UA_CLEARED_BY_ANOTHER_INITIATOR, UA_REGISTRATIONS_PREEMPTED,
    UA_RESERVATIONS_PREEMPTED, UA_RESERVATIONS_RELEASED,
};
use crate::target::{Device, ItNexus, PrAbortCounter};

fn be64(buf: &[u8], off: usize) -> u64 {
    buf.get(off..off + 8)
        .and_then(|s| s.try_into().ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

fn be32(buf: &[u8], off: usize) -> u32 {
    buf.get(off..off + 4)
        .and_then(|s| s.try_into().ok())
        .map(u32::from_be_bytes)
        .unwrap_or(0)
}

fn be16(buf: &[u8], off: usize) -> u16 {
    buf.get(off..off + 2)
        .and_then(|s| s.try_into().ok())
        .map(u16::from_be_bytes)
        .unwrap_or(0)
}

fn reg_of<'a>(state: &'a PrState, nexus: &ItNexus) -> Option<&'a Registrant> {
    nexus.registrant_id().and_then(|id| state.reg(id))
}

impl Device {
    /// Execute a PERSISTENT RESERVE OUT service action.
    ///
    /// `cdb` is the raw 10-byte CDB (scope and type live in byte 2),
    /// `buffer` the service-action parameter list. PREEMPT AND ABORT
    /// requires an abort counter wired into the command's completion; the
    /// call returns only after every dispatched abort has drained.
    pub fn pr_out(
        &self,
        action: OutAction,
        nexus: &Arc<ItNexus>,
        cdb: &[u8],
        buffer: &[u8],
        abort: Option<&Arc<PrAbortCounter>>,
    ) -> Result<(), CmdFail> {
        let mut state = self.write_state();

        // Everything except the two plain registration actions requires
        // the requesting nexus to already be registered.
        let needs_registration = !matches!(
            action,
            OutAction::Register | OutAction::RegisterAndIgnoreExistingKey
        );
        if needs_registration && reg_of(&state, nexus).is_none() {
            log::debug!(
                "{:?} from unregistered initiator {} (dev {})",
                action,
                transport_id::initiator_name(nexus.transport_id()),
                self.name
            );
            return Err(CmdFail::ReservationConflict);
        }

        let res = match action {
            OutAction::Register => self.register(&mut state, nexus, buffer, false),
            OutAction::RegisterAndIgnoreExistingKey => {
                self.register(&mut state, nexus, buffer, true)
            }
            OutAction::Reserve => self.reserve(&mut state, nexus, cdb, buffer),
            OutAction::Release => self.release(&mut state, nexus, cdb, buffer),
            OutAction::Clear => self.clear(&mut state, nexus, buffer),
            OutAction::Preempt => self.preempt(&mut state, nexus, cdb, buffer, None),
            OutAction::PreemptAndAbort => {
                let Some(counter) = abort else {
                    log::error!("PREEMPT AND ABORT issued without an abort counter");
                    return Err(CmdFail::Busy);
                };
                let res = self.preempt(&mut state, nexus, cdb, buffer, Some(counter));
                counter.finish_and_wait();
                res
            }
            OutAction::RegisterAndMove => self.register_and_move(&mut state, nexus, buffer),
        };

        if res.is_ok() {
            self.log_state(&state);
        }
        res
    }

    fn register(
        &self,
        state: &mut PrState,
        nexus: &Arc<ItNexus>,
        buffer: &[u8],
        ignore_existing: bool,
    ) -> Result<(), CmdFail> {
        if buffer.len() < 24 {
            log::debug!("Invalid buffer size {}", buffer.len());
            return Err(CmdFail::parameter_list_length());
        }

        let aptpl = buffer[20] & 0x01 != 0;
        let all_tg_pt = (buffer[20] >> 2) & 0x01 != 0;
        let spec_i_pt = !ignore_existing && (buffer[20] >> 3) & 0x01 != 0;
        let key = be64(buffer, 0);
        let action_key = be64(buffer, 8);

        if !spec_i_pt && buffer.len() != 24 {
            log::debug!("Invalid buffer size {}", buffer.len());
            return Err(CmdFail::parameter_list_length());
        }

        log::debug!(
            "Register{}: initiator {}/{}, key {:016x}, action_key {:016x}",
            if ignore_existing { " and ignore" } else { "" },
            transport_id::initiator_name(nexus.transport_id()),
            nexus.rel_tgt_id(),
            key,
            action_key
        );

        match reg_of(state, nexus).map(|r| (r.id(), r.key())) {
            None => {
                if !ignore_existing && key != 0 {
                    log::debug!("Key must be zero on new registration");
                    return Err(CmdFail::ReservationConflict);
                }
                if action_key != 0 {
                    self.do_register(state, nexus, buffer, spec_i_pt, all_tg_pt)?;
                } else {
                    log::debug!("Doing nothing - action key is zero");
                }
            }
            Some((id, reg_key)) => {
                if !ignore_existing && reg_key != key {
                    log::debug!(
                        "Already registered - reservation key {:016x} mismatch",
                        reg_key
                    );
                    return Err(CmdFail::ReservationConflict);
                }
                if spec_i_pt {
                    log::debug!("SPEC_I_PT must be zero on an existing registration");
                    return Err(CmdFail::invalid_field_in_parm_list(20, Some(3)));
                }
                if action_key == 0 {
                    if all_tg_pt {
                        self.unregister_all_tg_pt(state, nexus.transport_id());
                    } else {
                        self.unregister(state, id);
                    }
                } else if let Some(reg) = state.reg_mut(id) {
                    reg.set_key(action_key);
                }
            }
        }

        state.generation = state.generation.wrapping_add(1);
        state.aptpl = aptpl;
        self.sync_file(state);
        Ok(())
    }

    /// Transactional multi-port registration: on any failure every newly
    /// created registrant is removed and every changed key restored.
    fn do_register(
        &self,
        state: &mut PrState,
        nexus: &Arc<ItNexus>,
        buffer: &[u8],
        spec_i_pt: bool,
        all_tg_pt: bool,
    ) -> Result<(), CmdFail> {
        let mut rollback: Vec<RegId> = Vec::new();

        let res = if all_tg_pt {
            self.register_all_tg_pt(state, nexus, buffer, spec_i_pt, &mut rollback)
        } else {
            self.register_on_tgt_id(
                state,
                nexus,
                nexus.rel_tgt_id(),
                buffer,
                spec_i_pt,
                &mut rollback,
            )
        };

        match res {
            Ok(()) => {
                self.commit_register(state, rollback);
                Ok(())
            }
            Err(e) => {
                self.rollback_register(state, rollback);
                Err(e)
            }
        }
    }

    fn commit_register(&self, state: &mut PrState, rollback: Vec<RegId>) {
        for id in rollback {
            if let Some(reg) = state.reg_mut(id) {
                reg.rollback_key = 0;
            }
        }
    }

    /// Undo a partially applied multi-port registration, newest change
    /// first. A zero rollback key marks a registrant that did not exist
    /// before; anything else is a key to restore.
    fn rollback_register(&self, state: &mut PrState, rollback: Vec<RegId>) {
        for id in rollback.into_iter().rev() {
            let prev_key = state.reg(id).map(|r| r.rollback_key).unwrap_or(0);
            if prev_key == 0 {
                self.remove_registrant(state, id);
            } else if let Some(reg) = state.reg_mut(id) {
                reg.set_key(prev_key);
                reg.rollback_key = 0;
            }
        }
    }

    fn register_all_tg_pt(
        &self,
        state: &mut PrState,
        nexus: &Arc<ItNexus>,
        buffer: &[u8],
        spec_i_pt: bool,
        rollback: &mut Vec<RegId>,
    ) -> Result<(), CmdFail> {
        let proto = transport_id::protocol_id(nexus.transport_id());

        for rel_tgt_id in self.hooks.local_target_ports(proto) {
            log::debug!("ALL_TG_PT: local target port {rel_tgt_id}");
            self.register_on_tgt_id(state, nexus, rel_tgt_id, buffer, spec_i_pt, rollback)?;
        }
        for rel_tgt_id in self.hooks.remote_target_ports() {
            log::debug!("ALL_TG_PT: remote target port {rel_tgt_id}");
            self.register_on_tgt_id(state, nexus, rel_tgt_id, buffer, spec_i_pt, rollback)?;
        }
        Ok(())
    }

    fn register_on_tgt_id(
        &self,
        state: &mut PrState,
        nexus: &Arc<ItNexus>,
        rel_tgt_id: u16,
        buffer: &[u8],
        spec_i_pt: bool,
        rollback: &mut Vec<RegId>,
    ) -> Result<(), CmdFail> {
        log::debug!("rel_tgt_id {rel_tgt_id}, spec_i_pt {spec_i_pt}");

        if spec_i_pt {
            self.register_spec_i_pt(state, rel_tgt_id, buffer, rollback)?;
        }

        // The requesting nexus may already be covered by the listed
        // TransportIDs
        if state.find_reg(nexus.transport_id(), rel_tgt_id).is_none() {
            let action_key = be64(buffer, 8);
            let id = self
                .add_registrant(state, nexus.transport_id(), rel_tgt_id, action_key)
                .ok_or(CmdFail::Busy)?;
            rollback.push(id);
        }
        Ok(())
    }

    /// Register every TransportID listed in the additional parameter data
    /// under the given relative target id.
    fn register_spec_i_pt(
        &self,
        state: &mut PrState,
        rel_tgt_id: u16,
        buffer: &[u8],
        rollback: &mut Vec<RegId>,
    ) -> Result<(), CmdFail> {
        let action_key = be64(buffer, 8);

        if buffer.len() < 28 {
            log::debug!("Invalid buffer size {}", buffer.len());
            return Err(CmdFail::parameter_list_length());
        }
        let ext_size = be32(buffer, 24) as usize;
        if ext_size + 28 > buffer.len() {
            log::debug!("Invalid buffer size {} (need {})", buffer.len(), ext_size + 28);
            return Err(CmdFail::parameter_list_length());
        }
        let tids = &buffer[28..28 + ext_size];

        // Validate the whole TransportID list before mutating anything
        let mut entries: Vec<(usize, usize)> = Vec::new();
        let mut offset = 0;
        while offset < ext_size {
            let Some(tid_size) = transport_id::parse_size(&tids[offset..]) else {
                return Err(CmdFail::invalid_field_in_parm_list(24, None));
            };
            if offset + tid_size > ext_size {
                log::debug!(
                    "Invalid transport id size {tid_size} (max {})",
                    ext_size - offset
                );
                return Err(CmdFail::invalid_field_in_parm_list(24, None));
            }
            entries.push((offset, tid_size));
            offset += tid_size;
        }

        for (offset, tid_size) in entries {
            let mut tid = tids[offset..offset + tid_size].to_vec();
            if !transport_id::secure(&mut tid) {
                return Err(CmdFail::invalid_field_in_parm_list(24, None));
            }

            if transport_id::protocol_id(&tid) == transport_id::PROTOCOL_ID_ISCSI
                && tid[0] & 0xc0 == 0
            {
                // Name-only iSCSI TransportID acts as a wildcard: register
                // every live session with this name, each with its own
                // full TransportID, on the requested port.
                log::debug!(
                    "Wildcard iSCSI TransportID {}",
                    transport_id::initiator_name(&tid)
                );
                let sessions: Vec<Arc<ItNexus>> = {
                    let sessions = self.sessions.lock();
                    sessions.iter().filter_map(|w| w.upgrade()).collect()
                };
                for t in &sessions {
                    if !transport_id::equal(t.transport_id(), &tid) {
                        continue;
                    }
                    match state.find_reg(t.transport_id(), rel_tgt_id) {
                        None => {
                            let id = self
                                .add_registrant_bound(
                                    state,
                                    t.transport_id(),
                                    rel_tgt_id,
                                    action_key,
                                    &sessions,
                                )
                                .ok_or(CmdFail::Busy)?;
                            rollback.push(id);
                        }
                        Some(idx) => {
                            let reg = &mut state.registrants[idx];
                            if reg.key() != action_key {
                                log::debug!("Changing key of registrant");
                                reg.rollback_key = reg.key();
                                reg.set_key(action_key);
                                rollback.push(reg.id());
                            }
                        }
                    }
                }
            } else {
                match state.find_reg(&tid, rel_tgt_id) {
                    Some(idx) => {
                        let reg = &mut state.registrants[idx];
                        if reg.key() != action_key {
                            log::debug!("Changing key of registrant");
                            reg.rollback_key = reg.key();
                            reg.set_key(action_key);
                            rollback.push(reg.id());
                        }
                    }
                    None => {
                        let id = self
                            .add_registrant(state, &tid, rel_tgt_id, action_key)
                            .ok_or(CmdFail::Busy)?;
                        rollback.push(id);
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove one registration. If that ends a registrants-only
    /// reservation, the remaining registrants learn about it.
    fn unregister(&self, state: &mut PrState, id: RegId) {
        let was_holder = state.is_holder(Some(id));
        let pr_type = state.pr_type;

        self.remove_registrant(state, id);

        if was_holder && !state.is_set {
            match pr_type {
                PrType::WriteExclusiveRegOnly | PrType::ExclusiveAccessRegOnly => {
                    self.send_ua_all(state, None, UA_RESERVATIONS_RELEASED);
                }
                _ => {}
            }
        }
    }

    /// Unregister this initiator from every local target port speaking
    /// its protocol.
    fn unregister_all_tg_pt(&self, state: &mut PrState, tid: &[u8]) {
        let proto = transport_id::protocol_id(tid);
        for rel_tgt_id in self.hooks.local_target_ports(proto) {
            if let Some(idx) = state.find_reg(tid, rel_tgt_id) {
                let id = state.registrants[idx].id();
                self.unregister(state, id);
            }
        }
    }

    fn reserve(
        &self,
        state: &mut PrState,
        nexus: &Arc<ItNexus>,
        cdb: &[u8],
        buffer: &[u8],
    ) -> Result<(), CmdFail> {
        if buffer.len() != 24 {
            log::debug!("Invalid buffer size {}", buffer.len());
            return Err(CmdFail::parameter_list_length());
        }

        let key = be64(buffer, 0);
        let scope_type = cdb.get(2).copied().unwrap_or(0);
        let scope = scope_type >> 4;

        let Some(pr_type) = PrType::from_cdb(scope_type & 0x0f) else {
            log::debug!("Invalid reservation type {}", scope_type & 0x0f);
            return Err(CmdFail::invalid_field_in_cdb(2, Some(0)));
        };
        if scope != SCOPE_LU {
            log::debug!("Invalid reservation scope {scope}");
            return Err(CmdFail::invalid_field_in_cdb(2, Some(4)));
        }

        let Some((id, reg_key)) = reg_of(state, nexus).map(|r| (r.id(), r.key())) else {
            return Err(CmdFail::ReservationConflict);
        };

        log::debug!(
            "Reserve: initiator {}/{}, key {:016x}, scope {} type {}",
            transport_id::initiator_name(nexus.transport_id()),
            nexus.rel_tgt_id(),
            key,
            scope,
            pr_type.as_u8()
        );

        if reg_key != key {
            log::debug!("Key {key:016x} mismatch with {reg_key:016x}");
            return Err(CmdFail::ReservationConflict);
        }

        if !state.is_set {
            state.set_holder(Some(id), scope, pr_type);
        } else if !state.is_holder(Some(id)) {
            // Only the holder may re-reserve
            log::debug!("Only the holder can override");
            return Err(CmdFail::ReservationConflict);
        } else if state.scope != scope || state.pr_type != pr_type {
            log::debug!("Scope or type mismatch with the existing reservation");
            return Err(CmdFail::ReservationConflict);
        } else {
            log::debug!("Already reserved with the same scope and type");
        }

        self.sync_file(state);
        Ok(())
    }

    fn release(
        &self,
        state: &mut PrState,
        nexus: &Arc<ItNexus>,
        cdb: &[u8],
        buffer: &[u8],
    ) -> Result<(), CmdFail> {
        if buffer.len() != 24 {
            log::debug!("Invalid buffer size {}", buffer.len());
            return Err(CmdFail::parameter_list_length());
        }

        let key = be64(buffer, 0);
        let scope_type = cdb.get(2).copied().unwrap_or(0);
        let scope = scope_type >> 4;
        let type_nibble = scope_type & 0x0f;

        if !state.is_set {
            log::debug!("There is no PR - do nothing");
            return Ok(());
        }

        let Some((id, reg_key)) = reg_of(state, nexus).map(|r| (r.id(), r.key())) else {
            return Err(CmdFail::ReservationConflict);
        };

        log::debug!(
            "Release: initiator {}/{}, key {:016x}, scope {} type {}",
            transport_id::initiator_name(nexus.transport_id()),
            nexus.rel_tgt_id(),
            key,
            scope,
            type_nibble
        );

        if reg_key != key {
            log::debug!("Key {key:016x} mismatch with {reg_key:016x}");
            return Err(CmdFail::ReservationConflict);
        }

        if !state.is_holder(Some(id)) {
            log::debug!("Releasing initiator is not a holder - do nothing");
            return Ok(());
        }

        if state.scope != scope || state.pr_type.as_u8() != type_nibble {
            log::debug!("Released scope or type do not match the holder");
            return Err(CmdFail::invalid_release());
        }

        let cur_type = state.pr_type;
        state.clear_reservation();

        match cur_type {
            PrType::WriteExclusiveRegOnly
            | PrType::ExclusiveAccessRegOnly
            | PrType::WriteExclusiveAllReg
            | PrType::ExclusiveAccessAllReg => {
                self.send_ua_all(state, Some(id), UA_RESERVATIONS_RELEASED);
            }
            _ => {}
        }

        self.sync_file(state);
        Ok(())
    }

    fn clear(
        &self,
        state: &mut PrState,
        nexus: &Arc<ItNexus>,
        buffer: &[u8],
    ) -> Result<(), CmdFail> {
        if buffer.len() != 24 {
            log::debug!("Invalid buffer size {}", buffer.len());
            return Err(CmdFail::parameter_list_length());
        }

        let key = be64(buffer, 0);
        let Some((id, reg_key)) = reg_of(state, nexus).map(|r| (r.id(), r.key())) else {
            return Err(CmdFail::ReservationConflict);
        };

        log::debug!(
            "Clear: initiator {}/{}, key {:016x}",
            transport_id::initiator_name(nexus.transport_id()),
            nexus.rel_tgt_id(),
            key
        );

        if reg_key != key {
            log::debug!("Key {key:016x} mismatch with {reg_key:016x}");
            return Err(CmdFail::ReservationConflict);
        }

        self.send_ua_all(state, Some(id), UA_RESERVATIONS_PREEMPTED);
        self.remove_all_registrants(state);

        state.generation = state.generation.wrapping_add(1);
        self.sync_file(state);
        Ok(())
    }

    fn preempt(
        &self,
        state: &mut PrState,
        nexus: &Arc<ItNexus>,
        cdb: &[u8],
        buffer: &[u8],
        counter: Option<&Arc<PrAbortCounter>>,
    ) -> Result<(), CmdFail> {
        let abort = counter.is_some();

        if buffer.len() != 24 {
            log::debug!("Invalid buffer size {}", buffer.len());
            return Err(CmdFail::parameter_list_length());
        }

        let key = be64(buffer, 0);
        let action_key = be64(buffer, 8);
        let scope_type = cdb.get(2).copied().unwrap_or(0);
        let scope = scope_type >> 4;

        let Some(pr_type) = PrType::from_cdb(scope_type & 0x0f) else {
            log::debug!("Invalid reservation type {}", scope_type & 0x0f);
            return Err(CmdFail::invalid_field_in_cdb(1, Some(0)));
        };

        let existing_type = state.pr_type;
        let existing_scope = state.scope;

        let Some((reg_id, reg_key)) = reg_of(state, nexus).map(|r| (r.id(), r.key())) else {
            return Err(CmdFail::ReservationConflict);
        };

        log::debug!(
            "Preempt{}: initiator {}/{}, key {:016x}, action_key {:016x}, scope {} type {}",
            if abort { " and abort" } else { "" },
            transport_id::initiator_name(nexus.transport_id()),
            nexus.rel_tgt_id(),
            key,
            action_key,
            scope,
            pr_type.as_u8()
        );

        if reg_key != key {
            log::debug!("Key {key:016x} mismatch with {reg_key:016x}");
            return Err(CmdFail::ReservationConflict);
        }

        if !state.is_set {
            // No reservation: preempting a key just wipes its registrations
            let victims = state.regs_by_key(action_key);
            if victims.is_empty() {
                log::debug!("Invalid key {action_key:016x}");
                return Err(CmdFail::ReservationConflict);
            }
            for v in victims {
                if abort {
                    self.abort_reg(state, v, nexus, counter);
                }
                if v != reg_id {
                    if let Some(reg) = state.reg(v) {
                        self.send_ua_reg(reg, UA_REGISTRATIONS_PREEMPTED);
                    }
                    self.remove_registrant(state, v);
                }
            }
            return self.preempt_done(state);
        }

        if state.pr_type.is_all_reg() {
            if action_key == 0 {
                // Preempt the whole all-registrants reservation
                let victims = state.regs_except(reg_id);
                for v in victims {
                    if abort {
                        self.abort_reg(state, v, nexus, counter);
                    }
                    if let Some(reg) = state.reg(v) {
                        self.send_ua_reg(reg, UA_REGISTRATIONS_PREEMPTED);
                    }
                    self.remove_registrant(state, v);
                }
                state.set_holder(Some(reg_id), scope, pr_type);
            } else {
                let victims = state.regs_by_key(action_key);
                if victims.is_empty() {
                    log::debug!("Invalid key {action_key:016x}");
                    return Err(CmdFail::ReservationConflict);
                }
                for v in victims {
                    if abort {
                        self.abort_reg(state, v, nexus, counter);
                    }
                    if v != reg_id {
                        if let Some(reg) = state.reg(v) {
                            self.send_ua_reg(reg, UA_REGISTRATIONS_PREEMPTED);
                        }
                        self.remove_registrant(state, v);
                    }
                }
            }
            return self.preempt_done(state);
        }

        let holder_key = state
            .holder
            .and_then(|h| state.reg(h))
            .map(|r| r.key())
            .unwrap_or(0);

        if holder_key != action_key {
            if action_key == 0 {
                return Err(CmdFail::invalid_field_in_parm_list(8, None));
            }
            // Preempting registrations only; the reservation stands
            let victims = state.regs_by_key(action_key);
            if victims.is_empty() {
                log::debug!("Invalid key {action_key:016x}");
                return Err(CmdFail::ReservationConflict);
            }
            for v in victims {
                if abort {
                    self.abort_reg(state, v, nexus, counter);
                }
                if v != reg_id {
                    if let Some(reg) = state.reg(v) {
                        self.send_ua_reg(reg, UA_REGISTRATIONS_PREEMPTED);
                    }
                }
                self.remove_registrant(state, v);
            }
            return self.preempt_done(state);
        }

        // The holder itself is being preempted
        let victims = state.regs_by_key(action_key);
        for v in victims {
            if abort {
                self.abort_reg(state, v, nexus, counter);
            }
            if v != reg_id {
                if let Some(reg) = state.reg(v) {
                    self.send_ua_reg(reg, UA_REGISTRATIONS_PREEMPTED);
                }
                self.remove_registrant(state, v);
            }
        }

        state.set_holder(Some(reg_id), scope, pr_type);

        if existing_type != pr_type || existing_scope != scope {
            for r in state.regs_except(reg_id) {
                if let Some(reg) = state.reg(r) {
                    self.send_ua_reg(reg, UA_RESERVATIONS_RELEASED);
                }
            }
        }

        self.preempt_done(state)
    }

    fn preempt_done(&self, state: &mut PrState) -> Result<(), CmdFail> {
        state.generation = state.generation.wrapping_add(1);
        self.sync_file(state);
        Ok(())
    }

    /// Abort everything one victim registrant has in flight. Nexuses
    /// other than the preempting one additionally learn that their
    /// commands were cleared, unless the device reports aborted commands
    /// through TAS.
    fn abort_reg(
        &self,
        state: &PrState,
        id: RegId,
        pr_nexus: &Arc<ItNexus>,
        counter: Option<&Arc<PrAbortCounter>>,
    ) {
        let Some(reg) = state.reg(id) else {
            return;
        };
        let Some(victim) = reg.nexus.upgrade() else {
            log::debug!(
                "Registrant {}/{} (key {:016x}) has no session",
                transport_id::initiator_name(reg.transport_id()),
                reg.rel_tgt_id(),
                reg.key()
            );
            return;
        };

        log::debug!(
            "Aborting commands for {}/{} (key {:016x})",
            transport_id::initiator_name(reg.transport_id()),
            reg.rel_tgt_id(),
            reg.key()
        );

        if let Err(e) = self.hooks.abort_all_for_lun(&victim, counter) {
            // There's nothing more we can do here
            log::error!(
                "Abort dispatch failed for {}/{}: {e}",
                transport_id::initiator_name(reg.transport_id()),
                reg.rel_tgt_id()
            );
            return;
        }

        if !Arc::ptr_eq(&victim, pr_nexus) && !self.opts.tas {
            let sense =
                crate::scsi::build_sense(self.opts.d_sense, UA_CLEARED_BY_ANOTHER_INITIATOR);
            self.hooks.queue_ua(&victim, &sense);
        }
    }

    fn register_and_move(
        &self,
        state: &mut PrState,
        nexus: &Arc<ItNexus>,
        buffer: &[u8],
    ) -> Result<(), CmdFail> {
        if buffer.len() < 24 {
            log::debug!("Invalid buffer size {}", buffer.len());
            return Err(CmdFail::parameter_list_length());
        }

        let aptpl = buffer[17] & 0x01 != 0;
        let unreg = (buffer[17] >> 1) & 0x01 != 0;
        let key = be64(buffer, 0);
        let action_key = be64(buffer, 8);
        let tid_buffer_size = be32(buffer, 20) as usize;

        if tid_buffer_size + 24 > buffer.len() {
            log::debug!(
                "Invalid buffer size {} (need {})",
                buffer.len(),
                tid_buffer_size + 24
            );
            return Err(CmdFail::invalid_parameter_list());
        }
        if tid_buffer_size < 24 {
            log::debug!("Transport id buffer too small");
            return Err(CmdFail::invalid_field_in_parm_list(20, None));
        }

        let Some((reg_id, reg_key)) = reg_of(state, nexus).map(|r| (r.id(), r.key())) else {
            return Err(CmdFail::ReservationConflict);
        };

        if reg_key != key {
            log::debug!("Key {key:016x} mismatch with {reg_key:016x}");
            return Err(CmdFail::ReservationConflict);
        }

        if !state.is_set {
            log::debug!("There must be a PR");
            return Err(CmdFail::invalid_cdb());
        }

        if !state.is_holder(Some(reg_id)) {
            log::debug!("Moving initiator is not a holder");
            return Err(CmdFail::ReservationConflict);
        }

        if action_key == 0 {
            log::debug!("Action key must be non-zero");
            return Err(CmdFail::invalid_field_in_cdb(8, None));
        }

        let move_buf = &buffer[24..];
        let Some(tid_size) = transport_id::parse_size(move_buf) else {
            return Err(CmdFail::invalid_parameter_list());
        };
        if tid_size + 24 > buffer.len() {
            log::debug!(
                "Transport id length {tid_size} exceeds buffer size {}",
                buffer.len() - 24
            );
            return Err(CmdFail::invalid_parameter_list());
        }
        let mut tid_move = move_buf[..tid_size].to_vec();
        if !transport_id::secure(&mut tid_move) {
            return Err(CmdFail::invalid_parameter_list());
        }
        let rel_tgt_id_move = be16(buffer, 18);

        if state.pr_type.is_all_reg() {
            log::debug!(
                "Unable to move an all-registrants reservation (type {:02x})",
                state.pr_type.as_u8()
            );
            return Err(CmdFail::ReservationConflict);
        }

        if transport_id::equal(nexus.transport_id(), &tid_move) {
            log::debug!("Equal transport ids");
            return Err(CmdFail::invalid_field_in_parm_list(24, None));
        }

        let dest = match state.find_reg(&tid_move, rel_tgt_id_move) {
            None => self
                .add_registrant(state, &tid_move, rel_tgt_id_move, action_key)
                .ok_or(CmdFail::Busy)?,
            Some(idx) => {
                let reg = &mut state.registrants[idx];
                if reg.key() != action_key {
                    log::debug!("Changing key of the move destination");
                    reg.set_key(action_key);
                }
                reg.id()
            }
        };

        log::debug!(
            "Register and move: from {}/{} to {}/{}, key {:016x} (unreg {})",
            transport_id::initiator_name(nexus.transport_id()),
            nexus.rel_tgt_id(),
            transport_id::initiator_name(&tid_move),
            rel_tgt_id_move,
            action_key,
            unreg
        );

        let scope = state.scope;
        let pr_type = state.pr_type;
        state.set_holder(Some(dest), scope, pr_type);

        if unreg {
            self.remove_registrant(state, reg_id);
        }

        state.generation = state.generation.wrapping_add(1);
        state.aptpl = aptpl;
        self.sync_file(state);
        Ok(())
    }
}
