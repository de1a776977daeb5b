//! Persistent Reservations Engine
//!
//! State and service actions for SPC-3/SPC-4 persistent reservations on a
//! logical unit: the registrant set keyed by (TransportID, relative target
//! port id), the reservation holder state machine, the PERSISTENT RESERVE
//! IN/OUT service actions, command admissibility, and APTPL persistence.
//!
//! All mutation happens under the owning device's write lock; the read
//! paths (admissibility, PERSISTENT RESERVE IN) take the read side and
//! never block on I/O.

pub mod admission;
pub mod file;
pub mod out;
pub mod read;
pub mod transport_id;

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use crate::scsi::SenseCode;
use crate::target::{Device, ItNexus};

/// Reservation scope: only LU scope is ever accepted
pub const SCOPE_LU: u8 = 0x00;

/// Persistent reservation type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrType {
    WriteExclusive = 0x01,
    ExclusiveAccess = 0x03,
    WriteExclusiveRegOnly = 0x05,
    ExclusiveAccessRegOnly = 0x06,
    WriteExclusiveAllReg = 0x07,
    ExclusiveAccessAllReg = 0x08,
    /// No reservation in force
    Unspecified = 0xff,
}

impl PrType {
    /// Decode the type nibble of a PR-OUT CDB; only the six real types
    /// are valid on the wire.
    pub fn from_cdb(nibble: u8) -> Option<Self> {
        match nibble {
            0x01 => Some(PrType::WriteExclusive),
            0x03 => Some(PrType::ExclusiveAccess),
            0x05 => Some(PrType::WriteExclusiveRegOnly),
            0x06 => Some(PrType::ExclusiveAccessRegOnly),
            0x07 => Some(PrType::WriteExclusiveAllReg),
            0x08 => Some(PrType::ExclusiveAccessAllReg),
            _ => None,
        }
    }

    pub(crate) fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0xff => Some(PrType::Unspecified),
            other => PrType::from_cdb(other),
        }
    }

    /// True for the two all-registrants types, where every registrant is
    /// a reservation holder.
    pub fn is_all_reg(self) -> bool {
        matches!(
            self,
            PrType::WriteExclusiveAllReg | PrType::ExclusiveAccessAllReg
        )
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Stable identity of a registrant within one device.
///
/// Indices into the registrant list shift on removal; identifiers do not,
/// so the holder reference and the nexus back-pointers use these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegId(u64);

/// One registered I_T nexus: a (TransportID, relative target port id)
/// pair holding a reservation key.
#[derive(Debug)]
pub struct Registrant {
    id: RegId,
    transport_id: Box<[u8]>,
    rel_tgt_id: u16,
    key: u64,
    /// Binding to a live session, if the initiator is currently logged in
    /// through this port. Outlives any session; unit attentions and aborts
    /// simply skip an unbound registrant.
    pub(crate) nexus: Weak<ItNexus>,
    /// Previous key while a multi-step REGISTER is in flight; zero means
    /// the registrant did not exist before and is removed on rollback.
    pub(crate) rollback_key: u64,
}

impl Registrant {
    pub fn id(&self) -> RegId {
        self.id
    }

    pub fn transport_id(&self) -> &[u8] {
        &self.transport_id
    }

    pub fn rel_tgt_id(&self) -> u16 {
        self.rel_tgt_id
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn set_key(&mut self, key: u64) {
        self.key = key;
    }
}

/// Complete persistent reservation state of one logical unit, protected by
/// the device's reader/writer lock.
#[derive(Debug)]
pub struct PrState {
    pub(crate) is_set: bool,
    pub(crate) scope: u8,
    pub(crate) pr_type: PrType,
    pub(crate) holder: Option<RegId>,
    pub(crate) generation: u32,
    pub(crate) aptpl: bool,
    /// Insertion order is the READ KEYS / READ FULL STATUS reporting order
    pub(crate) registrants: Vec<Registrant>,
    pub(crate) file_path: Option<PathBuf>,
    pub(crate) backup_path: Option<PathBuf>,
    next_reg_id: u64,
}

impl PrState {
    pub(crate) fn new() -> Self {
        PrState {
            is_set: false,
            scope: SCOPE_LU,
            pr_type: PrType::Unspecified,
            holder: None,
            generation: 0,
            aptpl: false,
            registrants: Vec::new(),
            file_path: None,
            backup_path: None,
            next_reg_id: 1,
        }
    }

    pub(crate) fn alloc_reg_id(&mut self) -> RegId {
        let id = RegId(self.next_reg_id);
        self.next_reg_id += 1;
        id
    }

    pub(crate) fn new_registrant(
        &mut self,
        transport_id: &[u8],
        rel_tgt_id: u16,
        key: u64,
    ) -> Registrant {
        Registrant {
            id: self.alloc_reg_id(),
            transport_id: transport_id[..transport_id::size(transport_id)].into(),
            rel_tgt_id,
            key,
            nexus: Weak::new(),
            rollback_key: 0,
        }
    }

    /// Find a registrant by its (TransportID, relative target id) identity
    pub(crate) fn find_reg(&self, tid: &[u8], rel_tgt_id: u16) -> Option<usize> {
        self.registrants
            .iter()
            .position(|r| r.rel_tgt_id == rel_tgt_id && transport_id::equal(&r.transport_id, tid))
    }

    pub(crate) fn index_of(&self, id: RegId) -> Option<usize> {
        self.registrants.iter().position(|r| r.id == id)
    }

    pub(crate) fn reg(&self, id: RegId) -> Option<&Registrant> {
        self.registrants.iter().find(|r| r.id == id)
    }

    pub(crate) fn reg_mut(&mut self, id: RegId) -> Option<&mut Registrant> {
        self.registrants.iter_mut().find(|r| r.id == id)
    }

    /// Every registrant holding the given key, in registration order
    pub(crate) fn regs_by_key(&self, key: u64) -> Vec<RegId> {
        self.registrants
            .iter()
            .filter(|r| r.key == key)
            .map(|r| r.id)
            .collect()
    }

    /// Every registrant except the excluded one, in registration order
    pub(crate) fn regs_except(&self, exclude: RegId) -> Vec<RegId> {
        self.registrants
            .iter()
            .filter(|r| r.id != exclude)
            .map(|r| r.id)
            .collect()
    }

    /// Whether the given registrant (or unregistered nexus, `None`) holds
    /// the reservation. With an all-registrants reservation every
    /// registrant is a holder.
    pub(crate) fn is_holder(&self, reg: Option<RegId>) -> bool {
        if !self.is_set {
            return false;
        }
        if self.pr_type.is_all_reg() {
            reg.is_some()
        } else {
            self.holder.is_some() && self.holder == reg
        }
    }

    /// Establish a reservation. All-registrants types have no single
    /// holder; the holder reference stays empty for them.
    pub(crate) fn set_holder(&mut self, reg: Option<RegId>, scope: u8, pr_type: PrType) {
        self.is_set = true;
        self.scope = scope;
        self.pr_type = pr_type;
        self.holder = if pr_type.is_all_reg() { None } else { reg };
    }

    pub(crate) fn clear_reservation(&mut self) {
        debug_assert!(self.is_set);
        self.is_set = false;
        self.scope = SCOPE_LU;
        self.pr_type = PrType::Unspecified;
        self.holder = None;
    }

    /// Drop the holder after its registrant went away. An all-registrants
    /// reservation survives until the last registrant is gone; any other
    /// reservation dies with its holder.
    pub(crate) fn clear_holder(&mut self) {
        debug_assert!(self.is_set);
        if self.pr_type.is_all_reg() {
            if self.registrants.is_empty() {
                self.clear_reservation();
            }
        } else {
            self.clear_reservation();
        }
        self.holder = None;
    }
}

impl Device {
    /// Create a registrant, scanning the device's live sessions for one to
    /// bind it to.
    pub(crate) fn add_registrant(
        &self,
        state: &mut PrState,
        tid: &[u8],
        rel_tgt_id: u16,
        key: u64,
    ) -> Option<RegId> {
        let sessions: Vec<Arc<ItNexus>> = {
            let sessions = self.sessions.lock();
            sessions.iter().filter_map(|w| w.upgrade()).collect()
        };
        self.add_registrant_bound(state, tid, rel_tgt_id, key, &sessions)
    }

    /// Create a registrant against an already-collected session snapshot.
    /// Binding is best effort; the registrant may stay unbound.
    pub(crate) fn add_registrant_bound(
        &self,
        state: &mut PrState,
        tid: &[u8],
        rel_tgt_id: u16,
        key: u64,
        sessions: &[Arc<ItNexus>],
    ) -> Option<RegId> {
        log::debug!(
            "Registering {}/{} (dev {})",
            transport_id::initiator_name(tid),
            rel_tgt_id,
            self.name
        );

        if state.find_reg(tid, rel_tgt_id).is_some() {
            // Can happen only if a target driver made more than one session
            // from the same initiator port to the same target port.
            log::error!(
                "Registrant {}/{} (dev {}) already exists!",
                transport_id::initiator_name(tid),
                rel_tgt_id,
                self.name
            );
            return None;
        }

        let mut reg = state.new_registrant(tid, rel_tgt_id, key);
        self.cl_ops().pr_init_reg(&self.name, &reg);

        for t in sessions {
            if t.rel_tgt_id() == rel_tgt_id
                && t.registrant_id().is_none()
                && transport_id::equal(t.transport_id(), tid)
            {
                reg.nexus = Arc::downgrade(t);
                t.set_registrant(Some(reg.id()));
                break;
            }
        }

        let id = reg.id();
        state.registrants.push(reg);
        Some(id)
    }

    /// Destroy a registrant. If it held the reservation the holder
    /// transition runs, which may clear the reservation entirely.
    pub(crate) fn remove_registrant(&self, state: &mut PrState, id: RegId) {
        let Some(idx) = state.index_of(id) else {
            return;
        };
        let was_holder = state.is_holder(Some(id));
        let reg = state.registrants.remove(idx);

        log::debug!(
            "Removing registrant {}/{} (key {:016x}, dev {})",
            transport_id::initiator_name(reg.transport_id()),
            reg.rel_tgt_id(),
            reg.key(),
            self.name
        );

        self.cl_ops().pr_rm_reg(&self.name, &reg);

        if was_holder {
            state.clear_holder();
        }

        if let Some(nexus) = reg.nexus.upgrade() {
            nexus.set_registrant(None);
        }
    }

    pub(crate) fn remove_all_registrants(&self, state: &mut PrState) {
        while let Some(reg) = state.registrants.first() {
            let id = reg.id();
            self.remove_registrant(state, id);
        }
    }

    /// Queue a unit attention on one registrant's nexus, if it has one.
    pub(crate) fn send_ua_reg(&self, reg: &Registrant, code: SenseCode) {
        log::debug!(
            "Queueing UA [{:x} {:x} {:x}]: registrant {}/{} (key {:016x})",
            code.key,
            code.asc,
            code.ascq,
            transport_id::initiator_name(reg.transport_id()),
            reg.rel_tgt_id(),
            reg.key()
        );
        if let Some(nexus) = reg.nexus.upgrade() {
            let sense = crate::scsi::build_sense(self.opts.d_sense, code);
            self.hooks.queue_ua(&nexus, &sense);
        }
    }

    pub(crate) fn send_ua_all(&self, state: &PrState, exclude: Option<RegId>, code: SenseCode) {
        for reg in &state.registrants {
            if Some(reg.id()) != exclude {
                self.send_ua_reg(reg, code);
            }
        }
    }

    /// Debug dump of the registrant table and holder.
    pub(crate) fn log_state(&self, state: &PrState) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }

        log::debug!("Persistent reservations for device {}:", self.name);

        if state.registrants.is_empty() {
            log::debug!("  No registrants");
        } else {
            for (i, reg) in state.registrants.iter().enumerate() {
                log::debug!(
                    "  [{}] registrant {}/{}, key {:016x}",
                    i,
                    transport_id::initiator_name(reg.transport_id()),
                    reg.rel_tgt_id(),
                    reg.key()
                );
            }
        }

        if state.is_set {
            match state.holder.and_then(|id| state.reg(id)) {
                Some(holder) => log::debug!(
                    "Reservation holder is {}/{} (key {:016x}, scope {:x}, type {:x})",
                    transport_id::initiator_name(holder.transport_id()),
                    holder.rel_tgt_id(),
                    holder.key(),
                    state.scope,
                    state.pr_type.as_u8()
                ),
                None => log::debug!(
                    "All registrants are reservation holders (scope {:x}, type {:x})",
                    state.scope,
                    state.pr_type.as_u8()
                ),
            }
        } else {
            log::debug!("Not reserved");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(name: &str) -> Vec<u8> {
        let mut padded = name.as_bytes().to_vec();
        padded.push(0);
        while padded.len() % 4 != 0 {
            padded.push(0);
        }
        let mut tid = vec![transport_id::PROTOCOL_ID_ISCSI, 0];
        tid.extend_from_slice(&(padded.len() as u16).to_be_bytes());
        tid.extend_from_slice(&padded);
        tid
    }

    fn add(state: &mut PrState, name: &str, rel: u16, key: u64) -> RegId {
        let reg = state.new_registrant(&tid(name), rel, key);
        let id = reg.id();
        state.registrants.push(reg);
        id
    }

    #[test]
    fn find_reg_matches_tid_and_port() {
        let mut state = PrState::new();
        let a = add(&mut state, "iqn.a", 1, 0x11);
        let _b = add(&mut state, "iqn.a", 2, 0x22);

        let idx = state.find_reg(&tid("IQN.A"), 1).unwrap();
        assert_eq!(state.registrants[idx].id(), a);
        assert!(state.find_reg(&tid("iqn.a"), 3).is_none());
        assert!(state.find_reg(&tid("iqn.c"), 1).is_none());
    }

    #[test]
    fn holder_transitions_non_all_reg() {
        let mut state = PrState::new();
        let a = add(&mut state, "iqn.a", 1, 0x11);
        let b = add(&mut state, "iqn.b", 1, 0x22);

        state.set_holder(Some(a), SCOPE_LU, PrType::WriteExclusive);
        assert!(state.is_set);
        assert!(state.is_holder(Some(a)));
        assert!(!state.is_holder(Some(b)));
        assert!(!state.is_holder(None));

        state.clear_holder();
        assert!(!state.is_set);
        assert_eq!(state.pr_type, PrType::Unspecified);
        assert_eq!(state.holder, None);
    }

    #[test]
    fn holder_transitions_all_reg() {
        let mut state = PrState::new();
        let a = add(&mut state, "iqn.a", 1, 0x11);
        let b = add(&mut state, "iqn.b", 1, 0x22);

        state.set_holder(Some(a), SCOPE_LU, PrType::WriteExclusiveAllReg);
        assert_eq!(state.holder, None);
        assert!(state.is_holder(Some(a)));
        assert!(state.is_holder(Some(b)));
        assert!(!state.is_holder(None));

        // Reservation persists while registrants remain
        state.registrants.retain(|r| r.id() != a);
        state.clear_holder();
        assert!(state.is_set);

        state.registrants.clear();
        state.clear_holder();
        assert!(!state.is_set);
    }

    #[test]
    fn regs_by_key_preserves_order() {
        let mut state = PrState::new();
        let a = add(&mut state, "iqn.a", 1, 0x11);
        let _b = add(&mut state, "iqn.b", 1, 0x22);
        let c = add(&mut state, "iqn.c", 1, 0x11);

        assert_eq!(state.regs_by_key(0x11), vec![a, c]);
        assert!(state.regs_by_key(0x33).is_empty());
        assert_eq!(state.regs_except(a).len(), 2);
    }
}
