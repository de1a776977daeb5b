//! End-to-end exercises of the persistent reservations engine through its
//! public surface: registration, reservation, admissibility, preemption,
//! and APTPL persistence across a simulated power loss.

use std::sync::Arc;

use crabscsi::{
    AbortDispatchError, CmdFail, CmdFlags, Device, DeviceOptions, ExternalHooks, InAction, ItNexus,
    OutAction, PrAbortCounter, PrType,
};

#[derive(Default)]
struct Hooks {
    local_ports: Vec<u16>,
    remote_ports: Vec<u16>,
    uas: spin::Mutex<Vec<(u16, Vec<u8>)>>,
    aborts: spin::Mutex<Vec<u16>>,
}

impl ExternalHooks for Hooks {
    fn local_target_ports(&self, _protocol: u8) -> Vec<u16> {
        self.local_ports.clone()
    }

    fn remote_target_ports(&self) -> Vec<u16> {
        self.remote_ports.clone()
    }

    fn queue_ua(&self, nexus: &Arc<ItNexus>, sense: &[u8]) {
        self.uas.lock().push((nexus.rel_tgt_id(), sense.to_vec()));
    }

    fn abort_all_for_lun(
        &self,
        nexus: &Arc<ItNexus>,
        counter: Option<&Arc<PrAbortCounter>>,
    ) -> Result<(), AbortDispatchError> {
        if let Some(counter) = counter {
            counter.abort_scheduled();
            counter.abort_done();
        }
        self.aborts.lock().push(nexus.rel_tgt_id());
        Ok(())
    }
}

fn iscsi_tid(name: &str) -> Vec<u8> {
    let mut padded = name.as_bytes().to_vec();
    padded.push(0);
    while padded.len() % 4 != 0 {
        padded.push(0);
    }
    let mut tid = vec![0x05, 0x00];
    tid.extend_from_slice(&(padded.len() as u16).to_be_bytes());
    tid.extend_from_slice(&padded);
    tid
}

fn params(key: u64, action_key: u64, flags: u8) -> Vec<u8> {
    let mut b = vec![0u8; 24];
    b[0..8].copy_from_slice(&key.to_be_bytes());
    b[8..16].copy_from_slice(&action_key.to_be_bytes());
    b[20] = flags;
    b
}

fn cdb(scope_type: u8) -> Vec<u8> {
    let mut c = vec![0u8; 10];
    c[2] = scope_type;
    c
}

fn attach(dev: &Device, name: &str, rel_tgt_id: u16) -> Arc<ItNexus> {
    let n = ItNexus::new(&iscsi_tid(name), rel_tgt_id, 0).unwrap();
    dev.attach_nexus(&n);
    n
}

fn register(dev: &Device, n: &Arc<ItNexus>, key: u64) {
    dev.pr_out(OutAction::Register, n, &cdb(0), &params(0, key, 0), None)
        .unwrap();
}

fn reserve(dev: &Device, n: &Arc<ItNexus>, key: u64, pr_type: PrType) {
    dev.pr_out(
        OutAction::Reserve,
        n,
        &cdb(pr_type.as_u8()),
        &params(key, 0, 0),
        None,
    )
    .unwrap();
}

#[test]
fn register_reserve_read_reservation() {
    let dev = Device::new("disk0", DeviceOptions::default(), Arc::new(Hooks::default()));
    let a = attach(&dev, "iqn.2004-10.com.example:a", 1);

    register(&dev, &a, 0x1111);
    reserve(&dev, &a, 0x1111, PrType::WriteExclusive);

    let mut buf = [0u8; 32];
    let len = dev.pr_in(InAction::ReadReservation, &mut buf);
    assert_eq!(len, 24);
    assert_eq!(u32::from_be_bytes(buf[0..4].try_into().unwrap()), 1);
    assert_eq!(buf[7], 0x10);
    assert_eq!(u64::from_be_bytes(buf[8..16].try_into().unwrap()), 0x1111);
    assert_eq!(buf[21], 0x01);
}

#[test]
fn write_exclusive_admissibility() {
    let dev = Device::new("disk0", DeviceOptions::default(), Arc::new(Hooks::default()));
    let a = attach(&dev, "iqn.a", 1);
    let b = attach(&dev, "iqn.b", 1);

    register(&dev, &a, 0x1111);
    reserve(&dev, &a, 0x1111, PrType::WriteExclusive);

    // A write from a non-holder is denied
    assert!(!dev.is_cmd_allowed(&b, CmdFlags::empty()));
    // A read from a non-holder passes: WRITE EXCLUSIVE permits it
    assert!(dev.is_cmd_allowed(&b, CmdFlags::WRITE_EXCL_ALLOWED));
    // The holder writes freely
    assert!(dev.is_cmd_allowed(&a, CmdFlags::empty()));
}

#[test]
fn preempt_takes_over_reservation() {
    let hooks = Arc::new(Hooks::default());
    let dev = Device::new("disk0", DeviceOptions::default(), hooks.clone());
    let a = attach(&dev, "iqn.a", 1);
    let b = attach(&dev, "iqn.b", 2);

    register(&dev, &a, 1);
    register(&dev, &b, 2);
    reserve(&dev, &a, 1, PrType::ExclusiveAccessRegOnly);
    let generation = dev.generation();

    dev.pr_out(
        OutAction::Preempt,
        &b,
        &cdb(PrType::ExclusiveAccessRegOnly.as_u8()),
        &params(2, 1, 0),
        None,
    )
    .unwrap();

    assert_eq!(dev.generation(), generation + 1);
    assert!(!a.is_registered());
    assert!(dev.is_reserved());
    assert!(dev.is_cmd_allowed(&b, CmdFlags::empty()));
    assert!(!dev.is_cmd_allowed(&a, CmdFlags::empty()));

    // The preempted registrant heard REGISTRATIONS PREEMPTED
    let uas = hooks.uas.lock();
    assert_eq!(uas.len(), 1);
    let (port, sense) = &uas[0];
    assert_eq!(*port, 1);
    assert_eq!((sense[12], sense[13]), (0x2a, 0x05));
}

#[test]
fn all_tg_pt_spans_local_and_remote_ports() {
    let hooks = Arc::new(Hooks {
        local_ports: vec![1, 2],
        remote_ports: vec![5],
        ..Default::default()
    });
    let dev = Device::new("disk0", DeviceOptions::default(), hooks);
    let a = attach(&dev, "iqn.a", 1);

    dev.pr_out(OutAction::Register, &a, &cdb(0), &params(0, 0x1111, 0x04), None)
        .unwrap();
    assert_eq!(dev.generation(), 1);

    // Three registrations, one per port, all with the same key
    let mut buf = [0u8; 64];
    let len = dev.pr_in(InAction::ReadKeys, &mut buf);
    assert_eq!(len, 8 + 3 * 8);
    assert_eq!(u32::from_be_bytes(buf[4..8].try_into().unwrap()), 24);
    for i in 0..3 {
        let off = 8 + i * 8;
        assert_eq!(
            u64::from_be_bytes(buf[off..off + 8].try_into().unwrap()),
            0x1111
        );
    }

    let mut full = [0u8; 256];
    let len = dev.pr_in(InAction::ReadFullStatus, &mut full);
    let mut ports = Vec::new();
    let mut off = 8;
    while off < len {
        let tid_len =
            u32::from_be_bytes(full[off + 20..off + 24].try_into().unwrap()) as usize;
        ports.push(u16::from_be_bytes(full[off + 18..off + 20].try_into().unwrap()));
        off += 24 + tid_len;
    }
    ports.sort_unstable();
    assert_eq!(ports, vec![1, 2, 5]);
}

#[test]
fn aptpl_state_survives_a_corrupted_primary_file() {
    let dir = tempfile::tempdir().unwrap();
    let pr_path = dir.path().join("disk0.pr");

    let dev = Device::new("disk0", DeviceOptions::default(), Arc::new(Hooks::default()));
    dev.set_pr_file_path(&pr_path).unwrap();
    dev.load_pr_state().unwrap();

    let a = attach(&dev, "iqn.a", 1);
    // APTPL bit set on registration
    dev.pr_out(OutAction::Register, &a, &cdb(0), &params(0, 0xaa, 0x01), None)
        .unwrap();
    reserve(&dev, &a, 0xaa, PrType::WriteExclusive);
    // A second persisting mutation populates the shadow copy
    dev.pr_out(
        OutAction::RegisterAndIgnoreExistingKey,
        &a,
        &cdb(0),
        &params(0, 0xaa, 0x01),
        None,
    )
    .unwrap();

    // Corrupt the body of the primary file
    let mut bytes = std::fs::read(&pr_path).unwrap();
    let last = bytes.len() - 1;
    bytes.truncate(last);
    std::fs::write(&pr_path, &bytes).unwrap();

    // Power loss: a fresh device loads from the backup
    let dev2 = Device::new("disk0", DeviceOptions::default(), Arc::new(Hooks::default()));
    dev2.set_pr_file_path(&pr_path).unwrap();
    dev2.load_pr_state().unwrap();

    assert!(dev2.is_reserved());
    let mut buf = [0u8; 32];
    let len = dev2.pr_in(InAction::ReadReservation, &mut buf);
    assert_eq!(len, 24);
    assert_eq!(u64::from_be_bytes(buf[8..16].try_into().unwrap()), 0xaa);
    assert_eq!(buf[21], PrType::WriteExclusive.as_u8());

    let len = dev2.pr_in(InAction::ReadKeys, &mut buf);
    assert_eq!(len, 16);
    assert_eq!(u64::from_be_bytes(buf[8..16].try_into().unwrap()), 0xaa);
}

#[test]
fn register_and_move_rejects_all_registrants_types() {
    let dev = Device::new("disk0", DeviceOptions::default(), Arc::new(Hooks::default()));
    let a = attach(&dev, "iqn.a", 1);

    register(&dev, &a, 0x1111);
    reserve(&dev, &a, 0x1111, PrType::WriteExclusiveAllReg);

    let tid_b = iscsi_tid("iqn.b");
    let mut buf = params(0x1111, 0x2222, 0);
    buf[18..20].copy_from_slice(&2u16.to_be_bytes());
    buf[20..24].copy_from_slice(&(tid_b.len() as u32).to_be_bytes());
    buf.extend_from_slice(&tid_b);

    assert_eq!(
        dev.pr_out(OutAction::RegisterAndMove, &a, &cdb(0), &buf, None),
        Err(CmdFail::ReservationConflict)
    );
}

#[test]
fn preempt_and_abort_aborts_and_completes() {
    let hooks = Arc::new(Hooks::default());
    let dev = Device::new("disk0", DeviceOptions::default(), hooks.clone());
    let a = attach(&dev, "iqn.a", 1);
    let b = attach(&dev, "iqn.b", 2);

    register(&dev, &a, 1);
    register(&dev, &b, 2);
    reserve(&dev, &a, 1, PrType::WriteExclusive);

    let counter = PrAbortCounter::new();
    dev.pr_out(
        OutAction::PreemptAndAbort,
        &b,
        &cdb(PrType::WriteExclusive.as_u8()),
        &params(2, 1, 0),
        Some(&counter),
    )
    .unwrap();

    assert_eq!(*hooks.aborts.lock(), vec![1]);
    assert!(!a.is_registered());
    assert!(dev.is_cmd_allowed(&b, CmdFlags::empty()));
    // The dispatcher's completion reference is the last one standing
    assert!(counter.command_done());
}

#[test]
fn generation_counts_only_registration_mutations() {
    let dev = Device::new("disk0", DeviceOptions::default(), Arc::new(Hooks::default()));
    let a = attach(&dev, "iqn.a", 1);
    let b = attach(&dev, "iqn.b", 1);

    register(&dev, &a, 1); // 1
    register(&dev, &b, 2); // 2
    reserve(&dev, &a, 1, PrType::WriteExclusive); // still 2
    assert_eq!(dev.generation(), 2);

    dev.pr_out(
        OutAction::Release,
        &a,
        &cdb(PrType::WriteExclusive.as_u8()),
        &params(1, 0, 0),
        None,
    )
    .unwrap(); // still 2
    assert_eq!(dev.generation(), 2);

    let mut buf = [0u8; 64];
    dev.pr_in(InAction::ReadKeys, &mut buf);
    dev.pr_in(InAction::ReadFullStatus, &mut buf);
    assert_eq!(dev.generation(), 2);

    dev.pr_out(OutAction::Clear, &b, &cdb(0), &params(2, 0, 0), None)
        .unwrap(); // 3
    assert_eq!(dev.generation(), 3);
}

#[test]
fn detached_session_keeps_its_registration() {
    let dev = Device::new("disk0", DeviceOptions::default(), Arc::new(Hooks::default()));
    let a = attach(&dev, "iqn.a", 1);
    register(&dev, &a, 0x1111);

    dev.detach_nexus(&a);
    assert!(!a.is_registered());

    // The registration is still there and rebinds on the next login
    let mut buf = [0u8; 32];
    let len = dev.pr_in(InAction::ReadKeys, &mut buf);
    assert_eq!(len, 16);

    let a2 = attach(&dev, "iqn.a", 1);
    assert!(a2.is_registered());

    // And the returning session can release its registration
    dev.pr_out(OutAction::Register, &a2, &cdb(0), &params(0x1111, 0, 0), None)
        .unwrap();
    assert_eq!(dev.pr_in(InAction::ReadKeys, &mut buf), 8);
}

#[test]
fn cluster_mode_reports_unsupported() {
    let dev = Device::new("disk0", DeviceOptions::default(), Arc::new(Hooks::default()));
    assert!(dev.set_cluster_mode(false, "").is_ok());
    assert!(dev.set_cluster_mode(true, "disk0-cl").is_err());
    // Falls back to single-node and keeps working
    let a = attach(&dev, "iqn.a", 1);
    register(&dev, &a, 0x1111);
    assert_eq!(dev.generation(), 1);
}
