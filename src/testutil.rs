//! Shared fixtures for the unit tests: an in-memory hooks implementation
//! that records unit attentions and aborts, plus TransportID builders.

use std::sync::Arc;

use crate::pr::transport_id;
use crate::target::hooks::{AbortDispatchError, ExternalHooks};
use crate::target::{Device, DeviceOptions, ItNexus, PrAbortCounter};

#[derive(Default)]
pub(crate) struct TestHooks {
    pub local_ports: Vec<u16>,
    pub remote_ports: Vec<u16>,
    pub uas: spin::Mutex<Vec<(String, Vec<u8>)>>,
    pub aborts: spin::Mutex<Vec<String>>,
}

impl TestHooks {
    /// Queued UAs as (initiator name, asc, ascq), fixed-format sense
    pub fn ua_codes(&self) -> Vec<(String, u8, u8)> {
        self.uas
            .lock()
            .iter()
            .map(|(who, sense)| (who.clone(), sense[12], sense[13]))
            .collect()
    }
}

impl ExternalHooks for TestHooks {
    fn local_target_ports(&self, _protocol: u8) -> Vec<u16> {
        self.local_ports.clone()
    }

    fn remote_target_ports(&self) -> Vec<u16> {
        self.remote_ports.clone()
    }

    fn queue_ua(&self, nexus: &Arc<ItNexus>, sense: &[u8]) {
        self.uas.lock().push((
            transport_id::initiator_name(nexus.transport_id()),
            sense.to_vec(),
        ));
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
        self.aborts
            .lock()
            .push(transport_id::initiator_name(nexus.transport_id()));
        Ok(())
    }
}

pub(crate) fn iscsi_tid(name: &str) -> Vec<u8> {
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

pub(crate) fn device_with_hooks(hooks: Arc<TestHooks>) -> Device {
    Device::new("disk0", DeviceOptions::default(), hooks)
}

/// A device plus an attached nexus for the given initiator
pub(crate) fn nexus(dev: &Device, name: &str, rel_tgt_id: u16) -> Arc<ItNexus> {
    let n = ItNexus::new(&iscsi_tid(name), rel_tgt_id, 0).unwrap();
    dev.attach_nexus(&n);
    n
}
