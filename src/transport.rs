//! The raw USB/HID driver collaborator (§6): produces/consumes 64-byte reports.
//! A physical driver is an external collaborator out of scope for this core (§1);
//! this module provides the in-process simulated driver used to run the core
//! end-to-end without real hardware.

use std::collections::VecDeque;

use anyhow::Result;

pub const REPORT_SIZE: usize = 64;

/// Narrow interface the core consumes (§6). Both ends are non-blocking: `recv_report`
/// returns `None` rather than waiting when nothing has arrived.
pub trait HidTransport {
    fn recv_report(&mut self) -> Option<[u8; REPORT_SIZE]>;
    fn send_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<()>;
}

/// An in-process HID driver stand-in. Reports queued with [`push_host_report`]
/// are handed back by [`recv_report`] in FIFO order, as if a host had just
/// written them to the device; reports the core sends are captured in order
/// instead of going out over USB, for the caller to inspect or reassemble.
///
/// [`push_host_report`]: SimulatedHidDriver::push_host_report
#[derive(Default)]
pub struct SimulatedHidDriver {
    inbound: VecDeque<[u8; REPORT_SIZE]>,
    outbound: Vec<[u8; REPORT_SIZE]>,
}

impl SimulatedHidDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_host_report(&mut self, report: [u8; REPORT_SIZE]) {
        self.inbound.push_back(report);
    }

    pub fn push_host_reports(&mut self, reports: impl IntoIterator<Item = [u8; REPORT_SIZE]>) {
        self.inbound.extend(reports);
    }

    /// Drains every report the core has emitted since the last call.
    pub fn take_outbound(&mut self) -> Vec<[u8; REPORT_SIZE]> {
        std::mem::take(&mut self.outbound)
    }
}

impl HidTransport for SimulatedHidDriver {
    fn recv_report(&mut self) -> Option<[u8; REPORT_SIZE]> {
        self.inbound.pop_front()
    }

    fn send_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<()> {
        log::trace!("hid report out: {:02x?}", &report[..8]);
        self.outbound.push(*report);
        Ok(())
    }
}
