//! Relay writers
//!
//! A writer drains its endpoint queue, runs each packet through its bound
//! filter chain, merges injected packets from its auxiliary input, and
//! writes the survivors to the sink proxy. FIFO is preserved within each
//! of the two sources; their interleaving is whatever the loop observes.
//!
//! The EP0 form additionally pumps the data stage of IN control transfers
//! back toward the host, and watches for a successfully relayed
//! SET_CONFIGURATION to trigger data-endpoint bring-up through a
//! non-owning reference to the manager.

use crate::filter::{FilterAction, PacketFilter};
use crate::manager::RelayInner;
use crate::proxy::ProxyHandle;
use crate::queue::{packet_queue, PacketReceiver, PacketSender, PopResult, PushResult};
use crate::state::StopFlag;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, trace, warn};
use usb::device::Endpoint;
use usb::packet::Direction;
use usb::Packet;

/// Bounded number of poll rounds the EP0 writer waits for a control
/// response from the device
const RESPONSE_POLL_ROUNDS: usize = 50;

/// EP0-only hooks back into the rest of the relay
pub(crate) struct Ep0Link {
    /// Non-owning back-reference; severed when teardown joins this writer
    pub(crate) manager: Weak<RelayInner>,
    /// Device-to-host queue toward the EP0 reader
    pub(crate) response_tx: PacketSender,
}

pub struct RelayWriter {
    endpoint: u8,
    sink: ProxyHandle,
    input: PacketReceiver,
    aux_rx: PacketReceiver,
    aux_tx: PacketSender,
    filters: Vec<Arc<dyn PacketFilter>>,
    ep0: Option<Ep0Link>,
    stop: StopFlag,
    tick: Duration,
}

impl RelayWriter {
    /// Writer for a unidirectional data endpoint
    pub fn new(
        endpoint: &Endpoint,
        sink: ProxyHandle,
        input: PacketReceiver,
        aux_capacity: usize,
        tick: Duration,
    ) -> Self {
        let (aux_tx, aux_rx) = packet_queue(aux_capacity);
        Self {
            endpoint: endpoint.address(),
            sink,
            input,
            aux_rx,
            aux_tx,
            filters: Vec::new(),
            ep0: None,
            stop: StopFlag::new(),
            tick,
        }
    }

    /// The EP0 form, writing to the device side and reporting back
    pub(crate) fn ep0(
        endpoint: &Endpoint,
        device: ProxyHandle,
        input: PacketReceiver,
        response_tx: PacketSender,
        manager: Weak<RelayInner>,
        aux_capacity: usize,
        tick: Duration,
    ) -> Self {
        let mut writer = Self::new(endpoint, device, input, aux_capacity, tick);
        writer.ep0 = Some(Ep0Link {
            manager,
            response_tx,
        });
        writer
    }

    /// Bind one more filter; only called while the writer is not running
    pub fn add_filter(&mut self, filter: Arc<dyn PacketFilter>) {
        self.filters.push(filter);
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    /// Sender handle for injector threads posting into this writer
    pub fn injection_sender(&self) -> PacketSender {
        self.aux_tx.clone()
    }

    /// Handle the manager keeps to signal this writer after spawn
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Drain until stopped or the transport dies
    pub fn run(self) {
        trace!(
            "Writer for endpoint {:#04x} ({} side, {} filters) starting",
            self.endpoint,
            self.sink.label(),
            self.filters.len()
        );
        while !self.stop.is_set() {
            // injected packets first; FIFO within the auxiliary source
            while let Some(packet) = self.aux_rx.try_pop() {
                self.deliver(packet);
                if self.stop.is_set() {
                    break;
                }
            }
            if self.stop.is_set() {
                break;
            }
            match self.input.pop_timeout(self.tick) {
                PopResult::Packet(packet) => self.deliver(packet),
                PopResult::Empty => {}
                PopResult::Closed => {
                    debug!("Writer {:#04x}: queue closed", self.endpoint);
                    break;
                }
            }
        }
        trace!("Writer for endpoint {:#04x} stopped", self.endpoint);
    }

    fn deliver(&self, packet: Packet) {
        for packet in self.apply_filters(packet) {
            if self.stop.is_set() {
                return;
            }
            self.write_packet(packet);
        }
    }

    /// Run the chain in registration order. Mutations compose; inserted
    /// packets are written ahead of the packet that produced them; a drop
    /// removes the packet and closes the gap.
    fn apply_filters(&self, packet: Packet) -> Vec<Packet> {
        let mut ahead = Vec::new();
        let mut packet = packet;
        for filter in &self.filters {
            match filter.filter(&packet) {
                FilterAction::Pass => {}
                FilterAction::Drop => {
                    trace!("Writer {:#04x}: packet dropped by filter", self.endpoint);
                    return ahead;
                }
                FilterAction::Mutate(payload) => packet.payload = payload,
                FilterAction::InsertBefore(extra) => ahead.push(extra),
            }
        }
        ahead.push(packet);
        ahead
    }

    fn write_packet(&self, packet: Packet) {
        match self.sink.write(self.endpoint, &packet) {
            Ok(()) => {
                if let Some(ep0) = &self.ep0 {
                    self.after_control_write(ep0, &packet);
                }
            }
            Err(e) if e.is_fatal() => {
                error!("Writer {:#04x}: {}; stopping", self.endpoint, e);
                self.stop.set();
            }
            Err(e) => warn!("Writer {:#04x}: {}", self.endpoint, e),
        }
    }

    /// EP0 post-write hooks: pump the data stage of IN requests back to
    /// the host, then fan out data bring-up after SET_CONFIGURATION
    fn after_control_write(&self, ep0: &Ep0Link, packet: &Packet) {
        let Some(setup) = packet.setup() else {
            return;
        };
        if setup.direction() == Direction::In && setup.length > 0 {
            self.pump_response(ep0);
        }
        if setup.is_set_configuration() {
            let value = setup.configuration_value();
            debug!("EP0 writer observed SET_CONFIGURATION({})", value);
            match ep0.manager.upgrade() {
                Some(inner) => inner.set_config(value),
                None => warn!("EP0 writer: manager already gone"),
            }
        }
    }

    /// Read the device's answer to an IN control transfer and queue it
    /// toward the host; gives up after a bounded number of polls
    fn pump_response(&self, ep0: &Ep0Link) {
        for _ in 0..RESPONSE_POLL_ROUNDS {
            if self.stop.is_set() {
                return;
            }
            match self.sink.read(self.endpoint) {
                Ok(Some(packet)) => {
                    self.queue_response(ep0, packet);
                    return;
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    error!("EP0 writer: {}; stopping", e);
                    self.stop.set();
                    return;
                }
                Err(e) => {
                    warn!("EP0 writer: response read failed: {}", e);
                    return;
                }
            }
        }
        warn!("EP0 writer: no response from device within poll budget");
    }

    fn queue_response(&self, ep0: &Ep0Link, packet: Packet) {
        let mut packet = packet;
        loop {
            if self.stop.is_set() {
                return;
            }
            match ep0.response_tx.push_timeout(packet, self.tick) {
                PushResult::Sent => return,
                PushResult::Full(p) => packet = p,
                PushResult::Closed(_) => {
                    debug!("EP0 writer: response queue closed");
                    self.stop.set();
                    return;
                }
            }
        }
    }
}
