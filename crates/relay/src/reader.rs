//! Relay readers
//!
//! A reader pumps packets from one side's proxy into its endpoint queue
//! until it is told to stop. The EP0 form is bidirectional: besides
//! pumping host requests toward the device, it drains the device-to-host
//! queue (filled by the EP0 writer with control responses) back to the
//! host proxy.
//!
//! Non-fatal proxy errors are logged and the loop continues; a fatal
//! transport error sets the local stop flag and the loop exits cleanly.
//! The manager's next teardown joins the finished thread as usual.

use crate::proxy::ProxyHandle;
use crate::queue::{PacketReceiver, PacketSender, PushResult};
use crate::state::StopFlag;
use std::time::Duration;
use tracing::{debug, error, trace, warn};
use usb::device::Endpoint;
use usb::Packet;

pub struct RelayReader {
    endpoint: u8,
    source: ProxyHandle,
    output: PacketSender,
    /// EP0 only: control responses flowing back to the host
    ep0_return: Option<PacketReceiver>,
    stop: StopFlag,
    tick: Duration,
}

impl RelayReader {
    /// Reader for a unidirectional data endpoint
    pub fn new(
        endpoint: &Endpoint,
        source: ProxyHandle,
        output: PacketSender,
        tick: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.address(),
            source,
            output,
            ep0_return: None,
            stop: StopFlag::new(),
            tick,
        }
    }

    /// The bidirectional EP0 form: host requests flow out through
    /// `output`, device responses come back through `ep0_return`
    pub fn ep0(
        endpoint: &Endpoint,
        host: ProxyHandle,
        output: PacketSender,
        ep0_return: PacketReceiver,
        tick: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.address(),
            source: host,
            output,
            ep0_return: Some(ep0_return),
            stop: StopFlag::new(),
            tick,
        }
    }

    /// Handle the manager keeps to signal this reader after spawn
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Pump until stopped or the transport dies
    pub fn run(self) {
        trace!(
            "Reader for endpoint {:#04x} ({} side) starting",
            self.endpoint,
            self.source.label()
        );
        while !self.stop.is_set() {
            if let Some(returns) = &self.ep0_return {
                while let Some(packet) = returns.try_pop() {
                    self.return_to_source(packet);
                    if self.stop.is_set() {
                        break;
                    }
                }
                if self.stop.is_set() {
                    break;
                }
            }
            match self.source.read(self.endpoint) {
                Ok(Some(packet)) => self.forward(packet),
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    error!("Reader {:#04x}: {}; stopping", self.endpoint, e);
                    self.stop.set();
                }
                Err(e) => warn!("Reader {:#04x}: {}", self.endpoint, e),
            }
        }
        trace!("Reader for endpoint {:#04x} stopped", self.endpoint);
    }

    /// Push into the queue, blocking one tick at a time so a stop request
    /// is observed within one queue operation
    fn forward(&self, packet: Packet) {
        let mut packet = packet;
        loop {
            if self.stop.is_set() {
                return;
            }
            match self.output.push_timeout(packet, self.tick) {
                PushResult::Sent => return,
                PushResult::Full(p) => packet = p,
                PushResult::Closed(_) => {
                    debug!("Reader {:#04x}: queue closed", self.endpoint);
                    self.stop.set();
                    return;
                }
            }
        }
    }

    /// EP0: deliver a control response back to the host side
    fn return_to_source(&self, packet: Packet) {
        match self.source.write(self.endpoint, &packet) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                error!("Reader {:#04x}: {}; stopping", self.endpoint, e);
                self.stop.set();
            }
            Err(e) => warn!("Reader {:#04x}: {}", self.endpoint, e),
        }
    }
}
