//! Packet filters
//!
//! A filter is bound to a writer during bring-up when its predicates
//! accept the device, configuration, interface and endpoint of the slot;
//! the writer then runs every packet through its chain in registration
//! order. EP0 binding only consults the device and endpoint predicates,
//! since the synthetic control endpoint belongs to no interface.

use crate::registry::Registry;
use usb::device::{Configuration, Device, Endpoint, Interface};
use usb::Packet;

/// What a filter decided about one packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterAction {
    /// Forward unchanged
    Pass,
    /// Remove the packet from the stream
    Drop,
    /// Replace the payload and continue down the chain
    Mutate(Vec<u8>),
    /// Emit an extra packet ahead of this one; the inserted packet is
    /// written as-is, without re-entering the chain
    InsertBefore(Packet),
}

/// Synchronous packet inspector bound to matching writers
pub trait PacketFilter: Send + Sync {
    fn matches_device(&self, _device: &Device) -> bool {
        true
    }

    fn matches_configuration(&self, _configuration: &Configuration) -> bool {
        true
    }

    fn matches_interface(&self, _interface: &Interface) -> bool {
        true
    }

    fn matches_endpoint(&self, _endpoint: &Endpoint) -> bool {
        true
    }

    /// Inspect one packet about to be written to the sink
    fn filter(&self, packet: &Packet) -> FilterAction;
}

/// Ordered filter registry
pub type FilterRegistry = Registry<dyn PacketFilter>;
