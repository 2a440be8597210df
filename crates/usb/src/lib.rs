//! USB descriptor object model for the MITM relay
//!
//! This crate defines the read-only view of the proxied device that the
//! relay core works against: raw descriptors parsed from the bytes a
//! device-side proxy returns, the Device/Configuration/Interface/Endpoint
//! object tree built from them, and the packet types relayed between the
//! two sides.

pub mod descriptor;
pub mod device;
pub mod error;
pub mod packet;

pub use descriptor::{
    ConfigurationDescriptor, DeviceDescriptor, DeviceQualifierDescriptor, EndpointDescriptor,
    InterfaceDescriptor,
};
pub use device::{Configuration, Device, DeviceQualifier, Endpoint, Interface};
pub use error::{ModelError, Result};
pub use packet::{Direction, Packet, SetupPacket, TransferKind};
