//! Proxy contracts for the two USB transports
//!
//! The relay core never talks to hardware itself: a `DeviceProxy`
//! terminates the downstream physical device, a `HostProxy` presents the
//! cloned device to the upstream host. Both are shared by every worker
//! thread, so implementations must tolerate concurrent `read`/`write`
//! calls on distinct endpoint addresses.
//!
//! Reads return `Ok(None)` when nothing arrived within the transport's
//! internal poll timeout; that bound is what keeps every worker loop
//! responsive to a stop request within one proxy round-trip.

use crate::error::RelayError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use usb::descriptor::{DeviceDescriptor, DeviceQualifierDescriptor};
use usb::device::{Configuration, Device, DeviceQualifier};
use usb::Packet;

/// Errors reported by proxy implementations
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The transport went away for good; the affected worker must stop
    #[error("Transport disconnected: {0}")]
    Disconnected(String),

    /// The endpoint refused the transfer
    #[error("Endpoint {endpoint:#04x} stalled")]
    Stall { endpoint: u8 },

    /// Recoverable transfer failure
    #[error("Proxy I/O error: {0}")]
    Io(String),
}

impl ProxyError {
    /// Whether a worker should give up its loop over this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProxyError::Disconnected(_))
    }
}

/// Result of a connect attempt; timeouts are retried by the setup loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    TimedOut,
}

/// The downstream side: speaks to the real device
pub trait DeviceProxy: Send + Sync {
    fn connect(&self) -> Result<ConnectStatus, ProxyError>;

    fn disconnect(&self);

    fn claim_interface(&self, interface: u8) -> Result<(), ProxyError>;

    fn release_interface(&self, interface: u8) -> Result<(), ProxyError>;

    /// Record which interface owns an endpoint address; some transports
    /// route transfers by interface
    fn set_endpoint_interface(&self, endpoint: u8, interface: u8);

    fn set_configuration(
        &self,
        active: &Configuration,
        other_speed: Option<&Configuration>,
        high_speed: bool,
    ) -> Result<(), ProxyError>;

    /// Raw 18-byte device descriptor
    fn device_descriptor(&self) -> Result<Vec<u8>, ProxyError>;

    /// Raw configuration blob: header plus interface and endpoint
    /// descriptors, by configuration index
    fn configuration_descriptor(&self, index: u8) -> Result<Vec<u8>, ProxyError>;

    /// Raw device qualifier, when the device is dual-speed
    fn device_qualifier(&self) -> Result<Option<Vec<u8>>, ProxyError>;

    /// Raw other-speed configuration blob, by index
    fn other_speed_configuration(&self, index: u8) -> Result<Option<Vec<u8>>, ProxyError>;

    fn is_high_speed(&self) -> bool;

    /// Blocking read with an internal poll timeout
    fn read(&self, endpoint: u8) -> Result<Option<Packet>, ProxyError>;

    fn write(&self, endpoint: u8, packet: &Packet) -> Result<(), ProxyError>;
}

/// The upstream side: presents the cloned device to the host
pub trait HostProxy: Send + Sync {
    /// Connect needs the device model so the transport can mirror its
    /// descriptors upstream
    fn connect(&self, device: &Device) -> Result<ConnectStatus, ProxyError>;

    fn disconnect(&self);

    fn set_configuration(
        &self,
        active: &Configuration,
        other_speed: Option<&Configuration>,
        high_speed: bool,
    ) -> Result<(), ProxyError>;

    /// Blocking read with an internal poll timeout
    fn read(&self, endpoint: u8) -> Result<Option<Packet>, ProxyError>;

    fn write(&self, endpoint: u8, packet: &Packet) -> Result<(), ProxyError>;
}

/// Either side of the relay, as seen by a worker that only moves packets
#[derive(Clone)]
pub enum ProxyHandle {
    Device(Arc<dyn DeviceProxy>),
    Host(Arc<dyn HostProxy>),
}

impl ProxyHandle {
    pub fn read(&self, endpoint: u8) -> Result<Option<Packet>, ProxyError> {
        match self {
            ProxyHandle::Device(proxy) => proxy.read(endpoint),
            ProxyHandle::Host(proxy) => proxy.read(endpoint),
        }
    }

    pub fn write(&self, endpoint: u8, packet: &Packet) -> Result<(), ProxyError> {
        match self {
            ProxyHandle::Device(proxy) => proxy.write(endpoint, packet),
            ProxyHandle::Host(proxy) => proxy.write(endpoint, packet),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProxyHandle::Device(_) => "device",
            ProxyHandle::Host(_) => "host",
        }
    }
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProxyHandle({})", self.label())
    }
}

/// Build the device model by querying descriptors through the device proxy
pub fn probe_device(proxy: &dyn DeviceProxy) -> Result<Device, RelayError> {
    let descriptor = DeviceDescriptor::parse(&proxy.device_descriptor()?)?;

    let mut configurations = Vec::with_capacity(descriptor.num_configurations as usize);
    for index in 0..descriptor.num_configurations {
        configurations.push(Configuration::parse(&proxy.configuration_descriptor(index)?)?);
    }

    let qualifier = match proxy.device_qualifier()? {
        Some(bytes) => {
            let qualifier_descriptor = DeviceQualifierDescriptor::parse(&bytes)?;
            let mut other_speed = Vec::with_capacity(qualifier_descriptor.num_configurations as usize);
            for index in 0..qualifier_descriptor.num_configurations {
                if let Some(bytes) = proxy.other_speed_configuration(index)? {
                    other_speed.push(Configuration::parse(&bytes)?);
                }
            }
            Some(DeviceQualifier::new(qualifier_descriptor, other_speed))
        }
        None => None,
    };

    let device = Device::new(
        descriptor,
        configurations,
        qualifier,
        proxy.is_high_speed(),
    )?;
    debug!("Probed device {}", device.summary());
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ProxyError::Disconnected("gone".into()).is_fatal());
        assert!(!ProxyError::Stall { endpoint: 0x81 }.is_fatal());
        assert!(!ProxyError::Io("busy".into()).is_fatal());
    }
}
