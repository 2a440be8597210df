//! USB device object tree
//!
//! Built once during control bring-up from the raw descriptors the
//! device-side proxy returns, then read-only for the rest of the relay
//! session; the active-configuration index is the only part that changes,
//! when the host issues SET_CONFIGURATION.

use crate::descriptor::{
    ConfigurationDescriptor, DeviceDescriptor, DeviceQualifierDescriptor, EndpointDescriptor,
    InterfaceDescriptor, DT_ENDPOINT, DT_INTERFACE,
};
use crate::error::ModelError;
use crate::packet::{Direction, TransferKind};
use serde::{Deserialize, Serialize};

/// One endpoint of an interface alternate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    descriptor: EndpointDescriptor,
}

impl Endpoint {
    pub fn new(descriptor: EndpointDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    pub fn address(&self) -> u8 {
        self.descriptor.endpoint_address
    }

    pub fn number(&self) -> u8 {
        self.descriptor.number()
    }

    pub fn direction(&self) -> Direction {
        self.descriptor.direction()
    }

    pub fn transfer_kind(&self) -> TransferKind {
        self.descriptor.transfer_kind()
    }

    pub fn is_isochronous(&self) -> bool {
        self.descriptor.is_isochronous()
    }

    pub fn max_packet_size(&self) -> u16 {
        self.descriptor.max_packet_size
    }
}

/// One interface alternate setting with its endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    descriptor: InterfaceDescriptor,
    endpoints: Vec<Endpoint>,
}

impl Interface {
    pub fn descriptor(&self) -> &InterfaceDescriptor {
        &self.descriptor
    }

    pub fn number(&self) -> u8 {
        self.descriptor.interface_number
    }

    pub fn alternate_setting(&self) -> u8 {
        self.descriptor.alternate_setting
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }
}

/// A configuration with every interface alternate it declares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    descriptor: ConfigurationDescriptor,
    interfaces: Vec<Interface>,
}

impl Configuration {
    /// Parse a full configuration blob: the 9-byte header followed by the
    /// interface and endpoint descriptors of every alternate setting.
    /// Class-specific descriptors interleaved in the stream are skipped.
    pub fn parse(bytes: &[u8]) -> Result<Self, ModelError> {
        let descriptor = ConfigurationDescriptor::parse(bytes)?;
        let mut interfaces: Vec<Interface> = Vec::new();

        let mut offset = ConfigurationDescriptor::LENGTH;
        while offset + 2 <= bytes.len() {
            let length = bytes[offset] as usize;
            if length < 2 || offset + length > bytes.len() {
                return Err(ModelError::Truncated {
                    needed: offset + length.max(2),
                    available: bytes.len(),
                });
            }
            let body = &bytes[offset..offset + length];
            match body[1] {
                DT_INTERFACE => interfaces.push(Interface {
                    descriptor: InterfaceDescriptor::parse(body)?,
                    endpoints: Vec::new(),
                }),
                DT_ENDPOINT => {
                    let endpoint = Endpoint::new(EndpointDescriptor::parse(body)?);
                    interfaces
                        .last_mut()
                        .ok_or(ModelError::OrphanEndpoint)?
                        .endpoints
                        .push(endpoint);
                }
                _ => {}
            }
            offset += length;
        }

        Ok(Self {
            descriptor,
            interfaces,
        })
    }

    pub fn descriptor(&self) -> &ConfigurationDescriptor {
        &self.descriptor
    }

    pub fn value(&self) -> u8 {
        self.descriptor.configuration_value
    }

    pub fn num_interfaces(&self) -> u8 {
        self.descriptor.num_interfaces
    }

    /// Every interface alternate, in descriptor order
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }
}

/// The other-speed view of a dual-speed device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceQualifier {
    descriptor: DeviceQualifierDescriptor,
    configurations: Vec<Configuration>,
}

impl DeviceQualifier {
    pub fn new(descriptor: DeviceQualifierDescriptor, configurations: Vec<Configuration>) -> Self {
        Self {
            descriptor,
            configurations,
        }
    }

    pub fn descriptor(&self) -> &DeviceQualifierDescriptor {
        &self.descriptor
    }

    pub fn configuration_by_value(&self, value: u8) -> Option<&Configuration> {
        self.configurations.iter().find(|c| c.value() == value)
    }
}

/// The proxied device: descriptor, configurations, optional qualifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    descriptor: DeviceDescriptor,
    configurations: Vec<Configuration>,
    qualifier: Option<DeviceQualifier>,
    active: usize,
    high_speed: bool,
}

impl Device {
    pub fn new(
        descriptor: DeviceDescriptor,
        configurations: Vec<Configuration>,
        qualifier: Option<DeviceQualifier>,
        high_speed: bool,
    ) -> Result<Self, ModelError> {
        if configurations.is_empty() {
            return Err(ModelError::NoConfigurations);
        }
        Ok(Self {
            descriptor,
            configurations,
            qualifier,
            active: 0,
            high_speed,
        })
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations
    }

    pub fn configuration_by_value(&self, value: u8) -> Option<&Configuration> {
        self.configurations.iter().find(|c| c.value() == value)
    }

    /// The configuration the host last selected (the first one until a
    /// SET_CONFIGURATION is observed)
    pub fn active_configuration(&self) -> &Configuration {
        &self.configurations[self.active]
    }

    /// Select the active configuration by bConfigurationValue
    pub fn set_active_configuration(&mut self, value: u8) -> Result<(), ModelError> {
        let index = self
            .configurations
            .iter()
            .position(|c| c.value() == value)
            .ok_or(ModelError::UnknownConfiguration { value })?;
        self.active = index;
        Ok(())
    }

    pub fn qualifier(&self) -> Option<&DeviceQualifier> {
        self.qualifier.as_ref()
    }

    pub fn is_high_speed(&self) -> bool {
        self.high_speed
    }

    /// One-line rendering used by setup logging
    pub fn summary(&self) -> String {
        format!(
            "{:04x}:{:04x} usb {:x}.{:02x}, {} configuration(s), {}",
            self.descriptor.vendor_id,
            self.descriptor.product_id,
            self.descriptor.usb_version >> 8,
            self.descriptor.usb_version & 0xff,
            self.configurations.len(),
            if self.high_speed {
                "high-speed"
            } else {
                "full-speed"
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_bytes() -> Vec<u8> {
        vec![
            0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01,
            0x01, 0x02, 0x03, 0x01,
        ]
    }

    fn config_bytes() -> Vec<u8> {
        vec![
            // configuration
            0x09, 0x02, 0x19, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, //
            // interface 0 alt 0
            0x09, 0x04, 0x00, 0x00, 0x01, 0xff, 0x00, 0x00, 0x00, //
            // bulk IN endpoint 0x81
            0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00,
        ]
    }

    #[test]
    fn test_parse_configuration_tree() {
        let cfg = Configuration::parse(&config_bytes()).unwrap();
        assert_eq!(cfg.value(), 1);
        assert_eq!(cfg.num_interfaces(), 1);
        assert_eq!(cfg.interfaces().len(), 1);

        let interface = &cfg.interfaces()[0];
        assert_eq!(interface.number(), 0);
        assert_eq!(interface.alternate_setting(), 0);
        assert_eq!(interface.endpoints().len(), 1);

        let ep = &interface.endpoints()[0];
        assert_eq!(ep.address(), 0x81);
        assert_eq!(ep.transfer_kind(), TransferKind::Bulk);
        assert!(!ep.is_isochronous());
    }

    #[test]
    fn test_parse_configuration_skips_class_specific() {
        let mut bytes = config_bytes();
        // splice a fake class-specific descriptor between interface and
        // endpoint
        bytes.splice(18..18, [0x05u8, 0x24, 0x00, 0x10, 0x01]);
        bytes[2] = bytes.len() as u8;
        let cfg = Configuration::parse(&bytes).unwrap();
        assert_eq!(cfg.interfaces()[0].endpoints().len(), 1);
    }

    #[test]
    fn test_parse_configuration_orphan_endpoint() {
        let mut bytes = vec![0x09, 0x02, 0x10, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32];
        bytes.extend_from_slice(&[0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00]);
        assert!(matches!(
            Configuration::parse(&bytes),
            Err(ModelError::OrphanEndpoint)
        ));
    }

    #[test]
    fn test_parse_configuration_alternates() {
        let mut bytes = vec![
            0x09, 0x02, 0x00, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, //
            0x09, 0x04, 0x00, 0x00, 0x00, 0xff, 0x00, 0x00, 0x00, //
            0x09, 0x04, 0x00, 0x01, 0x01, 0xff, 0x00, 0x00, 0x00, //
            0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x00,
        ];
        bytes[2] = bytes.len() as u8;
        let cfg = Configuration::parse(&bytes).unwrap();
        assert_eq!(cfg.interfaces().len(), 2);
        assert_eq!(cfg.interfaces()[1].alternate_setting(), 1);
        assert_eq!(cfg.interfaces()[1].endpoints()[0].address(), 0x02);
    }

    #[test]
    fn test_device_active_configuration() {
        let descriptor = DeviceDescriptor::parse(&device_bytes()).unwrap();
        let cfg = Configuration::parse(&config_bytes()).unwrap();
        let mut device = Device::new(descriptor, vec![cfg], None, true).unwrap();

        assert_eq!(device.active_configuration().value(), 1);
        assert!(device.set_active_configuration(1).is_ok());
        assert!(matches!(
            device.set_active_configuration(9),
            Err(ModelError::UnknownConfiguration { value: 9 })
        ));
        assert!(device.is_high_speed());
    }

    #[test]
    fn test_device_requires_configuration() {
        let descriptor = DeviceDescriptor::parse(&device_bytes()).unwrap();
        assert!(matches!(
            Device::new(descriptor, Vec::new(), None, false),
            Err(ModelError::NoConfigurations)
        ));
    }

    #[test]
    fn test_device_summary() {
        let descriptor = DeviceDescriptor::parse(&device_bytes()).unwrap();
        let cfg = Configuration::parse(&config_bytes()).unwrap();
        let device = Device::new(descriptor, vec![cfg], None, true).unwrap();
        let summary = device.summary();
        assert!(summary.contains("1234:5678"));
        assert!(summary.contains("high-speed"));
    }
}
