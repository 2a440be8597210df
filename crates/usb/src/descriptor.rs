//! Raw USB descriptor structures
//!
//! Thin parsed views of the wire-format descriptors from USB 2.0 chapter 9.
//! Parsing works on plain byte slices so the same code serves blobs fetched
//! through a device proxy and literal fixtures in tests. Only the fields the
//! relay needs are kept; class-specific descriptors are skipped by the
//! configuration walker in `device`.

use crate::error::ModelError;
use crate::packet::{Direction, TransferKind};
use serde::{Deserialize, Serialize};

/// Descriptor type codes (bDescriptorType)
pub const DT_DEVICE: u8 = 0x01;
pub const DT_CONFIGURATION: u8 = 0x02;
pub const DT_STRING: u8 = 0x03;
pub const DT_INTERFACE: u8 = 0x04;
pub const DT_ENDPOINT: u8 = 0x05;
pub const DT_DEVICE_QUALIFIER: u8 = 0x06;
pub const DT_OTHER_SPEED_CONFIGURATION: u8 = 0x07;

/// Direction bit of bEndpointAddress
pub const ENDPOINT_DIR_IN: u8 = 0x80;
/// Endpoint-number bits of bEndpointAddress
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0f;
/// Transfer-type bits of bmAttributes
pub const TRANSFER_TYPE_MASK: u8 = 0x03;

fn require(bytes: &[u8], needed: usize) -> Result<(), ModelError> {
    if bytes.len() < needed {
        return Err(ModelError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

fn check_type(expected: u8, actual: u8) -> Result<(), ModelError> {
    if expected != actual {
        return Err(ModelError::UnexpectedType { expected, actual });
    }
    Ok(())
}

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// Standard device descriptor (18 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const LENGTH: usize = 18;

    pub fn parse(bytes: &[u8]) -> Result<Self, ModelError> {
        require(bytes, Self::LENGTH)?;
        check_type(DT_DEVICE, bytes[1])?;
        Ok(Self {
            usb_version: u16_at(bytes, 2),
            device_class: bytes[4],
            device_subclass: bytes[5],
            device_protocol: bytes[6],
            max_packet_size_0: bytes[7],
            vendor_id: u16_at(bytes, 8),
            product_id: u16_at(bytes, 10),
            device_version: u16_at(bytes, 12),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_index: bytes[16],
            num_configurations: bytes[17],
        })
    }
}

/// Configuration descriptor header (9 bytes); the same layout serves
/// other-speed configurations (type 0x07)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationDescriptor {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub description_index: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl ConfigurationDescriptor {
    pub const LENGTH: usize = 9;

    pub fn parse(bytes: &[u8]) -> Result<Self, ModelError> {
        require(bytes, Self::LENGTH)?;
        if bytes[1] != DT_CONFIGURATION && bytes[1] != DT_OTHER_SPEED_CONFIGURATION {
            return Err(ModelError::UnexpectedType {
                expected: DT_CONFIGURATION,
                actual: bytes[1],
            });
        }
        Ok(Self {
            total_length: u16_at(bytes, 2),
            num_interfaces: bytes[4],
            configuration_value: bytes[5],
            description_index: bytes[6],
            attributes: bytes[7],
            max_power: bytes[8],
        })
    }
}

/// Interface descriptor (9 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub description_index: u8,
}

impl InterfaceDescriptor {
    pub const LENGTH: usize = 9;

    pub fn parse(bytes: &[u8]) -> Result<Self, ModelError> {
        require(bytes, Self::LENGTH)?;
        check_type(DT_INTERFACE, bytes[1])?;
        Ok(Self {
            interface_number: bytes[2],
            alternate_setting: bytes[3],
            num_endpoints: bytes[4],
            interface_class: bytes[5],
            interface_subclass: bytes[6],
            interface_protocol: bytes[7],
            description_index: bytes[8],
        })
    }
}

/// Endpoint descriptor (7 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub const LENGTH: usize = 7;

    pub fn parse(bytes: &[u8]) -> Result<Self, ModelError> {
        require(bytes, Self::LENGTH)?;
        check_type(DT_ENDPOINT, bytes[1])?;
        Ok(Self {
            endpoint_address: bytes[2],
            attributes: bytes[3],
            max_packet_size: u16_at(bytes, 4),
            interval: bytes[6],
        })
    }

    /// The synthetic descriptor for the control endpoint: address 0,
    /// attributes 0, wMaxPacketSize taken from the device's
    /// bMaxPacketSize0
    pub fn ep0(max_packet_size: u16) -> Self {
        Self {
            endpoint_address: 0,
            attributes: 0,
            max_packet_size,
            interval: 0,
        }
    }

    pub fn number(&self) -> u8 {
        self.endpoint_address & ENDPOINT_NUMBER_MASK
    }

    pub fn direction(&self) -> Direction {
        Direction::from_address(self.endpoint_address)
    }

    pub fn transfer_kind(&self) -> TransferKind {
        TransferKind::from_attributes(self.attributes)
    }

    pub fn is_isochronous(&self) -> bool {
        self.transfer_kind() == TransferKind::Isochronous
    }

    /// Wire form, including bLength and bDescriptorType
    pub fn to_bytes(&self) -> [u8; 7] {
        let size = self.max_packet_size.to_le_bytes();
        [
            Self::LENGTH as u8,
            DT_ENDPOINT,
            self.endpoint_address,
            self.attributes,
            size[0],
            size[1],
            self.interval,
        ]
    }
}

/// Device qualifier descriptor (10 bytes), present on dual-speed devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceQualifierDescriptor {
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size_0: u8,
    pub num_configurations: u8,
}

impl DeviceQualifierDescriptor {
    pub const LENGTH: usize = 10;

    pub fn parse(bytes: &[u8]) -> Result<Self, ModelError> {
        require(bytes, Self::LENGTH)?;
        check_type(DT_DEVICE_QUALIFIER, bytes[1])?;
        Ok(Self {
            usb_version: u16_at(bytes, 2),
            device_class: bytes[4],
            device_subclass: bytes[5],
            device_protocol: bytes[6],
            max_packet_size_0: bytes[7],
            num_configurations: bytes[8],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: [u8; 18] = [
        0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 0x01,
        0x02, 0x03, 0x01,
    ];

    #[test]
    fn test_parse_device_descriptor() {
        let desc = DeviceDescriptor::parse(&DEVICE).unwrap();
        assert_eq!(desc.usb_version, 0x0200);
        assert_eq!(desc.max_packet_size_0, 64);
        assert_eq!(desc.vendor_id, 0x1234);
        assert_eq!(desc.product_id, 0x5678);
        assert_eq!(desc.num_configurations, 1);
    }

    #[test]
    fn test_parse_device_descriptor_truncated() {
        let err = DeviceDescriptor::parse(&DEVICE[..9]).unwrap_err();
        assert!(matches!(
            err,
            ModelError::Truncated {
                needed: 18,
                available: 9
            }
        ));
    }

    #[test]
    fn test_parse_device_descriptor_wrong_type() {
        let mut bytes = DEVICE;
        bytes[1] = DT_CONFIGURATION;
        assert!(matches!(
            DeviceDescriptor::parse(&bytes),
            Err(ModelError::UnexpectedType { .. })
        ));
    }

    #[test]
    fn test_parse_endpoint_descriptor() {
        let bytes = [0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00];
        let desc = EndpointDescriptor::parse(&bytes).unwrap();
        assert_eq!(desc.endpoint_address, 0x81);
        assert_eq!(desc.number(), 1);
        assert_eq!(desc.direction(), Direction::In);
        assert_eq!(desc.transfer_kind(), TransferKind::Bulk);
        assert_eq!(desc.max_packet_size, 64);
        assert_eq!(desc.to_bytes(), bytes);
    }

    #[test]
    fn test_ep0_descriptor() {
        let ep0 = EndpointDescriptor::ep0(64);
        assert_eq!(ep0.endpoint_address, 0);
        assert_eq!(ep0.attributes, 0);
        assert_eq!(ep0.transfer_kind(), TransferKind::Control);
        assert_eq!(ep0.to_bytes()[0], 7);
        assert_eq!(ep0.to_bytes()[1], DT_ENDPOINT);
    }

    #[test]
    fn test_parse_configuration_header_accepts_other_speed() {
        let bytes = [0x09, 0x07, 0x19, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32];
        let desc = ConfigurationDescriptor::parse(&bytes).unwrap();
        assert_eq!(desc.total_length, 25);
        assert_eq!(desc.configuration_value, 1);
    }

    #[test]
    fn test_parse_device_qualifier() {
        let bytes = [0x0a, 0x06, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x01, 0x00];
        let desc = DeviceQualifierDescriptor::parse(&bytes).unwrap();
        assert_eq!(desc.max_packet_size_0, 64);
        assert_eq!(desc.num_configurations, 1);
    }
}
