//! Test utilities for the relay crates
//!
//! Provides literal descriptor bytes and packet builders used by unit and
//! integration tests across the workspace.
//!
//! # Example
//!
//! ```
//! use common::test_utils::mock_device_descriptor;
//!
//! let desc = mock_device_descriptor();
//! assert_eq!(desc.len(), 18);
//! assert_eq!(desc[7], 0x40); // bMaxPacketSize0
//! ```

use std::time::{Duration, Instant};
use usb::packet::{Packet, SetupPacket, TransferKind};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A standard 18-byte device descriptor: 1234:5678, USB 2.0,
/// bMaxPacketSize0 = 64, one configuration
pub fn mock_device_descriptor() -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        0x34, 0x12, // idVendor (0x1234)
        0x78, 0x56, // idProduct (0x5678)
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// A minimal configuration: one vendor-specific interface with a single
/// bulk-IN endpoint at 0x81, wMaxPacketSize 64
pub fn mock_config_descriptor() -> Vec<u8> {
    mock_config_with_endpoints(&[(0x81, 0x02, 64)])
}

/// Build a configuration blob with one interface carrying the given
/// endpoints, each `(bEndpointAddress, bmAttributes, wMaxPacketSize)`
pub fn mock_config_with_endpoints(endpoints: &[(u8, u8, u16)]) -> Vec<u8> {
    let total = 9 + 9 + 7 * endpoints.len();
    let mut bytes = vec![
        // Configuration descriptor
        0x09, // bLength
        0x02, // bDescriptorType (Configuration)
        (total & 0xff) as u8,
        (total >> 8) as u8, // wTotalLength
        0x01,               // bNumInterfaces
        0x01,               // bConfigurationValue
        0x00,               // iConfiguration
        0x80,               // bmAttributes (Bus-powered)
        0x32,               // bMaxPower (100mA)
        // Interface descriptor
        0x09, // bLength
        0x04, // bDescriptorType (Interface)
        0x00, // bInterfaceNumber
        0x00, // bAlternateSetting
        endpoints.len() as u8,
        0xff, // bInterfaceClass (Vendor-specific)
        0x00, // bInterfaceSubClass
        0x00, // bInterfaceProtocol
        0x00, // iInterface
    ];
    for (address, attributes, max_packet) in endpoints {
        bytes.extend_from_slice(&[
            0x07, // bLength
            0x05, // bDescriptorType (Endpoint)
            *address,
            *attributes,
            (*max_packet & 0xff) as u8,
            (*max_packet >> 8) as u8,
            0x00, // bInterval
        ]);
    }
    bytes
}

/// A 10-byte device qualifier declaring one other-speed configuration
pub fn mock_device_qualifier() -> Vec<u8> {
    vec![
        0x0a, // bLength
        0x06, // bDescriptorType (Device Qualifier)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0
        0x01, // bNumConfigurations
        0x00, // bReserved
    ]
}

/// Build a raw control-transfer setup packet
pub fn mock_setup_packet(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> [u8; 8] {
    SetupPacket {
        request_type,
        request,
        value,
        index,
        length,
    }
    .to_bytes()
}

/// An EP0 control packet carrying SET_CONFIGURATION(`value`)
pub fn set_configuration_packet(value: u8) -> Packet {
    Packet::control(mock_setup_packet(0x00, 0x09, value as u16, 0, 0).to_vec())
}

/// A bulk packet for the given endpoint address
pub fn bulk_packet(endpoint: u8, payload: &[u8]) -> Packet {
    Packet::new(endpoint, TransferKind::Bulk, payload.to_vec())
}

/// Poll `cond` every couple of milliseconds until it holds or `timeout`
/// elapses; returns whether the condition was met
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_descriptor() {
        let desc = mock_device_descriptor();
        assert_eq!(desc.len(), 18);
        assert_eq!(desc[0], 0x12); // bLength
        assert_eq!(desc[1], 0x01); // bDescriptorType
        assert_eq!(desc[7], 0x40); // bMaxPacketSize0
    }

    #[test]
    fn test_mock_config_descriptor() {
        let desc = mock_config_descriptor();
        assert_eq!(desc.len(), 25);
        assert_eq!(desc[2], 25); // wTotalLength
        assert_eq!(desc[20], 0x81); // bEndpointAddress
        assert_eq!(desc[21], 0x02); // bmAttributes (Bulk)
    }

    #[test]
    fn test_mock_config_with_endpoints_total_length() {
        let desc = mock_config_with_endpoints(&[(0x81, 0x02, 512), (0x01, 0x02, 512)]);
        assert_eq!(desc.len(), 9 + 9 + 14);
        assert_eq!(desc[2] as usize, desc.len());
        assert_eq!(desc[13], 2); // bNumEndpoints
    }

    #[test]
    fn test_set_configuration_packet() {
        let packet = set_configuration_packet(1);
        let setup = packet.setup().unwrap();
        assert!(setup.is_set_configuration());
        assert_eq!(setup.configuration_value(), 1);
    }

    #[test]
    fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(50), || true));
        assert!(!wait_until(Duration::from_millis(20), || false));
    }
}
