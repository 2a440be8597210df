//! Relayed packet and setup-packet types
//!
//! A `Packet` is the unit of traffic between the two proxies: the payload
//! of one transfer on one endpoint, tagged with the endpoint address and
//! the transfer type. Control packets carry the 8-byte setup stage as a
//! payload prefix so the EP0 pipeline can inspect standard requests.

use serde::{Deserialize, Serialize};
use std::fmt;

/// GET_DESCRIPTOR standard request code
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
/// SET_CONFIGURATION standard request code
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;

/// Transfer direction, always relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    /// Derive the direction from bit 7 of an endpoint address
    pub fn from_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Out => write!(f, "OUT"),
            Direction::In => write!(f, "IN"),
        }
    }
}

/// USB transfer type from the low two bits of `bmAttributes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferKind {
    /// Decode the transfer-type bits of an endpoint's `bmAttributes`
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0x00 => TransferKind::Control,
            0x01 => TransferKind::Isochronous,
            0x02 => TransferKind::Bulk,
            _ => TransferKind::Interrupt,
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Control => write!(f, "control"),
            TransferKind::Isochronous => write!(f, "isochronous"),
            TransferKind::Bulk => write!(f, "bulk"),
            TransferKind::Interrupt => write!(f, "interrupt"),
        }
    }
}

/// One relayed USB transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Full endpoint address, including the direction bit
    pub endpoint: u8,
    /// Transfer type of the carrying endpoint
    pub transfer: TransferKind,
    /// Raw transfer payload; for control transfers this starts with the
    /// 8-byte setup stage
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(endpoint: u8, transfer: TransferKind, payload: Vec<u8>) -> Self {
        Self {
            endpoint,
            transfer,
            payload,
        }
    }

    /// A control packet on EP0
    pub fn control(payload: Vec<u8>) -> Self {
        Self::new(0, TransferKind::Control, payload)
    }

    /// Direction encoded in the endpoint address
    pub fn direction(&self) -> Direction {
        Direction::from_address(self.endpoint)
    }

    /// Endpoint number without the direction bit
    pub fn endpoint_number(&self) -> u8 {
        self.endpoint & 0x0f
    }

    /// The setup stage of a control packet, if present
    pub fn setup(&self) -> Option<SetupPacket> {
        if self.transfer != TransferKind::Control {
            return None;
        }
        SetupPacket::from_payload(&self.payload)
    }
}

/// The 8-byte setup stage of a control transfer
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn parse(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Parse the setup stage off the front of a control payload
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = payload.get(..8)?.try_into().ok()?;
        Some(Self::parse(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Direction of the data stage (bit 7 of bmRequestType)
    pub fn direction(&self) -> Direction {
        Direction::from_address(self.request_type)
    }

    /// Standard request (type bits of bmRequestType are zero)
    pub fn is_standard(&self) -> bool {
        self.request_type & 0x60 == 0
    }

    /// A standard SET_CONFIGURATION request addressed to the device
    pub fn is_set_configuration(&self) -> bool {
        self.request_type == 0x00 && self.request == REQUEST_SET_CONFIGURATION
    }

    /// The configuration value carried by SET_CONFIGURATION
    pub fn configuration_value(&self) -> u8 {
        (self.value & 0xff) as u8
    }
}

impl fmt::Debug for SetupPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupPacket")
            .field("request_type", &format_args!("{:#04x}", self.request_type))
            .field("request", &format_args!("{:#04x}", self.request))
            .field("value", &format_args!("{:#06x}", self.value))
            .field("index", &format_args!("{:#06x}", self.index))
            .field("length", &self.length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_from_address() {
        assert_eq!(Direction::from_address(0x81), Direction::In);
        assert_eq!(Direction::from_address(0x01), Direction::Out);
        assert_eq!(Direction::from_address(0x00), Direction::Out);
    }

    #[test]
    fn test_transfer_kind_from_attributes() {
        assert_eq!(TransferKind::from_attributes(0x00), TransferKind::Control);
        assert_eq!(
            TransferKind::from_attributes(0x01),
            TransferKind::Isochronous
        );
        assert_eq!(TransferKind::from_attributes(0x02), TransferKind::Bulk);
        assert_eq!(TransferKind::from_attributes(0x03), TransferKind::Interrupt);
        // upper bits (sync/usage for isochronous) are ignored
        assert_eq!(TransferKind::from_attributes(0x0d), TransferKind::Isochronous);
    }

    #[test]
    fn test_setup_packet_roundtrip() {
        let setup = SetupPacket {
            request_type: 0x80,
            request: REQUEST_GET_DESCRIPTOR,
            value: 0x0100,
            index: 0x0000,
            length: 18,
        };
        let parsed = SetupPacket::parse(setup.to_bytes());
        assert_eq!(parsed, setup);
        assert_eq!(parsed.direction(), Direction::In);
        assert!(parsed.is_standard());
        assert!(!parsed.is_set_configuration());
    }

    #[test]
    fn test_set_configuration_detection() {
        let setup = SetupPacket::parse([0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert!(setup.is_set_configuration());
        assert_eq!(setup.configuration_value(), 1);
        assert_eq!(setup.direction(), Direction::Out);

        // class request with the same request code is not SET_CONFIGURATION
        let setup = SetupPacket::parse([0x21, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert!(!setup.is_set_configuration());
    }

    #[test]
    fn test_packet_setup_extraction() {
        let packet = Packet::control(vec![0x00, 0x09, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let setup = packet.setup().expect("control packet carries a setup stage");
        assert_eq!(setup.configuration_value(), 2);

        let short = Packet::control(vec![0x00, 0x09]);
        assert!(short.setup().is_none());

        let bulk = Packet::new(0x81, TransferKind::Bulk, vec![0; 8]);
        assert!(bulk.setup().is_none());
    }

    #[test]
    fn test_packet_address_helpers() {
        let packet = Packet::new(0x81, TransferKind::Bulk, vec![1, 2, 3]);
        assert_eq!(packet.direction(), Direction::In);
        assert_eq!(packet.endpoint_number(), 1);
    }
}
