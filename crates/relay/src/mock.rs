//! Mock proxies for exercising the relay without real transports
//!
//! Scriptable in-memory implementations of the two proxy contracts. Tests
//! preload descriptor bytes and per-endpoint packet scripts, then assert
//! on the recorded sink traffic and call counters.

use crate::proxy::{ConnectStatus, DeviceProxy, HostProxy, ProxyError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use usb::device::{Configuration, Device};
use usb::Packet;

/// Pacing for empty reads and timed-out connects, so mock loops do not
/// spin hot
const IDLE_PAUSE: Duration = Duration::from_millis(2);

/// Scripted downstream device
#[derive(Default)]
pub struct MockDeviceProxy {
    device_descriptor: Vec<u8>,
    configurations: Vec<Vec<u8>>,
    qualifier: Option<Vec<u8>>,
    other_speed: Vec<Vec<u8>>,
    high_speed: bool,
    /// Remaining connect attempts that will time out
    connect_timeouts: AtomicUsize,
    connect_refused: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    claimed: Mutex<Vec<u8>>,
    released: Mutex<Vec<u8>>,
    endpoint_interfaces: Mutex<Vec<(u8, u8)>>,
    set_configurations: Mutex<Vec<(u8, bool, bool)>>,
    reads: Mutex<HashMap<u8, VecDeque<Packet>>>,
    written: Mutex<HashMap<u8, Vec<Packet>>>,
    dead_endpoints: Mutex<HashSet<u8>>,
}

impl MockDeviceProxy {
    pub fn new(device_descriptor: Vec<u8>, configurations: Vec<Vec<u8>>) -> Self {
        Self {
            device_descriptor,
            configurations,
            high_speed: true,
            ..Default::default()
        }
    }

    pub fn with_qualifier(mut self, qualifier: Vec<u8>, other_speed: Vec<Vec<u8>>) -> Self {
        self.qualifier = Some(qualifier);
        self.other_speed = other_speed;
        self
    }

    /// Time out this many connect attempts before succeeding
    pub fn with_connect_timeouts(self, attempts: usize) -> Self {
        self.connect_timeouts.store(attempts, Ordering::SeqCst);
        self
    }

    /// Fail every connect attempt fatally
    pub fn refuse_connect(self) -> Self {
        self.connect_refused.store(true, Ordering::SeqCst);
        self
    }

    pub fn full_speed(mut self) -> Self {
        self.high_speed = false;
        self
    }

    /// Queue a packet the device will produce on its endpoint address
    pub fn push_packet(&self, packet: Packet) {
        self.reads
            .lock()
            .unwrap()
            .entry(packet.endpoint)
            .or_default()
            .push_back(packet);
    }

    /// Make reads and writes on this endpoint fail fatally from now on
    pub fn kill_endpoint(&self, endpoint: u8) {
        self.dead_endpoints.lock().unwrap().insert(endpoint);
    }

    /// Everything written to this endpoint address so far
    pub fn written(&self, endpoint: u8) -> Vec<Packet> {
        self.written
            .lock()
            .unwrap()
            .get(&endpoint)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn claim_count(&self, interface: u8) -> usize {
        self.claimed
            .lock()
            .unwrap()
            .iter()
            .filter(|i| **i == interface)
            .count()
    }

    pub fn release_count(&self, interface: u8) -> usize {
        self.released
            .lock()
            .unwrap()
            .iter()
            .filter(|i| **i == interface)
            .count()
    }

    pub fn endpoint_interfaces(&self) -> Vec<(u8, u8)> {
        self.endpoint_interfaces.lock().unwrap().clone()
    }

    /// Recorded `(configuration value, other-speed present, high_speed)`
    pub fn set_configuration_calls(&self) -> Vec<(u8, bool, bool)> {
        self.set_configurations.lock().unwrap().clone()
    }

    fn check_endpoint(&self, endpoint: u8) -> Result<(), ProxyError> {
        if self.dead_endpoints.lock().unwrap().contains(&endpoint) {
            return Err(ProxyError::Disconnected(format!(
                "endpoint {:#04x} gone",
                endpoint
            )));
        }
        Ok(())
    }
}

impl DeviceProxy for MockDeviceProxy {
    fn connect(&self) -> Result<ConnectStatus, ProxyError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.connect_refused.load(Ordering::SeqCst) {
            return Err(ProxyError::Io("connection refused".to_string()));
        }
        let remaining = self.connect_timeouts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_timeouts.store(remaining - 1, Ordering::SeqCst);
            std::thread::sleep(IDLE_PAUSE);
            return Ok(ConnectStatus::TimedOut);
        }
        Ok(ConnectStatus::Connected)
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn claim_interface(&self, interface: u8) -> Result<(), ProxyError> {
        self.claimed.lock().unwrap().push(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), ProxyError> {
        self.released.lock().unwrap().push(interface);
        Ok(())
    }

    fn set_endpoint_interface(&self, endpoint: u8, interface: u8) {
        self.endpoint_interfaces
            .lock()
            .unwrap()
            .push((endpoint, interface));
    }

    fn set_configuration(
        &self,
        active: &Configuration,
        other_speed: Option<&Configuration>,
        high_speed: bool,
    ) -> Result<(), ProxyError> {
        self.set_configurations.lock().unwrap().push((
            active.value(),
            other_speed.is_some(),
            high_speed,
        ));
        Ok(())
    }

    fn device_descriptor(&self) -> Result<Vec<u8>, ProxyError> {
        Ok(self.device_descriptor.clone())
    }

    fn configuration_descriptor(&self, index: u8) -> Result<Vec<u8>, ProxyError> {
        self.configurations
            .get(index as usize)
            .cloned()
            .ok_or_else(|| ProxyError::Io(format!("no configuration {}", index)))
    }

    fn device_qualifier(&self) -> Result<Option<Vec<u8>>, ProxyError> {
        Ok(self.qualifier.clone())
    }

    fn other_speed_configuration(&self, index: u8) -> Result<Option<Vec<u8>>, ProxyError> {
        Ok(self.other_speed.get(index as usize).cloned())
    }

    fn is_high_speed(&self) -> bool {
        self.high_speed
    }

    fn read(&self, endpoint: u8) -> Result<Option<Packet>, ProxyError> {
        self.check_endpoint(endpoint)?;
        let packet = self
            .reads
            .lock()
            .unwrap()
            .get_mut(&endpoint)
            .and_then(|q| q.pop_front());
        match packet {
            Some(packet) => Ok(Some(packet)),
            None => {
                std::thread::sleep(IDLE_PAUSE);
                Ok(None)
            }
        }
    }

    fn write(&self, endpoint: u8, packet: &Packet) -> Result<(), ProxyError> {
        self.check_endpoint(endpoint)?;
        self.written
            .lock()
            .unwrap()
            .entry(endpoint)
            .or_default()
            .push(packet.clone());
        Ok(())
    }
}

/// Scripted upstream host
#[derive(Default)]
pub struct MockHostProxy {
    /// Remaining connect attempts that will time out
    connect_timeouts: AtomicUsize,
    /// Time out every connect attempt, forever
    connect_never: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    set_configurations: Mutex<Vec<(u8, bool, bool)>>,
    reads: Mutex<HashMap<u8, VecDeque<Packet>>>,
    written: Mutex<HashMap<u8, Vec<Packet>>>,
}

impl MockHostProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeouts(self, attempts: usize) -> Self {
        self.connect_timeouts.store(attempts, Ordering::SeqCst);
        self
    }

    /// Keep the connect retry loop spinning until the relay gives up
    pub fn never_connect(self) -> Self {
        self.connect_never.store(true, Ordering::SeqCst);
        self
    }

    /// Feed a packet the host sends toward the device
    pub fn submit_packet(&self, packet: Packet) {
        self.reads
            .lock()
            .unwrap()
            .entry(packet.endpoint)
            .or_default()
            .push_back(packet);
    }

    /// Everything written to this endpoint address so far
    pub fn written(&self, endpoint: u8) -> Vec<Packet> {
        self.written
            .lock()
            .unwrap()
            .get(&endpoint)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn set_configuration_calls(&self) -> Vec<(u8, bool, bool)> {
        self.set_configurations.lock().unwrap().clone()
    }
}

impl HostProxy for MockHostProxy {
    fn connect(&self, _device: &Device) -> Result<ConnectStatus, ProxyError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.connect_never.load(Ordering::SeqCst) {
            std::thread::sleep(IDLE_PAUSE);
            return Ok(ConnectStatus::TimedOut);
        }
        let remaining = self.connect_timeouts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_timeouts.store(remaining - 1, Ordering::SeqCst);
            std::thread::sleep(IDLE_PAUSE);
            return Ok(ConnectStatus::TimedOut);
        }
        Ok(ConnectStatus::Connected)
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn set_configuration(
        &self,
        active: &Configuration,
        other_speed: Option<&Configuration>,
        high_speed: bool,
    ) -> Result<(), ProxyError> {
        self.set_configurations.lock().unwrap().push((
            active.value(),
            other_speed.is_some(),
            high_speed,
        ));
        Ok(())
    }

    fn read(&self, endpoint: u8) -> Result<Option<Packet>, ProxyError> {
        let packet = self
            .reads
            .lock()
            .unwrap()
            .get_mut(&endpoint)
            .and_then(|q| q.pop_front());
        match packet {
            Some(packet) => Ok(Some(packet)),
            None => {
                std::thread::sleep(IDLE_PAUSE);
                Ok(None)
            }
        }
    }

    fn write(&self, endpoint: u8, packet: &Packet) -> Result<(), ProxyError> {
        self.written
            .lock()
            .unwrap()
            .entry(endpoint)
            .or_default()
            .push(packet.clone());
        Ok(())
    }
}
