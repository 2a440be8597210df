//! Relay orchestration
//!
//! The manager owns the endpoint slot tables, the plugin registries, the
//! two proxies and the device model, and drives the lifecycle state
//! machine: checkpointed control bring-up, data bring-up fanned out from
//! the EP0 writer, and the ordered teardown.
//!
//! Threading: lifecycle entry points run on the caller's thread, while
//! `set_config` runs on the EP0 writer thread and spawns the data-endpoint
//! workers from there. The state cell is readable from every thread; slot
//! tables and registries are only touched under their locks during
//! structured bring-up or teardown, so workers never observe a half-built
//! slot. Teardown signals every stop flag first, then joins with no lock
//! held, so a writer stuck inside `set_config` can finish and exit.

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::filter::{FilterRegistry, PacketFilter};
use crate::injector::{InjectionPorts, Injector, InjectorRegistry};
use crate::plugins::PluginSet;
use crate::proxy::{probe_device, ConnectStatus, DeviceProxy, HostProxy, ProxyError, ProxyHandle};
use crate::queue::{packet_queue, PacketReceiver, PacketSender};
use crate::reader::RelayReader;
use crate::spinner::Spinner;
use crate::state::{RelayState, StateCell, StopFlag};
use crate::writer::RelayWriter;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use usb::descriptor::EndpointDescriptor;
use usb::device::{Configuration, Device, Endpoint, Interface};
use usb::packet::Direction;

/// Endpoint numbers addressable in each direction
const ENDPOINT_SLOTS: usize = 16;

/// One endpoint slot: either fully empty or carrying a whole relayer.
/// Between construction and spawn the reader/writer objects sit here;
/// after spawn only the endpoint, stop flags and thread handles remain.
#[derive(Default)]
struct EndpointSlot {
    endpoint: Option<Endpoint>,
    /// Owning interface alternate, absent for EP0
    interface: Option<Interface>,
    /// Queue halves parked between slot install and relayer construction
    queue: Option<(PacketSender, PacketReceiver)>,
    reader: Option<RelayReader>,
    writer: Option<RelayWriter>,
    reader_stop: Option<StopFlag>,
    writer_stop: Option<StopFlag>,
    reader_thread: Option<JoinHandle<()>>,
    writer_thread: Option<JoinHandle<()>>,
}

impl EndpointSlot {
    fn signal_stop(&self) {
        if let Some(flag) = &self.reader_stop {
            flag.set();
        }
        if let Some(flag) = &self.writer_stop {
            flag.set();
        }
    }

    fn live_threads(&self) -> usize {
        let mut live = 0;
        if matches!(&self.reader_thread, Some(t) if !t.is_finished()) {
            live += 1;
        }
        if matches!(&self.writer_thread, Some(t) if !t.is_finished()) {
            live += 1;
        }
        live
    }
}

/// Both direction tables; `output[0]` is EP0
#[derive(Default)]
struct SlotTable {
    /// Device-to-host endpoints (IN)
    input: [EndpointSlot; ENDPOINT_SLOTS],
    /// Host-to-device endpoints (OUT)
    output: [EndpointSlot; ENDPOINT_SLOTS],
}

impl SlotTable {
    fn slot(&self, direction: Direction, index: usize) -> &EndpointSlot {
        match direction {
            Direction::In => &self.input[index],
            Direction::Out => &self.output[index],
        }
    }

    fn slot_mut(&mut self, direction: Direction, index: usize) -> &mut EndpointSlot {
        match direction {
            Direction::In => &mut self.input[index],
            Direction::Out => &mut self.output[index],
        }
    }
}

/// A spawned injector with its routing table
struct InjectorRuntime {
    injector: Arc<dyn Injector>,
    ports: InjectionPorts,
    thread: Option<JoinHandle<()>>,
}

/// Outcome of the host-side connect retry loop
enum HostConnect {
    Connected,
    Aborted,
    Failed(ProxyError),
}

pub(crate) struct RelayInner {
    config: RelayConfig,
    state: StateCell,
    device_proxy: Mutex<Option<Arc<dyn DeviceProxy>>>,
    host_proxy: Mutex<Option<Arc<dyn HostProxy>>>,
    filters: Mutex<FilterRegistry>,
    injectors: Mutex<InjectorRegistry>,
    device: Mutex<Option<Device>>,
    slots: Mutex<SlotTable>,
    running_injectors: Mutex<Vec<InjectorRuntime>>,
}

/// The relay orchestrator; cheap to clone and share across threads
#[derive(Clone)]
pub struct RelayManager {
    inner: Arc<RelayInner>,
}

impl RelayManager {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                config,
                state: StateCell::new(RelayState::Idle),
                device_proxy: Mutex::new(None),
                host_proxy: Mutex::new(None),
                filters: Mutex::new(FilterRegistry::new()),
                injectors: Mutex::new(InjectorRegistry::new()),
                device: Mutex::new(None),
                slots: Mutex::new(SlotTable::default()),
                running_injectors: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> RelayState {
        self.inner.state.load()
    }

    /// Take ownership of the proxies and seed the registries
    pub fn load_plugins(&self, plugins: PluginSet) {
        self.inner.load_plugins(plugins)
    }

    /// Drop every plugin and both proxies (Idle or Reset only)
    pub fn unload_plugins(&self) {
        self.inner.unload_plugins()
    }

    pub fn add_filter(&self, filter: Arc<dyn PacketFilter>) {
        self.inner.add_filter(filter)
    }

    /// Remove a filter by index. With `free_memory` the handle is dropped;
    /// otherwise it is returned to the caller.
    pub fn remove_filter(&self, index: usize, free_memory: bool) -> Option<Arc<dyn PacketFilter>> {
        self.inner.remove_filter(index, free_memory)
    }

    pub fn get_filter(&self, index: usize) -> Option<Arc<dyn PacketFilter>> {
        self.inner.filters.lock().unwrap().get(index)
    }

    pub fn filter_count(&self) -> usize {
        self.inner.filters.lock().unwrap().len()
    }

    pub fn add_injector(&self, injector: Arc<dyn Injector>) {
        self.inner.add_injector(injector)
    }

    pub fn remove_injector(&self, index: usize, free_memory: bool) -> Option<Arc<dyn Injector>> {
        self.inner.remove_injector(index, free_memory)
    }

    pub fn get_injector(&self, index: usize) -> Option<Arc<dyn Injector>> {
        self.inner.injectors.lock().unwrap().get(index)
    }

    pub fn injector_count(&self) -> usize {
        self.inner.injectors.lock().unwrap().len()
    }

    /// Bring up EP0 and both proxies; blocks until relaying or aborted
    pub fn start_control_relaying(&self) -> Result<()> {
        RelayInner::start_control_relaying(&self.inner)
    }

    /// Context-aware, idempotent stop
    pub fn stop_relaying(&self) {
        self.inner.stop_relaying()
    }

    /// Bus reset from the host side: tear down but land in Reset, from
    /// which registries may be mutated and relaying restarted
    pub fn reset(&self) {
        self.inner.reset()
    }

    /// Whether the slot for this endpoint address is populated
    pub fn endpoint_active(&self, address: u8) -> bool {
        let slots = self.inner.slots.lock().unwrap();
        slots
            .slot(Direction::from_address(address), (address & 0x0f) as usize)
            .endpoint
            .is_some()
    }

    /// Addresses of every populated slot, EP0 included
    pub fn active_endpoints(&self) -> Vec<u8> {
        let slots = self.inner.slots.lock().unwrap();
        let mut active = Vec::new();
        for index in 0..ENDPOINT_SLOTS {
            if let Some(endpoint) = &slots.output[index].endpoint {
                active.push(endpoint.address());
            }
            if let Some(endpoint) = &slots.input[index].endpoint {
                active.push(endpoint.address());
            }
        }
        active
    }

    /// Reader/writer threads that have not finished yet
    pub fn live_relayer_threads(&self) -> usize {
        let slots = self.inner.slots.lock().unwrap();
        (0..ENDPOINT_SLOTS)
            .map(|i| slots.input[i].live_threads() + slots.output[i].live_threads())
            .sum()
    }

    /// Injector threads that have not finished yet
    pub fn live_injector_threads(&self) -> usize {
        let running = self.inner.running_injectors.lock().unwrap();
        running
            .iter()
            .filter(|r| matches!(&r.thread, Some(t) if !t.is_finished()))
            .count()
    }
}

impl RelayInner {
    fn registry_mutable(&self, allow_reset: bool) -> bool {
        match self.state.load() {
            RelayState::Idle => true,
            RelayState::Reset => allow_reset,
            _ => false,
        }
    }

    fn load_plugins(&self, plugins: PluginSet) {
        if self.state.load() != RelayState::Idle {
            warn!(
                "Can't load plugins unless manager is idle (state {})",
                self.state.load()
            );
            return;
        }
        info!(
            "Loading plugins: {} filters, {} injectors",
            plugins.filters.len(),
            plugins.injectors.len()
        );
        *self.device_proxy.lock().unwrap() = Some(plugins.device_proxy);
        *self.host_proxy.lock().unwrap() = Some(plugins.host_proxy);
        for filter in plugins.filters {
            self.add_filter(filter);
        }
        for injector in plugins.injectors {
            self.add_injector(injector);
        }
    }

    fn unload_plugins(&self) {
        if !self.registry_mutable(true) {
            warn!(
                "Can't unload plugins unless manager is idle or reset (state {})",
                self.state.load()
            );
            return;
        }
        *self.filters.lock().unwrap() = FilterRegistry::new();
        *self.injectors.lock().unwrap() = InjectorRegistry::new();
        *self.device_proxy.lock().unwrap() = None;
        *self.host_proxy.lock().unwrap() = None;
    }

    fn add_filter(&self, filter: Arc<dyn PacketFilter>) {
        if !self.registry_mutable(true) {
            warn!(
                "Can't add filters unless manager is idle or reset (state {})",
                self.state.load()
            );
            return;
        }
        self.filters.lock().unwrap().add(filter);
    }

    fn remove_filter(&self, index: usize, free_memory: bool) -> Option<Arc<dyn PacketFilter>> {
        if !self.registry_mutable(true) {
            warn!(
                "Can't remove filters unless manager is idle or reset (state {})",
                self.state.load()
            );
            return None;
        }
        let removed = self.filters.lock().unwrap().remove(index);
        if removed.is_none() {
            warn!("Filter index {} out of bounds", index);
        }
        if free_memory {
            None
        } else {
            removed
        }
    }

    fn add_injector(&self, injector: Arc<dyn Injector>) {
        if self.state.load() != RelayState::Idle {
            warn!(
                "Can't add injectors unless manager is idle (state {})",
                self.state.load()
            );
            return;
        }
        self.injectors.lock().unwrap().add(injector);
    }

    fn remove_injector(&self, index: usize, free_memory: bool) -> Option<Arc<dyn Injector>> {
        if !self.registry_mutable(true) {
            warn!(
                "Can't remove injectors unless manager is idle or reset (state {})",
                self.state.load()
            );
            return None;
        }
        let removed = self.injectors.lock().unwrap().remove(index);
        if removed.is_none() {
            warn!("Injector index {} out of bounds", index);
        }
        if free_memory {
            None
        } else {
            removed
        }
    }

    fn require_device_proxy(&self) -> Result<Arc<dyn DeviceProxy>> {
        self.device_proxy
            .lock()
            .unwrap()
            .clone()
            .ok_or(RelayError::MissingProxy("device"))
    }

    fn require_host_proxy(&self) -> Result<Arc<dyn HostProxy>> {
        self.host_proxy
            .lock()
            .unwrap()
            .clone()
            .ok_or(RelayError::MissingProxy("host"))
    }

    /// Re-read the state between setup steps. On an external stop request
    /// the setup path itself drives the teardown and bails out.
    fn setup_checkpoint(&self) -> bool {
        if self.state.load() == RelayState::Setup {
            return true;
        }
        debug!(
            "Setup interrupted (state {}); tearing down",
            self.state.load()
        );
        self.stop_relaying();
        false
    }

    fn start_control_relaying(self: &Arc<Self>) -> Result<()> {
        let state = self.state.load();
        info!("start_control_relaying: state {}", state);
        if state != RelayState::Idle && state != RelayState::Reset {
            warn!("Relaying can only start from IDLE or RESET");
            return Err(RelayError::InvalidState {
                operation: "start_control_relaying",
                state,
            });
        }
        self.state.store(RelayState::Setup);

        let device_proxy = match self.require_device_proxy() {
            Ok(proxy) => proxy,
            Err(e) => {
                self.state.store(RelayState::Idle);
                return Err(e);
            }
        };
        let host_proxy = match self.require_host_proxy() {
            Ok(proxy) => proxy,
            Err(e) => {
                self.state.store(RelayState::Idle);
                return Err(e);
            }
        };

        // connect the device side, retrying timeouts while still in Setup
        debug!("Connecting to device proxy");
        let mut spinner = Spinner::new(self.config.spinner);
        let connected = loop {
            match device_proxy.connect() {
                Ok(ConnectStatus::Connected) => break true,
                Ok(ConnectStatus::TimedOut) => {
                    if self.state.load() != RelayState::Setup {
                        break false;
                    }
                    spinner.tick();
                }
                Err(e) => {
                    error!("Unable to connect to device proxy: {}", e);
                    self.state.store(RelayState::Idle);
                    return Err(e.into());
                }
            }
        };
        spinner.finish();
        if !connected {
            info!("Setup interrupted while connecting to device proxy");
            self.state.store(RelayState::Idle);
            return Ok(());
        }

        // populate the device model
        let device = match probe_device(device_proxy.as_ref()) {
            Ok(device) => device,
            Err(e) => {
                error!("Failed to read device descriptors: {}", e);
                device_proxy.disconnect();
                self.state.store(RelayState::Idle);
                return Err(e);
            }
        };
        info!("Relaying device {}", device.summary());
        let interface_count = device.active_configuration().num_interfaces();
        let max_packet0 = device.descriptor().max_packet_size_0;
        *self.device.lock().unwrap() = Some(device);

        if !self.setup_checkpoint() {
            return Ok(());
        }

        // claim every interface of the active configuration
        debug!("Claiming {} interfaces on the device proxy", interface_count);
        for interface in 0..interface_count {
            if let Err(e) = device_proxy.claim_interface(interface) {
                warn!("Failed to claim interface {}: {}", interface, e);
            }
        }
        if !self.setup_checkpoint() {
            return Ok(());
        }

        // synthetic EP0 endpoint and the bidirectional relayer pair
        debug!("Creating EP0 relayer");
        let ep0 = Endpoint::new(EndpointDescriptor::ep0(max_packet0 as u16));
        let tick = self.config.poll_interval();
        let capacity = self.config.queue_capacity;
        let (request_tx, request_rx) = packet_queue(capacity);
        let (response_tx, response_rx) = packet_queue(capacity);
        let reader = RelayReader::ep0(
            &ep0,
            ProxyHandle::Host(host_proxy.clone()),
            request_tx,
            response_rx,
            tick,
        );
        let mut writer = RelayWriter::ep0(
            &ep0,
            ProxyHandle::Device(device_proxy.clone()),
            request_rx,
            response_tx,
            Arc::downgrade(self),
            capacity,
            tick,
        );

        // bind filters whose device and endpoint predicates accept EP0
        {
            let device_guard = self.device.lock().unwrap();
            if let Some(device) = device_guard.as_ref() {
                let filters = self.filters.lock().unwrap();
                for filter in filters.iter() {
                    if filter.matches_device(device) && filter.matches_endpoint(&ep0) {
                        writer.add_filter(filter.clone());
                    }
                }
            }
        }
        debug!("Bound {} filters to EP0", writer.filter_count());
        if !self.setup_checkpoint() {
            return Ok(());
        }

        // spawn a listener thread for every injector matching the device;
        // EP0 ports attach where the endpoint predicate accepts
        {
            let device_guard = self.device.lock().unwrap();
            if let Some(device) = device_guard.as_ref() {
                let injectors = self.injectors.lock().unwrap();
                let mut running = self.running_injectors.lock().unwrap();
                for (index, injector) in injectors.iter().enumerate() {
                    if !injector.matches_device(device) {
                        continue;
                    }
                    let ports = InjectionPorts::new();
                    if injector.matches_endpoint(&ep0) {
                        ports.attach(0, writer.injection_sender());
                    }
                    let thread_injector = injector.clone();
                    let thread_ports = ports.clone();
                    let thread = spawn_worker(&format!("injector-{}", index), move || {
                        thread_injector.listen(&thread_ports)
                    });
                    running.push(InjectorRuntime {
                        injector: injector.clone(),
                        ports,
                        thread: Some(thread),
                    });
                }
                debug!("Started {} injector threads", running.len());
            }
        }
        if !self.setup_checkpoint() {
            return Ok(());
        }

        // install EP0 into out[0]
        {
            let mut slots = self.slots.lock().unwrap();
            let slot = &mut slots.output[0];
            slot.endpoint = Some(ep0);
            slot.reader_stop = Some(reader.stop_flag());
            slot.writer_stop = Some(writer.stop_flag());
            slot.reader = Some(reader);
            slot.writer = Some(writer);
        }
        if !self.setup_checkpoint() {
            return Ok(());
        }

        // connect the host side, retrying timeouts while still in Setup
        debug!("Connecting to host proxy");
        let mut spinner = Spinner::new(self.config.spinner);
        let outcome = loop {
            let attempt = {
                let device_guard = self.device.lock().unwrap();
                match device_guard.as_ref() {
                    Some(device) => host_proxy.connect(device),
                    None => break HostConnect::Aborted,
                }
            };
            match attempt {
                Ok(ConnectStatus::Connected) => break HostConnect::Connected,
                Ok(ConnectStatus::TimedOut) => {
                    if self.state.load() != RelayState::Setup {
                        break HostConnect::Aborted;
                    }
                    spinner.tick();
                }
                Err(e) => break HostConnect::Failed(e),
            }
        };
        spinner.finish();
        match outcome {
            HostConnect::Connected => {}
            HostConnect::Aborted => {
                self.state.store(RelayState::SetupAbort);
                self.stop_relaying();
                return Ok(());
            }
            HostConnect::Failed(e) => {
                error!("Unable to connect to host proxy: {}", e);
                self.state.store(RelayState::SetupAbort);
                self.stop_relaying();
                return Err(e.into());
            }
        }

        // spawn the EP0 relayer threads, reader first
        {
            let mut slots = self.slots.lock().unwrap();
            let slot = &mut slots.output[0];
            if let Some(reader) = slot.reader.take() {
                slot.reader_thread = Some(spawn_worker("ep00-reader", move || reader.run()));
            }
        }
        if !self.setup_checkpoint() {
            return Ok(());
        }
        {
            let mut slots = self.slots.lock().unwrap();
            let slot = &mut slots.output[0];
            if let Some(writer) = slot.writer.take() {
                slot.writer_thread = Some(spawn_worker("ep00-writer", move || writer.run()));
            }
        }
        if !self.setup_checkpoint() {
            return Ok(());
        }

        self.state.store(RelayState::Relaying);
        info!("Control relaying established");
        Ok(())
    }

    /// Called from the EP0 writer thread after a SET_CONFIGURATION was
    /// relayed successfully. Safe to spawn the data workers from here.
    pub(crate) fn set_config(&self, value: u8) {
        let state = self.state.load();
        info!("setConfig({}): state {}", value, state);
        if state != RelayState::Relaying {
            warn!("Ignoring SET_CONFIGURATION in state {}", state);
            return;
        }
        let (device_proxy, host_proxy) =
            match (self.require_device_proxy(), self.require_host_proxy()) {
                (Ok(device), Ok(host)) => (device, host),
                _ => {
                    warn!("setConfig without loaded proxies");
                    return;
                }
            };

        let mut device_guard = self.device.lock().unwrap();
        let Some(device) = device_guard.as_mut() else {
            warn!("setConfig without a device model");
            return;
        };
        if let Err(e) = device.set_active_configuration(value) {
            warn!("SET_CONFIGURATION rejected: {}", e);
            return;
        }

        let active = device.active_configuration().clone();
        let other_speed = device
            .qualifier()
            .and_then(|q| q.configuration_by_value(value))
            .cloned();
        let high_speed = device.is_high_speed();
        if let Err(e) = device_proxy.set_configuration(&active, other_speed.as_ref(), high_speed) {
            warn!("Device proxy rejected configuration {}: {}", value, e);
        }
        if let Err(e) = host_proxy.set_configuration(&active, other_speed.as_ref(), high_speed) {
            warn!("Host proxy rejected configuration {}: {}", value, e);
        }

        self.start_data_relaying(device, &active, &device_proxy, &host_proxy);
    }

    /// Bring up every non-isochronous data endpoint of the configuration
    fn start_data_relaying(
        &self,
        device: &Device,
        cfg: &Configuration,
        device_proxy: &Arc<dyn DeviceProxy>,
        host_proxy: &Arc<dyn HostProxy>,
    ) {
        info!(
            "start_data_relaying: {} interfaces in configuration {}",
            cfg.num_interfaces(),
            cfg.value()
        );
        let mut slots = self.slots.lock().unwrap();
        if self.state.load() != RelayState::Relaying {
            debug!(
                "Data bring-up abandoned (state {})",
                self.state.load()
            );
            return;
        }

        let tick = self.config.poll_interval();
        let capacity = self.config.queue_capacity;

        // install endpoints and fresh queues, skipping isochronous
        for interface in cfg.interfaces() {
            for endpoint in interface.endpoints() {
                if endpoint.is_isochronous() {
                    warn!(
                        "Endpoint {:#04x} has transfer type isochronous, which is not supported; skipping",
                        endpoint.address()
                    );
                    continue;
                }
                let index = endpoint.number() as usize;
                if index == 0 {
                    // EP0 belongs to control bring-up
                    continue;
                }
                let slot = slots.slot_mut(endpoint.direction(), index);
                if slot.reader_thread.is_some() || slot.writer_thread.is_some() {
                    debug!("Endpoint {:#04x} already relaying", endpoint.address());
                    continue;
                }
                slot.endpoint = Some(endpoint.clone());
                slot.interface = Some(interface.clone());
                slot.queue = Some(packet_queue(capacity));
                device_proxy.set_endpoint_interface(endpoint.address(), interface.number());
            }
        }

        // build the reader/writer pair for every populated slot:
        // IN reads the device and writes the host, OUT the reverse
        for index in 1..ENDPOINT_SLOTS {
            {
                let slot = &mut slots.input[index];
                if let (Some(endpoint), Some((tx, rx))) =
                    (slot.endpoint.clone(), slot.queue.take())
                {
                    let reader = RelayReader::new(
                        &endpoint,
                        ProxyHandle::Device(device_proxy.clone()),
                        tx,
                        tick,
                    );
                    let writer = RelayWriter::new(
                        &endpoint,
                        ProxyHandle::Host(host_proxy.clone()),
                        rx,
                        capacity,
                        tick,
                    );
                    slot.reader_stop = Some(reader.stop_flag());
                    slot.writer_stop = Some(writer.stop_flag());
                    slot.reader = Some(reader);
                    slot.writer = Some(writer);
                }
            }
            {
                let slot = &mut slots.output[index];
                if let (Some(endpoint), Some((tx, rx))) =
                    (slot.endpoint.clone(), slot.queue.take())
                {
                    let reader = RelayReader::new(
                        &endpoint,
                        ProxyHandle::Host(host_proxy.clone()),
                        tx,
                        tick,
                    );
                    let writer = RelayWriter::new(
                        &endpoint,
                        ProxyHandle::Device(device_proxy.clone()),
                        rx,
                        capacity,
                        tick,
                    );
                    slot.reader_stop = Some(reader.stop_flag());
                    slot.writer_stop = Some(writer.stop_flag());
                    slot.reader = Some(reader);
                    slot.writer = Some(writer);
                }
            }
        }

        // bind filters with the four-way predicate
        {
            let filters = self.filters.lock().unwrap();
            for filter in filters.iter() {
                if !(filter.matches_device(device) && filter.matches_configuration(cfg)) {
                    continue;
                }
                for index in 1..ENDPOINT_SLOTS {
                    for direction in [Direction::In, Direction::Out] {
                        let slot = slots.slot_mut(direction, index);
                        let (Some(endpoint), Some(interface), Some(writer)) = (
                            slot.endpoint.as_ref(),
                            slot.interface.as_ref(),
                            slot.writer.as_mut(),
                        ) else {
                            continue;
                        };
                        if filter.matches_endpoint(endpoint) && filter.matches_interface(interface)
                        {
                            writer.add_filter(filter.clone());
                        }
                    }
                }
            }
        }

        // attach injector ports to every writer their predicates accept;
        // the injector threads have been listening since control bring-up
        {
            let running = self.running_injectors.lock().unwrap();
            for runtime in running.iter() {
                if !(runtime.injector.matches_device(device)
                    && runtime.injector.matches_configuration(cfg))
                {
                    continue;
                }
                for index in 1..ENDPOINT_SLOTS {
                    for direction in [Direction::In, Direction::Out] {
                        let slot = slots.slot_mut(direction, index);
                        let (Some(endpoint), Some(interface), Some(writer)) = (
                            slot.endpoint.as_ref(),
                            slot.interface.as_ref(),
                            slot.writer.as_mut(),
                        ) else {
                            continue;
                        };
                        if runtime.injector.matches_endpoint(endpoint)
                            && runtime.injector.matches_interface(interface)
                        {
                            runtime
                                .ports
                                .attach(endpoint.address(), writer.injection_sender());
                        }
                    }
                }
            }
        }

        // some transports need the interfaces claimed again once the
        // endpoint routing is known
        for interface in 0..cfg.num_interfaces() {
            if let Err(e) = device_proxy.claim_interface(interface) {
                warn!("Failed to claim interface {}: {}", interface, e);
            }
        }

        // spawn every data relayer thread
        let mut spawned = 0;
        for index in 1..ENDPOINT_SLOTS {
            for direction in [Direction::In, Direction::Out] {
                let address = match direction {
                    Direction::In => 0x80 | index as u8,
                    Direction::Out => index as u8,
                };
                let slot = slots.slot_mut(direction, index);
                if let Some(reader) = slot.reader.take() {
                    slot.reader_thread = Some(spawn_worker(
                        &format!("ep{:02x}-reader", address),
                        move || reader.run(),
                    ));
                    spawned += 1;
                }
                if let Some(writer) = slot.writer.take() {
                    slot.writer_thread = Some(spawn_worker(
                        &format!("ep{:02x}-writer", address),
                        move || writer.run(),
                    ));
                    spawned += 1;
                }
            }
        }
        info!("Data relaying started: {} worker threads", spawned);
    }

    pub(crate) fn stop_relaying(&self) {
        let state = self.state.load();
        info!("stop_relaying: state {}", state);
        match state {
            RelayState::Setup => {
                // the setup path observes this at its next checkpoint and
                // drives the teardown itself
                self.state.store(RelayState::SetupAbort);
                return;
            }
            RelayState::Relaying | RelayState::SetupAbort => {}
            _ => return,
        }
        self.state.store(RelayState::Stopping);
        self.teardown(RelayState::Idle);
    }

    pub(crate) fn reset(&self) {
        let state = self.state.load();
        if state != RelayState::Relaying {
            warn!("reset ignored in state {}", state);
            return;
        }
        info!("Bus reset: tearing down to RESET");
        self.state.store(RelayState::Stopping);
        self.teardown(RelayState::Reset);
    }

    /// Ordered shutdown: signal everything first so all waiters wake
    /// together, join second, release transports last
    fn teardown(&self, final_state: RelayState) {
        // signal every injector
        {
            let running = self.running_injectors.lock().unwrap();
            for runtime in running.iter() {
                runtime.injector.please_stop();
            }
        }
        // signal every relayer
        {
            let slots = self.slots.lock().unwrap();
            for index in 0..ENDPOINT_SLOTS {
                slots.input[index].signal_stop();
                slots.output[index].signal_stop();
            }
        }

        // join injector threads and drop their routing tables
        let mut finished = {
            let mut running = self.running_injectors.lock().unwrap();
            std::mem::take(&mut *running)
        };
        for runtime in &mut finished {
            runtime.ports.clear();
            if let Some(thread) = runtime.thread.take() {
                if thread.join().is_err() {
                    warn!("Injector thread panicked");
                }
            }
        }
        drop(finished);
        debug!("Injector threads stopped");

        // join and clear every slot; EP0's synthetic endpoint goes with
        // out[0]. Joins run with no lock held.
        for index in 0..ENDPOINT_SLOTS {
            for direction in [Direction::In, Direction::Out] {
                let mut contents = {
                    let mut slots = self.slots.lock().unwrap();
                    std::mem::take(slots.slot_mut(direction, index))
                };
                if let Some(thread) = contents.reader_thread.take() {
                    if thread.join().is_err() {
                        warn!("Reader thread for endpoint {} panicked", index);
                    }
                }
                if let Some(thread) = contents.writer_thread.take() {
                    if thread.join().is_err() {
                        warn!("Writer thread for endpoint {} panicked", index);
                    }
                }
            }
        }
        debug!("Relayer threads stopped");

        let device_proxy = self.device_proxy.lock().unwrap().clone();
        let host_proxy = self.host_proxy.lock().unwrap().clone();

        // release the interfaces claimed during bring-up
        {
            let device_guard = self.device.lock().unwrap();
            if let (Some(proxy), Some(device)) = (device_proxy.as_ref(), device_guard.as_ref()) {
                let count = device.active_configuration().num_interfaces();
                debug!("Releasing {} interfaces", count);
                for interface in 0..count {
                    if let Err(e) = proxy.release_interface(interface) {
                        warn!("Failed to release interface {}: {}", interface, e);
                    }
                }
            }
        }

        // host first, so the upstream sees the device vanish before the
        // downstream link drops
        if let Some(proxy) = host_proxy {
            debug!("Disconnecting host proxy");
            proxy.disconnect();
        }
        if let Some(proxy) = device_proxy {
            debug!("Disconnecting device proxy");
            proxy.disconnect();
        }

        // the manager owns the device model; it dies here
        *self.device.lock().unwrap() = None;

        self.state.store(final_state);
        info!("Teardown complete: state {}", final_state);
    }
}

fn spawn_worker(name: &str, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("Failed to spawn relay worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterAction;
    use usb::Packet;

    struct NullFilter;

    impl PacketFilter for NullFilter {
        fn filter(&self, _packet: &Packet) -> FilterAction {
            FilterAction::Pass
        }
    }

    #[test]
    fn test_new_manager_is_idle() {
        let manager = RelayManager::new(RelayConfig::default());
        assert_eq!(manager.state(), RelayState::Idle);
        assert_eq!(manager.filter_count(), 0);
        assert_eq!(manager.injector_count(), 0);
        assert_eq!(manager.live_relayer_threads(), 0);
        assert!(manager.active_endpoints().is_empty());
    }

    #[test]
    fn test_registry_mutation_while_idle() {
        let manager = RelayManager::new(RelayConfig::default());
        manager.add_filter(Arc::new(NullFilter));
        manager.add_filter(Arc::new(NullFilter));
        assert_eq!(manager.filter_count(), 2);

        let removed = manager.remove_filter(0, false);
        assert!(removed.is_some());
        assert_eq!(manager.filter_count(), 1);

        // free_memory drops the handle instead of returning it
        assert!(manager.remove_filter(0, true).is_none());
        assert_eq!(manager.filter_count(), 0);
    }

    #[test]
    fn test_remove_out_of_bounds_is_noop() {
        let manager = RelayManager::new(RelayConfig::default());
        assert!(manager.remove_filter(3, false).is_none());
        assert!(manager.remove_injector(0, true).is_none());
        assert_eq!(manager.filter_count(), 0);
    }

    #[test]
    fn test_start_without_plugins_fails_back_to_idle() {
        let manager = RelayManager::new(RelayConfig::default());
        let err = manager.start_control_relaying().unwrap_err();
        assert!(matches!(err, RelayError::MissingProxy("device")));
        assert_eq!(manager.state(), RelayState::Idle);
    }

    #[test]
    fn test_stop_is_noop_when_idle() {
        let manager = RelayManager::new(RelayConfig::default());
        manager.stop_relaying();
        assert_eq!(manager.state(), RelayState::Idle);
    }

    #[test]
    fn test_reset_is_noop_when_idle() {
        let manager = RelayManager::new(RelayConfig::default());
        manager.reset();
        assert_eq!(manager.state(), RelayState::Idle);
    }
}
