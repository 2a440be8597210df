//! Synthetic packet injectors
//!
//! An injector runs on its own thread for the whole relaying session,
//! producing packets that are merged into the auxiliary input of every
//! writer its predicates accepted. EP0 ports are attached during control
//! bring-up; data-endpoint ports are attached later, from `set_config`,
//! while the injector is already listening, so the routing table is
//! shared and updated behind a lock.

use crate::queue::{PacketSender, PushResult};
use crate::registry::Registry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use usb::device::{Configuration, Device, Endpoint, Interface};
use usb::Packet;

/// How long an injection waits for space in a writer's auxiliary input
const INJECT_TIMEOUT: Duration = Duration::from_millis(50);

/// Asynchronous producer of synthetic packets
pub trait Injector: Send + Sync {
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

    /// Blocking production loop; must return promptly after `please_stop`
    fn listen(&self, ports: &InjectionPorts);

    /// Cooperative shutdown, callable from any thread
    fn please_stop(&self);
}

/// Routing table from endpoint address to a writer's auxiliary input
///
/// One table per running injector. An injector may fan out to several
/// endpoints; `inject` routes each packet by its own endpoint address.
#[derive(Clone, Default)]
pub struct InjectionPorts {
    inner: Arc<Mutex<HashMap<u8, PacketSender>>>,
}

impl InjectionPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach (or replace) the port for an endpoint address
    pub fn attach(&self, endpoint: u8, sender: PacketSender) {
        self.inner.lock().unwrap().insert(endpoint, sender);
    }

    pub fn contains(&self, endpoint: u8) -> bool {
        self.inner.lock().unwrap().contains_key(&endpoint)
    }

    pub fn attached(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Route one packet by its endpoint address; returns whether the
    /// packet was accepted by a writer's auxiliary input
    pub fn inject(&self, packet: Packet) -> bool {
        let sender = self.inner.lock().unwrap().get(&packet.endpoint).cloned();
        let Some(sender) = sender else {
            debug!(
                "Injection for endpoint {:#04x} has no attached writer",
                packet.endpoint
            );
            return false;
        };
        match sender.push_timeout(packet, INJECT_TIMEOUT) {
            PushResult::Sent => true,
            PushResult::Full(p) => {
                warn!(
                    "Injection dropped: endpoint {:#04x} auxiliary input full",
                    p.endpoint
                );
                false
            }
            PushResult::Closed(_) => false,
        }
    }

    /// Drop every attached port
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// Ordered injector registry
pub type InjectorRegistry = Registry<dyn Injector>;
