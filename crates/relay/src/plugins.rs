//! Plugin handoff
//!
//! Plugin discovery and configuration parsing happen elsewhere; whatever
//! loader is in use hands the manager one assembled bundle, from which it
//! takes ownership of the two proxies and seeds the registries.

use crate::filter::PacketFilter;
use crate::injector::Injector;
use crate::proxy::{DeviceProxy, HostProxy};
use std::sync::Arc;

/// Everything the configuration loader produced for one relay session
pub struct PluginSet {
    pub device_proxy: Arc<dyn DeviceProxy>,
    pub host_proxy: Arc<dyn HostProxy>,
    /// Filters in registration order
    pub filters: Vec<Arc<dyn PacketFilter>>,
    /// Injectors in registration order
    pub injectors: Vec<Arc<dyn Injector>>,
}

impl PluginSet {
    pub fn new(device_proxy: Arc<dyn DeviceProxy>, host_proxy: Arc<dyn HostProxy>) -> Self {
        Self {
            device_proxy,
            host_proxy,
            filters: Vec::new(),
            injectors: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn PacketFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_injector(mut self, injector: Arc<dyn Injector>) -> Self {
        self.injectors.push(injector);
        self
    }
}
