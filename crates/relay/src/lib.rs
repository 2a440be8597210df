//! USB man-in-the-middle relay core
//!
//! The orchestrator between two USB transports: a device-side proxy that
//! terminates the downstream physical device and a host-side proxy that
//! presents an identical device upstream. Every endpoint gets its own
//! pipeline of preemptive worker threads,
//!
//! ```text
//! source proxy -> RelayReader -> PacketQueue -> RelayWriter -> sink proxy
//! ```
//!
//! with packet filters applied by the writer and injector threads merging
//! synthetic packets into writer auxiliary inputs. The `RelayManager`
//! owns all of it and drives the lifecycle: checkpointed control
//! bring-up, data bring-up triggered by SET_CONFIGURATION, graceful stop,
//! setup abort, and bus reset.

pub mod config;
pub mod error;
pub mod filter;
pub mod injector;
pub mod manager;
pub mod mock;
pub mod plugins;
pub mod proxy;
pub mod queue;
pub mod reader;
pub mod registry;
mod spinner;
pub mod state;
pub mod writer;

pub use common::setup_logging;
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use filter::{FilterAction, FilterRegistry, PacketFilter};
pub use injector::{InjectionPorts, Injector, InjectorRegistry};
pub use manager::RelayManager;
pub use plugins::PluginSet;
pub use proxy::{probe_device, ConnectStatus, DeviceProxy, HostProxy, ProxyError, ProxyHandle};
pub use queue::{packet_queue, PacketReceiver, PacketSender, PopResult, PushResult};
pub use reader::RelayReader;
pub use registry::Registry;
pub use state::{RelayState, StopFlag};
pub use writer::RelayWriter;
