//! Bluelink - client for a Bluetooth audio transport daemon
//!
//! Finds a transport for a chosen device, keeps it attached as the daemon
//! reports transports coming and going, and streams PCM frames between the
//! application and the transport's byte channel.
//!
//! - [`registry`]: request/response control channel
//! - [`events`]: daemon event subscription
//! - [`attach`]: device attach state machine
//! - [`bridge`]: ring buffer and streaming worker
//! - [`handle`]: everything above behind one object

pub mod attach;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod registry;
pub mod sys;

#[cfg(test)]
mod testing;

pub use attach::{AttachMachine, AttachOutcome, AttachState, DeviceFilter};
pub use bridge::{BridgeState, ChannelSource, Positions, StreamParams, StreamingBridge};
pub use channel::ByteChannel;
pub use config::{load_link_config, save_link_config, DelayConfig, LinkConfig, StreamConfig};
pub use error::{LinkError, LinkResult};
pub use events::{Event, EventSubscriber, ShutdownHandle};
pub use handle::Handle;
pub use registry::{RegistryClient, TransportRegistry};
