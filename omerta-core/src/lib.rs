//! OmertaMesh node core: the wire dispatcher, NAT-aware endpoint routing, gossip
//! directory, relay, and Cloister key-agreement service that together implement one
//! joined network. See [`node::Mesh`] and [`node::Node`] for the entry points.

pub mod channel;
pub mod cloister;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod endpoint_manager;
pub mod error;
pub mod events;
pub mod gossip;
pub mod holepunch;
pub mod keepalive;
pub mod log;
pub mod nat_detector;
pub mod node;
pub mod peer;
pub mod peer_store;
pub mod persistence;
pub mod relay;

pub use config::{BootstrapPeer, Config};
pub use error::{Error, Result};
pub use events::{Event, EventSubscription};
pub use node::{format_invite_link, Mesh, NetworkSecret, Node, PingResult};
