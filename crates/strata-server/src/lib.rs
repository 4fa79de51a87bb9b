//! Layered session server.
//!
//! Peers bootstrap on the command layer with credentials from their login
//! circuit, then follow MakeConnection invitations to the other layers, each
//! carrying a single-use credential held in the [`Rendezvous`] registry.
#![forbid(unsafe_code)]

pub mod circuit;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod hub;
pub mod layers;
pub mod listener;
pub mod rendezvous;
pub mod scene;
pub mod scope;
pub mod transport;

pub use circuit::{Circuit, CircuitAuthority, MemoryCircuits};
pub use config::{Args, ServerConfig};
pub use connection::{Connection, Dispatch, MessageProcessor};
pub use error::{HandshakeError, LayerError, ServerError, SessionError, TransportError};
pub use hub::Hub;
pub use layers::LayerInstance;
pub use rendezvous::{Rendezvous, WaitingInfo};
pub use scene::{MemoryScene, Scene, SceneEvent, SceneItem, SceneTopic, Subscription};
pub use scope::Scope;
pub use transport::{Transport, TransportHandle, TransportState};
