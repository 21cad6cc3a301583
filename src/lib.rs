//! Node graph discovery and correlated remote calls over a pub/sub transport
//! with queries.
//!
//! The transport only knows key expressions, liveliness tokens and queries.
//! This crate derives a node graph from liveliness tokens
//! ([`discovery`], [`graph_cache`]) and turns queries into correlated,
//! QoS-bounded service calls ([`client`], [`service`]) whose state outlives
//! shutdown until the transport has released every callback.

#![deny(missing_docs)]

pub mod attachment;
pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod graph_cache;
pub mod keyexpr;
pub mod liveliness;
pub mod node;
pub mod service;
pub mod transport;
pub mod wait_set;

// Re-export key types
pub use attachment::{AttachmentData, Gid, ServiceInfo};
pub use client::{ClientData, ReceivedReply};
pub use codec::{MessageCodec, ProstCodec, RawCodec, TypeInfo};
pub use config::Config;
pub use context::Context;
pub use discovery::{DiscoveryController, DiscoveryState, GraphEvent, GraphEventStream};
pub use error::{Error, Result};
pub use graph_cache::GraphCache;
pub use liveliness::{Entity, EntityKind, QosProfile};
pub use node::NodeData;
pub use service::{RequestId, ServiceData};
pub use transport::local::{LocalHub, LocalSession};
pub use transport::Session;
pub use wait_set::{GuardCondition, WaitSetData};
