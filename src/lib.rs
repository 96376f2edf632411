//! agentmesh: peer node middleware
//!
//! Nodes host agents and services. Agents are identities whose private keys
//! stay locked behind a passphrase or behind group membership; envelopes
//! persist data encrypted once per reader. Services are invoked by name and
//! version, locally or on another node, with retries when an instance stops
//! answering.

pub mod agent;
pub mod concurrency;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod message;
pub mod node;
pub mod service;
pub mod testing;
pub mod tooling;
pub mod types;

pub use agent::{Agent, AgentKind, GroupAgent, ServiceAgent, UserAgent};
pub use error::NodeError;
pub use node::{Node, NodeStatus, SendMode};
pub use service::{Service, ServiceFault, Value};
pub use types::{AgentId, MessageId, NodeId, TopicId};
