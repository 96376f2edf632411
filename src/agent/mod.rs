//! Agent Security Model
//!
//! Every actor in the mesh is an agent: users, services, groups of agents and
//! monitoring agents. Agents carry a key pair whose private half is only
//! available while the agent is unlocked. Passphrase agents unlock with a
//! passphrase; groups unlock through any unlocked member.

pub mod codec;
pub mod group;
pub mod identity;
pub mod passphrase;
pub mod repository;
pub mod service;
pub mod storage;
pub mod user;
pub mod user_manager;

pub use codec::{AgentCodec, JsonAgentCodec};
pub use group::GroupAgent;
pub use identity::{Agent, AgentKind, LockState};
pub use repository::EnvelopeAgentRepository;
pub use service::ServiceAgent;
pub use storage::{AgentStorage, BasicAgentStorage};
pub use user::{MonitoringAgent, UserAgent};
pub use user_manager::{UserAgentManager, UserClaims};
