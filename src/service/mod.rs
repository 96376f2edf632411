//! Services hosted by a node.
//!
//! A service publishes its method signatures and executes resolved calls
//! against an [`ExecutionContext`]. Failures inside a service are reported as
//! [`ServiceFault`]s; the node wraps them into its own error taxonomy.

pub mod method;
pub mod version;

pub use method::{describe_args, resolve, MethodSignature, ParamType, Value};
pub use version::{ServiceNameVersion, ServiceVersion};

use crate::error::NodeError;
use crate::node::context::ExecutionContext;
use crate::types::AgentId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// The caller is not allowed to perform the operation
    Security,
    /// Any other failure raised by service code
    Application,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ServiceFault {
    pub kind: FaultKind,
    pub message: String,
}

impl ServiceFault {
    pub fn security(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Security,
            message: message.into(),
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Application,
            message: message.into(),
        }
    }
}

/// Nested invocation failures seen from inside service code.
impl From<NodeError> for ServiceFault {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::AccessDenied(reason) => ServiceFault::security(reason),
            NodeError::InternalServiceFailure { fault, .. } => fault,
            other => ServiceFault::application(other.to_string()),
        }
    }
}

pub trait Service: Send + Sync + 'static {
    fn name_version(&self) -> ServiceNameVersion;

    fn methods(&self) -> Vec<MethodSignature>;

    /// Run a resolved method. `params` are already coerced to `method.params`.
    fn execute(
        &self,
        context: &ExecutionContext,
        method: &MethodSignature,
        params: Vec<Value>,
    ) -> Result<Value, ServiceFault>;

    /// Called when the service is attached to its agent.
    fn on_start(&self, _agent: AgentId) {}

    fn on_stop(&self) {}
}
