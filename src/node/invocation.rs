//! Service invocation: resolve, execute locally or remotely, retry.

use crate::agent::Agent;
use crate::crypto::seal_for;
use crate::error::NodeError;
use crate::message::{Message, MessageContent, RmiTask};
use crate::node::context::ExecutionContext;
use crate::node::observer::{Event, NodeEvent};
use crate::node::service_cache::{Locality, ServiceInstance};
use crate::node::Node;
use crate::service::{describe_args, resolve, FaultKind, ServiceFault, ServiceNameVersion, Value};
use crate::types::{AgentId, NodeId};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

impl Node {
    /// Invoke `method` of the best instance of `service` as `executing`.
    ///
    /// `service` is `name` or `name@version`; a version prefix matches every
    /// version it is a prefix of unless `exact_version` is set. Instances
    /// that time out or vanish are dropped from the cache and the call is
    /// resolved again, up to `invocation_retry_count` attempts.
    pub async fn invoke(
        self: &Arc<Self>,
        executing: &Agent,
        service: &str,
        method: &str,
        params: Vec<Value>,
        exact_version: bool,
        local_only: bool,
    ) -> Result<Value, NodeError> {
        self.ensure_running()?;
        executing.key_pair()?;
        let requested: ServiceNameVersion = service.parse()?;

        self.notify(
            NodeEvent::new(Event::InvocationStarted, self.id())
                .agent(executing.id())
                .detail(format!("{}.{}", requested, method)),
        );

        let attempts = self.settings().invocation_retry_count.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            let result = match self
                .service_cache()
                .resolve(&requested, exact_version, local_only, executing.id())
                .await
            {
                Ok(instance) => self
                    .invoke_instance(executing, &instance, method, params.clone())
                    .await
                    .map_err(|e| (Some(instance), e)),
                Err(e) => Err((None, e)),
            };

            match result {
                Ok(value) => {
                    self.notify(
                        NodeEvent::new(Event::InvocationSucceeded, self.id())
                            .agent(executing.id())
                            .detail(format!("{}.{}", requested, method)),
                    );
                    return Ok(value);
                }
                Err((instance, err)) if err.is_retryable() => {
                    warn!(
                        service = %requested,
                        method,
                        attempt,
                        error = %err,
                        "Invocation attempt failed, retrying"
                    );
                    if let Some(instance) = &instance {
                        self.service_cache().invalidate(instance);
                        if let Locality::Remote(node) = instance.locality {
                            self.notify(
                                NodeEvent::new(Event::ServiceCacheInvalidated, self.id())
                                    .remote_node(node)
                                    .detail(instance.service.to_string()),
                            );
                        }
                    }
                    self.notify(
                        NodeEvent::new(Event::InvocationRetry, self.id())
                            .agent(executing.id())
                            .detail(err.to_string()),
                    );
                    last = Some(err);
                }
                Err((_, err)) => {
                    self.notify(
                        NodeEvent::new(Event::InvocationFailed, self.id())
                            .agent(executing.id())
                            .detail(err.to_string()),
                    );
                    return Err(err);
                }
            }
        }

        let last = last.unwrap_or_else(|| NodeError::ServiceUnavailable(requested.to_string()));
        self.notify(
            NodeEvent::new(Event::InvocationFailed, self.id())
                .agent(executing.id())
                .detail(last.to_string()),
        );
        Err(NodeError::InvocationFailed {
            attempts,
            last: Box::new(last),
        })
    }

    async fn invoke_instance(
        self: &Arc<Self>,
        executing: &Agent,
        instance: &ServiceInstance,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, NodeError> {
        match instance.locality {
            Locality::Local => {
                let service_agent = self
                    .local_agent(instance.agent)
                    .ok_or_else(|| NodeError::ServiceUnavailable(instance.service.to_string()))?;
                self.invoke_local_instance(executing, &service_agent, method, params)
                    .await
            }
            Locality::Remote(node) => {
                self.invoke_remotely(executing, instance.agent, node, &instance.service, method, params)
                    .await
            }
        }
    }

    /// Run `method` on the instance held by `service_agent` on a blocking
    /// worker. The caller waits without a deadline.
    pub(crate) async fn invoke_local_instance(
        self: &Arc<Self>,
        executing: &Agent,
        service_agent: &Agent,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, NodeError> {
        let hosted = service_agent
            .as_service()
            .ok_or_else(|| NodeError::InvalidArgument(format!("agent {} hosts no service", service_agent.id())))?;
        let service_name = hosted.service().to_string();
        let instance = hosted
            .instance()
            .cloned()
            .ok_or_else(|| NodeError::ServiceUnavailable(service_name.clone()))?;

        let signatures = instance.methods();
        let signature = resolve(&signatures, method, &params)
            .cloned()
            .ok_or_else(|| NodeError::MethodNotFound {
                service: service_name.clone(),
                method: method.to_string(),
                signature: describe_args(&params),
            })?;
        let args = signature.coerce(params);

        let caller = self.contexts().get_or_create(executing)?;
        caller.touch();
        let context = ExecutionContext::new(caller, service_agent.clone(), self.clone(), Handle::current());
        debug!(service = %service_name, method = %signature, caller = %executing.id(), "Executing locally");

        let outcome = tokio::task::spawn_blocking(move || instance.execute(&context, &signature, args))
            .await
            .map_err(|e| NodeError::InternalServiceFailure {
                service: service_name.clone(),
                fault: ServiceFault::application(format!("worker failed: {}", e)),
            })?;

        outcome.map_err(|fault| match fault.kind {
            FaultKind::Security => NodeError::AccessDenied(fault.message),
            FaultKind::Application => NodeError::InternalServiceFailure {
                service: service_name,
                fault,
            },
        })
    }

    async fn invoke_remotely(
        self: &Arc<Self>,
        executing: &Agent,
        service_agent: AgentId,
        node: NodeId,
        service: &ServiceNameVersion,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, NodeError> {
        let passphrase = match executing.passphrase() {
            Some(passphrase) if self.settings().forward_passphrase => {
                match self.get_agent(service_agent) {
                    Ok(target) => Some(seal_for(target.public_keys(), passphrase.as_bytes())?),
                    Err(e) => {
                        warn!(
                            service_agent = %service_agent,
                            error = %e,
                            "Cannot seal passphrase for unknown service agent"
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        let task = RmiTask {
            service: service.to_string(),
            method: method.to_string(),
            params,
            passphrase,
        };
        let message = Message::new(
            executing,
            service_agent,
            MessageContent::Rmi(task),
            self.settings().message_timeout(),
        )?;
        info!(service = %service, method, remote_node = %node, "Invoking remotely");

        let answer = self.send_message_and_wait_for_answer(message, Some(node)).await?;
        match answer.into_content() {
            MessageContent::RmiResult(value) => Ok(value),
            MessageContent::RmiException(fault) => Err(fault.into_error(node, &service.to_string())),
            MessageContent::RmiUnlock { node } => Err(NodeError::UnlockNeeded { node }),
            other => Err(NodeError::InternalServiceFailure {
                service: service.to_string(),
                fault: ServiceFault::application(format!(
                    "unexpected answer {:?}",
                    other
                )),
            }),
        }
    }
}
