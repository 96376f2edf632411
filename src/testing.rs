//! Sample service used by the `demo` command and the test suites.

use crate::node::context::ExecutionContext;
use crate::service::{
    MethodSignature, ParamType, Service, ServiceFault, ServiceNameVersion, ServiceVersion, Value,
};
use crate::types::AgentId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

pub const COUNTER_SERVICE: &str = "counter";

/// A stateful counter with a handful of methods that exercise overloads,
/// faults, nested calls and envelopes.
pub struct CounterService {
    version: ServiceVersion,
    counter: AtomicI64,
    calls: AtomicUsize,
    started_as: Mutex<Option<AgentId>>,
}

impl CounterService {
    pub fn new() -> Self {
        Self::with_version(ServiceVersion::new(&[1, 0]))
    }

    pub fn with_version(version: ServiceVersion) -> Self {
        Self {
            version,
            counter: AtomicI64::new(0),
            calls: AtomicUsize::new(0),
            started_as: Mutex::new(None),
        }
    }

    /// Number of `execute` calls served by this instance.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn started_as(&self) -> Option<AgentId> {
        *self.started_as.lock()
    }
}

impl Default for CounterService {
    fn default() -> Self {
        Self::new()
    }
}

fn str_arg(params: &[Value], index: usize) -> Result<&str, ServiceFault> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceFault::application(format!("argument {} must be a string", index)))
}

fn int_arg(params: &[Value], index: usize) -> Result<i64, ServiceFault> {
    params
        .get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| ServiceFault::application(format!("argument {} must be an integer", index)))
}

impl Service for CounterService {
    fn name_version(&self) -> ServiceNameVersion {
        ServiceNameVersion::new(COUNTER_SERVICE, self.version.clone())
    }

    fn methods(&self) -> Vec<MethodSignature> {
        vec![
            MethodSignature::new("inc", &[ParamType::Int]),
            MethodSignature::new("get_counter", &[]),
            MethodSignature::new("add", &[ParamType::Int, ParamType::Int]),
            MethodSignature::new("add", &[ParamType::Long, ParamType::Long]),
            MethodSignature::new("add", &[ParamType::Double, ParamType::Double]),
            MethodSignature::new("echo", &[ParamType::Any]),
            MethodSignature::new("fail", &[ParamType::Str]),
            MethodSignature::new("forbidden", &[]),
            MethodSignature::new("whoami", &[]),
            MethodSignature::new("version", &[]),
            MethodSignature::new("call", &[ParamType::Str, ParamType::Str]),
            MethodSignature::new("call_as_service", &[ParamType::Str, ParamType::Str]),
            MethodSignature::new("store", &[ParamType::Str, ParamType::Str]),
            MethodSignature::new("fetch", &[ParamType::Str]),
            MethodSignature::new("sleep", &[ParamType::Long]),
        ]
    }

    fn execute(
        &self,
        context: &ExecutionContext,
        method: &MethodSignature,
        params: Vec<Value>,
    ) -> Result<Value, ServiceFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        debug!(method = %method, caller = %context.caller().id(), "Counter service call");

        match method.name.as_str() {
            "inc" => {
                let n = int_arg(&params, 0)?;
                let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Value::Int((n + counter) as i32))
            }
            "get_counter" => Ok(Value::Long(self.counter.load(Ordering::SeqCst))),
            "add" => match (params.first(), params.get(1)) {
                (Some(Value::Int(a)), Some(Value::Int(b))) => Ok(Value::Int(a.wrapping_add(*b))),
                (Some(Value::Long(a)), Some(Value::Long(b))) => Ok(Value::Long(a.wrapping_add(*b))),
                (Some(Value::Double(a)), Some(Value::Double(b))) => Ok(Value::Double(a + b)),
                _ => Err(ServiceFault::application("add takes two numbers of one type")),
            },
            "echo" => Ok(params.into_iter().next().unwrap_or(Value::Null)),
            "fail" => Err(ServiceFault::application(str_arg(&params, 0)?)),
            "forbidden" => Err(ServiceFault::security("caller may not do this")),
            "whoami" => Ok(Value::Str(context.caller().id().to_string())),
            "version" => Ok(Value::Str(self.version.to_string())),
            "call" => {
                let service = str_arg(&params, 0)?;
                let target = str_arg(&params, 1)?;
                Ok(context.invoke(service, target, Vec::new())?)
            }
            "call_as_service" => {
                let service = str_arg(&params, 0)?;
                let target = str_arg(&params, 1)?;
                Ok(context.invoke_as_service(service, target, Vec::new())?)
            }
            "store" => {
                let identifier = str_arg(&params, 0)?;
                let content = str_arg(&params, 1)?;
                let envelope = context.store_envelope(identifier, content.as_bytes())?;
                Ok(Value::Long(envelope.version() as i64))
            }
            "fetch" => {
                let bytes = context.fetch_envelope(str_arg(&params, 0)?)?;
                String::from_utf8(bytes)
                    .map(Value::Str)
                    .map_err(|_| ServiceFault::application("stored content is not utf-8"))
            }
            "sleep" => {
                let millis = int_arg(&params, 0)?.max(0) as u64;
                std::thread::sleep(Duration::from_millis(millis));
                Ok(Value::Null)
            }
            other => Err(ServiceFault::application(format!("unknown method {}", other))),
        }
    }

    fn on_start(&self, agent: AgentId) {
        *self.started_as.lock() = Some(agent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::resolve;

    #[test]
    fn test_add_overloads_resolve_by_widening() {
        let service = CounterService::new();
        let methods = service.methods();

        let chosen = resolve(&methods, "add", &[Value::Int(1), Value::Int(2)]).unwrap();
        assert_eq!(chosen.params, vec![ParamType::Int, ParamType::Int]);

        let chosen = resolve(&methods, "add", &[Value::Short(1), Value::Long(2)]).unwrap();
        assert_eq!(chosen.params, vec![ParamType::Long, ParamType::Long]);

        let chosen = resolve(&methods, "add", &[Value::Float(1.0), Value::Int(2)]).unwrap();
        assert_eq!(chosen.params, vec![ParamType::Double, ParamType::Double]);

        assert!(resolve(&methods, "add", &[Value::Str("x".into()), Value::Int(2)]).is_none());
    }

    #[test]
    fn test_name_version() {
        let service = CounterService::with_version(ServiceVersion::new(&[2, 1]));
        assert_eq!(service.name_version().to_string(), "counter@2.1");
    }
}
