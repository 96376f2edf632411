//! CLI Tooling
//!
//! Every command returns its output as a string; the binary prints it or
//! reports the error and exits non-zero.

use crate::agent::{Agent, AgentCodec, JsonAgentCodec, UserAgent};
use crate::config::{ConfigLoader, LoggingConfig, MeshConfig};
use crate::error::NodeError;
use crate::node::{Event, LocalNetwork, MemoryObserver};
use crate::service::Value;
use crate::testing::{CounterService, COUNTER_SERVICE};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// agentmesh - peer node middleware for agent-based service invocation
#[derive(Parser)]
#[command(name = "agentmesh")]
#[command(about = "Host services and invoke them across a mesh of peer nodes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file, file+stderr, both)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output includes "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Logging settings from the config file with command-line flags applied.
    pub fn logging_config(&self, base: &LoggingConfig) -> LoggingConfig {
        let mut config = base.clone();
        if let Some(level) = &self.log_level {
            config.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.format = format.clone();
        }
        if let Some(output) = &self.log_output {
            config.output = output.clone();
        }
        if self.log_file.is_some() {
            config.file = self.log_file.clone();
        }
        config
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a user agent and print its locked, encoded form
    CreateUser {
        /// Passphrase protecting the agent's private key
        #[arg(long)]
        passphrase: String,

        #[arg(long)]
        login: Option<String>,

        #[arg(long)]
        email: Option<String>,
    },
    /// Run the counter service on one in-process node and call it from another
    Demo {
        /// Argument passed to `inc`
        #[arg(long, default_value_t = 10)]
        value: i32,

        /// Number of calls
        #[arg(long, default_value_t = 2)]
        calls: usize,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Print the effective configuration
    Config,
}

/// CLI context holding the loaded configuration
pub struct CliContext {
    config: MeshConfig,
}

impl CliContext {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, NodeError> {
        let config = match config_path {
            Some(path) => ConfigLoader::load_from_file(&path)?,
            None => ConfigLoader::load()?,
        };
        Ok(Self { config })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn execute(&self, command: &Commands) -> Result<String, NodeError> {
        match command {
            Commands::CreateUser {
                passphrase,
                login,
                email,
            } => self.handle_create_user(passphrase, login.as_deref(), email.as_deref()),
            Commands::Demo {
                value,
                calls,
                format,
            } => self.handle_demo(*value, *calls, format),
            Commands::Config => serde_json::to_string_pretty(&self.config)
                .map_err(|e| NodeError::Serialization(e.to_string())),
        }
    }

    fn handle_create_user(
        &self,
        passphrase: &str,
        login: Option<&str>,
        email: Option<&str>,
    ) -> Result<String, NodeError> {
        let mut user = UserAgent::create_with_kdf(passphrase, self.config.node.kdf())?;
        if let Some(login) = login {
            user.set_login(login)?;
        }
        if let Some(email) = email {
            user.set_email(email)?;
        }
        info!(agent_id = %user.id(), "Created user agent");
        let agent: Agent = user.into();
        let encoded = JsonAgentCodec.encode(&agent)?;
        String::from_utf8(encoded).map_err(|e| NodeError::Serialization(e.to_string()))
    }

    fn handle_demo(&self, value: i32, calls: usize, format: &str) -> Result<String, NodeError> {
        if format != "text" && format != "json" {
            return Err(NodeError::InvalidArgument(format!(
                "Invalid format: {} (must be 'text' or 'json')",
                format
            )));
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| NodeError::Config(format!("Failed to start runtime: {}", e)))?;
        let settings = self.config.node.clone();

        runtime.block_on(async move {
            let network = LocalNetwork::new();
            let host = network.create_node(settings.clone())?;
            let client = network.create_node(settings.clone())?;
            let observer = Arc::new(MemoryObserver::new());
            client.add_observer(observer.clone());
            host.launch().await?;
            client.launch().await?;

            let service = host
                .start_service(Arc::new(CounterService::new()), "demo-service")
                .await?;
            let mut user = UserAgent::create_with_kdf("demo-user", settings.kdf())?;
            user.set_login("demo")?;
            let user: Agent = user.into();
            client.store_agent(&user)?;
            client.register_agent(user.clone()).await?;

            let started = Instant::now();
            let mut results = Vec::with_capacity(calls);
            for _ in 0..calls {
                let result = client
                    .invoke(&user, COUNTER_SERVICE, "inc", vec![Value::Int(value)], false, false)
                    .await?;
                results.push(result);
            }
            let elapsed = started.elapsed();

            let output = if format == "json" {
                let values: Vec<String> = results.iter().map(ToString::to_string).collect();
                serde_json::to_string_pretty(&json!({
                    "host": host.id().to_string(),
                    "client": client.id().to_string(),
                    "service_agent": service.to_string(),
                    "caller": user.id().to_string(),
                    "results": values,
                    "retries": observer.count(Event::InvocationRetry),
                    "elapsed_ms": elapsed.as_millis() as u64,
                }))
                .map_err(|e| NodeError::Serialization(e.to_string()))?
            } else {
                let mut out = format!(
                    "Service {} on node {} (agent {})\n",
                    COUNTER_SERVICE,
                    host.id(),
                    service
                );
                for (index, result) in results.iter().enumerate() {
                    out.push_str(&format!("  call {}: inc({}) = {}\n", index + 1, value, result));
                }
                out.push_str(&format!(
                    "{} calls from node {} in {}ms",
                    calls,
                    client.id(),
                    elapsed.as_millis()
                ));
                out
            };

            client.shutdown().await;
            host.shutdown().await;
            Ok(output)
        })
    }
}
