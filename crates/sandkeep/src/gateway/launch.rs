//! Gateway environment and argument construction.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::readiness::GatewayEndpoint;
use super::registry::{CommandSignature, LaunchSpec};
use crate::config::GatewayConfig;
use crate::secrets::SecretSource;

/// Copy secret `from` into the gateway environment as `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvMapping {
    pub from: String,
    pub to: String,
}

impl EnvMapping {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    fn same(name: &str) -> Self {
        Self::new(name, name)
    }

    /// Default mappings. Later entries win when both sources are set.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::same("ANTHROPIC_API_KEY"),
            Self::same("OPENAI_API_KEY"),
            Self::same("ANTHROPIC_BASE_URL"),
            Self::new("AI_GATEWAY_API_KEY", "ANTHROPIC_API_KEY"),
            Self::new("AI_GATEWAY_BASE_URL", "ANTHROPIC_BASE_URL"),
            Self::new("GATEWAY_TOKEN", "CLAWDBOT_GATEWAY_TOKEN"),
            Self::new("DEV_MODE", "CLAWDBOT_DEV_MODE"),
            Self::same("TELEGRAM_BOT_TOKEN"),
            Self::same("DISCORD_BOT_TOKEN"),
            Self::same("SLACK_BOT_TOKEN"),
            Self::same("SLACK_APP_TOKEN"),
        ]
    }
}

/// What to do with a matching process whose port does not answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HalfStartedPolicy {
    /// Treat it as still starting and wait for readiness.
    #[default]
    Wait,
    /// Treat it as hung: terminate it and start a fresh instance.
    Restart,
}

/// Resolved start parameters for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayLaunch {
    pub spec: LaunchSpec,
    pub signature: CommandSignature,
    pub endpoint: GatewayEndpoint,
    pub bind: String,
    pub stale_lock_files: Vec<PathBuf>,
}

impl GatewayLaunch {
    pub fn new(config: &GatewayConfig, secrets: &dyn SecretSource) -> Self {
        let env = build_env(config, secrets);
        let token = env.get(&config.token_env).cloned();

        let mut args = vec![
            config.subcommand.clone(),
            "--port".to_string(),
            config.port.to_string(),
            "--bind".to_string(),
            config.bind.clone(),
        ];
        args.extend(config.extra_args.iter().cloned());
        if let Some(ref token) = token {
            args.push("--token".to_string());
            args.push(token.clone());
        }

        Self {
            spec: LaunchSpec {
                binary: config.binary.clone(),
                args,
                env,
                cwd: config.working_dir.as_ref().map(PathBuf::from),
                port: config.port,
            },
            signature: CommandSignature::new(&config.binary, vec![config.subcommand.clone()]),
            endpoint: GatewayEndpoint::local(config.port, token),
            bind: config.bind.clone(),
            stale_lock_files: config.stale_lock_files.iter().map(PathBuf::from).collect(),
        }
    }
}

/// Apply `env_map` in order, then literal `env` entries.
pub fn build_env(config: &GatewayConfig, secrets: &dyn SecretSource) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for mapping in &config.env_map {
        if let Some(value) = secrets.get(&mapping.from) {
            env.insert(mapping.to.clone(), value);
        }
    }
    for (key, value) in &config.env {
        env.insert(key.clone(), value.clone());
    }
    env
}
