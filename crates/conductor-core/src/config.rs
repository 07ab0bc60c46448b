//! Configuration system for Conductor.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;

/// Main configuration struct for Conductor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model backend settings
    pub model: ModelConfig,
    /// Protocol client settings
    pub rpc: RpcSettings,
    /// Conversation/session settings
    pub session: SessionConfig,
    /// Tool servers to start, in registration order
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Backend name
    pub provider: String,
    /// Model identifier
    pub model: String,
    /// Maximum tokens per response
    pub max_tokens: u32,
    /// API key (can be set directly or via environment)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Base URL override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// System prompt sent with every request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 8192,
            api_key: None,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: None,
            system_prompt: None,
        }
    }
}

impl ModelConfig {
    /// Resolve the API key from either direct value or environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(ref key) = self.api_key {
            return Some(key.clone());
        }
        std::env::var(&self.api_key_env).ok()
    }
}

/// What the framing reader does with a line that is not a valid message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedLinePolicy {
    /// End the connection with the parse error as cause
    #[default]
    Fatal,
    /// Log the line and keep reading
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Notification methods delivered to listeners
    pub notification_routes: Vec<String>,
    /// Capacity of each notification channel
    pub notification_buffer: usize,
    /// Handling of unparseable lines
    pub malformed_lines: MalformedLinePolicy,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            notification_routes: Vec::new(),
            notification_buffer: 16,
            malformed_lines: MalformedLinePolicy::Fatal,
        }
    }
}

impl RpcSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Write the conversation to disk after each sub-round
    pub persist: bool,
    /// Override for the conversation file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Upper bound on model calls per prompt
    pub max_rounds: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persist: true,
            path: None,
            max_rounds: 25,
        }
    }
}

impl SessionConfig {
    /// Path the conversation is written to.
    pub fn conversation_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|p| p.join(".conductor"))
                .unwrap_or_else(|| PathBuf::from(".conductor"))
                .join("conversation.json")
        })
    }
}

/// How a tool server is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    /// Local subprocess speaking over stdio
    #[default]
    Process,
    /// Docker container attached over stdio
    Container,
}

/// Configuration for one tool server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unique name for this server
    pub name: String,
    /// Backend kind
    pub kind: ServerKind,
    /// Command to run (process servers)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command arguments
    pub args: Vec<String>,
    /// Environment variables set for the server
    pub env: HashMap<String, String>,
    /// Host environment variables forwarded when set
    pub forward_env: Vec<String>,
    /// Working directory (process servers)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Image to run (container servers)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Existing container to attach to (container servers)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Whether this server is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// Create a process server config.
    pub fn process(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ServerKind::Process,
            command: Some(command.into()),
            enabled: true,
            ..Default::default()
        }
    }

    /// Create a container server config running `image`.
    pub fn container(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ServerKind::Container,
            image: Some(image.into()),
            enabled: true,
            ..Default::default()
        }
    }

    /// Add arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Add environment variables.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set working directory.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Set enabled state.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Create a new empty validation result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Get only error-level issues.
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .collect()
    }

    /// Get only warning-level issues.
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
            .collect()
    }

    /// Add an error.
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning.
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue
    pub severity: IssueSeverity,
    /// Field path (e.g., "rpc.request_timeout_secs")
    pub field: String,
    /// Human-readable message
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

impl Config {
    /// Build the layered figment: defaults, user file, project file,
    /// environment, then an optional explicit file.
    pub fn figment(explicit: Option<&Path>) -> Figment {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(Self::config_dir().join("config.toml")))
            .merge(Toml::file(".conductor/config.toml"))
            .merge(Env::prefixed("CONDUCTOR_").split("__"));

        if let Some(path) = explicit {
            figment = figment.merge(Toml::file(path));
        }
        figment
    }

    /// Load configuration from all sources.
    pub fn load(explicit: Option<&Path>) -> Result<Self, figment::Error> {
        Self::figment(explicit).extract()
    }

    /// Load and validate configuration.
    pub fn load_validated(explicit: Option<&Path>) -> Result<Self, Error> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
        }

        let config = Self::load(explicit).map_err(|e| Error::Config(e.to_string()))?;
        let result = config.validate();

        if !result.is_ok() {
            let errors: Vec<String> = result
                .errors()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            return Err(Error::Validation(format!(
                "configuration is invalid:\n  {}",
                errors.join("\n  ")
            )));
        }

        for warning in result.warnings() {
            tracing::warn!(field = %warning.field, "config warning: {}", warning.message);
        }

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.model.model.is_empty() {
            result.add_error("model.model", "Model name cannot be empty");
        }

        if self.model.provider != "anthropic" {
            result.add_error(
                "model.provider",
                format!("Unknown provider '{}'. Valid values: [\"anthropic\"]", self.model.provider),
            );
        }

        if self.model.max_tokens == 0 {
            result.add_error("model.max_tokens", "max_tokens must be greater than 0");
        }

        if let Some(ref base_url) = self.model.base_url {
            if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                result.add_error("model.base_url", "base_url must start with http:// or https://");
            }
        }

        if self.model.api_key.as_ref().is_some_and(|k| k.is_empty()) {
            result.add_warning("model.api_key", "API key is empty string");
        }

        if self.rpc.request_timeout_secs == 0 {
            result.add_error("rpc.request_timeout_secs", "request timeout must be greater than 0");
        }

        if self.rpc.notification_buffer == 0 {
            result.add_error("rpc.notification_buffer", "notification_buffer must be greater than 0");
        }

        if self.rpc.notification_routes.iter().any(|m| m.is_empty()) {
            result.add_error("rpc.notification_routes", "method names cannot be empty");
        }

        if self.session.max_rounds == 0 {
            result.add_error("session.max_rounds", "max_rounds must be greater than 0");
        }

        let mut seen = HashSet::new();
        for (i, server) in self.servers.iter().enumerate() {
            let field = format!("servers[{}]", i);

            if server.name.is_empty() {
                result.add_error(format!("{}.name", field), "server name cannot be empty");
            } else if !seen.insert(server.name.as_str()) {
                result.add_error(
                    format!("{}.name", field),
                    format!("duplicate server name '{}'", server.name),
                );
            }

            match server.kind {
                ServerKind::Process => {
                    if server.command.as_deref().map_or(true, str::is_empty) {
                        result.add_error(format!("{}.command", field), "process servers need a command");
                    }
                }
                ServerKind::Container => match (&server.image, &server.container_name) {
                    (None, None) => result.add_error(
                        format!("{}.image", field),
                        "container servers need an image or a container_name",
                    ),
                    (Some(_), Some(_)) => result.add_warning(
                        format!("{}.container_name", field),
                        "both image and container_name set; attaching to the existing container",
                    ),
                    _ => {}
                },
            }
        }

        if !self.servers.is_empty() && self.servers.iter().all(|s| !s.enabled) {
            result.add_warning("servers", "every configured server is disabled");
        }

        result
    }

    /// Servers that are enabled, in registration order.
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.iter().filter(|s| s.enabled)
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("conductor"))
            .unwrap_or_else(|| PathBuf::from("~/.config/conductor"))
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        let result = config.validate();
        assert!(result.is_ok(), "Default config should be valid: {:?}", result.issues);
        assert_eq!(config.rpc.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.max_rounds, 25);
    }

    #[test]
    fn test_zero_timeout_is_error() {
        let mut config = Config::default();
        config.rpc.request_timeout_secs = 0;
        let result = config.validate();
        assert!(!result.is_ok());
        assert!(result.errors().iter().any(|e| e.field == "rpc.request_timeout_secs"));
    }

    #[test]
    fn test_duplicate_server_names() {
        let mut config = Config::default();
        config.servers = vec![
            ServerConfig::process("fs", "mcp-fs"),
            ServerConfig::process("fs", "mcp-fs-2"),
        ];
        let result = config.validate();
        assert!(result.errors().iter().any(|e| e.field == "servers[1].name"));
    }

    #[test]
    fn test_container_without_image_is_error() {
        let mut config = Config::default();
        let mut server = ServerConfig::container("web", "img");
        server.image = None;
        config.servers = vec![server];
        let result = config.validate();
        assert!(result.errors().iter().any(|e| e.field == "servers[0].image"));
    }

    #[test]
    fn test_all_disabled_is_warning() {
        let mut config = Config::default();
        config.servers = vec![ServerConfig::process("fs", "mcp-fs").with_enabled(false)];
        let result = config.validate();
        assert!(result.is_ok());
        assert!(result.warnings().iter().any(|w| w.field == "servers"));
        assert_eq!(config.enabled_servers().count(), 0);
    }

    #[test]
    fn test_conversation_path_override() {
        let session = SessionConfig {
            path: Some(PathBuf::from("/tmp/conv.json")),
            ..Default::default()
        };
        assert_eq!(session.conversation_path(), PathBuf::from("/tmp/conv.json"));
        assert!(SessionConfig::default()
            .conversation_path()
            .ends_with(".conductor/conversation.json"));
    }

    #[test]
    fn test_layered_loading() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "custom.toml",
                r#"
                [rpc]
                malformed_lines = "skip"
                notification_routes = ["notifications/progress"]

                [[servers]]
                name = "echo"
                command = "echo-server"
                args = ["--stdio"]

                [[servers]]
                name = "web"
                kind = "container"
                image = "mcp/fetch"
                "#,
            )?;
            jail.set_env("CONDUCTOR_RPC__REQUEST_TIMEOUT_SECS", "3");

            let config = Config::load(Some(Path::new("custom.toml")))?;
            assert_eq!(config.rpc.request_timeout_secs, 3);
            assert_eq!(config.rpc.malformed_lines, MalformedLinePolicy::Skip);
            assert_eq!(config.rpc.notification_routes, vec!["notifications/progress"]);
            assert_eq!(config.servers.len(), 2);
            assert_eq!(config.servers[0].kind, ServerKind::Process);
            assert!(config.servers[0].enabled);
            assert_eq!(config.servers[1].kind, ServerKind::Container);
            Ok(())
        });
    }

    #[test]
    fn test_toml_rendering() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[rpc]"));
        assert!(rendered.contains("request_timeout_secs = 10"));
    }
}
