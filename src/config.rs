use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo-instruct";
pub const DEFAULT_MAX_TOKENS: i64 = 2048;
pub const DEFAULT_LOCALE: &str = "zh_CN";
pub const DEFAULT_REQUESTS_PER_SEC: i64 = i16::MAX as i64;

/// Code models whose name contains this take fill-in-the-middle prompts.
pub const FIM_MODEL_MARKER: &str = "stable-code";
/// Code models starting with this only produce one completion per request.
pub const SINGLE_SAMPLE_MODEL_PREFIX: &str = "deepseek-coder";

/// Raw service configuration as read from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind: String,
    pub proxy_url: Option<String>,
    /// Overall per-request timeout in seconds.
    pub timeout: u64,
    pub requests_per_sec: i64,
    pub auth_token: Option<String>,
    pub max_body_bytes: usize,
    pub chat: ChatSection,
    pub code: CodeSection,
    pub retry: RetrySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSection {
    pub api_base: String,
    pub api_key: String,
    pub api_key_env: Option<String>,
    pub organization: Option<String>,
    pub project: Option<String>,
    pub max_tokens: i64,
    pub model_default: String,
    pub model_map: HashMap<String, String>,
    pub locale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeSection {
    pub api_base: String,
    pub api_key: String,
    pub api_key_env: Option<String>,
    pub organization: Option<String>,
    pub project: Option<String>,
    pub max_tokens: i64,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8181".to_string(),
            proxy_url: None,
            timeout: 600,
            requests_per_sec: DEFAULT_REQUESTS_PER_SEC,
            auth_token: None,
            max_body_bytes: 8 * 1024 * 1024,
            chat: ChatSection::default(),
            code: CodeSection::default(),
            retry: RetrySection::default(),
        }
    }
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: String::new(),
            api_key_env: None,
            organization: None,
            project: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            model_default: DEFAULT_MODEL.to_string(),
            model_map: HashMap::new(),
            locale: DEFAULT_LOCALE.to_string(),
        }
    }
}

impl Default for CodeSection {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: String::new(),
            api_key_env: None,
            organization: None,
            project: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 200,
            max_delay_ms: 3_000,
        }
    }
}

/// The two request shapes the proxy understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Chat,
    Code,
}

impl Route {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Code => "code",
        }
    }

    /// Path appended to the route's upstream base URL.
    #[must_use]
    pub fn upstream_path(self) -> &'static str {
        match self {
            Self::Chat => "/chat/completions",
            Self::Code => "/completions",
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Rewrite behaviour for a route, picked once at startup from the configured model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Chat,
    FillInMiddleCode,
    SingleSampleCode,
    PassthroughCode,
}

impl ModelFamily {
    #[must_use]
    pub fn for_code_model(model: &str) -> Self {
        if model.contains(FIM_MODEL_MARKER) {
            Self::FillInMiddleCode
        } else if model.starts_with(SINGLE_SAMPLE_MODEL_PREFIX) {
            Self::SingleSampleCode
        } else {
            Self::PassthroughCode
        }
    }
}

/// Inbound model id to outbound model id, with a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMapping {
    pub mapping: HashMap<String, String>,
    pub default: String,
}

impl ModelMapping {
    #[must_use]
    pub fn resolve(&self, inbound: Option<&str>) -> &str {
        inbound
            .and_then(|model| self.mapping.get(model))
            .map_or(self.default.as_str(), String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSelection {
    /// Chat: look the inbound model up in a mapping.
    Mapped(ModelMapping),
    /// Code: always send this model.
    Fixed(String),
}

impl ModelSelection {
    #[must_use]
    pub fn resolve(&self, inbound: Option<&str>) -> &str {
        match self {
            Self::Mapped(mapping) => mapping.resolve(inbound),
            Self::Fixed(model) => model,
        }
    }
}

/// Immutable per-route settings used by the request pipeline.
#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub route: Route,
    pub base_url: String,
    pub api_key: String,
    pub organization: Option<String>,
    pub project: Option<String>,
    pub max_tokens: i64,
    pub model: ModelSelection,
    pub locale: String,
    pub family: ModelFamily,
}

impl RouteConfig {
    #[must_use]
    pub fn upstream_url(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.route.upstream_path()
        )
    }
}

impl ServiceConfig {
    /// Load config from a TOML file, filling in defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.apply_defaults();
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        let candidates = config_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        Err(ProxyError::config(format!(
            "No config file found. Searched: {}",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    /// Zero and empty values mean "use the default", same as leaving them out.
    fn apply_defaults(&mut self) {
        let defaults = Self::default();
        if self.bind.is_empty() {
            self.bind = defaults.bind;
        }
        if self.timeout == 0 {
            self.timeout = defaults.timeout;
        }
        if self.requests_per_sec <= 0 {
            self.requests_per_sec = DEFAULT_REQUESTS_PER_SEC;
        }
        if self.max_body_bytes == 0 {
            self.max_body_bytes = defaults.max_body_bytes;
        }
        if self.chat.api_base.is_empty() {
            self.chat.api_base = DEFAULT_API_BASE.to_string();
        }
        if self.chat.max_tokens <= 0 {
            self.chat.max_tokens = DEFAULT_MAX_TOKENS;
        }
        if self.chat.model_default.is_empty() {
            self.chat.model_default = DEFAULT_MODEL.to_string();
        }
        if self.chat.locale.is_empty() {
            self.chat.locale = DEFAULT_LOCALE.to_string();
        }
        if self.code.api_base.is_empty() {
            self.code.api_base = DEFAULT_API_BASE.to_string();
        }
        if self.code.max_tokens <= 0 {
            self.code.max_tokens = DEFAULT_MAX_TOKENS;
        }
        if self.code.model.is_empty() {
            self.code.model = DEFAULT_MODEL.to_string();
        }
        self.auth_token = self.auth_token.take().filter(|t| !t.is_empty());
        self.proxy_url = self.proxy_url.take().filter(|u| !u.is_empty());
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Build the immutable chat and code route settings.
    pub fn route_configs(&self) -> Result<(RouteConfig, RouteConfig)> {
        let chat = RouteConfig {
            route: Route::Chat,
            base_url: self.chat.api_base.clone(),
            api_key: resolve_api_key(&self.chat.api_key, self.chat.api_key_env.as_deref())?,
            organization: non_empty(self.chat.organization.as_deref()),
            project: non_empty(self.chat.project.as_deref()),
            max_tokens: self.chat.max_tokens,
            model: ModelSelection::Mapped(ModelMapping {
                mapping: self.chat.model_map.clone(),
                default: self.chat.model_default.clone(),
            }),
            locale: self.chat.locale.clone(),
            family: ModelFamily::Chat,
        };

        let code = RouteConfig {
            route: Route::Code,
            base_url: self.code.api_base.clone(),
            api_key: resolve_api_key(&self.code.api_key, self.code.api_key_env.as_deref())?,
            organization: non_empty(self.code.organization.as_deref()),
            project: non_empty(self.code.project.as_deref()),
            max_tokens: self.code.max_tokens,
            model: ModelSelection::Fixed(self.code.model.clone()),
            locale: self.chat.locale.clone(),
            family: ModelFamily::for_code_model(&self.code.model),
        };

        Ok((chat, code))
    }

    /// Human-readable dump for startup logs. Secrets are left out.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::with_capacity(1024);
        let _ = writeln!(out, "> Bind: {}", self.bind);
        let _ = writeln!(out, "> ProxyUrl: {}", self.proxy_url.as_deref().unwrap_or(""));
        let _ = writeln!(out, "> Timeout(Second): {}", self.timeout);
        let _ = writeln!(out, "> RequestsPerSec: {}", self.requests_per_sec);
        let _ = writeln!(out, "> AuthToken: {}", if self.auth_token.is_some() { "set" } else { "unset" });
        let _ = writeln!(out, "> CodeApiBase: {}", self.code.api_base);
        let _ = writeln!(out, "> CodeApiOrganization: {}", self.code.organization.as_deref().unwrap_or(""));
        let _ = writeln!(out, "> CodeApiProject: {}", self.code.project.as_deref().unwrap_or(""));
        let _ = writeln!(out, "> CodeMaxTokens: {}", self.code.max_tokens);
        let _ = writeln!(out, "> CodeModel: {}", self.code.model);
        let _ = writeln!(out, "> ChatApiBase: {}", self.chat.api_base);
        let _ = writeln!(out, "> ChatApiOrganization: {}", self.chat.organization.as_deref().unwrap_or(""));
        let _ = writeln!(out, "> ChatApiProject: {}", self.chat.project.as_deref().unwrap_or(""));
        let _ = writeln!(out, "> ChatMaxTokens: {}", self.chat.max_tokens);
        let _ = writeln!(out, "> ChatModelDefault: {}", self.chat.model_default);
        let _ = writeln!(out, "> ChatModelMap: {:?}", self.chat.model_map);
        let _ = writeln!(out, "> ChatLocale: {}", self.chat.locale);
        out
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

/// An inline key wins; otherwise read the named environment variable.
fn resolve_api_key(inline: &str, env_name: Option<&str>) -> Result<String> {
    if !inline.is_empty() {
        return Ok(inline.to_string());
    }
    match env_name.filter(|name| !name.is_empty()) {
        Some(name) => std::env::var(name).map_err(|_| {
            ProxyError::config(format!(
                "Environment variable '{name}' not set. Set it with your provider API key."
            ))
        }),
        None => Ok(String::new()),
    }
}

#[must_use]
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("copilot-override.toml"));

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(
            PathBuf::from(xdg)
                .join("copilot-override")
                .join("config.toml"),
        );
    }
    if let Some(home) = home_dir() {
        paths.push(
            home.join(".config")
                .join("copilot-override")
                .join("config.toml"),
        );
        paths.push(home.join(".copilot-override.toml"));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
