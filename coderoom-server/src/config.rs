//! Environment-driven configuration for the server binary.
//!
//! Every setting has a default from [`ServerConfig::default`]; `CODEROOM_*`
//! variables override them. Sandbox commands and login tokens come from
//! optional JSON files.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use coderoom_collab::{Language, SandboxConfig, ServerConfig, StaticTokenVerifier};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything the binary needs to start.
#[derive(Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
    /// `None` rejects every login token.
    pub tokens: Option<StaticTokenVerifier>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut server = ServerConfig::default();
        let env = Env { lookup: &lookup };

        if let Some(addr) = lookup("CODEROOM_BIND_ADDR") {
            server.bind_addr = addr;
        }
        if let Some(n) = env.parse("CODEROOM_BROADCAST_CAPACITY")? {
            server.broadcast_capacity = n;
        }
        if let Some(n) = env.parse("CODEROOM_HISTORY_LIMIT")? {
            server.history_limit = n;
        }
        if let Some(secs) = env.parse("CODEROOM_EVICTION_GRACE_SECS")? {
            server.eviction_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parse("CODEROOM_RECONNECT_WINDOW_SECS")? {
            server.reconnect_window = Duration::from_secs(secs);
        }
        if let Some(ms) = env.parse("CODEROOM_TYPING_TTL_MS")? {
            server.typing_ttl = Duration::from_millis(ms);
        }
        if let Some(secs) = env.parse("CODEROOM_EXECUTION_TIMEOUT_SECS")? {
            server.execution_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env.parse("CODEROOM_MAX_OUTPUT_BYTES")? {
            server.max_output_bytes = n;
        }
        // 0 lifts the limit.
        if let Some(n) = env.parse::<usize>("CODEROOM_MAX_BUFFER_BYTES")? {
            server.max_buffer_bytes = (n > 0).then_some(n);
        }

        let defaults = &mut server.room_defaults;
        if let Some(language) = env.parse::<Language>("CODEROOM_DEFAULT_LANGUAGE")? {
            defaults.language = language;
        }
        if let Some(max) = env.parse("CODEROOM_MAX_PARTICIPANTS")? {
            defaults.settings.max_participants = max;
        }
        if let Some(flag) = env.parse("CODEROOM_ALLOW_EXECUTION")? {
            defaults.settings.allow_execution = flag;
        }
        if let Some(flag) = env.parse("CODEROOM_ALLOW_GUESTS")? {
            defaults.settings.allow_guests = flag;
        }
        if let Some(flag) = env.parse("CODEROOM_REQUIRE_LOGIN")? {
            defaults.settings.require_login = flag;
        }
        defaults.settings = defaults.settings.normalized();

        server.archive_path = lookup("CODEROOM_ARCHIVE_PATH").map(PathBuf::from);

        let sandbox = match lookup("CODEROOM_SANDBOX_CONFIG") {
            Some(path) => {
                let path = PathBuf::from(path);
                SandboxConfig::from_json(&read(&path)?).map_err(|source| ConfigError::Json { path, source })?
            }
            None => SandboxConfig::docker_defaults(),
        };

        let tokens = match lookup("CODEROOM_TOKENS_FILE") {
            Some(path) => {
                let path = PathBuf::from(path);
                let verifier = StaticTokenVerifier::from_json(&read(&path)?)
                    .map_err(|source| ConfigError::Json { path, source })?;
                Some(verifier)
            }
            None => None,
        };

        Ok(Self {
            server,
            sandbox,
            tokens,
        })
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        let Some(value) = (self.lookup)(key) else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value })
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}
