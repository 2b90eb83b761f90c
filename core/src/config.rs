//! Process configuration.
//!
//! Everything the gateway reads from the environment is snapshotted once at
//! boot into a [`Config`] value that is threaded through the services record.
//! Nothing else reads `std::env` at runtime, so behaviour is deterministic
//! for the lifetime of the process.

use std::path::PathBuf;

use crate::error::GatewayErr;
use crate::error::Result;

pub const AGENT_NAME: &str = "claude-code-container";
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default byte cap for a single extracted or applied patch.
pub const DEFAULT_MAX_PATCH_BYTES: usize = 200 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for gateway state (session documents, ephemeral
    /// workspaces). Defaults to `~/.agent-gateway`.
    pub state_dir: PathBuf,

    /// When set, workspaces are persistent: `prepare` derives a deterministic
    /// directory from this id and pulls instead of re-cloning.
    pub persistent_workspace_id: Option<String>,

    /// Overrides the directory persistent workspaces live in.
    pub workspace_root: Option<PathBuf>,

    pub disable_streaming_sdk: bool,
    pub force_http_api: bool,
    pub skip_cli_check: bool,

    /// Cap applied both to extracted fenced patches and to `applyPatch`.
    pub max_patch_bytes: usize,

    /// Development mode includes error detail in responses.
    pub development_mode: bool,

    pub running_as_root: bool,

    pub api_key: Option<String>,
    pub github_token: Option<String>,

    /// Port for the HTTP transport; `None` disables it.
    pub http_port: Option<u16>,
}

impl Config {
    /// Snapshot the environment. Fails only when no usable state directory
    /// can be determined.
    pub fn load() -> Result<Self> {
        let state_dir = match std::env::var_os("GATEWAY_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .ok_or_else(|| {
                    GatewayErr::Sandbox("could not determine home directory".to_string())
                })?
                .join(".agent-gateway"),
        };

        let max_patch_bytes = std::env::var("MAX_PATCH_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_PATCH_BYTES);

        Ok(Self {
            state_dir,
            persistent_workspace_id: non_empty_var("PERSISTENT_WORKSPACE_ID"),
            workspace_root: non_empty_var("WORKSPACE_ROOT").map(PathBuf::from),
            disable_streaming_sdk: flag_var("DISABLE_STREAMING_SDK"),
            force_http_api: flag_var("FORCE_HTTP_API"),
            skip_cli_check: flag_var("SKIP_CLI_CHECK"),
            max_patch_bytes,
            development_mode: matches!(
                std::env::var("GATEWAY_ENV").ok().as_deref(),
                Some("development")
            ),
            running_as_root: is_running_as_root(),
            api_key: non_empty_var("ANTHROPIC_API_KEY"),
            github_token: non_empty_var("GITHUB_TOKEN"),
            http_port: std::env::var("PORT").ok().and_then(|v| v.parse().ok()),
        })
    }

    /// Directory holding one JSON document per persisted session.
    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    /// Base directory for ephemeral workspace checkouts.
    pub fn ephemeral_workspace_dir(&self) -> PathBuf {
        self.state_dir.join("workspaces")
    }

    /// Directory persistent workspaces are materialized under.
    pub fn persistent_workspace_dir(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| self.state_dir.join("persistent"))
    }
}

#[cfg(test)]
impl Config {
    /// A config rooted in a temporary directory, for tests.
    pub fn for_test(state_dir: PathBuf) -> Self {
        Self {
            state_dir,
            persistent_workspace_id: None,
            workspace_root: None,
            disable_streaming_sdk: false,
            force_http_api: false,
            skip_cli_check: true,
            max_patch_bytes: DEFAULT_MAX_PATCH_BYTES,
            development_mode: false,
            running_as_root: false,
            api_key: None,
            github_token: None,
            http_port: None,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// `""`, `"0"` and `"false"` are off; anything else set is on.
fn flag_var(name: &str) -> bool {
    std::env::var(name)
        .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_running_as_root() -> bool {
    // Safety note: geteuid has no failure mode.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_running_as_root() -> bool {
    false
}
