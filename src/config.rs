/// Optional runtime configuration, read from a JSON file
use crate::types::{RootboxError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming a configuration file
pub const CONFIG_ENV: &str = "ROOTBOX_CONFIG";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Hostname inside the UTS namespace (defaults to the program name)
    pub hostname: Option<String>,
    /// Domain name inside the UTS namespace (defaults to the program name)
    pub domainname: Option<String>,
    pub pty: PtyConfig,
    pub mounts: MountConfig,
    pub overlay: OverlayConfig,
    pub security: SecurityConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PtyConfig {
    /// Terminal rows used when the caller has no terminal
    pub default_rows: u16,
    /// Terminal columns used when the caller has no terminal
    pub default_cols: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            default_rows: 24,
            default_cols: 80,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountConfig {
    pub proc: bool,
    pub sys: bool,
    pub dev: bool,
    pub tmp: bool,
    /// Bind /sys read-only
    pub sys_readonly: bool,
    /// tmpfs data string for /tmp, e.g. `size=256m`
    pub tmp_options: Option<String>,
    /// Extra bind mounts made inside the new root
    pub binds: Vec<BindMount>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            proc: true,
            sys: true,
            dev: true,
            tmp: true,
            sys_readonly: true,
            tmp_options: None,
            binds: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindMount {
    /// Host path
    pub source: PathBuf,
    /// Path inside the sandbox
    pub destination: PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverlayConfig {
    /// Parent directory of the generated merged/work/upper directories
    pub scratch_dir: PathBuf,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from("/tmp"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    /// Set PR_SET_NO_NEW_PRIVS before exec
    pub no_new_privs: bool,
    /// Kill the sandbox when the runtime dies
    pub parent_death_signal: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            no_new_privs: true,
            parent_death_signal: true,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RootboxError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            RootboxError::Config(format!("invalid configuration {}: {}", path.display(), e))
        })
    }

    /// Load the explicit path, else `$ROOTBOX_CONFIG`, else defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::from_file(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }
}
