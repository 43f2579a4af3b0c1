use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::VmError;
use crate::model::script::{MAX_TIMEOUT_S, MIN_TIMEOUT_S};
use crate::paths;

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default)]
    pub vboxmanage: VBoxManageConfig,
    #[facet(default)]
    pub storage: StorageConfig,
    #[facet(default)]
    pub scripts: ScriptsConfig,
    #[facet(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct VBoxManageConfig {
    /// Explicit path to the executable. Found from the environment when unset.
    pub path: Option<String>,
    /// Upper bound for a single VBoxManage call. 0 waits forever.
    #[facet(default = 300)]
    pub timeout_s: u64,
}

impl Default for VBoxManageConfig {
    fn default() -> Self {
        Self {
            path: None,
            timeout_s: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct StorageConfig {
    pub vm_dir: Option<String>,
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ScriptsConfig {
    pub temp_dir: Option<String>,
    #[facet(default = 300)]
    pub default_timeout_s: u32,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            default_timeout_s: 300,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct LifecycleConfig {
    #[facet(default = 3000)]
    pub delete_settle_ms: u64,
    #[facet(default = true)]
    pub rollback_on_create_failure: bool,
    #[facet(default = true)]
    pub run_trigger_scripts: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            delete_settle_ms: 3000,
            rollback_on_create_failure: true,
            run_trigger_scripts: true,
        }
    }
}

// ── SystemConfig ──────────────────────────────────────────

/// Parsed config plus where it came from.
#[derive(Debug, Clone, Default)]
pub struct SystemConfig {
    /// `None` when running on built-in defaults.
    pub config_path: Option<PathBuf>,
    pub config: Config,
}

impl SystemConfig {
    /// Program name or path used to invoke VBoxManage.
    pub fn vboxmanage_program(&self) -> String {
        self.config
            .vboxmanage
            .path
            .clone()
            .unwrap_or_else(|| "VBoxManage".to_string())
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        match self.config.vboxmanage.timeout_s {
            0 => None,
            s => Some(Duration::from_secs(s)),
        }
    }

    pub fn vm_dir(&self) -> PathBuf {
        self.config
            .storage
            .vm_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(paths::vm_dir)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.config
            .storage
            .data_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(paths::data_dir)
    }

    pub fn store_path(&self) -> PathBuf {
        paths::store_file(&self.data_dir())
    }

    pub fn logs_dir(&self) -> PathBuf {
        paths::logs_dir(&self.data_dir())
    }

    pub fn script_temp_dir(&self) -> PathBuf {
        self.config
            .scripts
            .temp_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(paths::script_temp_dir)
    }

    pub fn delete_settle(&self) -> Duration {
        Duration::from_millis(self.config.lifecycle.delete_settle_ms)
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), VmError> {
    let default_timeout = config.scripts.default_timeout_s;
    if !(MIN_TIMEOUT_S..=MAX_TIMEOUT_S).contains(&default_timeout) {
        return Err(VmError::Validation {
            message: format!(
                "scripts.default_timeout_s must be between {MIN_TIMEOUT_S} and {MAX_TIMEOUT_S} (got {default_timeout})"
            ),
        });
    }
    if config.lifecycle.delete_settle_ms > 60_000 {
        return Err(VmError::Validation {
            message: "lifecycle.delete_settle_ms must be at most 60000".into(),
        });
    }

    let paths = [
        ("vboxmanage.path", &config.vboxmanage.path),
        ("storage.vm_dir", &config.storage.vm_dir),
        ("storage.data_dir", &config.storage.data_dir),
        ("scripts.temp_dir", &config.scripts.temp_dir),
    ];
    for (key, value) in paths {
        if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
            return Err(VmError::Validation {
                message: format!("{key} must not be empty"),
            });
        }
    }
    Ok(())
}

// ── environment overrides ─────────────────────────────────

fn vboxmanage_executable() -> &'static str {
    if cfg!(windows) {
        "VBoxManage.exe"
    } else {
        "VBoxManage"
    }
}

/// Apply `VM_STORAGE_PATH` and the VirtualBox install-location variables.
fn apply_env_overrides(config: &mut Config, env: impl Fn(&str) -> Option<String>) {
    let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(dir) = non_empty("VM_STORAGE_PATH") {
        config.storage.vm_dir = Some(dir);
    }
    if config.vboxmanage.path.is_none() {
        let install = non_empty("VBOX_MSI_INSTALL_PATH").or_else(|| non_empty("VBOX_INSTALL_PATH"));
        if let Some(dir) = install {
            config.vboxmanage.path = Some(
                Path::new(&dir)
                    .join(vboxmanage_executable())
                    .display()
                    .to_string(),
            );
        }
    }
}

// ── public API ────────────────────────────────────────────

pub fn parse_config(contents: &str, path: &Path) -> Result<Config, VmError> {
    let config: Config = facet_toml::from_str(contents).map_err(|e| VmError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Load the config.
///
/// An explicit `path` must exist. Without one the default location is tried
/// and built-in defaults are used when it is absent.
pub fn load_config(path: Option<&Path>) -> Result<SystemConfig, VmError> {
    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (paths::config_file(), false),
    };

    let mut sys = match std::fs::read_to_string(&path) {
        Ok(contents) => SystemConfig {
            config: parse_config(&contents, &path)?,
            config_path: Some(path),
        },
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            SystemConfig::default()
        }
        Err(source) => {
            return Err(VmError::ConfigLoad {
                path: path.display().to_string(),
                source,
            });
        }
    };

    apply_env_overrides(&mut sys.config, |key| std::env::var(key).ok());
    Ok(sys)
}
