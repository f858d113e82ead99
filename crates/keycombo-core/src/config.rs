use crate::error::ConfigError;
use crate::keys;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub combo: ComboConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// A key in the config file: either a name (`"KEY_POWER"`) or a raw code (`116`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySpec {
    Code(u32),
    Name(String),
}

impl KeySpec {
    pub fn resolve(&self) -> Result<u16, ConfigError> {
        match self {
            KeySpec::Code(code) => keys::check_code(*code),
            KeySpec::Name(name) => keys::parse_key(name),
        }
    }
}

/// An alternate key set selectable by profile name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeySetConfig {
    #[serde(default)]
    pub keys_down: Vec<KeySpec>,
    #[serde(default)]
    pub keys_up: Vec<KeySpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComboConfig {
    #[serde(default = "ComboConfig::default_keys_down")]
    pub keys_down: Vec<KeySpec>,
    #[serde(default)]
    pub keys_up: Vec<KeySpec>,
    /// How long the combo must be held before the held action runs.
    #[serde(default)]
    pub delay_ms: u64,
    /// Name of an entry in `profiles` to use instead of the top-level keys.
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub profiles: HashMap<String, KeySetConfig>,
}

/// Key codes after name resolution and de-duplication, in config order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKeys {
    pub down: Vec<u16>,
    pub up: Vec<u16>,
}

impl Default for ComboConfig {
    fn default() -> Self {
        Self {
            keys_down: Self::default_keys_down(),
            keys_up: Vec::new(),
            delay_ms: 0,
            profile: None,
            profiles: HashMap::new(),
        }
    }
}

impl ComboConfig {
    fn default_keys_down() -> Vec<KeySpec> {
        vec![
            KeySpec::Name("KEY_VOLUMEDOWN".into()),
            KeySpec::Name("KEY_POWER".into()),
        ]
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Resolve the active key set. `profile` overrides `combo.profile` when given.
    pub fn resolve_keys(&self, profile: Option<&str>) -> Result<ResolvedKeys, ConfigError> {
        let (down, up) = match profile.or(self.profile.as_deref()) {
            Some(name) => {
                let set = self
                    .profiles
                    .get(name)
                    .ok_or_else(|| ConfigError::UnknownProfile { name: name.into() })?;
                (&set.keys_down, &set.keys_up)
            }
            None => (&self.keys_down, &self.keys_up),
        };

        Ok(ResolvedKeys {
            down: resolve_list(down)?,
            up: resolve_list(up)?,
        })
    }
}

fn resolve_list(specs: &[KeySpec]) -> Result<Vec<u16>, ConfigError> {
    let mut codes = Vec::with_capacity(specs.len());
    for spec in specs {
        let code = spec.resolve()?;
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    Ok(codes)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionsConfig {
    /// Command (argv) run when the combo has been held for `delay_ms`.
    #[serde(default)]
    pub on_held: Vec<String>,
    /// Command (argv) run when a held combo is released.
    #[serde(default)]
    pub on_released: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseBackend {
    /// Use the kernel wakelock interface when it exists.
    #[default]
    Auto,
    Wakelock,
    #[serde(rename = "none")]
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default)]
    pub backend: LeaseBackend,
    #[serde(default = "LeaseConfig::default_name")]
    pub name: String,
}

impl LeaseConfig {
    fn default_name() -> String { "keycombo".into() }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            backend: LeaseBackend::Auto,
            name: "keycombo".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "WorkerConfig::default_queue_capacity")]
    pub queue_capacity: usize,
}

impl WorkerConfig {
    fn default_queue_capacity() -> usize { 16 }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { queue_capacity: 16 }
    }
}

impl Config {
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("keycombo")
    }

    /// Config file locations, most specific first.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(path) = std::env::var("KEYCOMBO_CONFIG") {
            paths.push(PathBuf::from(path));
        }
        paths.push(Self::config_dir().join("config.toml"));
        paths.push(PathBuf::from("/etc/keycombo/config.toml"));
        paths
    }

    pub fn load() -> Result<Self> {
        match Self::search_paths().into_iter().find(|p| p.exists()) {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        toml::from_str(&contents).with_context(|| "parsing config TOML")
    }
}

pub fn socket_path() -> PathBuf {
    // KEYCOMBO_SOCK overrides for testing.
    if let Ok(path) = std::env::var("KEYCOMBO_SOCK") {
        return PathBuf::from(path);
    }
    PathBuf::from("/run/keycombo/keycombo.sock")
}
