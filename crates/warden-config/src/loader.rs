use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use warden_core::{Effect, Result, WardenError};

use crate::schema::{WardenConfig, warden_home};

/// Loads and optionally hot-reloads the Warden configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<WardenConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > WARDEN_CONFIG env > ~/.warden/warden.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("WARDEN_CONFIG") {
            return PathBuf::from(p);
        }
        warden_home().join("warden.toml")
    }

    /// Load the config from disk, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::parse_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            Self::apply_env_overrides(WardenConfig::default())
        };
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Wrap an already-built config, e.g. for tests or embedding.
    pub fn from_config(config: WardenConfig, config_path: PathBuf) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        }
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> WardenConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<WardenConfig>> {
        Arc::clone(&self.config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Write the default config to `path` unless a file is already there.
    /// Returns false if it existed.
    pub fn write_default(path: &Path) -> Result<bool> {
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let rendered = WardenConfig::default().to_toml().map_err(WardenError::Config)?;
        std::fs::write(path, rendered)?;
        info!(path = %path.display(), "default configuration written");
        Ok(true)
    }

    fn parse_file(path: &Path) -> Result<WardenConfig> {
        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str::<WardenConfig>(&raw)
            .map_err(|e| WardenError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        Ok(Self::apply_env_overrides(config))
    }

    /// Log warnings; fail on errors.
    fn check(config: &WardenConfig) -> Result<()> {
        let warnings = config.validate().map_err(WardenError::Config)?;
        for w in &warnings {
            warn!("{}", w);
        }
        Ok(())
    }

    fn apply_env_overrides(config: WardenConfig) -> WardenConfig {
        Self::apply_overrides(config, |key| std::env::var(key).ok())
    }

    /// Apply `WARDEN_DB_PATH`, `WARDEN_LOG_LEVEL`, `WARDEN_POLICY_TTL` and
    /// `WARDEN_DEFAULT_EFFECT` as looked up through `lookup`. Unparseable
    /// values are ignored with a warning.
    pub fn apply_overrides(mut config: WardenConfig, lookup: impl Fn(&str) -> Option<String>) -> WardenConfig {
        if let Some(v) = lookup("WARDEN_DB_PATH") {
            config.store.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("WARDEN_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = lookup("WARDEN_POLICY_TTL") {
            match v.parse::<u64>() {
                Ok(ttl) => config.policy.cache_ttl_secs = ttl,
                Err(_) => warn!(value = %v, "ignoring WARDEN_POLICY_TTL, not a number"),
            }
        }
        if let Some(v) = lookup("WARDEN_DEFAULT_EFFECT") {
            match v.parse::<Effect>() {
                Ok(effect) => config.policy.default_effect = effect,
                Err(_) => warn!(value = %v, "ignoring WARDEN_DEFAULT_EFFECT, not an effect"),
            }
        }
        config
    }

    /// Reload the config from disk. An invalid file leaves the current
    /// config in place.
    pub fn reload(&self) -> Result<WardenConfig> {
        if !self.config_path.exists() {
            return Err(WardenError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::parse_file(&self.config_path)?;
        Self::check(&new_config)?;
        *self.config.write() = new_config.clone();
        info!("configuration reloaded");
        Ok(new_config)
    }

    /// Start a background file watcher that reloads when the config file
    /// changes and hands each accepted config to `on_reload`.
    /// The returned watcher must be kept alive for watching to continue.
    pub fn watch<F>(&self, on_reload: F) -> Result<notify::RecommendedWatcher>
    where
        F: Fn(&WardenConfig) + Send + 'static,
    {
        let config = Arc::clone(&self.config);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let path_for_event = config_path.clone();
        let mut watcher = notify::recommended_watcher(move |res: std::result::Result<NotifyEvent, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "file watcher error");
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            if !event
                .paths
                .iter()
                .any(|p| p.file_name() == path_for_event.file_name())
            {
                return;
            }

            info!("config file changed, reloading");
            match Self::parse_file(&path_for_event).and_then(|c| Self::check(&c).map(|_| c)) {
                Ok(new_config) => {
                    *config.write() = new_config.clone();
                    on_reload(&new_config);
                    info!("configuration hot-reloaded successfully");
                }
                Err(e) => {
                    warn!(error = %e, "config file has errors, keeping current config");
                }
            }
        })
        .map_err(|e| WardenError::Config(format!("failed to create file watcher: {e}")))?;

        // Watch the parent directory (some editors create temp files + rename)
        let watch_path = self
            .config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| WardenError::Config(format!("failed to watch config directory: {e}")))?;

        Ok(watcher)
    }
}
