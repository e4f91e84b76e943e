use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

pub const CONFIG_ENV: &str = "COUNTDOWN_CONFIG";
pub const DATA_ENV: &str = "COUNTDOWN_DATA";

const CONFIG_FILE: &str = "config.toml";
const DATABASE_FILE: &str = "counters.db";

/// Where the settings file and the counter database live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    pub config_file: PathBuf,
    pub database_path: PathBuf,
}

impl ConfigPaths {
    pub fn new(config_file: PathBuf, data_dir: &Path) -> Self {
        Self {
            config_file,
            database_path: data_dir.join(DATABASE_FILE),
        }
    }

    /// `COUNTDOWN_CONFIG` names the settings file (or a directory holding
    /// `config.toml`) and `COUNTDOWN_DATA` the directory for the database.
    /// Unset variables fall back to the per-user platform directories.
    pub fn discover() -> Result<Self> {
        let project = || {
            ProjectDirs::from("io", "Countdown", "countdown")
                .context("no home directory to keep counters in")
        };
        let config_file = match env::var_os(CONFIG_ENV).map(PathBuf::from) {
            Some(path) if path.is_dir() => path.join(CONFIG_FILE),
            Some(path) => path,
            None => project()?.config_dir().join(CONFIG_FILE),
        };
        let data_dir = match env::var_os(DATA_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => project()?.data_dir().to_path_buf(),
        };
        Ok(Self::new(config_file, &data_dir))
    }

    /// Both files directly under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        Self::new(root.join(CONFIG_FILE), root)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for file in [&self.config_file, &self.database_path] {
            let Some(dir) = file.parent().filter(|dir| !dir.as_os_str().is_empty()) else {
                continue;
            };
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}

pub struct ConfigLoader {
    paths: ConfigPaths,
}

impl ConfigLoader {
    pub fn new(paths: ConfigPaths) -> Self {
        Self { paths }
    }

    pub fn discover() -> Result<Self> {
        ConfigPaths::discover().map(Self::new)
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    /// Reads the settings file, first writing the defaults to it if it does
    /// not exist yet.
    pub fn load_or_init(&self) -> Result<AppConfig> {
        let file = &self.paths.config_file;
        if file.exists() {
            return self.load();
        }
        self.paths.ensure_directories()?;
        let config = AppConfig::default();
        let text = toml::to_string_pretty(&config).context("serializing default config")?;
        fs::write(file, text).with_context(|| format!("writing {}", file.display()))?;
        tracing::info!(path = %file.display(), "wrote default config");
        Ok(config)
    }

    pub fn load(&self) -> Result<AppConfig> {
        let file = &self.paths.config_file;
        let text = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
        let mut config: AppConfig =
            toml::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;
        config.sanitize();
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub theme: ThemeName,
    pub haptic_feedback: bool,
    pub sound_effects: bool,
    pub refresh_delay_ms: u64,
    pub widget: WidgetOptions,
    pub storage: StorageOptions,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            theme: ThemeName::Light,
            haptic_feedback: true,
            sound_effects: true,
            refresh_delay_ms: 500,
            widget: WidgetOptions::default(),
            storage: StorageOptions::default(),
        }
    }
}

impl AppConfig {
    fn sanitize(&mut self) {
        if self.widget.upcoming_limit == 0 {
            tracing::warn!("widget.upcoming_limit must be positive, using default");
            self.widget.upcoming_limit = WidgetOptions::default().upcoming_limit;
        }
    }

    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetOptions {
    /// Maximum counters in the upcoming snapshot.
    pub upcoming_limit: usize,
}

impl Default for WidgetOptions {
    fn default() -> Self {
        Self { upcoming_limit: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    pub wal_autocheckpoint: u32,
    pub busy_timeout_ms: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            wal_autocheckpoint: 1000,
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[derive(Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ThemeName {
    #[default]
    Light,
    Dark,
}

impl ThemeName {
    pub fn is_dark(self) -> bool {
        self == ThemeName::Dark
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn first_load_writes_defaults() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let loader = ConfigLoader::new(ConfigPaths::rooted_at(temp.path()));
        let cfg = loader.load_or_init()?;
        assert!(loader.paths().config_file.exists());
        assert_eq!(cfg.theme, ThemeName::Light);
        assert_eq!(cfg.refresh_delay(), Duration::from_millis(500));
        assert_eq!(cfg.storage.busy_timeout_ms, 5_000);

        let reloaded = loader.load()?;
        assert_eq!(reloaded.widget.upcoming_limit, 5);
        Ok(())
    }

    #[test]
    fn partial_file_keeps_other_defaults() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let loader = ConfigLoader::new(ConfigPaths::rooted_at(temp.path()));
        loader.paths().ensure_directories()?;
        fs::write(
            &loader.paths().config_file,
            "theme = \"dark\"\nhaptic_feedback = false\n\n[widget]\nupcoming_limit = 0\n",
        )?;
        let cfg = loader.load_or_init()?;
        assert!(cfg.theme.is_dark());
        assert!(!cfg.haptic_feedback);
        assert!(cfg.sound_effects);
        assert_eq!(cfg.widget.upcoming_limit, 5);
        assert_eq!(cfg.storage.busy_timeout_ms, 5_000);
        Ok(())
    }

    #[test]
    fn rejects_unknown_theme() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let loader = ConfigLoader::new(ConfigPaths::rooted_at(temp.path()));
        loader.paths().ensure_directories()?;
        fs::write(&loader.paths().config_file, "theme = \"neon\"\n")?;
        assert!(loader.load().is_err());
        Ok(())
    }

    #[test]
    fn rooted_paths_share_one_directory() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let root = temp.path().join("nested");
        let paths = ConfigPaths::rooted_at(&root);
        assert_eq!(paths.config_file, root.join("config.toml"));
        assert_eq!(paths.database_path, root.join("counters.db"));
        paths.ensure_directories()?;
        assert!(root.is_dir());
        Ok(())
    }

    #[test]
    fn theme_names_parse() {
        assert_eq!("dark".parse::<ThemeName>().ok(), Some(ThemeName::Dark));
        assert_eq!(ThemeName::Light.to_string(), "light");
    }
}
