//! Internal API for managing pvevm configuration.
//!
//! Handles loading, saving, and resolving the configuration file
//! (default: `~/.config/pvevm/pvevmrc`, TOML format). Provides the
//! [`Config`] struct and functions for reading/writing it to disk.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// GitHub repository publishing the appliance images, as `owner/name`.
    #[serde(default)]
    pub repo: Option<String>,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Release asset suffix identifying the disk image archive.
    #[serde(default = "default_image_suffix")]
    pub image_suffix: String,

    #[serde(default = "default_bridge")]
    pub bridge: String,

    #[serde(default = "default_cores")]
    pub cores: u32,

    #[serde(default = "default_disk_size")]
    pub disk_size: String,

    #[serde(default = "default_description")]
    pub description: String,

    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// `vendor:product` ids offered for USB pass-through.
    #[serde(default = "default_usb_allow_list")]
    pub usb_allow_list: Vec<String>,
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_image_suffix() -> String {
    ".ova".to_string()
}

fn default_bridge() -> String {
    "vmbr0".to_string()
}

fn default_cores() -> u32 {
    2
}

fn default_disk_size() -> String {
    "64G".to_string()
}

fn default_description() -> String {
    "Provisioned by pvevm".to_string()
}

fn default_log_file() -> PathBuf {
    PathBuf::from("/var/log/pvevm.log")
}

fn default_usb_allow_list() -> Vec<String> {
    [
        "1b1f:c020", // RaZberry/Z-Wave.Me USB radio
        "10c4:ea60", // Silicon Labs CP210x (Zigbee/Thread coordinators)
        "1cf1:0030", // dresden elektronik ConBee II
        "0658:0200", // Sigma Designs Z-Wave stick
        "1a86:55d4", // Sonoff Zigbee dongle (CH9102)
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo: None,
            api_base: default_api_base(),
            image_suffix: default_image_suffix(),
            bridge: default_bridge(),
            cores: default_cores(),
            disk_size: default_disk_size(),
            description: default_description(),
            log_file: default_log_file(),
            usb_allow_list: default_usb_allow_list(),
        }
    }
}

impl Config {
    pub fn display(&self) {
        println!("repo = {}", self.repo.as_deref().unwrap_or(""));
        println!("api_base = {}", self.api_base);
        println!("image_suffix = {}", self.image_suffix);
        println!("bridge = {}", self.bridge);
        println!("cores = {}", self.cores);
        println!("disk_size = {}", self.disk_size);
        println!("description = {}", self.description);
        println!("log_file = {}", self.log_file.display());
        println!("usb_allow_list = {}", self.usb_allow_list.join(","));
    }

    /// The configured release repository, or an error telling the operator
    /// how to set one.
    pub fn repo(&self) -> Result<&str> {
        match self.repo.as_deref() {
            Some(repo) if !repo.is_empty() => Ok(repo),
            _ => bail!(
                "no release repository configured; \
                 run `pvevm config set repo OWNER/NAME` or pass --repo"
            ),
        }
    }

    /// Validate and apply a `config set` assignment.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "repo" => {
                validate_repo(value)?;
                self.repo = Some(value.to_string());
            }
            "api_base" => {
                if !value.starts_with("https://") && !value.starts_with("http://") {
                    bail!("api_base must be an http(s) URL: {value}");
                }
                self.api_base = value.trim_end_matches('/').to_string();
            }
            "image_suffix" => {
                if !value.starts_with('.') || value.len() < 2 {
                    bail!("image_suffix must start with a dot: {value}");
                }
                self.image_suffix = value.to_string();
            }
            "bridge" => {
                if value.is_empty() || value.contains(char::is_whitespace) {
                    bail!("invalid bridge name: {value:?}");
                }
                self.bridge = value.to_string();
            }
            "cores" => {
                let cores: u32 = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("cores must be a positive integer"))?;
                if cores == 0 {
                    bail!("cores must be greater than 0");
                }
                self.cores = cores;
            }
            "disk_size" => {
                validate_disk_size(value)?;
                self.disk_size = value.to_string();
            }
            "description" => self.description = value.to_string(),
            "log_file" => {
                let path = PathBuf::from(value);
                if !path.is_absolute() {
                    bail!("log_file must be an absolute path: {value}");
                }
                self.log_file = path;
            }
            "usb_allow_list" => {
                let ids: Vec<String> = value
                    .split(',')
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect();
                for id in &ids {
                    if !crate::usb::is_usb_id(id) {
                        bail!("invalid USB id {id:?} (expected vvvv:pppp)");
                    }
                }
                self.usb_allow_list = ids;
            }
            _ => bail!("unknown config key: {key}"),
        }
        Ok(())
    }
}

fn validate_repo(repo: &str) -> Result<()> {
    let Some((owner, name)) = repo.split_once('/') else {
        bail!("repo must be in OWNER/NAME form: {repo}");
    };
    let valid = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    if !valid(owner) || !valid(name) {
        bail!("repo must be in OWNER/NAME form: {repo}");
    }
    Ok(())
}

/// Accepts sizes in the form `qm resize` understands, e.g. `64G` or `512M`.
fn validate_disk_size(size: &str) -> Result<()> {
    let digits = size.trim_end_matches(['K', 'M', 'G', 'T']);
    if digits.is_empty() || digits.len() + 1 != size.len() {
        bail!("disk_size must be a number followed by K, M, G or T: {size}");
    }
    match digits.parse::<u64>() {
        Ok(n) if n > 0 => Ok(()),
        _ => bail!("disk_size must be a number followed by K, M, G or T: {size}"),
    }
}

fn sudo_user_config_path() -> Option<PathBuf> {
    let su = crate::sudo_user()?;
    Some(su.home.join(".config").join("pvevm").join("pvevmrc"))
}

pub fn config_path() -> Result<PathBuf> {
    // When running under sudo, prefer the invoking user's config if it exists.
    if let Some(path) = sudo_user_config_path() {
        if path.exists() {
            return Ok(path);
        }
    }
    let base = if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg)
    } else {
        let home = std::env::var("HOME").context("HOME not set")?;
        PathBuf::from(home).join(".config")
    };
    Ok(base.join("pvevm").join("pvevmrc"))
}

pub fn resolve_path(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(p) => Ok(p.to_path_buf()),
        None => config_path(),
    }
}

pub fn load(path: Option<&Path>) -> Result<Config> {
    let path = resolve_path(path)?;
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(config)
}

pub fn save(config: &Config, path: Option<&Path>) -> Result<()> {
    let path = resolve_path(path)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let contents = toml::to_string(config).context("failed to serialize config")?;
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::testing::ENV_LOCK;

    struct TempConfig {
        dir: PathBuf,
        _guard: std::sync::MutexGuard<'static, ()>,
    }

    impl TempConfig {
        fn new() -> Self {
            let guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            let dir = std::env::temp_dir().join(format!(
                "pvevm-test-{}-{:?}",
                std::process::id(),
                std::thread::current().id()
            ));
            let _ = fs::remove_dir_all(&dir);
            fs::create_dir_all(&dir).unwrap();
            std::env::remove_var("SUDO_USER");
            std::env::set_var("XDG_CONFIG_HOME", &dir);
            Self {
                dir,
                _guard: guard,
            }
        }
    }

    impl Drop for TempConfig {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
            std::env::remove_var("XDG_CONFIG_HOME");
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.repo.is_none());
        assert_eq!(config.cores, 2);
        assert_eq!(config.disk_size, "64G");
        assert_eq!(config.bridge, "vmbr0");
        assert!(config.usb_allow_list.contains(&"1b1f:c020".to_string()));
    }

    #[test]
    fn test_load_missing_file() {
        let _tmp = TempConfig::new();
        let config = load(None).unwrap();
        assert_eq!(config.image_suffix, ".ova");
    }

    #[test]
    fn test_save_and_load() {
        let _tmp = TempConfig::new();
        let mut config = Config::default();
        config.set("repo", "acme/appliance-os").unwrap();
        config.set("cores", "4").unwrap();
        save(&config, None).unwrap();
        let loaded = load(None).unwrap();
        assert_eq!(loaded.repo.as_deref(), Some("acme/appliance-os"));
        assert_eq!(loaded.cores, 4);
    }

    #[test]
    fn test_load_partial_config() {
        let _tmp = TempConfig::new();
        let path = config_path().unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "bridge = \"vmbr1\"\n").unwrap();
        let config = load(None).unwrap();
        assert_eq!(config.bridge, "vmbr1");
        assert_eq!(config.disk_size, "64G");
    }

    #[test]
    fn test_explicit_path() {
        let dir = std::env::temp_dir().join(format!("pvevm-test-explicit-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("custom-pvevmrc");

        let config = load(Some(&path)).unwrap();
        assert!(config.repo.is_none());

        let config = Config {
            disk_size: "32G".to_string(),
            ..Config::default()
        };
        save(&config, Some(&path)).unwrap();
        let loaded = load(Some(&path)).unwrap();
        assert_eq!(loaded.disk_size, "32G");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_config_path_xdg() {
        let _tmp = TempConfig::new();
        let path = config_path().unwrap();
        assert!(path.ends_with("pvevm/pvevmrc"));
    }

    #[test]
    fn test_repo_required() {
        let config = Config::default();
        let err = config.repo().unwrap_err();
        assert!(err.to_string().contains("config set repo"), "unexpected error: {err}");
    }

    #[test]
    fn test_set_rejects_invalid_values() {
        let mut config = Config::default();
        assert!(config.set("repo", "no-slash").is_err());
        assert!(config.set("repo", "a/b/c").is_err());
        assert!(config.set("cores", "0").is_err());
        assert!(config.set("disk_size", "64").is_err());
        assert!(config.set("disk_size", "G").is_err());
        assert!(config.set("log_file", "relative.log").is_err());
        assert!(config.set("usb_allow_list", "1b1f-c020").is_err());
        assert!(config.set("nonsense", "x").is_err());
    }

    #[test]
    fn test_set_usb_allow_list() {
        let mut config = Config::default();
        config.set("usb_allow_list", "1B1F:C020, 10c4:ea60").unwrap();
        assert_eq!(config.usb_allow_list, vec!["1b1f:c020", "10c4:ea60"]);
    }

    #[test]
    fn test_set_disk_size() {
        let mut config = Config::default();
        config.set("disk_size", "128G").unwrap();
        assert_eq!(config.disk_size, "128G");
    }
}
