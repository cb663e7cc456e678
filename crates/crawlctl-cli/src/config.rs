//! Configuration file management for crawlctl.
//!
//! Provides a TOML-based config file at `~/.config/crawlctl/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crawlctl_core::filter::DEFAULT_TAG;
use crawlctl_core::{
    AcceptAll, CaptureConfig, LineFilter, OrchestratorConfig, TagFilter, WorkerCommand,
};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub worker: WorkerSection,
    pub capture: CaptureSection,
    pub control: ControlSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub program: String,
    pub args: Vec<String>,
    pub output_flag: Option<String>,
    pub working_dir: Option<PathBuf>,
    /// Where `POST /api/config` writes the worker's site list. Relative
    /// paths are resolved against `working_dir`.
    pub config_path: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        let command = WorkerCommand::default();
        Self {
            program: command.program,
            args: command.args,
            output_flag: command.output_flag,
            working_dir: None,
            config_path: PathBuf::from("config.json"),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    pub tag: String,
    /// Forward every output line, not only tagged ones.
    pub forward_all: bool,
    pub channel_capacity: usize,
    pub drain_timeout_ms: u64,
}

impl Default for CaptureSection {
    fn default() -> Self {
        let capture = CaptureConfig::default();
        Self {
            tag: DEFAULT_TAG.to_string(),
            forward_all: false,
            channel_capacity: capture.channel_capacity,
            drain_timeout_ms: u64::try_from(capture.drain_timeout.as_millis()).unwrap_or(2000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSection {
    pub stop_timeout_secs: u64,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 10,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the crawlctl config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/crawlctl` or `~/.config/crawlctl`.
/// macOS resolves to `~/.config` as well, not `~/Library/Application Support`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("crawlctl");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("crawlctl")
}

/// Return the path to the crawlctl config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Serialize and write a config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct CrawlctlConfig {
    pub bind: String,
    pub port: u16,
    pub orchestrator: OrchestratorConfig,
    /// Absolute or cwd-relative path of the worker's site list.
    pub site_config_path: PathBuf,
}

impl CrawlctlConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Config file: `config_override` (must exist) > [`config_path`] (optional)
    /// - Bind: `cli_bind` > `CRAWLCTL_BIND` > `server.bind` > `127.0.0.1`
    /// - Port: `cli_port` > `CRAWLCTL_PORT` > `server.port` > `8000`
    /// - Worker program: `CRAWLCTL_WORKER_PROGRAM` > `worker.program` > `scrapy`
    /// - Protocol tag: `CRAWLCTL_TAG` > `capture.tag` > `[gov_policy]`
    pub fn resolve(
        config_override: Option<&Path>,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
    ) -> Result<Self> {
        let file = match config_override {
            Some(path) => load_config(path)?,
            None => {
                let path = config_path();
                if path.exists() {
                    load_config(&path)?
                } else {
                    ConfigFile::default()
                }
            }
        };
        Self::from_file(file, cli_bind, cli_port)
    }

    fn from_file(file: ConfigFile, cli_bind: Option<&str>, cli_port: Option<u16>) -> Result<Self> {
        let bind = if let Some(bind) = cli_bind {
            bind.to_string()
        } else if let Ok(bind) = std::env::var("CRAWLCTL_BIND") {
            bind
        } else {
            file.server.bind
        };

        let port = if let Some(port) = cli_port {
            port
        } else if let Ok(port) = std::env::var("CRAWLCTL_PORT") {
            port.parse::<u16>()
                .with_context(|| format!("CRAWLCTL_PORT is not a valid port: {port:?}"))?
        } else {
            file.server.port
        };

        let program =
            std::env::var("CRAWLCTL_WORKER_PROGRAM").unwrap_or(file.worker.program);
        if program.trim().is_empty() {
            bail!("worker program is empty; set worker.program or CRAWLCTL_WORKER_PROGRAM");
        }
        let tag = std::env::var("CRAWLCTL_TAG").unwrap_or(file.capture.tag);

        let filter: Arc<dyn LineFilter> = if file.capture.forward_all {
            Arc::new(AcceptAll)
        } else {
            if tag.is_empty() {
                bail!("capture.tag is empty; set a tag or enable capture.forward_all");
            }
            Arc::new(TagFilter::new(tag))
        };

        let site_config_path = match file.worker.working_dir {
            Some(ref dir) if file.worker.config_path.is_relative() => {
                dir.join(&file.worker.config_path)
            }
            _ => file.worker.config_path.clone(),
        };

        let command = WorkerCommand {
            program,
            args: file.worker.args,
            output_flag: file.worker.output_flag,
            working_dir: file.worker.working_dir,
            env: file.worker.env,
        };

        let orchestrator = OrchestratorConfig {
            command,
            capture: CaptureConfig {
                channel_capacity: file.capture.channel_capacity,
                drain_timeout: Duration::from_millis(file.capture.drain_timeout_ms),
            },
            filter,
            stop_timeout: Duration::from_secs(file.control.stop_timeout_secs),
        };

        Ok(Self {
            bind,
            port,
            orchestrator,
            site_config_path,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    fn clear_env() {
        for key in [
            "CRAWLCTL_BIND",
            "CRAWLCTL_PORT",
            "CRAWLCTL_WORKER_PROGRAM",
            "CRAWLCTL_TAG",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config: ConfigFile = toml::from_str("").unwrap();
        assert_eq!(config, ConfigFile::default());
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.worker.program, "scrapy");
        assert_eq!(config.worker.args, vec!["crawl", "gov_policy"]);
        assert_eq!(config.worker.output_flag.as_deref(), Some("-o"));
        assert_eq!(config.capture.tag, "[gov_policy]");
        assert_eq!(config.capture.drain_timeout_ms, 2000);
        assert_eq!(config.control.stop_timeout_secs, 10);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: ConfigFile = toml::from_str(
            r#"
            [server]
            port = 9100

            [worker.env]
            SCRAPY_SETTINGS_MODULE = "policy.settings"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(
            config.worker.env.get("SCRAPY_SETTINGS_MODULE").map(String::as_str),
            Some("policy.settings")
        );
        assert_eq!(config.capture, CaptureSection::default());
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("crawlctl").join("config.toml");

        let mut original = ConfigFile::default();
        original.worker.working_dir = Some(PathBuf::from("/srv/crawler"));
        original.worker.env.insert("A".into(), "1".into());
        original.capture.forward_all = true;

        save_config(&path, &original).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        save_config(&path, &ConfigFile::default()).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn load_config_reports_parse_errors_with_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = \"not a number\"\n").unwrap();

        let msg = format!("{:#}", load_config(&path).unwrap_err());
        assert!(msg.contains("failed to parse config file"), "unexpected: {msg}");
        assert!(msg.contains("config.toml"), "unexpected: {msg}");
    }

    #[test]
    fn resolve_with_cli_flags_overrides_all() {
        let _lock = lock_env();
        clear_env();
        unsafe { std::env::set_var("CRAWLCTL_BIND", "0.0.0.0") };
        unsafe { std::env::set_var("CRAWLCTL_PORT", "9999") };

        let config =
            CrawlctlConfig::from_file(ConfigFile::default(), Some("10.0.0.1"), Some(7000)).unwrap();
        assert_eq!(config.bind, "10.0.0.1");
        assert_eq!(config.port, 7000);

        clear_env();
    }

    #[test]
    fn resolve_with_env_vars_overrides_config_file() {
        let _lock = lock_env();
        clear_env();
        unsafe { std::env::set_var("CRAWLCTL_BIND", "0.0.0.0") };
        unsafe { std::env::set_var("CRAWLCTL_PORT", "9999") };
        unsafe { std::env::set_var("CRAWLCTL_WORKER_PROGRAM", "/opt/worker") };
        unsafe { std::env::set_var("CRAWLCTL_TAG", "[other]") };

        let mut file = ConfigFile::default();
        file.server.bind = "192.168.1.1".into();
        file.server.port = 1234;
        let config = CrawlctlConfig::from_file(file, None, None).unwrap();

        clear_env();

        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 9999);
        assert_eq!(config.orchestrator.command.program, "/opt/worker");
        assert!(config.orchestrator.filter.accepts("x [other] y"));
        assert!(!config.orchestrator.filter.accepts("x [gov_policy] y"));
    }

    #[test]
    fn resolve_rejects_invalid_port_env() {
        let _lock = lock_env();
        clear_env();
        unsafe { std::env::set_var("CRAWLCTL_PORT", "eighty") };

        let result = CrawlctlConfig::from_file(ConfigFile::default(), None, None);
        clear_env();

        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains("CRAWLCTL_PORT"), "unexpected error: {msg}");
    }

    #[test]
    fn resolve_defaults_when_nothing_set() {
        let _lock = lock_env();
        clear_env();

        let config = CrawlctlConfig::from_file(ConfigFile::default(), None, None).unwrap();
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.port, 8000);
        assert_eq!(config.orchestrator.command, WorkerCommand::default());
        assert_eq!(config.orchestrator.filter.name(), "tag");
        assert_eq!(config.orchestrator.stop_timeout, Duration::from_secs(10));
        assert_eq!(config.orchestrator.capture, CaptureConfig::default());
        assert_eq!(config.site_config_path, PathBuf::from("config.json"));
    }

    #[test]
    fn forward_all_selects_accept_all_filter() {
        let _lock = lock_env();
        clear_env();

        let mut file = ConfigFile::default();
        file.capture.forward_all = true;
        let config = CrawlctlConfig::from_file(file, None, None).unwrap();
        assert_eq!(config.orchestrator.filter.name(), "accept-all");
        assert!(config.orchestrator.filter.accepts("anything"));
    }

    #[test]
    fn empty_tag_without_forward_all_is_rejected() {
        let _lock = lock_env();
        clear_env();

        let mut file = ConfigFile::default();
        file.capture.tag = String::new();
        assert!(CrawlctlConfig::from_file(file, None, None).is_err());
    }

    #[test]
    fn site_config_path_is_resolved_against_working_dir() {
        let _lock = lock_env();
        clear_env();

        let mut file = ConfigFile::default();
        file.worker.working_dir = Some(PathBuf::from("/srv/crawler"));
        let config = CrawlctlConfig::from_file(file.clone(), None, None).unwrap();
        assert_eq!(
            config.site_config_path,
            PathBuf::from("/srv/crawler/config.json")
        );

        file.worker.config_path = PathBuf::from("/etc/sites.json");
        let config = CrawlctlConfig::from_file(file, None, None).unwrap();
        assert_eq!(config.site_config_path, PathBuf::from("/etc/sites.json"));
    }

    #[test]
    fn resolve_with_missing_override_file_errors() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("nope.toml");

        let msg = format!(
            "{:#}",
            CrawlctlConfig::resolve(Some(&missing), None, None).unwrap_err()
        );
        assert!(msg.contains("failed to read config file"), "unexpected: {msg}");
    }

    #[test]
    fn resolve_without_config_file_uses_defaults() {
        let _lock = lock_env();
        clear_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };

        let result = CrawlctlConfig::resolve(None, None, None);

        // Restore env before asserting, to avoid poisoning the mutex on failure.
        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }

        let config = result.unwrap();
        assert_eq!(config.port, 8000);
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("crawlctl/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
