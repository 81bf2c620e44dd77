// Configuration loading and validation (config/livechat.toml).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use livechat_core::session;

pub const CONFIG_FILE: &str = "livechat.toml";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// livechat.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub urls: UrlsConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_host: String,
    pub ws_port: u16,
    pub http_port: u16,
    /// Host name used when building the default public URLs.
    pub advertise_host: String,
    /// Take the client identity from the first `X-Forwarded-For` entry.
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".into(),
            ws_port: 8765,
            http_port: 8766,
            advertise_host: "localhost".into(),
            trust_forwarded_for: false,
        }
    }
}

/// Fixed credentials. Anything left unset is generated at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub code: Option<String>,
    pub admin_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UrlsConfig {
    pub mobile_url: Option<String>,
    pub ws_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub log_dir: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
        }
    }
}

/// URLs published to clients in `settings-sync`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicUrls {
    pub mobile_url: String,
    pub ws_url: String,
}

impl Config {
    pub fn ws_bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind_host, self.server.ws_port)
    }

    pub fn http_bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind_host, self.server.http_port)
    }

    pub fn public_urls(&self) -> PublicUrls {
        let host = &self.server.advertise_host;
        PublicUrls {
            mobile_url: self
                .urls
                .mobile_url
                .clone()
                .unwrap_or_else(|| format!("http://{host}:{}/", self.server.http_port)),
            ws_url: self
                .urls
                .ws_url
                .clone()
                .unwrap_or_else(|| format!("ws://{host}:{}/", self.server.ws_port)),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate `config/livechat.toml` relative to `base_dir`.
/// Does not copy defaults; see [`load_config`].
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join(CONFIG_FILE);
    let text = read_file(&path)?;
    let config: Config = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.clone(),
        source: e,
    })?;
    validate(&config)?;
    Ok(config)
}

/// Copy files from `defaults/` into `config/` when they are missing there.
/// Existing files are never overwritten. Returns the files that were copied.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.exists() {
        if !config_dir.exists() {
            return Err(ConfigError::DefaultsCopyError {
                message: format!(
                    "neither defaults/ nor config/ directory found in {}",
                    base_dir.display()
                ),
            });
        }
        return Ok(vec![]);
    }

    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create config directory: {e}"),
    })?;

    let entries = std::fs::read_dir(&defaults_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to read defaults directory: {e}"),
    })?;

    let mut copied = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to read defaults entry: {e}"),
        })?;
        let source = entry.path();
        if !source.is_file() {
            continue;
        }
        let Some(file_name) = source.file_name() else {
            continue;
        };
        let target = config_dir.join(file_name);

        match std::fs::OpenOptions::new().write(true).create_new(true).open(&target) {
            Ok(mut dest) => {
                let content = std::fs::read(&source).map_err(|e| ConfigError::DefaultsCopyError {
                    message: format!("failed to read {}: {e}", source.display()),
                })?;
                std::io::Write::write_all(&mut dest, &content).map_err(|e| ConfigError::DefaultsCopyError {
                    message: format!("failed to write {}: {e}", target.display()),
                })?;
                copied.push(target);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(ConfigError::DefaultsCopyError {
                    message: format!("failed to create {}: {e}", target.display()),
                });
            }
        }
    }

    Ok(copied)
}

/// Load config relative to the current working directory, seeding it from
/// `defaults/` first.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.into(),
        message: message.into(),
    }
}

pub fn validate(config: &Config) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.ws_port == 0 {
        return Err(invalid("server.ws_port", "must be greater than 0"));
    }
    if server.http_port == 0 {
        return Err(invalid("server.http_port", "must be greater than 0"));
    }
    if server.ws_port == server.http_port {
        return Err(invalid(
            "server.http_port",
            format!("must differ from server.ws_port ({})", server.ws_port),
        ));
    }
    if server.bind_host.trim().is_empty() {
        return Err(invalid("server.bind_host", "must not be empty"));
    }

    if let Some(code) = &config.session.code {
        if !session::is_valid_code(&code.to_ascii_uppercase()) {
            return Err(invalid(
                "session.code",
                format!("must be {} characters from the session alphabet", session::CODE_LEN),
            ));
        }
    }
    if let Some(secret) = &config.session.admin_secret {
        if !session::is_valid_secret(secret) {
            return Err(invalid(
                "session.admin_secret",
                format!("must be {} lowercase letters or digits", session::SECRET_LEN),
            ));
        }
    }

    if config.audit.log_dir.as_os_str().is_empty() {
        return Err(invalid("audit.log_dir", "must not be empty"));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_config(dir: &Path, body: &str) {
        let config_dir = dir.join("config");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join(CONFIG_FILE), body).unwrap();
    }

    fn defaults_file() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../defaults")
            .join(CONFIG_FILE)
    }

    #[test]
    fn shipped_defaults_parse_and_validate() {
        let text = fs::read_to_string(defaults_file()).unwrap();
        let config: Config = toml::from_str(&text).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.server.ws_port, 8765);
        assert_eq!(config.server.http_port, 8766);
        assert!(!config.server.trust_forwarded_for);
        assert_eq!(config.audit.log_dir, PathBuf::from("logs"));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "");
        let config = load_config_from(dir.path()).unwrap();
        assert_eq!(config.server.bind_host, "0.0.0.0");
        assert!(config.session.code.is_none());
        assert_eq!(config.ws_bind_addr(), "0.0.0.0:8765");
        assert_eq!(config.http_bind_addr(), "0.0.0.0:8766");
    }

    #[test]
    fn default_public_urls_use_advertise_host() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "[server]\nadvertise_host = \"10.1.2.3\"\nws_port = 9000\nhttp_port = 9001\n",
        );
        let urls = load_config_from(dir.path()).unwrap().public_urls();
        assert_eq!(urls.mobile_url, "http://10.1.2.3:9001/");
        assert_eq!(urls.ws_url, "ws://10.1.2.3:9000/");
    }

    #[test]
    fn url_overrides_win() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "[urls]\nmobile_url = \"https://chat.example.org/\"\nws_url = \"wss://chat.example.org/ws\"\n",
        );
        let urls = load_config_from(dir.path()).unwrap().public_urls();
        assert_eq!(urls.mobile_url, "https://chat.example.org/");
        assert_eq!(urls.ws_url, "wss://chat.example.org/ws");
    }

    #[test]
    fn fixed_credentials_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "[session]\ncode = \"abc234\"\nadmin_secret = \"k3y5ecr7\"\n");
        let config = load_config_from(dir.path()).unwrap();
        assert_eq!(config.session.code.as_deref(), Some("abc234"));
    }

    #[test]
    fn rejects_zero_port() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "[server]\nws_port = 0\n");
        match load_config_from(dir.path()) {
            Err(ConfigError::ValidationError { field, .. }) => assert_eq!(field, "server.ws_port"),
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn rejects_shared_port() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "[server]\nws_port = 9000\nhttp_port = 9000\n");
        match load_config_from(dir.path()) {
            Err(ConfigError::ValidationError { field, .. }) => assert_eq!(field, "server.http_port"),
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn rejects_code_with_ambiguous_characters() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "[session]\ncode = \"ABC10O\"\n");
        match load_config_from(dir.path()) {
            Err(ConfigError::ValidationError { field, .. }) => assert_eq!(field, "session.code"),
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn rejects_uppercase_secret() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "[session]\nadmin_secret = \"ABCDEFGH\"\n");
        match load_config_from(dir.path()) {
            Err(ConfigError::ValidationError { field, .. }) => assert_eq!(field, "session.admin_secret"),
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn file_not_found_when_config_missing() {
        let dir = tempfile::tempdir().unwrap();
        match load_config_from(dir.path()) {
            Err(ConfigError::FileNotFound { path }) => assert!(path.ends_with(CONFIG_FILE)),
            other => panic!("expected FileNotFound, got {other:?}"),
        }
    }

    #[test]
    fn parse_error_for_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "[server\nws_port = ");
        assert!(matches!(load_config_from(dir.path()), Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn ensure_config_files_copies_missing_and_keeps_existing() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = dir.path().join("defaults");
        fs::create_dir_all(&defaults).unwrap();
        fs::write(defaults.join(CONFIG_FILE), "[server]\nws_port = 1111\nhttp_port = 2222\n").unwrap();

        let copied = ensure_config_files(dir.path()).unwrap();
        assert_eq!(copied, vec![dir.path().join("config").join(CONFIG_FILE)]);

        fs::write(defaults.join(CONFIG_FILE), "[server]\nws_port = 3333\n").unwrap();
        assert!(ensure_config_files(dir.path()).unwrap().is_empty());
        assert_eq!(load_config_from(dir.path()).unwrap().server.ws_port, 1111);
    }

    #[test]
    fn ensure_config_files_without_defaults_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ensure_config_files(dir.path()),
            Err(ConfigError::DefaultsCopyError { .. })
        ));
        fs::create_dir_all(dir.path().join("config")).unwrap();
        assert!(ensure_config_files(dir.path()).unwrap().is_empty());
    }
}
