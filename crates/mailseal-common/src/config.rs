//! Configuration for MailSeal

use crate::types::{PolicyFlags, SettingsMode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// S/MIME configuration
    #[serde(default)]
    pub smime: SmimeConfig,

    /// Outbound SMTP relay configuration
    #[serde(default)]
    pub smtp: SmtpConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// S/MIME configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmimeConfig {
    /// PEM file holding the signing certificate followed by its chain
    pub signing_certificate: Option<PathBuf>,

    /// PKCS#8 PEM file holding the signing private key
    pub signing_key: Option<PathBuf>,

    /// Directories scanned for recipient certificates
    #[serde(default)]
    pub certificate_dirs: Vec<PathBuf>,

    /// PEM files holding trusted root certificates
    #[serde(default)]
    pub trust_anchors: Vec<PathBuf>,

    /// PEM files holding intermediate certificates used for path building
    #[serde(default)]
    pub intermediates: Vec<PathBuf>,

    /// Recipient certificates must chain to a trust anchor
    #[serde(default = "default_require_verification")]
    pub require_certificate_verification: bool,

    /// Recipient certificates must carry the dataEncipherment key usage
    #[serde(default)]
    pub require_key_usage_data_encipherment: bool,

    /// Recipient certificates must list the emailProtection extended key usage
    #[serde(default)]
    pub require_enhanced_key_usage_secure_email: bool,

    /// Add a signing-time attribute to signatures
    #[serde(default = "default_sign_time")]
    pub sign_time: bool,

    /// Enforcement mode for requested protections
    #[serde(default)]
    pub settings_mode: SettingsMode,
}

impl Default for SmimeConfig {
    fn default() -> Self {
        Self {
            signing_certificate: None,
            signing_key: None,
            certificate_dirs: Vec::new(),
            trust_anchors: Vec::new(),
            intermediates: Vec::new(),
            require_certificate_verification: default_require_verification(),
            require_key_usage_data_encipherment: false,
            require_enhanced_key_usage_secure_email: false,
            sign_time: default_sign_time(),
            settings_mode: SettingsMode::default(),
        }
    }
}

fn default_require_verification() -> bool {
    true
}

fn default_sign_time() -> bool {
    true
}

impl SmimeConfig {
    /// Policy flags derived from the boolean switches
    pub fn policy_flags(&self) -> PolicyFlags {
        let mut flags = PolicyFlags::empty();
        flags.set(
            PolicyFlags::REQUIRE_CERTIFICATE_VERIFICATION,
            self.require_certificate_verification,
        );
        flags.set(
            PolicyFlags::REQUIRE_KEY_USAGE_DATA_ENCIPHERMENT,
            self.require_key_usage_data_encipherment,
        );
        flags.set(
            PolicyFlags::REQUIRE_ENHANCED_KEY_USAGE_SECURE_EMAIL,
            self.require_enhanced_key_usage_secure_email,
        );
        flags.set(PolicyFlags::SIGN_TIME, self.sign_time);
        flags
    }
}

/// Outbound SMTP relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Relay host
    #[serde(default = "default_smtp_host")]
    pub host: String,

    /// Relay port
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Upgrade the connection with STARTTLS
    #[serde(default = "default_starttls")]
    pub starttls: bool,

    /// Username for SMTP AUTH
    pub username: Option<String>,

    /// Password for SMTP AUTH
    pub password: Option<String>,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            starttls: default_starttls(),
            username: None,
            password: None,
            timeout_secs: default_connection_timeout(),
        }
    }
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_starttls() -> bool {
    true
}

fn default_connection_timeout() -> u64 {
    60
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        Self::load_first(&default_paths())?.ok_or_else(|| {
            crate::Error::Config("No configuration file found".to_string())
        })
    }

    /// Load from the default locations, using defaults only when no file exists
    ///
    /// A file that exists but cannot be read or parsed is still an error.
    pub fn load_or_default() -> crate::Result<Self> {
        Ok(Self::load_first(&default_paths())?.unwrap_or_default())
    }

    /// Load the first of `paths` that exists
    pub fn load_first(paths: &[std::path::PathBuf]) -> crate::Result<Option<Self>> {
        match paths.iter().find(|path| path.exists()) {
            Some(path) => Self::from_file(path).map(Some),
            None => Ok(None),
        }
    }
}

fn default_paths() -> [std::path::PathBuf; 2] {
    [
        std::path::PathBuf::from("./mailseal.toml"),
        std::path::PathBuf::from("/etc/mailseal/config.toml"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let logging = LoggingConfig::default();
        assert_eq!(logging.level, "info");
        assert_eq!(logging.format, "json");

        let smtp = SmtpConfig::default();
        assert_eq!(smtp.port, 587);
        assert!(smtp.starttls);

        let smime = SmimeConfig::default();
        assert_eq!(
            smime.policy_flags(),
            PolicyFlags::REQUIRE_CERTIFICATE_VERIFICATION | PolicyFlags::SIGN_TIME
        );
        assert_eq!(smime.settings_mode, SettingsMode::RequireExact);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[logging]
format = "text"

[smime]
signing_certificate = "certs/me.pem"
signing_key = "certs/me.key"
certificate_dirs = ["certs/recipients"]
trust_anchors = ["certs/roots.pem"]
require_certificate_verification = false
require_enhanced_key_usage_secure_email = true
sign_time = false
settings_mode = "best_effort"

[smtp]
host = "smtp.example.com"
port = 25
starttls = false
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.logging.format, "text");
        assert_eq!(config.smime.signing_key, Some(PathBuf::from("certs/me.key")));
        assert_eq!(config.smime.certificate_dirs, vec![PathBuf::from("certs/recipients")]);
        assert_eq!(
            config.smime.policy_flags(),
            PolicyFlags::REQUIRE_ENHANCED_KEY_USAGE_SECURE_EMAIL
        );
        assert_eq!(config.smime.settings_mode, SettingsMode::BestEffort);
        assert_eq!(config.smtp.host, "smtp.example.com");
        assert_eq!(config.smtp.port, 25);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[smtp]\nhost = \"relay.internal\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.smtp.host, "relay.internal");
        assert!(config.smime.signing_certificate.is_none());
    }

    #[test]
    fn test_load_first_skips_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(Config::load_first(&[missing.clone()]).unwrap().is_none());

        let present = dir.path().join("mailseal.toml");
        std::fs::write(&present, "[smtp]\nport = 2525\n").unwrap();
        let config = Config::load_first(&[missing, present]).unwrap().unwrap();
        assert_eq!(config.smtp.port, 2525);
    }

    #[test]
    fn test_load_first_propagates_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("mailseal.toml");
        std::fs::write(&broken, "[smime\nsign_time = ").unwrap();

        let err = Config::load_first(&[broken]).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_from_file_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[smtp\nhost =").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
