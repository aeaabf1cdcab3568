pub mod init;

use serde::{Deserialize, Serialize};

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use lettre::Address;
use log::{debug, warn};

use crate::error::SettingsError;

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

// Main configuration struct
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub imap: ImapConfig,
    pub smtp: SmtpConfig,
    pub filter: FilterConfig,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub subject: SubjectConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub web: ServerConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImapConfig {
    pub server: String,
    pub port: u16,
    #[serde(default = "default_imap_security")]
    pub security: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    #[serde(default = "default_smtp_security")]
    pub security: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    /// Implicit TLS from the first byte, certificate verified.
    Ssl,
    /// STARTTLS when offered, certificate checks relaxed.
    StartTls,
    None,
}

impl SmtpConfig {
    pub fn security_mode(&self) -> Option<SmtpSecurity> {
        match self.security.to_lowercase().as_str() {
            "ssl" | "tls" => Some(SmtpSecurity::Ssl),
            "starttls" => Some(SmtpSecurity::StartTls),
            "none" => Some(SmtpSecurity::None),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct FilterConfig {
    #[serde(default)]
    pub from: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SubjectConfig {
    #[serde(default)]
    pub prefix: String,
}

/// Timeouts and retry knobs for the watch loop. All values in seconds.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WatchConfig {
    pub connect_timeout_secs: u64,
    pub validation_timeout_secs: u64,
    pub message_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub stop_grace_secs: u64,
    pub logout_grace_secs: u64,
    pub reconnect_base_secs: u64,
    pub reconnect_max_secs: u64,
    pub failure_threshold: u32,
    pub sent_folders: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            connect_timeout_secs: 10,
            validation_timeout_secs: 10,
            message_timeout_secs: 15,
            command_timeout_secs: 30,
            idle_timeout_secs: 25 * 60,
            poll_interval_secs: 60,
            stop_grace_secs: 5,
            logout_grace_secs: 3,
            reconnect_base_secs: 10,
            reconnect_max_secs: 5 * 60,
            failure_threshold: 3,
            sent_folders: default_sent_folders(),
        }
    }
}

/// Durations derived from [`WatchConfig`].
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub validation: Duration,
    pub message: Duration,
    pub command: Duration,
    pub idle: Duration,
    pub poll_interval: Duration,
    pub stop_grace: Duration,
    pub logout_grace: Duration,
}

impl WatchConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            validation: Duration::from_secs(self.validation_timeout_secs),
            message: Duration::from_secs(self.message_timeout_secs),
            command: Duration::from_secs(self.command_timeout_secs),
            idle: Duration::from_secs(self.idle_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            logout_grace: Duration::from_secs(self.logout_grace_secs),
        }
    }
}

// REST server configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

fn default_imap_security() -> String {
    "ssl".to_string()
}

fn default_smtp_security() -> String {
    "ssl".to_string()
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

/// Conventional "Sent" names, including the German spellings Strato and
/// friends use.
pub fn default_sent_folders() -> Vec<String> {
    [
        "Sent",
        "Sent Items",
        "Sent Messages",
        "Gesendet",
        "Gesendete Elemente",
        "Gesendete Objekte",
        "INBOX.Sent",
        "INBOX.Sent Items",
        "INBOX.Gesendet",
    ]
    .iter()
    .map(|name| name.to_string())
    .collect()
}

const ENV_OVERRIDES: [&str; 4] = [
    "MAIL_REFLECTOR_IMAP_USERNAME",
    "MAIL_REFLECTOR_IMAP_PASSWORD",
    "MAIL_REFLECTOR_SMTP_USERNAME",
    "MAIL_REFLECTOR_SMTP_PASSWORD",
];

pub fn load_settings(path: impl AsRef<Path>) -> Result<Config, SettingsError> {
    let path = path.as_ref();
    let display = path.display().to_string();

    let file = File::open(path).map_err(|source| SettingsError::Io {
        path: display.clone(),
        source,
    })?;
    let reader = BufReader::new(file);

    // Parse the YAML file into the Config struct
    let mut config: Config =
        serde_yaml::from_reader(reader).map_err(|source| SettingsError::Parse {
            path: display.clone(),
            source,
        })?;

    config.apply_env_overrides(|key| std::env::var(key).ok());
    debug!("-- loaded settings from {}", display);
    Ok(config)
}

impl Config {
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for key in ENV_OVERRIDES {
            let Some(value) = lookup(key).filter(|v| !v.is_empty()) else {
                continue;
            };
            debug!("-- {} overrides file setting", key);
            match key {
                "MAIL_REFLECTOR_IMAP_USERNAME" => self.imap.username = value,
                "MAIL_REFLECTOR_IMAP_PASSWORD" => self.imap.password = value,
                "MAIL_REFLECTOR_SMTP_USERNAME" => self.smtp.username = value,
                _ => self.smtp.password = value,
            }
        }
    }

    /// Returns every problem found, empty when the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        check_endpoint(
            &mut errors,
            "IMAP",
            &self.imap.server,
            self.imap.port,
            &self.imap.username,
            &self.imap.password,
        );
        if !matches!(self.imap.security.to_lowercase().as_str(), "ssl" | "tls") {
            errors.push("IMAP security must be one of: ssl, tls".to_string());
        }
        if self.imap.mailbox.trim().is_empty() {
            errors.push("IMAP mailbox must not be empty".to_string());
        }

        check_endpoint(
            &mut errors,
            "SMTP",
            &self.smtp.server,
            self.smtp.port,
            &self.smtp.username,
            &self.smtp.password,
        );
        if self.smtp.security_mode().is_none() {
            errors.push("SMTP security must be one of: ssl, tls, starttls, none".to_string());
        }
        // The SMTP identity doubles as the From address of every forward
        if !self.smtp.username.trim().is_empty()
            && self.smtp.username.trim().parse::<Address>().is_err()
        {
            errors.push(format!(
                "SMTP username must be an email address: {}",
                self.smtp.username
            ));
        }

        check_addresses(&mut errors, "sender filter", &self.filter.from);
        check_addresses(&mut errors, "recipient", &self.recipients);

        let watch = &self.watch;
        let durations = [
            ("connect_timeout_secs", watch.connect_timeout_secs),
            ("validation_timeout_secs", watch.validation_timeout_secs),
            ("message_timeout_secs", watch.message_timeout_secs),
            ("command_timeout_secs", watch.command_timeout_secs),
            ("idle_timeout_secs", watch.idle_timeout_secs),
            ("poll_interval_secs", watch.poll_interval_secs),
            ("stop_grace_secs", watch.stop_grace_secs),
            ("logout_grace_secs", watch.logout_grace_secs),
            ("reconnect_base_secs", watch.reconnect_base_secs),
            ("reconnect_max_secs", watch.reconnect_max_secs),
        ];
        for (name, secs) in durations {
            if secs == 0 {
                errors.push(format!("watch.{} must be at least 1", name));
            }
        }
        if watch.reconnect_base_secs > watch.reconnect_max_secs {
            errors.push(
                "watch.reconnect_base_secs must not exceed reconnect_max_secs".to_string(),
            );
        }
        if watch.failure_threshold == 0 {
            errors.push("watch.failure_threshold must be at least 1".to_string());
        }

        errors
    }

    /// Non-fatal configuration smells, logged once at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.filter.from.iter().any(|a| *a != a.to_lowercase()) {
            warnings.push(
                "filter addresses contain uppercase letters; matching is case-insensitive"
                    .to_string(),
            );
        }
        if self.smtp.security_mode() == Some(SmtpSecurity::StartTls) {
            warnings.push(
                "smtp.security=starttls relaxes certificate validation; prefer ssl".to_string(),
            );
        }

        warnings
    }

    pub fn log_warnings(&self) {
        self.warnings().iter().for_each(|w| warn!("{}", w));
    }
}

fn check_endpoint(
    errors: &mut Vec<String>,
    label: &str,
    server: &str,
    port: u16,
    username: &str,
    password: &str,
) {
    if server.trim().is_empty() {
        errors.push(format!("{} server is required", label));
    }
    if port == 0 {
        errors.push(format!("{} port must be between 1 and 65535", label));
    }
    if username.trim().is_empty() {
        errors.push(format!("{} username is required", label));
    }
    if password.is_empty() {
        errors.push(format!("{} password is required", label));
    }
}

fn check_addresses(errors: &mut Vec<String>, label: &str, addresses: &[String]) {
    if addresses.is_empty() {
        errors.push(format!("At least one {} is required", label));
    }
    for address in addresses {
        if address.trim().is_empty() {
            errors.push(format!("Empty {} found", label));
        } else if address.trim().parse::<Address>().is_err() {
            errors.push(format!("Invalid email format in {}: {}", label, address));
        }
    }
}
