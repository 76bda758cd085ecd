//! Configuration manager for lexica.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::AppState;
use crate::generator::Provider;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors raised while assembling the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing `{0}` environment variable")]
    MissingEnv(&'static str),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Public base URL, used to build mail and OAuth links.
    pub url: String,
    /// Listening port.
    #[serde(skip_serializing)]
    pub port: u16,
    #[serde(skip_deserializing)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Emails (or usernames) promoted to administrator on sign in.
    #[serde(skip_serializing)]
    pub admins: Vec<String>,
    /// Related to SQLite configuration.
    #[serde(skip_serializing)]
    pub database: Database,
    /// Related to Argon2 configuration.
    #[serde(skip_serializing)]
    pub argon2: Option<Argon2>,
    /// Related to the global and mail rate limiters.
    #[serde(skip_serializing)]
    pub rate_limiting: RateLimiting,
    /// Related to background sentence generation.
    #[serde(skip_serializing)]
    pub generator: Generator,
    /// Related to automatic mail sending.
    #[serde(skip_serializing)]
    pub mail: Option<Mail>,
    /// Related to Discord and Google sign in.
    #[serde(skip_serializing)]
    pub oauth: OAuth,
    /// Account owning bundled libraries.
    #[serde(skip_serializing)]
    pub system: SystemUser,
    /// Quotas, folders and locale defaults.
    #[serde(skip_serializing)]
    pub defaults: Defaults,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: "lexica".to_owned(),
            url: "http://localhost:8888/".to_owned(),
            port: 8888,
            version: VERSION.to_owned(),
            path: PathBuf::default(),
            admins: Vec::new(),
            database: Database::default(),
            argon2: None,
            rate_limiting: RateLimiting::default(),
            generator: Generator::default(),
            mail: None,
            oauth: OAuth::default(),
            system: SystemUser::default(),
            defaults: Defaults::default(),
        }
    }
}

/// SQLite configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    /// Connection string, such as `sqlite://lexica.db`.
    pub url: String,
    /// Maximum pool connections.
    pub pool_size: u32,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            url: "sqlite://lexica.db".to_owned(),
            pool_size: crate::database::DEFAULT_POOL_SIZE,
        }
    }
}

/// Argon2 configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Argon2 {
    /// Memory used while hashing, in KiB.
    pub memory_cost: u32,
    /// Iterations of hash.
    pub iterations: u32,
    /// Parallelism degree.
    pub parallelism: u32,
    /// Output hash length.
    pub hash_length: usize,
}

impl Default for Argon2 {
    fn default() -> Self {
        Self {
            memory_cost: 1024 * 64, // 64 MiB.
            iterations: 4,
            parallelism: 2,
            hash_length: 32,
        }
    }
}

/// Request ceilings of a limiter.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct Ceilings {
    pub per_minute: usize,
    pub per_hour: usize,
    pub per_day: usize,
}

impl From<Ceilings> for lexica_limits::Limits {
    fn from(ceilings: Ceilings) -> Self {
        Self {
            per_minute: ceilings.per_minute,
            per_hour: ceilings.per_hour,
            per_day: ceilings.per_day,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiting {
    pub enabled: bool,
    /// Ceilings of the global limiter.
    pub requests: Ceilings,
    /// Ceilings of the mail resend routes.
    pub mail: Ceilings,
    pub ban_duration_minutes: u64,
    /// Addresses never limited.
    pub whitelist_ips: Vec<String>,
}

impl Default for RateLimiting {
    fn default() -> Self {
        Self {
            enabled: true,
            requests: Ceilings {
                per_minute: 60,
                per_hour: 1000,
                per_day: 10000,
            },
            mail: Ceilings {
                per_minute: 1,
                per_hour: 5,
                per_day: 10,
            },
            ban_duration_minutes: 5,
            whitelist_ips: Vec::new(),
        }
    }
}

/// Sentence generator configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Generator {
    pub enabled: bool,
    pub provider: Provider,
    /// Model name; the provider default when empty.
    pub model: Option<String>,
    /// Override of the provider endpoint.
    pub endpoint: Option<String>,
    pub retry_attempts: u32,
    /// Seconds slept between two attempts.
    pub retry_delay: u64,
    /// Seconds slept between two generation cycles.
    pub interval: u64,
    pub max_sentences_per_word: i64,
}

impl Default for Generator {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: Provider::default(),
            model: None,
            endpoint: None,
            retry_attempts: 5,
            retry_delay: 1,
            interval: 60 * 60,
            max_sentences_per_word: 5,
        }
    }
}

/// Mail queue configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mail {
    /// Hostname:(?port) for RabbitMQ instance.
    pub address: String,
    /// RabbitMQ default vhost.
    pub vhost: Option<String>,
    /// RabbitMQ username to access queue.
    pub username: String,
    /// RabbitMQ password to access queue.
    pub password: String,
    /// Max channel connections.
    pub pool: Option<u16>,
    /// Queue name to send mailing events.
    pub queue: String,
}

/// OAuth client credentials.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthClient {
    pub client_id: String,
    /// Usually injected through the environment.
    #[serde(default)]
    pub client_secret: String,
}

/// OAuth configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuth {
    /// Callback base; `{redirect_uri}/{provider}/callback` is registered on
    /// each provider. Defaults to `{url}oauth`.
    pub redirect_uri: Option<String>,
    pub discord: Option<OAuthClient>,
    pub google: Option<OAuthClient>,
}

/// System account configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemUser {
    pub username: String,
    pub email: String,
}

impl Default for SystemUser {
    fn default() -> Self {
        Self {
            username: "system".to_owned(),
            email: "system@localhost".to_owned(),
        }
    }
}

/// Misc defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub locale: String,
    /// Directory of bundled library JSON files.
    pub library_dir: PathBuf,
    /// Directory where processed avatars are written.
    pub avatar_dir: PathBuf,
    /// Maximum avatar upload, in bytes.
    pub max_avatar_size: usize,
    /// Libraries a regular user may own.
    pub max_libraries: i64,
    /// Words a regular user may put in a library.
    pub max_words: usize,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            locale: "en".to_owned(),
            library_dir: PathBuf::from("library"),
            avatar_dir: PathBuf::from("static/avatars"),
            max_avatar_size: 2 * 1024 * 1024,
            max_libraries: 5,
            max_words: 500,
        }
    }
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Application version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Normalizes a URL string by ensuring it starts with a valid scheme
    /// (`http` or `https`).
    fn normalize_url(url: &str) -> Result<String, url::ParseError> {
        let url_with_scheme =
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("https://{url}")
            };

        let parsed_url = Url::parse(&url_with_scheme)?;
        Ok(parsed_url.to_string())
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location, then applies secrets from the environment.
    pub fn read(self) -> Result<Arc<Self>, ConfigError> {
        let file_path = if self.path.is_file() {
            self.path.clone()
        } else {
            Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        let mut config = match File::open(&file_path) {
            Ok(file) => match serde_yaml::from_reader::<_, Configuration>(file) {
                Ok(config) => config,
                Err(err) => Self::fallback(err),
            },
            Err(err) => Self::fallback(err),
        };

        config.version = VERSION.to_owned();
        config.path = file_path;
        config.url = Self::normalize_url(&config.url)?;
        config.apply_env();

        Ok(Arc::new(config))
    }

    /// Override secrets with environment variables.
    fn apply_env(&mut self) {
        if let (Some(client), Ok(secret)) = (
            self.oauth.discord.as_mut(),
            std::env::var("DISCORD_CLIENT_SECRET"),
        ) {
            client.client_secret = secret;
        }

        if let (Some(client), Ok(secret)) = (
            self.oauth.google.as_mut(),
            std::env::var("GOOGLE_CLIENT_SECRET"),
        ) {
            client.client_secret = secret;
        }
    }

    /// Base of the OAuth callback URLs.
    pub fn redirect_uri(&self) -> String {
        match &self.oauth.redirect_uri {
            Some(uri) => uri.trim_end_matches('/').to_owned(),
            None => format!("{}oauth", self.url),
        }
    }

    /// Return a default configuration as fallback.
    fn fallback(err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "`config.yaml` file not readable, using defaults");
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "name: vocab\nurl: vocab.example.com\nport: 3000\ngenerator:\n  enabled: true\n  provider: gemini\nrate_limiting:\n  mail:\n    per_minute: 2\n    per_hour: 4\n    per_day: 8"
        )
        .unwrap();

        let config = Configuration::default()
            .path(file.path().to_path_buf())
            .read()
            .unwrap();

        assert_eq!(config.name, "vocab");
        assert_eq!(config.url, "https://vocab.example.com/");
        assert_eq!(config.port, 3000);
        assert!(config.generator.enabled);
        assert_eq!(config.generator.provider, Provider::Gemini);
        assert_eq!(config.generator.retry_attempts, 5);
        assert_eq!(config.rate_limiting.mail.per_minute, 2);
        assert_eq!(config.rate_limiting.requests.per_minute, 60);
        assert_eq!(config.defaults.max_libraries, 5);
        assert_eq!(config.version(), VERSION);
        assert_eq!(config.redirect_uri(), "https://vocab.example.com/oauth");
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = Configuration::default()
            .path(PathBuf::from("/nonexistent/lexica.yaml"))
            .read()
            .unwrap();

        assert_eq!(config.name, "lexica");
        assert_eq!(config.url, "http://localhost:8888/");
    }
}
