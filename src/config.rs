use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

use serde::Deserialize;

/// Environment variable naming the JSON config file.
pub const CONFIG_PATH_ENV: &str = "ROSTER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.json";
const ENV_PREFIX: &str = "ROSTER";

/// Name of the implicit site used when `sites` is empty.
pub const DEFAULT_SITE_SLUG: &str = "default";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub app: AppConfig,
    pub youtube: YouTubeConfig,
    pub twitch: TwitchConfig,
    pub admin: AdminConfig,
    pub sites: Vec<SiteConfig>,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL; WebSub and EventSub callbacks are built from it.
    pub public_url: String,
    /// Allowed CORS origin for the admin frontend. CORS is disabled when unset.
    pub cors_origin: Option<String>,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub data_dir: PathBuf,
    pub default_site: Option<String>,
    pub submissions_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupMode {
    /// Scrape the watch page for the embedded player response.
    #[default]
    Scrape,
    /// Use the YouTube Data API (requires `api_key`).
    Api,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct YouTubeConfig {
    pub enabled: bool,
    pub hub_url: String,
    pub api_key: Option<String>,
    pub lookup: LookupMode,
    /// Requested WebSub lease length.
    pub lease_seconds: u64,
    /// How often the lease monitor wakes up.
    pub monitor_interval_seconds: u64,
    pub api_base_url: String,
    pub watch_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TwitchConfig {
    pub enabled: bool,
    pub client_id: String,
    pub client_secret: String,
    /// Secret Twitch signs EventSub deliveries with (10-100 characters).
    pub eventsub_secret: String,
    /// Overrides `{public_url}/admin/eventsub`.
    pub callback_url: Option<String>,
    pub api_base_url: String,
    pub auth_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub username: String,
    /// Plain text, or a bcrypt hash (`$2a$`, `$2b$`, `$2y$`).
    pub password: String,
    pub token_ttl_hours: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub slug: String,
    pub name: String,
    /// Host names that select this site when no `site` query parameter is given.
    pub hosts: Vec<String>,
    pub streamers_file: Option<PathBuf>,
    pub submissions_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for webhook callbacks (/alerts, /admin/eventsub)
    pub webhook_per_second: u32,
    /// Burst size for webhook callbacks
    pub webhook_burst: u32,
    /// Allowed requests per second (per IP) for public POST endpoints (login, submissions)
    pub public_per_second: u32,
    /// Burst size for public POST endpoints
    pub public_burst: u32,
}

impl Config {
    /// Load `config.json` (or the file named by `ROSTER_CONFIG`) overlaid with
    /// `ROSTER_*` environment variables, e.g. `ROSTER_SERVER__PORT=9000`.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Json).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.twitch.enabled {
            if self.twitch.client_id.is_empty() {
                return Err(ConfigError::MissingValue("twitch.client_id".to_string()));
            }
            if self.twitch.client_secret.is_empty() {
                return Err(ConfigError::MissingValue("twitch.client_secret".to_string()));
            }
            let secret_len = self.twitch.eventsub_secret.len();
            if !(10..=100).contains(&secret_len) {
                return Err(ConfigError::InvalidValue(
                    "twitch.eventsub_secret must be 10-100 characters".to_string(),
                ));
            }
        }

        if self.youtube.enabled && self.youtube.lease_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "youtube.lease_seconds must be positive".to_string(),
            ));
        }

        if self.youtube.monitor_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "youtube.monitor_interval_seconds must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for site in &self.sites {
            if site.slug.trim().is_empty() {
                return Err(ConfigError::MissingValue("sites[].slug".to_string()));
            }
            if !seen.insert(site.slug.to_lowercase()) {
                return Err(ConfigError::InvalidValue(format!(
                    "duplicate site slug: {}",
                    site.slug
                )));
            }
        }

        if let Some(default_site) = &self.app.default_site {
            let known = if self.sites.is_empty() {
                default_site == DEFAULT_SITE_SLUG
            } else {
                seen.contains(&default_site.to_lowercase())
            };
            if !known {
                return Err(ConfigError::InvalidValue(format!(
                    "app.default_site names an unknown site: {}",
                    default_site
                )));
            }
        }

        Ok(())
    }

    /// WebSub callback the hub delivers verifications and feeds to.
    pub fn websub_callback_url(&self) -> String {
        format!("{}/alerts", self.server.public_url.trim_end_matches('/'))
    }

    pub fn eventsub_callback_url(&self) -> String {
        self.twitch.callback_url.clone().unwrap_or_else(|| {
            format!(
                "{}/admin/eventsub",
                self.server.public_url.trim_end_matches('/')
            )
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            public_url: "http://localhost:8080".to_string(),
            cors_origin: None,
            log_format: LogFormat::Pretty,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            name: "Streamer Roster".to_string(),
            data_dir: PathBuf::from("data"),
            default_site: None,
            submissions_enabled: true,
        }
    }
}

impl Default for YouTubeConfig {
    fn default() -> Self {
        YouTubeConfig {
            enabled: false,
            hub_url: "https://pubsubhubbub.appspot.com/subscribe".to_string(),
            api_key: None,
            lookup: LookupMode::Scrape,
            lease_seconds: 432_000,
            monitor_interval_seconds: 60,
            api_base_url: "https://www.googleapis.com/youtube/v3".to_string(),
            watch_base_url: "https://www.youtube.com".to_string(),
        }
    }
}

impl Default for TwitchConfig {
    fn default() -> Self {
        TwitchConfig {
            enabled: false,
            client_id: String::new(),
            client_secret: String::new(),
            eventsub_secret: String::new(),
            callback_url: None,
            api_base_url: "https://api.twitch.tv/helix".to_string(),
            auth_base_url: "https://id.twitch.tv/oauth2".to_string(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        AdminConfig {
            username: "admin".to_string(),
            password: String::new(),
            token_ttl_hours: 12,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            webhook_per_second: 10,
            webhook_burst: 50,
            public_per_second: 3,
            public_burst: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.youtube.monitor_interval_seconds, 60);
        assert_eq!(config.websub_callback_url(), "http://localhost:8080/alerts");
        assert_eq!(
            config.eventsub_callback_url(),
            "http://localhost:8080/admin/eventsub"
        );
    }

    #[test]
    fn loads_json_file_with_partial_blocks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "server": {{ "port": 9090, "public_url": "https://roster.example/" }},
                "youtube": {{ "enabled": true, "lookup": "api", "api_key": "k" }},
                "sites": [
                    {{ "slug": "vt", "name": "VTubers", "hosts": ["vt.example"] }},
                    {{ "slug": "en", "name": "English" }}
                ],
                "app": {{ "default_site": "vt" }}
            }}"#
        )
        .unwrap();

        let config = Config::load_from(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.youtube.lookup, LookupMode::Api);
        assert_eq!(config.youtube.lease_seconds, 432_000);
        assert_eq!(config.sites.len(), 2);
        assert_eq!(config.sites[0].hosts, vec!["vt.example".to_string()]);
        assert_eq!(config.websub_callback_url(), "https://roster.example/alerts");
    }

    #[test]
    fn twitch_requires_credentials_when_enabled() {
        let mut config = Config::default();
        config.twitch.enabled = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingValue(_))
        ));

        config.twitch.client_id = "id".to_string();
        config.twitch.client_secret = "secret".to_string();
        config.twitch.eventsub_secret = "short".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(_))
        ));

        config.twitch.eventsub_secret = "a-long-enough-secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_and_unknown_sites() {
        let mut config = Config::default();
        config.sites = vec![
            SiteConfig {
                slug: "a".to_string(),
                ..Default::default()
            },
            SiteConfig {
                slug: "A".to_string(),
                ..Default::default()
            },
        ];
        assert!(config.validate().is_err());

        config.sites.pop();
        config.app.default_site = Some("b".to_string());
        assert!(config.validate().is_err());

        config.app.default_site = Some("a".to_string());
        assert!(config.validate().is_ok());
    }
}
