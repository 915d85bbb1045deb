use std::sync::Arc;

use serde::Serialize;

use crate::config::{Config, DEFAULT_SITE_SLUG};
use crate::db::{
    JsonStreamerRepository, JsonSubmissionRepository, Streamer, StreamerKey, StreamerRepository,
    SubmissionRepository,
};
use crate::error::{AppError, AppResult};

/// One tenant: a roster and a submission queue.
#[derive(Clone)]
pub struct Site {
    pub slug: String,
    pub name: String,
    pub hosts: Vec<String>,
    pub streamers: Arc<dyn StreamerRepository>,
    pub submissions: Arc<dyn SubmissionRepository>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteInfo {
    pub slug: String,
    pub name: String,
    pub hosts: Vec<String>,
}

impl Site {
    pub fn info(&self) -> SiteInfo {
        SiteInfo {
            slug: self.slug.clone(),
            name: self.name.clone(),
            hosts: self.hosts.clone(),
        }
    }
}

pub struct SiteRegistry {
    sites: Vec<Site>,
    default_slug: String,
}

impl SiteRegistry {
    pub fn from_config(config: &Config) -> Self {
        let data_dir = &config.app.data_dir;

        if config.sites.is_empty() {
            let site = Site {
                slug: DEFAULT_SITE_SLUG.to_string(),
                name: config.app.name.clone(),
                hosts: Vec::new(),
                streamers: Arc::new(JsonStreamerRepository::new(data_dir.join("streamers.json"))),
                submissions: Arc::new(JsonSubmissionRepository::new(
                    data_dir.join("submissions.json"),
                )),
            };
            return SiteRegistry {
                sites: vec![site],
                default_slug: DEFAULT_SITE_SLUG.to_string(),
            };
        }

        let sites: Vec<Site> = config
            .sites
            .iter()
            .map(|site| {
                let dir = data_dir.join(&site.slug);
                let streamers_file = site
                    .streamers_file
                    .clone()
                    .unwrap_or_else(|| dir.join("streamers.json"));
                let submissions_file = site
                    .submissions_file
                    .clone()
                    .unwrap_or_else(|| dir.join("submissions.json"));

                Site {
                    slug: site.slug.clone(),
                    name: if site.name.is_empty() {
                        site.slug.clone()
                    } else {
                        site.name.clone()
                    },
                    hosts: site.hosts.iter().map(|h| h.to_lowercase()).collect(),
                    streamers: Arc::new(JsonStreamerRepository::new(streamers_file)),
                    submissions: Arc::new(JsonSubmissionRepository::new(submissions_file)),
                }
            })
            .collect();

        let default_slug = config
            .app
            .default_site
            .clone()
            .unwrap_or_else(|| sites[0].slug.clone());

        SiteRegistry {
            sites,
            default_slug,
        }
    }

    pub fn all(&self) -> &[Site] {
        &self.sites
    }

    pub fn get(&self, slug: &str) -> Option<&Site> {
        self.sites
            .iter()
            .find(|s| s.slug.eq_ignore_ascii_case(slug))
    }

    pub fn default_site(&self) -> AppResult<&Site> {
        self.get(&self.default_slug)
            .or_else(|| self.sites.first())
            .ok_or_else(|| AppError::Config("no sites configured".to_string()))
    }

    /// Pick the site for a request: explicit slug, then Host header, then default.
    pub fn resolve(&self, slug: Option<&str>, host: Option<&str>) -> AppResult<&Site> {
        if let Some(slug) = slug.filter(|s| !s.is_empty()) {
            return self
                .get(slug)
                .ok_or_else(|| AppError::NotFound(format!("Unknown site: {}", slug)));
        }

        if let Some(host) = host {
            // Strip a port if present.
            let host = host.split(':').next().unwrap_or(host).to_lowercase();
            if let Some(site) = self.sites.iter().find(|s| s.hosts.contains(&host)) {
                return Ok(site);
            }
        }

        self.default_site()
    }

    /// Find the streamer owning a YouTube channel in any site.
    pub async fn find_youtube_channel(
        &self,
        channel_id: &str,
    ) -> AppResult<Option<(&Site, Streamer)>> {
        self.find(&StreamerKey::YouTubeChannel(channel_id.to_string()))
            .await
    }

    pub async fn find_twitch_broadcaster(
        &self,
        broadcaster_id: &str,
    ) -> AppResult<Option<(&Site, Streamer)>> {
        self.find(&StreamerKey::TwitchBroadcaster(broadcaster_id.to_string()))
            .await
    }

    async fn find(&self, key: &StreamerKey) -> AppResult<Option<(&Site, Streamer)>> {
        for site in &self.sites {
            if let Some(streamer) = site.streamers.find(key).await? {
                return Ok(Some((site, streamer)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteConfig;
    use crate::db::{CreateStreamer, YouTubeInput};

    fn two_sites(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.app.data_dir = dir.to_path_buf();
        config.sites = vec![
            SiteConfig {
                slug: "vt".to_string(),
                name: "VTubers".to_string(),
                hosts: vec!["VT.example".to_string()],
                ..Default::default()
            },
            SiteConfig {
                slug: "music".to_string(),
                hosts: vec!["music.example".to_string()],
                ..Default::default()
            },
        ];
        config.app.default_site = Some("music".to_string());
        config
    }

    #[test]
    fn resolves_by_slug_host_then_default() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SiteRegistry::from_config(&two_sites(dir.path()));

        assert_eq!(registry.resolve(Some("VT"), None).unwrap().slug, "vt");
        assert_eq!(
            registry.resolve(None, Some("vt.example:8080")).unwrap().slug,
            "vt"
        );
        assert_eq!(
            registry.resolve(None, Some("other.example")).unwrap().slug,
            "music"
        );
        assert_eq!(registry.resolve(None, None).unwrap().name, "music");
        assert!(matches!(
            registry.resolve(Some("nope"), Some("vt.example")),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn single_default_site_without_config() {
        let registry = SiteRegistry::from_config(&Config::default());
        assert_eq!(registry.all().len(), 1);
        assert_eq!(registry.default_site().unwrap().slug, DEFAULT_SITE_SLUG);
    }

    #[tokio::test]
    async fn finds_channel_across_sites() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SiteRegistry::from_config(&two_sites(dir.path()));
        let music = registry.get("music").unwrap();
        music
            .streamers
            .create(CreateStreamer {
                alias: "Pianist".to_string(),
                youtube: Some(YouTubeInput {
                    channel_id: "UCpiano".to_string(),
                    handle: None,
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        let (site, streamer) = registry
            .find_youtube_channel("UCpiano")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(site.slug, "music");
        assert_eq!(streamer.alias, "Pianist");
        assert!(registry
            .find_youtube_channel("UCnobody")
            .await
            .unwrap()
            .is_none());
    }
}
