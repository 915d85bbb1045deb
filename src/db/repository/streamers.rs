use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;

use super::json_file::JsonFile;
use crate::db::models::{
    CreateStreamer, Platforms, PlatformStatus, Streamer, StreamerStatus, TwitchInput,
    TwitchPlatform, UpdateStreamer, YouTubeInput, YouTubePlatform,
};
use crate::error::{AppError, AppResult};
use crate::services::auth::generate_random_string;

const HUB_SECRET_LENGTH: usize = 32;

/// In-place mutation applied under the store lock.
pub type StreamerChange = Box<dyn FnOnce(&mut Streamer) + Send>;

/// Ways to address a single roster entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamerKey {
    Id(String),
    YouTubeChannel(String),
    TwitchBroadcaster(String),
}

impl StreamerKey {
    fn matches(&self, streamer: &Streamer) -> bool {
        match self {
            StreamerKey::Id(id) => streamer.id == *id,
            StreamerKey::YouTubeChannel(channel_id) => {
                streamer.youtube_channel_id() == Some(channel_id.as_str())
            }
            StreamerKey::TwitchBroadcaster(broadcaster_id) => {
                streamer.twitch_broadcaster_id() == Some(broadcaster_id.as_str())
            }
        }
    }
}

/// Result of a patch: the record before and after the change.
#[derive(Debug, Clone)]
pub struct StreamerUpdate {
    pub previous: Streamer,
    pub current: Streamer,
}

#[async_trait]
pub trait StreamerRepository: Send + Sync {
    async fn list(&self) -> AppResult<Vec<Streamer>>;
    async fn find(&self, key: &StreamerKey) -> AppResult<Option<Streamer>>;
    async fn find_by_alias(&self, alias: &str) -> AppResult<Option<Streamer>>;
    /// Fails with `Conflict` when the alias is taken (case-insensitive).
    async fn create(&self, input: CreateStreamer) -> AppResult<Streamer>;
    async fn update(&self, id: &str, patch: UpdateStreamer) -> AppResult<StreamerUpdate>;
    async fn delete(&self, id: &str) -> AppResult<Streamer>;
    /// Apply `change` to the matching record. `Ok(None)` when nothing matches.
    async fn modify(
        &self,
        key: &StreamerKey,
        change: StreamerChange,
    ) -> AppResult<Option<Streamer>>;
}

pub struct JsonStreamerRepository {
    file: JsonFile<Streamer>,
}

impl JsonStreamerRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonStreamerRepository {
            file: JsonFile::new(path),
        }
    }
}

fn alias_taken(streamers: &[Streamer], alias: &str, except_id: Option<&str>) -> bool {
    let wanted = alias.to_lowercase();
    streamers
        .iter()
        .filter(|s| Some(s.id.as_str()) != except_id)
        .any(|s| s.alias.to_lowercase() == wanted)
}

fn new_youtube(input: YouTubeInput) -> YouTubePlatform {
    YouTubePlatform {
        channel_id: input.channel_id.trim().to_string(),
        handle: input.handle,
        hub_secret: Some(generate_random_string(HUB_SECRET_LENGTH)),
        lease_seconds: None,
        lease_date: None,
    }
}

fn new_twitch(input: TwitchInput) -> TwitchPlatform {
    TwitchPlatform {
        login: input.login.trim().to_lowercase(),
        broadcaster_id: input.broadcaster_id,
        online_subscription_id: None,
        offline_subscription_id: None,
    }
}

fn apply_patch(streamer: &mut Streamer, patch: UpdateStreamer) {
    let now = Utc::now();

    if let Some(alias) = patch.alias {
        streamer.alias = alias.trim().to_string();
    }
    if let Some(description) = patch.description {
        streamer.description = description;
    }
    if let Some(languages) = patch.languages {
        streamer.languages = languages;
    }

    if patch.remove_youtube {
        streamer.platforms.youtube = None;
        streamer.status.set_youtube(PlatformStatus::offline(), now);
    } else if let Some(input) = patch.youtube {
        match streamer.platforms.youtube.as_mut() {
            Some(existing) if existing.channel_id == input.channel_id.trim() => {
                existing.handle = input.handle;
            }
            _ => {
                streamer.platforms.youtube = Some(new_youtube(input));
                streamer.status.set_youtube(PlatformStatus::offline(), now);
            }
        }
    }

    if patch.remove_twitch {
        streamer.platforms.twitch = None;
        streamer.status.set_twitch(PlatformStatus::offline(), now);
    } else if let Some(input) = patch.twitch {
        match streamer.platforms.twitch.as_mut() {
            Some(existing) if existing.login == input.login.trim().to_lowercase() => {
                if input.broadcaster_id.is_some() {
                    existing.broadcaster_id = input.broadcaster_id;
                }
            }
            _ => {
                streamer.platforms.twitch = Some(new_twitch(input));
                streamer.status.set_twitch(PlatformStatus::offline(), now);
            }
        }
    }

    if patch.remove_facebook {
        streamer.platforms.facebook = None;
    } else if let Some(facebook) = patch.facebook {
        streamer.platforms.facebook = Some(facebook);
    }

    streamer.updated_at = now;
}

#[async_trait]
impl StreamerRepository for JsonStreamerRepository {
    async fn list(&self) -> AppResult<Vec<Streamer>> {
        self.file.read_all().await
    }

    async fn find(&self, key: &StreamerKey) -> AppResult<Option<Streamer>> {
        let streamers = self.file.read_all().await?;
        Ok(streamers.into_iter().find(|s| key.matches(s)))
    }

    async fn find_by_alias(&self, alias: &str) -> AppResult<Option<Streamer>> {
        let wanted = alias.to_lowercase();
        let streamers = self.file.read_all().await?;
        Ok(streamers
            .into_iter()
            .find(|s| s.alias.to_lowercase() == wanted))
    }

    async fn create(&self, input: CreateStreamer) -> AppResult<Streamer> {
        input.validate()?;

        self.file
            .update(move |streamers| {
                let alias = input.alias.trim().to_string();
                if alias_taken(streamers, &alias, None) {
                    return Err(AppError::Conflict(format!(
                        "A streamer with alias '{}' already exists",
                        alias
                    )));
                }

                let now = Utc::now();
                let streamer = Streamer {
                    id: uuid::Uuid::new_v4().to_string(),
                    alias,
                    description: input.description,
                    languages: input.languages,
                    platforms: Platforms {
                        youtube: input.youtube.map(new_youtube),
                        twitch: input.twitch.map(new_twitch),
                        facebook: input.facebook,
                    },
                    status: StreamerStatus::default(),
                    created_at: now,
                    updated_at: now,
                };

                streamers.push(streamer.clone());
                Ok(streamer)
            })
            .await
    }

    async fn update(&self, id: &str, patch: UpdateStreamer) -> AppResult<StreamerUpdate> {
        patch.validate()?;

        self.file
            .update(move |streamers| {
                if let Some(alias) = &patch.alias {
                    if alias_taken(streamers, alias.trim(), Some(id)) {
                        return Err(AppError::Conflict(format!(
                            "A streamer with alias '{}' already exists",
                            alias.trim()
                        )));
                    }
                }

                let streamer = streamers
                    .iter_mut()
                    .find(|s| s.id == id)
                    .ok_or_else(|| AppError::NotFound(format!("Streamer {} not found", id)))?;

                let previous = streamer.clone();
                apply_patch(streamer, patch);

                Ok(StreamerUpdate {
                    previous,
                    current: streamer.clone(),
                })
            })
            .await
    }

    async fn delete(&self, id: &str) -> AppResult<Streamer> {
        self.file
            .update(|streamers| {
                let index = streamers
                    .iter()
                    .position(|s| s.id == id)
                    .ok_or_else(|| AppError::NotFound(format!("Streamer {} not found", id)))?;
                Ok(streamers.remove(index))
            })
            .await
    }

    async fn modify(
        &self,
        key: &StreamerKey,
        change: StreamerChange,
    ) -> AppResult<Option<Streamer>> {
        self.file
            .update(|streamers| {
                Ok(streamers.iter_mut().find(|s| key.matches(s)).map(|s| {
                    change(s);
                    s.clone()
                }))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::FacebookPlatform;

    fn create_input(alias: &str) -> CreateStreamer {
        CreateStreamer {
            alias: alias.to_string(),
            description: "Sings on Sundays".to_string(),
            languages: vec!["en".to_string(), "ja".to_string()],
            youtube: Some(YouTubeInput {
                channel_id: "UCabcdefghijklmnopqrstuv".to_string(),
                handle: Some("@singer".to_string()),
            }),
            twitch: Some(TwitchInput {
                login: "Singer".to_string(),
                broadcaster_id: Some("4242".to_string()),
            }),
            facebook: Some(FacebookPlatform {
                page_id: "singerpage".to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn create_then_read_back_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streamers.json");

        let created = JsonStreamerRepository::new(&path)
            .create(create_input("Singer"))
            .await
            .unwrap();

        // A fresh repository instance reads what the first one wrote.
        let repo = JsonStreamerRepository::new(&path);
        let found = repo
            .find(&StreamerKey::Id(created.id.clone()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(found.alias, "Singer");
        assert_eq!(found.description, "Sings on Sundays");
        assert_eq!(found.languages, vec!["en".to_string(), "ja".to_string()]);
        assert_eq!(found.platforms, created.platforms);

        let yt = found.platforms.youtube.unwrap();
        assert_eq!(yt.channel_id, "UCabcdefghijklmnopqrstuv");
        assert_eq!(yt.hub_secret.map(|s| s.len()), Some(HUB_SECRET_LENGTH));
        assert_eq!(found.platforms.twitch.unwrap().login, "singer");
    }

    #[tokio::test]
    async fn alias_uniqueness_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonStreamerRepository::new(dir.path().join("streamers.json"));

        repo.create(create_input("Singer")).await.unwrap();
        let err = repo.create(create_input("sINGER")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let other = repo.create(create_input("Dancer")).await.unwrap();
        let err = repo
            .update(
                &other.id,
                UpdateStreamer {
                    alias: Some("SINGER".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        // Renaming to a different casing of its own alias is fine.
        let renamed = repo
            .update(
                &other.id,
                UpdateStreamer {
                    alias: Some("DANCER".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.current.alias, "DANCER");
        assert_eq!(renamed.previous.alias, "Dancer");
    }

    #[tokio::test]
    async fn modify_by_platform_key_updates_status() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonStreamerRepository::new(dir.path().join("streamers.json"));
        repo.create(create_input("Singer")).await.unwrap();

        let updated = repo
            .modify(
                &StreamerKey::YouTubeChannel("UCabcdefghijklmnopqrstuv".to_string()),
                Box::new(|s| {
                    s.status.set_youtube(
                        PlatformStatus {
                            live: true,
                            video_id: Some("vid1".to_string()),
                            ..Default::default()
                        },
                        Utc::now(),
                    )
                }),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(updated.status.live);

        let by_twitch = repo
            .find(&StreamerKey::TwitchBroadcaster("4242".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_twitch.status.youtube.video_id.as_deref(), Some("vid1"));

        let missing = repo
            .modify(
                &StreamerKey::YouTubeChannel("UCnobody".to_string()),
                Box::new(|_| {}),
            )
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn changing_channel_resets_youtube_state() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonStreamerRepository::new(dir.path().join("streamers.json"));
        let created = repo.create(create_input("Singer")).await.unwrap();
        let old_secret = created
            .platforms
            .youtube
            .as_ref()
            .and_then(|yt| yt.hub_secret.clone());

        let same = repo
            .update(
                &created.id,
                UpdateStreamer {
                    youtube: Some(YouTubeInput {
                        channel_id: "UCabcdefghijklmnopqrstuv".to_string(),
                        handle: Some("@renamed".to_string()),
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let yt = same.current.platforms.youtube.unwrap();
        assert_eq!(yt.handle.as_deref(), Some("@renamed"));
        assert_eq!(yt.hub_secret, old_secret);

        let moved = repo
            .update(
                &created.id,
                UpdateStreamer {
                    youtube: Some(YouTubeInput {
                        channel_id: "UCzyxwvutsrqponmlkjihgfe".to_string(),
                        handle: None,
                    }),
                    remove_twitch: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let yt = moved.current.platforms.youtube.unwrap();
        assert_eq!(yt.channel_id, "UCzyxwvutsrqponmlkjihgfe");
        assert_ne!(yt.hub_secret, old_secret);
        assert!(moved.current.platforms.twitch.is_none());
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonStreamerRepository::new(dir.path().join("streamers.json"));
        let created = repo.create(create_input("Singer")).await.unwrap();

        let removed = repo.delete(&created.id).await.unwrap();
        assert_eq!(removed.id, created.id);
        assert!(repo.list().await.unwrap().is_empty());
        assert!(matches!(
            repo.delete(&created.id).await,
            Err(AppError::NotFound(_))
        ));
    }
}
