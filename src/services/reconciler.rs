//! Applies WebSub feed deliveries to the roster's YouTube live status.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::db::{PlatformStatus, Streamer, StreamerKey};
use crate::error::AppResult;
use crate::services::feed::{DeletedEntry, Feed, FeedEntry};
use crate::services::signature::verify_signature;
use crate::services::sites::{Site, SiteRegistry};
use crate::services::youtube::{VideoInfo, VideoLookup, VideoState};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entries that changed a streamer's status.
    pub updated: usize,
    pub unchanged: usize,
    /// Entries for unknown channels, or dropped by the parser.
    pub skipped: usize,
    /// Entries ignored because the delivery signature did not verify.
    pub rejected: usize,
    pub lookup_failures: usize,
}

/// Decide the YouTube status after looking up a video from the feed.
/// `None` means the stored status stays as it is.
pub fn next_youtube_status(
    current: &PlatformStatus,
    entry_title: Option<&str>,
    info: &VideoInfo,
) -> Option<PlatformStatus> {
    let is_current = current.video_id.as_deref() == Some(info.video_id.as_str());

    match info.state {
        VideoState::Live => {
            let next = PlatformStatus {
                live: true,
                video_id: Some(info.video_id.clone()),
                title: info
                    .title
                    .clone()
                    .or_else(|| entry_title.map(str::to_string)),
                started_at: info
                    .started_at
                    .or(if is_current { current.started_at } else { None }),
            };
            (next != *current).then_some(next)
        }
        VideoState::Upcoming => None,
        VideoState::Ended | VideoState::NotLive | VideoState::Unavailable => {
            (current.live && is_current).then(PlatformStatus::offline)
        }
    }
}

struct ChannelState<'a> {
    site: &'a Site,
    streamer: Streamer,
    signature_ok: bool,
}

pub struct Reconciler<'a> {
    sites: &'a SiteRegistry,
    lookup: &'a dyn VideoLookup,
}

impl<'a> Reconciler<'a> {
    pub fn new(sites: &'a SiteRegistry, lookup: &'a dyn VideoLookup) -> Self {
        Reconciler { sites, lookup }
    }

    /// Apply every entry and tombstone of `feed`. `signature` is the raw
    /// `X-Hub-Signature` header and is checked against each channel's secret.
    pub async fn reconcile(
        &self,
        feed: &Feed,
        signature: Option<&str>,
        body: &[u8],
    ) -> ReconcileReport {
        let mut report = ReconcileReport {
            skipped: feed.skipped,
            ..Default::default()
        };
        let mut channels: HashMap<String, Option<ChannelState<'a>>> = HashMap::new();

        for entry in &feed.entries {
            if let Err(e) = self
                .apply_entry(entry, signature, body, &mut channels, &mut report)
                .await
            {
                tracing::warn!("Failed to apply feed entry {}: {}", entry.video_id, e);
                report.skipped += 1;
            }
        }

        for deleted in &feed.deleted {
            if let Err(e) = self
                .apply_tombstone(deleted, signature, body, &mut channels, &mut report)
                .await
            {
                tracing::warn!("Failed to apply deleted entry {}: {}", deleted.video_id, e);
                report.skipped += 1;
            }
        }

        tracing::debug!(?report, "Reconciled WebSub delivery");
        report
    }

    async fn channel<'c>(
        &self,
        channel_id: &str,
        signature: Option<&str>,
        body: &[u8],
        channels: &'c mut HashMap<String, Option<ChannelState<'a>>>,
    ) -> AppResult<Option<&'c mut ChannelState<'a>>> {
        if !channels.contains_key(channel_id) {
            let state = self
                .sites
                .find_youtube_channel(channel_id)
                .await?
                .map(|(site, streamer)| {
                    let signature_ok = check_signature(&streamer, signature, body);
                    ChannelState {
                        site,
                        streamer,
                        signature_ok,
                    }
                });
            channels.insert(channel_id.to_string(), state);
        }
        Ok(channels.get_mut(channel_id).and_then(Option::as_mut))
    }

    async fn apply_entry(
        &self,
        entry: &FeedEntry,
        signature: Option<&str>,
        body: &[u8],
        channels: &mut HashMap<String, Option<ChannelState<'a>>>,
        report: &mut ReconcileReport,
    ) -> AppResult<()> {
        let Some(state) = self
            .channel(&entry.channel_id, signature, body, channels)
            .await?
        else {
            tracing::debug!("Ignoring feed entry for unknown channel {}", entry.channel_id);
            report.skipped += 1;
            return Ok(());
        };

        if !state.signature_ok {
            report.rejected += 1;
            return Ok(());
        }

        let info = match self.lookup.video(&entry.video_id).await {
            Ok(info) => info,
            Err(e) if e.is_upstream() => {
                tracing::warn!("Video lookup failed for {}: {}", entry.video_id, e);
                report.lookup_failures += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if info
            .channel_id
            .as_deref()
            .map_or(false, |owner| owner != entry.channel_id)
        {
            tracing::warn!(
                "Video {} belongs to {:?}, not {}",
                entry.video_id,
                info.channel_id,
                entry.channel_id
            );
            report.skipped += 1;
            return Ok(());
        }

        match next_youtube_status(
            &state.streamer.status.youtube,
            entry.title.as_deref(),
            &info,
        ) {
            Some(next) => {
                tracing::info!(
                    "{} is {} on YouTube ({})",
                    state.streamer.alias,
                    if next.live { "live" } else { "offline" },
                    entry.video_id
                );
                write_status(state, &entry.channel_id, next, Utc::now()).await?;
                report.updated += 1;
            }
            None => report.unchanged += 1,
        }
        Ok(())
    }

    async fn apply_tombstone(
        &self,
        deleted: &DeletedEntry,
        signature: Option<&str>,
        body: &[u8],
        channels: &mut HashMap<String, Option<ChannelState<'a>>>,
        report: &mut ReconcileReport,
    ) -> AppResult<()> {
        let Some(channel_id) = deleted.channel_id.as_deref() else {
            tracing::debug!("Deleted entry {} has no channel", deleted.video_id);
            report.skipped += 1;
            return Ok(());
        };

        let Some(state) = self.channel(channel_id, signature, body, channels).await? else {
            report.skipped += 1;
            return Ok(());
        };

        if !state.signature_ok {
            report.rejected += 1;
            return Ok(());
        }

        let current = &state.streamer.status.youtube;
        if current.live && current.video_id.as_deref() == Some(deleted.video_id.as_str()) {
            tracing::info!(
                "Live video {} of {} was deleted",
                deleted.video_id,
                state.streamer.alias
            );
            write_status(state, channel_id, PlatformStatus::offline(), Utc::now()).await?;
            report.updated += 1;
        } else {
            report.unchanged += 1;
        }
        Ok(())
    }
}

/// Deliveries for channels with a hub secret must carry a valid signature.
fn check_signature(streamer: &Streamer, signature: Option<&str>, body: &[u8]) -> bool {
    let Some(secret) = streamer
        .platforms
        .youtube
        .as_ref()
        .and_then(|yt| yt.hub_secret.as_deref())
    else {
        return true;
    };

    match signature {
        Some(header) if verify_signature(secret, body, header) => true,
        Some(_) => {
            tracing::warn!("Invalid X-Hub-Signature for {}", streamer.alias);
            false
        }
        None => {
            tracing::warn!("Unsigned delivery for {}", streamer.alias);
            false
        }
    }
}

async fn write_status(
    state: &mut ChannelState<'_>,
    channel_id: &str,
    next: PlatformStatus,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let updated = state
        .site
        .streamers
        .modify(
            &StreamerKey::YouTubeChannel(channel_id.to_string()),
            Box::new(move |s| s.status.set_youtube(next, now)),
        )
        .await?;

    if let Some(updated) = updated {
        state.streamer = updated;
    }
    Ok(())
}

/// Re-check a streamer's channel for a live broadcast right now.
pub async fn refresh_youtube(
    site: &Site,
    lookup: &dyn VideoLookup,
    streamer: &Streamer,
) -> AppResult<Streamer> {
    let Some(channel_id) = streamer.youtube_channel_id() else {
        return Ok(streamer.clone());
    };

    let next = match lookup.live_video(channel_id).await? {
        Some(info) => next_youtube_status(&streamer.status.youtube, None, &info),
        None if streamer.status.youtube.live => Some(PlatformStatus::offline()),
        None => None,
    };

    let Some(next) = next else {
        return Ok(streamer.clone());
    };

    let now = Utc::now();
    let updated = site
        .streamers
        .modify(
            &StreamerKey::Id(streamer.id.clone()),
            Box::new(move |s| s.status.set_youtube(next, now)),
        )
        .await?;
    Ok(updated.unwrap_or_else(|| streamer.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{CreateStreamer, YouTubeInput};
    use crate::error::AppError;
    use crate::services::feed::parse_feed;
    use crate::services::signature::sign_sha1;
    use async_trait::async_trait;

    struct FakeLookup {
        videos: HashMap<String, VideoState>,
    }

    #[async_trait]
    impl VideoLookup for FakeLookup {
        async fn video(&self, video_id: &str) -> AppResult<VideoInfo> {
            let state = self
                .videos
                .get(video_id)
                .copied()
                .ok_or_else(|| AppError::YouTube("lookup failed".to_string()))?;
            Ok(VideoInfo {
                video_id: video_id.to_string(),
                channel_id: None,
                title: Some(format!("title of {}", video_id)),
                state,
                started_at: None,
            })
        }

        async fn live_video(&self, _channel_id: &str) -> AppResult<Option<VideoInfo>> {
            let live = self
                .videos
                .iter()
                .find(|(_, state)| **state == VideoState::Live)
                .map(|(id, _)| id.clone());
            match live {
                Some(id) => Ok(Some(self.video(&id).await?)),
                None => Ok(None),
            }
        }
    }

    fn lookup(videos: &[(&str, VideoState)]) -> FakeLookup {
        FakeLookup {
            videos: videos
                .iter()
                .map(|(id, state)| (id.to_string(), *state))
                .collect(),
        }
    }

    fn feed_xml(video_id: &str, channel_id: &str) -> String {
        format!(
            r#"<feed xmlns="http://www.w3.org/2005/Atom" xmlns:yt="http://www.youtube.com/xml/schemas/2015">
  <entry>
    <yt:videoId>{}</yt:videoId>
    <yt:channelId>{}</yt:channelId>
    <title>From the feed</title>
  </entry>
</feed>"#,
            video_id, channel_id
        )
    }

    async fn registry_with_streamer(dir: &std::path::Path) -> (SiteRegistry, String) {
        let mut config = Config::default();
        config.app.data_dir = dir.to_path_buf();
        let registry = SiteRegistry::from_config(&config);
        let streamer = registry
            .default_site()
            .unwrap()
            .streamers
            .create(CreateStreamer {
                alias: "Singer".to_string(),
                youtube: Some(YouTubeInput {
                    channel_id: "UCsinger".to_string(),
                    handle: None,
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        let secret = streamer.platforms.youtube.unwrap().hub_secret.unwrap();
        (registry, secret)
    }

    async fn youtube_status(registry: &SiteRegistry) -> PlatformStatus {
        registry
            .find_youtube_channel("UCsinger")
            .await
            .unwrap()
            .unwrap()
            .1
            .status
            .youtube
    }

    #[test]
    fn live_transition_rules() {
        let info = |id: &str, state| VideoInfo {
            video_id: id.to_string(),
            channel_id: None,
            title: None,
            state,
            started_at: None,
        };
        let offline = PlatformStatus::offline();

        let live = next_youtube_status(&offline, Some("t"), &info("a", VideoState::Live)).unwrap();
        assert!(live.live);
        assert_eq!(live.title.as_deref(), Some("t"));

        // Same live video again: no write.
        assert_eq!(
            next_youtube_status(&live, Some("t"), &info("a", VideoState::Live)),
            None
        );
        assert_eq!(
            next_youtube_status(&live, None, &info("a", VideoState::Upcoming)),
            None
        );
        // Another video ending does not end the current stream.
        assert_eq!(
            next_youtube_status(&live, None, &info("b", VideoState::Ended)),
            None
        );
        for state in [VideoState::Ended, VideoState::NotLive, VideoState::Unavailable] {
            assert_eq!(
                next_youtube_status(&live, None, &info("a", state)),
                Some(PlatformStatus::offline())
            );
        }
    }

    #[tokio::test]
    async fn signed_live_entry_marks_streamer_live() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, secret) = registry_with_streamer(dir.path()).await;
        let body = feed_xml("vid1", "UCsinger");
        let feed = parse_feed(&body).unwrap();
        let signature = format!("sha1={}", sign_sha1(&secret, body.as_bytes()));

        let fake = lookup(&[("vid1", VideoState::Live)]);
        let report = Reconciler::new(&registry, &fake)
            .reconcile(&feed, Some(&signature), body.as_bytes())
            .await;
        assert_eq!(report.updated, 1);

        let status = youtube_status(&registry).await;
        assert!(status.live);
        assert_eq!(status.video_id.as_deref(), Some("vid1"));
        assert_eq!(status.title.as_deref(), Some("title of vid1"));

        // Replaying the same delivery changes nothing.
        let report = Reconciler::new(&registry, &fake)
            .reconcile(&feed, Some(&signature), body.as_bytes())
            .await;
        assert_eq!(report.unchanged, 1);
    }

    #[tokio::test]
    async fn bad_signature_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry_with_streamer(dir.path()).await;
        let body = feed_xml("vid1", "UCsinger");
        let feed = parse_feed(&body).unwrap();
        let forged = format!("sha1={}", sign_sha1("wrong", body.as_bytes()));

        let fake = lookup(&[("vid1", VideoState::Live)]);
        let reconciler = Reconciler::new(&registry, &fake);

        let report = reconciler.reconcile(&feed, Some(&forged), body.as_bytes()).await;
        assert_eq!(report.rejected, 1);
        let report = reconciler.reconcile(&feed, None, body.as_bytes()).await;
        assert_eq!(report.rejected, 1);

        assert!(!youtube_status(&registry).await.live);
    }

    #[tokio::test]
    async fn lookup_failures_and_unknown_channels_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, secret) = registry_with_streamer(dir.path()).await;
        let body = r#"<feed xmlns="http://www.w3.org/2005/Atom" xmlns:yt="http://www.youtube.com/xml/schemas/2015">
  <entry><yt:videoId>broken</yt:videoId><yt:channelId>UCsinger</yt:channelId></entry>
  <entry><yt:videoId>vid2</yt:videoId><yt:channelId>UCstranger</yt:channelId></entry>
</feed>"#;
        let feed = parse_feed(body).unwrap();
        let signature = sign_sha1(&secret, body.as_bytes());

        let fake = lookup(&[("vid2", VideoState::Live)]);
        let report = Reconciler::new(&registry, &fake)
            .reconcile(&feed, Some(&signature), body.as_bytes())
            .await;
        assert_eq!(report.lookup_failures, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.updated, 0);
    }

    #[tokio::test]
    async fn tombstone_for_live_video_goes_offline() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, secret) = registry_with_streamer(dir.path()).await;
        let fake = lookup(&[("vid1", VideoState::Live)]);

        let body = feed_xml("vid1", "UCsinger");
        let sig = sign_sha1(&secret, body.as_bytes());
        Reconciler::new(&registry, &fake)
            .reconcile(&parse_feed(&body).unwrap(), Some(&sig), body.as_bytes())
            .await;
        assert!(youtube_status(&registry).await.live);

        let body = r#"<feed xmlns:at="http://purl.org/atompub/tombstones/1.0" xmlns="http://www.w3.org/2005/Atom">
  <at:deleted-entry ref="yt:video:vid1" when="2024-05-02T10:00:00+00:00">
    <at:by><name>Singer</name><uri>https://www.youtube.com/channel/UCsinger</uri></at:by>
  </at:deleted-entry>
</feed>"#;
        let sig = sign_sha1(&secret, body.as_bytes());
        let report = Reconciler::new(&registry, &fake)
            .reconcile(&parse_feed(body).unwrap(), Some(&sig), body.as_bytes())
            .await;
        assert_eq!(report.updated, 1);

        let (_, streamer) = registry
            .find_youtube_channel("UCsinger")
            .await
            .unwrap()
            .unwrap();
        assert!(!streamer.status.youtube.live);
        assert!(!streamer.status.live);
    }

    #[tokio::test]
    async fn refresh_picks_up_current_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry_with_streamer(dir.path()).await;
        let site = registry.default_site().unwrap();
        let (_, streamer) = registry
            .find_youtube_channel("UCsinger")
            .await
            .unwrap()
            .unwrap();

        let live = lookup(&[("now", VideoState::Live)]);
        let updated = refresh_youtube(site, &live, &streamer).await.unwrap();
        assert!(updated.status.live);

        let idle = lookup(&[]);
        let updated = refresh_youtube(site, &idle, &updated).await.unwrap();
        assert!(!updated.status.youtube.live);
    }
}
