//! Parser for the Atom documents YouTube's hub pushes to `/alerts`.
//!
//! A delivery contains either `entry` elements (new or updated videos) or
//! `at:deleted-entry` tombstones. Namespaces are matched on local names only.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Malformed feed XML: {0}")]
    Malformed(String),

    #[error("Document is not an Atom feed")]
    NotAFeed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedEntry {
    pub video_id: String,
    pub channel_id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeletedEntry {
    pub video_id: String,
    pub channel_id: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feed {
    pub entries: Vec<FeedEntry>,
    pub deleted: Vec<DeletedEntry>,
    /// Entries dropped because they lacked a video or channel id.
    pub skipped: usize,
}

impl Feed {
    /// Distinct channel ids mentioned anywhere in the feed.
    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.channel_id.clone())
            .chain(self.deleted.iter().filter_map(|d| d.channel_id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

#[derive(Default)]
struct EntryBuilder {
    video_id: Option<String>,
    channel_id: Option<String>,
    author_uri: Option<String>,
    title: Option<String>,
    link: Option<String>,
    published: Option<DateTime<Utc>>,
    updated: Option<DateTime<Utc>>,
}

impl EntryBuilder {
    fn build(self) -> Option<FeedEntry> {
        let channel_id = self
            .channel_id
            .or_else(|| self.author_uri.as_deref().and_then(channel_from_uri));
        match (self.video_id, channel_id) {
            (Some(video_id), Some(channel_id)) if !video_id.is_empty() && !channel_id.is_empty() => {
                Some(FeedEntry {
                    video_id,
                    channel_id,
                    title: self.title,
                    link: self.link,
                    published: self.published,
                    updated: self.updated,
                })
            }
            _ => None,
        }
    }
}

#[derive(Default)]
struct DeletedBuilder {
    video_id: Option<String>,
    channel_id: Option<String>,
    deleted_at: Option<DateTime<Utc>>,
}

pub fn parse_feed(xml: &str) -> Result<Feed, FeedError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut feed = Feed::default();
    let mut saw_feed = false;
    let mut path: Vec<String> = Vec::new();
    let mut entry: Option<EntryBuilder> = None;
    let mut deleted: Option<DeletedBuilder> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| FeedError::Malformed(e.to_string()))?;

        match event {
            Event::Start(e) => {
                let name = local_name(&e);
                match name.as_str() {
                    "feed" if path.is_empty() => saw_feed = true,
                    "entry" => entry = Some(EntryBuilder::default()),
                    "deleted-entry" => deleted = Some(read_tombstone(&e)?),
                    "link" => read_link(&e, entry.as_mut())?,
                    _ => {}
                }
                path.push(name);
            }
            Event::Empty(e) => {
                let name = local_name(&e);
                match name.as_str() {
                    "link" => read_link(&e, entry.as_mut())?,
                    "deleted-entry" => finish_tombstone(read_tombstone(&e)?, &mut feed),
                    _ => {}
                }
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| FeedError::Malformed(e.to_string()))?
                    .into_owned();
                let current = path.last().map(String::as_str).unwrap_or_default();
                let parent = path
                    .len()
                    .checked_sub(2)
                    .and_then(|i| path.get(i))
                    .map(String::as_str)
                    .unwrap_or_default();

                if let Some(builder) = entry.as_mut() {
                    match (parent, current) {
                        ("entry", "videoId") => builder.video_id = Some(text),
                        ("entry", "channelId") => builder.channel_id = Some(text),
                        ("entry", "title") => builder.title = Some(text),
                        ("entry", "published") => builder.published = parse_timestamp(&text),
                        ("entry", "updated") => builder.updated = parse_timestamp(&text),
                        ("author", "uri") => builder.author_uri = Some(text),
                        _ => {}
                    }
                } else if let Some(builder) = deleted.as_mut() {
                    if (parent, current) == ("by", "uri") {
                        builder.channel_id = channel_from_uri(&text);
                    }
                }
            }
            Event::End(_) => {
                let Some(name) = path.pop() else {
                    return Err(FeedError::Malformed("unbalanced end tag".to_string()));
                };
                match name.as_str() {
                    "entry" => {
                        if let Some(builder) = entry.take() {
                            match builder.build() {
                                Some(parsed) => feed.entries.push(parsed),
                                None => {
                                    tracing::debug!("Skipping feed entry without video/channel id");
                                    feed.skipped += 1;
                                }
                            }
                        }
                    }
                    "deleted-entry" => {
                        if let Some(builder) = deleted.take() {
                            finish_tombstone(builder, &mut feed);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_feed {
        return Err(FeedError::NotAFeed);
    }

    Ok(feed)
}

fn finish_tombstone(builder: DeletedBuilder, feed: &mut Feed) {
    match builder.video_id {
        Some(video_id) if !video_id.is_empty() => feed.deleted.push(DeletedEntry {
            video_id,
            channel_id: builder.channel_id,
            deleted_at: builder.deleted_at,
        }),
        _ => {
            tracing::debug!("Skipping deleted-entry without a video reference");
            feed.skipped += 1;
        }
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, wanted: &[u8]) -> Result<Option<String>, FeedError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| FeedError::Malformed(e.to_string()))?;
        if attr.key.local_name().as_ref() == wanted {
            let value = attr
                .unescape_value()
                .map_err(|e| FeedError::Malformed(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn read_link(e: &BytesStart<'_>, entry: Option<&mut EntryBuilder>) -> Result<(), FeedError> {
    let Some(builder) = entry else {
        return Ok(());
    };
    let rel = attribute(e, b"rel")?;
    if rel.as_deref().map_or(true, |r| r == "alternate") {
        builder.link = attribute(e, b"href")?;
    }
    Ok(())
}

fn read_tombstone(e: &BytesStart<'_>) -> Result<DeletedBuilder, FeedError> {
    let video_id = attribute(e, b"ref")?.map(|r| {
        r.strip_prefix("yt:video:")
            .map(str::to_string)
            .unwrap_or(r)
    });
    let deleted_at = attribute(e, b"when")?.as_deref().and_then(parse_timestamp);
    Ok(DeletedBuilder {
        video_id,
        channel_id: None,
        deleted_at,
    })
}

/// `https://www.youtube.com/channel/UC...` -> `UC...`
fn channel_from_uri(uri: &str) -> Option<String> {
    uri.split("/channel/")
        .nth(1)
        .map(|rest| rest.trim_end_matches('/').to_string())
        .filter(|id| !id.is_empty())
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
pub(crate) const SAMPLE_FEED: &str = r#"<?xml version='1.0' encoding='UTF-8'?>
<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015" xmlns="http://www.w3.org/2005/Atom">
  <link rel="hub" href="https://pubsubhubbub.appspot.com"/>
  <link rel="self" href="https://www.youtube.com/xml/feeds/videos.xml?channel_id=UCchannel"/>
  <title>YouTube video feed</title>
  <updated>2024-05-01T19:05:24.552394234+00:00</updated>
  <entry>
    <id>yt:video:vid123</id>
    <yt:videoId>vid123</yt:videoId>
    <yt:channelId>UCchannel</yt:channelId>
    <title>Karaoke &amp; chill</title>
    <link rel="alternate" href="https://www.youtube.com/watch?v=vid123"/>
    <author>
      <name>Singer</name>
      <uri>https://www.youtube.com/channel/UCchannel</uri>
    </author>
    <published>2024-05-01T18:00:00+00:00</published>
    <updated>2024-05-01T19:05:24.552394234+00:00</updated>
  </entry>
</feed>"#;
