// SPDX-License-Identifier: GPL-3.0-or-later

//! Ingest service: turn user-supplied track lines, uploads, and playlist
//! links into normalized ingest items and matching jobs.

use std::collections::HashSet;
use std::sync::Arc;

use harmony_config::IngestConfig;
use harmony_domain::{
    ErrorCode, IngestItem, IngestItemId, IngestJob, IngestMode, IngestSourceType, IngestState,
    JobType, NormalizedTrack,
};
use harmony_queue::{EnqueueOptions, JobQueue};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::repositories::IngestRepository;
use crate::text::normalize;

static PLAYLIST_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:playlist[:/])([A-Za-z0-9][A-Za-z0-9_-]*)").expect("playlist link regex")
});

/// Extract the playlist id from a share URL or URI.
pub fn parse_playlist_link(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let captures = PLAYLIST_LINK.captures(raw)?;
    let id = captures.get(1)?.as_str();
    // strip query noise from share links
    let id = id.split(['?', '#']).next().unwrap_or(id);
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Parse one free-text line: `Artist - Title` or `Artist - Title - Album`.
pub fn parse_track_line(line: &str) -> Option<NormalizedTrack> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let parts: Vec<&str> = line.split(" - ").map(|p| p.trim()).collect();
    match parts.as_slice() {
        [artist, title] if !artist.is_empty() && !title.is_empty() => Some(NormalizedTrack {
            artist: (*artist).to_string(),
            title: (*title).to_string(),
            album: None,
            duration_secs: None,
            isrc: None,
        }),
        [artist, title, album] if !artist.is_empty() && !title.is_empty() => {
            Some(NormalizedTrack {
                artist: (*artist).to_string(),
                title: (*title).to_string(),
                album: Some((*album).to_string()),
                duration_secs: None,
                isrc: None,
            })
        }
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),

    #[error("queue error: {0}")]
    Queue(#[from] harmony_queue::QueueError),
}

impl IngestError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::Internal(_) => ErrorCode::InternalError,
            Self::Queue(error) => error.error_code(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestUpload {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestSubmission {
    pub mode: IngestMode,
    #[serde(default)]
    pub lines: Vec<String>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub upload: Option<IngestUpload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptedItem {
    pub item_id: IngestItemId,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedItem {
    pub raw: String,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct IngestOutcome {
    pub job: IngestJob,
    pub accepted: Vec<AcceptedItem>,
    pub skipped: Vec<SkippedItem>,
}

/// Rows parsed from a JSON upload.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonTrackRow {
    Line(String),
    Track {
        artist: String,
        title: String,
        #[serde(default)]
        album: Option<String>,
        #[serde(default)]
        duration_secs: Option<u32>,
        #[serde(default)]
        isrc: Option<String>,
    },
}

pub struct IngestService {
    ingest: Arc<dyn IngestRepository>,
    queue: Arc<dyn JobQueue>,
    config: IngestConfig,
}

impl IngestService {
    pub fn new(
        ingest: Arc<dyn IngestRepository>,
        queue: Arc<dyn JobQueue>,
        config: IngestConfig,
    ) -> Self {
        Self {
            ingest,
            queue,
            config,
        }
    }

    pub async fn submit(&self, submission: IngestSubmission) -> Result<IngestOutcome, IngestError> {
        let mode = submission.mode;
        let mut skipped: Vec<SkippedItem> = Vec::new();

        // ---- gather candidate lines ------------------------------------
        let mut lines: Vec<String> = submission
            .lines
            .iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        if let Some(upload) = &submission.upload {
            if mode == IngestMode::Free
                && upload.bytes.len() as u64 > self.config.free_import_max_file_bytes
            {
                return Err(IngestError::Validation(format!(
                    "upload exceeds {} bytes",
                    self.config.free_import_max_file_bytes
                )));
            }
            lines.extend(parse_upload(upload, &mut skipped)?);
        }

        if mode == IngestMode::Free && lines.len() > self.config.free_import_max_lines as usize {
            for line in lines.split_off(self.config.free_import_max_lines as usize) {
                skipped.push(SkippedItem {
                    raw: line,
                    reason: format!(
                        "line cap exceeded ({} max)",
                        self.config.free_import_max_lines
                    ),
                });
            }
        }

        // ---- links ------------------------------------------------------
        let mut links: Vec<String> = submission
            .links
            .iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if mode == IngestMode::Free
            && links.len() > self.config.free_import_max_playlist_links as usize
        {
            for link in links.split_off(self.config.free_import_max_playlist_links as usize) {
                skipped.push(SkippedItem {
                    raw: link,
                    reason: format!(
                        "playlist link cap exceeded ({} max)",
                        self.config.free_import_max_playlist_links
                    ),
                });
            }
        }

        if lines.is_empty() && links.is_empty() {
            return Err(IngestError::Validation(
                "nothing to ingest: no lines, upload rows, or links".to_string(),
            ));
        }

        // ---- normalize and dedup ----------------------------------------
        let job = IngestJob::new(mode);
        let hard_cap = self.config.hard_cap() as usize;
        let mut seen: HashSet<(String, String, Option<String>)> = HashSet::new();
        let mut items: Vec<IngestItem> = Vec::new();

        for line in &lines {
            if items.len() >= hard_cap {
                skipped.push(SkippedItem {
                    raw: line.clone(),
                    reason: format!("hard cap exceeded ({hard_cap} max)"),
                });
                continue;
            }
            let Some(track) = parse_track_line(line) else {
                skipped.push(SkippedItem {
                    raw: line.clone(),
                    reason: "unparsable line (expected `Artist - Title[ - Album]`)".to_string(),
                });
                continue;
            };
            let dedup_key = (
                normalize(&track.artist),
                normalize(&track.title),
                track.album.as_deref().map(normalize),
            );
            if !seen.insert(dedup_key) {
                skipped.push(SkippedItem {
                    raw: line.clone(),
                    reason: "duplicate of an earlier line".to_string(),
                });
                continue;
            }

            let mut item = IngestItem::new(job.id, IngestSourceType::Track, line.clone());
            item.normalized = Some(track);
            item.state = IngestState::Normalized;
            items.push(item);
        }

        let mut link_items: Vec<IngestItem> = Vec::new();
        for link in &links {
            if parse_playlist_link(link).is_none() {
                skipped.push(SkippedItem {
                    raw: link.clone(),
                    reason: "unrecognized playlist link".to_string(),
                });
                continue;
            }
            if mode == IngestMode::Free {
                skipped.push(SkippedItem {
                    raw: link.clone(),
                    reason: "playlist expansion requires PRO mode".to_string(),
                });
                continue;
            }
            let mut item = IngestItem::new(job.id, IngestSourceType::Link, link.clone());
            item.state = IngestState::Normalized;
            link_items.push(item);
        }

        // ---- persist -----------------------------------------------------
        let mut job = job;
        job.state = IngestState::Normalized;
        job.counts.accepted = (items.len() + link_items.len()) as u32;
        job.counts.skipped = skipped.len() as u32;
        self.ingest.create_job(&job).await.map_err(IngestError::Internal)?;
        self.ingest.insert_items(&items).await.map_err(IngestError::Internal)?;
        self.ingest
            .insert_items(&link_items)
            .await
            .map_err(IngestError::Internal)?;

        // ---- enqueue with backpressure ----------------------------------
        let mut enqueued = 0u32;
        let batch_size = self.config.batch_size.max(1) as usize;
        'batches: for chunk in items.chunks(batch_size) {
            let pending = self.queue.pending_count(Some(JobType::Matching)).await?;
            if pending >= self.config.max_pending_jobs as i64 {
                debug!(
                    target: "ingest",
                    pending,
                    max_pending = self.config.max_pending_jobs,
                    "backpressure: leaving remaining items normalized"
                );
                break 'batches;
            }
            for item in chunk {
                self.queue
                    .enqueue(
                        JobType::Matching,
                        serde_json::json!({ "ingest_item_id": item.id }),
                        EnqueueOptions {
                            idempotency_key: Some(format!("matching:{}", item.id)),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.ingest
                    .advance_item(item.id, IngestState::Queued, None, None)
                    .await
                    .map_err(IngestError::Internal)?;
                enqueued += 1;
            }
        }

        for item in &link_items {
            self.queue
                .enqueue(
                    JobType::PlaylistExpand,
                    serde_json::json!({ "ingest_item_id": item.id }),
                    EnqueueOptions {
                        idempotency_key: Some(format!("playlist_expand:{}", item.id)),
                        ..Default::default()
                    },
                )
                .await?;
            self.ingest
                .advance_item(item.id, IngestState::Queued, None, None)
                .await
                .map_err(IngestError::Internal)?;
            enqueued += 1;
        }

        job.counts.enqueued = enqueued;
        if enqueued > 0 {
            job.state = IngestState::Queued;
        }
        self.ingest.update_job(&job).await.map_err(IngestError::Internal)?;

        let accepted = items
            .iter()
            .map(|item| AcceptedItem {
                item_id: item.id,
                summary: item.raw.clone(),
            })
            .chain(link_items.iter().map(|item| AcceptedItem {
                item_id: item.id,
                summary: item.raw.clone(),
            }))
            .collect::<Vec<_>>();

        info!(
            target: "ingest",
            event = "service.call",
            ingest_job_id = %job.id,
            mode = %mode,
            accepted = accepted.len(),
            skipped = skipped.len(),
            enqueued,
            status = "ok",
        );

        Ok(IngestOutcome {
            job,
            accepted,
            skipped,
        })
    }
}

fn parse_upload(
    upload: &IngestUpload,
    skipped: &mut Vec<SkippedItem>,
) -> Result<Vec<String>, IngestError> {
    let text = std::str::from_utf8(&upload.bytes)
        .map_err(|_| IngestError::Validation("upload is not valid UTF-8".to_string()))?;

    let content_type = upload
        .content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match content_type.as_str() {
        "application/json" => {
            let rows: Vec<JsonTrackRow> = serde_json::from_str(text)
                .map_err(|e| IngestError::Validation(format!("invalid JSON upload: {e}")))?;
            Ok(rows
                .into_iter()
                .map(|row| match row {
                    JsonTrackRow::Line(line) => line,
                    JsonTrackRow::Track {
                        artist,
                        title,
                        album,
                        ..
                    } => match album {
                        Some(album) => format!("{artist} - {title} - {album}"),
                        None => format!("{artist} - {title}"),
                    },
                })
                .collect())
        }
        "text/csv" => {
            let mut lines = Vec::new();
            for record in text.lines() {
                let record = record.trim();
                if record.is_empty() || record.eq_ignore_ascii_case("artist,title,album") {
                    continue;
                }
                let fields: Vec<&str> = record.split(',').map(|f| f.trim()).collect();
                match fields.as_slice() {
                    [artist, title] | [artist, title, ""] => {
                        lines.push(format!("{artist} - {title}"))
                    }
                    [artist, title, album] => lines.push(format!("{artist} - {title} - {album}")),
                    _ => skipped.push(SkippedItem {
                        raw: record.to_string(),
                        reason: "unparsable CSV record".to_string(),
                    }),
                }
            }
            Ok(lines)
        }
        "text/plain" | "" => Ok(text.lines().map(|l| l.to_string()).collect()),
        other => Err(IngestError::Validation(format!(
            "unsupported upload content type: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playlist_link_parsing() {
        assert_eq!(
            parse_playlist_link("https://play.example.com/playlist/37i9dQZF1DXcBWIGoYBM5M"),
            Some("37i9dQZF1DXcBWIGoYBM5M".to_string())
        );
        assert_eq!(
            parse_playlist_link("catalog:playlist:abc123"),
            Some("abc123".to_string())
        );
        assert_eq!(
            parse_playlist_link("https://play.example.com/playlist/abc123?si=xyz"),
            Some("abc123".to_string())
        );
        assert_eq!(parse_playlist_link("https://example.com/album/xyz"), None);
        assert_eq!(parse_playlist_link(""), None);
    }

    #[test]
    fn track_line_parsing() {
        let two = parse_track_line("Radiohead - Paranoid Android").unwrap();
        assert_eq!(two.artist, "Radiohead");
        assert_eq!(two.title, "Paranoid Android");
        assert_eq!(two.album, None);

        let three = parse_track_line("Radiohead - Paranoid Android - OK Computer").unwrap();
        assert_eq!(three.album.as_deref(), Some("OK Computer"));

        assert!(parse_track_line("just a title").is_none());
        assert!(parse_track_line("# comment").is_none());
        assert!(parse_track_line("").is_none());
        assert!(parse_track_line(" - Title").is_none());
    }

    #[test]
    fn csv_upload_parsing() {
        let upload = IngestUpload {
            content_type: "text/csv".to_string(),
            bytes: b"artist,title,album\nRadiohead,Airbag,OK Computer\nBjork,Joga\n".to_vec(),
        };
        let mut skipped = Vec::new();
        let lines = parse_upload(&upload, &mut skipped).unwrap();
        assert_eq!(
            lines,
            vec![
                "Radiohead - Airbag - OK Computer".to_string(),
                "Bjork - Joga".to_string()
            ]
        );
        assert!(skipped.is_empty());
    }

    #[test]
    fn json_upload_parsing() {
        let upload = IngestUpload {
            content_type: "application/json".to_string(),
            bytes: br#"[
                "Radiohead - Airbag",
                {"artist": "Bjork", "title": "Joga", "album": "Homogenic"}
            ]"#
            .to_vec(),
        };
        let mut skipped = Vec::new();
        let lines = parse_upload(&upload, &mut skipped).unwrap();
        assert_eq!(lines[0], "Radiohead - Airbag");
        assert_eq!(lines[1], "Bjork - Joga - Homogenic");
    }

    #[test]
    fn unsupported_upload_type_is_rejected() {
        let upload = IngestUpload {
            content_type: "application/pdf".to_string(),
            bytes: b"%PDF".to_vec(),
        };
        let mut skipped = Vec::new();
        assert!(matches!(
            parse_upload(&upload, &mut skipped),
            Err(IngestError::Validation(_))
        ));
    }
}
