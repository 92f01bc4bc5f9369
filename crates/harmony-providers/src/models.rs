// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire models shared by the provider adapters.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTrack {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_secs: Option<u32>,
    pub isrc: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderArtist {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub external_ids: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRelease {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub release_type: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub track_count: Option<u32>,
}

/// Artist metadata together with the full release list, as returned by the
/// albums endpoint in one round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtistWithReleases {
    pub artist: ProviderArtist,
    pub releases: Vec<ProviderRelease>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderPlaylist {
    pub id: String,
    pub name: String,
    pub tracks: Vec<ProviderTrack>,
}

/// One file offered by a peer in a search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerFile {
    pub filename: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub bitrate: Option<u32>,
    #[serde(default)]
    pub duration_secs: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerResult {
    pub username: String,
    #[serde(default)]
    pub free_upload_slots: u32,
    #[serde(default)]
    pub queue_length: u32,
    pub files: Vec<PeerFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequestFile {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTicket {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadTicketState {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Degraded,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub status: ProbeStatus,
    #[serde(default)]
    pub detail: Option<String>,
}
