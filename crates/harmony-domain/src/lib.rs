// SPDX-License-Identifier: GPL-3.0-or-later
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================================================
// Value Objects & IDs
// ============================================================================

/// Numeric queue job identifier, assigned by the queue store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl JobId {
    pub fn from_i64(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReleaseId(pub Uuid);

impl ReleaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ReleaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IngestJobId(pub Uuid);

impl IngestJobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for IngestJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for IngestJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IngestItemId(pub Uuid);

impl IngestItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for IngestItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for IngestItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadFileId(pub Uuid);

impl DownloadFileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for DownloadFileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DownloadFileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable artist identity `"<source>:<source_id>"` used across the queue,
/// audit trail, and cache paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtistKey {
    pub source: String,
    pub source_id: String,
}

impl ArtistKey {
    pub fn new(source: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_id: source_id.into(),
        }
    }

    /// Parse `"<source>:<source_id>"`. The source id may itself contain
    /// colons; only the first colon splits.
    pub fn parse_str(s: &str) -> Option<Self> {
        let (source, source_id) = s.split_once(':')?;
        if source.is_empty() || source_id.is_empty() {
            return None;
        }
        Some(Self::new(source, source_id))
    }
}

impl std::fmt::Display for ArtistKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source, self.source_id)
    }
}

impl TryFrom<String> for ArtistKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_str(&value).ok_or_else(|| format!("invalid artist key: {value}"))
    }
}

impl From<ArtistKey> for String {
    fn from(key: ArtistKey) -> Self {
        key.to_string()
    }
}

// ============================================================================
// Queue enums & entities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Watchlist,
    ArtistSync,
    Matching,
    Sync,
    Retry,
    PlaylistExpand,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::Watchlist,
        JobType::ArtistSync,
        JobType::Matching,
        JobType::Sync,
        JobType::Retry,
        JobType::PlaylistExpand,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Watchlist => "watchlist",
            Self::ArtistSync => "artist_sync",
            Self::Matching => "matching",
            Self::Sync => "sync",
            Self::Retry => "retry",
            Self::PlaylistExpand => "playlist_expand",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "watchlist" => Some(Self::Watchlist),
            "artist_sync" => Some(Self::ArtistSync),
            "matching" => Some(Self::Matching),
            "sync" => Some(Self::Sync),
            "retry" => Some(Self::Retry),
            "playlist_expand" => Some(Self::PlaylistExpand),
            _ => None,
        }
    }

    /// Default lease priority when no override is configured.
    /// `sync` carries download work and outranks everything else.
    pub fn default_priority(&self) -> i64 {
        match self {
            Self::Sync => 100,
            Self::ArtistSync => 100,
            Self::Matching => 90,
            Self::PlaylistExpand => 90,
            Self::Retry => 80,
            Self::Watchlist => 50,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Leased,
    Succeeded,
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "leased" => Some(Self::Leased),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Dead)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of durable work owned by the queue store.
///
/// Mutated only through lease/heartbeat/commit/fail; `attempts` never
/// decreases and leased jobs always carry a `lease_until` past their
/// `last_heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub state: JobState,
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    pub lease_until: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terminal storage for jobs whose retry budget is exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job_id: JobId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

// ============================================================================
// Watchlist
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub artist_key: ArtistKey,
    pub priority: i64,
    pub paused: bool,
    pub pause_reason: Option<String>,
    pub resume_at: Option<DateTime<Utc>>,
    pub last_enqueued_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub retry_budget_remaining: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WatchlistEntry {
    pub fn new(artist_key: ArtistKey, retry_budget: i64) -> Self {
        let now = Utc::now();
        Self {
            artist_key,
            priority: 0,
            paused: false,
            pause_reason: None,
            resume_at: None,
            last_enqueued_at: None,
            last_synced_at: None,
            cooldown_until: None,
            retry_budget_remaining: retry_budget,
            created_at: now,
            updated_at: now,
        }
    }

    /// An entry is due when it is not paused, any operator resume time has
    /// passed, and it is not cooling down.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.paused {
            return false;
        }
        if let Some(resume_at) = self.resume_at {
            if resume_at > now {
                return false;
            }
        }
        if let Some(cooldown_until) = self.cooldown_until {
            if cooldown_until > now {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Artists & Releases
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub key: ArtistKey,
    pub name: String,
    /// External identifiers and aliases keyed by namespace (`isni`,
    /// `discogs`, alias slots, ...). Ordered map so diffs are stable.
    pub external_ids: BTreeMap<String, String>,
    pub etag_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Artist {
    pub fn new(key: ArtistKey, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key,
            name: name.into(),
            external_ids: BTreeMap::new(),
            etag_fingerprint: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseType {
    Album,
    Single,
    Ep,
    Compilation,
    Live,
    Other,
}

impl ReleaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Album => "album",
            Self::Single => "single",
            Self::Ep => "ep",
            Self::Compilation => "compilation",
            Self::Live => "live",
            Self::Other => "other",
        }
    }

    pub fn parse_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "album" => Self::Album,
            "single" => Self::Single,
            "ep" => Self::Ep,
            "compilation" => Self::Compilation,
            "live" => Self::Live,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for ReleaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub id: ReleaseId,
    pub artist_key: ArtistKey,
    /// Provider-side identifier, when the provider supplies one.
    pub source_id: Option<String>,
    pub title: String,
    pub release_type: ReleaseType,
    pub release_date: Option<NaiveDate>,
    pub track_count: Option<u32>,
    pub inactive_at: Option<DateTime<Utc>>,
    pub inactive_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Release {
    pub fn new(artist_key: ArtistKey, title: impl Into<String>, release_type: ReleaseType) -> Self {
        let now = Utc::now();
        Self {
            id: ReleaseId::new(),
            artist_key,
            source_id: None,
            title: title.into(),
            release_type,
            release_date: None,
            track_count: None,
            inactive_at: None,
            inactive_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Soft-deleted releases are never served as active.
    pub fn is_active(&self) -> bool {
        self.inactive_at.is_none()
    }
}

// ============================================================================
// Audit trail
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditEventKind {
    Created,
    Updated,
    Inactivated,
    Reactivated,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Inactivated => "inactivated",
            Self::Reactivated => "reactivated",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "inactivated" => Some(Self::Inactivated),
            "reactivated" => Some(Self::Reactivated),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditEntityType {
    Artist,
    Release,
    Alias,
}

impl AuditEntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Artist => "artist",
            Self::Release => "release",
            Self::Alias => "alias",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "artist" => Some(Self::Artist),
            "release" => Some(Self::Release),
            "alias" => Some(Self::Alias),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditEntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit row. Never mutated after insert; totally ordered per
/// artist by `(at, id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub artist_key: ArtistKey,
    pub job_id: Option<JobId>,
    pub event: AuditEventKind,
    pub entity_type: AuditEntityType,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Ingest
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IngestMode {
    Free,
    Pro,
}

impl IngestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Pro => "PRO",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "FREE" => Some(Self::Free),
            "PRO" => Some(Self::Pro),
            _ => None,
        }
    }
}

impl std::fmt::Display for IngestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared state ladder for ingest jobs and items. Transitions are
/// monotonic; `ordinal` enforces that in the repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestState {
    Registered,
    Normalized,
    Queued,
    Completed,
    Failed,
}

impl IngestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Normalized => "normalized",
            Self::Queued => "queued",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "registered" => Some(Self::Registered),
            "normalized" => Some(Self::Normalized),
            "queued" => Some(Self::Queued),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Registered => 0,
            Self::Normalized => 1,
            Self::Queued => 2,
            Self::Completed => 3,
            Self::Failed => 4,
        }
    }

    /// States only advance along the ladder.
    pub fn can_advance_to(&self, next: IngestState) -> bool {
        next.ordinal() > self.ordinal()
    }
}

impl std::fmt::Display for IngestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IngestSourceType {
    Track,
    Link,
    LinkExpansion,
}

impl IngestSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Track => "TRACK",
            Self::Link => "LINK",
            Self::LinkExpansion => "LINK_EXPANSION",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "TRACK" => Some(Self::Track),
            "LINK" => Some(Self::Link),
            "LINK_EXPANSION" => Some(Self::LinkExpansion),
            _ => None,
        }
    }
}

impl std::fmt::Display for IngestSourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestCounts {
    pub accepted: u32,
    pub skipped: u32,
    pub enqueued: u32,
    pub completed: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestJob {
    pub id: IngestJobId,
    pub source_mode: IngestMode,
    pub state: IngestState,
    pub counts: IngestCounts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestJob {
    pub fn new(source_mode: IngestMode) -> Self {
        let now = Utc::now();
        Self {
            id: IngestJobId::new(),
            source_mode,
            state: IngestState::Registered,
            counts: IngestCounts::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Canonical shape of one candidate track after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedTrack {
    pub artist: String,
    pub title: String,
    pub album: Option<String>,
    pub duration_secs: Option<u32>,
    pub isrc: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestItem {
    pub id: IngestItemId,
    pub ingest_job_id: IngestJobId,
    pub source_type: IngestSourceType,
    pub raw: String,
    pub normalized: Option<NormalizedTrack>,
    pub state: IngestState,
    pub skip_reason: Option<String>,
    pub download_job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestItem {
    pub fn new(ingest_job_id: IngestJobId, source_type: IngestSourceType, raw: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: IngestItemId::new(),
            ingest_job_id,
            source_type,
            raw: raw.into(),
            normalized: None,
            state: IngestState::Registered,
            skip_reason: None,
            download_job_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Downloads
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-file download record tracked by the sync handler and scanned by the
/// retry reaper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadFile {
    pub id: DownloadFileId,
    pub job_id: Option<JobId>,
    pub peer_username: String,
    pub filename: String,
    pub size_bytes: Option<u64>,
    pub priority: Option<i64>,
    pub state: DownloadState,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadFile {
    pub fn new(peer_username: impl Into<String>, filename: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: DownloadFileId::new(),
            job_id: None,
            peer_username: peer_username.into(),
            filename: filename.into(),
            size_bytes: None,
            priority: None,
            state: DownloadState::Queued,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Retry policy
// ============================================================================

/// Retry backoff ceiling per delay, in seconds.
pub const BACKOFF_CEILING_SECONDS: f64 = 300.0;

/// Retry parameters for one job type, resolved by the policy provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_seconds: f64,
    pub jitter_pct: f64,
    pub timeout_seconds: Option<u64>,
}

impl RetryPolicy {
    /// Jitter values at or below 1 are fractions, above 1 percentages.
    pub fn jitter_fraction(&self) -> f64 {
        if self.jitter_pct > 1.0 {
            self.jitter_pct / 100.0
        } else {
            self.jitter_pct.max(0.0)
        }
    }

    /// `base · 2^(attempt−1) · (1 ± U(0, jitter))`, clamped to the ceiling.
    ///
    /// `jitter_unit` is the sampled symmetric factor in `[-1, 1]`; callers
    /// draw it so the formula itself stays deterministic.
    pub fn backoff_seconds(&self, attempt: u32, jitter_unit: f64) -> f64 {
        let exponent = attempt.saturating_sub(1).min(32);
        let raw = self.base_seconds * 2f64.powi(exponent as i32);
        let jittered = raw * (1.0 + jitter_unit.clamp(-1.0, 1.0) * self.jitter_fraction());
        jittered.clamp(0.0, BACKOFF_CEILING_SECONDS)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_seconds: 2.0,
            jitter_pct: 0.2,
            timeout_seconds: None,
        }
    }
}

// ============================================================================
// Error taxonomy
// ============================================================================

/// Stable, client-facing error codes. Ports wrap these in the uniform
/// envelope `{ok:false, error:{code, message, meta?}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    Conflict,
    DependencyError,
    RateLimited,
    LeaseLost,
    BudgetExhausted,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::DependencyError => "DEPENDENCY_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::LeaseLost => "LEASE_LOST",
            Self::BudgetExhausted => "BUDGET_EXHAUSTED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Domain Events (lightweight scaffolding)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent<TPayload> {
    pub name: &'static str,
    pub occurred_at: DateTime<Utc>,
    pub payload: TPayload,
}

impl<TPayload> DomainEvent<TPayload> {
    pub fn new(name: &'static str, payload: TPayload) -> Self {
        Self {
            name,
            occurred_at: Utc::now(),
            payload,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artist_key_roundtrip() {
        let key = ArtistKey::new("spotify", "4Z8W4fKeB5YxbusRsdQVPb");
        assert_eq!(key.to_string(), "spotify:4Z8W4fKeB5YxbusRsdQVPb");
        assert_eq!(ArtistKey::parse_str(&key.to_string()), Some(key));
    }

    #[test]
    fn artist_key_splits_on_first_colon_only() {
        let key = ArtistKey::parse_str("mbz:a74b:1b7f").unwrap();
        assert_eq!(key.source, "mbz");
        assert_eq!(key.source_id, "a74b:1b7f");
    }

    #[test]
    fn artist_key_rejects_empty_parts() {
        assert!(ArtistKey::parse_str("spotify:").is_none());
        assert!(ArtistKey::parse_str(":abc").is_none());
        assert!(ArtistKey::parse_str("no-colon").is_none());
    }

    #[test]
    fn job_type_string_roundtrip() {
        for job_type in JobType::ALL {
            assert_eq!(JobType::parse_str(job_type.as_str()), Some(job_type));
        }
        assert_eq!(JobType::parse_str("tagging"), None);
    }

    #[test]
    fn job_state_terminality() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Dead.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Leased.is_terminal());
    }

    #[test]
    fn ingest_state_only_advances() {
        assert!(IngestState::Registered.can_advance_to(IngestState::Normalized));
        assert!(IngestState::Normalized.can_advance_to(IngestState::Queued));
        assert!(IngestState::Queued.can_advance_to(IngestState::Completed));
        assert!(!IngestState::Completed.can_advance_to(IngestState::Queued));
        assert!(!IngestState::Queued.can_advance_to(IngestState::Queued));
    }

    #[test]
    fn retry_policy_jitter_normalization() {
        let fractional = RetryPolicy {
            jitter_pct: 0.25,
            ..RetryPolicy::default()
        };
        assert_eq!(fractional.jitter_fraction(), 0.25);

        let percentage = RetryPolicy {
            jitter_pct: 25.0,
            ..RetryPolicy::default()
        };
        assert_eq!(percentage.jitter_fraction(), 0.25);

        let negative = RetryPolicy {
            jitter_pct: -1.0,
            ..RetryPolicy::default()
        };
        assert_eq!(negative.jitter_fraction(), 0.0);
    }

    #[test]
    fn backoff_grows_exponentially_within_jitter_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_seconds: 1.0,
            jitter_pct: 0.2,
            timeout_seconds: None,
        };
        // attempt a with unit jitter u lands on base·2^(a−1)·(1 + 0.2u)
        assert_eq!(policy.backoff_seconds(1, 0.0), 1.0);
        assert_eq!(policy.backoff_seconds(2, 0.0), 2.0);
        assert_eq!(policy.backoff_seconds(3, 0.0), 4.0);
        assert_eq!(policy.backoff_seconds(3, 1.0), 4.8);
        assert_eq!(policy.backoff_seconds(3, -1.0), 3.2);
    }

    #[test]
    fn backoff_clamps_at_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 20,
            base_seconds: 10.0,
            jitter_pct: 0.0,
            timeout_seconds: None,
        };
        assert_eq!(policy.backoff_seconds(10, 0.0), BACKOFF_CEILING_SECONDS);
        // huge attempt counts must not overflow
        assert_eq!(policy.backoff_seconds(u32::MAX, 1.0), BACKOFF_CEILING_SECONDS);
    }

    #[test]
    fn watchlist_due_respects_pause_and_cooldown() {
        let now = Utc::now();
        let mut entry = WatchlistEntry::new(ArtistKey::new("spotify", "abc"), 5);
        assert!(entry.is_due(now));

        entry.paused = true;
        assert!(!entry.is_due(now));

        entry.paused = false;
        entry.cooldown_until = Some(now + chrono::Duration::hours(1));
        assert!(!entry.is_due(now));

        entry.cooldown_until = Some(now - chrono::Duration::seconds(1));
        assert!(entry.is_due(now));

        entry.resume_at = Some(now + chrono::Duration::hours(2));
        assert!(!entry.is_due(now));
    }

    #[test]
    fn release_active_flag_follows_inactive_at() {
        let mut release = Release::new(
            ArtistKey::new("spotify", "abc"),
            "OK Computer",
            ReleaseType::Album,
        );
        assert!(release.is_active());
        release.inactive_at = Some(Utc::now());
        release.inactive_reason = Some("pruned".to_string());
        assert!(!release.is_active());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ErrorCode::ValidationError.as_str(), "VALIDATION_ERROR");
        assert_eq!(ErrorCode::LeaseLost.as_str(), "LEASE_LOST");
        assert_eq!(ErrorCode::BudgetExhausted.as_str(), "BUDGET_EXHAUSTED");
        assert_eq!(
            serde_json::to_value(ErrorCode::DependencyError).unwrap(),
            serde_json::json!("DEPENDENCY_ERROR")
        );
    }

    #[test]
    fn domain_event_envelope() {
        let event = DomainEvent::new(
            "orchestrator.dispatch",
            serde_json::json!({ "job_id": 42, "type": "artist_sync", "attempt": 1 }),
        );
        assert_eq!(event.name, "orchestrator.dispatch");
        assert_eq!(event.payload["job_id"], 42);
    }
}
