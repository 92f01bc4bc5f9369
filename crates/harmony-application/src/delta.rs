// SPDX-License-Identifier: GPL-3.0-or-later

//! Artist delta reconciliation.
//!
//! [`diff`] computes the minimal set of create/update/soft-delete
//! operations that makes the persisted artist equal to the freshly fetched
//! one, together with one audit draft per operation. The function is pure
//! and deterministic: the clock is a parameter and operations are emitted
//! in release-identity order, so equal inputs produce byte-equal output
//! regardless of input ordering.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use harmony_domain::{
    Artist, AuditEntityType, AuditEventKind, Release, ReleaseType,
};
use serde_json::json;

use crate::text::normalize;

#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaPolicy {
    /// Soft-delete current releases missing from the incoming set.
    pub prune: bool,
    /// Additionally emit hard-delete operations. Off by default.
    pub hard_delete: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOp {
    Create(Release),
    Update { before: Release, after: Release },
    SoftDelete { before: Release, after: Release },
    HardDelete(Release),
    Reactivate { before: Release, after: Release },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtistOp {
    pub before: Artist,
    pub after: Artist,
}

/// Audit row draft; the writer assigns id, job id, and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditDraft {
    pub event: AuditEventKind,
    pub entity_type: AuditEntityType,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtistDelta {
    pub artist_op: Option<ArtistOp>,
    pub release_ops: Vec<ReleaseOp>,
    pub audits: Vec<AuditDraft>,
}

impl ArtistDelta {
    pub fn is_empty(&self) -> bool {
        self.artist_op.is_none() && self.release_ops.is_empty()
    }
}

/// Release identity: provider id when present, else the normalized
/// `(title, type, date)` tuple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum ReleaseIdentity {
    Source(String),
    Normalized(String, ReleaseType, Option<NaiveDate>),
}

fn identity(release: &Release) -> ReleaseIdentity {
    match release.source_id.as_deref() {
        Some(source_id) if !source_id.is_empty() => ReleaseIdentity::Source(source_id.to_string()),
        _ => ReleaseIdentity::Normalized(
            normalize(&release.title),
            release.release_type,
            release.release_date,
        ),
    }
}

fn releases_differ(current: &Release, incoming: &Release) -> bool {
    normalize(&current.title) != normalize(&incoming.title)
        || current.release_type != incoming.release_type
        || current.release_date != incoming.release_date
        || current.track_count != incoming.track_count
}

fn release_json(release: &Release) -> serde_json::Value {
    json!({
        "id": release.id,
        "source_id": release.source_id,
        "title": release.title,
        "release_type": release.release_type,
        "release_date": release.release_date,
        "track_count": release.track_count,
        "inactive_at": release.inactive_at,
        "inactive_reason": release.inactive_reason,
    })
}

fn artist_json(artist: &Artist) -> serde_json::Value {
    json!({
        "key": artist.key,
        "name": artist.name,
        "external_ids": artist.external_ids,
    })
}

/// Compute the reconciliation delta. `now` stamps soft-deletes and updated
/// rows; callers pass one instant for the whole reconciliation.
pub fn diff(
    current_artist: &Artist,
    current_releases: &[Release],
    incoming_artist: &Artist,
    incoming_releases: &[Release],
    policy: DeltaPolicy,
    now: DateTime<Utc>,
) -> ArtistDelta {
    let mut delta = ArtistDelta::default();

    // ---- artist ------------------------------------------------------------
    if current_artist.name != incoming_artist.name {
        let mut after = current_artist.clone();
        after.name = incoming_artist.name.clone();
        after.external_ids = incoming_artist.external_ids.clone();
        after.etag_fingerprint = incoming_artist.etag_fingerprint.clone();
        after.updated_at = now;
        delta.audits.push(AuditDraft {
            event: AuditEventKind::Updated,
            entity_type: AuditEntityType::Artist,
            before: Some(artist_json(current_artist)),
            after: Some(artist_json(&after)),
        });
        delta.artist_op = Some(ArtistOp {
            before: current_artist.clone(),
            after,
        });
    } else if current_artist.external_ids != incoming_artist.external_ids {
        let mut after = current_artist.clone();
        after.external_ids = incoming_artist.external_ids.clone();
        after.etag_fingerprint = incoming_artist.etag_fingerprint.clone();
        after.updated_at = now;
        delta.audits.push(AuditDraft {
            event: AuditEventKind::Updated,
            entity_type: AuditEntityType::Artist,
            before: Some(artist_json(current_artist)),
            after: Some(artist_json(&after)),
        });
        delta.artist_op = Some(ArtistOp {
            before: current_artist.clone(),
            after,
        });
    }

    // alias audits per added/removed/changed key
    for (key, incoming_value) in &incoming_artist.external_ids {
        match current_artist.external_ids.get(key) {
            None => delta.audits.push(AuditDraft {
                event: AuditEventKind::Created,
                entity_type: AuditEntityType::Alias,
                before: None,
                after: Some(json!({ key: incoming_value })),
            }),
            Some(current_value) if current_value != incoming_value => {
                delta.audits.push(AuditDraft {
                    event: AuditEventKind::Updated,
                    entity_type: AuditEntityType::Alias,
                    before: Some(json!({ key: current_value })),
                    after: Some(json!({ key: incoming_value })),
                })
            }
            Some(_) => {}
        }
    }
    for (key, current_value) in &current_artist.external_ids {
        if !incoming_artist.external_ids.contains_key(key) {
            delta.audits.push(AuditDraft {
                event: AuditEventKind::Inactivated,
                entity_type: AuditEntityType::Alias,
                before: Some(json!({ key: current_value })),
                after: None,
            });
        }
    }

    // ---- releases ----------------------------------------------------------
    let current_by_identity: BTreeMap<ReleaseIdentity, &Release> = current_releases
        .iter()
        .map(|release| (identity(release), release))
        .collect();
    let incoming_by_identity: BTreeMap<ReleaseIdentity, &Release> = incoming_releases
        .iter()
        .map(|release| (identity(release), release))
        .collect();

    for (release_identity, incoming) in &incoming_by_identity {
        match current_by_identity.get(release_identity) {
            None => {
                let mut created = (*incoming).clone();
                created.artist_key = current_artist.key.clone();
                created.inactive_at = None;
                created.inactive_reason = None;
                delta.audits.push(AuditDraft {
                    event: AuditEventKind::Created,
                    entity_type: AuditEntityType::Release,
                    before: None,
                    after: Some(release_json(&created)),
                });
                delta.release_ops.push(ReleaseOp::Create(created));
            }
            Some(current) if !current.is_active() => {
                // present again upstream: reactivate, carrying any field
                // changes along
                let mut after = (*current).clone();
                after.title = incoming.title.clone();
                after.release_type = incoming.release_type;
                after.release_date = incoming.release_date;
                after.track_count = incoming.track_count;
                after.inactive_at = None;
                after.inactive_reason = None;
                after.updated_at = now;
                delta.audits.push(AuditDraft {
                    event: AuditEventKind::Reactivated,
                    entity_type: AuditEntityType::Release,
                    before: Some(release_json(current)),
                    after: Some(release_json(&after)),
                });
                delta.release_ops.push(ReleaseOp::Reactivate {
                    before: (*current).clone(),
                    after,
                });
            }
            Some(current) if releases_differ(current, incoming) => {
                let mut after = (*current).clone();
                after.title = incoming.title.clone();
                after.release_type = incoming.release_type;
                after.release_date = incoming.release_date;
                after.track_count = incoming.track_count;
                after.updated_at = now;
                delta.audits.push(AuditDraft {
                    event: AuditEventKind::Updated,
                    entity_type: AuditEntityType::Release,
                    before: Some(release_json(current)),
                    after: Some(release_json(&after)),
                });
                delta.release_ops.push(ReleaseOp::Update {
                    before: (*current).clone(),
                    after,
                });
            }
            Some(_) => {}
        }
    }

    for (release_identity, current) in &current_by_identity {
        if incoming_by_identity.contains_key(release_identity) {
            continue;
        }
        if policy.hard_delete {
            delta.audits.push(AuditDraft {
                event: AuditEventKind::Inactivated,
                entity_type: AuditEntityType::Release,
                before: Some(release_json(current)),
                after: None,
            });
            delta.release_ops.push(ReleaseOp::HardDelete((*current).clone()));
        } else if policy.prune && current.is_active() {
            let mut after = (*current).clone();
            after.inactive_at = Some(now);
            after.inactive_reason = Some("pruned".to_string());
            after.updated_at = now;
            delta.audits.push(AuditDraft {
                event: AuditEventKind::Inactivated,
                entity_type: AuditEntityType::Release,
                before: Some(release_json(current)),
                after: Some(release_json(&after)),
            });
            delta.release_ops.push(ReleaseOp::SoftDelete {
                before: (*current).clone(),
                after,
            });
        }
    }

    delta
}
