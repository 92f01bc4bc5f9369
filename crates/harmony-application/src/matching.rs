// SPDX-License-Identifier: GPL-3.0-or-later

//! Candidate scoring for peer search results.
//!
//! A download candidate is scored against the wanted track on five axes:
//! title and artist token overlap (accent-folded, alias-aware), edition-
//! aware album comparison, duration within ±2 s, and preferred-format
//! ranking. Only the best candidate at or above the confidence threshold
//! is persisted; everything else is discarded with a reason.

use std::collections::HashMap;
use std::sync::LazyLock;

use harmony_domain::NormalizedTrack;
use harmony_providers::{PeerFile, PeerResult};
use regex::Regex;

use crate::text::{normalize_loose, tokens};

const DURATION_TOLERANCE_SECS: u32 = 2;

static EDITION_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\s*[\(\[][^\)\]]*(deluxe|remaster(ed)?|edition|expanded|anniversary|bonus|reissue|special|mono|stereo)[^\)\]]*[\)\]]",
    )
    .expect("edition regex")
});

/// Strip edition qualifiers so `OK Computer (Deluxe Edition)` compares
/// equal to `OK Computer`.
pub fn strip_edition(title: &str) -> String {
    EDITION_SUFFIX.replace_all(title, "").trim().to_string()
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub username: String,
    pub file: PeerFile,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchDecision {
    /// Best candidate at or above the threshold.
    Accepted,
    /// No candidate reached the threshold.
    BelowThreshold { best: String },
    /// The peer search returned nothing usable.
    NoCandidates,
}

#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub decision: MatchDecision,
    pub best: Option<ScoredCandidate>,
    pub considered: usize,
    pub average_confidence: f64,
}

pub struct MatchEngine {
    confidence_threshold: f64,
    preferred_formats: Vec<String>,
    /// normalized alias → normalized canonical artist name
    aliases: HashMap<String, String>,
}

impl MatchEngine {
    pub fn new(confidence_threshold: f64, preferred_formats: Vec<String>) -> Self {
        Self {
            confidence_threshold,
            preferred_formats: preferred_formats
                .into_iter()
                .map(|f| f.to_ascii_lowercase())
                .collect(),
            aliases: HashMap::new(),
        }
    }

    /// Install an artist alias map (`normalized alias → canonical`).
    pub fn with_aliases(mut self, aliases: HashMap<String, String>) -> Self {
        self.aliases = aliases
            .into_iter()
            .map(|(alias, canonical)| (normalize_loose(&alias), normalize_loose(&canonical)))
            .collect();
        self
    }

    /// Score every file offered by every peer and pick the winner.
    pub fn evaluate(&self, track: &NormalizedTrack, results: &[PeerResult]) -> MatchOutcome {
        let mut scored: Vec<ScoredCandidate> = Vec::new();
        for result in results {
            for file in &result.files {
                let confidence = self.score(track, file);
                scored.push(ScoredCandidate {
                    username: result.username.clone(),
                    file: file.clone(),
                    confidence,
                });
            }
        }

        if scored.is_empty() {
            return MatchOutcome {
                decision: MatchDecision::NoCandidates,
                best: None,
                considered: 0,
                average_confidence: 0.0,
            };
        }

        let considered = scored.len();
        let average_confidence =
            scored.iter().map(|c| c.confidence).sum::<f64>() / considered as f64;
        scored.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let best = scored.into_iter().next().expect("non-empty candidates");

        if best.confidence >= self.confidence_threshold {
            MatchOutcome {
                decision: MatchDecision::Accepted,
                best: Some(best),
                considered,
                average_confidence,
            }
        } else {
            MatchOutcome {
                decision: MatchDecision::BelowThreshold {
                    best: best.file.filename.clone(),
                },
                best: Some(best),
                considered,
                average_confidence,
            }
        }
    }

    /// Composite confidence in `[0, 1]`.
    pub fn score(&self, track: &NormalizedTrack, file: &PeerFile) -> f64 {
        let haystack = normalize_loose(&file.filename);

        let title_score = overlap(&tokens(&track.title), &haystack);
        let artist_score = self.artist_score(&track.artist, &haystack);
        let album_score = match track.album.as_deref() {
            Some(album) => overlap(&tokens(&strip_edition(album)), &haystack),
            None => 0.5,
        };
        let duration_score = match (track.duration_secs, file.duration_secs) {
            (Some(wanted), Some(offered)) => {
                if wanted.abs_diff(offered) <= DURATION_TOLERANCE_SECS {
                    1.0
                } else {
                    0.0
                }
            }
            _ => 0.5,
        };
        let format_score = self.format_score(&file.filename);

        0.45 * title_score
            + 0.25 * artist_score
            + 0.15 * album_score
            + 0.10 * duration_score
            + 0.05 * format_score
    }

    fn artist_score(&self, artist: &str, haystack: &str) -> f64 {
        let direct = overlap(&tokens(artist), haystack);
        if direct >= 1.0 {
            return direct;
        }
        // an alias hit counts as a full artist match
        let normalized = normalize_loose(artist);
        if let Some(canonical) = self.aliases.get(&normalized) {
            if haystack.contains(canonical.as_str()) {
                return 1.0;
            }
        }
        for (alias, canonical) in &self.aliases {
            if canonical == &normalized && haystack.contains(alias.as_str()) {
                return 1.0;
            }
        }
        direct
    }

    fn format_score(&self, filename: &str) -> f64 {
        let Some(extension) = filename.rsplit('.').next() else {
            return 0.0;
        };
        let extension = extension.to_ascii_lowercase();
        match self
            .preferred_formats
            .iter()
            .position(|format| *format == extension)
        {
            Some(index) => 1.0 - index as f64 / self.preferred_formats.len().max(1) as f64,
            None => 0.0,
        }
    }
}

/// Fraction of needle tokens present in the haystack.
fn overlap(needle_tokens: &[String], haystack: &str) -> f64 {
    if needle_tokens.is_empty() {
        return 0.0;
    }
    let hits = needle_tokens
        .iter()
        .filter(|token| haystack.contains(token.as_str()))
        .count();
    hits as f64 / needle_tokens.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> NormalizedTrack {
        NormalizedTrack {
            artist: "Radiohead".to_string(),
            title: "Paranoid Android".to_string(),
            album: Some("OK Computer".to_string()),
            duration_secs: Some(387),
            isrc: None,
        }
    }

    fn file(filename: &str, duration: Option<u32>) -> PeerFile {
        PeerFile {
            filename: filename.to_string(),
            size_bytes: Some(30_000_000),
            bitrate: Some(1411),
            duration_secs: duration,
        }
    }

    fn engine() -> MatchEngine {
        MatchEngine::new(0.65, vec!["flac".to_string(), "mp3".to_string()])
    }

    #[test]
    fn exact_match_scores_high() {
        let score = engine().score(
            &track(),
            &file("Music/Radiohead/OK Computer/07 Paranoid Android.flac", Some(387)),
        );
        assert!(score > 0.9, "got {score}");
    }

    #[test]
    fn unrelated_file_scores_low() {
        let score = engine().score(
            &track(),
            &file("Music/Céline Dion/Falling Into You/03 All By Myself.mp3", Some(312)),
        );
        assert!(score < 0.3, "got {score}");
    }

    #[test]
    fn duration_outside_tolerance_drops_score() {
        let engine = engine();
        let on_time = engine.score(
            &track(),
            &file("Radiohead - Paranoid Android.flac", Some(388)),
        );
        let off_time = engine.score(
            &track(),
            &file("Radiohead - Paranoid Android.flac", Some(300)),
        );
        assert!(on_time > off_time);
        assert!((on_time - off_time - 0.10).abs() < 1e-9);
    }

    #[test]
    fn edition_suffixes_are_ignored_for_album_comparison() {
        assert_eq!(strip_edition("OK Computer (Deluxe Edition)"), "OK Computer");
        assert_eq!(strip_edition("OK Computer [2009 Remaster]"), "OK Computer");
        assert_eq!(strip_edition("OK Computer"), "OK Computer");

        let plain = engine().score(
            &track(),
            &file("Radiohead/OK Computer (Deluxe Edition)/Paranoid Android.flac", Some(387)),
        );
        assert!(plain > 0.9, "got {plain}");
    }

    #[test]
    fn accented_names_match_their_folded_forms() {
        let wanted = NormalizedTrack {
            artist: "Sigur Rós".to_string(),
            title: "Svefn-g-englar".to_string(),
            album: None,
            duration_secs: None,
            isrc: None,
        };
        let score = engine().score(&wanted, &file("Sigur Ros - Svefn g englar.flac", None));
        assert!(score > 0.8, "got {score}");
    }

    #[test]
    fn alias_map_bridges_artist_renames() {
        let mut aliases = HashMap::new();
        aliases.insert("Cat Stevens".to_string(), "Yusuf Islam".to_string());
        let engine = engine().with_aliases(aliases);

        let wanted = NormalizedTrack {
            artist: "Cat Stevens".to_string(),
            title: "Father and Son".to_string(),
            album: None,
            duration_secs: None,
            isrc: None,
        };
        let with_alias = engine.score(&wanted, &file("Yusuf Islam - Father and Son.flac", None));
        assert!(with_alias > 0.8, "got {with_alias}");
    }

    #[test]
    fn preferred_format_ranks_flac_over_mp3() {
        let engine = engine();
        let flac = engine.score(&track(), &file("Radiohead - Paranoid Android.flac", Some(387)));
        let mp3 = engine.score(&track(), &file("Radiohead - Paranoid Android.mp3", Some(387)));
        let wav = engine.score(&track(), &file("Radiohead - Paranoid Android.wav", Some(387)));
        assert!(flac > mp3);
        assert!(mp3 > wav);
    }

    #[test]
    fn evaluate_picks_best_above_threshold() {
        let engine = engine();
        let results = vec![PeerResult {
            username: "crow".to_string(),
            free_upload_slots: 1,
            queue_length: 0,
            files: vec![
                file("Radiohead/OK Computer/07 Paranoid Android.flac", Some(387)),
                file("Radiohead/OK Computer/01 Airbag.flac", Some(284)),
            ],
        }];

        let outcome = engine.evaluate(&track(), &results);
        assert_eq!(outcome.decision, MatchDecision::Accepted);
        assert_eq!(outcome.considered, 2);
        let best = outcome.best.unwrap();
        assert!(best.file.filename.contains("Paranoid Android"));
    }

    #[test]
    fn evaluate_discards_below_threshold() {
        let engine = engine();
        let results = vec![PeerResult {
            username: "crow".to_string(),
            free_upload_slots: 1,
            queue_length: 0,
            files: vec![file("Somebody Else - Another Song.ogg", Some(100))],
        }];

        let outcome = engine.evaluate(&track(), &results);
        assert!(matches!(outcome.decision, MatchDecision::BelowThreshold { .. }));
    }

    #[test]
    fn evaluate_handles_empty_results() {
        let outcome = engine().evaluate(&track(), &[]);
        assert_eq!(outcome.decision, MatchDecision::NoCandidates);
        assert!(outcome.best.is_none());
    }
}
