// SPDX-License-Identifier: GPL-3.0-or-later

//! Text normalization shared by the delta engine, the matching rules, and
//! ingest deduplication.

use unicode_normalization::UnicodeNormalization;

/// Accent-folded, lowercased, whitespace-collapsed form used for identity
/// comparisons.
pub fn normalize(input: &str) -> String {
    let folded: String = input
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect();

    let mut out = String::with_capacity(folded.len());
    let mut last_space = true;
    for ch in folded.chars() {
        let ch = ch.to_lowercase().next().unwrap_or(ch);
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Like [`normalize`] but additionally drops punctuation, for fuzzy token
/// comparisons in matching.
pub fn normalize_loose(input: &str) -> String {
    normalize(input)
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_combining_mark(c: char) -> bool {
    matches!(c, '\u{0300}'..='\u{036f}' | '\u{1ab0}'..='\u{1aff}' | '\u{20d0}'..='\u{20ff}')
}

/// Tokens of the loose normal form.
pub fn tokens(input: &str) -> Vec<String> {
    normalize_loose(input)
        .split_whitespace()
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_accents_and_case() {
        assert_eq!(normalize("Björk"), "bjork");
        assert_eq!(normalize("  Sigur   Rós "), "sigur ros");
        assert_eq!(normalize("MÃNESKIN"), "maneskin");
    }

    #[test]
    fn loose_form_drops_punctuation() {
        assert_eq!(normalize_loose("OK Computer (Remastered)"), "ok computer remastered");
        assert_eq!(normalize_loose("AC/DC"), "ac dc");
    }

    #[test]
    fn tokenization() {
        assert_eq!(tokens("Paranoid Android"), vec!["paranoid", "android"]);
        assert!(tokens("   ").is_empty());
    }
}
