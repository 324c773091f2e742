//! Synthetic display names stitched together from pieces of real ones.

use std::sync::OnceLock;

use rand::seq::SliceRandom;
use rand::Rng;
use regex_lite::Regex;

const FALLBACK_ALIASES: &[&str] = &[
    "Mila", "Noah", "Sven", "Lotte", "Daan", "Fenna", "Jesse", "Nora", "Bram", "Sanne",
];

fn word_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"[A-Za-zÀ-ÖØ-öø-ÿ]{3,}").ok())
        .as_ref()
}

/// Alphabetic words of at least three letters.
pub fn fragments(name: &str) -> Vec<String> {
    match word_pattern() {
        Some(re) => re.find_iter(name).map(|m| m.as_str().to_string()).collect(),
        None => Vec::new(),
    }
}

fn capitalize(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Leading half of a word from one known name joined to the trailing half of
/// a word from another, sometimes with a short number. Falls back to a fixed
/// pool while fewer than two usable names are known.
pub fn generate_alias<R: Rng + ?Sized>(known: &[String], rng: &mut R) -> String {
    let words: Vec<Vec<char>> = known
        .iter()
        .filter_map(|name| fragments(name).into_iter().next())
        .map(|word| word.chars().collect())
        .collect();

    let base = if words.len() < 2 {
        FALLBACK_ALIASES
            .choose(rng)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "Guest".to_string())
    } else {
        let first = rng.gen_range(0..words.len());
        let mut second = rng.gen_range(0..words.len() - 1);
        if second >= first {
            second += 1;
        }
        let head = &words[first];
        let tail = &words[second];
        let head_len = head.len().div_ceil(2).max(2);
        let tail_start = tail.len() / 2;
        let joined: String = head[..head_len]
            .iter()
            .chain(tail[tail_start..].iter())
            .collect();
        capitalize(&joined)
    };

    if rng.gen_bool(0.3) {
        format!("{}{}", base, rng.gen_range(10..100))
    } else {
        base
    }
}
