//! Small text helpers shared by the parsers and the publisher.
//!
//! All length arithmetic here is in characters, not bytes: status length
//! limits on the fediverse side count characters, and slicing a multi-byte
//! body on a byte boundary would panic.

use scraper::Html;

/// Extracts the visible text out of an HTML fragment.
pub fn strip_html(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    fragment.root_element().text().collect::<Vec<_>>().concat()
}

/// Collapses every run of whitespace (including newlines) into one space.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn count_chars(text: &str) -> usize {
    text.chars().count()
}

/// First `n` characters of `text`, whole string if shorter.
pub fn take_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

/// Everything after the first `n` characters of `text`.
pub fn skip_chars(text: &str, n: usize) -> String {
    text.chars().skip(n).collect()
}

/// Cuts `text` down to `max` characters, ellipsizing when it was longer.
pub fn ellipsize(text: &str, max: usize) -> String {
    if count_chars(text) <= max {
        return text.to_string();
    }
    let cut = max.saturating_sub(3);
    let mut out = take_chars(text, cut);
    out.push_str("...");
    out
}

/// Turns an all-uppercase ("shouting") title into capitalized words.
/// Titles with any lowercase letter are returned untouched.
pub fn tame_shouting_title(title: &str) -> String {
    let letters: String = title.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() || letters.chars().any(|c| c.is_lowercase()) {
        return title.to_string();
    }
    title
        .split(' ')
        .map(capitalize_word)
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
        None => String::new(),
    }
}

/// Lowercases and folds the accented characters we meet in the sources
/// this bot follows, and drops separator punctuation. Used to normalize
/// text before keyword matching.
pub fn normalize_for_matching(text: &str) -> String {
    strip_html(text)
        .to_lowercase()
        .chars()
        .filter_map(fold_char)
        .collect()
}

fn fold_char(c: char) -> Option<char> {
    match c {
        'à' | 'á' => Some('a'),
        'è' | 'é' => Some('e'),
        'ì' | 'í' => Some('i'),
        'ò' | 'ó' => Some('o'),
        'ù' | 'ú' => Some('u'),
        'ç' => Some('c'),
        'ñ' => Some('n'),
        '-' | '.' => None,
        other => Some(other),
    }
}
