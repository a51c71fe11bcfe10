use std::collections::BTreeSet;

use similar::{Algorithm, TextDiff};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const PUNCTUATION_FOLDS: &[(&str, &str)] = &[
    ("≫", ">>"),
    ("«", "<<"),
    ("»", ">>"),
    ("♪", " note "),
    ("☆", "*"),
    ("★", "*"),
    ("\u{3000}", " "),
    ("–", "-"),
    ("—", "-"),
    ("―", "-"),
    ("‐", "-"),
    ("…", "..."),
];

/// Normalisation used for catalog titles and names: trims, lowercases, folds
/// the decorative punctuation the game renders and collapses runs of spaces.
pub fn normalize_text(value: &str) -> String {
    let mut out = value.trim().to_lowercase();
    for (from, to) in PUNCTUATION_FOLDS {
        if out.contains(from) {
            out = out.replace(from, to);
        }
    }
    while out.contains("  ") {
        out = out.replace("  ", " ");
    }
    out
}

/// Look-alike glyphs OCR confuses, applied after compatibility decomposition.
/// Full-width and roman-numeral forms are already plain ASCII by then
/// (`５` is `5`, `Ⅱ` is `II`), so they fold through the ASCII rows.
fn fold_ocr_char(ch: char) -> char {
    match ch {
        'l' | 'I' | '|' | '!' => '1',
        'o' | 'O' => '0',
        'S' | '5' => 's',
        'B' | '8' => 'b',
        other => other,
    }
}

/// Aggressive normalisation for raw OCR output. Accents are stripped through
/// NFKD, look-alike glyphs are folded onto one representative so both sides
/// of a comparison agree, and anything that is not an ASCII letter or digit
/// becomes a single space.
pub fn normalize_ocr(value: &str) -> String {
    let folded: String = value
        .nfkd()
        .filter(|ch| !is_combining_mark(*ch))
        .map(fold_ocr_char)
        .flat_map(char::to_lowercase)
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Indel similarity in `[0, 1]`: `2 * matches / (len(a) + len(b))`.
pub fn ratio(left: &str, right: &str) -> f64 {
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .diff_chars(left, right);
    f64::from(diff.ratio()).clamp(0.0, 1.0)
}

/// Best `ratio` of the shorter string against every equally long window of
/// the longer one, edge windows included.
pub fn partial_ratio(left: &str, right: &str) -> f64 {
    let (short, long) = if left.chars().count() <= right.chars().count() {
        (left, right)
    } else {
        (right, left)
    };
    if short.is_empty() {
        return if long.is_empty() { 1.0 } else { 0.0 };
    }
    if short == long || long.contains(short) {
        return 1.0;
    }

    let short_chars: Vec<char> = short.chars().collect();
    let long_chars: Vec<char> = long.chars().collect();
    let window = short_chars.len();
    let alphabet: BTreeSet<char> = short_chars.iter().copied().collect();

    let mut best = 0.0f64;
    for len in 1..window {
        if alphabet.contains(&long_chars[len - 1]) {
            best = best.max(window_ratio(short, &long_chars[..len]));
        }
    }
    for start in 0..=long_chars.len() - window {
        let first = long_chars[start];
        let last = long_chars[start + window - 1];
        if alphabet.contains(&first) || alphabet.contains(&last) {
            best = best.max(window_ratio(short, &long_chars[start..start + window]));
        }
        if best >= 1.0 {
            return 1.0;
        }
    }
    for start in long_chars.len() - window + 1..long_chars.len() {
        if alphabet.contains(&long_chars[start]) {
            best = best.max(window_ratio(short, &long_chars[start..]));
        }
    }
    best
}

fn window_ratio(short: &str, window: &[char]) -> f64 {
    let candidate: String = window.iter().collect();
    ratio(short, &candidate)
}

/// Token-set similarity: shared tokens count once, and a query that is a
/// token subset of the target scores 1.
pub fn token_set_ratio(left: &str, right: &str) -> f64 {
    let tokens_left: BTreeSet<&str> = left.split_whitespace().collect();
    let tokens_right: BTreeSet<&str> = right.split_whitespace().collect();
    if tokens_left.is_empty() || tokens_right.is_empty() {
        return 0.0;
    }

    let shared: Vec<&str> = tokens_left.intersection(&tokens_right).copied().collect();
    let only_left: Vec<&str> = tokens_left.difference(&tokens_right).copied().collect();
    let only_right: Vec<&str> = tokens_right.difference(&tokens_left).copied().collect();

    if !shared.is_empty() && (only_left.is_empty() || only_right.is_empty()) {
        return 1.0;
    }

    let shared_joined = shared.join(" ");
    let left_joined = only_left.join(" ");
    let right_joined = only_right.join(" ");

    let mut best = ratio(&left_joined, &right_joined);
    if shared.is_empty() {
        return best;
    }
    let with_left = format!("{shared_joined} {left_joined}");
    let with_right = format!("{shared_joined} {right_joined}");
    best = best.max(ratio(&shared_joined, &with_left));
    best = best.max(ratio(&shared_joined, &with_right));
    best
}

/// Fuzzy containment on OCR-normalised text. Returns whether `needle` is
/// found in `haystack` and the best ratio observed. A direct substring hit
/// scores 1, otherwise each haystack token is compared to the whole needle.
pub fn fuzzy_contains(haystack: &str, needle: &str, threshold: f64) -> (bool, f64) {
    let hay = normalize_ocr(haystack);
    let target = normalize_ocr(needle);
    if target.is_empty() {
        return (false, 0.0);
    }
    if hay.contains(&target) {
        return (true, 1.0);
    }
    let mut best = 0.0f64;
    for token in hay.split_whitespace() {
        let score = ratio(token, &target);
        if score > best {
            best = score;
        }
        if score >= threshold {
            return (true, score);
        }
    }
    (false, best)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_folds_punctuation_and_spaces() {
        assert_eq!(normalize_text("  Paying  It   Forward "), "paying it forward");
        assert_eq!(normalize_text("Lovely ♪Day"), "lovely note day");
        assert_eq!(normalize_text("Wait—what…"), "wait-what...");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn normalize_ocr_folds_lookalikes() {
        assert_eq!(normalize_ocr("Team Carrot"), normalize_ocr("TEAM CARR0T"));
        assert_eq!(normalize_ocr("  a--b  "), "a b");
    }

    #[test]
    fn normalize_ocr_strips_accents_and_compat_forms() {
        assert_eq!(normalize_ocr("Café Ñoño"), "cafe n0n0");
        assert_eq!(normalize_ocr("Ｆｕｌｌ ８"), "fu11 b");
        assert_eq!(normalize_ocr("Ⅱ Ｂｅｓｔ"), "11 best");
        assert_eq!(normalize_ocr("Åsa Øst"), "asa st");
    }

    #[test]
    fn ratio_matches_indel_similarity() {
        assert_eq!(ratio("abc", "abc"), 1.0);
        assert_eq!(ratio("abc", ""), 0.0);
        assert_eq!(ratio("", ""), 1.0);
        let score = ratio("abcd", "abce");
        assert!((score - 0.75).abs() < 1e-6, "{score}");
    }

    #[test]
    fn partial_ratio_finds_embedded_text() {
        assert_eq!(partial_ratio("forward", "paying it forward"), 1.0);
        let noisy = partial_ratio("forwrd", "paying it forward today");
        assert!(noisy > 0.8, "{noisy}");
        assert_eq!(partial_ratio("", "x"), 0.0);
    }

    #[test]
    fn token_set_ratio_rewards_subsets() {
        assert_eq!(token_set_ratio("it forward", "paying it forward"), 1.0);
        assert_eq!(token_set_ratio("", "paying"), 0.0);
        let unrelated = token_set_ratio("summer camp", "paying it forward");
        assert!(unrelated < 0.5, "{unrelated}");
    }

    #[test]
    fn fuzzy_contains_accepts_ocr_noise() {
        assert_eq!(fuzzy_contains("Join Team Carrot", "Carrot", 0.55), (true, 1.0));
        let (hit, score) = fuzzy_contains("Team Carr0tt", "Carrot", 0.55);
        assert!(hit, "{score}");
        let (miss, _) = fuzzy_contains("Team Blue", "Carrot", 0.8);
        assert!(!miss);
        assert_eq!(fuzzy_contains("anything", "  ", 0.5), (false, 0.0));
    }
}
