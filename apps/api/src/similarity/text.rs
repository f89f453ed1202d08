//! Text normalisation: fingerprints, tokens and word-overlap similarity.

use std::collections::HashSet;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Function words ignored by lexical scoring and overlap.
pub const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in", "into",
    "is", "it", "its", "of", "on", "or", "our", "so", "that", "the", "their", "this", "to", "was",
    "we", "were", "will", "with", "you", "your",
];

/// Case-folds and strips diacritics.
fn fold(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Normalised form used for exact and near-exact duplicate detection.
///
/// Case-folded, diacritics stripped, every run of digits masked as `#`,
/// punctuation removed and whitespace collapsed. "Cut costs by 30%" and
/// "cut costs by 45 %" share a fingerprint.
pub fn fingerprint(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_digits = false;
    for c in fold(text).chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push('#');
            }
            in_digits = true;
            continue;
        }
        // thousands/decimal separators inside a number stay part of the mask
        if in_digits && (c == '.' || c == ',') {
            continue;
        }
        in_digits = false;
        if c.is_alphanumeric() {
            out.push(c);
        } else {
            out.push(' ');
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lower-cased alphanumeric terms with diacritics folded. Keeps stopwords.
pub fn tokenize(text: &str) -> Vec<String> {
    fold(text)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Tokens with stopwords and single characters removed.
pub fn content_terms(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| t.chars().count() > 1 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Jaccard similarity of the content-term sets of two texts, in `[0.0, 1.0]`.
pub fn word_overlap(a: &str, b: &str) -> f64 {
    let left: HashSet<String> = content_terms(a).into_iter().collect();
    let right: HashSet<String> = content_terms(b).into_iter().collect();
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let shared = left.intersection(&right).count();
    let union = left.union(&right).count();
    shared as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_masks_numbers_and_case() {
        assert_eq!(
            fingerprint("Cut AWS costs by 30% in Q3"),
            fingerprint("cut aws costs by 45 % in q4")
        );
        assert_eq!(fingerprint("Cut AWS costs by 30%"), "cut aws costs by #");
    }

    #[test]
    fn test_fingerprint_strips_diacritics() {
        assert_eq!(fingerprint("Led the Café rollout"), "led the cafe rollout");
    }

    #[test]
    fn test_fingerprint_masks_formatted_numbers_as_one_run() {
        assert_eq!(fingerprint("Saved $1,250,000.50"), "saved #");
    }

    #[test]
    fn test_fingerprint_distinguishes_different_wording() {
        assert_ne!(
            fingerprint("Reduced latency by 40%"),
            fingerprint("Reduced cost by 40%")
        );
    }

    #[test]
    fn test_tokenize_folds_case_and_punctuation() {
        let tokens = tokenize("Shipped Naïve-Bayes models, in Rust!");
        assert_eq!(tokens, vec!["shipped", "naive", "bayes", "models", "in", "rust"]);
    }

    #[test]
    fn test_word_overlap_identical_is_one() {
        let text = "Migrated billing pipeline to Kafka";
        assert!((word_overlap(text, text) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_word_overlap_ignores_stopwords() {
        let a = "Built the search service for the team";
        let b = "Built search service";
        // content terms: {built, search, service, team} vs {built, search, service}
        assert!((word_overlap(a, b) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_word_overlap_disjoint_is_zero() {
        assert_eq!(word_overlap("Designed APIs", "Mentored interns"), 0.0);
        assert_eq!(word_overlap("", "Mentored interns"), 0.0);
    }
}
