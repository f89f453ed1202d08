use crate::models::library::QualityFlags;

/// Ideal bullet length band, in characters (inclusive).
pub const IDEAL_MIN_CHARS: usize = 60;
pub const IDEAL_MAX_CHARS: usize = 200;

/// Leading verbs that signal ownership of an outcome.
pub const STRONG_VERBS: &[&str] = &[
    "architected",
    "automated",
    "built",
    "championed",
    "created",
    "cut",
    "delivered",
    "designed",
    "developed",
    "drove",
    "eliminated",
    "established",
    "grew",
    "implemented",
    "increased",
    "launched",
    "led",
    "managed",
    "migrated",
    "optimized",
    "reduced",
    "redesigned",
    "scaled",
    "shipped",
    "spearheaded",
    "streamlined",
];

/// Hedging phrases that dilute ownership.
pub const WEAK_PHRASES: &[&str] = &[
    "helped",
    "worked on",
    "assisted",
    "supported",
    "participated",
    "involved in",
    "responsible for",
    "tried to",
    "various",
    "some",
];

/// Computes the structural quality flags stored alongside a bullet.
pub fn assess(text: &str) -> QualityFlags {
    let trimmed = text.trim();
    let length = trimmed.chars().count();

    QualityFlags {
        has_strong_verb: has_strong_verb(trimmed),
        has_metric: has_metric(trimmed),
        ideal_length: (IDEAL_MIN_CHARS..=IDEAL_MAX_CHARS).contains(&length),
        has_weak_language: has_weak_language(trimmed),
    }
}

fn has_strong_verb(text: &str) -> bool {
    let first = text
        .split_whitespace()
        .next()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .unwrap_or_default();
    STRONG_VERBS.contains(&first.as_str())
}

/// Quantified outcome present: a digit, `%`, a currency symbol, or an `Nx` multiplier.
pub fn has_metric(text: &str) -> bool {
    let has_digit = text.chars().any(|c| c.is_ascii_digit());
    let has_percent = text.contains('%');
    let has_currency = text.contains('$') || text.contains('€') || text.contains('£');
    has_digit || has_percent || has_currency
}

fn has_weak_language(text: &str) -> bool {
    let padded = format!(" {} ", text.to_lowercase());
    WEAK_PHRASES
        .iter()
        .any(|phrase| padded.contains(&format!(" {phrase} ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_with_percentage() {
        assert!(has_metric("Reduced latency by 40% through caching"));
    }

    #[test]
    fn test_metric_with_euro() {
        assert!(has_metric("Generated €200k in new revenue"));
    }

    #[test]
    fn test_metric_with_multiplier() {
        assert!(has_metric("Made the build 3x faster"));
    }

    #[test]
    fn test_no_metric_in_vague_bullet() {
        assert!(!has_metric("Improved system performance significantly"));
    }

    #[test]
    fn test_strong_leading_verb() {
        let flags = assess("Led a team of five engineers to migrate billing onto Postgres");
        assert!(flags.has_strong_verb);
        assert!(!assess("Was part of the billing migration").has_strong_verb);
    }

    #[test]
    fn test_weak_language_detected_on_word_boundaries() {
        assert!(assess("Helped the team ship a new onboarding flow").has_weak_language);
        // "supported" inside another word must not match
        assert!(!assess("Shipped unsupportedly fast releases").has_weak_language);
    }

    #[test]
    fn test_ideal_length_band() {
        assert!(!assess("Built a thing").ideal_length);
        let ideal = "Designed and shipped a streaming ingestion pipeline processing 2M events per day";
        assert!(assess(ideal).ideal_length);
        assert!(!assess(&"a".repeat(IDEAL_MAX_CHARS + 1)).ideal_length);
    }
}
