//! Local heuristic scorer used when the remote scorer is unavailable or disabled.
//!
//! Algorithm:
//! 1. Skill overlap (weight 0.5): share of job skills whose terms all appear in the
//!    bullet, saturating at five matched skills.
//! 2. Structure (weight 0.25): strong leading verb, ideal length, no hedging.
//! 3. Impact (weight 0.25): large quantified outcome, team size, strategy keywords.
//!
//! The weighted sum `h` lands in `[0, 1]` and maps to the same 1–10 raw scale the
//! remote scorer uses, so both share one normalisation step.

use std::collections::HashSet;

use crate::ranking::models::{Candidate, JobAnalysis, ScoredBullet, FLAG_FALLBACK};
use crate::similarity::text::{content_terms, tokenize};

const SKILL_WEIGHT: f64 = 0.5;
const STRUCTURE_WEIGHT: f64 = 0.25;
const IMPACT_WEIGHT: f64 = 0.25;
const SKILL_SATURATION: usize = 5;

const STRATEGY_KEYWORDS: &[&str] = &[
    "strategy",
    "strategic",
    "roadmap",
    "vision",
    "architecture",
    "initiative",
    "cross-functional",
    "org-wide",
    "company-wide",
];

const TEAM_NOUNS: &[&str] = &[
    "engineers",
    "people",
    "reports",
    "developers",
    "designers",
    "analysts",
    "members",
];

pub fn score_all(analysis: &JobAnalysis, candidates: &[Candidate]) -> Vec<ScoredBullet> {
    candidates
        .iter()
        .map(|candidate| score_one(analysis, candidate))
        .collect()
}

fn score_one(analysis: &JobAnalysis, candidate: &Candidate) -> ScoredBullet {
    let bullet = &candidate.bullet;
    let tokens: HashSet<String> = tokenize(&bullet.text).into_iter().collect();

    let matched_skills: Vec<String> = analysis
        .skills
        .iter()
        .filter(|skill| {
            let terms = content_terms(skill);
            !terms.is_empty() && terms.iter().all(|t| tokens.contains(t))
        })
        .cloned()
        .collect();
    let skill_denominator = analysis.skills.len().clamp(1, SKILL_SATURATION);
    let skill = (matched_skills.len() as f64 / skill_denominator as f64).min(1.0);

    let flags = &bullet.flags;
    let structure = 0.4 * f64::from(u8::from(flags.has_strong_verb))
        + 0.3 * f64::from(u8::from(flags.ideal_length))
        + 0.3 * f64::from(u8::from(!flags.has_weak_language));

    let lower = bullet.text.to_lowercase();
    let large_outcome = has_large_outcome(&bullet.text);
    let team = has_team_size(&lower);
    let strategy = STRATEGY_KEYWORDS.iter().any(|k| lower.contains(k));
    let impact = 0.5 * f64::from(u8::from(large_outcome))
        + 0.25 * f64::from(u8::from(team))
        + 0.25 * f64::from(u8::from(strategy));

    let h = SKILL_WEIGHT * skill + STRUCTURE_WEIGHT * structure + IMPACT_WEIGHT * impact;

    let mut reasons = Vec::new();
    if !matched_skills.is_empty() {
        reasons.push(format!("matches {}", matched_skills.join(", ")));
    }
    if large_outcome {
        reasons.push("quantified outcome".to_string());
    }
    if team {
        reasons.push("team scope".to_string());
    }
    if strategy {
        reasons.push("strategic scope".to_string());
    }

    let mut scored = ScoredBullet::from_candidate(candidate, 1.0 + 9.0 * h.clamp(0.0, 1.0));
    scored.reasoning = if reasons.is_empty() {
        "heuristic score".to_string()
    } else {
        reasons.join("; ")
    };
    scored.matched_skills = matched_skills;
    scored.flags.push(FLAG_FALLBACK.to_string());
    scored
}

/// A percentage, a currency amount, a multiplier, or any number of at least 100.
fn has_large_outcome(text: &str) -> bool {
    if text.contains('%') || text.contains('$') || text.contains('€') || text.contains('£') {
        return true;
    }
    let lower = text.to_lowercase();
    lower
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == ','))
        .filter(|w| w.starts_with(|c: char| c.is_ascii_digit()))
        .any(|w| {
            let digits: String = w
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
                .collect();
            let suffix = &w[digits.len()..];
            let value = digits.replace(',', "").parse::<f64>().unwrap_or(0.0);
            value >= 100.0 || matches!(suffix, "k" | "m" | "b" | "x")
        })
}

/// "team of 8", "12 engineers", "managed 5 reports".
fn has_team_size(lower: &str) -> bool {
    let words: Vec<&str> = lower.split_whitespace().collect();
    words.windows(2).any(|pair| {
        let number = pair[0].chars().all(|c| c.is_ascii_digit()) && !pair[0].is_empty();
        let noun = pair[1].trim_matches(|c: char| !c.is_alphanumeric());
        number && TEAM_NOUNS.contains(&noun)
    }) || lower.contains("team of")
}
