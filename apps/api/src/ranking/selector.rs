//! Bullet Selector — deterministic, rule-based final selection.
//!
//! Algorithm, per role in the given order:
//! 1. Group the role's candidates by project and sort each project by the final
//!    ordering (score bucket desc, quantified first, bullet id asc).
//! 2. Phase 1 (diversity): walk projects by their best score and take each
//!    project's best acceptable bullet until the role quota is met.
//! 3. Phase 2 (fill): pool every remaining bullet of the role, sort, and take
//!    acceptable bullets until the quota is met.
//!
//! A candidate is unacceptable when, against anything already selected in any
//! role, it shares a fingerprint, has word overlap above 0.75, or (both having a
//! current embedding) has cosine similarity at or above 0.95. Output stops at the
//! global cap and is returned in the final ordering.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use tracing::debug;
use uuid::Uuid;

use crate::models::library::Role;
use crate::ranking::models::ScoredBullet;
use crate::similarity::text::word_overlap;
use crate::similarity::vector::is_redundant;

const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
pub struct SelectorConfig {
    pub max_total: usize,
    pub overlap_threshold: f64,
    pub vector_threshold: f32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_total: 50,
            overlap_threshold: 0.75,
            vector_threshold: 0.95,
        }
    }
}

/// Scores are compared in buckets of `SCORE_EPSILON` so float noise ties
/// while the ordering stays a total order.
fn score_bucket(score: f64) -> i64 {
    (score / SCORE_EPSILON).round() as i64
}

/// Final ordering: normalised score bucket descending, then bullets with a
/// quantified result, then bullet id ascending.
pub fn compare(a: &ScoredBullet, b: &ScoredBullet) -> Ordering {
    score_bucket(b.normalized_score)
        .cmp(&score_bucket(a.normalized_score))
        .then_with(|| b.has_metric.cmp(&a.has_metric))
        .then_with(|| a.bullet_id.cmp(&b.bullet_id))
}

struct Selection<'a> {
    config: SelectorConfig,
    chosen: Vec<&'a ScoredBullet>,
    chosen_ids: HashSet<Uuid>,
    fingerprints: HashSet<&'a str>,
}

impl<'a> Selection<'a> {
    fn is_full(&self) -> bool {
        self.chosen.len() >= self.config.max_total
    }

    fn rejection(&self, candidate: &ScoredBullet) -> Option<&'static str> {
        if self.fingerprints.contains(candidate.fingerprint.as_str()) {
            return Some("duplicate fingerprint");
        }
        if self
            .chosen
            .iter()
            .any(|s| word_overlap(&candidate.text, &s.text) > self.config.overlap_threshold)
        {
            return Some("near-duplicate wording");
        }
        if let Some(vector) = candidate.embedding.as_deref() {
            let selected: Vec<&[f32]> = self
                .chosen
                .iter()
                .filter_map(|s| s.embedding.as_deref())
                .collect();
            if is_redundant(vector, &selected, self.config.vector_threshold) {
                return Some("redundant embedding");
            }
        }
        None
    }

    /// Takes `candidate` if acceptable. Returns whether it was taken.
    fn offer(&mut self, candidate: &'a ScoredBullet) -> bool {
        if self.chosen_ids.contains(&candidate.bullet_id) {
            return false;
        }
        if let Some(reason) = self.rejection(candidate) {
            debug!(bullet_id = %candidate.bullet_id, reason, "bullet rejected");
            return false;
        }
        self.chosen_ids.insert(candidate.bullet_id);
        self.fingerprints.insert(candidate.fingerprint.as_str());
        self.chosen.push(candidate);
        true
    }
}

pub fn select(
    scored: &[ScoredBullet],
    roles: &[Role],
    config: SelectorConfig,
) -> Vec<ScoredBullet> {
    let mut selection = Selection {
        config,
        chosen: Vec::new(),
        chosen_ids: HashSet::new(),
        fingerprints: HashSet::new(),
    };

    for role in roles {
        if selection.is_full() {
            break;
        }

        let mut projects: BTreeMap<Uuid, Vec<&ScoredBullet>> = BTreeMap::new();
        for s in scored.iter().filter(|s| s.role_id == role.id) {
            projects.entry(s.project_id).or_default().push(s);
        }
        if projects.is_empty() {
            continue;
        }
        for bullets in projects.values_mut() {
            bullets.sort_by(|a, b| compare(a, b));
        }

        let mut project_order: Vec<&Vec<&ScoredBullet>> = projects.values().collect();
        project_order.sort_by(|a, b| compare(a[0], b[0]));

        let mut taken = 0;

        // phase 1: one per project
        for bullets in &project_order {
            if taken >= role.bullets_limit || selection.is_full() {
                break;
            }
            for &candidate in bullets.iter() {
                if selection.offer(candidate) {
                    taken += 1;
                    break;
                }
            }
        }

        // phase 2: fill from the pooled remainder
        let mut pool: Vec<&ScoredBullet> = project_order
            .iter()
            .flat_map(|bullets| bullets.iter().copied())
            .collect();
        pool.sort_by(|a, b| compare(a, b));
        for candidate in pool {
            if taken >= role.bullets_limit || selection.is_full() {
                break;
            }
            if selection.offer(candidate) {
                taken += 1;
            }
        }
    }

    let mut out: Vec<ScoredBullet> = selection.chosen.into_iter().cloned().collect();
    out.sort_by(compare);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn role(limit: usize) -> Role {
        Role {
            id: Uuid::new_v4(),
            title: "Engineer".into(),
            company: None,
            bullets_limit: limit,
            created_at: Utc::now(),
        }
    }

    fn scored(role: &Role, project: Uuid, text: &str, score: f64) -> ScoredBullet {
        ScoredBullet {
            bullet_id: Uuid::new_v4(),
            role_id: role.id,
            project_id: project,
            text: text.to_string(),
            fingerprint: crate::similarity::text::fingerprint(text),
            has_metric: text.chars().any(|c| c.is_ascii_digit()),
            raw_score: score * 10.0,
            normalized_score: score,
            reasoning: String::new(),
            matched_skills: Vec::new(),
            flags: Vec::new(),
            embedding: None,
        }
    }

    fn texts(selected: &[ScoredBullet]) -> Vec<&str> {
        selected.iter().map(|s| s.text.as_str()).collect()
    }

    /// Two projects with three bullets each, distinct wording throughout.
    fn two_projects(role: &Role) -> Vec<ScoredBullet> {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        vec![
            scored(role, a, "Architected billing ledger", 0.9),
            scored(role, a, "Migrated invoices to Postgres", 0.8),
            scored(role, a, "Automated refunds workflow", 0.7),
            scored(role, b, "Launched mobile onboarding", 0.6),
            scored(role, b, "Redesigned push notifications", 0.5),
            scored(role, b, "Instrumented crash reporting", 0.4),
        ]
    }

    #[test]
    fn test_phase_one_takes_best_from_each_project() {
        let r = role(2);
        let selected = select(&two_projects(&r), &[r.clone()], SelectorConfig::default());
        assert_eq!(
            texts(&selected),
            vec!["Architected billing ledger", "Launched mobile onboarding"]
        );
    }

    #[test]
    fn test_phase_two_fills_by_score_across_projects() {
        let r = role(4);
        let selected = select(&two_projects(&r), &[r.clone()], SelectorConfig::default());
        assert_eq!(
            texts(&selected),
            vec![
                "Architected billing ledger",
                "Migrated invoices to Postgres",
                "Automated refunds workflow",
                "Launched mobile onboarding",
            ]
        );
    }

    #[test]
    fn test_quota_and_global_cap() {
        let r = role(10);
        let bullets = two_projects(&r);
        assert_eq!(select(&bullets, &[r.clone()], SelectorConfig::default()).len(), 6);

        let capped = SelectorConfig {
            max_total: 3,
            ..SelectorConfig::default()
        };
        assert_eq!(select(&bullets, &[r], capped).len(), 3);
    }

    #[test]
    fn test_fingerprint_duplicates_never_both_selected() {
        let r = role(4);
        let p = Uuid::new_v4();
        let q = Uuid::new_v4();
        let bullets = vec![
            scored(&r, p, "Cut AWS costs by 30%", 0.9),
            scored(&r, q, "cut aws costs by 45 %", 0.8),
            scored(&r, q, "Hired four engineers", 0.3),
        ];
        let selected = select(&bullets, &[r], SelectorConfig::default());
        assert_eq!(
            texts(&selected),
            vec!["Cut AWS costs by 30%", "Hired four engineers"]
        );
    }

    #[test]
    fn test_near_duplicates_suppressed_across_roles() {
        let first = role(2);
        let second = role(2);
        let bullets = vec![
            scored(&first, Uuid::new_v4(), "Built streaming pipeline for payments data", 0.9),
            scored(
                &second,
                Uuid::new_v4(),
                "Built streaming pipeline for payments data team",
                0.8,
            ),
            scored(&second, Uuid::new_v4(), "Mentored junior engineers", 0.2),
        ];
        let selected = select(&bullets, &[first, second], SelectorConfig::default());
        assert_eq!(
            texts(&selected),
            vec![
                "Built streaming pipeline for payments data",
                "Mentored junior engineers"
            ]
        );
    }

    #[test]
    fn test_redundant_embeddings_suppressed() {
        let r = role(3);
        let mut a = scored(&r, Uuid::new_v4(), "Scaled search cluster", 0.9);
        let mut b = scored(&r, Uuid::new_v4(), "Grew query throughput", 0.8);
        let mut c = scored(&r, Uuid::new_v4(), "Organized hackathon", 0.7);
        a.embedding = Some(vec![1.0, 0.0]);
        b.embedding = Some(vec![0.99, 0.05]);
        c.embedding = Some(vec![0.0, 1.0]);
        let selected = select(&[a, b, c], &[r], SelectorConfig::default());
        assert_eq!(
            texts(&selected),
            vec!["Scaled search cluster", "Organized hackathon"]
        );
    }

    #[test]
    fn test_ties_prefer_metric_then_id() {
        let r = role(3);
        let p = Uuid::new_v4();
        let plain = scored(&r, p, "Wrote design docs", 0.5);
        let quantified = scored(&r, p, "Closed 40 tickets", 0.5 + 1e-12);
        let mut other = scored(&r, p, "Reviewed pull requests", 0.5);
        other.bullet_id = Uuid::nil();
        let selected = select(
            &[plain, quantified, other],
            &[r],
            SelectorConfig::default(),
        );
        assert_eq!(
            texts(&selected),
            vec!["Closed 40 tickets", "Reviewed pull requests", "Wrote design docs"]
        );
    }

    #[test]
    fn test_near_tie_chain_orders_the_same_from_any_input_order() {
        let r = role(3);
        let p = Uuid::new_v4();
        let low = scored(&r, p, "Wrote runbooks", 0.5);
        let mid = scored(&r, p, "Tuned alerts", 0.5 + 0.8e-9);
        let high = scored(&r, p, "Rotated on-call", 0.5 + 1.6e-9);

        let orders = [
            [&low, &mid, &high],
            [&high, &mid, &low],
            [&mid, &low, &high],
            [&high, &low, &mid],
        ];
        let sorted: Vec<Vec<Uuid>> = orders
            .iter()
            .map(|order| {
                let mut v: Vec<&ScoredBullet> = order.to_vec();
                v.sort_by(|a, b| compare(a, b));
                v.iter().map(|s| s.bullet_id).collect()
            })
            .collect();
        assert!(sorted.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(compare(&low, &high), compare(&low, &mid).then(compare(&mid, &high)));
    }

    #[test]
    fn test_is_pure() {
        let r = role(3);
        let bullets = two_projects(&r);
        let first = select(&bullets, &[r.clone()], SelectorConfig::default());
        let second = select(&bullets, &[r], SelectorConfig::default());
        let ids = |v: &[ScoredBullet]| v.iter().map(|s| s.bullet_id).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }
}
