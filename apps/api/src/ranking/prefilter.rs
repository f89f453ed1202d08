//! Lexical Prefilter — bounds how many bullets reach the remote scorer.
//!
//! Algorithm:
//! 1. Query terms = content terms of the job title, skills and requirements.
//! 2. Score every bullet with BM25 (k1 = 1.2, b = 0.75) using document
//!    frequencies over the whole library.
//! 3. Allocate the global cap across roles by water-filling: roles with fewer
//!    candidates than their fair share give the remainder to larger roles; no role
//!    exceeds the per-role cap.
//! 4. Keep each role's top-k by score, ties broken by bullet id.

use std::collections::{BTreeMap, HashMap, HashSet};

use uuid::Uuid;

use crate::models::library::Bullet;
use crate::ranking::models::{Candidate, JobAnalysis};
use crate::similarity::text::content_terms;

const K1: f64 = 1.2;
const B: f64 = 0.75;

#[derive(Debug, Clone, Copy)]
pub struct PrefilterConfig {
    pub per_role_cap: usize,
    pub global_cap: usize,
}

impl Default for PrefilterConfig {
    fn default() -> Self {
        Self {
            per_role_cap: 60,
            global_cap: 240,
        }
    }
}

/// Returns the surviving candidates, grouped by role (role id order), each group
/// ordered by lexical score descending.
pub fn prefilter(
    analysis: &JobAnalysis,
    bullets: &[Bullet],
    config: PrefilterConfig,
) -> Vec<Candidate> {
    let scores = bm25_scores(&query_terms(analysis), bullets);

    let mut by_role: BTreeMap<Uuid, Vec<Candidate>> = BTreeMap::new();
    for (bullet, score) in bullets.iter().zip(scores) {
        by_role.entry(bullet.role_id).or_default().push(Candidate {
            bullet: bullet.clone(),
            lexical_score: score,
        });
    }

    let sizes: Vec<(Uuid, usize)> = by_role.iter().map(|(id, c)| (*id, c.len())).collect();
    let quotas = allocate(&sizes, config);

    let mut out = Vec::new();
    for (role_id, mut candidates) in by_role {
        candidates.sort_by(|a, b| {
            b.lexical_score
                .total_cmp(&a.lexical_score)
                .then(a.bullet.id.cmp(&b.bullet.id))
        });
        candidates.truncate(quotas.get(&role_id).copied().unwrap_or(0));
        out.extend(candidates);
    }
    out
}

fn query_terms(analysis: &JobAnalysis) -> Vec<String> {
    let mut seen = HashSet::new();
    std::iter::once(analysis.title.as_str())
        .chain(analysis.skills.iter().map(String::as_str))
        .chain(analysis.requirements.iter().map(String::as_str))
        .flat_map(content_terms)
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// BM25 score of every bullet against `query`, in input order.
fn bm25_scores(query: &[String], bullets: &[Bullet]) -> Vec<f64> {
    let docs: Vec<Vec<String>> = bullets.iter().map(|b| content_terms(&b.text)).collect();
    let n = docs.len() as f64;
    if docs.is_empty() {
        return Vec::new();
    }
    let avgdl = (docs.iter().map(Vec::len).sum::<usize>() as f64 / n).max(1.0);

    let mut df: HashMap<&str, usize> = HashMap::new();
    for doc in &docs {
        let unique: HashSet<&str> = doc.iter().map(String::as_str).collect();
        for term in unique {
            *df.entry(term).or_default() += 1;
        }
    }

    docs.iter()
        .map(|doc| {
            let mut tf: HashMap<&str, usize> = HashMap::new();
            for term in doc {
                *tf.entry(term.as_str()).or_default() += 1;
            }
            let dl = doc.len() as f64;
            query
                .iter()
                .filter_map(|q| {
                    let f = *tf.get(q.as_str())? as f64;
                    let d = df.get(q.as_str()).copied().unwrap_or(0) as f64;
                    let idf = (1.0 + (n - d + 0.5) / (d + 0.5)).ln();
                    Some(idf * f * (K1 + 1.0) / (f + K1 * (1.0 - B + B * dl / avgdl)))
                })
                .sum()
        })
        .collect()
}

/// Water-filling split of `global_cap` across roles. Smallest roles are served
/// first so their unused share flows to larger ones.
fn allocate(sizes: &[(Uuid, usize)], config: PrefilterConfig) -> HashMap<Uuid, usize> {
    let mut order: Vec<(Uuid, usize)> = sizes.to_vec();
    order.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));

    let mut remaining = config.global_cap;
    let mut quotas = HashMap::new();
    let total = order.len();
    for (i, (role_id, size)) in order.into_iter().enumerate() {
        let fair_share = remaining / (total - i);
        let k = size.min(config.per_role_cap).min(fair_share);
        remaining -= k;
        quotas.insert(role_id, k);
    }
    quotas
}
