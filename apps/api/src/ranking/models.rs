//! Data shapes that flow between ranking stages. Produced fresh per run, never persisted.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::library::Bullet;

/// Tagged on every bullet scored by the local heuristic.
pub const FLAG_FALLBACK: &str = "fallback";
/// Tagged when the remote scorer omitted a bullet and a neutral score was filled in.
pub const FLAG_MISSING_SCORE: &str = "missing_score";

/// Structured view of a job posting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobAnalysis {
    pub title: String,
    /// Section-aware truncation of the original description.
    pub description: String,
    pub skills: Vec<String>,
    pub requirements: Vec<String>,
    pub role_level: String,
    pub function_type: String,
    pub company_context: Option<String>,
    /// Produced by the local keyword fallback instead of the model.
    #[serde(default)]
    pub degraded: bool,
}

/// A bullet that survived the lexical prefilter.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub bullet: Bullet,
    pub lexical_score: f64,
}

/// A bullet with a relevance score against one job analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredBullet {
    pub bullet_id: Uuid,
    pub role_id: Uuid,
    pub project_id: Uuid,
    pub text: String,
    pub fingerprint: String,
    pub has_metric: bool,
    /// Scorer output on the 1–10 scale.
    pub raw_score: f64,
    /// Comparable across the whole run, in `[0.0, 1.0]`.
    pub normalized_score: f64,
    pub reasoning: String,
    pub matched_skills: Vec<String>,
    pub flags: Vec<String>,
    /// Present only when the bullet's embedding is current.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl ScoredBullet {
    pub fn from_candidate(candidate: &Candidate, raw_score: f64) -> Self {
        let bullet = &candidate.bullet;
        Self {
            bullet_id: bullet.id,
            role_id: bullet.role_id,
            project_id: bullet.project_id,
            text: bullet.text.clone(),
            fingerprint: bullet.fingerprint.clone(),
            has_metric: bullet.flags.has_metric,
            raw_score,
            normalized_score: 0.0,
            reasoning: String::new(),
            matched_skills: Vec::new(),
            flags: Vec::new(),
            embedding: None,
        }
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    #[default]
    Remote,
    Fallback,
}
