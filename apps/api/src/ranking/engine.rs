//! Recommendation Engine — JobAnalyzer → LexicalPrefilter → BatchScorer →
//! BulletSelector, with progress reporting and cancellation between stages.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::llm_client::LlmError;
use crate::models::library::{EmbeddingState, Role};
use crate::ranking::batch_scorer::{BatchScorer, ScoringError};
use crate::ranking::job_analyzer::JobAnalyzer;
use crate::ranking::models::{JobAnalysis, ScoredBullet, ScoringMode, FLAG_MISSING_SCORE};
use crate::ranking::prefilter::{prefilter, PrefilterConfig};
use crate::ranking::selector::{select, SelectorConfig};
use crate::store::{Store, StoreError};

pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_DESCRIPTION_INPUT_CHARS: usize = 50_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationRequest {
    pub job_title: String,
    pub job_description: String,
}

impl RecommendationRequest {
    pub fn validate(&self) -> Result<(), EngineError> {
        let title = self.job_title.trim();
        let description = self.job_description.trim();
        if description.is_empty() {
            return Err(EngineError::InvalidRequest(
                "job_description must not be empty".to_string(),
            ));
        }
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(EngineError::InvalidRequest(format!(
                "job_title must be at most {MAX_TITLE_CHARS} characters"
            )));
        }
        if description.chars().count() > MAX_DESCRIPTION_INPUT_CHARS {
            return Err(EngineError::InvalidRequest(format!(
                "job_description must be at most {MAX_DESCRIPTION_INPUT_CHARS} characters"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendedBullet {
    pub bullet_id: Uuid,
    pub project_id: Uuid,
    pub text: String,
    pub relevance: f64,
    pub reasoning: String,
    pub matched_skills: Vec<String>,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleGroup {
    pub role_id: Uuid,
    pub title: String,
    pub company: Option<String>,
    pub bullets: Vec<RecommendedBullet>,
    pub average_relevance: f64,
    pub projects_represented: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub candidates: usize,
    pub prefiltered: usize,
    pub scored: usize,
    /// Bullets the scorer left out of its reply and that got a neutral score.
    pub repaired: usize,
    pub selected: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendationResult {
    pub groups: Vec<RoleGroup>,
    pub analysis: JobAnalysis,
    pub totals: Totals,
    pub scoring_mode: ScoringMode,
    /// True when the analysis or any score came from a local fallback or repair.
    pub degraded: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analyzing,
    Prefiltering,
    Scoring,
    Selecting,
    Complete,
}

/// Receives coarse progress at each stage boundary.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, stage: Stage, fraction: f32);
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    EmptyLibrary(&'static str),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job analysis failed: {0}")]
    Analysis(LlmError),

    #[error("Bullet scoring failed: {0}")]
    Scoring(LlmError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Recommendation run was cancelled")]
    Cancelled,
}

impl EngineError {
    /// Stable machine-readable code carried across the execution boundary.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::EmptyLibrary(_) | EngineError::InvalidRequest(_) => "VALIDATION_ERROR",
            EngineError::Analysis(_) | EngineError::Scoring(_) => "LLM_ERROR",
            EngineError::Store(_) => "STORE_ERROR",
            EngineError::Cancelled => "CANCELLED",
        }
    }
}

impl From<ScoringError> for EngineError {
    fn from(e: ScoringError) -> Self {
        match e {
            ScoringError::Remote(e) => EngineError::Scoring(e),
            ScoringError::Cancelled => EngineError::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    pub prefilter: PrefilterConfig,
    pub selector: SelectorConfig,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            prefilter: PrefilterConfig {
                per_role_cap: config.prefilter_per_role_cap,
                global_cap: config.prefilter_global_cap,
            },
            selector: SelectorConfig {
                max_total: config.max_selected_bullets,
                ..SelectorConfig::default()
            },
        }
    }
}

pub struct RecommendationEngine {
    store: Arc<dyn Store>,
    analyzer: JobAnalyzer,
    scorer: BatchScorer,
    config: EngineConfig,
}

impl RecommendationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        analyzer: JobAnalyzer,
        scorer: BatchScorer,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            analyzer,
            scorer,
            config,
        }
    }

    pub async fn recommend(
        &self,
        request: &RecommendationRequest,
        cancel: &CancellationToken,
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<RecommendationResult, EngineError> {
        let started = Instant::now();
        let report = |stage: Stage, fraction: f32| {
            if let Some(observer) = observer {
                observer.on_progress(stage, fraction);
            }
        };
        let checkpoint = || {
            if cancel.is_cancelled() {
                Err(EngineError::Cancelled)
            } else {
                Ok(())
            }
        };

        request.validate()?;

        let roles = self.store.list_roles().await?;
        if roles.is_empty() {
            return Err(EngineError::EmptyLibrary(
                "Your library has no roles yet. Add a role with at least one bullet first.",
            ));
        }
        let role_ids: BTreeSet<Uuid> = roles.iter().map(|r| r.id).collect();
        let bullets: Vec<_> = self
            .store
            .list_bullets()
            .await?
            .into_iter()
            .filter(|b| role_ids.contains(&b.role_id))
            .collect();
        if bullets.is_empty() {
            return Err(EngineError::EmptyLibrary(
                "Your library has no bullets yet. Add at least one bullet first.",
            ));
        }
        checkpoint()?;

        report(Stage::Analyzing, 0.0);
        let analysis = self
            .analyzer
            .analyze(&request.job_title, &request.job_description)
            .await
            .map_err(EngineError::Analysis)?;
        checkpoint()?;

        report(Stage::Prefiltering, 0.25);
        let candidates = prefilter(&analysis, &bullets, self.config.prefilter);
        checkpoint()?;

        report(Stage::Scoring, 0.35);
        let outcome = self.scorer.score(&analysis, &candidates, cancel).await?;
        checkpoint()?;

        report(Stage::Selecting, 0.9);
        let mut scored = outcome.scored;
        self.attach_embeddings(&mut scored).await?;
        let selected = select(&scored, &roles, self.config.selector);

        let totals = Totals {
            candidates: bullets.len(),
            prefiltered: candidates.len(),
            scored: scored.len(),
            repaired: scored
                .iter()
                .filter(|s| s.has_flag(FLAG_MISSING_SCORE))
                .count(),
            selected: selected.len(),
        };
        let degraded = analysis.degraded
            || outcome.mode == ScoringMode::Fallback
            || totals.repaired > 0;
        let groups = group_by_role(&roles, selected);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            candidates = totals.candidates,
            prefiltered = totals.prefiltered,
            selected = totals.selected,
            degraded,
            elapsed_ms,
            "recommendation complete"
        );
        report(Stage::Complete, 1.0);

        Ok(RecommendationResult {
            groups,
            analysis,
            totals,
            scoring_mode: outcome.mode,
            degraded,
            elapsed_ms,
        })
    }

    /// Adds vectors for bullets whose embedding is current.
    async fn attach_embeddings(&self, scored: &mut [ScoredBullet]) -> Result<(), StoreError> {
        let mut ready = Vec::new();
        for s in scored.iter() {
            if let Some(bullet) = self.store.get_bullet(s.bullet_id).await? {
                if bullet.embedding_state == EmbeddingState::Ready {
                    ready.push(bullet.id);
                }
            }
        }
        let mut vectors: HashMap<Uuid, Vec<f32>> = self
            .store
            .list_embeddings(&ready)
            .await?
            .into_iter()
            .map(|e| (e.bullet_id, e.vector))
            .collect();
        for s in scored.iter_mut() {
            s.embedding = vectors.remove(&s.bullet_id);
        }
        Ok(())
    }
}

fn group_by_role(roles: &[Role], selected: Vec<ScoredBullet>) -> Vec<RoleGroup> {
    let mut by_role: HashMap<Uuid, Vec<ScoredBullet>> = HashMap::new();
    for s in selected {
        by_role.entry(s.role_id).or_default().push(s);
    }

    roles
        .iter()
        .filter_map(|role| {
            let bullets = by_role.remove(&role.id)?;
            let projects: BTreeSet<Uuid> = bullets.iter().map(|b| b.project_id).collect();
            let average_relevance =
                bullets.iter().map(|b| b.normalized_score).sum::<f64>() / bullets.len() as f64;
            Some(RoleGroup {
                role_id: role.id,
                title: role.title.clone(),
                company: role.company.clone(),
                projects_represented: projects.len(),
                average_relevance,
                bullets: bullets
                    .into_iter()
                    .map(|b| RecommendedBullet {
                        bullet_id: b.bullet_id,
                        project_id: b.project_id,
                        text: b.text,
                        relevance: b.normalized_score,
                        reasoning: b.reasoning,
                        matched_skills: b.matched_skills,
                        flags: b.flags,
                    })
                    .collect(),
            })
        })
        .collect()
}
