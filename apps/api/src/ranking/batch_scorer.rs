//! Batch Scorer — remote relevance scoring with a deterministic local fallback.
//!
//! Algorithm:
//! 1. Pack candidates into batches bounded by count (`min_batch`..=`max_batch`) and
//!    by an estimated token budget.
//! 2. A fixed pool of workers pulls batch indices from a shared counter, pacing
//!    successive calls. Each batch gets one retry on failure (none for permanent
//!    provider errors).
//! 3. Replies are repaired: unknown ids ignored, missing ids filled with a neutral
//!    score and flagged, scores clamped to 1–10.
//! 4. If any batch still failed, the whole run switches to the fallback heuristic
//!    (when enabled) so every score in a result shares one scale.
//! 5. Min-max normalise across the run, then add a capped bonus for skills not yet
//!    covered by a higher-scoring bullet.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::llm_client::prompts::json_system;
use crate::llm_client::{complete_json, LlmError, ModelProvider};
use crate::ranking::fallback;
use crate::ranking::models::{
    Candidate, JobAnalysis, ScoredBullet, ScoringMode, FLAG_MISSING_SCORE,
};
use crate::ranking::prompts::{SCORING_PERSONA, SCORING_PROMPT_TEMPLATE};

pub const MIN_SCORE: f64 = 1.0;
pub const MAX_SCORE: f64 = 10.0;
pub const NEUTRAL_SCORE: f64 = 5.5;
const COVERAGE_BONUS_PER_SKILL: f64 = 0.03;
const COVERAGE_BONUS_CAP: f64 = 0.1;
const SCORE_EPSILON: f64 = 1e-6;
const TOKENS_PER_BULLET_OVERHEAD: usize = 12;

#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub min_batch: usize,
    pub max_batch: usize,
    pub token_budget: usize,
    pub concurrency: usize,
    pub pacing: Duration,
    pub enable_fallback: bool,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            min_batch: 8,
            max_batch: 20,
            token_budget: 3000,
            concurrency: 2,
            pacing: Duration::from_millis(250),
            enable_fallback: true,
        }
    }
}

impl ScorerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enable_fallback: config.enable_fallback_scoring,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct ScoringOutcome {
    pub scored: Vec<ScoredBullet>,
    pub mode: ScoringMode,
}

#[derive(Debug, thiserror::Error)]
pub enum ScoringError {
    #[error("Remote scoring failed: {0}")]
    Remote(#[from] LlmError),

    #[error("Scoring was cancelled")]
    Cancelled,
}

#[derive(Debug, Serialize)]
struct PromptBullet<'a> {
    id: String,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct BatchReply {
    #[serde(default)]
    scores: Vec<ReplyEntry>,
}

#[derive(Debug, Deserialize)]
struct ReplyEntry {
    id: String,
    score: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    skills: Vec<String>,
}

pub struct BatchScorer {
    provider: Arc<dyn ModelProvider>,
    config: ScorerConfig,
}

impl BatchScorer {
    pub fn new(provider: Arc<dyn ModelProvider>, config: ScorerConfig) -> Self {
        Self { provider, config }
    }

    pub async fn score(
        &self,
        analysis: &JobAnalysis,
        candidates: &[Candidate],
        cancel: &CancellationToken,
    ) -> Result<ScoringOutcome, ScoringError> {
        if candidates.is_empty() {
            return Ok(ScoringOutcome {
                scored: Vec::new(),
                mode: ScoringMode::Remote,
            });
        }

        let batches = pack_batches(candidates, &self.config);
        info!(
            "Scoring {} candidates in {} batches",
            candidates.len(),
            batches.len()
        );

        let results = self.run_workers(analysis, candidates, &batches, cancel).await?;

        let mut scored = Vec::with_capacity(candidates.len());
        let mut failure = None;
        for (batch, result) in batches.iter().zip(results) {
            match result {
                Some(Ok(batch_scores)) => scored.extend(batch_scores),
                Some(Err(e)) => {
                    warn!("Batch of {} bullets failed after retry: {e}", batch.len());
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                None => {
                    if failure.is_none() {
                        failure = Some(LlmError::InvalidResponse(
                            "batch was never scored".to_string(),
                        ));
                    }
                }
            }
        }

        let mode = match failure {
            None => ScoringMode::Remote,
            Some(_) if self.config.enable_fallback => {
                warn!("Remote scoring incomplete, falling back to heuristic scoring");
                scored = fallback::score_all(analysis, candidates);
                ScoringMode::Fallback
            }
            Some(e) => return Err(ScoringError::Remote(e)),
        };

        normalize(&mut scored);
        apply_coverage_bonus(&mut scored);
        Ok(ScoringOutcome { scored, mode })
    }

    async fn run_workers(
        &self,
        analysis: &JobAnalysis,
        candidates: &[Candidate],
        batches: &[Vec<usize>],
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<Result<Vec<ScoredBullet>, LlmError>>>, ScoringError> {
        let analysis_json = serde_json::to_string_pretty(&AnalysisView::from(analysis))
            .map_err(LlmError::Parse)?;
        let work: Arc<Vec<Vec<Candidate>>> = Arc::new(
            batches
                .iter()
                .map(|b| b.iter().map(|&i| candidates[i].clone()).collect())
                .collect(),
        );
        let results: Arc<Mutex<Vec<Option<Result<Vec<ScoredBullet>, LlmError>>>>> =
            Arc::new(Mutex::new((0..batches.len()).map(|_| None).collect()));
        let next = Arc::new(AtomicUsize::new(0));
        let analysis_json = Arc::new(analysis_json);

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.concurrency.max(1).min(batches.len()) {
            let provider = Arc::clone(&self.provider);
            let work = Arc::clone(&work);
            let results = Arc::clone(&results);
            let next = Arc::clone(&next);
            let analysis_json = Arc::clone(&analysis_json);
            let cancel = cancel.clone();
            let pacing = self.config.pacing;

            workers.spawn(async move {
                let mut first = true;
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    if index >= work.len() || cancel.is_cancelled() {
                        break;
                    }
                    if !first {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(pacing) => {}
                        }
                    }
                    first = false;

                    debug!(worker_id, index, "scoring batch");
                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = score_with_retry(provider.as_ref(), &analysis_json, &work[index]) => r,
                    };
                    if let Ok(mut slots) = results.lock() {
                        slots[index] = Some(outcome);
                    }
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("Scoring worker panicked: {e}");
            }
        }

        if cancel.is_cancelled() {
            return Err(ScoringError::Cancelled);
        }

        let slots = std::mem::take(&mut *results.lock().unwrap_or_else(|e| e.into_inner()));
        Ok(slots)
    }
}

/// The part of the analysis the scorer sees.
#[derive(Serialize)]
struct AnalysisView<'a> {
    title: &'a str,
    role_level: &'a str,
    skills: &'a [String],
    requirements: &'a [String],
}

impl<'a> From<&'a JobAnalysis> for AnalysisView<'a> {
    fn from(a: &'a JobAnalysis) -> Self {
        Self {
            title: &a.title,
            role_level: &a.role_level,
            skills: &a.skills,
            requirements: &a.requirements,
        }
    }
}

async fn score_with_retry(
    provider: &dyn ModelProvider,
    analysis_json: &str,
    batch: &[Candidate],
) -> Result<Vec<ScoredBullet>, LlmError> {
    match score_batch(provider, analysis_json, batch).await {
        Ok(scored) => Ok(scored),
        Err(e) if e.is_transient() || e.is_malformed_output() => {
            warn!("Batch scoring failed, retrying once: {e}");
            score_batch(provider, analysis_json, batch).await
        }
        Err(e) => Err(e),
    }
}

async fn score_batch(
    provider: &dyn ModelProvider,
    analysis_json: &str,
    batch: &[Candidate],
) -> Result<Vec<ScoredBullet>, LlmError> {
    let prompt_bullets: Vec<PromptBullet> = batch
        .iter()
        .enumerate()
        .map(|(i, c)| PromptBullet {
            id: prompt_id(i),
            text: &c.bullet.text,
        })
        .collect();
    let prompt = SCORING_PROMPT_TEMPLATE
        .replace("{analysis_json}", analysis_json)
        .replace("{bullets_json}", &serde_json::to_string_pretty(&prompt_bullets)?);

    let max_tokens = (batch.len() * 60 + 200) as u32;
    let reply: BatchReply = complete_json(
        provider,
        &json_system(SCORING_PERSONA),
        &prompt,
        max_tokens,
    )
    .await?;

    repair_reply(batch, reply)
}

fn prompt_id(index: usize) -> String {
    format!("b{index}")
}

/// Maps a reply back onto the batch. Fails only when nothing usable came back.
fn repair_reply(batch: &[Candidate], reply: BatchReply) -> Result<Vec<ScoredBullet>, LlmError> {
    let mut by_id: HashMap<String, ReplyEntry> = HashMap::new();
    for entry in reply.scores {
        if entry.score.is_finite() {
            by_id.entry(entry.id.trim().to_string()).or_insert(entry);
        }
    }

    let mut usable = 0;
    let scored: Vec<ScoredBullet> = batch
        .iter()
        .enumerate()
        .map(|(i, candidate)| match by_id.remove(&prompt_id(i)) {
            Some(entry) => {
                usable += 1;
                let mut s = ScoredBullet::from_candidate(
                    candidate,
                    entry.score.clamp(MIN_SCORE, MAX_SCORE),
                );
                s.reasoning = entry.reasoning.trim().to_string();
                s.matched_skills = entry.skills;
                s
            }
            None => {
                let mut s = ScoredBullet::from_candidate(candidate, NEUTRAL_SCORE);
                s.flags.push(FLAG_MISSING_SCORE.to_string());
                s
            }
        })
        .collect();

    if usable == 0 {
        return Err(LlmError::InvalidResponse(
            "no usable scores in batch reply".to_string(),
        ));
    }
    if usable < batch.len() {
        warn!(
            "Batch reply scored {usable} of {} bullets; filled the rest with neutral scores",
            batch.len()
        );
    }
    Ok(scored)
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4 + TOKENS_PER_BULLET_OVERHEAD
}

/// Candidate indices grouped into batches, in input order.
///
/// A batch closes at `max_batch` items, or when the next item would exceed the
/// token budget and the batch already holds `min_batch` items.
pub fn pack_batches(candidates: &[Candidate], config: &ScorerConfig) -> Vec<Vec<usize>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut tokens = 0;

    for (i, candidate) in candidates.iter().enumerate() {
        let cost = estimate_tokens(&candidate.bullet.text);
        let full = current.len() >= config.max_batch;
        let over_budget = current.len() >= config.min_batch && tokens + cost > config.token_budget;
        if !current.is_empty() && (full || over_budget) {
            batches.push(std::mem::take(&mut current));
            tokens = 0;
        }
        current.push(i);
        tokens += cost;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Min-max normalisation of `raw_score` into `normalized_score`. When every raw
/// score is the same, the 1–10 scale itself is used so a lone 9 still reads high.
pub fn normalize(scored: &mut [ScoredBullet]) {
    let (min, max) = scored.iter().fold((f64::MAX, f64::MIN), |(lo, hi), s| {
        (lo.min(s.raw_score), hi.max(s.raw_score))
    });
    let spread = max - min;

    for s in scored.iter_mut() {
        s.normalized_score = if spread < SCORE_EPSILON {
            (s.raw_score - MIN_SCORE) / (MAX_SCORE - MIN_SCORE)
        } else {
            (s.raw_score - min) / spread
        }
        .clamp(0.0, 1.0);
    }
}

/// Rewards bullets that demonstrate skills no higher-scoring bullet has covered.
pub fn apply_coverage_bonus(scored: &mut [ScoredBullet]) {
    let mut order: Vec<usize> = (0..scored.len()).collect();
    order.sort_by(|&a, &b| {
        scored[b]
            .normalized_score
            .total_cmp(&scored[a].normalized_score)
            .then(scored[a].bullet_id.cmp(&scored[b].bullet_id))
    });

    let mut covered: HashSet<String> = HashSet::new();
    for i in order {
        let skills: HashSet<String> = scored[i]
            .matched_skills
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        let new_skills = skills.difference(&covered).count();
        let bonus = (COVERAGE_BONUS_PER_SKILL * new_skills as f64).min(COVERAGE_BONUS_CAP);
        scored[i].normalized_score = (scored[i].normalized_score + bonus).min(1.0);
        covered.extend(skills);
    }
}
