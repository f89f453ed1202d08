//! Job Analyzer — one cached model call that turns a job posting into skills and
//! requirements.
//!
//! Algorithm:
//! 1. Truncate the description section-aware (start at the first requirements-style
//!    heading when the text is over the cap).
//! 2. Look up `(model, prompt version, title, truncated description)` in the cache.
//! 3. On a miss, call the model, validate the reply and cache it for the TTL.
//! 4. If the call fails and fallback is enabled, derive a keyword analysis locally
//!    and flag it `degraded` (never cached).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::llm_client::prompts::json_system;
use crate::llm_client::{complete_json, LlmError, ModelProvider};
use crate::ranking::cache::{cache_key, AnalysisCache};
use crate::ranking::models::JobAnalysis;
use crate::ranking::prompts::{ANALYSIS_PERSONA, ANALYSIS_PROMPT_TEMPLATE, PROMPT_VERSION};
use crate::similarity::text::content_terms;

pub const MAX_DESCRIPTION_CHARS: usize = 4000;
pub const ANALYSIS_TTL: Duration = Duration::from_secs(10 * 60);
pub const MAX_SKILLS: usize = 12;
pub const MAX_REQUIREMENTS: usize = 8;
const MAX_OUTPUT_TOKENS: u32 = 1200;

const SECTION_HEADINGS: &[&str] = &[
    "requirements",
    "qualifications",
    "responsibilities",
    "skills",
    "experience",
];

/// Raw model reply, before validation.
#[derive(Debug, Deserialize)]
struct AnalysisReply {
    #[serde(default)]
    skills: Vec<String>,
    #[serde(default)]
    requirements: Vec<String>,
    #[serde(default)]
    role_level: Option<String>,
    #[serde(default)]
    function_type: Option<String>,
    #[serde(default)]
    company_context: Option<String>,
}

pub struct JobAnalyzer {
    provider: Arc<dyn ModelProvider>,
    cache: Arc<dyn AnalysisCache>,
    ttl: Duration,
    enable_fallback: bool,
}

impl JobAnalyzer {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        cache: Arc<dyn AnalysisCache>,
        enable_fallback: bool,
    ) -> Self {
        Self {
            provider,
            cache,
            ttl: ANALYSIS_TTL,
            enable_fallback,
        }
    }

    pub async fn analyze(&self, title: &str, description: &str) -> Result<JobAnalysis, LlmError> {
        let title = title.trim();
        let truncated = truncate_description(description);
        let key = cache_key(self.provider.chat_model(), PROMPT_VERSION, title, &truncated);

        match self.cache.get(&key).await {
            Ok(Some(hit)) => {
                debug!("job analysis cache hit");
                return Ok(hit);
            }
            Ok(None) => {}
            Err(e) => warn!("Job analysis cache read failed, treating as miss: {e}"),
        }

        match self.analyze_remote(title, &truncated).await {
            Ok(analysis) => {
                if let Err(e) = self.cache.put(&key, &analysis, self.ttl).await {
                    warn!("Job analysis cache write failed: {e}");
                }
                Ok(analysis)
            }
            Err(e) if self.enable_fallback => {
                warn!("Job analysis failed, using local keyword analysis: {e}");
                Ok(local_analysis(title, &truncated))
            }
            Err(e) => Err(e),
        }
    }

    async fn analyze_remote(&self, title: &str, description: &str) -> Result<JobAnalysis, LlmError> {
        let prompt = ANALYSIS_PROMPT_TEMPLATE
            .replace("{title}", title)
            .replace("{description}", description);
        let reply: AnalysisReply = complete_json(
            self.provider.as_ref(),
            &json_system(ANALYSIS_PERSONA),
            &prompt,
            MAX_OUTPUT_TOKENS,
        )
        .await?;

        let skills = clean_list(reply.skills, MAX_SKILLS);
        if skills.is_empty() {
            return Err(LlmError::InvalidResponse(
                "analysis contained no skills".to_string(),
            ));
        }

        Ok(JobAnalysis {
            title: title.to_string(),
            description: description.to_string(),
            skills,
            requirements: clean_list(reply.requirements, MAX_REQUIREMENTS),
            role_level: non_blank(reply.role_level).unwrap_or_else(|| infer_level(title)),
            function_type: non_blank(reply.function_type)
                .map(|f| f.to_lowercase())
                .unwrap_or_else(|| infer_function(title)),
            company_context: non_blank(reply.company_context),
            degraded: false,
        })
    }
}

/// Trims, drops blanks and case-insensitive duplicates, keeps the first `cap`.
fn clean_list(items: Vec<String>, cap: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_lowercase()))
        .take(cap)
        .collect()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v != "null")
}

/// Cuts `description` to [`MAX_DESCRIPTION_CHARS`]. When over the cap, starts from the
/// first heading line naming requirements, qualifications, responsibilities, skills
/// or experience; otherwise keeps the head of the text.
pub fn truncate_description(description: &str) -> String {
    let text = description.trim();
    if text.chars().count() <= MAX_DESCRIPTION_CHARS {
        return text.to_string();
    }

    let start = heading_offset(text).unwrap_or(0);
    text[start..].chars().take(MAX_DESCRIPTION_CHARS).collect()
}

fn heading_offset(text: &str) -> Option<usize> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let label = line
            .trim()
            .trim_start_matches(|c: char| c == '#' || c == '*' || c == '-' || c.is_whitespace())
            .to_lowercase();
        let short = label.chars().count() <= 60;
        if short && SECTION_HEADINGS.iter().any(|h| label.contains(h)) {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}

/// Keyword analysis used when the model is unavailable.
pub fn local_analysis(title: &str, description: &str) -> JobAnalysis {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (position, term) in content_terms(description).into_iter().enumerate() {
        if term.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let entry = counts.entry(term).or_insert((0, position));
        entry.0 += 1;
    }
    let mut ranked: Vec<(String, usize, usize)> = counts
        .into_iter()
        .map(|(term, (count, first))| (term, count, first))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

    let title_terms = content_terms(title);
    let skills = clean_list(
        title_terms
            .into_iter()
            .chain(ranked.into_iter().map(|(term, _, _)| term))
            .collect(),
        MAX_SKILLS,
    );

    let requirements = clean_list(
        description
            .lines()
            .map(|l| l.trim().trim_start_matches(['-', '*', '•']).trim().to_string())
            .filter(|l| (10..=200).contains(&l.chars().count()))
            .filter(|l| {
                let lower = l.to_lowercase();
                ["experience", "required", "must", "years", "proficien", "knowledge"]
                    .iter()
                    .any(|k| lower.contains(k))
            })
            .collect(),
        MAX_REQUIREMENTS,
    );

    JobAnalysis {
        title: title.to_string(),
        description: description.to_string(),
        skills,
        requirements,
        role_level: infer_level(title),
        function_type: infer_function(title),
        company_context: None,
        degraded: true,
    }
}

fn infer_level(title: &str) -> String {
    let lower = title.to_lowercase();
    let level = [
        ("intern", "intern"),
        ("junior", "junior"),
        ("principal", "principal"),
        ("staff", "staff"),
        ("director", "director"),
        ("head of", "director"),
        ("manager", "manager"),
        ("senior", "senior"),
        ("sr", "senior"),
        ("lead", "senior"),
    ]
    .iter()
    .find(|(needle, _)| {
        if needle.contains(' ') {
            lower.contains(needle)
        } else {
            lower.split(|c: char| !c.is_alphanumeric()).any(|w| w == *needle)
        }
    })
    .map(|(_, level)| *level)
    .unwrap_or("mid");
    level.to_string()
}

fn infer_function(title: &str) -> String {
    let lower = title.to_lowercase();
    let function = [
        ("engineer", "engineering"),
        ("developer", "engineering"),
        ("sre", "engineering"),
        ("data", "data"),
        ("scientist", "data"),
        ("product", "product"),
        ("design", "design"),
        ("sales", "sales"),
        ("account", "sales"),
        ("marketing", "marketing"),
        ("operations", "operations"),
    ]
    .iter()
    .find(|(needle, _)| lower.contains(needle))
    .map(|(_, f)| *f)
    .unwrap_or("general");
    function.to_string()
}
