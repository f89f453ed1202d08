// Prompt constants for job analysis and batch scoring.
// Bump PROMPT_VERSION whenever a prompt changes so cached analyses are not reused.

pub const PROMPT_VERSION: &str = "v1";

pub const ANALYSIS_PERSONA: &str = "You are an expert technical recruiter. \
    Read a job posting and extract what a hiring manager will screen for.";

/// Job analysis prompt. Replace `{title}` and `{description}` before sending.
pub const ANALYSIS_PROMPT_TEMPLATE: &str = r#"Analyze the following job posting.

Return a JSON object with this EXACT schema (no extra fields):
{
  "skills": ["Rust", "distributed systems"],
  "requirements": ["5+ years building backend services"],
  "role_level": "senior",
  "function_type": "engineering",
  "company_context": "Series B fintech"
}

Rules:
- skills: 8 to 12 concrete skills, tools or domains, most important first.
- requirements: 5 to 8 key requirements, each one short sentence.
- role_level: one of "intern", "junior", "mid", "senior", "staff", "principal", "manager", "director", "executive".
- function_type: a single lowercase word such as "engineering", "product", "design", "data", "sales", "operations".
- company_context: one short phrase about the company, or null if the posting says nothing.

JOB TITLE:
{title}

JOB DESCRIPTION:
{description}"#;

pub const SCORING_PERSONA: &str = "You are an expert resume reviewer. \
    Score how strongly each resume bullet supports a candidacy for a specific job.";

/// Batch scoring prompt. Replace `{analysis_json}` and `{bullets_json}` before sending.
pub const SCORING_PROMPT_TEMPLATE: &str = r#"Score every resume bullet below against the job analysis.

Return a JSON object with this EXACT schema (no extra fields):
{
  "scores": [
    {"id": "b0", "score": 7.5, "reasoning": "Direct Kafka migration experience", "skills": ["Kafka"]}
  ]
}

Rules:
- Return exactly one entry per bullet id. Do not invent ids.
- score: a number from 1.0 (irrelevant) to 10.0 (exactly what the job needs).
- reasoning: at most 15 words.
- skills: the job skills this bullet demonstrates, copied verbatim from the analysis.

JOB ANALYSIS:
{analysis_json}

BULLETS:
{bullets_json}"#;
