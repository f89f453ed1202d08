// Shared prompt fragments. Each feature that calls the model keeps its own
// prompts.rs alongside it.

/// System prompt fragment that enforces JSON-only output.
pub const JSON_ONLY_SYSTEM: &str = "You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Builds a system prompt from a persona line plus the JSON-only contract.
pub fn json_system(persona: &str) -> String {
    format!("{persona} {JSON_ONLY_SYSTEM}")
}
