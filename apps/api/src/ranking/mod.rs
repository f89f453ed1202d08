pub mod batch_scorer;
pub mod cache;
pub mod engine;
pub mod fallback;
pub mod handlers;
pub mod job_analyzer;
pub mod models;
pub mod prefilter;
pub mod prompts;
pub mod selector;
