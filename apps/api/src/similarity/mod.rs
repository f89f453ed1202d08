//! Pure similarity helpers shared by the embedding processor and the ranking pipeline.

pub mod text;
pub mod vector;
