pub mod embedding;
pub mod library;
