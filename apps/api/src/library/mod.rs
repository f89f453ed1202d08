pub mod handlers;
pub mod quality;
pub mod service;
