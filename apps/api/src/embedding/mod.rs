pub mod centroid;
pub mod handlers;
pub mod processor;
pub mod state_machine;
