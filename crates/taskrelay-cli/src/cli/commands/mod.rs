pub mod config;
pub mod daemon;
pub mod jobs;
