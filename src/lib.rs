pub mod config;
pub mod database;
pub mod exclude;
pub mod processing;
pub mod progress;
pub mod rescan;
pub mod scanner;
pub mod targets_file;
pub mod terminal_colors;
pub mod tracing;
