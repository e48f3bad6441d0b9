pub mod config;
pub mod layout;
pub mod report;
pub mod types;
