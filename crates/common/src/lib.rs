pub mod config;
pub mod observability;
pub mod storage;
pub mod types;
