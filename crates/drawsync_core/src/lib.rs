pub mod config;
pub mod content_store;
pub mod crawl;
pub mod error;
pub mod extract;
pub mod index;
pub mod metadata;
pub mod migrate;
pub mod query;
pub mod rate_limit;
pub mod remote;
pub mod render;
pub mod runtime;
