pub mod cli;
pub mod config;
pub mod db;
pub mod dedup;
pub mod document;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod fields;
pub mod merge;
pub mod normalize;
pub mod pipeline;
pub mod profile;
pub mod record;
pub mod validate;

pub use error::{HarvestError, Result};
