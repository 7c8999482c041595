pub mod archive;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod metadata;
pub mod modules;
pub mod planner;
pub mod profile;
pub mod props;
pub mod runner;
pub mod script;
pub mod tools;
pub mod workspace;

pub use error::{Error, Result};
