// Public library modules for integration tests and external use.
pub mod actions;
pub mod cache;
pub mod cancel;
pub mod catalog;
pub mod checksum;
pub mod cli;
pub mod commands;
pub mod config;
pub mod duplicates;
pub mod error;
pub mod health;
pub mod inventory;
pub mod journal;
pub mod logging;
pub mod manifest;
pub mod normalize;
pub mod progress;
pub mod scanner;
pub mod types;
pub mod utils;

pub use error::{Error, ErrorKind, Result};

// Keep main.rs thin and have it call into the library functions.
