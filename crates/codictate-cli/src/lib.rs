//! Command-line front end for the Codictate backup engine.

pub mod cli;
pub mod commands;
pub mod logging;
pub mod progress;
pub mod prompt;
pub mod summary;
