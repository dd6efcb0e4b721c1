pub mod commands;
pub mod config;
pub mod downloader;
pub mod errors;
pub mod logging;
pub mod processing;
pub mod security;
pub mod tools;
pub mod utils;
