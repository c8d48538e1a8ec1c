//! Library crate for recon-rs: the reconnaissance workflow and its collaborators.
pub mod config;
pub mod console;
pub mod enumerate;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod ports;
pub mod report;
pub mod session;
pub mod tools;
pub mod types;
