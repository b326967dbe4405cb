//! Wayfinder application shell: CLI, configuration store, model engine
//! implementations, and the WebSocket bridge carrying the panel and page
//! helper conduits.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod llm;

/// Version banner embedded in `--version` output and export headers.
pub fn build_tag() -> String {
    format!(
        "{} ({} {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_DATE")
    )
}
