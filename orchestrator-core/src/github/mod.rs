//! GitHub Client: a rate-aware REST/GraphQL client with
//! retries, secondary-rate-limit detection, conditional requests, and
//! per-call telemetry.
//!
//! `sipag-core` shells out to the `gh` CLI (`worker::github_gateway::run_gh`)
//! because `sipag` runs wherever a developer's `gh` is already authenticated.
//! The core here is a long-running daemon with its own token lifecycle and
//! needs retry/backoff control the CLI doesn't expose, so this is built on
//! `reqwest` directly — the same swap other control-plane-shaped Rust
//! services make for the same reason.

pub mod client;
pub mod error;

pub use client::{GitHubClient, GitHubClientConfig, GitHubRequest, GitHubResponse, TokenProvider};
pub use error::{ErrorKind, GitHubApiError};
