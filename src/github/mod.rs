//! GitHub REST API surface: wire types and a paginating client.

mod client;
pub mod types;

pub use client::GithubClient;
pub use types::Item;
