//! `qb-demo`: a guided walk through the qdbapi client.

pub mod args;
pub mod scenario;

pub use args::Args;
pub use scenario::Scenario;
