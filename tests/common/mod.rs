//! Shared integration test helpers: fake process runner, fake proxy
//! and a router wrapper backed by a temporary project directory.

pub mod mocks;
pub mod test_app;

pub use mocks::*;
pub use test_app::*;
