// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod batching;
pub mod caching;
pub mod config;
pub mod retrying;
pub mod utils;

pub use utils::*;
