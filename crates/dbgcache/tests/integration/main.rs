// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod artifacts;
pub mod content;
pub mod debug_info;
pub mod file_stream;
pub mod utils;

pub use utils::*;
