// Re-export from common crate to keep crate::util::* paths stable
pub use gazer_common::config;
pub use gazer_common::threading;
pub mod logging;
