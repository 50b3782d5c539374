pub mod client;
pub mod daemon;
pub mod util;

pub use gazer_core as core;
