pub mod config;
pub mod threading;
