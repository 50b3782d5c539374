pub mod error;
pub mod ingress;
pub mod service;
pub mod source;

// HTTP poll + SSE stream transport
pub mod server;
