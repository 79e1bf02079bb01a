//! Domain types and pure policies shared by the HTTP surface and background workers.

pub mod lifecycle;
pub mod normalizer;
pub mod notify;
pub mod outbound;
pub mod retry;
pub mod signature;
pub mod token;
pub mod types;
