// ivguard library - replay detection for authenticated IVs

pub mod network;
pub mod security;
pub mod simulation;

pub use security::replay::{IvFilter, ReplayCache, ReplayCacheError, MAX_CAPACITY};
