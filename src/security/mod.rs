// Security module for ivguard
// Replay detection for IVs that already passed authentication

pub mod replay;

pub use replay::{
    false_positive_rate, Fingerprint, IvFilter, ReplayCache, ReplayCacheError, MAX_CAPACITY,
};
