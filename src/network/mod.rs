// Network module for ivguard
// Outbound dialing guarded by a target IP admission policy

pub mod dialer;
pub mod validator;

pub use dialer::ValidatingDialer;
pub use validator::{allow_all, require_public_ip, IpRejection, TargetIpValidator};

use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("fwmark {0} requested, but SO_MARK is only supported on Linux")]
    FwmarkUnsupported(u32),

    #[error("Failed to set fwmark {fwmark}: {source}")]
    Fwmark {
        fwmark: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Target address {ip} rejected: {reason}")]
    TargetRejected {
        ip: IpAddr,
        #[source]
        reason: IpRejection,
    },

    #[error("Failed to resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No addresses found for {0}")]
    NoAddresses(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetworkError>;
