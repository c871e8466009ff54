//! fgpt-ident - TCP/IP traffic fingerprint identification
//!
//! Synthesizes candidate functions over packet header fields, finds the values
//! that stand out in their output distribution, and combines the resulting
//! signs into fingerprints isolating distinct slices of captured traffic.

pub mod config;
pub mod consolidate;
pub mod engine;
pub mod error;
pub mod identifier;
pub mod output;
pub mod packet;
pub mod synthesis;

// Re-export commonly used types
pub use config::IdentConfig;
pub use consolidate::{Consolidation, Intersection};
pub use engine::{FunctionResult, Sign, WorkerPool};
pub use error::{IdentError, IdentResult, RecoveryStrategy};
pub use identifier::{FingerprintIdentifier, IdentificationOutcome, StopReason};
pub use output::{Fingerprint, ReportWriter};
pub use packet::{Packet, PacketIndex, Split};
pub use synthesis::PacketFunction;

pub type Result<T> = std::result::Result<T, IdentError>;
