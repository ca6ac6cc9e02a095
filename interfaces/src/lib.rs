//! Radio Front-End Interfaces Library
//!
//! This crate provides the frequency-domain subframe buffer exchanged with the
//! radio, the RF front-end trait and an in-process loopback air channel.

pub mod grid;
pub mod rf;
pub mod loopback;

pub use grid::SubframeGrid;
pub use rf::{RfFrontend, RfStats};
pub use loopback::{AirChannel, AirChannelConfig, LoopbackRf};

use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("Invalid message format")]
    InvalidMessage,

    #[error("Interface not initialized")]
    NotInitialized,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Timed out waiting for subframe {0}")]
    Timeout(u64),

    #[error("Duplicate transmission from node {node} for subframe {tick}")]
    DuplicateTransmission { node: usize, tick: u64 },
}
