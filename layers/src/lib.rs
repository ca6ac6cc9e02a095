//! Sidelink Protocol Stack Layers Library
//!
//! This crate implements the LTE V2X sidelink (transmission mode 4) physical
//! layer procedures and the MAC HARQ reception model on top of them.

pub mod phy;
pub mod mac;

use thiserror::Error;

/// Common errors for protocol layers
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Invalid protocol data unit")]
    InvalidPdu,

    #[error("Resource unavailable")]
    ResourceUnavailable,

    #[error("Processing error: {0}")]
    ProcessingError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Soft buffer holds TBS {buffer} but decode requested TBS {requested}")]
    SoftBufferMismatch { buffer: u32, requested: u32 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Interface error: {0}")]
    Interface(#[from] interfaces::InterfaceError),
}
