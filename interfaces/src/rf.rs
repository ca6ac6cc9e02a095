//! RF front-end abstraction
//!
//! The PHY exchanges one frequency-domain subframe per tick with the radio.
//! Receive returns the next subframe in tick order; transmit is called exactly
//! once per tick, with `None` for silent subframes so the sink can keep
//! burst continuity.

use crate::{InterfaceError, SubframeGrid};
use async_trait::async_trait;

/// Front-end counters
#[derive(Debug, Clone, Default)]
pub struct RfStats {
    pub rx_subframes: u64,
    pub tx_subframes: u64,
    pub tx_silent: u64,
    pub rx_timeouts: u64,
}

/// Per-tick sample source and sink
#[async_trait]
pub trait RfFrontend: Send + Sync {
    /// Wait for the next received subframe
    async fn receive(&self) -> Result<SubframeGrid, InterfaceError>;

    /// Hand over the subframe to be transmitted at `tick`
    async fn transmit(&self, tick: u64, grid: Option<SubframeGrid>) -> Result<(), InterfaceError>;

    /// Carrier width in resource blocks
    fn nof_prb(&self) -> usize;

    /// Current counters
    async fn stats(&self) -> RfStats;
}
