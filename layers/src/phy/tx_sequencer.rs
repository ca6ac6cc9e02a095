//! Transmit ordering
//!
//! Workers finish out of order but the radio must see subframes strictly in
//! tick order. Every worker submits exactly one [`TxRequest`] per tick; the
//! sequencer holds early arrivals back and releases the longest contiguous run
//! starting at the next expected tick.

use crate::LayerError;
use interfaces::{RfFrontend, SubframeGrid};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// The subframe a worker wants transmitted at `tick`
#[derive(Debug, Clone)]
pub struct TxRequest {
    pub tick: u64,
    /// `None` keeps the radio silent for the tick
    pub grid: Option<SubframeGrid>,
}

/// Reorders worker output and feeds the RF front-end
pub struct TxSequencer {
    rf: Arc<dyn RfFrontend>,
    rx: mpsc::Receiver<TxRequest>,
    pending: BTreeMap<u64, Option<SubframeGrid>>,
    next_tick: u64,
    transmitted: u64,
}

impl TxSequencer {
    /// Sequencer expecting `start_tick` first
    pub fn new(rf: Arc<dyn RfFrontend>, rx: mpsc::Receiver<TxRequest>, start_tick: u64) -> Self {
        Self {
            rf,
            rx,
            pending: BTreeMap::new(),
            next_tick: start_tick,
            transmitted: 0,
        }
    }

    /// Next tick to be handed to the radio
    pub fn next_tick(&self) -> u64 {
        self.next_tick
    }

    /// Forward requests until every sender is gone; returns the number of
    /// subframes passed to the radio
    pub async fn run(mut self) -> Result<u64, LayerError> {
        info!("Tx sequencer started at tick {}", self.next_tick);
        while let Some(request) = self.rx.recv().await {
            self.push(request).await?;
        }

        if !self.pending.is_empty() {
            warn!(
                "Tx sequencer stopping with {} subframes waiting for tick {}",
                self.pending.len(),
                self.next_tick
            );
        }
        info!("Tx sequencer stopped after {} subframes", self.transmitted);
        Ok(self.transmitted)
    }

    async fn push(&mut self, request: TxRequest) -> Result<(), LayerError> {
        if request.tick < self.next_tick {
            warn!("Late transmission for tick {} (next is {}), dropping", request.tick, self.next_tick);
            return Ok(());
        }
        if self.pending.insert(request.tick, request.grid).is_some() {
            warn!("Second transmission for tick {}, keeping the latest", request.tick);
        }
        trace!("Tx request for tick {} ({} pending)", request.tick, self.pending.len());

        while let Some(grid) = self.pending.remove(&self.next_tick) {
            if grid.is_some() {
                debug!("Transmitting subframe at tick {}", self.next_tick);
            }
            self.rf.transmit(self.next_tick, grid).await?;
            self.next_tick += 1;
            self.transmitted += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use interfaces::{InterfaceError, RfStats};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingRf {
        sent: Mutex<Vec<(u64, bool)>>,
    }

    #[async_trait]
    impl RfFrontend for RecordingRf {
        async fn receive(&self) -> Result<SubframeGrid, InterfaceError> {
            Err(InterfaceError::NotInitialized)
        }

        async fn transmit(&self, tick: u64, grid: Option<SubframeGrid>) -> Result<(), InterfaceError> {
            self.sent.lock().await.push((tick, grid.is_some()));
            Ok(())
        }

        fn nof_prb(&self) -> usize {
            6
        }

        async fn stats(&self) -> RfStats {
            RfStats::default()
        }
    }

    #[tokio::test]
    async fn test_reorders_by_tick() {
        let rf = Arc::new(RecordingRf::default());
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(TxSequencer::new(rf.clone(), rx, 10).run());

        for tick in [12u64, 10, 13, 11] {
            let grid = (tick == 12).then(|| SubframeGrid::new(6, tick));
            tx.send(TxRequest { tick, grid }).await.unwrap();
        }
        drop(tx);

        assert_eq!(handle.await.unwrap().unwrap(), 4);
        let sent = rf.sent.lock().await.clone();
        assert_eq!(sent, vec![(10, false), (11, false), (12, true), (13, false)]);
    }

    #[tokio::test]
    async fn test_gap_holds_back_later_ticks() {
        let rf = Arc::new(RecordingRf::default());
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(TxSequencer::new(rf.clone(), rx, 0).run());

        tx.send(TxRequest { tick: 1, grid: None }).await.unwrap();
        tx.send(TxRequest { tick: 2, grid: None }).await.unwrap();
        drop(tx);

        assert_eq!(handle.await.unwrap().unwrap(), 0);
        assert!(rf.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_late_request_dropped() {
        let rf = Arc::new(RecordingRf::default());
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(TxSequencer::new(rf.clone(), rx, 5).run());

        tx.send(TxRequest { tick: 5, grid: None }).await.unwrap();
        tx.send(TxRequest { tick: 3, grid: Some(SubframeGrid::new(6, 3)) }).await.unwrap();
        tx.send(TxRequest { tick: 6, grid: None }).await.unwrap();
        drop(tx);

        assert_eq!(handle.await.unwrap().unwrap(), 2);
        assert_eq!(*rf.sent.lock().await, vec![(5, false), (6, false)]);
    }
}
