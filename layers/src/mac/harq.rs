//! Downlink/sidelink HARQ entity (3GPP TS 36.321 Section 5.3.2)
//!
//! Eight HARQ processes plus a dedicated broadcast process, each with one
//! sub-process per transport block. Sidelink grants carry no toggling NDI:
//! the SCI retransmission index says directly whether a grant starts a new
//! transport block, and the process id is derived from the slot of the
//! initial transmission so both generations land on the same process.

use super::demux::{PayloadAllocator, PayloadBuffer, PduDemux};
use crate::phy::sci::SciMessage;
use crate::phy::softbuffer::{SharedSoftBuffer, SoftBuffer};
use crate::LayerError;
use bytes::Bytes;
use common::types::{Rnti, Tti};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Number of HARQ processes
pub const MAX_HARQ_PROC: usize = 8;

/// Transport blocks per grant
pub const MAX_TB: usize = 2;

/// Placeholder RNTI of sidelink grants
pub const SL_RNTI: Rnti = Rnti(0xFFFE);

/// Addressing of a grant, selecting NDI interpretation and delivery path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantKind {
    /// System information on the broadcast process
    Broadcast,
    Unicast,
    /// Addressed to the temporary C-RNTI during random access
    TemporaryCrnti(Rnti),
    /// Sidelink shared channel
    Sidelink,
}

/// Per transport block part of a grant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TbGrant {
    pub enabled: bool,
    /// Transport block size in bits
    pub tbs: u32,
    /// New data indicator; for sidelink set on new transport blocks
    pub ndi: bool,
    pub rv: u8,
}

/// Reception grant handed from PHY to MAC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlGrant {
    pub pid: u32,
    pub rnti: Rnti,
    pub kind: GrantKind,
    pub tti: Tti,
    /// Pool slot ordinal (sidelink)
    pub slot: u32,
    /// Slots to the announced retransmission (sidelink)
    pub time_gap: u32,
    /// Slot ordinals per pool period, 0 when slots do not wrap
    pub nof_slots: u32,
    pub tb: [TbGrant; MAX_TB],
}

impl DlGrant {
    /// Grant for the PSSCH announced by `msg` in pool slot `slot` of a pool
    /// with `nof_slots` slots per period
    pub fn from_sci(msg: &SciMessage, tti: Tti, slot: u32, nof_slots: u32) -> Self {
        let pid = msg.initial_slot(slot, nof_slots) % MAX_HARQ_PROC as u32;

        let mut tb = [TbGrant::default(); MAX_TB];
        tb[0] = TbGrant {
            enabled: true,
            tbs: msg.mcs.tbs,
            ndi: !msg.is_retransmission(),
            rv: msg.rv(),
        };

        Self {
            pid,
            rnti: SL_RNTI,
            kind: GrantKind::Sidelink,
            tti,
            slot,
            time_gap: msg.time_gap as u32,
            nof_slots,
            tb,
        }
    }

    /// Slot the announced retransmission falls on
    pub fn retx_slot(&self) -> u32 {
        match self.nof_slots {
            0 => self.slot + self.time_gap,
            n => (self.slot + self.time_gap) % n,
        }
    }
}

/// What the PHY is told to do with one transport block
#[derive(Debug, Clone, Default)]
pub struct TbAction {
    /// Combine and decode
    pub enabled: bool,
    pub rv: u8,
    pub tbs: u32,
    /// Soft buffer of the sub-process, lent for one decode
    pub softbuffer: Option<SharedSoftBuffer>,
    /// Already acknowledged; report success without decoding
    pub ack: bool,
}

/// Response to a grant
#[derive(Debug, Clone, Default)]
pub struct DlAction {
    pub pid: u32,
    pub tb: [TbAction; MAX_TB],
    pub generate_ack: bool,
}

/// HARQ tunables
#[derive(Debug, Clone, Copy)]
pub struct HarqConfig {
    /// Duplicates tolerated on an acknowledged process before it is reset
    pub duplicate_reset_threshold: u32,
    /// Soft buffer capacity in bits
    pub max_tbs: u32,
}

impl Default for HarqConfig {
    fn default() -> Self {
        Self {
            duplicate_reset_threshold: 6,
            max_tbs: 40_000,
        }
    }
}

/// Sub-process life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TbState {
    Empty,
    AwaitingDecode,
    DecodedOk,
    DecodedKo,
}

/// Outcome of a decode report on one sub-process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TbReport {
    ack: bool,
    /// Transmissions it took, when a unicast or sidelink PDU was delivered
    delivered_after: Option<u32>,
}

/// Allocator and demux shared by all processes
struct HarqContext {
    allocator: Arc<dyn PayloadAllocator>,
    demux: Arc<dyn PduDemux>,
    config: HarqConfig,
}

/// HARQ state of one transport block
pub struct TbSubProcess {
    pid: u32,
    tid: usize,
    is_bcch: bool,
    state: TbState,
    softbuffer: SharedSoftBuffer,
    payload: Option<PayloadBuffer>,
    cur_grant: Option<DlGrant>,
    is_first_tb: bool,
    is_new_transmission: bool,
    ack: bool,
    n_retx: u32,
}

impl TbSubProcess {
    fn new(pid: u32, tid: usize, is_bcch: bool, max_tbs: u32) -> Self {
        Self {
            pid,
            tid,
            is_bcch,
            state: TbState::Empty,
            softbuffer: SoftBuffer::shared(max_tbs),
            payload: None,
            cur_grant: None,
            is_first_tb: true,
            is_new_transmission: false,
            ack: false,
            n_retx: 0,
        }
    }

    pub fn state(&self) -> TbState {
        self.state
    }

    pub fn n_retx(&self) -> u32 {
        self.n_retx
    }

    pub fn softbuffer(&self) -> &SharedSoftBuffer {
        &self.softbuffer
    }

    fn reset_softbuffer(&self, tbs: Option<u32>) -> Result<(), LayerError> {
        let mut sb = self
            .softbuffer
            .lock()
            .map_err(|_| LayerError::InvalidState("soft buffer lock poisoned".into()))?;
        match tbs {
            Some(tbs) => sb.reset_tbs(tbs),
            None => {
                sb.reset();
                Ok(())
            }
        }
    }

    fn reset(&mut self, ctx: &HarqContext) {
        self.cur_grant = None;
        self.is_first_tb = true;
        self.ack = false;
        self.n_retx = 0;
        self.state = TbState::Empty;
        if let Some(buffer) = self.payload.take() {
            ctx.allocator.deallocate(buffer);
        }
        if let Err(e) = self.reset_softbuffer(None) {
            error!("HARQ {} TB{}: {}", self.pid, self.tid, e);
        }
    }

    fn reset_ndi(&mut self) {
        self.is_first_tb = true;
    }

    fn calc_is_new_transmission(&self, grant: &DlGrant) -> bool {
        let tb = &grant.tb[self.tid];
        match grant.kind {
            GrantKind::Sidelink => tb.ndi,
            _ => {
                let toggled = self.cur_grant.map_or(false, |cur| cur.tb[self.tid].ndi != tb.ndi);
                toggled || (self.is_bcch && tb.rv == 0) || self.is_first_tb
            }
        }
    }

    fn new_grant(&mut self, grant: &DlGrant, ctx: &HarqContext) -> TbAction {
        let tb = grant.tb[self.tid];

        self.is_new_transmission = self.calc_is_new_transmission(grant);
        if grant.kind != GrantKind::Sidelink {
            self.is_first_tb = false;
        }

        let cur_tbs = self.cur_grant.map(|cur| cur.tb[self.tid].tbs);
        let mut restart = self.is_new_transmission;
        if !restart {
            match cur_tbs {
                Some(cur) if cur != tb.tbs => {
                    warn!(
                        "HARQ {} TB{}: size changed during a retransmission {} != {}",
                        self.pid, self.tid, cur, tb.tbs
                    );
                    restart = true;
                }
                None => restart = true,
                Some(_) => {}
            }
        }

        // A sidelink retransmission must follow its initial transmission by the announced gap
        if !self.is_new_transmission && grant.kind == GrantKind::Sidelink {
            let expected = self.cur_grant.map(|cur| cur.retx_slot());
            if expected != Some(grant.slot) {
                debug!(
                    "HARQ {}: retransmission in slot {} unrelated to previous grant (expected {:?}), resetting",
                    self.pid, grant.slot, expected
                );
                restart = true;
            }
        }

        if restart {
            self.ack = false;
            self.n_retx = 0;
            if let Err(e) = self.reset_softbuffer(Some(tb.tbs)) {
                error!("HARQ {} TB{}: {}", self.pid, self.tid, e);
                return TbAction::default();
            }
        }

        self.n_retx += 1;

        if self.ack {
            warn!(
                "HARQ {} TB{}: duplicate transport block, re-acknowledging (n_retx={}, reset={})",
                self.pid,
                self.tid,
                self.n_retx,
                self.n_retx > ctx.config.duplicate_reset_threshold
            );
            let action = TbAction { ack: true, ..Default::default() };
            if self.n_retx > ctx.config.duplicate_reset_threshold {
                self.reset(ctx);
            }
            return action;
        }

        self.cur_grant = Some(*grant);

        if let Some(stale) = self.payload.take() {
            warn!("HARQ {} TB{}: payload buffer already allocated, deallocating", self.pid, self.tid);
            ctx.allocator.deallocate(stale);
        }

        let size = (tb.tbs / 8) as usize;
        self.payload = if self.is_bcch {
            ctx.allocator.request_broadcast(size)
        } else {
            ctx.allocator.request(size)
        };
        if self.payload.is_none() {
            warn!("HARQ {} TB{}: no payload buffer for TBS {}", self.pid, self.tid, tb.tbs);
            self.state = TbState::Empty;
            return TbAction::default();
        }

        self.state = TbState::AwaitingDecode;
        TbAction {
            enabled: true,
            rv: tb.rv,
            tbs: tb.tbs,
            softbuffer: Some(self.softbuffer.clone()),
            ack: false,
        }
    }

    fn tb_decoded(&mut self, ack: bool, data: Option<&[u8]>, ctx: &HarqContext) -> TbReport {
        let mut report = TbReport { ack, delivered_after: None };
        let Some(mut buffer) = self.payload.take() else {
            return report;
        };
        let Some(grant) = self.cur_grant else {
            ctx.allocator.deallocate(buffer);
            return report;
        };

        let mut ack = ack;
        if ack {
            match data.map(|d| buffer.write(d)) {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    warn!("HARQ {} TB{}: {}", self.pid, self.tid, e);
                    ack = false;
                }
                None => {
                    warn!("HARQ {} TB{}: acknowledged without data", self.pid, self.tid);
                    ack = false;
                }
            }
        }

        if ack {
            let kind = if self.is_bcch { GrantKind::Broadcast } else { grant.kind };
            debug!("HARQ {} TB{}: delivering {} bytes ({:?})", self.pid, self.tid, buffer.len(), kind);
            match kind {
                GrantKind::TemporaryCrnti(_) => {
                    ack = ctx.demux.push(kind, buffer);
                }
                GrantKind::Broadcast => {
                    ctx.demux.push(kind, buffer);
                }
                GrantKind::Sidelink | GrantKind::Unicast => {
                    ctx.demux.push(kind, buffer);
                    report.delivered_after = Some(self.n_retx);
                }
            }
        } else {
            ctx.allocator.deallocate(buffer);
        }

        self.ack = ack;
        self.state = if ack { TbState::DecodedOk } else { TbState::DecodedKo };
        report.ack = ack;

        info!(
            "HARQ {} (TB {}): {} tbs={} rv={} ack={} n_retx={}",
            self.pid,
            self.tid,
            if self.is_new_transmission { "newTX" } else { "reTX " },
            grant.tb[self.tid].tbs,
            grant.tb[self.tid].rv,
            if ack { "OK" } else { "KO" },
            self.n_retx
        );

        if ack && self.is_bcch {
            self.reset(ctx);
        }
        report
    }
}

/// One HARQ process: a sub-process per transport block
pub struct HarqProcess {
    pid: u32,
    subproc: [Mutex<TbSubProcess>; MAX_TB],
}

impl HarqProcess {
    fn new(pid: u32, is_bcch: bool, max_tbs: u32) -> Self {
        Self {
            pid,
            subproc: std::array::from_fn(|tid| Mutex::new(TbSubProcess::new(pid, tid, is_bcch, max_tbs))),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Sub-process of transport block `tid`
    pub fn subprocess(&self, tid: usize) -> Option<&Mutex<TbSubProcess>> {
        self.subproc.get(tid)
    }

    async fn new_grant(&self, grant: &DlGrant, ctx: &HarqContext) -> DlAction {
        let mut action = DlAction { pid: grant.pid, ..Default::default() };
        for (tid, sub) in self.subproc.iter().enumerate() {
            if grant.tb[tid].enabled && grant.tb[tid].tbs > 0 {
                action.tb[tid] = sub.lock().await.new_grant(grant, ctx);
            }
        }
        action
    }

    async fn reset(&self, ctx: &HarqContext) {
        for sub in &self.subproc {
            sub.lock().await.reset(ctx);
        }
    }

    async fn reset_ndi(&self) {
        for sub in &self.subproc {
            sub.lock().await.reset_ndi();
        }
    }
}

#[derive(Debug, Default)]
struct RetxAverage {
    average: f32,
    nof_pkts: u64,
}

/// HARQ entity receiving grants and decode results from the PHY
pub struct DlHarqEntity {
    procs: Vec<HarqProcess>,
    bcch: HarqProcess,
    ctx: HarqContext,
    last_temporal_crnti: Mutex<Option<Rnti>>,
    retx: Mutex<RetxAverage>,
}

impl DlHarqEntity {
    pub fn new(config: HarqConfig, allocator: Arc<dyn PayloadAllocator>, demux: Arc<dyn PduDemux>) -> Self {
        Self {
            procs: (0..MAX_HARQ_PROC as u32).map(|pid| HarqProcess::new(pid, false, config.max_tbs)).collect(),
            bcch: HarqProcess::new(0, true, config.max_tbs),
            ctx: HarqContext { allocator, demux, config },
            last_temporal_crnti: Mutex::new(None),
            retx: Mutex::new(RetxAverage::default()),
        }
    }

    fn process(&self, grant: &DlGrant) -> Option<&HarqProcess> {
        if grant.kind == GrantKind::Broadcast {
            return Some(&self.bcch);
        }
        let pid = if grant.kind == GrantKind::Sidelink {
            grant.pid % MAX_HARQ_PROC as u32
        } else {
            grant.pid
        };
        let process = self.procs.get(pid as usize);
        if process.is_none() {
            error!("Invalid PID: {}", grant.pid);
        }
        process
    }

    /// Process `pid` (broadcast process when `None`)
    pub fn harq_process(&self, pid: Option<u32>) -> Option<&HarqProcess> {
        match pid {
            Some(pid) => self.procs.get(pid as usize),
            None => Some(&self.bcch),
        }
    }

    /// Decide how the PHY handles the transport blocks of `grant`
    pub async fn new_grant(&self, grant: DlGrant) -> DlAction {
        let Some(process) = self.process(&grant) else {
            return DlAction { pid: grant.pid, ..Default::default() };
        };

        if let GrantKind::TemporaryCrnti(rnti) = grant.kind {
            let mut last = self.last_temporal_crnti.lock().await;
            if *last != Some(rnti) {
                *last = Some(rnti);
                process.reset_ndi().await;
                info!("Considering NDI in pid={} toggled for first temporary C-RNTI", grant.pid);
            }
        }

        let mut action = process.new_grant(&grant, &self.ctx).await;
        action.generate_ack = grant.kind != GrantKind::Broadcast;
        action
    }

    /// Report the decode result of transport block `tid`; returns the final ack
    pub async fn tb_decoded(&self, grant: &DlGrant, tid: usize, ack: bool, data: Option<Bytes>) -> bool {
        let Some(process) = self.process(grant) else {
            return false;
        };
        let Some(sub) = process.subprocess(tid) else {
            error!("Invalid TB index {}", tid);
            return false;
        };

        let report = sub.lock().await.tb_decoded(ack, data.as_deref(), &self.ctx);

        if let Some(n_retx) = report.delivered_after {
            let mut retx = self.retx.lock().await;
            retx.nof_pkts += 1;
            retx.average += (n_retx as f32 - retx.average) / retx.nof_pkts as f32;
        }
        report.ack
    }

    /// Reset every process
    pub async fn reset(&self) {
        for process in &self.procs {
            process.reset(&self.ctx).await;
        }
        self.bcch.reset(&self.ctx).await;
        *self.last_temporal_crnti.lock().await = None;
    }

    /// Moving average of transmissions per delivered transport block
    pub async fn average_retx(&self) -> f32 {
        self.retx.lock().await.average
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::demux::BufferPool;
    use crate::phy::mcs::McsDescriptor;
    use common::types::ModulationScheme;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingDemux {
        pushed: StdMutex<Vec<(GrantKind, Bytes)>>,
        contention_result: bool,
    }

    impl PduDemux for RecordingDemux {
        fn push(&self, kind: GrantKind, buffer: PayloadBuffer) -> bool {
            self.pushed.lock().unwrap().push((kind, buffer.freeze()));
            match kind {
                GrantKind::TemporaryCrnti(_) => self.contention_result,
                _ => true,
            }
        }
    }

    fn entity_with(config: HarqConfig, pool: Arc<BufferPool>) -> (DlHarqEntity, Arc<RecordingDemux>) {
        let demux = Arc::new(RecordingDemux::default());
        (DlHarqEntity::new(config, pool, demux.clone()), demux)
    }

    fn entity() -> (DlHarqEntity, Arc<RecordingDemux>, Arc<BufferPool>) {
        let pool = Arc::new(BufferPool::new(16, 10_000));
        let (entity, demux) = entity_with(HarqConfig::default(), pool.clone());
        (entity, demux, pool)
    }

    /// Slots per period of the default pool
    const POOL_SLOTS: u32 = 4090;

    fn sci(rti: u8, time_gap: u8, tbs: u32) -> SciMessage {
        SciMessage {
            priority: 0,
            resource_reservation: 0,
            num_subchannels: 2,
            start_subchannel: 0,
            time_gap,
            rti,
            mcs: McsDescriptor { idx: 7, modulation: ModulationScheme::Qpsk, tbs },
        }
    }

    fn mark(action: &TbAction, value: f32) {
        let sb = action.softbuffer.as_ref().unwrap();
        sb.lock().unwrap().llr_mut()[0] = value;
    }

    fn marker(action: &TbAction) -> f32 {
        action.softbuffer.as_ref().unwrap().lock().unwrap().llr()[0]
    }

    #[test]
    fn test_pid_from_sci() {
        assert_eq!(DlGrant::from_sci(&sci(0, 5, 888), Tti(0), 10, POOL_SLOTS).pid, 2);
        assert_eq!(DlGrant::from_sci(&sci(1, 5, 888), Tti(0), 15, POOL_SLOTS).pid, 2);
        // Initial transmission in the previous pool period: slot 4088
        assert_eq!(DlGrant::from_sci(&sci(1, 5, 888), Tti(0), 3, POOL_SLOTS).pid, 0);
        assert_eq!(DlGrant::from_sci(&sci(0, 5, 888), Tti(0), 4088, POOL_SLOTS).pid, 0);
        let grant = DlGrant::from_sci(&sci(1, 5, 888), Tti(0), 15, POOL_SLOTS);
        assert!(!grant.tb[0].ndi);
        assert_eq!(grant.tb[0].rv, 2);
        assert!(!grant.tb[1].enabled);
    }

    #[tokio::test]
    async fn test_two_generations_one_delivery() {
        let (entity, demux, pool) = entity();

        let first = DlGrant::from_sci(&sci(0, 5, 888), Tti(20), 10, POOL_SLOTS);
        let action = entity.new_grant(first).await;
        assert_eq!(action.pid, 2);
        assert!(action.tb[0].enabled);
        assert!(!action.tb[1].enabled);
        mark(&action.tb[0], 3.0);
        assert!(!entity.tb_decoded(&first, 0, false, None).await);
        assert_eq!(pool.in_use(), 0);

        let second = DlGrant::from_sci(&sci(1, 5, 888), Tti(30), 15, POOL_SLOTS);
        let retx = entity.new_grant(second).await;
        assert_eq!(retx.pid, 2);
        assert!(retx.tb[0].enabled);
        assert!(Arc::ptr_eq(
            action.tb[0].softbuffer.as_ref().unwrap(),
            retx.tb[0].softbuffer.as_ref().unwrap()
        ));
        // Same soft buffer life cycle: content kept across generations
        assert_eq!(marker(&retx.tb[0]), 3.0);

        let tb = Bytes::from(vec![0xAB; 111]);
        assert!(entity.tb_decoded(&second, 0, true, Some(tb.clone())).await);

        let pushed = demux.pushed.lock().unwrap().clone();
        assert_eq!(pushed, vec![(GrantKind::Sidelink, tb)]);
        assert_eq!(entity.average_retx().await, 2.0);

        let state = entity.harq_process(Some(2)).unwrap().subprocess(0).unwrap().lock().await.state();
        assert_eq!(state, TbState::DecodedOk);
    }

    #[tokio::test]
    async fn test_second_generation_after_success_is_duplicate() {
        let (entity, demux, pool) = entity();

        let first = DlGrant::from_sci(&sci(0, 5, 888), Tti(20), 10, POOL_SLOTS);
        assert!(entity.new_grant(first).await.tb[0].enabled);
        assert!(entity.tb_decoded(&first, 0, true, Some(Bytes::from(vec![1; 111]))).await);

        let second = DlGrant::from_sci(&sci(1, 5, 888), Tti(30), 15, POOL_SLOTS);
        let dup = entity.new_grant(second).await;
        assert!(!dup.tb[0].enabled);
        assert!(dup.tb[0].ack);
        assert_eq!(demux.pushed.lock().unwrap().len(), 1);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(entity.average_retx().await, 1.0);
    }

    #[tokio::test]
    async fn test_generations_across_pool_period() {
        let (entity, demux, _) = entity();

        // Slot 4085 + 5 wraps to slot 0 of the next period
        let first = DlGrant::from_sci(&sci(0, 5, 888), Tti(10228), 4085, POOL_SLOTS);
        let second = DlGrant::from_sci(&sci(1, 5, 888), Tti(2), 0, POOL_SLOTS);
        assert_eq!(first.retx_slot(), 0);
        assert_eq!(first.pid, second.pid);

        let action = entity.new_grant(first).await;
        mark(&action.tb[0], 3.0);
        assert!(!entity.tb_decoded(&first, 0, false, None).await);
        let retx = entity.new_grant(second).await;
        assert!(retx.tb[0].enabled);
        assert_eq!(marker(&retx.tb[0]), 3.0);

        // Decoded on the first generation: the repetition is a duplicate
        let third = DlGrant::from_sci(&sci(0, 5, 888), Tti(10233), 4087, POOL_SLOTS);
        let fourth = DlGrant::from_sci(&sci(1, 5, 888), Tti(7), 2, POOL_SLOTS);
        assert_eq!(third.pid, fourth.pid);
        assert!(entity.new_grant(third).await.tb[0].enabled);
        assert!(entity.tb_decoded(&third, 0, true, Some(Bytes::from(vec![2; 111]))).await);
        let dup = entity.new_grant(fourth).await;
        assert!(dup.tb[0].ack);
        assert!(!dup.tb[0].enabled);
        assert_eq!(demux.pushed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unrelated_retransmission_resets() {
        let (entity, demux, _) = entity();

        let first = DlGrant::from_sci(&sci(0, 5, 888), Tti(20), 10, POOL_SLOTS);
        let action = entity.new_grant(first).await;
        mark(&action.tb[0], 3.0);
        entity.tb_decoded(&first, 0, false, None).await;

        // Retransmission mapping to pid 2 but not 5 slots after slot 10
        let stray = DlGrant::from_sci(&sci(1, 5, 888), Tti(40), 23, POOL_SLOTS);
        assert_eq!(stray.pid, 2);
        let retx = entity.new_grant(stray).await;
        assert!(retx.tb[0].enabled);
        assert_eq!(marker(&retx.tb[0]), 0.0);

        let sub = entity.harq_process(Some(2)).unwrap().subprocess(0).unwrap().lock().await;
        assert_eq!(sub.n_retx(), 1);
        assert!(demux.pushed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tbs_change_resets() {
        let (entity, _, _) = entity();
        let first = DlGrant::from_sci(&sci(0, 5, 888), Tti(20), 10, POOL_SLOTS);
        let action = entity.new_grant(first).await;
        mark(&action.tb[0], 3.0);
        entity.tb_decoded(&first, 0, false, None).await;

        let resized = DlGrant::from_sci(&sci(1, 5, 1024), Tti(30), 15, POOL_SLOTS);
        let retx = entity.new_grant(resized).await;
        assert_eq!(retx.tb[0].tbs, 1024);
        let sb = retx.tb[0].softbuffer.as_ref().unwrap().lock().unwrap();
        assert_eq!(sb.tbs(), 1024);
        assert!(sb.is_clear());
    }

    #[tokio::test]
    async fn test_duplicate_threshold() {
        let pool = Arc::new(BufferPool::new(4, 1000));
        let config = HarqConfig { duplicate_reset_threshold: 2, ..Default::default() };
        let (entity, _) = entity_with(config, pool);

        let mut tb = [TbGrant::default(); MAX_TB];
        tb[0] = TbGrant { enabled: true, tbs: 800, ndi: true, rv: 0 };
        let grant = DlGrant {
            pid: 0,
            rnti: Rnti::new(0x100),
            kind: GrantKind::Unicast,
            tti: Tti(0),
            slot: 0,
            time_gap: 0,
            nof_slots: 0,
            tb,
        };
        entity.new_grant(grant).await;
        assert!(entity.tb_decoded(&grant, 0, true, Some(Bytes::from(vec![1; 100]))).await);

        // n_retx 2: re-acknowledged
        let dup = entity.new_grant(grant).await;
        assert!(dup.tb[0].ack && !dup.tb[0].enabled);

        // n_retx 3 exceeds the threshold: re-acknowledged once more, then reset
        let dup = entity.new_grant(grant).await;
        assert!(dup.tb[0].ack);
        {
            let sub = entity.harq_process(Some(0)).unwrap().subprocess(0).unwrap().lock().await;
            assert_eq!(sub.state(), TbState::Empty);
            assert_eq!(sub.n_retx(), 0);
        }

        // After the reset the next copy is decoded again
        assert!(entity.new_grant(grant).await.tb[0].enabled);
    }

    #[tokio::test]
    async fn test_invalid_pid_dropped() {
        let (entity, demux, _) = entity();
        let mut grant = DlGrant::from_sci(&sci(0, 5, 888), Tti(0), 0, POOL_SLOTS);
        grant.kind = GrantKind::Unicast;
        grant.pid = 9;
        let action = entity.new_grant(grant).await;
        assert!(!action.tb[0].enabled);
        assert!(!entity.tb_decoded(&grant, 0, true, Some(Bytes::from_static(b"x"))).await);
        assert!(demux.pushed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_allocator_exhaustion() {
        let pool = Arc::new(BufferPool::new(1, 1000));
        let (entity, _) = entity_with(HarqConfig::default(), pool.clone());

        let a = entity.new_grant(DlGrant::from_sci(&sci(0, 5, 800), Tti(0), 0, POOL_SLOTS)).await;
        assert!(a.tb[0].enabled);
        let b = entity.new_grant(DlGrant::from_sci(&sci(0, 5, 800), Tti(0), 1, POOL_SLOTS)).await;
        assert!(!b.tb[0].enabled);
        assert_eq!(pool.in_use(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_process() {
        let (entity, demux, pool) = entity();
        let mut tb = [TbGrant::default(); MAX_TB];
        tb[0] = TbGrant { enabled: true, tbs: 256, ndi: false, rv: 0 };
        let grant = DlGrant {
            pid: 5,
            rnti: Rnti::SI,
            kind: GrantKind::Broadcast,
            tti: Tti(5),
            slot: 0,
            time_gap: 0,
            nof_slots: 0,
            tb,
        };

        let action = entity.new_grant(grant).await;
        assert!(action.tb[0].enabled);
        assert!(!action.generate_ack);
        assert!(entity.tb_decoded(&grant, 0, true, Some(Bytes::from(vec![7; 32]))).await);
        assert_eq!(demux.pushed.lock().unwrap()[0].0, GrantKind::Broadcast);

        // Reset after delivery: the next copy is decoded again
        let sub = entity.harq_process(None).unwrap().subprocess(0).unwrap().lock().await;
        assert_eq!(sub.state(), TbState::Empty);
        drop(sub);
        assert_eq!(pool.in_use(), 0);
        let mut rv1 = grant;
        rv1.tb[0].rv = 1;
        assert!(entity.new_grant(rv1).await.tb[0].enabled);
    }

    #[tokio::test]
    async fn test_temporary_crnti_ack_follows_contention() {
        let pool = Arc::new(BufferPool::new(4, 1000));
        let demux = Arc::new(RecordingDemux { contention_result: false, ..Default::default() });
        let entity = DlHarqEntity::new(HarqConfig::default(), pool, demux.clone());

        let mut tb = [TbGrant::default(); MAX_TB];
        tb[0] = TbGrant { enabled: true, tbs: 64, ndi: true, rv: 0 };
        let grant = DlGrant {
            pid: 1,
            rnti: Rnti::new(0x4601),
            kind: GrantKind::TemporaryCrnti(Rnti::new(0x4601)),
            tti: Tti(0),
            slot: 0,
            time_gap: 0,
            nof_slots: 0,
            tb,
        };

        assert!(entity.new_grant(grant).await.tb[0].enabled);
        assert!(!entity.tb_decoded(&grant, 0, true, Some(Bytes::from(vec![0; 8]))).await);
        assert_eq!(demux.pushed.lock().unwrap().len(), 1);
        // Not acknowledged: the same NDI is still decoded as a retransmission
        assert!(entity.new_grant(grant).await.tb[0].enabled);
    }

    #[tokio::test]
    async fn test_unicast_ndi_toggle() {
        let (entity, _, _) = entity();
        let mut tb = [TbGrant::default(); MAX_TB];
        tb[0] = TbGrant { enabled: true, tbs: 64, ndi: false, rv: 0 };
        let grant = DlGrant {
            pid: 3,
            rnti: Rnti::new(0x100),
            kind: GrantKind::Unicast,
            tti: Tti(0),
            slot: 0,
            time_gap: 0,
            nof_slots: 0,
            tb,
        };

        entity.new_grant(grant).await;
        assert!(entity.tb_decoded(&grant, 0, true, Some(Bytes::from(vec![1; 8]))).await);

        // Same NDI: duplicate
        assert!(entity.new_grant(grant).await.tb[0].ack);

        // Toggled NDI: new transport block
        let mut toggled = grant;
        toggled.tb[0].ndi = true;
        let action = entity.new_grant(toggled).await;
        assert!(action.tb[0].enabled);
        assert!(!action.tb[0].ack);
    }

    #[tokio::test]
    async fn test_entity_reset() {
        let (entity, _, pool) = entity();
        let grant = DlGrant::from_sci(&sci(0, 5, 800), Tti(0), 4, POOL_SLOTS);
        entity.new_grant(grant).await;
        assert_eq!(pool.in_use(), 1);
        entity.reset().await;
        assert_eq!(pool.in_use(), 0);
        let sub = entity.harq_process(Some(4)).unwrap().subprocess(0).unwrap().lock().await;
        assert_eq!(sub.state(), TbState::Empty);
    }
}
