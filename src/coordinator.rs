//! Binlog 동기화 코디네이터
//!
//! 코디네이터는 다음 루프를 돌립니다.
//! 1. 디스커버리: 주기적으로 `SHOW BINARY LOGS` 를 조회해 세그먼트 테이블에 병합
//! 2. 디스패처: 담당 워커가 없는 활성 세그먼트마다 워커 생성
//! 3. 저장: 주기적으로 오프셋 원장을 파일에 기록
//!
//! 종료 시 모든 워커를 멈추고 원장을 강제로 한 번 더 기록합니다.

use crate::admission::{AdmissionToken, WorkerIdAllocator};
use crate::config::SyncConfig;
use crate::connection::{MySqlConnection, SegmentSource};
use crate::decoder::{ProcessDecoder, StatementDecoder};
use crate::error::{CdcError, Result};
use crate::events::{ChannelSink, RecordReceiver, RecordSink};
use crate::offset::OffsetLedger;
use crate::segment::{ReconcileSummary, SegmentTable};
use crate::worker::{SyncWorker, WorkerContext, WorkerExit};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// 연속 저장 실패가 이 횟수에 이르면 운영자 경고
pub const MAX_CONSECUTIVE_FLUSH_FAILURES: u32 = 3;

/// 코디네이터 처리 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    /// 생성됨, 아직 시작 전
    Idle,
    /// 동기화 중
    Streaming,
    /// 중단됨
    Stopped,
}

struct CoordinatorInner {
    config: SyncConfig,
    ctx: Arc<WorkerContext>,
    source: Arc<dyn SegmentSource>,
    ids: WorkerIdAllocator,
    workers: Mutex<Vec<(String, JoinHandle<WorkerExit>)>>,
    shutdown: watch::Receiver<bool>,
}

impl CoordinatorInner {
    async fn discover_once(&self) -> Result<ReconcileSummary> {
        let listing = self.source.list_segments().await?;
        let now = Utc::now();
        let summary = self.ctx.table.reconcile(&listing, now);

        if self.config.gc_retired_segments {
            let removed = self.ctx.table.collect_garbage(now);
            if !removed.is_empty() {
                info!("Dropping retired binlog files: {:?}", removed);
                self.ctx.ledger.mark_dirty();
            }
        }

        debug!(
            "Discovery: {} listed, {} new, {} active",
            listing.len(),
            summary.discovered.len(),
            summary.active
        );
        Ok(summary)
    }

    fn dispatch_once(&self) -> usize {
        let mut workers = self.workers.lock();
        workers.retain(|(_, handle)| !handle.is_finished());

        let claimed = self.ctx.table.claim_idle(|| self.ids.allocate());
        for (segment, id) in &claimed {
            let worker = SyncWorker::new(*id, segment.clone(), self.ctx.clone(), self.shutdown.clone());
            workers.push((segment.clone(), tokio::spawn(worker.run())));
        }
        claimed.len()
    }

    fn persist_once(&self) -> Result<bool> {
        self.ctx.ledger.flush(|| self.ctx.table.offsets())
    }
}

/// Binlog 동기화 코디네이터
pub struct BinlogSyncCoordinator {
    inner: Arc<CoordinatorInner>,
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
    state: ProcessingState,
}

impl BinlogSyncCoordinator {
    /// 새 코디네이터 생성
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn SegmentSource>,
        decoder: Arc<dyn StatementDecoder>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        let config = config.normalized();
        let ctx = Arc::new(WorkerContext {
            table: Arc::new(SegmentTable::new()),
            token: Arc::new(AdmissionToken::new()),
            ledger: Arc::new(OffsetLedger::new(config.ledger_path.clone())),
            decoder,
            sink,
            tag: config.tag.clone(),
            interval: config.interval,
            filter: config.decode_filter(),
        });
        let (shutdown_tx, shutdown) = watch::channel(false);

        BinlogSyncCoordinator {
            inner: Arc::new(CoordinatorInner {
                config,
                ctx,
                source,
                ids: WorkerIdAllocator::new(),
                workers: Mutex::new(Vec::new()),
                shutdown,
            }),
            shutdown_tx,
            loops: Vec::new(),
            state: ProcessingState::Idle,
        }
    }

    /// MySQL 소스 + 외부 디코더 프로세스 + 채널 sink 로 구성
    pub fn with_mysql(config: SyncConfig) -> (Self, RecordReceiver) {
        let source = Arc::new(MySqlConnection::new(config.connection.clone()));
        let decoder = Arc::new(ProcessDecoder::new(
            config.decoder_program.clone(),
            config.connection.clone(),
        ));
        let (sink, rx) = ChannelSink::new();
        (Self::new(config, source, decoder, Arc::new(sink)), rx)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn table(&self) -> &Arc<SegmentTable> {
        &self.inner.ctx.table
    }

    pub fn token(&self) -> &Arc<AdmissionToken> {
        &self.inner.ctx.token
    }

    pub fn ledger(&self) -> &Arc<OffsetLedger> {
        &self.inner.ctx.ledger
    }

    pub fn state(&self) -> ProcessingState {
        self.state
    }

    /// 실행 중인 워커 수
    pub fn running_workers(&self) -> usize {
        self.inner
            .workers
            .lock()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    /// 원장 로드 후 디스커버리/디스패처/저장 루프 시작
    pub async fn start(&mut self) -> Result<()> {
        if self.state != ProcessingState::Idle {
            return Err(CdcError::Other(format!(
                "coordinator cannot start from state {:?}",
                self.state
            )));
        }

        info!("Starting binlog sync coordinator");

        let offsets = self.inner.ctx.ledger.load()?;
        self.inner.ctx.table.restore(&offsets);

        self.loops.push(tokio::spawn(run_discovery(self.inner.clone())));
        self.loops.push(tokio::spawn(run_dispatch(self.inner.clone())));
        self.loops.push(tokio::spawn(run_persistence(self.inner.clone())));

        self.state = ProcessingState::Streaming;
        info!(
            "Binlog sync coordinator started: {} segments restored, interval {:?}",
            offsets.len(),
            self.inner.config.interval
        );
        Ok(())
    }

    /// 디스커버리 1회 (루프 밖에서 직접 호출 가능)
    pub async fn discover_once(&self) -> Result<ReconcileSummary> {
        self.inner.discover_once().await
    }

    /// 디스패치 1회. 새로 띄운 워커 수 반환
    pub fn dispatch_once(&self) -> usize {
        self.inner.dispatch_once()
    }

    /// 원장 저장 1회. dirty 가 아니면 아무것도 하지 않음
    pub fn persist_once(&self) -> Result<bool> {
        self.inner.persist_once()
    }

    /// 모든 루프와 워커를 멈추고 원장 강제 저장
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.state == ProcessingState::Stopped {
            return Ok(());
        }
        info!("Stopping binlog sync coordinator");

        // 수신자가 모두 사라졌어도 상관없음
        let _ = self.shutdown_tx.send(true);

        for handle in self.loops.drain(..) {
            if let Err(e) = handle.await {
                warn!("Coordinator loop ended abnormally: {}", e);
            }
        }

        let workers: Vec<_> = self.inner.workers.lock().drain(..).collect();
        let deadline = Instant::now() + self.inner.config.shutdown_grace;
        for (segment, mut handle) in workers {
            match time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(exit)) => debug!("Worker for {} stopped: {:?}", segment, exit),
                Ok(Err(e)) => warn!("Worker for {} ended abnormally: {}", segment, e),
                Err(_) => {
                    warn!(
                        "Worker for {} did not stop within {:?}, aborting: {}",
                        segment,
                        self.inner.config.shutdown_grace,
                        CdcError::Timeout
                    );
                    handle.abort();
                }
            }
        }

        let inner = &self.inner;
        inner.ctx.ledger.force_flush(|| inner.ctx.table.offsets())?;

        self.state = ProcessingState::Stopped;
        info!("Binlog sync coordinator stopped");
        Ok(())
    }
}

/// 종료 신호 또는 다음 tick 까지 대기. 종료면 `false`
async fn wait_tick(ticker: &mut time::Interval, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = ticker.tick() => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

async fn run_discovery(inner: Arc<CoordinatorInner>) {
    let mut shutdown = inner.shutdown.clone();
    let mut ticker = time::interval(inner.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while wait_tick(&mut ticker, &mut shutdown).await {
        if let Err(e) = inner.discover_once().await {
            error!("Failed to list binlog files: {}", e);
        }
    }
    debug!("Discovery loop stopped");
}

async fn run_dispatch(inner: Arc<CoordinatorInner>) {
    let mut shutdown = inner.shutdown.clone();
    let mut ticker = time::interval(inner.config.dispatch_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while wait_tick(&mut ticker, &mut shutdown).await {
        let started = inner.dispatch_once();
        if started > 0 {
            debug!("Dispatched {} new workers", started);
        }
    }
    debug!("Dispatch loop stopped");
}

async fn run_persistence(inner: Arc<CoordinatorInner>) {
    let mut shutdown = inner.shutdown.clone();
    let period = inner.config.persist_interval;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut failures: u32 = 0;
    while wait_tick(&mut ticker, &mut shutdown).await {
        match inner.persist_once() {
            Ok(_) => {
                if failures > 0 {
                    info!("Ledger persistence recovered after {} failures", failures);
                }
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                if failures >= MAX_CONSECUTIVE_FLUSH_FAILURES {
                    error!(
                        "Ledger {} could not be written {} times in a row: {}",
                        inner.ctx.ledger.path().display(),
                        failures,
                        e
                    );
                } else {
                    warn!("Failed to persist ledger, will retry: {}", e);
                }
            }
        }
    }
    debug!("Persistence loop stopped");
}
