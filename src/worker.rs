//! 세그먼트별 동기화 워커
//!
//! 워커 하나가 binlog 파일 하나를 맡아 다음을 반복합니다.
//! 1. 커밋된 오프셋 확인
//! 2. Admission Token 획득 시도 (실패하면 이번 회차는 건너뜀)
//! 3. 디코더 실행, 출력 줄마다 레코드 emit 및 오프셋 전진
//! 4. 토큰 반환
//! 5. 토큰을 잡고 정상 종료했는데 emit 이 0건이면 따라잡은 것으로 보고 비활성화
//! 6. 여전히 활성이면 대기 후 반복, 아니면 담당 해제 후 종료

use crate::admission::{AdmissionToken, WorkerId};
use crate::decoder::{parse_line, DecodeFilter, DecodeRequest, StatementDecoder};
use crate::error::{CdcError, Result};
use crate::events::{RecordSink, SyncRecord, TaggedRecord};
use crate::offset::OffsetLedger;
use crate::segment::SegmentTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// 워커들이 공유하는 상태와 협력자
pub struct WorkerContext {
    pub table: Arc<SegmentTable>,
    pub token: Arc<AdmissionToken>,
    pub ledger: Arc<OffsetLedger>,
    pub decoder: Arc<dyn StatementDecoder>,
    pub sink: Arc<dyn RecordSink>,
    pub tag: String,
    pub interval: Duration,
    pub filter: DecodeFilter,
}

/// 워커 종료 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// 세그먼트가 비활성화되어 정상 종료
    Retired,
    /// 종료 신호 수신
    Cancelled,
    /// 세그먼트가 테이블에서 제거됨
    Removed,
}

/// 한 회차 결과
#[derive(Debug)]
enum Iteration {
    /// 다른 워커가 토큰을 보유 중
    Busy,
    /// 디코더 실행 완료, emit 건수
    Synced(usize),
    Failed(CdcError),
    Cancelled,
}

pub struct SyncWorker {
    id: WorkerId,
    segment: String,
    ctx: Arc<WorkerContext>,
    shutdown: watch::Receiver<bool>,
}

impl SyncWorker {
    pub fn new(
        id: WorkerId,
        segment: impl Into<String>,
        ctx: Arc<WorkerContext>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        SyncWorker {
            id,
            segment: segment.into(),
            ctx,
            shutdown,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// 워커 실행. 종료 사유 반환
    pub async fn run(mut self) -> WorkerExit {
        let table = self.ctx.table.clone();
        info!(
            "[sync start] binlog: {}, offset: {:?}, {}",
            self.segment,
            table.committed_offset(&self.segment),
            self.id
        );

        loop {
            if self.is_cancelled() {
                return self.cancel();
            }

            let Some(offset) = table.committed_offset(&self.segment) else {
                info!("binlog {} removed from table, {} exiting", self.segment, self.id);
                return WorkerExit::Removed;
            };

            match self.run_iteration(offset).await {
                Iteration::Busy => {
                    debug!("{} waiting for admission token ({})", self.id, self.segment);
                }
                Iteration::Synced(0) => {
                    // 새로 읽을 내용이 없음
                    table.deactivate(&self.segment);
                }
                Iteration::Synced(emitted) => {
                    debug!(
                        "{} emitted {} records from {}, offset now {:?}",
                        self.id,
                        emitted,
                        self.segment,
                        table.committed_offset(&self.segment)
                    );
                }
                Iteration::Failed(e) => {
                    error!("Error processing binlog {}: {}", self.segment, e);
                }
                Iteration::Cancelled => return self.cancel(),
            }

            if table.retire_if_inactive(&self.segment, self.id) {
                info!(
                    "[sync stop] binlog: {}, offset: {:?}, {}",
                    self.segment,
                    table.committed_offset(&self.segment),
                    self.id
                );
                return WorkerExit::Retired;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.ctx.interval) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return self.cancel();
                    }
                }
            }
        }
    }

    fn cancel(&self) -> WorkerExit {
        self.ctx.token.release(self.id);
        self.ctx.table.release_owner(&self.segment, self.id);
        debug!("{} cancelled ({})", self.id, self.segment);
        WorkerExit::Cancelled
    }

    async fn run_iteration(&mut self, offset: u64) -> Iteration {
        if !self.ctx.token.try_acquire(self.id) {
            return Iteration::Busy;
        }

        let result = self.sync_once(offset).await;
        self.ctx.token.release(self.id);
        result
    }

    async fn sync_once(&mut self, offset: u64) -> Iteration {
        let request = DecodeRequest {
            binlog_file: self.segment.clone(),
            start_offset: offset,
            filter: self.ctx.filter.clone(),
        };

        info!("{} syncing {} from {}", self.id, self.segment, offset);

        let mut lines = match self.ctx.decoder.decode(&request).await {
            Ok(lines) => lines,
            Err(e) => return Iteration::Failed(e),
        };

        let mut emitted = 0;
        loop {
            let item = tokio::select! {
                item = lines.recv() => item,
                _ = self.shutdown.changed() => return Iteration::Cancelled,
            };

            let line = match item {
                Some(Ok(line)) => line,
                Some(Err(e)) => return Iteration::Failed(e),
                None => break,
            };

            match self.handle_line(&line).await {
                Ok(true) => emitted += 1,
                Ok(false) => {}
                Err(e) => return Iteration::Failed(e),
            }
        }

        Iteration::Synced(emitted)
    }

    /// 출력 한 줄 처리. 레코드를 emit 했으면 `true`
    async fn handle_line(&self, line: &str) -> Result<bool> {
        let Some(statement) = parse_line(line)? else {
            return Ok(false);
        };

        let record = SyncRecord::new(statement.sql, self.segment.clone(), statement.end_offset);
        self.ctx
            .sink
            .emit(TaggedRecord::now(self.ctx.tag.clone(), record))
            .await?;

        if self.ctx.table.advance(&self.segment, statement.end_offset) {
            self.ctx.ledger.mark_dirty();
        }
        Ok(true)
    }
}
