//! 재생(consumer) 측: 레코드를 타깃 DB 에 적용하고 진행 위치를 기록
//!
//! 배치마다 문장을 하나씩 실행하고(실패는 로그만 남기고 계속),
//! binlog 파일별 마지막 오프셋을 메모리에 기록한 뒤 원장 파일을 통째로 덮어씁니다.
//! 동기화 측과 달리 단조 증가 검사와 백업 파일이 없습니다.

use crate::connection::StatementExecutor;
use crate::coordinator::MAX_CONSECUTIVE_FLUSH_FAILURES;
use crate::error::Result;
use crate::events::{RecordReceiver, SyncRecord};
use crate::offset::{parse_ledger, read_if_exists, render_ledger, write_replace, OffsetMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 재생 측 오프셋 원장 (last-write-wins)
#[derive(Debug, Clone)]
pub struct ReplayLedger {
    path: PathBuf,
    offsets: OffsetMap,
}

impl ReplayLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ReplayLedger {
            path: path.into(),
            offsets: OffsetMap::new(),
        }
    }

    /// 이전 실행의 원장 읽기. 파일이 없으면 빈 원장
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let offsets = match read_if_exists(&path)? {
            Some(text) => parse_ledger(&text),
            None => {
                warn!(
                    "Replay ledger '{}' not found. Starting with empty offsets.",
                    path.display()
                );
                OffsetMap::new()
            }
        };
        Ok(ReplayLedger { path, offsets })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 무조건 덮어씀
    pub fn record(&mut self, binlog_file: &str, offset: u64) {
        self.offsets.insert(binlog_file.to_string(), offset);
    }

    pub fn offset(&self, binlog_file: &str) -> Option<u64> {
        self.offsets.get(binlog_file).copied()
    }

    pub fn offsets(&self) -> &OffsetMap {
        &self.offsets
    }

    /// 현재 맵 전체로 파일 덮어쓰기
    pub fn write(&self) -> Result<()> {
        write_replace(&self.path, &render_ledger(&self.offsets))
    }
}

/// 배치 처리 결과
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub applied: usize,
    pub failed: usize,
    /// `sql` 이 없어 건너뛴 레코드
    pub skipped: usize,
}

/// 레코드를 타깃 DB 에 적용
pub struct ReplayApplier {
    executor: Arc<dyn StatementExecutor>,
    ledger: ReplayLedger,
}

impl ReplayApplier {
    pub fn new(executor: Arc<dyn StatementExecutor>, ledger: ReplayLedger) -> Self {
        ReplayApplier { executor, ledger }
    }

    pub fn ledger(&self) -> &ReplayLedger {
        &self.ledger
    }

    /// 배치 적용 후 원장 기록
    pub async fn process_batch(&mut self, records: &[SyncRecord]) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        for record in records {
            self.apply(record, &mut summary).await;
        }
        self.finish_batch(summary)
    }

    /// 호스트 라우터가 넘겨준 원시 JSON 레코드 배치 적용
    ///
    /// 프로듀서가 준비되기 전에 흘러든 레코드처럼 `sql` 이 없는 것은 건너뜁니다.
    pub async fn process_values(&mut self, values: &[serde_json::Value]) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        for value in values {
            match SyncRecord::from_value(value) {
                Some(record) => self.apply(&record, &mut summary).await,
                None => {
                    debug!("Skipping record without sql: {}", value);
                    summary.skipped += 1;
                }
            }
        }
        self.finish_batch(summary)
    }

    /// 채널이 닫힐 때까지 레코드를 모아 배치 단위로 적용
    ///
    /// 원장 쓰기에 실패해도 멈추지 않습니다. 메모리의 위치는 유지되고
    /// 다음 배치에서 다시 기록합니다.
    pub async fn run(&mut self, mut rx: RecordReceiver, max_batch: usize) -> Result<()> {
        let max_batch = max_batch.max(1);
        let mut batch = Vec::with_capacity(max_batch);
        let mut failures: u32 = 0;

        while let Some(first) = rx.recv().await {
            batch.push(first.record);
            while batch.len() < max_batch {
                match rx.try_recv() {
                    Ok(next) => batch.push(next.record),
                    Err(_) => break,
                }
            }

            match self.process_batch(&batch).await {
                Ok(summary) => {
                    if failures > 0 {
                        info!("Replay ledger persistence recovered after {} failures", failures);
                    }
                    failures = 0;
                    debug!("Replay batch: {:?}", summary);
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_FLUSH_FAILURES {
                        error!(
                            "Replay ledger {} could not be written {} times in a row: {}",
                            self.ledger.path().display(),
                            failures,
                            e
                        );
                    } else {
                        warn!("Failed to write replay ledger, will retry: {}", e);
                    }
                }
            }
            batch.clear();
        }

        info!("Record stream closed, replay finished");
        Ok(())
    }

    async fn apply(&mut self, record: &SyncRecord, summary: &mut BatchSummary) {
        match self.executor.execute(&record.sql).await {
            Ok(()) => summary.applied += 1,
            Err(e) => {
                error!("Error executing SQL query: {} ({})", e, record.sql);
                summary.failed += 1;
            }
        }

        if record.has_position() {
            self.ledger.record(&record.binlog_file, record.offset);
        }
    }

    fn finish_batch(&self, summary: BatchSummary) -> Result<BatchSummary> {
        self.ledger.write()?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CdcError;
    use crate::events::{ChannelSink, RecordSink, TaggedRecord};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingExecutor {
        executed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StatementExecutor for RecordingExecutor {
        async fn execute(&self, sql: &str) -> Result<()> {
            self.executed.lock().push(sql.to_string());
            if sql.contains("BROKEN") {
                return Err(CdcError::QueryError("syntax error".to_string()));
            }
            Ok(())
        }
    }

    fn applier(dir: &tempfile::TempDir) -> (ReplayApplier, Arc<RecordingExecutor>) {
        let executor = Arc::new(RecordingExecutor::default());
        let ledger = ReplayLedger::new(dir.path().join("out.buffer"));
        (ReplayApplier::new(executor.clone(), ledger), executor)
    }

    #[tokio::test]
    async fn test_batch_applies_and_records_last_offset() {
        let dir = tempfile::tempdir().unwrap();
        let (mut applier, executor) = applier(&dir);

        let summary = applier
            .process_batch(&[
                SyncRecord::new("INSERT 1", "mysql-bin.000001", 100),
                SyncRecord::new("BROKEN", "mysql-bin.000001", 200),
                SyncRecord::new("INSERT 3", "mysql-bin.000002", 50),
            ])
            .await
            .unwrap();

        assert_eq!(summary, BatchSummary { applied: 2, failed: 1, skipped: 0 });
        assert_eq!(executor.executed.lock().len(), 3);

        let text = std::fs::read_to_string(applier.ledger().path()).unwrap();
        assert_eq!(text, "mysql-bin.000001=200\nmysql-bin.000002=50\n");
    }

    #[tokio::test]
    async fn test_last_write_wins_without_monotonic_check() {
        let dir = tempfile::tempdir().unwrap();
        let (mut applier, _executor) = applier(&dir);

        applier
            .process_batch(&[SyncRecord::new("a", "f", 500)])
            .await
            .unwrap();
        applier
            .process_batch(&[SyncRecord::new("b", "f", 300)])
            .await
            .unwrap();

        assert_eq!(applier.ledger().offset("f"), Some(300));
        let reloaded = ReplayLedger::load(applier.ledger().path()).unwrap();
        assert_eq!(reloaded.offset("f"), Some(300));
    }

    #[tokio::test]
    async fn test_values_without_sql_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut applier, executor) = applier(&dir);

        let summary = applier
            .process_values(&[
                serde_json::json!({ "message": "not a binlog record" }),
                serde_json::json!({ "sql": "DELETE FROM t", "binlog_file": "f", "offset": 9 }),
            ])
            .await
            .unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.applied, 1);
        assert_eq!(executor.executed.lock().as_slice(), ["DELETE FROM t"]);
        assert_eq!(applier.ledger().offset("f"), Some(9));
    }

    #[tokio::test]
    async fn test_no_backup_file_on_replay_side() {
        let dir = tempfile::tempdir().unwrap();
        let (mut applier, _executor) = applier(&dir);
        applier.process_batch(&[SyncRecord::new("a", "f", 1)]).await.unwrap();
        applier.process_batch(&[SyncRecord::new("b", "f", 2)]).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec!["out.buffer".to_string()]);
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (mut applier, executor) = applier(&dir);
        let (sink, rx) = ChannelSink::new();

        for offset in 1..=5u64 {
            sink.emit(TaggedRecord::now("t", SyncRecord::new(format!("S{}", offset), "f", offset)))
                .await
                .unwrap();
        }
        drop(sink);

        applier.run(rx, 2).await.unwrap();
        assert_eq!(executor.executed.lock().len(), 5);
        assert_eq!(applier.ledger().offset("f"), Some(5));
    }

    #[tokio::test]
    async fn test_run_survives_ledger_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();

        let executor = Arc::new(RecordingExecutor::default());
        let ledger = ReplayLedger::new(blocker.join("out.buffer"));
        let mut applier = ReplayApplier::new(executor.clone(), ledger);

        let (sink, rx) = ChannelSink::new();
        for offset in 1..=4u64 {
            sink.emit(TaggedRecord::now("t", SyncRecord::new(format!("S{}", offset), "f", offset)))
                .await
                .unwrap();
        }
        drop(sink);

        applier.run(rx, 1).await.unwrap();
        assert_eq!(executor.executed.lock().len(), 4);
        assert_eq!(applier.ledger().offset("f"), Some(4));

        // 경로가 복구되면 다음 배치가 밀린 위치까지 기록
        std::fs::remove_file(&blocker).unwrap();
        applier
            .process_batch(&[SyncRecord::new("S5", "g", 7)])
            .await
            .unwrap();
        let text = std::fs::read_to_string(applier.ledger().path()).unwrap();
        assert_eq!(text, "f=4\ng=7\n");
    }

    #[test]
    fn test_load_missing_replay_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ReplayLedger::load(dir.path().join("missing")).unwrap();
        assert!(ledger.offsets().is_empty());
    }
}
