//! Binlog 동기화 실행 예제
//!
//! 환경 변수로 소스 DB 를 지정하고, `TARGET_DB_HOST` 가 있으면
//! 받은 레코드를 타깃 DB 에 재생합니다. 없으면 레코드를 JSON 으로 로그에 남깁니다.
use binlog_sync::config::{ReplayConfig, SyncConfig};
use binlog_sync::coordinator::BinlogSyncCoordinator;
use binlog_sync::connection::MySqlConnection;
use binlog_sync::events::RecordReceiver;
use binlog_sync::replay::{ReplayApplier, ReplayLedger};
use std::env;
use std::sync::Arc;
use tracing::{error, info, info_span, Instrument};

/// 재생 배치 최대 크기
const REPLAY_BATCH_SIZE: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    let config = SyncConfig::from_env()?;
    info!(
        "Syncing binlogs from {}:{} every {:?}",
        config.connection.hostname, config.connection.port, config.interval
    );

    let (mut coordinator, records) = BinlogSyncCoordinator::with_mysql(config);
    coordinator.start().await?;

    let consumer = if env::var("TARGET_DB_HOST").is_ok() {
        let replay = ReplayConfig::from_env()?;
        info!(
            tag = %replay.tag,
            "Replaying records into {}:{}",
            replay.connection.hostname, replay.connection.port
        );
        let ledger = ReplayLedger::load(replay.ledger_path.clone())?;
        let target = Arc::new(MySqlConnection::new(replay.connection.clone()));
        let mut applier = ReplayApplier::new(target, ledger);
        let span = info_span!("replay", tag = %replay.tag);
        tokio::spawn(
            async move {
                if let Err(e) = applier.run(records, REPLAY_BATCH_SIZE).await {
                    error!("Replay stopped: {}", e);
                }
            }
            .instrument(span),
        )
    } else {
        tokio::spawn(log_records(records))
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    coordinator.shutdown().await?;
    // 코디네이터가 drop 되면 sink 가 닫히고 consumer 도 끝남
    drop(coordinator);
    consumer.await?;

    Ok(())
}

async fn log_records(mut records: RecordReceiver) {
    while let Some(tagged) = records.recv().await {
        match tagged.record.to_json_line() {
            Ok(json) => info!(tag = %tagged.tag, time = %tagged.time, "{}", json),
            Err(e) => error!("Failed to serialize record: {}", e),
        }
    }
}
