//! MySQL Binlog 동기화 코디네이터
//!
//! 소스 DB 의 binlog 파일(세그먼트)을 주기적으로 조회하고, 파일마다 워커를 띄워
//! 외부 디코더로 SQL 을 복원해 레코드로 내보냅니다.
//! 주요 기능:
//! - 세그먼트 디스커버리 및 상태 병합
//! - 디코더 동시 실행을 하나로 제한하는 Admission Token
//! - 파일 기반 오프셋 원장과 재시작 복구
//! - 타깃 DB 재생 및 재생 위치 기록

pub mod admission;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod decoder;
pub mod error;
pub mod events;
pub mod offset;
pub mod replay;
pub mod segment;
pub mod worker;

pub use admission::{AdmissionToken, WorkerId};
pub use config::{ReplayConfig, SyncConfig};
pub use connection::{ConnectionConfig, MySqlConnection, SegmentSource, StatementExecutor};
pub use coordinator::BinlogSyncCoordinator;
pub use decoder::{ProcessDecoder, StatementDecoder};
pub use error::{CdcError, Result};
pub use events::{RecordSink, SyncRecord, TaggedRecord};
pub use offset::OffsetLedger;
pub use replay::{ReplayApplier, ReplayLedger};
pub use segment::{SegmentListing, SegmentState, SegmentTable};
