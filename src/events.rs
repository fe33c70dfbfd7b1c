//! 동기화 레코드 타입 및 레코드 전달(sink) 정의

use crate::error::{CdcError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// 디코더가 만든 SQL 한 문장과 그 위치
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// 복원된 SQL 문
    pub sql: String,
    /// 바이너리 로그 파일명
    #[serde(default)]
    pub binlog_file: String,
    /// 문장이 끝나는 binlog 위치
    #[serde(default)]
    pub offset: u64,
}

impl SyncRecord {
    pub fn new(sql: impl Into<String>, binlog_file: impl Into<String>, offset: u64) -> Self {
        SyncRecord {
            sql: sql.into(),
            binlog_file: binlog_file.into(),
            offset,
        }
    }

    /// 호스트 라우팅 API 로 전달되는 원시 레코드에서 복원
    ///
    /// `sql` 이 없는 레코드는 `None`. 위치 정보가 없으면 `offset` 0,
    /// `binlog_file` 빈 문자열로 채웁니다.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        SyncRecord::deserialize(value).ok()
    }

    /// 위치 정보가 있는 레코드인지
    pub fn has_position(&self) -> bool {
        !self.binlog_file.is_empty()
    }

    /// 한 줄짜리 JSON 직렬화
    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// 태그와 시각이 붙은 emit 단위
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedRecord {
    pub tag: String,
    pub time: DateTime<Utc>,
    pub record: SyncRecord,
}

impl TaggedRecord {
    pub fn now(tag: impl Into<String>, record: SyncRecord) -> Self {
        TaggedRecord {
            tag: tag.into(),
            time: Utc::now(),
            record,
        }
    }
}

/// 레코드를 받아 가는 하류 (호스트의 이벤트 라우터)
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn emit(&self, record: TaggedRecord) -> Result<()>;
}

/// 레코드 수신자
pub type RecordReceiver = mpsc::UnboundedReceiver<TaggedRecord>;

/// mpsc 채널 기반 sink
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TaggedRecord>,
}

impl ChannelSink {
    pub fn new() -> (Self, RecordReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    async fn emit(&self, record: TaggedRecord) -> Result<()> {
        self.tx.send(record).map_err(|_| CdcError::ChannelClosed)
    }
}
