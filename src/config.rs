//! 동기화/재생 설정
//!
//! 기본값은 입력/출력 플러그인 기본값과 같습니다.
//! 환경 변수로 덮어쓸 수 있습니다.

use crate::connection::ConnectionConfig;
use crate::decoder::{DecodeFilter, DEFAULT_DECODER_PROGRAM};
use crate::error::{CdcError, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// 동기화 주기 기본값 (초)
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

/// 원장 저장 주기 기본값 (초)
pub const DEFAULT_PERSIST_INTERVAL_SECS: u64 = 60;

/// 디스패처 주기 기본값 (초)
pub const DEFAULT_DISPATCH_INTERVAL_SECS: u64 = 1;

/// 종료 시 워커 대기 시간 기본값 (초)
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

pub const DEFAULT_SYNC_TAG: &str = "mysql_binlog_in";
pub const DEFAULT_REPLAY_TAG: &str = "mysql_binlog_out";
pub const DEFAULT_SYNC_LEDGER_PATH: &str = "/var/log/fluentd/mysql_binlog.in.buffer";
pub const DEFAULT_REPLAY_LEDGER_PATH: &str = "/var/log/fluentd/mysql_binlog.out.buffer";

/// 동기화 코디네이터 설정
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub connection: ConnectionConfig,
    /// 디코더에 넘길 데이터베이스 필터
    pub database: Option<String>,
    /// 디코더에 넘길 테이블 필터
    pub table: Option<String>,
    pub only_dml: bool,
    /// emit 태그
    pub tag: String,
    /// 디스커버리 주기 및 워커 반복 주기
    pub interval: Duration,
    pub persist_interval: Duration,
    pub dispatch_interval: Duration,
    pub shutdown_grace: Duration,
    pub ledger_path: PathBuf,
    pub decoder_program: PathBuf,
    /// 소스에서 사라진 세그먼트를 테이블/원장에서 제거할지
    pub gc_retired_segments: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            connection: ConnectionConfig::default(),
            database: None,
            table: None,
            only_dml: true,
            tag: DEFAULT_SYNC_TAG.to_string(),
            interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            persist_interval: Duration::from_secs(DEFAULT_PERSIST_INTERVAL_SECS),
            dispatch_interval: Duration::from_secs(DEFAULT_DISPATCH_INTERVAL_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            ledger_path: PathBuf::from(DEFAULT_SYNC_LEDGER_PATH),
            decoder_program: PathBuf::from(DEFAULT_DECODER_PROGRAM),
            gc_retired_segments: true,
        }
    }
}

impl SyncConfig {
    /// 환경 변수에서 설정 읽기
    ///
    /// `DB_HOST`, `DB_PORT`, `DB_USER`, `DB_PASSWORD`, `BINLOG_DATABASE`,
    /// `BINLOG_TABLE`, `BINLOG_TAG`, `BINLOG_INTERVAL`, `BINLOG_LEDGER_PATH`,
    /// `BINLOG_ONLY_DML`, `BINLOG_DECODER`
    pub fn from_env() -> Result<Self> {
        let defaults = SyncConfig::default();
        let config = SyncConfig {
            connection: connection_from_env()?,
            database: env::var("BINLOG_DATABASE").ok().filter(|s| !s.is_empty()),
            table: env::var("BINLOG_TABLE").ok().filter(|s| !s.is_empty()),
            only_dml: parse_env("BINLOG_ONLY_DML", parse_bool)?.unwrap_or(defaults.only_dml),
            tag: env::var("BINLOG_TAG").unwrap_or(defaults.tag),
            interval: parse_env("BINLOG_INTERVAL", parse_secs)?.unwrap_or(defaults.interval),
            ledger_path: env::var("BINLOG_LEDGER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.ledger_path),
            decoder_program: env::var("BINLOG_DECODER")
                .map(PathBuf::from)
                .unwrap_or(defaults.decoder_program),
            ..defaults
        };
        Ok(config.normalized())
    }

    /// 주기 0 은 기본값으로 보정. 디스패처 주기는 동기화 주기를 넘지 않음
    pub fn normalized(mut self) -> Self {
        if self.interval.is_zero() {
            self.interval = Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS);
        }
        if self.persist_interval.is_zero() {
            self.persist_interval = Duration::from_secs(DEFAULT_PERSIST_INTERVAL_SECS);
        }
        if self.dispatch_interval.is_zero() {
            self.dispatch_interval = Duration::from_secs(DEFAULT_DISPATCH_INTERVAL_SECS);
        }
        self.dispatch_interval = self.dispatch_interval.min(self.interval);
        self
    }

    pub fn decode_filter(&self) -> DecodeFilter {
        DecodeFilter {
            database: self.database.clone(),
            table: self.table.clone(),
            only_dml: self.only_dml,
        }
    }
}

/// 재생(consumer) 측 설정
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub connection: ConnectionConfig,
    /// 재생 측 로그에 붙는 태그
    pub tag: String,
    pub ledger_path: PathBuf,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        ReplayConfig {
            connection: ConnectionConfig::default(),
            tag: DEFAULT_REPLAY_TAG.to_string(),
            ledger_path: PathBuf::from(DEFAULT_REPLAY_LEDGER_PATH),
        }
    }
}

impl ReplayConfig {
    /// `TARGET_DB_HOST`, `TARGET_DB_PORT`, `TARGET_DB_USER`,
    /// `TARGET_DB_PASSWORD`, `REPLAY_TAG`, `REPLAY_LEDGER_PATH`
    pub fn from_env() -> Result<Self> {
        let defaults = ReplayConfig::default();
        let connection = ConnectionConfig {
            hostname: env::var("TARGET_DB_HOST").unwrap_or(defaults.connection.hostname),
            port: parse_env("TARGET_DB_PORT", parse_port)?.unwrap_or(defaults.connection.port),
            username: env::var("TARGET_DB_USER").unwrap_or(defaults.connection.username),
            password: env::var("TARGET_DB_PASSWORD").unwrap_or_default(),
            database: None,
        };
        Ok(ReplayConfig {
            connection,
            tag: env::var("REPLAY_TAG").unwrap_or(defaults.tag),
            ledger_path: env::var("REPLAY_LEDGER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.ledger_path),
        })
    }
}

fn connection_from_env() -> Result<ConnectionConfig> {
    let defaults = ConnectionConfig::default();
    Ok(ConnectionConfig {
        hostname: env::var("DB_HOST").unwrap_or(defaults.hostname),
        port: parse_env("DB_PORT", parse_port)?.unwrap_or(defaults.port),
        username: env::var("DB_USER").unwrap_or(defaults.username),
        password: env::var("DB_PASSWORD").unwrap_or_default(),
        database: None,
    })
}

fn parse_env<T>(name: &str, parse: fn(&str) -> Option<T>) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => parse(raw.trim())
            .map(Some)
            .ok_or_else(|| CdcError::ConfigError(format!("invalid value for {}: {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

fn parse_port(raw: &str) -> Option<u16> {
    raw.parse().ok()
}

fn parse_secs(raw: &str) -> Option<Duration> {
    raw.parse().ok().map(Duration::from_secs)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.persist_interval, Duration::from_secs(60));
        assert_eq!(config.tag, "mysql_binlog_in");
        assert!(config.only_dml);
        assert_eq!(
            config.ledger_path,
            PathBuf::from("/var/log/fluentd/mysql_binlog.in.buffer")
        );
    }

    #[test]
    fn test_zero_interval_coerced_to_default() {
        let config = SyncConfig {
            interval: Duration::ZERO,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.interval, Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS));
    }

    #[test]
    fn test_dispatch_interval_bounded_by_interval() {
        let config = SyncConfig {
            interval: Duration::from_millis(200),
            dispatch_interval: Duration::from_secs(5),
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.dispatch_interval, Duration::from_millis(200));
    }

    #[test]
    fn test_decode_filter_passthrough() {
        let config = SyncConfig {
            database: Some("shop".to_string()),
            only_dml: false,
            ..Default::default()
        };
        let filter = config.decode_filter();
        assert_eq!(filter.database.as_deref(), Some("shop"));
        assert_eq!(filter.table, None);
        assert!(!filter.only_dml);
    }

    #[test]
    fn test_value_parsers() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_port("3307"), Some(3307));
        assert_eq!(parse_port("70000"), None);
        assert_eq!(parse_secs("0"), Some(Duration::ZERO));
    }

    #[test]
    fn test_replay_defaults() {
        let config = ReplayConfig::default();
        assert_eq!(config.connection.port, 3306);
        assert_eq!(config.tag, "mysql_binlog_out");
        assert_eq!(
            config.ledger_path,
            PathBuf::from("/var/log/fluentd/mysql_binlog.out.buffer")
        );
    }
}
