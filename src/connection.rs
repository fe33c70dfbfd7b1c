//! MySQL 데이터베이스 연결 관리
//!
//! 소스 측에서는 `SHOW BINARY LOGS` 로 세그먼트 목록을 조회하고,
//! 타깃 측에서는 복원된 SQL 을 그대로 실행합니다.

use crate::error::{CdcError, Result};
use crate::segment::SegmentListing;
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, Pool, Row};
use std::fmt;
use tracing::debug;

/// MySQL 연결 설정
#[derive(Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
        }
    }
}

// 비밀번호는 로그에 남기지 않음
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    fn build_opts(&self) -> Opts {
        let password = if self.password.is_empty() {
            None
        } else {
            Some(self.password.clone())
        };

        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(password)
            .db_name(self.database.clone())
            .into()
    }
}

/// 소스 DB 의 binlog 세그먼트 목록 조회
#[async_trait]
pub trait SegmentSource: Send + Sync {
    async fn list_segments(&self) -> Result<Vec<SegmentListing>>;
}

/// 타깃 DB 에 SQL 실행
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<()>;
}

/// MySQL 연결 풀 래퍼
pub struct MySqlConnection {
    pool: Pool,
    config: ConnectionConfig,
}

impl MySqlConnection {
    /// 풀 생성. 실제 연결은 첫 쿼리 때 맺어짐
    pub fn new(config: ConnectionConfig) -> Self {
        let pool = Pool::new(config.build_opts());
        MySqlConnection { pool, config }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn get_conn(&self) -> Result<mysql_async::Conn> {
        self.pool.get_conn().await.map_err(|e| {
            CdcError::ConnectionError(format!(
                "Failed to connect to MySQL {}:{}: {}",
                self.config.hostname, self.config.port, e
            ))
        })
    }

    /// `SHOW BINARY LOGS` 조회
    pub async fn show_binary_logs(&self) -> Result<Vec<SegmentListing>> {
        let mut conn = self.get_conn().await?;
        let rows: Vec<Row> = conn
            .query("SHOW BINARY LOGS")
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query binary logs: {}", e)))?;

        rows.into_iter().map(binary_log_from_row).collect()
    }

    pub async fn close(self) -> Result<()> {
        self.pool
            .disconnect()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to close pool: {}", e)))
    }
}

/// `Log_name`, `File_size` 컬럼 추출. MySQL 8 의 `Encrypted` 컬럼은 무시
fn binary_log_from_row(row: Row) -> Result<SegmentListing> {
    let name: String = match row.get_opt("Log_name") {
        Some(Ok(name)) => name,
        _ => {
            return Err(CdcError::QueryError(
                "SHOW BINARY LOGS row without Log_name".to_string(),
            ))
        }
    };
    let size: u64 = match row.get_opt("File_size") {
        Some(Ok(size)) => size,
        _ => {
            return Err(CdcError::QueryError(format!(
                "SHOW BINARY LOGS row for {} without File_size",
                name
            )))
        }
    };
    Ok(SegmentListing::new(name, size))
}

#[async_trait]
impl SegmentSource for MySqlConnection {
    async fn list_segments(&self) -> Result<Vec<SegmentListing>> {
        self.show_binary_logs().await
    }
}

#[async_trait]
impl StatementExecutor for MySqlConnection {
    async fn execute(&self, sql: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        debug!("Executing: {}", sql);
        conn.query_drop(sql)
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to execute SQL: {}", e)))
    }
}
