//! 외부 binlog 디코더 프로세스 연동
//!
//! binlog 바이트 해석은 `binlog2sql.py` 호환 CLI 에 맡깁니다.
//! 디코더는 문장마다 한 줄씩 다음 형식으로 출력합니다.
//!
//! ```text
//! INSERT INTO `db`.`t`(`id`) VALUES (1); #start 4 end 2048 time 2024-01-01 00:00:00
//! ```
//!
//! `; #start` 가 없는 줄은 로그 등 잡음으로 보고 무시합니다.

use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 문장과 위치 정보 사이 구분자
pub const STATEMENT_DELIMITER: &str = "; #start";

/// 기본 디코더 실행 파일
pub const DEFAULT_DECODER_PROGRAM: &str = "binlog2sql.py";

fn end_marker() -> &'static Regex {
    static END_MARKER: OnceLock<Regex> = OnceLock::new();
    END_MARKER.get_or_init(|| Regex::new(r"end (\d+)").expect("end marker pattern is valid"))
}

/// 디코딩된 문장 한 개
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedStatement {
    /// 구분자 앞의 SQL 문
    pub sql: String,
    /// 문장이 끝나는 binlog 위치
    pub end_offset: u64,
}

/// 디코더 출력 한 줄 파싱
///
/// 구분자가 없으면 `Ok(None)`. 구분자는 있는데 `end <n>` 이 없으면 에러.
pub fn parse_line(line: &str) -> Result<Option<DecodedStatement>> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some((sql, position)) = line.split_once(STATEMENT_DELIMITER) else {
        return Ok(None);
    };

    let captures = end_marker().captures(position).ok_or_else(|| {
        CdcError::BinlogParseError(format!("missing end offset in line: {}", line))
    })?;

    let end_offset = captures[1]
        .parse::<u64>()
        .map_err(|e| CdcError::BinlogParseError(format!("invalid end offset in line {:?}: {}", line, e)))?;

    Ok(Some(DecodedStatement {
        sql: sql.to_string(),
        end_offset,
    }))
}

/// 디코더에 그대로 전달되는 필터 옵션
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeFilter {
    pub database: Option<String>,
    pub table: Option<String>,
    pub only_dml: bool,
}

/// 디코더 실행 요청
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeRequest {
    /// 시작 binlog 파일
    pub binlog_file: String,
    /// 재개 위치
    pub start_offset: u64,
    pub filter: DecodeFilter,
}

/// 디코더 출력 줄 스트림. 프로세스 실패는 `Err` 항목으로 전달됨
///
/// 수신자를 drop 하면 다음 출력을 기다리지 않고 디코더 프로세스를 종료합니다.
pub type DecodedLines = mpsc::UnboundedReceiver<Result<String>>;

/// binlog → SQL 디코더
#[async_trait]
pub trait StatementDecoder: Send + Sync {
    async fn decode(&self, request: &DecodeRequest) -> Result<DecodedLines>;
}

/// 외부 프로세스로 디코더 실행
#[derive(Debug, Clone)]
pub struct ProcessDecoder {
    program: PathBuf,
    connection: ConnectionConfig,
}

impl ProcessDecoder {
    pub fn new(program: impl Into<PathBuf>, connection: ConnectionConfig) -> Self {
        ProcessDecoder {
            program: program.into(),
            connection,
        }
    }

    /// 명령행 인자 구성
    pub fn build_args(&self, request: &DecodeRequest) -> Vec<String> {
        let mut args = vec![
            "-h".to_string(),
            self.connection.hostname.clone(),
            "-P".to_string(),
            self.connection.port.to_string(),
            "-u".to_string(),
            self.connection.username.clone(),
        ];

        if !self.connection.password.is_empty() {
            args.push("-p".to_string());
            args.push(self.connection.password.clone());
        }

        args.push(format!("--start-file={}", request.binlog_file));
        args.push(format!("--start-pos={}", request.start_offset));

        if let Some(db) = request.filter.database.as_deref().filter(|s| !s.is_empty()) {
            args.push("-d".to_string());
            args.push(db.to_string());
        }
        if let Some(table) = request.filter.table.as_deref().filter(|s| !s.is_empty()) {
            args.push("-t".to_string());
            args.push(table.to_string());
        }
        if request.filter.only_dml {
            args.push("--only-dml".to_string());
        }

        args
    }
}

#[async_trait]
impl StatementDecoder for ProcessDecoder {
    async fn decode(&self, request: &DecodeRequest) -> Result<DecodedLines> {
        let (tx, rx) = mpsc::unbounded_channel();

        info!(
            "Running decoder {} for {}:{}",
            self.program.display(),
            request.binlog_file,
            request.start_offset
        );

        let mut child = Command::new(&self.program)
            .args(self.build_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CdcError::DecoderError(format!(
                    "Failed to spawn {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CdcError::DecoderError("decoder stdout not captured".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("decoder stderr: {}", line);
                }
            });
        }

        let binlog_file = request.binlog_file.clone();

        // 백그라운드에서 stdout 줄 읽기. 수신자가 사라지면 프로세스를 죽임
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let next = tokio::select! {
                    next = lines.next_line() => next,
                    _ = tx.closed() => {
                        debug!("Decoder output for {} abandoned, killing process", binlog_file);
                        kill_child(&mut child, &binlog_file).await;
                        return;
                    }
                };

                match next {
                    Ok(Some(line)) => {
                        if tx.send(Ok(line)).is_err() {
                            debug!("Decoder output for {} abandoned, killing process", binlog_file);
                            kill_child(&mut child, &binlog_file).await;
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(CdcError::IoError(format!(
                            "Failed to read decoder output: {}",
                            e
                        ))));
                        kill_child(&mut child, &binlog_file).await;
                        return;
                    }
                }
            }

            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    error!("Decoder for {} exited with {}", binlog_file, status);
                    let _ = tx.send(Err(CdcError::DecoderError(format!(
                        "decoder exited with {}",
                        status
                    ))));
                }
                Err(e) => {
                    let _ = tx.send(Err(CdcError::DecoderError(format!(
                        "Failed to wait for decoder: {}",
                        e
                    ))));
                }
            }
        });

        Ok(rx)
    }
}

async fn kill_child(child: &mut Child, binlog_file: &str) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill decoder for {}: {}", binlog_file, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DecodeRequest {
        DecodeRequest {
            binlog_file: "mysql-bin.000003".to_string(),
            start_offset: 1024,
            filter: DecodeFilter::default(),
        }
    }

    #[test]
    fn test_parse_statement_line() {
        let line = "INSERT INTO `db`.`t`(`id`) VALUES (1); #start 4 end 2048 time 2024-01-01 00:00:00";
        let parsed = parse_line(line).unwrap().unwrap();
        assert_eq!(parsed.sql, "INSERT INTO `db`.`t`(`id`) VALUES (1)");
        assert_eq!(parsed.end_offset, 2048);
    }

    #[test]
    fn test_parse_skips_noise() {
        assert_eq!(parse_line("").unwrap(), None);
        assert_eq!(parse_line("2024-01-01 INFO connecting").unwrap(), None);
    }

    #[test]
    fn test_parse_missing_end_is_error() {
        let err = parse_line("DELETE FROM t; #start 4 time x").unwrap_err();
        assert!(matches!(err, CdcError::BinlogParseError(_)));
    }

    #[test]
    fn test_build_args_minimal() {
        let decoder = ProcessDecoder::new("binlog2sql.py", ConnectionConfig::default());
        assert_eq!(
            decoder.build_args(&request()),
            vec![
                "-h",
                "localhost",
                "-P",
                "3306",
                "-u",
                "root",
                "--start-file=mysql-bin.000003",
                "--start-pos=1024",
            ]
        );
    }

    #[test]
    fn test_build_args_with_filters() {
        let mut conn = ConnectionConfig::new("db.internal", "repl");
        conn.password = "secret".to_string();
        let decoder = ProcessDecoder::new("binlog2sql.py", conn);

        let mut req = request();
        req.filter = DecodeFilter {
            database: Some("shop".to_string()),
            table: Some(String::new()),
            only_dml: true,
        };

        let args = decoder.build_args(&req);
        assert!(args.windows(2).any(|w| w == ["-p", "secret"]));
        assert!(args.windows(2).any(|w| w == ["-d", "shop"]));
        assert!(!args.contains(&"-t".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--only-dml"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_decoder_streams_lines() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake_decoder.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho 'noise'\necho 'INSERT INTO t VALUES (1); #start 4 end 100 time x'\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let decoder = ProcessDecoder::new(&script, ConnectionConfig::default());
        let mut rx = decoder.decode(&request()).await.unwrap();

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line.unwrap());
        }
        assert_eq!(lines.len(), 2);
        assert_eq!(parse_line(&lines[1]).unwrap().unwrap().end_offset, 100);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_decoder_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("failing_decoder.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 3\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let decoder = ProcessDecoder::new(&script, ConnectionConfig::default());
        let mut rx = decoder.decode(&request()).await.unwrap();

        let item = rx.recv().await.unwrap();
        assert!(matches!(item, Err(CdcError::DecoderError(_))));
        assert!(rx.recv().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropping_lines_kills_silent_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("still_running");
        let script = dir.path().join("slow_decoder.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho 'BAD; #start 4 time x'\nsleep 1\ntouch '{}'\necho 'late'\n",
                marker.display()
            ),
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let decoder = ProcessDecoder::new(&script, ConnectionConfig::default());
        let mut rx = decoder.decode(&request()).await.unwrap();

        let first = rx.recv().await.unwrap().unwrap();
        assert!(parse_line(&first).is_err());
        drop(rx);

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_missing_program_is_decoder_error() {
        let decoder = ProcessDecoder::new("/nonexistent/binlog2sql.py", ConnectionConfig::default());
        let err = decoder.decode(&request()).await.unwrap_err();
        assert!(matches!(err, CdcError::DecoderError(_)));
    }
}
