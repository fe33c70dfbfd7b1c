//! Binlog 동기화 오프셋 원장 (Offset Ledger)
//!
//! 세그먼트(binlog 파일)별로 마지막으로 커밋된 오프셋을 파일에 보관합니다.
//! 파일 형식은 한 줄에 하나씩 `<binlog 파일명>=<오프셋>` 입니다.
//! 예: `mysql-bin.000003=4097`
//!
//! 덮어쓰기 전에 기존 파일을 `<path>.bak` 으로 복사해 둡니다.

use crate::error::{CdcError, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// 세그먼트 ID → 커밋된 오프셋
pub type OffsetMap = BTreeMap<String, u64>;

/// 원장 텍스트 파싱
///
/// 구분자는 마지막 `=` 입니다. 오프셋에는 `=`가 들어갈 수 없으므로
/// 세그먼트 ID에 `=`가 포함되어 있어도 그대로 복원됩니다.
/// 형식이 잘못된 줄은 경고 후 건너뜁니다.
pub fn parse_ledger(text: &str) -> OffsetMap {
    let mut offsets = OffsetMap::new();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        let Some((id, value)) = line.rsplit_once('=') else {
            warn!("Skipping ledger line {}: missing '=': {:?}", lineno + 1, line);
            continue;
        };

        if id.is_empty() {
            warn!("Skipping ledger line {}: empty segment id", lineno + 1);
            continue;
        }

        match value.trim().parse::<u64>() {
            Ok(offset) => {
                offsets.insert(id.to_string(), offset);
            }
            Err(e) => {
                warn!(
                    "Skipping ledger line {}: invalid offset {:?}: {}",
                    lineno + 1,
                    value,
                    e
                );
            }
        }
    }

    offsets
}

/// 원장 텍스트 생성 (세그먼트 ID 순으로 정렬되어 항상 같은 결과)
pub fn render_ledger(offsets: &OffsetMap) -> String {
    let mut out = String::new();
    for (id, offset) in offsets {
        out.push_str(id);
        out.push('=');
        out.push_str(&offset.to_string());
        out.push('\n');
    }
    out
}

/// 경로 뒤에 접미사를 붙인 형제 경로 (`/a/b.buffer` → `/a/b.buffer.bak`)
pub(crate) fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// 파일 읽기. 파일이 없으면 `None`
pub(crate) fn read_if_exists(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CdcError::IoError(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// 임시 파일에 쓴 뒤 rename 으로 교체
pub(crate) fn write_replace(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = sibling_with_suffix(path, ".tmp");
    fs::write(&tmp_path, contents).map_err(|e| {
        CdcError::IoError(format!("Failed to write {}: {}", tmp_path.display(), e))
    })?;
    fs::rename(&tmp_path, path).map_err(|e| {
        CdcError::IoError(format!("Failed to replace {}: {}", path.display(), e))
    })?;
    Ok(())
}

/// 동기화 측 오프셋 원장
#[derive(Debug)]
pub struct OffsetLedger {
    path: PathBuf,
    dirty: AtomicBool,
}

impl OffsetLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        OffsetLedger {
            path: path.into(),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        sibling_with_suffix(&self.path, ".bak")
    }

    /// 시작 시 원장 로드. 파일이 없으면 빈 원장
    pub fn load(&self) -> Result<OffsetMap> {
        self.dirty.store(false, Ordering::Release);

        match read_if_exists(&self.path)? {
            Some(text) => {
                let offsets = parse_ledger(&text);
                info!(
                    "Loaded {} segment offsets from {}",
                    offsets.len(),
                    self.path.display()
                );
                Ok(offsets)
            }
            None => {
                warn!(
                    "Ledger file '{}' not found. Starting with empty offsets.",
                    self.path.display()
                );
                Ok(OffsetMap::new())
            }
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// dirty 상태일 때만 원장을 덮어씀. 실제로 썼으면 `true`
    ///
    /// dirty 플래그를 먼저 내린 뒤 스냅샷을 뜨므로, 쓰는 도중에 들어온
    /// 변경은 다음 flush 에서 반영됩니다. 실패하면 플래그를 다시 올립니다.
    pub fn flush<F>(&self, snapshot: F) -> Result<bool>
    where
        F: FnOnce() -> OffsetMap,
    {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let offsets = snapshot();
        match self.write_snapshot(&offsets) {
            Ok(()) => {
                debug!(
                    "Flushed {} segment offsets to {}",
                    offsets.len(),
                    self.path.display()
                );
                Ok(true)
            }
            Err(e) => {
                self.mark_dirty();
                Err(e)
            }
        }
    }

    /// 종료 시 강제 저장
    pub fn force_flush<F>(&self, snapshot: F) -> Result<()>
    where
        F: FnOnce() -> OffsetMap,
    {
        self.mark_dirty();
        self.flush(snapshot).map(|_| ())
    }

    fn write_snapshot(&self, offsets: &OffsetMap) -> Result<()> {
        if self.path.exists() {
            let backup = self.backup_path();
            fs::copy(&self.path, &backup).map_err(|e| {
                CdcError::IoError(format!(
                    "Failed to back up {} to {}: {}",
                    self.path.display(),
                    backup.display(),
                    e
                ))
            })?;
        }

        write_replace(&self.path, &render_ledger(offsets))
    }
}
