//! 세그먼트(binlog 파일) 상태 테이블
//!
//! 디스커버리 루프, 디스패처, 워커가 동시에 접근하므로 테이블 전체를
//! 하나의 `parking_lot::Mutex` 로 보호합니다. 락은 `.await` 을 넘어서
//! 잡고 있지 않습니다.

use crate::admission::WorkerId;
use crate::offset::OffsetMap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// 소스가 보고한 세그먼트 하나 (`SHOW BINARY LOGS` 의 한 행)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentListing {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub id: String,
    /// 파일 크기 (바이트)
    pub size: u64,
}

impl SegmentListing {
    pub fn new(id: impl Into<String>, size: u64) -> Self {
        SegmentListing {
            id: id.into(),
            size,
        }
    }
}

/// 세그먼트별 동기화 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentState {
    pub id: String,
    /// 마지막으로 emit 된 오프셋. 감소하지 않음
    pub committed_offset: u64,
    /// 소스가 마지막으로 보고한 크기
    pub known_size: u64,
    pub active: bool,
    /// 마지막으로 소스 목록에 나타난 디스커버리 시각
    pub last_seen_at: Option<DateTime<Utc>>,
    /// 현재 담당 워커
    pub owner: Option<WorkerId>,
}

impl SegmentState {
    fn discovered(id: String, known_size: u64, now: DateTime<Utc>) -> Self {
        SegmentState {
            id,
            committed_offset: 0,
            known_size,
            active: known_size > 0,
            last_seen_at: Some(now),
            owner: None,
        }
    }

    fn restored(id: String, committed_offset: u64) -> Self {
        SegmentState {
            id,
            committed_offset,
            known_size: 0,
            active: false,
            last_seen_at: None,
            owner: None,
        }
    }
}

/// 한 번의 reconcile 결과 요약
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// 새로 발견된 세그먼트
    pub discovered: Vec<String>,
    /// 이번 목록에서 사라져 비활성화된 세그먼트
    pub vanished: Vec<String>,
    /// 현재 활성 세그먼트 수
    pub active: usize,
}

/// 세그먼트 상태 테이블
#[derive(Debug, Default)]
pub struct SegmentTable {
    segments: Mutex<BTreeMap<String, SegmentState>>,
}

impl SegmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 원장에서 읽은 오프셋 병합. 기존 값보다 큰 경우에만 반영
    pub fn restore(&self, offsets: &OffsetMap) {
        let mut segments = self.segments.lock();
        for (id, offset) in offsets {
            segments
                .entry(id.clone())
                .and_modify(|state| {
                    state.committed_offset = state.committed_offset.max(*offset);
                })
                .or_insert_with(|| SegmentState::restored(id.clone(), *offset));
        }
    }

    /// 소스 목록을 테이블에 병합
    ///
    /// 크기가 0으로 보고된 세그먼트는 활성 여부를 바꾸지 않습니다.
    /// 목록에 없는 세그먼트는 오프셋과 무관하게 비활성화됩니다.
    pub fn reconcile(&self, listing: &[SegmentListing], now: DateTime<Utc>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let mut segments = self.segments.lock();

        for entry in listing {
            match segments.get_mut(&entry.id) {
                None => {
                    info!("new binlog file: {} (size {})", entry.id, entry.size);
                    segments.insert(
                        entry.id.clone(),
                        SegmentState::discovered(entry.id.clone(), entry.size, now),
                    );
                    summary.discovered.push(entry.id.clone());
                }
                Some(state) => {
                    state.known_size = entry.size;
                    state.last_seen_at = Some(now);
                    if entry.size > 0 {
                        state.active = entry.size > state.committed_offset;
                    }
                }
            }
        }

        for state in segments.values_mut() {
            if state.last_seen_at != Some(now) {
                if state.active {
                    debug!("binlog file {} no longer listed by source", state.id);
                    summary.vanished.push(state.id.clone());
                }
                state.active = false;
            }
        }

        summary.active = segments.values().filter(|s| s.active).count();
        summary
    }

    /// 목록에서 사라졌고 담당 워커도 없는 비활성 세그먼트 제거
    pub fn collect_garbage(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut removed = Vec::new();
        self.segments.lock().retain(|id, state| {
            let keep = state.active || state.owner.is_some() || state.last_seen_at == Some(now);
            if !keep {
                removed.push(id.clone());
            }
            keep
        });
        removed
    }

    /// 워커가 없는 활성 세그먼트에 워커 ID 를 할당하고 목록 반환
    pub fn claim_idle<F>(&self, mut allocate: F) -> Vec<(String, WorkerId)>
    where
        F: FnMut() -> WorkerId,
    {
        let mut segments = self.segments.lock();
        segments
            .values_mut()
            .filter(|state| state.active && state.owner.is_none())
            .map(|state| {
                let worker = allocate();
                state.owner = Some(worker);
                (state.id.clone(), worker)
            })
            .collect()
    }

    pub fn committed_offset(&self, id: &str) -> Option<u64> {
        self.segments.lock().get(id).map(|s| s.committed_offset)
    }

    /// 오프셋 전진. 실제로 커졌으면 `true`
    pub fn advance(&self, id: &str, offset: u64) -> bool {
        match self.segments.lock().get_mut(id) {
            Some(state) if offset > state.committed_offset => {
                state.committed_offset = offset;
                true
            }
            _ => false,
        }
    }

    pub fn deactivate(&self, id: &str) {
        if let Some(state) = self.segments.lock().get_mut(id) {
            state.active = false;
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.segments
            .lock()
            .get(id)
            .map(|s| s.active)
            .unwrap_or(false)
    }

    /// 비활성이면 담당 워커를 해제하고 `true`. 활성이면 `false`
    ///
    /// 판정과 해제를 한 번의 락 안에서 처리하므로 디스패처가 그 사이에
    /// 두 번째 워커를 띄우는 일이 없습니다.
    pub fn retire_if_inactive(&self, id: &str, worker: WorkerId) -> bool {
        let mut segments = self.segments.lock();
        match segments.get_mut(id) {
            None => true,
            Some(state) if state.owner != Some(worker) => true,
            Some(state) if state.active => false,
            Some(state) => {
                state.owner = None;
                true
            }
        }
    }

    /// 종료 시 담당 워커 해제
    pub fn release_owner(&self, id: &str, worker: WorkerId) {
        if let Some(state) = self.segments.lock().get_mut(id) {
            if state.owner == Some(worker) {
                state.owner = None;
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<SegmentState> {
        self.segments.lock().get(id).cloned()
    }

    /// 원장 저장용 스냅샷
    pub fn offsets(&self) -> OffsetMap {
        self.segments
            .lock()
            .values()
            .map(|s| (s.id.clone(), s.committed_offset))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.segments.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.lock().is_empty()
    }
}
