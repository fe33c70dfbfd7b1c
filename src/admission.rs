//! 디코더 실행 단일화 토큰 (Admission Token)
//!
//! 외부 디코더 프로세스는 소스 DB에 직접 접속하므로 동시에 여러 개를 띄우면
//! 소스에 부하가 몰립니다. 이 토큰은 모든 세그먼트를 통틀어 동시에 하나의
//! 디코더 실행만 허용합니다.
//!
//! 획득은 non-blocking 입니다. 비어 있으면 점유, 이미 내가 가지고 있으면 성공,
//! 다른 워커가 가지고 있으면 즉시 실패합니다. 대기열은 없습니다.
//! 실패한 워커는 다음 루프에서 다시 시도합니다.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// 빈 슬롯 표시값
const EMPTY: u64 = 0;

/// 워커 식별자 (0은 빈 슬롯 표시로 예약)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(NonZeroU64);

impl WorkerId {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(WorkerId)
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// 단조 증가하는 워커 ID 발급기
#[derive(Debug)]
pub struct WorkerIdAllocator {
    next: AtomicU64,
}

impl Default for WorkerIdAllocator {
    fn default() -> Self {
        WorkerIdAllocator {
            next: AtomicU64::new(1),
        }
    }
}

impl WorkerIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> WorkerId {
        loop {
            let raw = self.next.fetch_add(1, Ordering::Relaxed);
            // u64 한 바퀴를 돌아 0이 나오는 경우만 건너뜀
            if let Some(id) = WorkerId::new(raw) {
                return id;
            }
        }
    }
}

/// 단일 슬롯 CAS 토큰
#[derive(Debug, Default)]
pub struct AdmissionToken {
    holder: AtomicU64,
}

impl AdmissionToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// 토큰 획득 시도. 블로킹하지 않음
    pub fn try_acquire(&self, id: WorkerId) -> bool {
        match self.holder.compare_exchange(
            EMPTY,
            id.get(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(current) => current == id.get(),
        }
    }

    /// 토큰 반환. 현재 보유자만 반환할 수 있고, 그 외에는 아무 일도 하지 않음
    pub fn release(&self, id: WorkerId) -> bool {
        self.holder
            .compare_exchange(id.get(), EMPTY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 현재 보유자
    pub fn holder(&self) -> Option<WorkerId> {
        WorkerId::new(self.holder.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(raw: u64) -> WorkerId {
        WorkerId::new(raw).unwrap()
    }

    #[test]
    fn test_acquire_empty_slot() {
        let token = AdmissionToken::new();
        assert_eq!(token.holder(), None);
        assert!(token.try_acquire(id(1)));
        assert_eq!(token.holder(), Some(id(1)));
    }

    #[test]
    fn test_reentry_by_holder() {
        let token = AdmissionToken::new();
        assert!(token.try_acquire(id(7)));
        assert!(token.try_acquire(id(7)));
        assert_eq!(token.holder(), Some(id(7)));
    }

    #[test]
    fn test_busy_fails_immediately() {
        let token = AdmissionToken::new();
        assert!(token.try_acquire(id(1)));
        assert!(!token.try_acquire(id(2)));
        assert_eq!(token.holder(), Some(id(1)));
    }

    #[test]
    fn test_release_only_by_holder() {
        let token = AdmissionToken::new();
        assert!(token.try_acquire(id(1)));
        assert!(!token.release(id(2)));
        assert_eq!(token.holder(), Some(id(1)));

        assert!(token.release(id(1)));
        assert_eq!(token.holder(), None);

        // 빈 슬롯 반환은 no-op
        assert!(!token.release(id(1)));
        assert!(token.try_acquire(id(2)));
    }

    #[test]
    fn test_single_winner_under_contention() {
        let token = Arc::new(AdmissionToken::new());
        let handles: Vec<_> = (1..=16)
            .map(|raw| {
                let token = token.clone();
                std::thread::spawn(move || token.try_acquire(id(raw)))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_allocator_is_unique() {
        let alloc = WorkerIdAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "worker-1");
    }
}
