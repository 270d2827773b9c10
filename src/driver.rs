//! tick 드라이버
//!
//! 고정 주기로 코디네이터의 `on_tick`을 호출하는 백그라운드 태스크.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::coordinator::SessionCoordinator;
use crate::link::Link;
use crate::transfer::TickOutcome;

/// 주기적 tick 드라이버
pub struct TickDriver<L: Link + 'static> {
    coordinator: Arc<SessionCoordinator<L>>,
    interval: Duration,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<L: Link + 'static> TickDriver<L> {
    /// 코디네이터 설정의 tick 주기 사용
    pub fn new(coordinator: Arc<SessionCoordinator<L>>) -> Self {
        let interval = coordinator.tick_interval();
        Self::with_interval(coordinator, interval)
    }

    pub fn with_interval(coordinator: Arc<SessionCoordinator<L>>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval: interval.max(Duration::from_millis(1)),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 드라이버 시작 (이미 실행 중이면 무시)
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let coordinator = self.coordinator.clone();
        let running = self.running.clone();
        let period = self.interval;

        info!("tick 드라이버 시작: {:?} 주기", period);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                match coordinator.on_tick() {
                    TickOutcome::Completed { id, bytes, .. } => {
                        debug!("tick: 세션 {} 완료 ({} bytes)", id, bytes);
                    }
                    TickOutcome::Aborted { id, reason, .. } => {
                        debug!("tick: 세션 {} 중단 ({})", id, reason);
                    }
                    _ => {}
                }
            }
        });

        *self.handle.lock() = Some(handle);
    }

    /// 드라이버 정지
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        info!("tick 드라이버 정지");
    }
}

impl<L: Link + 'static> Drop for TickDriver<L> {
    fn drop(&mut self) {
        self.stop();
    }
}
