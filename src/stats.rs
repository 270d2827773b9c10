//! 전송 통계

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// ACK 지연 샘플 윈도우 크기
const ACK_LATENCY_WINDOW: usize = 32;

/// 전체 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 시작된 세션 수
    pub sessions_started: u64,

    /// 완료된 세션 수
    pub sessions_completed: u64,

    /// 중단된 세션 수
    pub sessions_aborted: u64,

    /// 송신 프레임 수 (헤더/데이터/종료, 재전송 포함)
    pub total_frames: u64,

    /// 송신 데이터 바이트 (재전송 제외)
    pub total_bytes: u64,

    /// 재전송 프레임 수
    pub retransmitted_frames: u64,

    /// 대기를 해제한 ACK 수
    pub acks_received: u64,

    /// 불일치 ACK 수
    pub ack_mismatches: u64,

    /// 재전송 한도 초과로 인한 타임아웃 수
    pub ack_timeouts: u64,

    /// 링크 송신 실패 수
    pub link_failures: u64,

    /// ACK 지연 샘플 (마이크로초)
    ack_latency_samples: VecDeque<u64>,

    /// 마지막 ACK 시간
    pub last_ack_time: Option<Instant>,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            sessions_started: 0,
            sessions_completed: 0,
            sessions_aborted: 0,
            total_frames: 0,
            total_bytes: 0,
            retransmitted_frames: 0,
            acks_received: 0,
            ack_mismatches: 0,
            ack_timeouts: 0,
            link_failures: 0,
            ack_latency_samples: VecDeque::with_capacity(ACK_LATENCY_WINDOW),
            last_ack_time: None,
        }
    }

    /// 대기 해제 ACK 기록
    pub fn record_ack(&mut self, latency: Duration) {
        if self.ack_latency_samples.len() >= ACK_LATENCY_WINDOW {
            self.ack_latency_samples.pop_front();
        }
        self.ack_latency_samples.push_back(latency.as_micros() as u64);
        self.acks_received += 1;
        self.last_ack_time = Some(Instant::now());
    }

    /// 평균 ACK 지연 (마이크로초)
    pub fn average_ack_latency_us(&self) -> Option<u64> {
        if self.ack_latency_samples.is_empty() {
            return None;
        }
        Some(self.ack_latency_samples.iter().sum::<u64>() / self.ack_latency_samples.len() as u64)
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 데이터 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / elapsed
    }

    /// 재전송 비율
    pub fn retransmit_rate(&self) -> f64 {
        if self.total_frames == 0 {
            return 0.0;
        }
        self.retransmitted_frames as f64 / self.total_frames as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sessions: {}/{} ({} aborted) | Frames: {} | Bytes: {} | Throughput: {:.2} KB/s | Retransmit: {:.2}% | ACKs: {} | Mismatch: {} | Timeouts: {}",
            self.elapsed().as_secs_f64(),
            self.sessions_completed,
            self.sessions_started,
            self.sessions_aborted,
            self.total_frames,
            self.total_bytes,
            self.throughput() / 1_000.0,
            self.retransmit_rate() * 100.0,
            self.acks_received,
            self.ack_mismatches,
            self.ack_timeouts,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}
