//! 프로토콜 설정

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};

/// ACK 대기 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckMode {
    /// 헤더와 모든 데이터 프레임마다 ACK 대기
    PerFrame,

    /// 헤더만 ACK 대기, 데이터는 연속 전송
    HeaderOnly,

    /// ACK 없이 전송 (fire-and-forget)
    None,
}

/// 대기 중인 시퀀스와 다른 ACK 수신 시 처리 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MismatchPolicy {
    /// 무시하고 계속 대기 (타임아웃으로 진행)
    Ignore,

    /// 와일드카드처럼 대기 해제
    Flush,
}

/// 전송 중 새 전송 요청 시 처리 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupersedePolicy {
    /// `Busy`로 거절
    Reject,

    /// 기존 세션을 중단하고 새로 시작
    Supersede,
}

/// 전송 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 데이터 프레임당 페이로드 크기 (바이트, 시퀀스 헤더 제외)
    pub chunk_size: usize,

    /// tick 주기 (밀리초)
    pub tick_interval_ms: u64,

    /// ACK 대기 타임아웃 (밀리초)
    pub ack_timeout_ms: u64,

    /// 타임아웃 시 재전송 횟수, 초과하면 세션 중단
    pub max_retransmits: u32,

    pub ack_mode: AckMode,

    pub mismatch_policy: MismatchPolicy,

    pub supersede_policy: SupersedePolicy,

    /// 진행률 로그 주기 (프레임 수, 0이면 비활성)
    pub progress_log_interval: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            tick_interval_ms: 20,
            ack_timeout_ms: 500,
            max_retransmits: 1,
            ack_mode: AckMode::PerFrame,
            mismatch_policy: MismatchPolicy::Ignore,
            supersede_policy: SupersedePolicy::Reject,
            progress_log_interval: 10,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidChunkSize(self.chunk_size));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// 헤더 이후 데이터 프레임도 ACK 대기하는지
    pub fn gates_data(&self) -> bool {
        self.ack_mode == AckMode::PerFrame
    }

    /// 헤더 ACK 대기 여부
    pub fn gates_header(&self) -> bool {
        self.ack_mode != AckMode::None
    }

    /// ACK 없는 연속 전송 설정 (초기 펌웨어 방식)
    pub fn fire_and_forget() -> Self {
        Self {
            tick_interval_ms: 30,
            ack_mode: AckMode::None,
            ..Self::default()
        }
    }

    /// 느리고 불안정한 링크용 설정
    pub fn slow_link() -> Self {
        Self {
            chunk_size: 180,
            tick_interval_ms: 50,
            ack_timeout_ms: 2000,
            max_retransmits: 3,
            ack_mode: AckMode::PerFrame,
            mismatch_policy: MismatchPolicy::Ignore,
            supersede_policy: SupersedePolicy::Reject,
            progress_log_interval: 15,
        }
    }
}
