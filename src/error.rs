//! 에러 타입 정의

use thiserror::Error;

use crate::frame::Sequence;

/// 링크 어댑터 수준 에러
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("연결되지 않음")]
    Disconnected,

    #[error("프레임 크기 초과: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("송신 큐 가득 참")]
    QueueFull,

    #[error("전송 실패: {0}")]
    Transport(String),
}

/// 전송 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("링크가 연결되지 않음")]
    NotConnected,

    #[error("이미 전송 중인 세션이 있음")]
    Busy,

    #[error("ACK 타임아웃: {frame} (재전송 {retransmits}회)")]
    AckTimeout { frame: String, retransmits: u32 },

    #[error("ACK 시퀀스 불일치: expected {expected}, got {got}")]
    SequenceMismatch { expected: String, got: String },

    #[error("링크 실패: {0}")]
    LinkFailure(#[from] LinkError),

    #[error("빈 페이로드")]
    EmptyPayload,

    #[error("페이로드가 너무 큼: {len} bytes ({frames} 프레임)")]
    PayloadTooLarge { len: usize, frames: usize },

    #[error("유효하지 않은 청크 크기: {0}")]
    InvalidChunkSize(usize),

    #[error("유효하지 않은 제어 메시지: {0:?}")]
    InvalidControlMessage(Vec<u8>),

    #[error("유효하지 않은 프레임: {0}")]
    InvalidFrame(String),

    #[error("예상하지 못한 시퀀스: expected {expected}, got {got}")]
    UnexpectedSequence { expected: Sequence, got: Sequence },

    #[error("길이 불일치: 헤더 {declared} bytes, 수신 {received} bytes")]
    LengthMismatch { declared: usize, received: usize },

    #[error("세션 중단: {0}")]
    Aborted(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
