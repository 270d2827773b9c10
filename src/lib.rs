//! # Notiflow
//!
//! 작은 MTU의 notify 기반 링크(BLE 등) 위에서 큰 페이로드(JPEG, WAV)를
//! 프레임 단위로 나누어 보내는 ACK 기반 전송 프로토콜
//!
//! ## 핵심 특징
//! - **프레임 분할**: 헤더 + 시퀀스 번호가 붙은 데이터 프레임 + 종료 프레임
//! - **ACK 게이트**: 프레임마다(또는 헤더만) ACK 대기, 와일드카드 ACK로 flush
//! - **협조적 tick**: 한 tick에 최대 한 프레임, 호출자를 블로킹하지 않음
//! - **타임아웃 재전송**: ACK 데드라인 초과 시 재전송 후 중단
//! - **단일 세션**: 동시에 하나의 전송만 활성

pub mod ack;
pub mod collab;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod driver;
pub mod error;
pub mod frame;
pub mod link;
pub mod receiver;
pub mod stats;
pub mod transfer;

pub use ack::{Ack, AckOutcome, PendingAck};
pub use config::{AckMode, Config, MismatchPolicy, SupersedePolicy};
pub use coordinator::{SessionCoordinator, TransferEvent};
pub use device::{Command, Device};
pub use driver::TickDriver;
pub use error::{Error, LinkError, Result};
pub use frame::{Frame, FrameEncoder, Header, Sequence, WireFrame};
pub use link::{ChannelLink, Link, PeerChange, UdpLink};
pub use receiver::{Reassembler, ReassemblyEvent};
pub use stats::TransferStats;
pub use transfer::{PayloadKind, SessionSnapshot, TickOutcome, TransferSession, TransferState};

/// 기본 청크 크기 (MTU 247 - ATT 3 - 시퀀스 2)
pub const DEFAULT_CHUNK_SIZE: usize = 242;

/// 최대 청크 크기 (ATT 최대 값 512 - 시퀀스 2)
pub const MAX_CHUNK_SIZE: usize = 510;

/// 헤더 식별자
pub const HEADER_MARKER: u16 = 0xFFFF;

/// 종료 프레임 앞 두 바이트
pub const END_PREFIX: [u8; 2] = [0xFF, 0xFE];

/// 종료 프레임 값
pub const END_SENTINEL: u32 = 11111;

/// 중단 알림 프레임 앞 두 바이트
pub const ABORT_PREFIX: [u8; 2] = [0xFF, 0xFD];

/// 와일드카드 ACK 시퀀스 (무조건 flush)
pub const WILDCARD_SEQUENCE: u16 = 0xFFFF;

/// 헤더 ACK 시퀀스
pub const HEADER_SEQUENCE: u16 = 0xFFFE;

/// 전송당 최대 데이터 프레임 수
///
/// `0xFFxx`로 시작하는 프레임은 제어용으로 예약되어 있으므로
/// 데이터 시퀀스는 `0xFF00` 미만이다.
pub const MAX_FRAMES: usize = 0xFF00;
