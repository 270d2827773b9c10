//! 수신자 (central측)
//!
//! - 헤더/데이터/종료 프레임 해석 및 조립
//! - 프레임별 ACK 토큰 생성
//! - 선언 길이 검증

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::ack::Ack;
use crate::frame::{Header, Sequence, WireFrame};
use crate::{AckMode, Error, Result};

/// 프레임 하나를 처리한 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyEvent {
    /// 헤더 수신, 새 조립 시작
    Started { header: Header, ack: Option<Ack> },

    /// 다음 데이터 프레임 수신
    Progress { sequence: Sequence, received: usize, ack: Option<Ack> },

    /// 이미 받은 프레임 (송신측 재전송), ACK만 다시 보낸다
    Duplicate { sequence: Sequence, ack: Option<Ack> },

    /// 종료 프레임 수신, 조립 완료
    Completed { payload: Bytes },

    /// 송신측이 전송을 중단함
    Aborted { reason: String },
}

impl ReassemblyEvent {
    /// 송신측에 회신할 ACK
    pub fn ack(&self) -> Option<Ack> {
        match self {
            ReassemblyEvent::Started { ack, .. }
            | ReassemblyEvent::Progress { ack, .. }
            | ReassemblyEvent::Duplicate { ack, .. } => *ack,
            _ => None,
        }
    }
}

/// 진행 중인 조립
#[derive(Debug)]
struct Assembly {
    header: Header,
    buf: BytesMut,
    next_sequence: Sequence,
}

/// 페이로드 조립기
#[derive(Debug)]
pub struct Reassembler {
    ack_mode: AckMode,
    assembly: Option<Assembly>,
    completed: u64,
}

impl Reassembler {
    pub fn new(ack_mode: AckMode) -> Self {
        Self {
            ack_mode,
            assembly: None,
            completed: 0,
        }
    }

    /// 조립 중 여부
    pub fn in_progress(&self) -> bool {
        self.assembly.is_some()
    }

    /// 지금까지 받은 바이트
    pub fn received(&self) -> usize {
        self.assembly.as_ref().map_or(0, |a| a.buf.len())
    }

    /// 완료한 페이로드 수
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// 진행 중인 조립 폐기
    pub fn reset(&mut self) {
        if self.assembly.take().is_some() {
            debug!("조립 중인 페이로드 폐기");
        }
    }

    /// 수신 프레임 처리
    ///
    /// 형식 오류나 순서 어긋남은 에러로 돌려주며 진행 중인 조립은 유지한다.
    /// 길이 불일치로 끝난 조립은 폐기된다.
    pub fn push(&mut self, bytes: Bytes) -> Result<ReassemblyEvent> {
        match WireFrame::decode(bytes)? {
            WireFrame::Header(header) => Ok(self.on_header(header)),
            WireFrame::Data { sequence, bytes } => self.on_data(sequence, bytes),
            WireFrame::End => self.on_end(),
            WireFrame::Abort(reason) => {
                warn!("송신측 중단 통지: {}", reason);
                self.assembly = None;
                Ok(ReassemblyEvent::Aborted { reason })
            }
        }
    }

    fn on_header(&mut self, header: Header) -> ReassemblyEvent {
        if let Some(previous) = self.assembly.take() {
            if previous.header == header && previous.next_sequence == 0 {
                debug!("헤더 재수신");
            } else {
                warn!(
                    "조립 중 새 헤더 수신, 이전 조립 폐기 ({}/{} bytes)",
                    previous.buf.len(),
                    previous.header.length
                );
            }
        }

        info!(
            "수신 시작: {} bytes, {} 프레임",
            header.length, header.frame_count
        );

        self.assembly = Some(Assembly {
            header,
            buf: BytesMut::with_capacity(header.length as usize),
            next_sequence: 0,
        });

        let ack = match self.ack_mode {
            AckMode::PerFrame | AckMode::HeaderOnly => Some(Ack::Header),
            AckMode::None => None,
        };
        ReassemblyEvent::Started { header, ack }
    }

    fn on_data(&mut self, sequence: Sequence, bytes: Bytes) -> Result<ReassemblyEvent> {
        let ack = match self.ack_mode {
            AckMode::PerFrame => Some(Ack::Sequence(sequence)),
            AckMode::HeaderOnly | AckMode::None => None,
        };

        let assembly = self
            .assembly
            .as_mut()
            .ok_or_else(|| Error::InvalidFrame(format!("헤더 없이 데이터 프레임 수신: {}", sequence)))?;

        if sequence < assembly.next_sequence {
            debug!("중복 프레임: {}", sequence);
            return Ok(ReassemblyEvent::Duplicate { sequence, ack });
        }
        if sequence > assembly.next_sequence {
            return Err(Error::UnexpectedSequence {
                expected: assembly.next_sequence,
                got: sequence,
            });
        }

        let declared = assembly.header.length as usize;
        if assembly.buf.len() + bytes.len() > declared {
            let received = assembly.buf.len() + bytes.len();
            self.assembly = None;
            return Err(Error::LengthMismatch { declared, received });
        }

        assembly.buf.extend_from_slice(&bytes);
        assembly.next_sequence += 1;

        Ok(ReassemblyEvent::Progress {
            sequence,
            received: assembly.buf.len(),
            ack,
        })
    }

    fn on_end(&mut self) -> Result<ReassemblyEvent> {
        let assembly = self
            .assembly
            .take()
            .ok_or_else(|| Error::InvalidFrame("헤더 없이 종료 프레임 수신".into()))?;

        let declared = assembly.header.length as usize;
        if assembly.buf.len() != declared {
            return Err(Error::LengthMismatch {
                declared,
                received: assembly.buf.len(),
            });
        }

        self.completed += 1;
        info!("수신 완료: {} bytes", declared);

        Ok(ReassemblyEvent::Completed {
            payload: assembly.buf.freeze(),
        })
    }
}
