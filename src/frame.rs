//! 프레임 인코딩
//!
//! - Header: 전송당 한 번, 전체 길이와 프레임 수 공지 (8 bytes)
//! - Data: `[sequence:u16 BE, bytes...]`, chunk_size 이하
//! - End: 전송 종료 표시 (6 bytes)
//! - Abort: 송신측 중단 알림 `[0xFF, 0xFD, reason...]`
//!
//! 데이터 시퀀스는 `MAX_FRAMES`(0xFF00) 미만으로 제한되므로 `FF xx`로
//! 시작하는 제어 프레임과 겹치지 않는다.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, ABORT_PREFIX, END_PREFIX, END_SENTINEL, HEADER_MARKER, MAX_FRAMES};

/// 데이터 프레임 시퀀스 번호
pub type Sequence = u16;

/// 헤더 프레임 크기
pub const HEADER_LEN: usize = 8;

/// 종료 프레임 크기
pub const END_LEN: usize = 6;

/// 데이터 프레임의 시퀀스 필드 크기
pub const SEQUENCE_LEN: usize = 2;

/// 헤더 프레임
///
/// bincode 기본 설정(고정 폭, little-endian)으로 직렬화하면
/// `[0xFF, 0xFF, length:u32 LE, frame_count:u16 LE]`가 된다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// 헤더 식별자 (`HEADER_MARKER`)
    pub marker: u16,

    /// 전체 페이로드 길이
    pub length: u32,

    /// 전체 데이터 프레임 수
    pub frame_count: u16,
}

impl Header {
    pub fn new(length: u32, frame_count: u16) -> Self {
        Self {
            marker: HEADER_MARKER,
            length,
            frame_count,
        }
    }

    /// 버퍼에 헤더 직렬화
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.clear();
        bincode::serialize_into(buf.writer(), self)?;
        Ok(())
    }

    /// 바이트에서 헤더 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HEADER_LEN {
            return None;
        }
        let header: Header = bincode::deserialize(bytes).ok()?;
        (header.marker == HEADER_MARKER).then_some(header)
    }

    /// 마지막 프레임 길이
    pub fn last_frame_len(&self, chunk_size: usize) -> usize {
        if self.frame_count == 0 {
            return 0;
        }
        self.length as usize - (self.frame_count as usize - 1) * chunk_size
    }
}

/// 종료 프레임 직렬화
pub fn encode_end_into(buf: &mut BytesMut) {
    buf.clear();
    buf.put_slice(&END_PREFIX);
    buf.put_u32_le(END_SENTINEL);
}

/// 중단 알림 프레임 직렬화
pub fn encode_abort_into(buf: &mut BytesMut, reason: &str) {
    buf.clear();
    buf.put_slice(&ABORT_PREFIX);
    buf.put_slice(reason.as_bytes());
}

/// 페이로드 길이에 대한 프레임 수 (올림)
pub fn frame_count(len: usize, chunk_size: usize) -> usize {
    (len + chunk_size - 1) / chunk_size
}

/// 전송 가능한 페이로드 길이인지 검증하고 프레임 수 반환
pub fn checked_frame_count(len: usize, chunk_size: usize) -> Result<u16> {
    if chunk_size == 0 {
        return Err(Error::InvalidChunkSize(chunk_size));
    }
    if len == 0 {
        return Err(Error::EmptyPayload);
    }

    let frames = frame_count(len, chunk_size);
    if frames > MAX_FRAMES || len > u32::MAX as usize {
        return Err(Error::PayloadTooLarge { len, frames });
    }
    Ok(frames as u16)
}

/// 데이터 프레임 (페이로드에 대한 borrowed view)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub sequence: Sequence,
    pub is_final: bool,
    pub bytes: &'a [u8],
}

impl Frame<'_> {
    /// 버퍼에 `[sequence BE, bytes]` 직렬화
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.clear();
        buf.reserve(SEQUENCE_LEN + self.bytes.len());
        buf.put_u16(self.sequence);
        buf.put_slice(self.bytes);
    }

    /// 직렬화된 프레임 길이
    pub fn wire_len(&self) -> usize {
        SEQUENCE_LEN + self.bytes.len()
    }
}

/// 프레임 인코더
///
/// 페이로드와 chunk_size에 대한 순수 함수. 순서와 무관하게 같은 시퀀스는
/// 항상 같은 바이트를 돌려주므로 재전송에 그대로 사용한다.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    payload: Bytes,
    chunk_size: usize,
    frame_count: u16,
}

impl FrameEncoder {
    /// 새 인코더 생성
    pub fn new(payload: Bytes, chunk_size: usize) -> Result<Self> {
        let frame_count = checked_frame_count(payload.len(), chunk_size)?;

        Ok(Self {
            payload,
            chunk_size,
            frame_count,
        })
    }

    pub fn header(&self) -> Header {
        Header::new(self.payload.len() as u32, self.frame_count)
    }

    pub fn frame_count(&self) -> u16 {
        self.frame_count
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// 시퀀스 `sequence` 프레임: `[i*C, min((i+1)*C, len))`
    pub fn frame(&self, sequence: Sequence) -> Option<Frame<'_>> {
        if sequence >= self.frame_count {
            return None;
        }

        let start = sequence as usize * self.chunk_size;
        let end = self.cursor_after(sequence);

        Some(Frame {
            sequence,
            is_final: sequence + 1 == self.frame_count,
            bytes: &self.payload[start..end],
        })
    }

    /// 시퀀스 `sequence`까지 보낸 뒤의 누적 바이트 수
    pub fn cursor_after(&self, sequence: Sequence) -> usize {
        ((sequence as usize + 1) * self.chunk_size).min(self.payload.len())
    }

    /// 전체 프레임 순회
    pub fn frames(&self) -> impl Iterator<Item = Frame<'_>> + '_ {
        (0..self.frame_count).filter_map(move |seq| self.frame(seq))
    }
}

/// 수신측에서 해석한 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Header(Header),
    Data { sequence: Sequence, bytes: Bytes },
    End,
    Abort(String),
}

impl WireFrame {
    /// 수신 바이트 해석
    pub fn decode(bytes: Bytes) -> Result<Self> {
        if bytes.len() == HEADER_LEN && bytes[..2] == HEADER_MARKER.to_le_bytes() {
            return Header::from_bytes(&bytes)
                .map(WireFrame::Header)
                .ok_or_else(|| Error::InvalidFrame("헤더 역직렬화 실패".into()));
        }

        if bytes.len() >= 2 && bytes[..2] == END_PREFIX {
            if bytes.len() == END_LEN
                && u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) == END_SENTINEL
            {
                return Ok(WireFrame::End);
            }
            return Err(Error::InvalidFrame(format!("종료 프레임 형식 오류: {} bytes", bytes.len())));
        }

        if bytes.len() >= 2 && bytes[..2] == ABORT_PREFIX {
            let reason = String::from_utf8_lossy(&bytes[2..]).into_owned();
            return Ok(WireFrame::Abort(reason));
        }

        if bytes.len() <= SEQUENCE_LEN {
            return Err(Error::InvalidFrame(format!("데이터 프레임이 너무 짧음: {} bytes", bytes.len())));
        }

        let sequence = u16::from_be_bytes([bytes[0], bytes[1]]);
        if sequence as usize >= MAX_FRAMES {
            return Err(Error::InvalidFrame(format!("예약된 시퀀스: {:#06X}", sequence)));
        }

        Ok(WireFrame::Data {
            sequence,
            bytes: bytes.slice(SEQUENCE_LEN..),
        })
    }
}
