//! 전송 상태 머신
//!
//! 외부 tick 호출마다 최대 한 프레임을 내보낸다.
//!
//! ```text
//! Idle -> HeaderPending -> AwaitingHeaderAck -> SendingData <-> AwaitingDataAck -> Complete -> Idle
//! ```
//!
//! 어느 상태에서든 중단되면 `Idle`로 돌아가며 페이로드 참조를 놓는다.

use std::fmt;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::ack::{Ack, AckOutcome, AckTracker, Awaited, Deadline, PendingAck};
use crate::error::LinkError;
use crate::frame::{encode_end_into, FrameEncoder, Sequence};
use crate::link::Link;
use crate::stats::TransferStats;
use crate::{Config, Error, Result, MAX_CHUNK_SIZE};

/// 큐 포화 시 같은 프레임을 다시 시도하는 횟수
const MAX_SEND_RETRIES: u32 = 1;

/// 세션 ID
pub type TransferId = u64;

/// 전송 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    HeaderPending,
    AwaitingHeaderAck,
    SendingData,
    AwaitingDataAck,
    /// 모든 데이터 프레임 송신 완료, 종료 프레임 대기
    Complete,
}

/// 페이로드 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Image,
    Audio,
    Other,
}

impl PayloadKind {
    /// 저장 파일 확장자
    pub fn extension(&self) -> &'static str {
        match self {
            PayloadKind::Image => "jpg",
            PayloadKind::Audio => "wav",
            PayloadKind::Other => "bin",
        }
    }
}

impl PayloadKind {
    /// 매직 바이트로 종류 추정 (JPEG SOI, RIFF/WAVE)
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(&[0xFF, 0xD8]) {
            PayloadKind::Image
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
            PayloadKind::Audio
        } else {
            PayloadKind::Other
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Image => f.write_str("image"),
            PayloadKind::Audio => f.write_str("audio"),
            PayloadKind::Other => f.write_str("payload"),
        }
    }
}

/// 송신한 프레임
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentFrame {
    Header,
    Data { sequence: Sequence, len: usize },
    End,
}

/// 세션 중단 사유
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// 재전송 후에도 ACK 없음
    AckTimeout { awaited: Awaited, retransmits: u32 },

    /// 송신 자체 실패
    LinkFailure(LinkError),

    /// 링크 끊김
    LinkDown,

    /// 새 전송 요청으로 대체됨
    Superseded,

    /// 명시적 중단
    Cancelled,

    /// 프레임 직렬화 실패
    Encoding(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::AckTimeout { awaited, retransmits } => {
                write!(f, "ack timeout on {} after {} retransmits", awaited, retransmits)
            }
            AbortReason::LinkFailure(e) => write!(f, "link failure: {}", e),
            AbortReason::LinkDown => f.write_str("link down"),
            AbortReason::Superseded => f.write_str("superseded"),
            AbortReason::Cancelled => f.write_str("cancelled"),
            AbortReason::Encoding(e) => write!(f, "encoding: {}", e),
        }
    }
}

impl From<AbortReason> for Error {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::AckTimeout { awaited, retransmits } => Error::AckTimeout {
                frame: awaited.to_string(),
                retransmits,
            },
            AbortReason::LinkFailure(e) => Error::LinkFailure(e),
            AbortReason::LinkDown => Error::NotConnected,
            other => Error::Aborted(other.to_string()),
        }
    }
}

/// tick 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// 활성 세션 없음
    Idle,

    /// ACK 대기 중
    Waiting,

    Sent(SentFrame),

    /// 타임아웃으로 같은 프레임 재전송
    Retransmitted(Awaited),

    /// 송신 큐 포화, 다음 tick에 재시도
    Backpressure,

    Completed { id: TransferId, kind: PayloadKind, bytes: usize },

    Aborted { id: TransferId, kind: PayloadKind, reason: AbortReason },
}

/// 세션 상태 스냅샷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: Option<TransferId>,
    pub state: TransferState,
    pub kind: Option<PayloadKind>,
    /// 송신한 데이터 바이트
    pub cursor: usize,
    /// 다음에 보낼 데이터 시퀀스
    pub sequence: Sequence,
    pub awaiting_ack: bool,
    pub frame_count: u16,
    pub payload_len: usize,
}

/// 활성 전송의 페이로드 바인딩
#[derive(Debug)]
struct ActiveTransfer {
    id: TransferId,
    kind: PayloadKind,
    encoder: FrameEncoder,
    started_at: Instant,
}

/// 전송 세션
///
/// tick 경로와 ACK 콜백 경로가 공유하므로 coordinator가 하나의 락으로 감싼다.
#[derive(Debug)]
pub struct TransferSession {
    config: Config,
    tracker: AckTracker,
    state: TransferState,
    active: Option<ActiveTransfer>,
    cursor: usize,
    sequence: Sequence,
    pending: Option<PendingAck>,
    send_retries: u32,
    /// 프레임 직렬화용 버퍼, 세션 동안 재사용
    scratch: BytesMut,
    next_id: TransferId,
    stats: TransferStats,
}

impl TransferSession {
    pub fn new(config: Config) -> Self {
        Self {
            tracker: AckTracker::new(&config),
            scratch: BytesMut::with_capacity(MAX_CHUNK_SIZE + 2),
            config,
            state: TransferState::Idle,
            active: None,
            cursor: 0,
            sequence: 0,
            pending: None,
            send_retries: 0,
            next_id: 1,
            stats: TransferStats::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != TransferState::Idle
    }

    pub fn awaiting_ack(&self) -> bool {
        self.pending.is_some()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.active.as_ref().map(|a| a.id),
            state: self.state,
            kind: self.active.as_ref().map(|a| a.kind),
            cursor: self.cursor,
            sequence: self.sequence,
            awaiting_ack: self.awaiting_ack(),
            frame_count: self.active.as_ref().map_or(0, |a| a.encoder.frame_count()),
            payload_len: self.active.as_ref().map_or(0, |a| a.encoder.payload_len()),
        }
    }

    /// 새 전송 시작 (`Idle`에서만)
    pub fn start(&mut self, payload: Bytes, kind: PayloadKind, now: Instant) -> Result<TransferId> {
        if self.is_active() {
            return Err(Error::Busy);
        }

        let encoder = FrameEncoder::new(payload, self.config.chunk_size)?;
        let id = self.next_id;
        self.next_id += 1;

        info!(
            "전송 시작: id={}, {} {} bytes, {} 프레임 (chunk {})",
            id,
            kind,
            encoder.payload_len(),
            encoder.frame_count(),
            encoder.chunk_size()
        );

        self.reset();
        self.active = Some(ActiveTransfer {
            id,
            kind,
            encoder,
            started_at: now,
        });
        self.state = TransferState::HeaderPending;
        self.stats.sessions_started += 1;

        Ok(id)
    }

    /// 한 단계 진행. 최대 한 프레임만 송신하고 바로 반환한다.
    pub fn tick(&mut self, link: &dyn Link, now: Instant) -> TickOutcome {
        if !self.is_active() {
            return TickOutcome::Idle;
        }
        // 끊김을 감지하면 콜백 여부와 무관하게 중단, 재연결해도 이어서 보내지 않는다
        if !link.is_connected() {
            return self.finish_aborted(AbortReason::LinkDown);
        }

        if self.pending.is_some() {
            return match self.tracker.check_deadline(self.pending.as_ref(), now) {
                Deadline::Wait => TickOutcome::Waiting,
                Deadline::Retransmit(awaited) => self.retransmit(link, awaited, now),
                Deadline::Expired { awaited, retransmits } => {
                    warn!("ACK 타임아웃: {} (재전송 {}회)", awaited, retransmits);
                    self.stats.ack_timeouts += 1;
                    let reason = AbortReason::AckTimeout { awaited, retransmits };
                    link.notify_failure(&reason.to_string());
                    self.finish_aborted(reason)
                }
            };
        }

        match self.state {
            TransferState::Idle => TickOutcome::Idle,
            TransferState::HeaderPending => self.send_header(link, now),
            // 대기가 외부에서 해제되었지만 상태 전이가 누락된 경우
            TransferState::AwaitingHeaderAck | TransferState::AwaitingDataAck => {
                self.advance_after_ack();
                TickOutcome::Waiting
            }
            TransferState::SendingData => self.send_next_data(link, now),
            TransferState::Complete => self.send_end(link),
        }
    }

    /// 수신 ACK 처리
    pub fn on_ack(&mut self, ack: Ack, now: Instant) -> AckOutcome {
        let sent_at = self.pending.as_ref().map(|p| p.sent_at);
        let outcome = self.tracker.resolve(&mut self.pending, ack);

        match outcome {
            AckOutcome::Cleared(awaited) | AckOutcome::Flushed { awaited, .. } => {
                if let Some(sent_at) = sent_at {
                    self.stats.record_ack(now.saturating_duration_since(sent_at));
                }
                if matches!(outcome, AckOutcome::Flushed { .. }) {
                    self.stats.ack_mismatches += 1;
                }
                debug!("ACK 수신: {} ({})", awaited, ack);
                self.advance_after_ack();
            }
            AckOutcome::Mismatch { .. } => {
                self.stats.ack_mismatches += 1;
            }
            AckOutcome::Stale(_) => {}
        }

        outcome
    }

    /// 어느 상태에서든 `Idle`로 강제 복귀. 활성 세션이 있었으면 그 결과를 돌려준다.
    pub fn abort(&mut self, reason: AbortReason) -> Option<TickOutcome> {
        if !self.is_active() {
            return None;
        }
        Some(self.finish_aborted(reason))
    }

    fn advance_after_ack(&mut self) {
        let frame_count = self.frame_count();
        self.state = match self.state {
            TransferState::AwaitingHeaderAck => TransferState::SendingData,
            TransferState::AwaitingDataAck if self.sequence >= frame_count => TransferState::Complete,
            TransferState::AwaitingDataAck => TransferState::SendingData,
            other => other,
        };
    }

    fn frame_count(&self) -> u16 {
        self.active.as_ref().map_or(0, |a| a.encoder.frame_count())
    }

    fn send_header(&mut self, link: &dyn Link, now: Instant) -> TickOutcome {
        if let Err(reason) = self.transmit(link, SentFrame::Header) {
            return self.on_send_error(link, reason);
        }

        if self.config.gates_header() {
            self.pending = Some(PendingAck::new(Awaited::Header, now));
            self.state = TransferState::AwaitingHeaderAck;
        } else {
            self.state = TransferState::SendingData;
        }
        TickOutcome::Sent(SentFrame::Header)
    }

    fn send_next_data(&mut self, link: &dyn Link, now: Instant) -> TickOutcome {
        let sequence = self.sequence;
        let (len, cursor, frame_count) = match self.active.as_ref() {
            Some(active) => match active.encoder.frame(sequence) {
                Some(frame) => (
                    frame.bytes.len(),
                    active.encoder.cursor_after(sequence),
                    active.encoder.frame_count(),
                ),
                None => {
                    self.state = TransferState::Complete;
                    return TickOutcome::Waiting;
                }
            },
            None => return TickOutcome::Idle,
        };

        let sent = SentFrame::Data { sequence, len };
        if let Err(reason) = self.transmit(link, sent) {
            return self.on_send_error(link, reason);
        }

        self.cursor = cursor;
        self.sequence = sequence + 1;
        self.stats.total_bytes += len as u64;
        self.log_progress(frame_count);

        if self.config.gates_data() {
            self.pending = Some(PendingAck::new(Awaited::Data(sequence), now));
            self.state = TransferState::AwaitingDataAck;
        } else if self.sequence >= frame_count {
            self.state = TransferState::Complete;
        }

        TickOutcome::Sent(sent)
    }

    fn send_end(&mut self, link: &dyn Link) -> TickOutcome {
        if let Err(reason) = self.transmit(link, SentFrame::End) {
            return self.on_send_error(link, reason);
        }

        let Some(active) = self.active.take() else {
            self.reset();
            return TickOutcome::Idle;
        };

        let bytes = active.encoder.payload_len();
        info!(
            "전송 완료: id={}, {} {} bytes, {:.1}ms",
            active.id,
            active.kind,
            bytes,
            active.started_at.elapsed().as_secs_f64() * 1000.0
        );

        self.stats.sessions_completed += 1;
        self.reset();

        TickOutcome::Completed {
            id: active.id,
            kind: active.kind,
            bytes,
        }
    }

    /// 만료된 프레임 재전송. 송신에 성공해야 재전송 횟수와 데드라인을 갱신한다.
    fn retransmit(&mut self, link: &dyn Link, awaited: Awaited, now: Instant) -> TickOutcome {
        let frame = match awaited {
            Awaited::Header => SentFrame::Header,
            Awaited::Data(sequence) => {
                let len = self
                    .active
                    .as_ref()
                    .and_then(|a| a.encoder.frame(sequence))
                    .map_or(0, |f| f.bytes.len());
                SentFrame::Data { sequence, len }
            }
        };

        warn!("ACK 지연, 재전송: {}", awaited);

        if let Err(reason) = self.transmit(link, frame) {
            return self.on_send_error(link, reason);
        }
        if let Some(pending) = self.pending.as_mut() {
            pending.retransmit(now);
        }
        self.stats.retransmitted_frames += 1;
        TickOutcome::Retransmitted(awaited)
    }

    /// 프레임을 scratch 버퍼에 직렬화해 송신
    fn transmit(&mut self, link: &dyn Link, frame: SentFrame) -> std::result::Result<(), AbortReason> {
        let Some(active) = self.active.as_ref() else {
            return Err(AbortReason::Cancelled);
        };

        match frame {
            SentFrame::Header => active
                .encoder
                .header()
                .encode_into(&mut self.scratch)
                .map_err(|e| AbortReason::Encoding(e.to_string()))?,
            SentFrame::Data { sequence, .. } => match active.encoder.frame(sequence) {
                Some(data) => data.encode_into(&mut self.scratch),
                None => return Err(AbortReason::Encoding(format!("시퀀스 범위 초과: {}", sequence))),
            },
            SentFrame::End => encode_end_into(&mut self.scratch),
        }

        link.send_frame(&self.scratch)
            .map_err(AbortReason::LinkFailure)?;

        self.send_retries = 0;
        self.stats.total_frames += 1;
        Ok(())
    }

    fn on_send_error(&mut self, link: &dyn Link, reason: AbortReason) -> TickOutcome {
        if reason == AbortReason::LinkFailure(LinkError::QueueFull)
            && self.send_retries < MAX_SEND_RETRIES
        {
            self.send_retries += 1;
            debug!("송신 큐 포화, 다음 tick에 재시도");
            return TickOutcome::Backpressure;
        }

        if let AbortReason::LinkFailure(ref e) = reason {
            warn!("프레임 송신 실패: {}", e);
            self.stats.link_failures += 1;
        }
        link.notify_failure(&reason.to_string());
        self.finish_aborted(reason)
    }

    fn finish_aborted(&mut self, reason: AbortReason) -> TickOutcome {
        let (id, kind) = self
            .active
            .as_ref()
            .map_or((0, PayloadKind::Other), |a| (a.id, a.kind));

        warn!(
            "전송 중단: id={}, {} ({}/{} bytes 송신)",
            id,
            reason,
            self.cursor,
            self.active.as_ref().map_or(0, |a| a.encoder.payload_len())
        );

        self.stats.sessions_aborted += 1;
        self.reset();

        TickOutcome::Aborted { id, kind, reason }
    }

    fn log_progress(&self, frame_count: u16) {
        let interval = self.config.progress_log_interval;
        if interval == 0 || self.sequence % interval != 0 {
            return;
        }
        if let Some(active) = self.active.as_ref() {
            info!(
                "진행: {}/{} bytes ({}/{} 프레임)",
                self.cursor,
                active.encoder.payload_len(),
                self.sequence,
                frame_count
            );
        }
    }

    /// 커서, 시퀀스, 대기 플래그 초기화 및 페이로드 참조 해제
    fn reset(&mut self) {
        self.state = TransferState::Idle;
        self.active = None;
        self.cursor = 0;
        self.sequence = 0;
        self.pending = None;
        self.send_retries = 0;
        self.scratch.clear();
    }
}
