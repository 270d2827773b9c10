//! ACK 추적
//!
//! 수신측 제어 메시지를 해석해 세션의 ACK 대기를 해제하고,
//! 대기 데드라인을 관리한다.
//!
//! 제어 메시지 형식:
//! - 텍스트: `ACK:<n>`, `ACK:HDR`, `ACK:*`
//! - 바이너리: `[0x06, seq_hi, seq_lo]` (`0xFFFF` 와일드카드, `0xFFFE` 헤더)

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::MismatchPolicy;
use crate::frame::Sequence;
use crate::{Config, Error, Result, HEADER_SEQUENCE, WILDCARD_SEQUENCE};

/// 바이너리 ACK 식별 바이트 (ASCII ACK)
pub const BINARY_ACK_TAG: u8 = 0x06;

const TEXT_PREFIX: &str = "ACK:";

/// 수신된 ACK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ack {
    Header,
    Sequence(Sequence),
    /// 대기 중인 시퀀스와 무관하게 해제
    Wildcard,
}

impl Ack {
    fn from_raw(raw: u16) -> Self {
        match raw {
            WILDCARD_SEQUENCE => Ack::Wildcard,
            HEADER_SEQUENCE => Ack::Header,
            seq => Ack::Sequence(seq),
        }
    }

    fn raw(&self) -> u16 {
        match self {
            Ack::Header => HEADER_SEQUENCE,
            Ack::Sequence(seq) => *seq,
            Ack::Wildcard => WILDCARD_SEQUENCE,
        }
    }

    /// 제어 메시지 해석 (텍스트 또는 바이너리)
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() == 3 && bytes[0] == BINARY_ACK_TAG {
            return Ok(Self::from_raw(u16::from_be_bytes([bytes[1], bytes[2]])));
        }

        let invalid = || Error::InvalidControlMessage(bytes.to_vec());

        let text = std::str::from_utf8(bytes).map_err(|_| invalid())?;
        let token = text
            .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
            .strip_prefix(TEXT_PREFIX)
            .ok_or_else(invalid)?;

        match token {
            "*" => Ok(Ack::Wildcard),
            "HDR" => Ok(Ack::Header),
            num => num.parse::<u16>().map(Self::from_raw).map_err(|_| invalid()),
        }
    }

    /// 텍스트 토큰
    pub fn to_text(&self) -> String {
        match self {
            Ack::Header => format!("{}HDR", TEXT_PREFIX),
            Ack::Sequence(seq) => format!("{}{}", TEXT_PREFIX, seq),
            Ack::Wildcard => format!("{}*", TEXT_PREFIX),
        }
    }

    /// 바이너리 토큰
    pub fn to_bytes(&self) -> [u8; 3] {
        let [hi, lo] = self.raw().to_be_bytes();
        [BINARY_ACK_TAG, hi, lo]
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// ACK를 기다리는 프레임
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaited {
    Header,
    Data(Sequence),
}

impl Awaited {
    /// 정확히 일치하는 ACK인지 (와일드카드 제외)
    pub fn matches(&self, ack: Ack) -> bool {
        matches!(
            (self, ack),
            (Awaited::Header, Ack::Header) | (Awaited::Data(_), Ack::Sequence(_))
        ) && self.sequence() == ack.raw()
    }

    fn sequence(&self) -> u16 {
        match self {
            Awaited::Header => HEADER_SEQUENCE,
            Awaited::Data(seq) => *seq,
        }
    }
}

impl fmt::Display for Awaited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Awaited::Header => f.write_str("header"),
            Awaited::Data(seq) => write!(f, "frame {}", seq),
        }
    }
}

/// 응답 대기 중인 ACK
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub awaited: Awaited,

    /// 마지막 (재)전송 시각
    pub sent_at: Instant,

    /// 재전송 횟수
    pub retransmits: u32,
}

impl PendingAck {
    pub fn new(awaited: Awaited, now: Instant) -> Self {
        Self {
            awaited,
            sent_at: now,
            retransmits: 0,
        }
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.sent_at) >= timeout
    }

    /// 재전송 기록, 데드라인 재설정
    pub fn retransmit(&mut self, now: Instant) {
        self.sent_at = now;
        self.retransmits += 1;
    }
}

/// ACK 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// 대기 해제 (일치 또는 와일드카드)
    Cleared(Awaited),

    /// 불일치 ACK로 flush 정책에 따라 대기 해제
    Flushed { awaited: Awaited, got: Ack },

    /// 불일치 ACK 무시, 계속 대기
    Mismatch { awaited: Awaited, got: Ack },

    /// 대기 중인 프레임 없음
    Stale(Ack),
}

impl AckOutcome {
    pub fn cleared(&self) -> bool {
        matches!(self, AckOutcome::Cleared(_) | AckOutcome::Flushed { .. })
    }

    /// 불일치를 `SequenceMismatch` 에러로 변환
    pub fn check(self) -> Result<Self> {
        match self {
            AckOutcome::Mismatch { awaited, got } => Err(Error::SequenceMismatch {
                expected: awaited.to_string(),
                got: got.to_string(),
            }),
            other => Ok(other),
        }
    }
}

/// 데드라인 점검 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// 대기 없음 또는 아직 시간 남음
    Wait,

    /// 같은 프레임 재전송
    Retransmit(Awaited),

    /// 재전송 한도 초과
    Expired { awaited: Awaited, retransmits: u32 },
}

/// ACK 추적기
#[derive(Debug, Clone)]
pub struct AckTracker {
    mismatch_policy: MismatchPolicy,
    timeout: Duration,
    max_retransmits: u32,
}

impl AckTracker {
    pub fn new(config: &Config) -> Self {
        Self {
            mismatch_policy: config.mismatch_policy,
            timeout: config.ack_timeout(),
            max_retransmits: config.max_retransmits,
        }
    }

    /// 수신 ACK로 대기 상태 갱신
    pub fn resolve(&self, pending: &mut Option<PendingAck>, ack: Ack) -> AckOutcome {
        let awaited = match pending {
            Some(p) => p.awaited,
            None => {
                debug!("대기 중이 아닌 상태에서 ACK 수신: {}", ack);
                return AckOutcome::Stale(ack);
            }
        };

        if ack == Ack::Wildcard || awaited.matches(ack) {
            *pending = None;
            return AckOutcome::Cleared(awaited);
        }

        match self.mismatch_policy {
            MismatchPolicy::Ignore => {
                warn!("ACK 불일치 무시: 대기 {}, 수신 {}", awaited, ack);
                AckOutcome::Mismatch { awaited, got: ack }
            }
            MismatchPolicy::Flush => {
                warn!("ACK 불일치, flush 처리: 대기 {}, 수신 {}", awaited, ack);
                *pending = None;
                AckOutcome::Flushed { awaited, got: ack }
            }
        }
    }

    /// 데드라인 점검
    ///
    /// 대기 상태는 바꾸지 않는다. 재전송이 실제로 나간 뒤 호출측이
    /// `PendingAck::retransmit`으로 기록한다.
    pub fn check_deadline(&self, pending: Option<&PendingAck>, now: Instant) -> Deadline {
        let Some(p) = pending else {
            return Deadline::Wait;
        };

        if !p.is_expired(now, self.timeout) {
            return Deadline::Wait;
        }

        if p.retransmits < self.max_retransmits {
            Deadline::Retransmit(p.awaited)
        } else {
            Deadline::Expired {
                awaited: p.awaited,
                retransmits: p.retransmits,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(policy: MismatchPolicy) -> AckTracker {
        let config = Config {
            mismatch_policy: policy,
            ack_timeout_ms: 100,
            max_retransmits: 1,
            ..Config::default()
        };
        AckTracker::new(&config)
    }

    #[test]
    fn test_parse_text_tokens() {
        assert_eq!(Ack::parse(b"ACK:12").unwrap(), Ack::Sequence(12));
        assert_eq!(Ack::parse(b"ACK:0\n").unwrap(), Ack::Sequence(0));
        assert_eq!(Ack::parse(b"ACK:*").unwrap(), Ack::Wildcard);
        assert_eq!(Ack::parse(b"ACK:HDR\0").unwrap(), Ack::Header);
        assert_eq!(Ack::parse(b"ACK:65535").unwrap(), Ack::Wildcard);

        assert!(Ack::parse(b"NAK:1").is_err());
        assert!(Ack::parse(b"ACK:").is_err());
        assert!(Ack::parse(b"ACK:70000").is_err());
        assert!(Ack::parse(&[0xC3, 0x28]).is_err());
    }

    #[test]
    fn test_parse_binary_tokens() {
        assert_eq!(Ack::parse(&[0x06, 0x01, 0x00]).unwrap(), Ack::Sequence(256));
        assert_eq!(Ack::parse(&[0x06, 0xFF, 0xFF]).unwrap(), Ack::Wildcard);
        assert_eq!(Ack::parse(&[0x06, 0xFF, 0xFE]).unwrap(), Ack::Header);

        for ack in [Ack::Header, Ack::Sequence(42), Ack::Wildcard] {
            assert_eq!(Ack::parse(&ack.to_bytes()).unwrap(), ack);
            assert_eq!(Ack::parse(ack.to_text().as_bytes()).unwrap(), ack);
        }
    }

    #[test]
    fn test_wildcard_clears_any_wait() {
        let tracker = tracker(MismatchPolicy::Ignore);
        let now = Instant::now();

        for awaited in [Awaited::Header, Awaited::Data(0), Awaited::Data(9)] {
            let mut pending = Some(PendingAck::new(awaited, now));
            let outcome = tracker.resolve(&mut pending, Ack::Wildcard);
            assert_eq!(outcome, AckOutcome::Cleared(awaited));
            assert!(pending.is_none());
        }
    }

    #[test]
    fn test_out_of_order_ack_is_ignored() {
        let tracker = tracker(MismatchPolicy::Ignore);
        let mut pending = Some(PendingAck::new(Awaited::Data(2), Instant::now()));

        let outcome = tracker.resolve(&mut pending, Ack::Sequence(3));
        assert!(matches!(outcome, AckOutcome::Mismatch { .. }));
        assert!(matches!(outcome.check(), Err(Error::SequenceMismatch { .. })));
        assert!(pending.is_some());

        // 헤더 ACK도 데이터 대기를 풀지 않음
        assert!(!tracker.resolve(&mut pending, Ack::Header).cleared());

        assert!(tracker.resolve(&mut pending, Ack::Sequence(2)).cleared());
        assert!(pending.is_none());
    }

    #[test]
    fn test_flush_policy_clears_on_mismatch() {
        let tracker = tracker(MismatchPolicy::Flush);
        let mut pending = Some(PendingAck::new(Awaited::Data(2), Instant::now()));

        let outcome = tracker.resolve(&mut pending, Ack::Sequence(3));
        assert_eq!(
            outcome,
            AckOutcome::Flushed {
                awaited: Awaited::Data(2),
                got: Ack::Sequence(3)
            }
        );
        assert!(pending.is_none());
    }

    #[test]
    fn test_stale_ack_without_wait() {
        let tracker = tracker(MismatchPolicy::Ignore);
        let mut pending = None;
        assert_eq!(
            tracker.resolve(&mut pending, Ack::Sequence(1)),
            AckOutcome::Stale(Ack::Sequence(1))
        );
    }

    #[test]
    fn test_deadline_retransmits_once_then_expires() {
        let tracker = tracker(MismatchPolicy::Ignore);
        let start = Instant::now();
        let mut pending = Some(PendingAck::new(Awaited::Data(4), start));

        assert_eq!(tracker.check_deadline(pending.as_ref(), start), Deadline::Wait);

        let later = start + Duration::from_millis(100);
        assert_eq!(
            tracker.check_deadline(pending.as_ref(), later),
            Deadline::Retransmit(Awaited::Data(4))
        );

        // 재전송이 기록되기 전까지는 계속 만료 상태
        assert_eq!(pending.as_ref().unwrap().retransmits, 0);
        assert_eq!(
            tracker.check_deadline(pending.as_ref(), later + Duration::from_millis(5)),
            Deadline::Retransmit(Awaited::Data(4))
        );

        // 재전송 후 데드라인 재설정
        pending.as_mut().unwrap().retransmit(later);
        assert_eq!(
            tracker.check_deadline(pending.as_ref(), later + Duration::from_millis(50)),
            Deadline::Wait
        );
        assert_eq!(
            tracker.check_deadline(pending.as_ref(), later + Duration::from_millis(100)),
            Deadline::Expired {
                awaited: Awaited::Data(4),
                retransmits: 1
            }
        );
    }
}
