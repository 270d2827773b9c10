//! 세션 코디네이터
//!
//! 생산자(카메라/오디오)와 tick 드라이버, 링크 콜백이 만나는 단일 진입점.
//! 세션은 하나의 락으로 보호되며 동시에 하나의 전송만 활성화된다.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ack::{Ack, AckOutcome};
use crate::frame::checked_frame_count;
use crate::link::{Link, PeerChange, UdpLink};
use crate::stats::TransferStats;
use crate::transfer::{
    AbortReason, PayloadKind, SessionSnapshot, TickOutcome, TransferId, TransferSession,
};
use crate::{Config, Error, Result, SupersedePolicy};

/// 세션 수명 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Started { id: TransferId, kind: PayloadKind, len: usize },
    Completed { id: TransferId, kind: PayloadKind, bytes: usize },
    Aborted { id: TransferId, kind: PayloadKind, reason: AbortReason },
}

impl TransferEvent {
    fn from_outcome(outcome: &TickOutcome) -> Option<Self> {
        match outcome {
            TickOutcome::Completed { id, kind, bytes } => Some(TransferEvent::Completed {
                id: *id,
                kind: *kind,
                bytes: *bytes,
            }),
            TickOutcome::Aborted { id, kind, reason } => Some(TransferEvent::Aborted {
                id: *id,
                kind: *kind,
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

/// 세션 코디네이터
pub struct SessionCoordinator<L: Link> {
    link: Arc<L>,
    session: Mutex<TransferSession>,
    supersede_policy: SupersedePolicy,
    chunk_size: usize,
    tick_interval: Duration,
    events: Mutex<Option<mpsc::UnboundedSender<TransferEvent>>>,
}

impl<L: Link> SessionCoordinator<L> {
    /// 새 코디네이터 생성
    pub fn new(config: Config, link: Arc<L>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            link,
            supersede_policy: config.supersede_policy,
            chunk_size: config.chunk_size,
            tick_interval: config.tick_interval(),
            session: Mutex::new(TransferSession::new(config)),
            events: Mutex::new(None),
        })
    }

    pub fn link(&self) -> &Arc<L> {
        &self.link
    }

    /// 설정된 tick 주기
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// 세션 이벤트 구독 (이전 구독은 대체됨)
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        rx
    }

    /// 전송 요청
    ///
    /// 링크가 끊겨 있으면 `NotConnected`, 이미 전송 중이면 정책에 따라
    /// `Busy`로 거절하거나 기존 세션을 중단하고 새로 시작한다.
    pub fn request_transfer(&self, payload: Bytes, kind: PayloadKind) -> Result<TransferId> {
        if !self.link.is_connected() {
            debug!("링크 미연결, {} 전송 요청 무시", kind);
            return Err(Error::NotConnected);
        }

        // 기존 세션을 건드리기 전에 페이로드 검증
        checked_frame_count(payload.len(), self.chunk_size)?;
        let len = payload.len();

        let mut session = self.session.lock();
        if session.is_active() {
            match self.supersede_policy {
                SupersedePolicy::Reject => {
                    warn!("전송 중, {} 전송 요청 거절", kind);
                    return Err(Error::Busy);
                }
                SupersedePolicy::Supersede => {
                    info!("새 {} 전송으로 기존 세션 대체", kind);
                    if let Some(outcome) = session.abort(AbortReason::Superseded) {
                        self.publish(&outcome);
                    }
                }
            }
        }

        let id = session.start(payload, kind, Instant::now())?;
        drop(session);

        self.emit(TransferEvent::Started { id, kind, len });
        Ok(id)
    }

    /// 주기적 tick. 유휴 상태에서도 안전하다.
    pub fn on_tick(&self) -> TickOutcome {
        self.tick_at(Instant::now())
    }

    /// 지정한 시각 기준 tick
    pub fn tick_at(&self, now: Instant) -> TickOutcome {
        let outcome = self.session.lock().tick(&*self.link, now);
        self.publish(&outcome);
        outcome
    }

    /// 링크에서 들어온 제어 메시지 처리
    pub fn on_control_message(&self, bytes: &[u8]) -> Result<AckOutcome> {
        self.on_control_message_at(bytes, Instant::now())
    }

    pub fn on_control_message_at(&self, bytes: &[u8], now: Instant) -> Result<AckOutcome> {
        let ack = Ack::parse(bytes)?;
        Ok(self.session.lock().on_ack(ack, now))
    }

    /// 어느 상태에서든 `Idle`로 강제 복귀
    pub fn abort(&self) -> Option<TickOutcome> {
        self.abort_with(AbortReason::Cancelled)
    }

    /// 링크 연결 콜백
    pub fn on_connected(&self) {
        info!("링크 연결됨");
    }

    /// 링크 끊김 콜백, 진행 중인 세션은 재개 없이 중단
    pub fn on_disconnected(&self) -> Option<TickOutcome> {
        info!("링크 끊김");
        self.abort_with(AbortReason::LinkDown)
    }

    pub fn is_busy(&self) -> bool {
        self.session.lock().is_active()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.lock().snapshot()
    }

    pub fn stats(&self) -> TransferStats {
        self.session.lock().stats().clone()
    }

    fn abort_with(&self, reason: AbortReason) -> Option<TickOutcome> {
        let outcome = self.session.lock().abort(reason)?;
        self.publish(&outcome);
        Some(outcome)
    }

    fn publish(&self, outcome: &TickOutcome) {
        if let Some(event) = TransferEvent::from_outcome(outcome) {
            self.emit(event);
        }
    }

    fn emit(&self, event: TransferEvent) {
        let mut events = self.events.lock();
        if let Some(tx) = events.as_ref() {
            if tx.send(event).is_err() {
                *events = None;
            }
        }
    }
}

impl SessionCoordinator<UdpLink> {
    /// 데이터그램 송신자를 링크 상대로 등록
    ///
    /// 상대가 바뀌면 이전 상대와의 끊김으로 처리해 진행 중인 세션을 중단한다.
    /// 새 상대에게 이전 세션의 나머지 프레임이 이어서 나가지 않는다.
    pub fn attach_peer(&self, addr: SocketAddr) -> PeerChange {
        let change = self.link.attach(addr);
        match change {
            PeerChange::New => self.on_connected(),
            PeerChange::Changed { previous } => {
                warn!("상대 변경으로 {} 연결 종료 처리", previous);
                self.on_disconnected();
                self.on_connected();
            }
            PeerChange::Same => {}
        }
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AckMode;
    use crate::link::ChannelLink;
    use crate::transfer::TransferState;

    fn coordinator(config: Config) -> (SessionCoordinator<ChannelLink>, mpsc::Receiver<Bytes>) {
        let (link, rx) = ChannelLink::new(256, 512);
        (SessionCoordinator::new(config, Arc::new(link)).unwrap(), rx)
    }

    fn config() -> Config {
        Config {
            chunk_size: 244,
            progress_log_interval: 0,
            ..Config::default()
        }
    }

    #[test]
    fn test_tick_when_idle_is_noop() {
        let (coordinator, mut rx) = coordinator(config());
        assert_eq!(coordinator.on_tick(), TickOutcome::Idle);
        assert!(rx.try_recv().is_err());
        assert!(coordinator.abort().is_none());
    }

    #[test]
    fn test_reject_policy_returns_busy() {
        let (coordinator, _rx) = coordinator(config());
        let first = coordinator
            .request_transfer(Bytes::from_static(b"first"), PayloadKind::Image)
            .unwrap();

        assert!(matches!(
            coordinator.request_transfer(Bytes::from_static(b"second"), PayloadKind::Audio),
            Err(Error::Busy)
        ));
        assert_eq!(coordinator.snapshot().id, Some(first));
    }

    #[test]
    fn test_supersede_policy_aborts_old_session() {
        let mut cfg = config();
        cfg.supersede_policy = SupersedePolicy::Supersede;
        let (coordinator, _rx) = coordinator(cfg);
        let mut events = coordinator.subscribe();

        let first = coordinator
            .request_transfer(Bytes::from(vec![1u8; 1000]), PayloadKind::Image)
            .unwrap();
        coordinator.on_tick();
        coordinator.on_control_message(b"ACK:HDR").unwrap();
        coordinator.on_tick();
        assert_eq!(coordinator.snapshot().cursor, 244);

        let second = coordinator
            .request_transfer(Bytes::from(vec![2u8; 10]), PayloadKind::Audio)
            .unwrap();
        assert_ne!(first, second);

        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.id, Some(second));
        assert_eq!(snapshot.state, TransferState::HeaderPending);
        assert_eq!(snapshot.cursor, 0);
        assert!(!snapshot.awaiting_ack);

        assert!(matches!(events.try_recv().unwrap(), TransferEvent::Started { id, .. } if id == first));
        assert_eq!(
            events.try_recv().unwrap(),
            TransferEvent::Aborted {
                id: first,
                kind: PayloadKind::Image,
                reason: AbortReason::Superseded
            }
        );
        assert!(matches!(events.try_recv().unwrap(), TransferEvent::Started { id, .. } if id == second));
        assert_eq!(coordinator.stats().sessions_aborted, 1);
    }

    #[test]
    fn test_invalid_request_keeps_active_session() {
        let mut cfg = config();
        cfg.supersede_policy = SupersedePolicy::Supersede;
        let (coordinator, _rx) = coordinator(cfg);

        coordinator
            .request_transfer(Bytes::from_static(b"keep"), PayloadKind::Image)
            .unwrap();
        assert!(matches!(
            coordinator.request_transfer(Bytes::new(), PayloadKind::Audio),
            Err(Error::EmptyPayload)
        ));
        assert!(coordinator.is_busy());
        assert_eq!(coordinator.snapshot().kind, Some(PayloadKind::Image));
    }

    #[test]
    fn test_request_while_disconnected() {
        let (coordinator, _rx) = coordinator(config());
        coordinator.link().set_connected(false);

        assert!(matches!(
            coordinator.request_transfer(Bytes::from_static(b"x"), PayloadKind::Image),
            Err(Error::NotConnected)
        ));
        assert!(!coordinator.is_busy());
    }

    #[test]
    fn test_disconnect_callback_aborts() {
        let mut cfg = config();
        cfg.ack_mode = AckMode::None;
        let (coordinator, mut rx) = coordinator(cfg);
        let mut events = coordinator.subscribe();

        let id = coordinator
            .request_transfer(Bytes::from(vec![0u8; 1000]), PayloadKind::Image)
            .unwrap();
        for _ in 0..3 {
            coordinator.on_tick();
        }
        while rx.try_recv().is_ok() {}

        coordinator.link().set_connected(false);
        assert!(coordinator.on_disconnected().is_some());
        assert_eq!(coordinator.on_tick(), TickOutcome::Idle);
        assert!(rx.try_recv().is_err());

        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.state, TransferState::Idle);
        assert_eq!(snapshot.cursor, 0);

        let _started = events.try_recv().unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            TransferEvent::Aborted {
                id,
                kind: PayloadKind::Image,
                reason: AbortReason::LinkDown
            }
        );
    }

    #[test]
    fn test_link_drop_without_callback_does_not_resume() {
        let mut cfg = config();
        cfg.ack_mode = AckMode::None;
        let (coordinator, mut rx) = coordinator(cfg);
        let mut events = coordinator.subscribe();

        let id = coordinator
            .request_transfer(Bytes::from(vec![0u8; 1000]), PayloadKind::Image)
            .unwrap();
        for _ in 0..3 {
            coordinator.on_tick();
        }
        assert_eq!(coordinator.snapshot().sequence, 2);
        while rx.try_recv().is_ok() {}

        // 끊김 콜백이 오기 전에 tick이 먼저 끊김을 본다
        coordinator.link().set_connected(false);
        assert!(matches!(
            coordinator.on_tick(),
            TickOutcome::Aborted { reason: AbortReason::LinkDown, .. }
        ));
        coordinator.link().set_connected(true);
        coordinator.on_connected();

        assert_eq!(coordinator.on_tick(), TickOutcome::Idle);
        assert!(rx.try_recv().is_err());
        assert!(coordinator.on_disconnected().is_none());

        let _started = events.try_recv().unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            TransferEvent::Aborted {
                id,
                kind: PayloadKind::Image,
                reason: AbortReason::LinkDown
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_peer_change_aborts_transfer() {
        let device = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let first = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let first_addr = first.local_addr().unwrap();
        let second_addr = second.local_addr().unwrap();

        let mut cfg = config();
        cfg.ack_mode = AckMode::None;
        let link = Arc::new(UdpLink::new(device, 512));
        let coordinator = SessionCoordinator::new(cfg, link).unwrap();
        let mut events = coordinator.subscribe();

        assert_eq!(coordinator.attach_peer(first_addr), PeerChange::New);
        assert_eq!(coordinator.attach_peer(first_addr), PeerChange::Same);

        coordinator.link().socket().writable().await.unwrap();
        let id = coordinator
            .request_transfer(Bytes::from(vec![0u8; 1000]), PayloadKind::Image)
            .unwrap();
        for _ in 0..3 {
            assert!(matches!(coordinator.on_tick(), TickOutcome::Sent(_)));
        }

        let mut buf = [0u8; 512];
        let len = first.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..2], &[0xFF, 0xFF]);
        assert_eq!(len, crate::frame::HEADER_LEN);

        // 다른 주소에서 데이터그램이 오면 기존 세션은 끝난다
        assert_eq!(
            coordinator.attach_peer(second_addr),
            PeerChange::Changed {
                previous: first_addr
            }
        );
        assert!(!coordinator.is_busy());
        assert_eq!(coordinator.on_tick(), TickOutcome::Idle);
        assert_eq!(coordinator.link().peer(), Some(second_addr));

        let _started = events.try_recv().unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            TransferEvent::Aborted {
                id,
                kind: PayloadKind::Image,
                reason: AbortReason::LinkDown
            }
        );

        // 새 상대가 처음 받는 프레임은 새 세션의 헤더
        coordinator
            .request_transfer(Bytes::from(vec![1u8; 100]), PayloadKind::Image)
            .unwrap();
        assert_eq!(coordinator.on_tick(), TickOutcome::Sent(crate::transfer::SentFrame::Header));
        let len = second.recv(&mut buf).await.unwrap();
        assert_eq!(len, crate::frame::HEADER_LEN);
        assert_eq!(&buf[..2], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_control_message_errors() {
        let (coordinator, _rx) = coordinator(config());
        assert!(matches!(
            coordinator.on_control_message(b"hello"),
            Err(Error::InvalidControlMessage(_))
        ));
        assert_eq!(
            coordinator.on_control_message(b"ACK:1").unwrap(),
            AckOutcome::Stale(Ack::Sequence(1))
        );
    }

    #[test]
    fn test_concurrent_ack_and_tick() {
        let mut cfg = config();
        cfg.chunk_size = 16;
        let (link, mut rx) = ChannelLink::new(4096, 512);
        let coordinator = Arc::new(SessionCoordinator::new(cfg, Arc::new(link)).unwrap());
        let mut events = coordinator.subscribe();

        coordinator
            .request_transfer(Bytes::from(vec![7u8; 16 * 50]), PayloadKind::Audio)
            .unwrap();

        // 수신측: 프레임마다 ACK 회신
        let peer = {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || {
                while let Some(bytes) = rx.blocking_recv() {
                    match crate::frame::WireFrame::decode(bytes).unwrap() {
                        crate::frame::WireFrame::Header(_) => {
                            coordinator.on_control_message(b"ACK:HDR").unwrap();
                        }
                        crate::frame::WireFrame::Data { sequence, .. } => {
                            coordinator
                                .on_control_message(&Ack::Sequence(sequence).to_bytes())
                                .unwrap();
                        }
                        _ => break,
                    }
                }
            })
        };

        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while coordinator.is_busy() && Instant::now() < deadline {
            coordinator.on_tick();
            std::thread::yield_now();
        }
        peer.join().unwrap();

        let _started = events.try_recv().unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            TransferEvent::Completed { bytes: 800, .. }
        ));
        assert_eq!(coordinator.stats().retransmitted_frames, 0);
    }
}
