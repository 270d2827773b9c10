//! 링크 어댑터
//!
//! 상태 머신을 특정 무선 스택에서 분리한다. 프레임 송신은 이 계층에서
//! fire-and-forget이며 전달 확인은 ACK 계층의 몫이다.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::frame::encode_abort_into;

/// notify 방식 전송 계층
pub trait Link: Send + Sync {
    /// 현재 연결 여부
    fn is_connected(&self) -> bool;

    /// 프레임 하나 송신 (전달 확인 없음)
    fn send_frame(&self, frame: &[u8]) -> Result<(), LinkError>;

    /// 전송 시도가 실패했음을 상대에게 알림 (best-effort)
    fn notify_failure(&self, reason: &str) {
        let _ = reason;
    }
}

impl<L: Link + ?Sized> Link for Arc<L> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn send_frame(&self, frame: &[u8]) -> Result<(), LinkError> {
        (**self).send_frame(frame)
    }

    fn notify_failure(&self, reason: &str) {
        (**self).notify_failure(reason)
    }
}

/// 프로세스 내부 링크
///
/// 송신 프레임은 bounded 채널로 전달되고, 연결 상태는 외부에서 토글한다.
/// 채널이 가득 차면 notify 큐 포화처럼 `QueueFull`을 돌려준다.
pub struct ChannelLink {
    tx: mpsc::Sender<Bytes>,
    connected: AtomicBool,
    max_frame_len: usize,
    failures: Mutex<Vec<String>>,
    sent_frames: AtomicU64,
}

impl ChannelLink {
    /// 새 링크와 수신측 채널 생성 (초기 상태: 연결됨)
    pub fn new(capacity: usize, max_frame_len: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        let link = Self {
            tx,
            connected: AtomicBool::new(true),
            max_frame_len,
            failures: Mutex::new(Vec::new()),
            sent_frames: AtomicU64::new(0),
        };
        (link, rx)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// 지금까지 통지된 실패 사유
    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().clone()
    }

    pub fn sent_frames(&self) -> u64 {
        self.sent_frames.load(Ordering::Relaxed)
    }
}

impl Link for ChannelLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_frame(&self, frame: &[u8]) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Disconnected);
        }
        if frame.len() > self.max_frame_len {
            return Err(LinkError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_len,
            });
        }

        self.tx
            .try_send(Bytes::copy_from_slice(frame))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => LinkError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => LinkError::Disconnected,
            })?;

        self.sent_frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn notify_failure(&self, reason: &str) {
        self.failures.lock().push(reason.to_string());
    }
}

/// UDP 링크에서 연결 종료를 알리는 데이터그램
pub const DISCONNECT_MESSAGE: &[u8] = b"DISCONNECT";

/// `UdpLink::attach` 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerChange {
    /// 상대 없던 링크에 새로 연결
    New,

    /// 기존 상대가 다른 주소로 바뀜, 이전 연결은 끊긴 것으로 본다
    Changed { previous: SocketAddr },

    /// 같은 상대
    Same,
}

/// UDP 데이터그램 링크
///
/// BLE notify를 흉내내어 데이터그램 하나에 프레임 하나를 싣는다.
/// 상대가 처음 데이터그램을 보낸 시점부터 연결된 것으로 보고,
/// `DISCONNECT_MESSAGE`를 받으면 연결이 끊긴 것으로 본다.
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    peer: RwLock<Option<SocketAddr>>,
    max_frame_len: usize,
}

impl UdpLink {
    pub fn new(socket: Arc<UdpSocket>, max_frame_len: usize) -> Self {
        Self {
            socket,
            peer: RwLock::new(None),
            max_frame_len,
        }
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.read()
    }

    /// 상대 등록
    pub fn attach(&self, addr: SocketAddr) -> PeerChange {
        let mut peer = self.peer.write();
        match *peer {
            Some(current) if current == addr => PeerChange::Same,
            Some(previous) => {
                info!("링크 상대 변경: {} -> {}", previous, addr);
                *peer = Some(addr);
                PeerChange::Changed { previous }
            }
            None => {
                info!("링크 연결: {}", addr);
                *peer = Some(addr);
                PeerChange::New
            }
        }
    }

    /// 상대 해제, 연결되어 있었으면 true
    pub fn detach(&self) -> bool {
        let previous = self.peer.write().take();
        if let Some(addr) = previous {
            info!("링크 연결 종료: {}", addr);
        }
        previous.is_some()
    }
}

impl Link for UdpLink {
    fn is_connected(&self) -> bool {
        self.peer.read().is_some()
    }

    fn send_frame(&self, frame: &[u8]) -> Result<(), LinkError> {
        let addr = self.peer().ok_or(LinkError::Disconnected)?;
        if frame.len() > self.max_frame_len {
            return Err(LinkError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_len,
            });
        }

        match self.socket.try_send_to(frame, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(LinkError::QueueFull),
            Err(e) => Err(LinkError::Transport(e.to_string())),
        }
    }

    fn notify_failure(&self, reason: &str) {
        let Some(addr) = self.peer() else {
            debug!("상대 없음, 실패 통지 생략: {}", reason);
            return;
        };

        let mut buf = BytesMut::with_capacity(2 + reason.len());
        encode_abort_into(&mut buf, reason);
        buf.truncate(self.max_frame_len);

        if let Err(e) = self.socket.try_send_to(&buf, addr) {
            warn!("실패 통지 전송 실패: {}", e);
        }
    }
}
