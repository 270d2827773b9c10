//! 디바이스 명령 처리
//!
//! central이 쓰는 트리거 명령(`START_CAMERA`, `START_AUDIO`, `STOP_AUDIO`)을
//! 해석하고 캡처 -> 저장 -> 전송 요청으로 연결한다. 명령이 아닌 쓰기는 ACK로
//! 취급해 코디네이터에 넘긴다.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{Local, NaiveDateTime};
use tracing::{debug, info, warn};

use crate::ack::AckOutcome;
use crate::collab::{AudioRecorder, CaptureSource, Storage};
use crate::coordinator::SessionCoordinator;
use crate::link::Link;
use crate::transfer::{PayloadKind, TransferId};
use crate::{Error, Result};

/// central 트리거 명령
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartCamera,
    StartAudio,
    StopAudio,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::StartCamera => "START_CAMERA",
            Command::StartAudio => "START_AUDIO",
            Command::StopAudio => "STOP_AUDIO",
        }
    }

    /// 쓰기 값 해석, 명령이 아니면 `None`
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;
        match text.trim_end_matches(|c: char| c == '\0' || c.is_whitespace()) {
            "START_CAMERA" => Some(Command::StartCamera),
            "START_AUDIO" => Some(Command::StartAudio),
            "STOP_AUDIO" => Some(Command::StopAudio),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 쓰기 처리 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// 명령 실행, 전송이 시작되었으면 그 ID
    Command {
        command: Command,
        transfer: Option<TransferId>,
    },

    /// ACK 처리
    Ack(AckOutcome),
}

/// 타임스탬프 파일 이름 (`photo_%Y%m%d_%H%M%S.jpg` 형태)
pub fn timestamped_name(prefix: &str, kind: PayloadKind, at: &NaiveDateTime) -> String {
    format!("{}_{}.{}", prefix, at.format("%Y%m%d_%H%M%S"), kind.extension())
}

/// 캡처 장치와 전송 코디네이터를 묶은 디바이스
pub struct Device<L: Link> {
    coordinator: Arc<SessionCoordinator<L>>,
    capture: Arc<dyn CaptureSource>,
    recorder: Arc<dyn AudioRecorder>,
    storage: Arc<dyn Storage>,
}

impl<L: Link> Device<L> {
    pub fn new(
        coordinator: Arc<SessionCoordinator<L>>,
        capture: Arc<dyn CaptureSource>,
        recorder: Arc<dyn AudioRecorder>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            coordinator,
            capture,
            recorder,
            storage,
        }
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator<L>> {
        &self.coordinator
    }

    /// 링크로 들어온 쓰기 처리
    pub fn on_write(&self, bytes: &[u8]) -> Result<Handled> {
        match Command::parse(bytes) {
            Some(command) => {
                let transfer = self.handle_command(command)?;
                Ok(Handled::Command { command, transfer })
            }
            None => self.coordinator.on_control_message(bytes).map(Handled::Ack),
        }
    }

    /// 명령 실행
    pub fn handle_command(&self, command: Command) -> Result<Option<TransferId>> {
        info!("명령 수신: {}", command);
        match command {
            Command::StartCamera => self.capture_and_send(),
            Command::StartAudio => {
                self.recorder.start_recording()?;
                Ok(None)
            }
            Command::StopAudio => self.finish_recording(),
        }
    }

    fn capture_and_send(&self) -> Result<Option<TransferId>> {
        let Some(frame) = self.capture.acquire_frame()? else {
            warn!("캡처 실패");
            return Ok(None);
        };

        self.store("photo", PayloadKind::Image, &frame);

        let result = self
            .coordinator
            .request_transfer(frame.clone(), PayloadKind::Image);
        self.capture.release_frame(frame);

        result.map(Some)
    }

    fn finish_recording(&self) -> Result<Option<TransferId>> {
        self.recorder.stop_recording()?;

        let buffer = match self.recorder.recorded_buffer() {
            Some(buffer) if !buffer.is_empty() => buffer,
            _ => {
                debug!("녹음 버퍼 없음, 전송 생략");
                return Ok(None);
            }
        };

        self.store("audio", PayloadKind::Audio, &buffer);
        self.coordinator
            .request_transfer(buffer, PayloadKind::Audio)
            .map(Some)
    }

    /// 저장 실패는 전송을 막지 않는다
    fn store(&self, prefix: &str, kind: PayloadKind, bytes: &Bytes) {
        let name = timestamped_name(prefix, kind, &Local::now().naive_local());
        if let Err(e) = self.storage.persist(&name, bytes) {
            warn!("{} 저장 실패: {}", name, e);
        }
    }
}

impl std::str::FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Command::parse(s.as_bytes()).ok_or_else(|| Error::InvalidControlMessage(s.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::Ack;
    use crate::collab::{BufferRecorder, FsStorage, SyntheticCapture};
    use crate::link::ChannelLink;
    use crate::transfer::TransferState;
    use crate::Config;
    use chrono::NaiveDate;

    struct Fixture {
        device: Device<ChannelLink>,
        capture: Arc<SyntheticCapture>,
        recorder: Arc<BufferRecorder>,
        dir: tempfile::TempDir,
        _rx: tokio::sync::mpsc::Receiver<Bytes>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (link, rx) = ChannelLink::new(64, 512);
        let coordinator = Arc::new(SessionCoordinator::new(Config::default(), Arc::new(link)).unwrap());
        let capture = Arc::new(SyntheticCapture::seeded(1000, 1));
        let recorder = Arc::new(BufferRecorder::new(16_000));
        let storage = Arc::new(FsStorage::new(dir.path()).unwrap());

        Fixture {
            device: Device::new(coordinator, capture.clone(), recorder.clone(), storage),
            capture,
            recorder,
            dir,
            _rx: rx,
        }
    }

    fn stored_files(dir: &tempfile::TempDir) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_command_parse() {
        assert_eq!(Command::parse(b"START_CAMERA"), Some(Command::StartCamera));
        assert_eq!(Command::parse(b"START_AUDIO\n"), Some(Command::StartAudio));
        assert_eq!(Command::parse(b"STOP_AUDIO\0"), Some(Command::StopAudio));
        assert_eq!(Command::parse(b"ACK:1"), None);
        assert_eq!(Command::parse(&[0xFF, 0xFE]), None);
        assert_eq!("STOP_AUDIO".parse::<Command>().unwrap(), Command::StopAudio);
        assert!("start_camera".parse::<Command>().is_err());
    }

    #[test]
    fn test_timestamped_name() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 1)
            .unwrap();
        assert_eq!(
            timestamped_name("photo", PayloadKind::Image, &at),
            "photo_20240309_070501.jpg"
        );
        assert_eq!(
            timestamped_name("audio", PayloadKind::Audio, &at),
            "audio_20240309_070501.wav"
        );
    }

    #[test]
    fn test_camera_command_persists_and_starts_transfer() {
        let fx = fixture();

        let handled = fx.device.on_write(b"START_CAMERA").unwrap();
        assert!(matches!(
            handled,
            Handled::Command {
                command: Command::StartCamera,
                transfer: Some(_)
            }
        ));
        assert_eq!(fx.capture.outstanding(), 0);

        let snapshot = fx.device.coordinator().snapshot();
        assert_eq!(snapshot.state, TransferState::HeaderPending);
        assert_eq!(snapshot.payload_len, 1000);

        let files = stored_files(&fx.dir);
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("photo_") && files[0].ends_with(".jpg"));
    }

    #[test]
    fn test_camera_command_while_disconnected() {
        let fx = fixture();
        fx.device.coordinator().link().set_connected(false);

        assert!(matches!(
            fx.device.on_write(b"START_CAMERA"),
            Err(Error::NotConnected)
        ));
        // 저장은 연결과 무관하게 수행되고 프레임은 반환된다
        assert_eq!(stored_files(&fx.dir).len(), 1);
        assert_eq!(fx.capture.outstanding(), 0);
    }

    #[test]
    fn test_audio_round_trip() {
        let fx = fixture();

        fx.device.on_write(b"START_AUDIO").unwrap();
        assert!(fx.recorder.is_recording());
        fx.recorder.push_samples(&[0, 100, -100, 50]);

        let handled = fx.device.on_write(b"STOP_AUDIO").unwrap();
        assert!(matches!(
            handled,
            Handled::Command {
                command: Command::StopAudio,
                transfer: Some(_)
            }
        ));

        let snapshot = fx.device.coordinator().snapshot();
        assert_eq!(snapshot.kind, Some(PayloadKind::Audio));
        assert_eq!(snapshot.payload_len, 44 + 8);

        let files = stored_files(&fx.dir);
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("audio_") && files[0].ends_with(".wav"));
    }

    #[test]
    fn test_repeated_stop_does_not_resend_recording() {
        let fx = fixture();

        fx.device.on_write(b"START_AUDIO").unwrap();
        fx.recorder.push_samples(&[10, 20, 30]);
        let first = fx.device.on_write(b"STOP_AUDIO").unwrap();
        assert!(matches!(first, Handled::Command { transfer: Some(_), .. }));
        fx.device.coordinator().abort();

        let second = fx.device.on_write(b"STOP_AUDIO").unwrap();
        assert_eq!(
            second,
            Handled::Command {
                command: Command::StopAudio,
                transfer: None
            }
        );
        assert!(!fx.device.coordinator().is_busy());
        assert_eq!(stored_files(&fx.dir).len(), 1);
    }

    #[test]
    fn test_empty_recording_is_skipped() {
        let fx = fixture();

        fx.device.on_write(b"START_AUDIO").unwrap();
        let handled = fx.device.on_write(b"STOP_AUDIO").unwrap();
        assert_eq!(
            handled,
            Handled::Command {
                command: Command::StopAudio,
                transfer: None
            }
        );
        assert!(!fx.device.coordinator().is_busy());
        assert!(stored_files(&fx.dir).is_empty());
    }

    #[test]
    fn test_non_command_write_is_ack() {
        let fx = fixture();
        assert_eq!(
            fx.device.on_write(b"ACK:*").unwrap(),
            Handled::Ack(AckOutcome::Stale(Ack::Wildcard))
        );
        assert!(fx.device.on_write(b"garbage").is_err());
    }
}
