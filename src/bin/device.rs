//! Notiflow 디바이스 - 캡처 장치 시뮬레이터
//!
//! UDP 데이터그램을 notify 링크로 삼아 central의 명령을 받고
//! 사진/오디오를 ACK 기반으로 전송한다.
//!
//! 사용법:
//!   cargo run --release --bin notiflow-device -- [OPTIONS]
//!
//! 예시:
//!   # 합성 이미지 전송
//!   cargo run --release --bin notiflow-device -- --bind 0.0.0.0:9100
//!
//!   # 파일을 캡처 결과로 사용, 헤더만 ACK
//!   cargo run --release --bin notiflow-device -- -f photo.jpg --ack-mode header-only

use std::f32::consts::PI;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use notiflow::collab::{AudioRecorder, BufferRecorder, CaptureSource, FileCapture, FsStorage, SyntheticCapture};
use notiflow::device::Handled;
use notiflow::frame::SEQUENCE_LEN;
use notiflow::link::DISCONNECT_MESSAGE;
use notiflow::{
    AckMode, Config, Device, MismatchPolicy, SessionCoordinator, SupersedePolicy, TickDriver,
    TransferEvent, UdpLink, MAX_CHUNK_SIZE,
};

/// 녹음 샘플레이트
const SAMPLE_RATE: u32 = 16_000;

/// 디바이스 설정
struct DeviceSettings {
    bind_addr: SocketAddr,
    capture_file: Option<PathBuf>,
    image_size: usize,
    storage_dir: PathBuf,
    config: Config,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9100)),
            capture_file: None,
            image_size: 20 * 1024,
            storage_dir: PathBuf::from("captures"),
            config: Config::default(),
        }
    }
}

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} 값이 필요함", flag))
}

fn parse_ack_mode(value: &str) -> Result<AckMode, String> {
    match value {
        "per-frame" => Ok(AckMode::PerFrame),
        "header-only" => Ok(AckMode::HeaderOnly),
        "none" => Ok(AckMode::None),
        other => Err(format!("알 수 없는 ACK 모드: {}", other)),
    }
}

fn parse_args() -> Result<DeviceSettings, Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let mut settings = DeviceSettings::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--bind" | "-b" => settings.bind_addr = next_value(&args, &mut i, flag)?.parse()?,
            "--file" | "-f" => {
                settings.capture_file = Some(PathBuf::from(next_value(&args, &mut i, flag)?))
            }
            "--image-size" => settings.image_size = next_value(&args, &mut i, flag)?.parse()?,
            "--storage" | "-s" => {
                settings.storage_dir = PathBuf::from(next_value(&args, &mut i, flag)?)
            }
            "--slow-link" => {
                settings.config = Config::slow_link();
            }
            "--chunk-size" => {
                settings.config.chunk_size = next_value(&args, &mut i, flag)?.parse()?
            }
            "--tick-ms" => {
                settings.config.tick_interval_ms = next_value(&args, &mut i, flag)?.parse()?
            }
            "--ack-timeout-ms" => {
                settings.config.ack_timeout_ms = next_value(&args, &mut i, flag)?.parse()?
            }
            "--retransmits" => {
                settings.config.max_retransmits = next_value(&args, &mut i, flag)?.parse()?
            }
            "--ack-mode" => {
                settings.config.ack_mode = parse_ack_mode(next_value(&args, &mut i, flag)?)?
            }
            "--flush-mismatch" => settings.config.mismatch_policy = MismatchPolicy::Flush,
            "--supersede" => settings.config.supersede_policy = SupersedePolicy::Supersede,
            "--help" | "-h" => {
                println!(
                    r#"Notiflow Device - ACK 기반 분할 전송 디바이스

사용법:
  cargo run --release --bin notiflow-device -- [OPTIONS]

옵션:
  -b, --bind <ADDR>         바인드 주소 (기본: 0.0.0.0:9100)
  -f, --file <PATH>         캡처 결과로 사용할 파일 (기본: 합성 이미지)
  --image-size <BYTES>      합성 이미지 크기 (기본: 20480)
  -s, --storage <DIR>       캡처 저장 디렉터리 (기본: captures)
  --slow-link               느린 링크용 설정 사용
  --chunk-size <SIZE>       프레임당 페이로드 (기본: 242, 최대 510)
  --tick-ms <MS>            tick 주기 (기본: 20)
  --ack-timeout-ms <MS>     ACK 타임아웃 (기본: 500)
  --retransmits <N>         타임아웃 시 재전송 횟수 (기본: 1)
  --ack-mode <MODE>         per-frame | header-only | none (기본: per-frame)
  --flush-mismatch          불일치 ACK도 대기 해제
  --supersede               전송 중 새 요청이 오면 기존 전송 중단
  -h, --help                이 도움말 출력

환경 변수:
  RUST_LOG                  로그 필터 (기본: info)
"#
                );
                std::process::exit(0);
            }
            other => warn!("Unknown argument ignored: {}", other),
        }
        i += 1;
    }

    settings.config.validate()?;
    Ok(settings)
}

/// 녹음 중일 때 440Hz 톤을 녹음기에 공급
fn spawn_tone_feeder(recorder: Arc<BufferRecorder>) {
    tokio::spawn(async move {
        let period = Duration::from_millis(20);
        let per_tick = (SAMPLE_RATE as usize * 20) / 1000;
        let mut ticker = tokio::time::interval(period);
        let mut phase = 0usize;

        loop {
            ticker.tick().await;
            if !recorder.is_recording() {
                phase = 0;
                continue;
            }

            let samples: Vec<i16> = (0..per_tick)
                .map(|n| {
                    let t = (phase + n) as f32 / SAMPLE_RATE as f32;
                    ((2.0 * PI * 440.0 * t).sin() * 8_000.0) as i16
                })
                .collect();
            phase += per_tick;
            recorder.push_samples(&samples);
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = parse_args()?;
    let config = settings.config.clone();

    info!("Notiflow device starting...");
    info!("Bind address: {}", settings.bind_addr);
    info!("Chunk size: {} bytes", config.chunk_size);
    info!("Ack mode: {:?}, timeout {}ms", config.ack_mode, config.ack_timeout_ms);

    let socket = Arc::new(UdpSocket::bind(settings.bind_addr).await?);
    let link = Arc::new(UdpLink::new(socket.clone(), MAX_CHUNK_SIZE + SEQUENCE_LEN));

    let coordinator = Arc::new(SessionCoordinator::new(config, link.clone())?);
    let mut events = coordinator.subscribe();

    let capture: Arc<dyn CaptureSource> = match &settings.capture_file {
        Some(path) => {
            info!("Capture source: {:?}", path);
            Arc::new(FileCapture::new(path))
        }
        None => {
            info!("Capture source: synthetic {} bytes", settings.image_size);
            Arc::new(SyntheticCapture::new(settings.image_size))
        }
    };
    let recorder = Arc::new(BufferRecorder::new(SAMPLE_RATE).with_gain_shift(1));
    let storage = Arc::new(FsStorage::new(&settings.storage_dir)?);
    info!("Storage: {:?}", storage.root());

    spawn_tone_feeder(recorder.clone());

    let device = Device::new(coordinator.clone(), capture, recorder, storage);

    let driver = TickDriver::new(coordinator.clone());
    driver.start();

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::Started { id, kind, len } => {
                    info!("Transfer #{} started: {} {} bytes", id, kind, len)
                }
                TransferEvent::Completed { id, kind, bytes } => {
                    info!("Transfer #{} completed: {} {} bytes", id, kind, bytes)
                }
                TransferEvent::Aborted { id, kind, reason } => {
                    warn!("Transfer #{} aborted: {} ({})", id, kind, reason)
                }
            }
        }
    });

    info!("Waiting for central on {}...", socket.local_addr()?);

    let mut buf = vec![0u8; 2048];
    loop {
        let (len, addr) = tokio::select! {
            received = socket.recv_from(&mut buf) => received?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let message = &buf[..len];

        if message == DISCONNECT_MESSAGE {
            if link.detach() {
                coordinator.on_disconnected();
            }
            continue;
        }

        coordinator.attach_peer(addr);

        match device.on_write(message) {
            Ok(Handled::Command { command, transfer }) => {
                debug!("{} handled, transfer: {:?}", command, transfer);
            }
            Ok(Handled::Ack(outcome)) => {
                if let Err(e) = outcome.check() {
                    debug!("{}", e);
                }
            }
            Err(e) => warn!("Write from {} rejected: {}", addr, e),
        }
    }

    driver.stop();
    info!("Shutting down");
    info!("{}", coordinator.stats().summary());
    Ok(())
}
