//! Notiflow central - 수신측
//!
//! 디바이스에 명령을 보내고 프레임마다 ACK를 회신하며
//! 조립된 페이로드를 파일로 저장한다.
//!
//! 사용법:
//!   cargo run --release --bin notiflow-central -- [OPTIONS]
//!
//! 예시:
//!   # 사진 요청
//!   cargo run --release --bin notiflow-central -- --device 127.0.0.1:9100
//!
//!   # 3초 녹음 요청, 바이너리 ACK 사용
//!   cargo run --release --bin notiflow-central -- --audio 3 --binary-acks

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Local;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use notiflow::device::timestamped_name;
use notiflow::link::DISCONNECT_MESSAGE;
use notiflow::{Ack, AckMode, Command, PayloadKind, Reassembler, ReassemblyEvent};

/// central 설정
struct CentralSettings {
    device_addr: SocketAddr,
    bind_addr: SocketAddr,
    output_dir: PathBuf,
    audio_secs: Option<u64>,
    ack_mode: AckMode,
    binary_acks: bool,
    /// 이 시퀀스의 첫 ACK를 생략 (재전송 확인용)
    drop_ack: Option<u16>,
    timeout: Duration,
}

impl Default for CentralSettings {
    fn default() -> Self {
        Self {
            device_addr: SocketAddr::from(([127, 0, 0, 1], 9100)),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            output_dir: PathBuf::from("received"),
            audio_secs: None,
            ack_mode: AckMode::PerFrame,
            binary_acks: false,
            drop_ack: None,
            timeout: Duration::from_secs(10),
        }
    }
}

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} 값이 필요함", flag))
}

fn parse_args() -> Result<CentralSettings, Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let mut settings = CentralSettings::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--device" | "-d" => settings.device_addr = next_value(&args, &mut i, flag)?.parse()?,
            "--bind" | "-b" => settings.bind_addr = next_value(&args, &mut i, flag)?.parse()?,
            "--output" | "-o" => {
                settings.output_dir = PathBuf::from(next_value(&args, &mut i, flag)?)
            }
            "--audio" | "-a" => {
                settings.audio_secs = Some(next_value(&args, &mut i, flag)?.parse()?)
            }
            "--ack-mode" => {
                settings.ack_mode = match next_value(&args, &mut i, flag)? {
                    "per-frame" => AckMode::PerFrame,
                    "header-only" => AckMode::HeaderOnly,
                    "none" => AckMode::None,
                    other => return Err(format!("알 수 없는 ACK 모드: {}", other).into()),
                }
            }
            "--binary-acks" => settings.binary_acks = true,
            "--drop-ack" => settings.drop_ack = Some(next_value(&args, &mut i, flag)?.parse()?),
            "--timeout-secs" => {
                settings.timeout = Duration::from_secs(next_value(&args, &mut i, flag)?.parse()?)
            }
            "--help" | "-h" => {
                println!(
                    r#"Notiflow Central - ACK 기반 분할 전송 수신측

사용법:
  cargo run --release --bin notiflow-central -- [OPTIONS]

옵션:
  -d, --device <ADDR>       디바이스 주소 (기본: 127.0.0.1:9100)
  -b, --bind <ADDR>         바인드 주소 (기본: 0.0.0.0:0)
  -o, --output <DIR>        저장 디렉터리 (기본: received)
  -a, --audio <SECS>        사진 대신 SECS초 녹음 요청
  --ack-mode <MODE>         per-frame | header-only | none (디바이스와 같아야 함)
  --binary-acks             텍스트 대신 바이너리 ACK 전송
  --drop-ack <SEQ>          해당 시퀀스의 첫 ACK 생략 (재전송 확인용)
  --timeout-secs <SECS>     수신 대기 제한 (기본: 10)
  -h, --help                이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            other => warn!("Unknown argument ignored: {}", other),
        }
        i += 1;
    }

    Ok(settings)
}

async fn send_ack(
    socket: &UdpSocket,
    ack: Ack,
    binary: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if binary {
        socket.send(&ack.to_bytes()).await?;
    } else {
        socket.send(ack.to_text().as_bytes()).await?;
    }
    Ok(())
}

async fn send_command(socket: &UdpSocket, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    info!("Sending {}", command);
    socket.send(command.as_str().as_bytes()).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = parse_args()?;

    info!("Notiflow central starting...");
    info!("Device address: {}", settings.device_addr);

    let socket = UdpSocket::bind(settings.bind_addr).await?;
    socket.connect(settings.device_addr).await?;
    std::fs::create_dir_all(&settings.output_dir)?;

    match settings.audio_secs {
        Some(secs) => {
            send_command(&socket, Command::StartAudio).await?;
            tokio::time::sleep(Duration::from_secs(secs)).await;
            send_command(&socket, Command::StopAudio).await?;
        }
        None => send_command(&socket, Command::StartCamera).await?,
    }

    let mut reassembler = Reassembler::new(settings.ack_mode);
    let mut drop_ack = settings.drop_ack;
    let mut buf = vec![0u8; 2048];
    let mut started = None;

    let payload: Bytes = loop {
        let len = match tokio::time::timeout(settings.timeout, socket.recv(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => {
                socket.send(DISCONNECT_MESSAGE).await?;
                return Err(format!(
                    "수신 타임아웃 ({}s, {} bytes 수신)",
                    settings.timeout.as_secs(),
                    reassembler.received()
                )
                .into());
            }
        };

        let event = match reassembler.push(Bytes::copy_from_slice(&buf[..len])) {
            Ok(event) => event,
            Err(e) => {
                warn!("Frame rejected: {}", e);
                continue;
            }
        };

        if let Some(ack) = event.ack() {
            if matches!(ack, Ack::Sequence(seq) if drop_ack == Some(seq)) {
                info!("Dropping {} to force a retransmit", ack);
                drop_ack = None;
            } else {
                send_ack(&socket, ack, settings.binary_acks).await?;
            }
        }

        match event {
            ReassemblyEvent::Started { header, .. } => {
                info!(
                    "Header: {} bytes in {} frames",
                    header.length, header.frame_count
                );
                started = Some(Instant::now());
            }
            ReassemblyEvent::Progress { sequence, received, .. } => {
                debug!("Frame {} ({} bytes so far)", sequence, received);
            }
            ReassemblyEvent::Duplicate { sequence, .. } => {
                info!("Duplicate frame {} (retransmitted)", sequence);
            }
            ReassemblyEvent::Completed { payload } => break payload,
            ReassemblyEvent::Aborted { reason } => {
                return Err(format!("디바이스가 전송을 중단함: {}", reason).into());
            }
        }
    };

    let elapsed = started.map(|t| t.elapsed()).unwrap_or_default();
    let kind = PayloadKind::sniff(&payload);
    let name = timestamped_name("received", kind, &Local::now().naive_local());
    let path = settings.output_dir.join(&name);
    std::fs::write(&path, &payload)?;

    info!("Transfer complete!");
    info!("  File: {:?} ({})", path, kind);
    info!("  Size: {} bytes", payload.len());
    info!("  CRC32: {:08x}", crc32fast::hash(&payload));
    info!("  Time: {:.2}s", elapsed.as_secs_f64());
    if elapsed.as_secs_f64() > 0.0 {
        info!(
            "  Throughput: {:.2} KB/s",
            payload.len() as f64 / elapsed.as_secs_f64() / 1_000.0
        );
    }

    socket.send(DISCONNECT_MESSAGE).await?;
    Ok(())
}
