//! 디바이스 협력자
//!
//! 카메라, 오디오 녹음, 저장소를 trait으로 분리하고 호스트용 구현을 제공한다.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, info, warn};

use crate::Result;

/// WAV(RIFF) 헤더 크기
pub const WAV_HEADER_LEN: usize = 44;

/// 기본 최대 녹음 길이 (초)
pub const MAX_RECORD_SECS: u32 = 10;

/// 캡처 장치
pub trait CaptureSource: Send + Sync {
    /// 프레임 하나 캡처, 실패하면 `None`
    fn acquire_frame(&self) -> Result<Option<Bytes>>;

    /// 캡처 버퍼 반환
    fn release_frame(&self, frame: Bytes);
}

/// 오디오 녹음기
pub trait AudioRecorder: Send + Sync {
    fn start_recording(&self) -> Result<()>;

    fn stop_recording(&self) -> Result<()>;

    fn is_recording(&self) -> bool;

    /// 마지막 녹음 결과 (WAV)를 꺼낸다. 한 번 꺼내면 다음 녹음 전까지 `None`
    fn recorded_buffer(&self) -> Option<Bytes>;
}

/// 영구 저장소
pub trait Storage: Send + Sync {
    fn persist(&self, name: &str, bytes: &[u8]) -> Result<()>;
}

/// 디렉터리 기반 저장소
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// 디렉터리가 없으면 생성
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Storage for FsStorage {
    fn persist(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.root.join(name.trim_start_matches('/'));
        fs::write(&path, bytes)?;
        info!("저장 완료: {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }
}

/// 파일 하나를 캡처 결과로 돌려주는 카메라
pub struct FileCapture {
    path: PathBuf,
    outstanding: AtomicU64,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            outstanding: AtomicU64::new(0),
        }
    }

    /// 반환되지 않은 프레임 수
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl CaptureSource for FileCapture {
    fn acquire_frame(&self) -> Result<Option<Bytes>> {
        let data = fs::read(&self.path)?;
        if data.is_empty() {
            warn!("캡처 파일이 비어 있음: {}", self.path.display());
            return Ok(None);
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Bytes::from(data)))
    }

    fn release_frame(&self, frame: Bytes) {
        drop(frame);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 무작위 JPEG 형태 프레임 생성기
pub struct SyntheticCapture {
    len: usize,
    rng: Mutex<StdRng>,
    outstanding: AtomicU64,
}

impl SyntheticCapture {
    pub fn new(len: usize) -> Self {
        Self::with_rng(len, StdRng::from_entropy())
    }

    pub fn seeded(len: usize, seed: u64) -> Self {
        Self::with_rng(len, StdRng::seed_from_u64(seed))
    }

    fn with_rng(len: usize, rng: StdRng) -> Self {
        Self {
            len,
            rng: Mutex::new(rng),
            outstanding: AtomicU64::new(0),
        }
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl CaptureSource for SyntheticCapture {
    fn acquire_frame(&self) -> Result<Option<Bytes>> {
        if self.len < 4 {
            return Ok(None);
        }

        // SOI ... EOI
        let mut frame = vec![0u8; self.len];
        self.rng.lock().fill_bytes(&mut frame[2..self.len - 2]);
        frame[..2].copy_from_slice(&[0xFF, 0xD8]);
        frame[self.len - 2..].copy_from_slice(&[0xFF, 0xD9]);

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Bytes::from(frame)))
    }

    fn release_frame(&self, frame: Bytes) {
        drop(frame);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 메모리 버퍼 녹음기
///
/// 녹음 중에 `push_samples`로 들어온 16비트 PCM을 모아 두었다가
/// 정지 시 WAV로 묶는다. 버퍼가 `max_samples`에 이르면 이후 샘플은 버린다.
pub struct BufferRecorder {
    sample_rate: u32,
    gain_shift: u32,
    max_samples: usize,
    recording: AtomicBool,
    samples: Mutex<Vec<i16>>,
    recorded: Mutex<Option<Bytes>>,
}

impl BufferRecorder {
    /// 모노 16비트 녹음기
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            gain_shift: 0,
            max_samples: (sample_rate * MAX_RECORD_SECS) as usize,
            recording: AtomicBool::new(false),
            samples: Mutex::new(Vec::new()),
            recorded: Mutex::new(None),
        }
    }

    /// 샘플을 왼쪽 시프트해 볼륨 증폭
    pub fn with_gain_shift(mut self, shift: u32) -> Self {
        self.gain_shift = shift.min(15);
        self
    }

    /// 녹음 버퍼 상한 (샘플 수)
    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples;
        self
    }

    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    /// 녹음 중일 때만 샘플 추가, 상한을 넘는 부분은 버린다
    pub fn push_samples(&self, samples: &[i16]) {
        if !self.is_recording() {
            return;
        }

        let mut buffer = self.samples.lock();
        let room = self.max_samples.saturating_sub(buffer.len());
        if samples.len() > room {
            if room > 0 {
                warn!("녹음 버퍼 가득 참: {} 샘플", self.max_samples);
            }
            buffer.extend_from_slice(&samples[..room]);
        } else {
            buffer.extend_from_slice(samples);
        }
    }
}

impl AudioRecorder for BufferRecorder {
    fn start_recording(&self) -> Result<()> {
        if self.recording.swap(true, Ordering::SeqCst) {
            debug!("이미 녹음 중");
            return Ok(());
        }
        self.samples.lock().clear();
        *self.recorded.lock() = None;
        info!("녹음 시작");
        Ok(())
    }

    fn stop_recording(&self) -> Result<()> {
        if !self.recording.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let samples = std::mem::take(&mut *self.samples.lock());
        if samples.is_empty() {
            warn!("녹음된 샘플 없음");
            return Ok(());
        }

        let wav = encode_wav(&samples, self.sample_rate, self.gain_shift);
        info!("녹음 종료: {} bytes", wav.len());
        *self.recorded.lock() = Some(wav);
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    fn recorded_buffer(&self) -> Option<Bytes> {
        self.recorded.lock().take()
    }
}

/// 모노 16비트 PCM을 WAV로 직렬화
pub fn encode_wav(samples: &[i16], sample_rate: u32, gain_shift: u32) -> Bytes {
    let data_len = (samples.len() * 2) as u32;
    let mut buf = BytesMut::with_capacity(WAV_HEADER_LEN + data_len as usize);

    buf.put_slice(b"RIFF");
    buf.put_u32_le(36 + data_len);
    buf.put_slice(b"WAVE");
    buf.put_slice(b"fmt ");
    buf.put_u32_le(16);
    buf.put_u16_le(1); // PCM
    buf.put_u16_le(1); // mono
    buf.put_u32_le(sample_rate);
    buf.put_u32_le(sample_rate * 2);
    buf.put_u16_le(2);
    buf.put_u16_le(16);
    buf.put_slice(b"data");
    buf.put_u32_le(data_len);

    for sample in samples {
        buf.put_i16_le(sample.wrapping_shl(gain_shift));
    }
    buf.freeze()
}
