//! Camera collaborator and the agent-wide exclusive camera slot.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout};
use tracing::{debug, warn};

use super::CaptureError;

/// Time allowed for a freshly opened device to deliver its first frame.
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait CameraDevice: Send + Sync {
    async fn open(&self, fps: u32) -> Result<Box<dyn CameraStream>, CaptureError>;
}

#[async_trait]
pub trait CameraStream: Send {
    /// Next encoded frame; `None` once the device has stopped producing.
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError>;
    fn close(&mut self);
}

struct SlotInner {
    device: Arc<dyn CameraDevice>,
    busy: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

/// Single owner of the physical camera. At most one `CameraLease` exists at a time.
#[derive(Clone)]
pub struct CameraSlot {
    inner: Arc<SlotInner>,
}

/// Clears the busy flag unless disarmed; covers open errors and a dropped open future.
struct BusyGuard<'a> {
    busy: &'a AtomicBool,
    armed: bool,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if self.armed { self.busy.store(false, Ordering::SeqCst); }
    }
}

impl CameraSlot {
    pub fn new(device: Arc<dyn CameraDevice>) -> Self {
        Self {
            inner: Arc::new(SlotInner {
                device,
                busy: AtomicBool::new(false),
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            }),
        }
    }

    pub async fn acquire(&self, fps: u32) -> Result<CameraLease, CaptureError> {
        if self.inner.busy.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(CaptureError::Busy);
        }
        let mut guard = BusyGuard { busy: &self.inner.busy, armed: true };
        let stream = self.inner.device.open(fps).await?;
        guard.armed = false;
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        debug!(target: "webcam", fps, "camera acquired");
        Ok(CameraLease { stream, slot: self.inner.clone() })
    }

    pub fn is_held(&self) -> bool { self.inner.busy.load(Ordering::SeqCst) }

    pub fn opens(&self) -> usize { self.inner.opens.load(Ordering::SeqCst) }

    pub fn closes(&self) -> usize { self.inner.closes.load(Ordering::SeqCst) }
}

/// An open camera stream; dropping it closes the device and frees the slot.
pub struct CameraLease {
    stream: Box<dyn CameraStream>,
    slot: Arc<SlotInner>,
}

impl CameraLease {
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> { self.stream.next_frame().await }
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        self.stream.close();
        self.slot.closes.fetch_add(1, Ordering::SeqCst);
        self.slot.busy.store(false, Ordering::SeqCst);
        debug!(target: "webcam", "camera released");
    }
}

/// Camera backed by an `ffmpeg` child emitting MJPEG on stdout.
pub struct FfmpegCamera {
    input: Option<String>,
}

impl FfmpegCamera {
    pub fn new(input: Option<String>) -> Self { Self { input } }

    fn input_args(&self) -> (&'static str, String) {
        let configured = self.input.clone();
        if cfg!(target_os = "macos") {
            ("avfoundation", configured.unwrap_or_else(|| "0".to_string()))
        } else if cfg!(target_os = "windows") {
            ("dshow", configured.unwrap_or_else(|| "video=Integrated Camera".to_string()))
        } else {
            ("v4l2", configured.unwrap_or_else(|| "/dev/video0".to_string()))
        }
    }
}

#[async_trait]
impl CameraDevice for FfmpegCamera {
    async fn open(&self, fps: u32) -> Result<Box<dyn CameraStream>, CaptureError> {
        let (format, input) = self.input_args();
        let fps = fps.to_string();
        let mut child = tokio::process::Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-f", format, "-framerate", &fps, "-i", &input])
            .args(["-f", "mjpeg", "-q:v", "5", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaptureError::Unavailable(format!("ffmpeg: {}", e)))?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.start_kill();
            return Err(CaptureError::Unavailable("ffmpeg stdout not captured".into()));
        };
        let mut stream = FfmpegStream { child: Some(child), stdout, buf: Vec::with_capacity(64 * 1024), pending: None };

        // a device that cannot be opened makes ffmpeg exit before the first frame
        match tokio::time::timeout(FIRST_FRAME_TIMEOUT, stream.read_frame()).await {
            Ok(Ok(Some(first))) => {
                stream.pending = Some(first);
                Ok(Box::new(stream))
            }
            Ok(Ok(None)) => {
                stream.close();
                Err(CaptureError::Unavailable(format!("camera {} produced no frames", input)))
            }
            Ok(Err(e)) => {
                stream.close();
                Err(e)
            }
            Err(_) => {
                stream.close();
                Err(CaptureError::Unavailable(format!("camera {} timed out", input)))
            }
        }
    }
}

struct FfmpegStream {
    child: Option<Child>,
    stdout: ChildStdout,
    buf: Vec<u8>,
    pending: Option<Vec<u8>>,
}

impl FfmpegStream {
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        let mut chunk = [0u8; 16 * 1024];
        loop {
            if let Some(frame) = take_jpeg(&mut self.buf) { return Ok(Some(frame)); }
            let n = self.stdout.read(&mut chunk).await?;
            if n == 0 { return Ok(None); }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[async_trait]
impl CameraStream for FfmpegStream {
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        if let Some(frame) = self.pending.take() { return Ok(Some(frame)); }
        self.read_frame().await
    }

    fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() { warn!(target: "webcam", "ffmpeg kill failed: {}", e); }
        }
    }
}

/// Cut the first complete JPEG (SOI `FF D8` .. EOI `FF D9`) out of `buf`.
/// Bytes before the SOI are discarded.
pub fn take_jpeg(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let soi = buf.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let eoi = buf[soi + 2..].windows(2).position(|w| w == [0xFF, 0xD9])? + soi + 2;
    let frame = buf[soi..eoi + 2].to_vec();
    buf.drain(..eoi + 2);
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_concatenated_jpegs() {
        let mut buf = vec![0x00, 0xFF, 0xD8, 1, 2, 0xFF, 0xD9, 0xFF, 0xD8, 3];
        assert_eq!(take_jpeg(&mut buf).unwrap(), vec![0xFF, 0xD8, 1, 2, 0xFF, 0xD9]);
        assert_eq!(take_jpeg(&mut buf), None);
        buf.extend_from_slice(&[4, 0xFF, 0xD9]);
        assert_eq!(take_jpeg(&mut buf).unwrap(), vec![0xFF, 0xD8, 3, 4, 0xFF, 0xD9]);
        assert!(buf.is_empty());
    }

    struct NeverOpens;

    #[async_trait]
    impl CameraDevice for NeverOpens {
        async fn open(&self, _fps: u32) -> Result<Box<dyn CameraStream>, CaptureError> {
            Err(CaptureError::Unavailable("no device".into()))
        }
    }

    #[tokio::test]
    async fn failed_open_frees_the_slot() {
        let slot = CameraSlot::new(Arc::new(NeverOpens));
        assert!(slot.acquire(10).await.is_err());
        assert!(!slot.is_held());
        assert_eq!(slot.opens(), 0);
        assert_eq!(slot.closes(), 0);
    }
}
