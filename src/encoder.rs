//! External encoder subprocess management.
//!
//! An [`EncoderAdapter`] owns exactly one encoder process and the pipe
//! connected to its standard input. Frames are raw RGBA buffers that are
//! written straight into that pipe; the encoder turns them into a video
//! container at a temporary path that is handed back on [`EncoderAdapter::finalize`].
//!
//! ```text
//!  reserve ──► FrameSlot::write ──► stdin pipe ──► ffmpeg ──► /tmp/capture-XXXX.mkv
//!  finalize ──► close pipe, wait for exit, return path
//! ```
//!
//! A frame is written by a task of its own once its slot is taken, so a
//! frame reaches the encoder whole or not at all even when the request
//! that carried it is dropped.

use axum::body::Bytes;
use log::{debug, info, warn};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Bytes per pixel of the raw frames fed to the encoder (RGBA).
pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("Cannot create output file: {0}")]
    OutputFile(#[source] io::Error),
    #[error("Cannot start encoder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Encoder did not provide a stdin pipe")]
    NoStdin,
    #[error("Failed waiting for encoder to exit: {0}")]
    Wait(#[source] io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid geometry {width}x{height} @ {fps} fps: values must be positive and a frame must fit in memory")]
pub struct InvalidGeometry {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Frame size and rate of one recording; fixed for the adapter's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Geometry {
    width: u32,
    height: u32,
    fps: u32,
}

impl Geometry {
    pub fn new(width: u32, height: u32, fps: u32) -> Result<Self, InvalidGeometry> {
        let frame_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(BYTES_PER_PIXEL))
            .filter(|&len| len <= isize::MAX as usize);
        if width == 0 || height == 0 || fps == 0 || frame_len.is_none() {
            return Err(InvalidGeometry { width, height, fps });
        }
        Ok(Geometry { width, height, fps })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Number of bytes in one raw RGBA frame of this geometry.
    ///
    /// Cannot overflow: [`Geometry::new`] rejects sizes that would.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.fps)
    }
}

/// Builds the command line for an encoder process.
///
/// The process must read raw RGBA frames of the given geometry from stdin
/// and write its container to `output`. Stdio is configured by the adapter.
pub trait EncoderCommand: Send + Sync {
    fn command(&self, geometry: &Geometry, output: &Path) -> Command;

    /// File extension (without the dot) of the container the encoder writes
    fn extension(&self) -> &str;
}

/// ffmpeg with a fixed VP9 + alpha profile into Matroska.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    executable: PathBuf,
}

impl Ffmpeg {
    pub fn new(executable: PathBuf) -> Self {
        Ffmpeg { executable }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

impl EncoderCommand for Ffmpeg {
    fn command(&self, geometry: &Geometry, output: &Path) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.args(["-hide_banner", "-y"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgba"])
            .arg("-video_size")
            .arg(format!("{}x{}", geometry.width(), geometry.height()))
            .arg("-framerate")
            .arg(geometry.fps().to_string())
            .args(["-i", "-", "-an"])
            .args(["-vcodec", "libvpx-vp9", "-crf", "4", "-b:v", "0"])
            .args(["-pix_fmt", "yuva420p"])
            .arg(output);
        cmd
    }

    fn extension(&self) -> &str {
        "mkv"
    }
}

/// Where and how encoders are launched.
#[derive(Clone)]
pub struct EncoderSettings {
    pub command: Arc<dyn EncoderCommand>,
    /// Directory for output files, the system temp dir if `None`
    pub output_dir: Option<PathBuf>,
}

impl fmt::Debug for EncoderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderSettings")
            .field("extension", &self.command.extension())
            .field("output_dir", &self.output_dir)
            .finish()
    }
}

/// Result of handing a frame to an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Written,
    /// The adapter was finalized or its encoder is gone; the frame was dropped
    Discarded,
}

struct Running {
    child: Child,
    stdin: ChildStdin,
}

/// One encoder subprocess bound to one output file.
pub struct EncoderAdapter {
    output_path: PathBuf,
    geometry: Geometry,
    running: Arc<Mutex<Option<Running>>>,
    frames_written: AtomicU64,
}

impl EncoderAdapter {
    /// Create the output file and start the encoder.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(settings: &EncoderSettings, geometry: Geometry) -> Result<Self, EncoderError> {
        let output_path = create_output_file(settings)?;

        let mut cmd = settings.command.command(&geometry, &output_path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Keep the encoder out of our process group so a terminal Ctrl+C
        // only reaches us; the encoder is stopped by closing its stdin.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_file(&output_path);
                return Err(EncoderError::Spawn {
                    program: cmd.as_std().get_program().to_string_lossy().into_owned(),
                    source: e,
                });
            }
        };
        let Some(stdin) = child.stdin.take() else {
            let _ = child.start_kill();
            let _ = std::fs::remove_file(&output_path);
            return Err(EncoderError::NoStdin);
        };

        info!(
            "Started encoder (pid {:?}) for {} -> {}",
            child.id(),
            geometry,
            output_path.display()
        );

        Ok(EncoderAdapter {
            output_path,
            geometry,
            running: Arc::new(Mutex::new(Some(Running { child, stdin }))),
            frames_written: AtomicU64::new(0),
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::SeqCst)
    }

    /// Wait for the next write slot.
    ///
    /// Slots are granted in the order they are requested and only one is
    /// outstanding at a time. Dropping a slot without writing leaves the
    /// stream untouched.
    pub async fn reserve(self: &Arc<Self>) -> FrameSlot {
        FrameSlot {
            running: self.running.clone().lock_owned().await,
            adapter: self.clone(),
        }
    }

    /// Reserve a slot and write one frame into it.
    pub async fn place_frame(self: &Arc<Self>, frame: Bytes) -> Placement {
        self.reserve().await.write(frame).await
    }

    /// Close the encoder's input and wait for it to exit.
    ///
    /// Returns the output path the first time, `None` afterwards.
    pub async fn finalize(&self) -> Result<Option<PathBuf>, EncoderError> {
        let Some(Running { mut child, stdin }) = self.running.lock().await.take() else {
            return Ok(None);
        };
        drop(stdin);

        let status = child.wait().await.map_err(EncoderError::Wait)?;
        if status.success() {
            info!(
                "Encoder finished {} ({} frames)",
                self.output_path.display(),
                self.frames_written()
            );
        } else {
            warn!(
                "Encoder for {} exited with {} after {} frames",
                self.output_path.display(),
                status,
                self.frames_written()
            );
        }
        Ok(Some(self.output_path.clone()))
    }
}

impl Drop for EncoderAdapter {
    fn drop(&mut self) {
        // Slots hold the adapter alive, so nobody else can hold the lock here
        let running = self.running.try_lock().ok().and_then(|mut r| r.take());
        let Some(Running { mut child, stdin }) = running else {
            return;
        };
        drop(stdin);
        warn!(
            "Encoder for {} dropped without finalize",
            self.output_path.display()
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = child.wait().await {
                    warn!("Cannot reap abandoned encoder: {}", e);
                }
            });
        }
    }
}

/// Exclusive right to write the next frame of an [`EncoderAdapter`].
pub struct FrameSlot {
    adapter: Arc<EncoderAdapter>,
    running: OwnedMutexGuard<Option<Running>>,
}

impl FrameSlot {
    pub fn geometry(&self) -> &Geometry {
        self.adapter.geometry()
    }

    /// Write the whole frame to the encoder's stdin.
    ///
    /// Waits for the pipe to accept the buffer, so a slow encoder delays
    /// the caller. The write runs in its own task and is not cut short if
    /// the caller stops waiting.
    pub async fn write(self, frame: Bytes) -> Placement {
        match tokio::spawn(self.write_all(frame)).await {
            Ok(placement) => placement,
            Err(e) => {
                warn!("Frame write task failed: {}", e);
                Placement::Discarded
            }
        }
    }

    async fn write_all(mut self, frame: Bytes) -> Placement {
        let adapter = &self.adapter;
        let Some(running) = &mut *self.running else {
            debug!("Frame for finalized encoder {} dropped", adapter.output_path.display());
            return Placement::Discarded;
        };

        match running.stdin.write_all(&frame).await {
            Ok(()) => {
                adapter.frames_written.fetch_add(1, Ordering::SeqCst);
                Placement::Written
            }
            Err(e) => {
                warn!(
                    "Encoder for {} is not accepting frames: {}",
                    adapter.output_path.display(),
                    e
                );
                Placement::Discarded
            }
        }
    }
}

impl fmt::Debug for EncoderAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderAdapter")
            .field("output_path", &self.output_path)
            .field("geometry", &self.geometry)
            .field("frames_written", &self.frames_written())
            .finish()
    }
}

fn create_output_file(settings: &EncoderSettings) -> Result<PathBuf, EncoderError> {
    let suffix = format!(".{}", settings.command.extension());
    let mut builder = tempfile::Builder::new();
    builder.prefix("capture-").suffix(&suffix);
    let file = match &settings.output_dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
    .map_err(EncoderError::OutputFile)?;

    file.into_temp_path()
        .keep()
        .map_err(|e| EncoderError::OutputFile(e.error))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Copies stdin verbatim into the output file.
    pub(crate) struct CatEncoder;

    impl EncoderCommand for CatEncoder {
        fn command(&self, _geometry: &Geometry, output: &Path) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg("cat > \"$0\"").arg(output);
            cmd
        }

        fn extension(&self) -> &str {
            "raw"
        }
    }

    /// Like [`CatEncoder`] but only starts reading after a second.
    pub(crate) struct SlowEncoder;

    impl EncoderCommand for SlowEncoder {
        fn command(&self, _geometry: &Geometry, output: &Path) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg("sleep 1; cat > \"$0\"").arg(output);
            cmd
        }

        fn extension(&self) -> &str {
            "raw"
        }
    }

    /// Exits immediately without reading stdin.
    struct QuitEncoder;

    impl EncoderCommand for QuitEncoder {
        fn command(&self, _geometry: &Geometry, _output: &Path) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg("exit 3");
            cmd
        }

        fn extension(&self) -> &str {
            "raw"
        }
    }

    pub(crate) fn cat_settings(dir: &TempDir) -> EncoderSettings {
        EncoderSettings {
            command: Arc::new(CatEncoder),
            output_dir: Some(dir.path().to_path_buf()),
        }
    }

    pub(crate) fn slow_settings(dir: &TempDir) -> EncoderSettings {
        EncoderSettings {
            command: Arc::new(SlowEncoder),
            output_dir: Some(dir.path().to_path_buf()),
        }
    }

    #[test]
    fn test_geometry_validation() {
        assert!(Geometry::new(640, 480, 30).is_ok());
        assert!(Geometry::new(0, 480, 30).is_err());
        assert!(Geometry::new(640, 0, 30).is_err());
        assert!(Geometry::new(640, 480, 0).is_err());
        assert_eq!(Geometry::new(2, 3, 1).unwrap().frame_len(), 24);
    }

    #[test]
    fn test_geometry_frame_len_must_fit() {
        let err = Geometry::new(u32::MAX, u32::MAX, 30).unwrap_err();
        assert_eq!(
            err,
            InvalidGeometry {
                width: u32::MAX,
                height: u32::MAX,
                fps: 30
            }
        );
        #[cfg(target_pointer_width = "64")]
        assert_eq!(
            Geometry::new(65535, 65535, 1).unwrap().frame_len(),
            65535 * 65535 * 4
        );
    }

    #[test]
    fn test_ffmpeg_command_line() {
        let ffmpeg = Ffmpeg::new(PathBuf::from("/usr/bin/ffmpeg"));
        let geometry = Geometry::new(640, 480, 30).unwrap();
        let cmd = ffmpeg.command(&geometry, Path::new("/tmp/out.mkv"));
        let cmd = cmd.as_std();
        assert_eq!(cmd.get_program(), "/usr/bin/ffmpeg");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        let pos = args.iter().position(|a| a == "-video_size").unwrap();
        assert_eq!(args[pos + 1], "640x480");
        let pos = args.iter().position(|a| a == "-framerate").unwrap();
        assert_eq!(args[pos + 1], "30");
        assert!(args.windows(2).any(|w| w == ["-i", "-"]));
        assert_eq!(args.last().unwrap(), "/tmp/out.mkv");
        assert_eq!(ffmpeg.extension(), "mkv");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_frames_reach_encoder_in_order() {
        let dir = TempDir::new().unwrap();
        let geometry = Geometry::new(2, 2, 10).unwrap();
        let adapter = Arc::new(EncoderAdapter::spawn(&cat_settings(&dir), geometry).unwrap());
        assert!(adapter.output_path().starts_with(dir.path()));

        let frames: Vec<Vec<u8>> = (1..=3u8).map(|i| vec![i; geometry.frame_len()]).collect();
        for frame in &frames {
            let placement = adapter.place_frame(Bytes::from(frame.clone())).await;
            assert_eq!(placement, Placement::Written);
        }
        assert_eq!(adapter.frames_written(), 3);

        let path = adapter.finalize().await.unwrap().unwrap();
        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, frames.concat());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let geometry = Geometry::new(1, 1, 1).unwrap();
        let adapter = Arc::new(EncoderAdapter::spawn(&cat_settings(&dir), geometry).unwrap());

        assert!(adapter.finalize().await.unwrap().is_some());
        assert!(adapter.finalize().await.unwrap().is_none());
        let placement = adapter.place_frame(Bytes::from_static(&[0, 0, 0, 0])).await;
        assert_eq!(placement, Placement::Discarded);
        assert_eq!(adapter.frames_written(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dead_encoder_discards_frames() {
        let dir = TempDir::new().unwrap();
        let settings = EncoderSettings {
            command: Arc::new(QuitEncoder),
            output_dir: Some(dir.path().to_path_buf()),
        };
        let geometry = Geometry::new(64, 64, 1).unwrap();
        let adapter = Arc::new(EncoderAdapter::spawn(&settings, geometry).unwrap());

        // Keep writing until the closed pipe is noticed
        let frame = Bytes::from(vec![0u8; geometry.frame_len()]);
        let mut discarded = false;
        for _ in 0..64 {
            if adapter.place_frame(frame.clone()).await == Placement::Discarded {
                discarded = true;
                break;
            }
        }
        assert!(discarded);
        // A failed encoder still yields its path once
        assert!(adapter.finalize().await.unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slots_are_granted_in_request_order() {
        let dir = TempDir::new().unwrap();
        let geometry = Geometry::new(2, 2, 10).unwrap();
        let adapter = Arc::new(EncoderAdapter::spawn(&cat_settings(&dir), geometry).unwrap());
        let len = geometry.frame_len();

        let first = adapter.reserve().await;
        let second = tokio::spawn({
            let adapter = adapter.clone();
            async move { adapter.place_frame(Bytes::from(vec![2u8; len])).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(adapter.frames_written(), 0);

        assert_eq!(first.write(Bytes::from(vec![1u8; len])).await, Placement::Written);
        assert_eq!(second.await.unwrap(), Placement::Written);

        let path = adapter.finalize().await.unwrap().unwrap();
        let written = std::fs::read(path).unwrap();
        assert_eq!(written, [vec![1u8; len], vec![2u8; len]].concat());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abandoned_write_still_completes() {
        let dir = TempDir::new().unwrap();
        // One frame is far larger than a pipe buffer
        let geometry = Geometry::new(512, 512, 1).unwrap();
        let adapter = Arc::new(EncoderAdapter::spawn(&slow_settings(&dir), geometry).unwrap());
        let len = geometry.frame_len();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(200),
            adapter.place_frame(Bytes::from(vec![1u8; len])),
        )
        .await;
        assert!(abandoned.is_err());

        let placement = adapter.place_frame(Bytes::from(vec![2u8; len])).await;
        assert_eq!(placement, Placement::Written);
        assert_eq!(adapter.frames_written(), 2);

        let path = adapter.finalize().await.unwrap().unwrap();
        let written = std::fs::read(path).unwrap();
        assert_eq!(written.len(), 2 * len);
        assert!(written[..len].iter().all(|&b| b == 1));
        assert!(written[len..].iter().all(|&b| b == 2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_slot_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let geometry = Geometry::new(1, 1, 1).unwrap();
        let adapter = Arc::new(EncoderAdapter::spawn(&cat_settings(&dir), geometry).unwrap());

        drop(adapter.reserve().await);
        let placement = adapter.place_frame(Bytes::from_static(&[9, 9, 9, 9])).await;
        assert_eq!(placement, Placement::Written);

        let path = adapter.finalize().await.unwrap().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), vec![9u8; 4]);
    }

    #[tokio::test]
    async fn test_spawn_failure_removes_output_file() {
        let dir = TempDir::new().unwrap();
        let settings = EncoderSettings {
            command: Arc::new(Ffmpeg::new(dir.path().join("no-such-encoder"))),
            output_dir: Some(dir.path().to_path_buf()),
        };
        let geometry = Geometry::new(1, 1, 1).unwrap();
        let result = EncoderAdapter::spawn(&settings, geometry);
        assert!(matches!(result, Err(EncoderError::Spawn { .. })));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
