use super::RecordingSink;
use crate::error::{PipelineError, PipelineResult};
use image::RgbImage;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

/// Four-character codec tag written into the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const MP4V: FourCc = FourCc(*b"mp4v");
    pub const XVID: FourCc = FourCc(*b"XVID");
    pub const MJPG: FourCc = FourCc(*b"MJPG");

    /// Tags the encoder mapping below can produce.
    const SUPPORTED: [FourCc; 3] = [FourCc::MP4V, FourCc::XVID, FourCc::MJPG];

    /// `.avi` records as XVID, everything else as mp4v.
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("avi") => FourCc::XVID,
            _ => FourCc::MP4V,
        }
    }

    /// ffmpeg encoder producing this tag.
    fn encoder(self) -> &'static str {
        match self {
            FourCc::MJPG => "mjpeg",
            _ => "mpeg4",
        }
    }
}

impl std::str::FromStr for FourCc {
    type Err = String;

    /// Accepts `mp4v`, `XVID` or `MJPG`, in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FourCc::SUPPORTED
            .into_iter()
            .find(|tag| tag.0.eq_ignore_ascii_case(s.as_bytes()))
            .ok_or_else(|| format!("unsupported codec tag {s:?}, expected mp4v, XVID or MJPG"))
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Where and how to record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSpec {
    pub path: PathBuf,
    pub fourcc: FourCc,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

impl RecordingSpec {
    pub fn new(path: PathBuf, fps: u32, width: u32, height: u32) -> Self {
        let fourcc = FourCc::for_path(&path);
        Self {
            path,
            fourcc,
            fps,
            width,
            height,
        }
    }

    fn encoder_args(&self) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{}x{}", self.width, self.height),
            "-r".into(),
            self.fps.to_string(),
            "-i".into(),
            "-".into(),
            "-an".into(),
            "-c:v".into(),
            self.fourcc.encoder().into(),
            "-vtag".into(),
            self.fourcc.to_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ]
    }
}

/// Encodes frames to a video file through an `ffmpeg` child process.
///
/// Frames must already be at the recording resolution. The file is only valid
/// after [`RecordingSink::close`], which `Drop` also calls.
pub struct FfmpegRecorder {
    spec: RecordingSpec,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    frames: u64,
}

impl FfmpegRecorder {
    pub fn open(spec: RecordingSpec) -> PipelineResult<Self> {
        if spec.width == 0 || spec.height == 0 || spec.fps == 0 {
            return Err(PipelineError::Recording(format!(
                "invalid recording format {}x{} at {} fps",
                spec.width, spec.height, spec.fps
            )));
        }
        // Unwritable destinations fail here, before any encoder exists.
        File::create(&spec.path).map_err(|e| {
            PipelineError::Recording(format!("cannot write {}: {e}", spec.path.display()))
        })?;

        let mut child = Command::new("ffmpeg")
            .args(spec.encoder_args())
            .arg(&spec.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PipelineError::Recording(format!("failed to spawn ffmpeg: {e}")))?;

        let stdin = child.stdin.take();
        if stdin.is_none() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PipelineError::Recording(
                "failed to capture ffmpeg stdin".to_string(),
            ));
        }

        tracing::info!(
            "Recording to {} ({} {}x{} @ {} fps)",
            spec.path.display(),
            spec.fourcc,
            spec.width,
            spec.height,
            spec.fps
        );

        Ok(Self {
            spec,
            child: Some(child),
            stdin,
            frames: 0,
        })
    }
}

impl RecordingSink for FfmpegRecorder {
    fn write_frame(&mut self, frame: &RgbImage) -> PipelineResult<()> {
        if frame.dimensions() != (self.spec.width, self.spec.height) {
            return Err(PipelineError::Recording(format!(
                "frame is {:?}, recording is {}x{}",
                frame.dimensions(),
                self.spec.width,
                self.spec.height
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PipelineError::Recording("recorder is closed".to_string()))?;

        stdin
            .write_all(frame.as_raw())
            .map_err(|e| PipelineError::Recording(format!("failed to write frame: {e}")))?;
        self.frames += 1;
        Ok(())
    }

    fn close(&mut self) {
        // Closing stdin signals end of input to the encoder.
        drop(self.stdin.take());

        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) if status.success() => tracing::info!(
                    "Recording saved to {} ({} frames)",
                    self.spec.path.display(),
                    self.frames
                ),
                Ok(status) => tracing::warn!(
                    "Encoder for {} exited with {}",
                    self.spec.path.display(),
                    status
                ),
                Err(err) => tracing::warn!("Failed to wait for encoder: {}", err),
            }
        }
    }
}

impl Drop for FfmpegRecorder {
    fn drop(&mut self) {
        self.close();
    }
}
