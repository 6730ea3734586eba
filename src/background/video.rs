use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use std::ffi::OsString;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

/// A video opened for sequential reading with a single play cursor.
pub trait SequentialReader: Send {
    /// Read the frame under the cursor and advance.
    ///
    /// Returns `Ok(None)` at end of stream.
    fn read_frame(&mut self) -> Result<Option<RgbImage>>;

    /// Move the cursor back to the first frame.
    fn rewind(&mut self) -> Result<()>;
}

/// Decodes a video file to RGB frames through an `ffmpeg` child process.
///
/// Rewinding restarts the decoder, which is the cheapest reliable way to seek
/// to frame zero for every container ffmpeg understands.
pub struct FfmpegVideoReader {
    path: PathBuf,
    width: u32,
    height: u32,
    decoder: Option<Decoder>,
}

struct Decoder {
    child: Child,
    stdout: ChildStdout,
}

impl FfmpegVideoReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            bail!("video file {} does not exist", path.display());
        }

        let (width, height) = probe_dimensions(&path)?;
        tracing::info!(
            "Opened background video {} ({}x{})",
            path.display(),
            width,
            height
        );

        let mut reader = Self {
            path,
            width,
            height,
            decoder: None,
        };
        reader.spawn_decoder()?;
        Ok(reader)
    }

    fn spawn_decoder(&mut self) -> Result<()> {
        self.stop_decoder();

        let mut child = Command::new("ffmpeg")
            .args(decoder_args(&self.path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn ffmpeg decoder")?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stdout"))?;

        self.decoder = Some(Decoder { child, stdout });
        Ok(())
    }

    fn stop_decoder(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            let _ = decoder.child.kill();
            let _ = decoder.child.wait();
        }
    }
}

impl SequentialReader for FfmpegVideoReader {
    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let decoder = match self.decoder.as_mut() {
            Some(decoder) => decoder,
            None => return Ok(None),
        };

        let mut buffer = vec![0u8; self.width as usize * self.height as usize * 3];
        match decoder.stdout.read_exact(&mut buffer) {
            Ok(()) => RgbImage::from_raw(self.width, self.height, buffer)
                .map(Some)
                .ok_or_else(|| anyhow!("decoded frame has the wrong size")),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                self.stop_decoder();
                Ok(None)
            }
            Err(err) => {
                self.stop_decoder();
                Err(err).context("Failed to read decoded frame")
            }
        }
    }

    fn rewind(&mut self) -> Result<()> {
        tracing::debug!("Rewinding background video {}", self.path.display());
        self.spawn_decoder()
    }
}

impl Drop for FfmpegVideoReader {
    fn drop(&mut self) {
        self.stop_decoder();
        tracing::debug!("Released background video {}", self.path.display());
    }
}

/// Raw rgb24 frames on stdout at the probed (coded) size.
///
/// Autorotation stays off: ffprobe reports the unrotated geometry, and a
/// rotated stream would be sliced with width and height swapped.
fn decoder_args(path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-noautorotate", "-i"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(path.as_os_str().to_os_string());
    args.extend(
        ["-an", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"]
            .into_iter()
            .map(OsString::from),
    );
    args
}

fn probe_dimensions(path: &Path) -> Result<(u32, u32)> {
    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height")
        .arg("-of")
        .arg("csv=p=0:s=x")
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .context("Failed to run ffprobe")?;

    if !output.status.success() {
        bail!(
            "ffprobe could not read {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_dimensions(&String::from_utf8_lossy(&output.stdout))
}

fn parse_dimensions(text: &str) -> Result<(u32, u32)> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| anyhow!("no video stream found"))?;

    let (w, h) = line
        .split_once('x')
        .ok_or_else(|| anyhow!("unexpected ffprobe output {line:?}"))?;
    let width: u32 = w.trim().parse().context("invalid video width")?;
    let height: u32 = h.trim().trim_end_matches('x').parse().context("invalid video height")?;

    if width == 0 || height == 0 {
        bail!("video reports zero-sized frames");
    }
    Ok((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ffprobe_dimensions() {
        assert_eq!(parse_dimensions("1280x720\n").unwrap(), (1280, 720));
        assert_eq!(parse_dimensions("\n640x360x\n").unwrap(), (640, 360));
        assert!(parse_dimensions("").is_err());
        assert!(parse_dimensions("0x0").is_err());
        assert!(parse_dimensions("garbage").is_err());
    }

    #[test]
    fn decoder_keeps_coded_geometry() {
        let args = decoder_args(Path::new("背景/clip.mp4"));
        let noautorotate = args.iter().position(|a| a == "-noautorotate").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(noautorotate < input, "-noautorotate must precede the input");
        assert_eq!(args[input + 1], OsString::from("背景/clip.mp4"));
        assert!(args.windows(2).any(|w| w == ["-pix_fmt", "rgb24"]));
        assert_eq!(args.last().unwrap(), "-");
    }

    #[test]
    fn missing_video_fails_to_open() {
        assert!(FfmpegVideoReader::open("no/such/背景视频.mp4").is_err());
    }
}
