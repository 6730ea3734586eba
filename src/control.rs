//! Control surface for a running pipeline.
//!
//! Settings changes land in a pending slot that the pipeline takes at the start
//! of a tick, so a tick never sees a half-applied change. Requests that act on
//! owned resources (background, recorder, carousel) go through a queue drained
//! at the same point.

use crate::background::BackgroundKind;
use crate::config::{RgbColor, Settings};
use crate::error::PipelineResult;
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Work the pipeline performs on its own thread at a tick boundary.
#[derive(Debug)]
pub enum ControlRequest {
    /// Reopen the camera, at `index` or the last index used.
    StartCapture {
        index: Option<u32>,
    },
    StopCapture,
    SetBackground {
        path: PathBuf,
        kind: BackgroundKind,
        reply: Option<Sender<PipelineResult<()>>>,
    },
    StartCarousel {
        images: Vec<PathBuf>,
        interval: Duration,
    },
    StopCarousel,
    StartRecording {
        path: PathBuf,
    },
    StopRecording,
    Stop,
}

#[derive(Debug)]
struct PendingSlot {
    latest: Settings,
    dirty: bool,
}

/// Cloneable writer side, usable from any thread.
#[derive(Clone)]
pub struct ControlHandle {
    pending: Arc<Mutex<PendingSlot>>,
    requests: Sender<ControlRequest>,
}

/// Reader side, owned by the pipeline.
pub struct ControlInbox {
    pending: Arc<Mutex<PendingSlot>>,
    requests: Receiver<ControlRequest>,
}

pub fn channel(initial: Settings) -> (ControlHandle, ControlInbox) {
    let pending = Arc::new(Mutex::new(PendingSlot {
        latest: initial,
        dirty: false,
    }));
    let (tx, rx) = unbounded();
    (
        ControlHandle {
            pending: pending.clone(),
            requests: tx,
        },
        ControlInbox {
            pending,
            requests: rx,
        },
    )
}

impl ControlHandle {
    /// Apply `change` to the latest settings and publish the result as one snapshot.
    pub fn update(&self, change: impl FnOnce(&mut Settings)) {
        let mut slot = self.pending.lock();
        change(&mut slot.latest);
        slot.dirty = true;
    }

    pub fn set_threshold(&self, threshold: f32) {
        self.update(|s| s.set_threshold(threshold));
    }

    pub fn set_caption_text(&self, text: impl Into<String>) {
        let text = text.into();
        self.update(|s| s.caption.text = text);
    }

    pub fn set_caption_position(&self, x: i32, y: i32) {
        self.update(|s| {
            s.caption.x = x;
            s.caption.y = y;
        });
    }

    pub fn set_caption_size(&self, font_size: f32) {
        self.update(|s| s.caption.font_size = font_size);
    }

    pub fn set_caption_color(&self, color: RgbColor) {
        self.update(|s| s.caption.color = color);
    }

    /// Queue a background change. The receiver yields the outcome once a tick applies it.
    ///
    /// The receiver may be dropped; the pipeline logs failures either way.
    pub fn set_background(
        &self,
        path: PathBuf,
        kind: BackgroundKind,
    ) -> Receiver<PipelineResult<()>> {
        let (tx, rx) = bounded(1);
        self.send(ControlRequest::SetBackground {
            path,
            kind,
            reply: Some(tx),
        });
        rx
    }

    pub fn start_camera(&self, index: Option<u32>) {
        self.send(ControlRequest::StartCapture { index });
    }

    pub fn stop_camera(&self) {
        self.send(ControlRequest::StopCapture);
    }

    pub fn start_carousel(&self, images: Vec<PathBuf>, interval: Duration) {
        self.send(ControlRequest::StartCarousel { images, interval });
    }

    pub fn stop_carousel(&self) {
        self.send(ControlRequest::StopCarousel);
    }

    pub fn start_recording(&self, path: PathBuf) {
        self.send(ControlRequest::StartRecording { path });
    }

    pub fn stop_recording(&self) {
        self.send(ControlRequest::StopRecording);
    }

    pub fn stop(&self) {
        self.send(ControlRequest::Stop);
    }

    fn send(&self, request: ControlRequest) {
        if self.requests.send(request).is_err() {
            tracing::warn!("Pipeline is gone, dropping control request");
        }
    }
}

impl ControlInbox {
    /// The newest settings snapshot, if anything changed since the last call.
    pub fn take_settings(&self) -> Option<Settings> {
        let mut slot = self.pending.lock();
        if !slot.dirty {
            return None;
        }
        slot.dirty = false;
        Some(slot.latest.clone())
    }

    pub fn drain(&self) -> Vec<ControlRequest> {
        self.requests.try_iter().collect()
    }
}

/// One line of the text control protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Threshold(f32),
    Caption(String),
    Position(i32, i32),
    FontSize(f32),
    Color(RgbColor),
    Image(PathBuf),
    Video(PathBuf),
    CameraStart(Option<u32>),
    CameraStop,
    Carousel { interval: Duration, images: Vec<PathBuf> },
    CarouselStop,
    Record(PathBuf),
    RecordStop,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let number = |v: &str, what: &str| -> Result<f32, String> {
            v.parse::<f32>()
                .map_err(|_| format!("{what} must be a number, got {v:?}"))
        };
        let require_path = |what: &str| -> Result<PathBuf, String> {
            if rest.is_empty() {
                Err(format!("{what} needs a path"))
            } else {
                Ok(PathBuf::from(rest))
            }
        };

        match verb {
            "threshold" => Ok(Command::Threshold(number(rest, "threshold")?)),
            "caption" => Ok(Command::Caption(rest.to_string())),
            "pos" => {
                let mut parts = rest.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(x), Some(y), None) => Ok(Command::Position(
                        x.parse().map_err(|_| format!("invalid x {x:?}"))?,
                        y.parse().map_err(|_| format!("invalid y {y:?}"))?,
                    )),
                    _ => Err("usage: pos <x> <y>".to_string()),
                }
            }
            "size" => {
                let size = number(rest, "size")?;
                if size <= 0.0 {
                    return Err("size must be positive".to_string());
                }
                Ok(Command::FontSize(size))
            }
            "color" => {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                let spec = if parts.len() == 3 {
                    parts.join(",")
                } else {
                    rest.to_string()
                };
                Ok(Command::Color(spec.parse()?))
            }
            "image" => Ok(Command::Image(require_path("image")?)),
            "video" => Ok(Command::Video(require_path("video")?)),
            "camera" => {
                let mut parts = rest.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some("stop"), None, None) => Ok(Command::CameraStop),
                    (Some("start"), None, None) => Ok(Command::CameraStart(None)),
                    (Some("start"), Some(index), None) => index
                        .parse()
                        .map(|index| Command::CameraStart(Some(index)))
                        .map_err(|_| format!("camera index must be a number, got {index:?}")),
                    _ => Err("usage: camera start [index] | camera stop".to_string()),
                }
            }
            "carousel" if rest == "stop" => Ok(Command::CarouselStop),
            "carousel" => {
                let mut parts = rest.split_whitespace();
                let secs = parts
                    .next()
                    .ok_or_else(|| "usage: carousel <secs> <path>...".to_string())?;
                let secs: u64 = secs
                    .parse()
                    .map_err(|_| format!("interval must be whole seconds, got {secs:?}"))?;
                let images: Vec<PathBuf> = parts.map(PathBuf::from).collect();
                if images.is_empty() {
                    return Err("carousel needs at least one image".to_string());
                }
                Ok(Command::Carousel {
                    interval: Duration::from_secs(secs),
                    images,
                })
            }
            "record" if rest == "stop" => Ok(Command::RecordStop),
            "record" => Ok(Command::Record(require_path("record")?)),
            "quit" | "exit" => Ok(Command::Quit),
            "" => Err("empty command".to_string()),
            other => Err(format!("unknown command {other:?}")),
        }
    }
}

impl ControlHandle {
    /// Forward a parsed command. Never blocks on the pipeline.
    pub fn dispatch(&self, command: Command) {
        match command {
            Command::Threshold(t) => self.set_threshold(t),
            Command::Caption(text) => self.set_caption_text(text),
            Command::Position(x, y) => self.set_caption_position(x, y),
            Command::FontSize(size) => self.set_caption_size(size),
            Command::Color(color) => self.set_caption_color(color),
            Command::Image(path) => drop(self.set_background(path, BackgroundKind::Image)),
            Command::Video(path) => drop(self.set_background(path, BackgroundKind::Video)),
            Command::CameraStart(index) => self.start_camera(index),
            Command::CameraStop => self.stop_camera(),
            Command::Carousel { interval, images } => self.start_carousel(images, interval),
            Command::CarouselStop => self.stop_carousel(),
            Command::Record(path) => self.start_recording(path),
            Command::RecordStop => self.stop_recording(),
            Command::Quit => self.stop(),
        }
    }
}

/// Read commands from stdin on a background thread until EOF or `quit`.
pub fn spawn_stdin_reader(handle: ControlHandle) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("control".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::warn!("Control input error: {}", err);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Ok(Command::Quit) => {
                        handle.stop();
                        break;
                    }
                    Ok(command) => handle.dispatch(command),
                    Err(err) => tracing::warn!("{}", err),
                }
            }
            tracing::debug!("Control input closed");
        })
        .context("Failed to spawn control thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn parses_every_command() {
        assert_eq!(Command::parse("threshold 0.7"), Ok(Command::Threshold(0.7)));
        assert_eq!(
            Command::parse("caption 为人民服务 Serve"),
            Ok(Command::Caption("为人民服务 Serve".into()))
        );
        assert_eq!(Command::parse("caption"), Ok(Command::Caption(String::new())));
        assert_eq!(Command::parse("pos 20 -5"), Ok(Command::Position(20, -5)));
        assert_eq!(Command::parse("size 64"), Ok(Command::FontSize(64.0)));
        assert_eq!(
            Command::parse("color 255 0 10"),
            Ok(Command::Color(RgbColor::new(255, 0, 10)))
        );
        assert_eq!(
            Command::parse("color #00ff00"),
            Ok(Command::Color(RgbColor::new(0, 255, 0)))
        );
        assert_eq!(
            Command::parse("image /tmp/背景 一.png"),
            Ok(Command::Image(PathBuf::from("/tmp/背景 一.png")))
        );
        assert_eq!(
            Command::parse("video loop.mp4"),
            Ok(Command::Video(PathBuf::from("loop.mp4")))
        );
        assert_eq!(
            Command::parse("carousel 3 a.png b.png"),
            Ok(Command::Carousel {
                interval: Duration::from_secs(3),
                images: vec![PathBuf::from("a.png"), PathBuf::from("b.png")],
            })
        );
        assert_eq!(Command::parse("carousel stop"), Ok(Command::CarouselStop));
        assert_eq!(
            Command::parse("record out.avi"),
            Ok(Command::Record(PathBuf::from("out.avi")))
        );
        assert_eq!(Command::parse("record stop"), Ok(Command::RecordStop));
        assert_eq!(Command::parse("camera stop"), Ok(Command::CameraStop));
        assert_eq!(Command::parse("camera start"), Ok(Command::CameraStart(None)));
        assert_eq!(Command::parse("camera start 2"), Ok(Command::CameraStart(Some(2))));
        assert_eq!(Command::parse("  quit "), Ok(Command::Quit));
    }

    #[test]
    fn rejects_malformed_commands() {
        for line in [
            "",
            "threshold high",
            "pos 1",
            "pos 1 2 3",
            "size -4",
            "color 1 2",
            "image",
            "carousel",
            "carousel x a.png",
            "carousel 5",
            "record",
            "camera",
            "camera start front",
            "camera start 1 2",
            "camera pause",
            "dance",
        ] {
            assert!(Command::parse(line).is_err(), "{line:?} should not parse");
        }
    }

    #[test]
    fn settings_are_published_as_whole_snapshots() {
        let (handle, inbox) = channel(Settings::default());
        assert!(inbox.take_settings().is_none());

        handle.set_threshold(0.8);
        handle.set_caption_text("标语");
        handle.set_caption_position(30, 40);

        let snapshot = inbox.take_settings().unwrap();
        assert_eq!(snapshot.threshold(), 0.8);
        assert_eq!(snapshot.caption.text, "标语");
        assert_eq!((snapshot.caption.x, snapshot.caption.y), (30, 40));
        assert!(inbox.take_settings().is_none());
    }

    #[test]
    fn concurrent_writers_never_tear_a_snapshot() {
        let (handle, inbox) = channel(Settings::default());
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let handle = handle.clone();
                thread::spawn(move || {
                    for n in 0..200 {
                        handle.set_caption_position(i * 1000 + n, i * 1000 + n);
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            if let Some(s) = inbox.take_settings() {
                assert_eq!(s.caption.x, s.caption.y);
            }
        }
        for writer in writers {
            writer.join().unwrap();
        }
        let last = inbox.take_settings().unwrap();
        assert_eq!(last.caption.x, last.caption.y);
    }

    #[test]
    fn requests_are_queued_in_order() {
        let (handle, inbox) = channel(Settings::default());
        handle.start_recording(PathBuf::from("a.mp4"));
        handle.stop_carousel();
        let _reply = handle.set_background(PathBuf::from("bg.png"), BackgroundKind::Image);
        handle.stop();

        let requests = inbox.drain();
        assert_eq!(requests.len(), 4);
        assert!(
            matches!(&requests[0], ControlRequest::StartRecording { path } if path == Path::new("a.mp4"))
        );
        assert!(matches!(requests[1], ControlRequest::StopCarousel));
        assert!(matches!(
            requests[2],
            ControlRequest::SetBackground {
                kind: BackgroundKind::Image,
                ..
            }
        ));
        assert!(matches!(requests[3], ControlRequest::Stop));
        assert!(inbox.drain().is_empty());
    }

    #[test]
    fn dispatch_queues_without_waiting_for_a_tick() {
        let (handle, inbox) = channel(Settings::default());
        let started = std::time::Instant::now();

        handle.dispatch(Command::Threshold(0.3));
        handle.dispatch(Command::Image(PathBuf::from("背景.png")));
        handle.dispatch(Command::Video(PathBuf::from("loop.mp4")));
        handle.dispatch(Command::CameraStop);
        handle.dispatch(Command::CameraStart(Some(1)));

        // Nothing drains the inbox until here, so any wait would show up.
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(inbox.take_settings().unwrap().threshold(), 0.3);

        let requests = inbox.drain();
        assert_eq!(requests.len(), 4);
        assert!(matches!(
            &requests[0],
            ControlRequest::SetBackground { path, kind: BackgroundKind::Image, .. }
                if path == Path::new("背景.png")
        ));
        assert!(matches!(
            requests[1],
            ControlRequest::SetBackground { kind: BackgroundKind::Video, .. }
        ));
        assert!(matches!(requests[2], ControlRequest::StopCapture));
        assert!(matches!(requests[3], ControlRequest::StartCapture { index: Some(1) }));
    }
}
