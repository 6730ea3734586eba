use crate::background::{BackgroundKind, BackgroundProvider, Carousel};
use crate::capture::CaptureSource;
use crate::compositor::{composite, CaptionRenderer};
use crate::config::Settings;
use crate::control::{ControlInbox, ControlRequest};
use crate::error::{PipelineError, PipelineResult};
use crate::fps::FrameRateMonitor;
use crate::output::{DisplaySink, FfmpegRecorder, FourCc, RecordingSink, RecordingSpec};
use crate::segmentation::{MaskPostprocessor, Preprocessor, SegmentationEngine};
use image::{imageops, RgbImage};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Fixed knobs of the tick loop.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub tick_interval: Duration,
    pub record_fps: u32,
    pub record_width: u32,
    pub record_height: u32,
    /// Overrides the codec picked from the recording file extension.
    pub record_codec: Option<FourCc>,
    pub stats_every: u64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(33),
            record_fps: 30,
            record_width: 960,
            record_height: 560,
            record_codec: None,
            stats_every: 30,
        }
    }
}

/// Opens the camera with the given device index.
pub type CaptureOpener<C> = Box<dyn FnMut(u32) -> anyhow::Result<C>>;

/// What a single tick ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No frame was available; nothing was published.
    Skipped,
    /// Processing failed; the captured frame was published unmodified.
    PassThrough,
    /// The composited frame was published.
    Composited,
}

#[derive(Debug, Default)]
struct StageStats {
    frames: u64,
    capture: Duration,
    segment: Duration,
    output: Duration,
}

/// Drives capture, segmentation, compositing, recording, and display on a fixed tick.
///
/// Everything it owns is touched only from the thread calling [`Pipeline::tick`].
/// Other threads reach it through the [`ControlInbox`].
pub struct Pipeline<C: CaptureSource, D: DisplaySink> {
    capture: Option<C>,
    opener: Option<CaptureOpener<C>>,
    camera_index: u32,
    display: D,
    engine: Option<Box<dyn SegmentationEngine>>,
    preprocessor: Preprocessor,
    background: BackgroundProvider,
    carousel: Option<Carousel>,
    caption: CaptionRenderer,
    recorder: Option<Box<dyn RecordingSink>>,
    fps: FrameRateMonitor,
    settings: Settings,
    inbox: ControlInbox,
    options: PipelineOptions,
    stats: StageStats,
    stop_requested: bool,
}

impl<C: CaptureSource, D: DisplaySink> Pipeline<C, D> {
    pub fn new(
        engine: Box<dyn SegmentationEngine>,
        display: D,
        caption: CaptionRenderer,
        settings: Settings,
        inbox: ControlInbox,
        options: PipelineOptions,
    ) -> Self {
        Self {
            capture: None,
            opener: None,
            camera_index: 0,
            display,
            engine: Some(engine),
            preprocessor: Preprocessor::default(),
            background: BackgroundProvider::new(),
            carousel: None,
            caption,
            recorder: None,
            fps: FrameRateMonitor::default(),
            settings,
            inbox,
            options,
            stats: StageStats::default(),
            stop_requested: false,
        }
    }

    /// How `camera start` requests open a device.
    pub fn set_capture_opener(&mut self, opener: impl FnMut(u32) -> anyhow::Result<C> + 'static) {
        self.opener = Some(Box::new(opener));
    }

    /// Close any running camera, then open and start camera `index`.
    pub fn open_capture(&mut self, index: u32) -> PipelineResult<()> {
        self.stop_capture();
        let opener = self
            .opener
            .as_mut()
            .ok_or_else(|| PipelineError::Capture("no camera opener configured".into()))?;
        let capture = opener(index)
            .map_err(|err| PipelineError::Capture(format!("camera {index}: {err:#}")))?;
        self.camera_index = index;
        self.start_capture(capture);
        Ok(())
    }

    /// Begin capturing from `capture`, replacing any running camera.
    pub fn start_capture(&mut self, capture: C) {
        let (width, height) = capture.resolution();
        tracing::info!("Capture started at {}x{}", width, height);
        self.capture = Some(capture);
        self.fps.reset();
    }

    /// Stop capturing. Recording cannot outlive the camera, so it stops too.
    pub fn stop_capture(&mut self) {
        self.stop_recording();
        if self.capture.take().is_some() {
            tracing::info!("Capture stopped");
        }
        self.fps.reset();
    }

    pub fn set_background(&mut self, path: &Path, kind: BackgroundKind) -> PipelineResult<()> {
        self.background.set_source(path, kind)
    }

    pub fn start_carousel(&mut self, images: Vec<PathBuf>, interval: Duration, now: Instant) {
        let Some(carousel) = Carousel::new(images, interval, now) else {
            tracing::warn!("Carousel needs at least one image");
            return;
        };
        tracing::info!(
            "Carousel started: {} images every {:?}",
            carousel.len(),
            carousel.interval()
        );
        if let Err(err) = self.background.set_source(carousel.current(), BackgroundKind::Image) {
            tracing::warn!("Carousel image skipped: {}", err);
        }
        self.carousel = Some(carousel);
    }

    pub fn stop_carousel(&mut self) {
        if self.carousel.take().is_some() {
            tracing::info!("Carousel stopped");
        }
    }

    /// Start recording to `path`, replacing any recording in progress.
    ///
    /// On error nothing is recorded, including the previous recording.
    pub fn start_recording(&mut self, path: PathBuf) -> PipelineResult<()> {
        self.require_capture()?;
        self.stop_recording();

        let mut spec = RecordingSpec::new(
            path,
            self.options.record_fps,
            self.options.record_width,
            self.options.record_height,
        );
        if let Some(codec) = self.options.record_codec {
            spec.fourcc = codec;
        }
        let recorder = FfmpegRecorder::open(spec)?;
        self.attach_recorder(Box::new(recorder))
    }

    /// Record into `sink` from the next tick on, closing any previous sink.
    pub fn attach_recorder(&mut self, sink: Box<dyn RecordingSink>) -> PipelineResult<()> {
        self.require_capture()?;
        self.stop_recording();
        self.recorder = Some(sink);
        Ok(())
    }

    fn require_capture(&self) -> PipelineResult<()> {
        if self.capture.is_none() {
            return Err(PipelineError::Recording(
                "start the camera before recording".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stop_recording(&mut self) {
        if let Some(mut recorder) = self.recorder.take() {
            recorder.close();
        }
    }

    /// Apply pending settings and queued requests. Runs once at the start of every tick.
    fn apply_control(&mut self, now: Instant) {
        if let Some(settings) = self.inbox.take_settings() {
            tracing::debug!("Applying settings {:?}", settings);
            self.settings = settings;
        }

        for request in self.inbox.drain() {
            match request {
                ControlRequest::StartCapture { index } => {
                    let index = index.unwrap_or(self.camera_index);
                    if let Err(err) = self.open_capture(index) {
                        tracing::warn!("{}", err);
                    }
                }
                ControlRequest::StopCapture => self.stop_capture(),
                ControlRequest::SetBackground { path, kind, reply } => {
                    self.stop_carousel();
                    let result = self.set_background(&path, kind);
                    if let Err(err) = &result {
                        tracing::warn!("{}", err);
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                ControlRequest::StartCarousel { images, interval } => {
                    self.start_carousel(images, interval, now)
                }
                ControlRequest::StopCarousel => self.stop_carousel(),
                ControlRequest::StartRecording { path } => {
                    if let Err(err) = self.start_recording(path) {
                        tracing::warn!("{}", err);
                    }
                }
                ControlRequest::StopRecording => self.stop_recording(),
                ControlRequest::Stop => {
                    tracing::info!("Stop requested");
                    self.stop_requested = true;
                }
            }
        }

        if let Some(carousel) = self.carousel.as_mut() {
            if let Some(next) = carousel.poll(now) {
                if let Err(err) = self.background.set_source(next, BackgroundKind::Image) {
                    tracing::warn!("Carousel image skipped: {}", err);
                }
            }
        }
    }

    pub fn tick(&mut self) -> TickOutcome {
        self.tick_at(Instant::now())
    }

    /// Run one tick as if the clock read `now`.
    pub fn tick_at(&mut self, now: Instant) -> TickOutcome {
        self.apply_control(now);

        let Some(capture) = self.capture.as_mut() else {
            return TickOutcome::Skipped;
        };

        let capture_start = Instant::now();
        let mut frame = match capture.capture_frame() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!("No frame this tick: {}", PipelineError::Capture(format!("{err:#}")));
                return TickOutcome::Skipped;
            }
        };
        if frame.width() == 0 || frame.height() == 0 {
            tracing::warn!("{}", PipelineError::InvalidFrame("captured frame is empty".into()));
            return TickOutcome::Skipped;
        }
        imageops::flip_horizontal_in_place(&mut frame);
        self.stats.capture += capture_start.elapsed();

        let segment_start = Instant::now();
        let (output, outcome) = match self.process(&frame) {
            Ok(composited) => (composited, TickOutcome::Composited),
            Err(err) => {
                if err.is_fatal() {
                    tracing::error!("{}; showing camera frame", err);
                } else {
                    tracing::warn!("Background replacement failed, showing camera frame: {}", err);
                }
                (frame, TickOutcome::PassThrough)
            }
        };
        self.stats.segment += segment_start.elapsed();

        let output_start = Instant::now();
        self.record(&output);

        let fps = self.fps.tick_at(now);
        if let Err(err) = self.display.publish(&output, fps) {
            tracing::warn!("{}", PipelineError::Display(format!("{err:#}")));
        }
        self.stats.output += output_start.elapsed();

        self.record_stats(fps);
        outcome
    }

    /// Append `output` at the recording resolution. A failed write ends the recording.
    fn record(&mut self, output: &RgbImage) {
        let Some(recorder) = self.recorder.as_mut() else {
            return;
        };

        let (width, height) = (self.options.record_width, self.options.record_height);
        let sized;
        let frame = if output.dimensions() != (width, height) {
            sized = imageops::resize(output, width, height, imageops::FilterType::Triangle);
            &sized
        } else {
            output
        };

        if let Err(err) = recorder.write_frame(frame) {
            tracing::warn!("{}; recording stopped", err);
            self.stop_recording();
        }
    }

    /// Preprocess, infer, threshold, and composite one mirrored frame.
    fn process(&mut self, frame: &RgbImage) -> PipelineResult<RgbImage> {
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| PipelineError::Inference("segmentation engine released".into()))?;

        let (width, height) = frame.dimensions();
        let tensor = self.preprocessor.preprocess(frame)?;
        let probabilities = engine.infer(tensor)?;
        let mask =
            MaskPostprocessor::postprocess(&probabilities, width, height, self.settings.threshold());
        let background = self.background.frame(height, width);

        let mut output = composite(frame, &mask, &background)?;
        self.caption.draw(&mut output, &self.settings.caption);
        Ok(output)
    }

    fn record_stats(&mut self, fps: f32) {
        self.stats.frames += 1;
        let frames = self.stats.frames;
        if frames % self.options.stats_every.max(1) != 0 {
            return;
        }

        let avg_ms = |total: Duration| total.as_secs_f64() * 1000.0 / frames as f64;
        tracing::info!(
            "Frame {}: capture={:.1}ms, segment={:.1}ms, output={:.1}ms, fps={:.1}",
            frames,
            avg_ms(self.stats.capture),
            avg_ms(self.stats.segment),
            avg_ms(self.stats.output),
            fps
        );
    }

    /// Tick on a fixed interval until a stop request arrives, then release everything.
    pub fn run(&mut self) {
        let interval = self.options.tick_interval;
        tracing::info!("Starting pipeline loop, tick every {:?}", interval);

        while !self.stop_requested {
            let tick_start = Instant::now();
            self.tick();

            // Slow ticks run back to back rather than overlapping.
            let elapsed = tick_start.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }

        self.release();
    }

    /// Release the recorder, camera, background, and inference session, in that order.
    ///
    /// Safe to call any number of times.
    pub fn release(&mut self) {
        self.stop_recording();
        if self.capture.take().is_some() {
            tracing::info!("Capture released");
        }
        self.carousel = None;
        self.background.release();
        if self.engine.take().is_some() {
            tracing::info!("Segmentation engine released");
        }
        self.fps.reset();
    }
}

#[cfg(test)]
impl<C: CaptureSource, D: DisplaySink> Pipeline<C, D> {
    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn background(&self) -> &BackgroundProvider {
        &self.background
    }

    pub fn fps(&self) -> f32 {
        self.fps.fps()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }
}

impl<C: CaptureSource, D: DisplaySink> Drop for Pipeline<C, D> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{self, ControlHandle};
    use crate::segmentation::{ProbabilityMap, Tensor, MODEL_HEIGHT, MODEL_WIDTH};
    use image::Rgb;
    use ndarray::Array2;
    use parking_lot::Mutex;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeCapture {
        frames: VecDeque<RgbImage>,
        size: (u32, u32),
    }

    impl FakeCapture {
        fn repeating(frame: RgbImage, count: usize) -> Self {
            let size = frame.dimensions();
            Self {
                frames: std::iter::repeat(frame).take(count).collect(),
                size,
            }
        }
    }

    impl FakeCapture {
        fn sequence(frames: Vec<RgbImage>) -> Self {
            let size = frames.first().map(|f| f.dimensions()).unwrap_or((0, 0));
            Self {
                frames: frames.into(),
                size,
            }
        }
    }

    impl CaptureSource for FakeCapture {
        fn capture_frame(&mut self) -> anyhow::Result<RgbImage> {
            self.frames
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("camera has no frame"))
        }

        fn resolution(&self) -> (u32, u32) {
            self.size
        }
    }

    struct FakeEngine {
        map: ProbabilityMap,
        fail: bool,
    }

    impl FakeEngine {
        /// Foreground on the left half of the model input.
        fn left_half() -> Self {
            let map = Array2::from_shape_fn((MODEL_HEIGHT, MODEL_WIDTH), |(_, x)| {
                if x < MODEL_WIDTH / 2 {
                    0.9
                } else {
                    0.1
                }
            });
            Self { map, fail: false }
        }

        fn uniform(p: f32) -> Self {
            Self {
                map: Array2::from_elem((MODEL_HEIGHT, MODEL_WIDTH), p),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                map: Array2::zeros((MODEL_HEIGHT, MODEL_WIDTH)),
                fail: true,
            }
        }
    }

    impl SegmentationEngine for FakeEngine {
        fn infer(&mut self, tensor: Tensor) -> PipelineResult<ProbabilityMap> {
            if self.fail {
                return Err(PipelineError::Inference("engine fault".into()));
            }
            assert_eq!(tensor.shape(), &[1, 3, MODEL_HEIGHT, MODEL_WIDTH]);
            Ok(self.map.clone())
        }
    }

    #[derive(Default)]
    struct CollectingDisplay {
        published: Vec<(RgbImage, f32)>,
    }

    impl DisplaySink for CollectingDisplay {
        fn publish(&mut self, frame: &RgbImage, fps: f32) -> anyhow::Result<()> {
            self.published.push((frame.clone(), fps));
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct RecorderLog {
        frames: Arc<Mutex<Vec<RgbImage>>>,
        closes: Arc<AtomicUsize>,
    }

    struct FakeRecorder {
        log: RecorderLog,
        /// Index of the write that fails.
        fail_on: Option<usize>,
    }

    impl RecordingSink for FakeRecorder {
        fn write_frame(&mut self, frame: &RgbImage) -> PipelineResult<()> {
            let mut frames = self.log.frames.lock();
            if self.fail_on == Some(frames.len()) {
                return Err(PipelineError::Recording("disk full".into()));
            }
            frames.push(frame.clone());
            Ok(())
        }

        fn close(&mut self) {
            self.log.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    type TestPipeline = Pipeline<FakeCapture, CollectingDisplay>;

    fn pipeline(engine: FakeEngine) -> (TestPipeline, ControlHandle) {
        pipeline_with(engine, PipelineOptions::default())
    }

    fn pipeline_with(engine: FakeEngine, options: PipelineOptions) -> (TestPipeline, ControlHandle) {
        let (handle, inbox) = control::channel(Settings::default());
        let pipeline = Pipeline::new(
            Box::new(engine),
            CollectingDisplay::default(),
            CaptionRenderer::without_font(),
            Settings::default(),
            inbox,
            options,
        );
        (pipeline, handle)
    }

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(rgb))
    }

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 251) as u8, (y % 241) as u8, ((x + y) % 239) as u8])
        })
    }

    fn save(image: &RgbImage, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        image.save(&path).unwrap();
        path
    }

    #[test]
    fn end_to_end_full_hd_with_static_background() {
        let dir = tempfile::tempdir().unwrap();
        let background = RgbImage::from_fn(800, 600, |x, y| Rgb([200, (x % 256) as u8, (y % 256) as u8]));
        let bg_path = save(&background, dir.path(), "背景.png");

        let (mut pipeline, _handle) = pipeline(FakeEngine::left_half());
        pipeline.set_background(&bg_path, BackgroundKind::Image).unwrap();

        let captured = gradient(1920, 1080);
        pipeline.start_capture(FakeCapture::repeating(captured.clone(), 1));
        assert_eq!(pipeline.tick(), TickOutcome::Composited);

        let (output, _fps) = &pipeline.display().published[0];
        assert_eq!(output.dimensions(), (1920, 1080));

        let mirrored = imageops::flip_horizontal(&captured);
        let mask = MaskPostprocessor::postprocess(&FakeEngine::left_half().map, 1920, 1080, 0.5);
        let expected_bg = imageops::resize(&background, 1920, 1080, imageops::FilterType::Triangle);

        let mut foreground = 0;
        let mut replaced = 0;
        for (x, y, pixel) in output.enumerate_pixels() {
            if mask.get_pixel(x, y)[0] == 255 {
                assert_eq!(pixel, mirrored.get_pixel(x, y), "foreground at {x},{y}");
                foreground += 1;
            } else {
                assert_eq!(pixel, expected_bg.get_pixel(x, y), "background at {x},{y}");
                replaced += 1;
            }
        }
        assert!(foreground > 0 && replaced > 0);
    }

    #[test]
    fn inference_failure_publishes_unmodified_frame() {
        let (mut pipeline, _handle) = pipeline(FakeEngine::failing());
        let captured = gradient(64, 48);
        pipeline.start_capture(FakeCapture::repeating(captured.clone(), 1));

        assert_eq!(pipeline.tick(), TickOutcome::PassThrough);
        let (output, _) = &pipeline.display().published[0];
        assert_eq!(output, &imageops::flip_horizontal(&captured));
    }

    #[test]
    fn missing_or_empty_frames_skip_the_tick() {
        let (mut pipeline, _handle) = pipeline(FakeEngine::uniform(0.9));
        assert_eq!(pipeline.tick(), TickOutcome::Skipped);

        pipeline.start_capture(FakeCapture::repeating(RgbImage::new(0, 0), 1));
        assert_eq!(pipeline.tick(), TickOutcome::Skipped);
        assert_eq!(pipeline.tick(), TickOutcome::Skipped);
        assert!(pipeline.display().published.is_empty());
        assert_eq!(pipeline.fps(), 0.0);
    }

    #[test]
    fn unset_background_is_black() {
        let (mut pipeline, _handle) = pipeline(FakeEngine::uniform(0.1));
        pipeline.start_capture(FakeCapture::repeating(gradient(40, 30), 1));
        assert_eq!(pipeline.tick(), TickOutcome::Composited);
        let (output, _) = &pipeline.display().published[0];
        assert!(output.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn settings_change_only_at_tick_boundary() {
        let (mut pipeline, handle) = pipeline(FakeEngine::uniform(0.9));
        let dir = tempfile::tempdir().unwrap();
        let bg = save(&RgbImage::from_pixel(8, 8, Rgb([0, 0, 255])), dir.path(), "blue.png");
        pipeline.set_background(&bg, BackgroundKind::Image).unwrap();
        pipeline.start_capture(FakeCapture::repeating(RgbImage::from_pixel(20, 10, Rgb([255, 0, 0])), 2));

        handle.set_threshold(1.0);
        assert_eq!(pipeline.settings().threshold(), 0.5);

        pipeline.tick();
        assert_eq!(pipeline.settings().threshold(), 1.0);
        // Nothing exceeds a threshold of 1.0, so everything is background.
        let (output, _) = &pipeline.display().published[0];
        assert!(output.pixels().all(|p| p.0 == [0, 0, 255]));

        handle.set_threshold(0.5);
        pipeline.tick();
        let (output, _) = &pipeline.display().published[1];
        assert!(output.pixels().all(|p| p.0 == [255, 0, 0]));
    }

    #[test]
    fn background_requests_report_outcome_and_keep_previous_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let good = save(&RgbImage::from_pixel(4, 4, Rgb([0, 255, 0])), dir.path(), "good.png");
        let bad = dir.path().join("missing.png");

        let (mut pipeline, handle) = pipeline(FakeEngine::uniform(0.1));
        pipeline.start_capture(FakeCapture::repeating(gradient(16, 16), 2));

        let ok = handle.set_background(good, BackgroundKind::Image);
        pipeline.tick();
        assert!(ok.try_recv().unwrap().is_ok());

        let failed = handle.set_background(bad, BackgroundKind::Image);
        pipeline.tick();
        assert!(matches!(
            failed.try_recv().unwrap(),
            Err(PipelineError::BackgroundLoad { .. })
        ));

        let (output, _) = &pipeline.display().published[1];
        assert!(output.pixels().all(|p| p.0 == [0, 255, 0]));
    }

    #[test]
    fn carousel_rotates_backgrounds_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let red = save(&RgbImage::from_pixel(4, 4, Rgb([255, 0, 0])), dir.path(), "1.png");
        let blue = save(&RgbImage::from_pixel(4, 4, Rgb([0, 0, 255])), dir.path(), "2.png");

        let (mut pipeline, handle) = pipeline(FakeEngine::uniform(0.1));
        pipeline.start_capture(FakeCapture::repeating(gradient(8, 8), 3));
        handle.start_carousel(vec![red, blue], Duration::from_secs(5));

        let t0 = Instant::now();
        pipeline.tick_at(t0);
        pipeline.tick_at(t0 + Duration::from_secs(1));
        pipeline.tick_at(t0 + Duration::from_secs(5));

        let colors: Vec<[u8; 3]> = pipeline
            .display()
            .published
            .iter()
            .map(|(frame, _)| frame.get_pixel(0, 0).0)
            .collect();
        assert_eq!(colors, vec![[255, 0, 0], [255, 0, 0], [0, 0, 255]]);
    }

    #[test]
    fn fps_resets_when_capture_restarts() {
        let (mut pipeline, _handle) = pipeline(FakeEngine::uniform(0.5));
        pipeline.start_capture(FakeCapture::repeating(gradient(8, 8), 5));
        let t0 = Instant::now();
        for i in 0..5u64 {
            pipeline.tick_at(t0 + Duration::from_millis(i * 100));
        }
        assert!(pipeline.fps() > 1.0);

        pipeline.stop_capture();
        assert_eq!(pipeline.fps(), 0.0);
        pipeline.start_capture(FakeCapture::repeating(gradient(8, 8), 1));
        assert_eq!(pipeline.fps(), 0.0);
    }

    #[test]
    fn recording_requires_running_camera() {
        let (mut pipeline, _handle) = pipeline(FakeEngine::uniform(0.5));
        let err = pipeline.start_recording(PathBuf::from("out.mp4")).unwrap_err();
        assert!(matches!(err, PipelineError::Recording(_)));
        assert!(!pipeline.is_recording());
    }

    #[test]
    fn recorded_frames_arrive_in_order_at_recording_size() {
        let options = PipelineOptions {
            record_width: 32,
            record_height: 24,
            ..PipelineOptions::default()
        };
        let (mut pipeline, _handle) = pipeline_with(FakeEngine::failing(), options);
        let colors = [[255, 0, 0], [0, 255, 0], [0, 0, 255]];
        pipeline.start_capture(FakeCapture::sequence(
            colors.iter().map(|&c| solid(64, 48, c)).collect(),
        ));

        let log = RecorderLog::default();
        pipeline
            .attach_recorder(Box::new(FakeRecorder {
                log: log.clone(),
                fail_on: None,
            }))
            .unwrap();
        for _ in 0..3 {
            pipeline.tick();
        }

        let frames = log.frames.lock();
        assert_eq!(frames.len(), 3);
        for (frame, color) in frames.iter().zip(colors) {
            assert_eq!(frame.dimensions(), (32, 24));
            assert!(frame.pixels().all(|p| p.0 == color));
        }
        assert!(pipeline.is_recording());
        // The display still gets the full-size frame.
        assert_eq!(pipeline.display().published[0].0.dimensions(), (64, 48));
    }

    #[test]
    fn write_error_stops_recording_and_tick_still_publishes() {
        let (mut pipeline, _handle) = pipeline(FakeEngine::uniform(0.9));
        pipeline.start_capture(FakeCapture::repeating(gradient(16, 8), 3));

        let log = RecorderLog::default();
        pipeline
            .attach_recorder(Box::new(FakeRecorder {
                log: log.clone(),
                fail_on: Some(1),
            }))
            .unwrap();

        assert_eq!(pipeline.tick(), TickOutcome::Composited);
        assert!(pipeline.is_recording());

        assert_eq!(pipeline.tick(), TickOutcome::Composited);
        assert!(!pipeline.is_recording());
        assert_eq!(log.closes.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.display().published.len(), 2);

        pipeline.tick();
        assert_eq!(log.frames.lock().len(), 1);
        assert_eq!(pipeline.display().published.len(), 3);
    }

    #[test]
    fn unwritable_recording_path_does_not_start_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (mut pipeline, _handle) = pipeline(FakeEngine::uniform(0.5));
        pipeline.start_capture(FakeCapture::repeating(gradient(8, 8), 1));

        let err = pipeline
            .start_recording(dir.path().to_path_buf())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Recording(_)));
        assert!(!pipeline.is_recording());
    }

    #[test]
    fn camera_requests_stop_and_reopen_capture_with_fresh_fps() {
        let (mut pipeline, handle) = pipeline(FakeEngine::uniform(0.5));
        let opened = Rc::new(RefCell::new(Vec::new()));
        let log = opened.clone();
        pipeline.set_capture_opener(move |index| {
            log.borrow_mut().push(index);
            Ok(FakeCapture::repeating(gradient(8, 8), 10))
        });
        pipeline.open_capture(2).unwrap();

        let t0 = Instant::now();
        for i in 0..3u64 {
            let outcome = pipeline.tick_at(t0 + Duration::from_millis(i * 100));
            assert_eq!(outcome, TickOutcome::Composited);
        }
        assert!((pipeline.fps() - 1.0).abs() < 1e-6);

        handle.stop_camera();
        assert_eq!(pipeline.tick_at(t0 + Duration::from_millis(300)), TickOutcome::Skipped);
        assert!(!pipeline.is_capturing());
        assert_eq!(pipeline.fps(), 0.0);

        handle.start_camera(None);
        assert_eq!(pipeline.tick_at(t0 + Duration::from_millis(400)), TickOutcome::Composited);
        // Only the tick since the restart counts.
        assert!((pipeline.fps() - 1.0 / 3.0).abs() < 1e-6);

        handle.start_camera(Some(5));
        pipeline.tick_at(t0 + Duration::from_millis(500));
        assert_eq!(*opened.borrow(), vec![2, 2, 5]);
    }

    #[test]
    fn failed_camera_open_leaves_capture_stopped() {
        let (mut pipeline, _handle) = pipeline(FakeEngine::uniform(0.5));
        assert!(matches!(
            pipeline.open_capture(0),
            Err(PipelineError::Capture(_))
        ));

        pipeline.set_capture_opener(|index| anyhow::bail!("no device {index}"));
        assert!(matches!(
            pipeline.open_capture(1),
            Err(PipelineError::Capture(_))
        ));
        assert!(!pipeline.is_capturing());
        assert_eq!(pipeline.tick(), TickOutcome::Skipped);
    }

    #[test]
    fn stop_request_ends_run_and_release_is_idempotent() {
        let (mut pipeline, handle) = pipeline(FakeEngine::uniform(0.5));
        pipeline.start_capture(FakeCapture::repeating(gradient(8, 8), 10));
        handle.stop();

        pipeline.run();
        assert!(pipeline.stop_requested());
        assert_eq!(pipeline.tick(), TickOutcome::Skipped);

        pipeline.release();
        pipeline.release();
        assert_eq!(pipeline.background().source().name(), "unset");
    }
}
