mod background;
mod capture;
mod compositor;
mod config;
mod control;
mod error;
mod fps;
mod output;
mod pipeline;
mod segmentation;

use anyhow::{Context, Result};
use background::BackgroundKind;
use capture::WebcamCapture;
use clap::Parser;
use compositor::CaptionRenderer;
use config::{Caption, RgbColor, Settings};
use output::{DisplaySink, FourCc, HeadlessDisplay, V4L2Output};
use pipeline::{Pipeline, PipelineOptions};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    camera: u32,

    /// Capture resolution width
    #[arg(long, default_value_t = 960)]
    capture_width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = 560)]
    capture_height: u32,

    /// Path to the MODNet segmentation model (ONNX file)
    #[arg(long, default_value = "modnet.onnx")]
    model: PathBuf,

    /// Name of the model's input tensor
    #[arg(long, default_value = "input")]
    model_input: String,

    /// Name of the model's output tensor
    #[arg(long, default_value = "output")]
    model_output: String,

    /// Milliseconds between pipeline ticks
    #[arg(long, default_value_t = 33)]
    tick_ms: u64,

    /// Foreground probability threshold, in (0, 1]
    #[arg(short, long, default_value_t = config::DEFAULT_THRESHOLD)]
    threshold: f32,

    /// Caption text drawn on every frame
    #[arg(long, default_value = "")]
    caption: String,

    /// Caption anchor x
    #[arg(long, default_value_t = 10)]
    caption_x: i32,

    /// Caption anchor y
    #[arg(long, default_value_t = 10)]
    caption_y: i32,

    /// Caption font size in pixels
    #[arg(long, default_value_t = 40.0)]
    caption_size: f32,

    /// Caption color as #rrggbb or r,g,b
    #[arg(long, default_value_t = RgbColor::BLACK)]
    caption_color: RgbColor,

    /// Caption font (TTF/OTF/TTC). Defaults to a CJK-capable system font
    #[arg(long)]
    font: Option<PathBuf>,

    /// Background image. Several images start a carousel
    #[arg(short, long = "background")]
    backgrounds: Vec<PathBuf>,

    /// Looping background video, used instead of images
    #[arg(long, conflicts_with = "backgrounds")]
    background_video: Option<PathBuf>,

    /// Seconds between carousel switches (1-60)
    #[arg(long, default_value_t = 5)]
    carousel_secs: u64,

    /// Record composited frames to this file (.avi records XVID, others mp4v)
    #[arg(long)]
    record: Option<PathBuf>,

    /// Override the recording codec tag, e.g. MJPG
    #[arg(long)]
    record_codec: Option<FourCc>,

    /// Recording width
    #[arg(long, default_value_t = 960)]
    record_width: u32,

    /// Recording height
    #[arg(long, default_value_t = 560)]
    record_height: u32,

    /// Recording frame rate
    #[arg(long, default_value_t = 30)]
    record_fps: u32,

    /// Publish frames to this v4l2loopback device instead of running headless
    #[arg(short, long)]
    output_device: Option<PathBuf>,

    /// Output resolution width
    #[arg(long, default_value_t = 960)]
    output_width: u32,

    /// Output resolution height
    #[arg(long, default_value_t = 560)]
    output_height: u32,

    /// List capture devices and exit
    #[arg(long)]
    list_cameras: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    if args.list_cameras {
        for (index, name) in capture::list_cameras()? {
            println!("{index}: {name}");
        }
        return Ok(());
    }

    tracing::info!("bgswap starting");
    tracing::info!("Capture: {}x{}", args.capture_width, args.capture_height);
    tracing::info!("Tick interval: {} ms", args.tick_ms);

    // A model that cannot be loaded is fatal.
    tracing::info!("Loading segmentation model from {}", args.model.display());
    let engine =
        segmentation::create_default_model(&args.model, &args.model_input, &args.model_output)
            .context("Failed to load segmentation model")?;

    let display: Box<dyn DisplaySink> = match &args.output_device {
        Some(device) => Box::new(
            V4L2Output::new(device, args.output_width, args.output_height)
                .context("Failed to initialize v4l2loopback output")?,
        ),
        None => {
            tracing::info!("No output device, running headless");
            Box::new(HeadlessDisplay::new(30))
        }
    };

    let caption = Caption {
        text: args.caption.clone(),
        x: args.caption_x,
        y: args.caption_y,
        font_size: args.caption_size,
        color: args.caption_color,
    };
    let settings = Settings::new(args.threshold, caption);
    let (handle, inbox) = control::channel(settings.clone());

    let options = PipelineOptions {
        tick_interval: Duration::from_millis(args.tick_ms.max(1)),
        record_fps: args.record_fps,
        record_width: args.record_width,
        record_height: args.record_height,
        record_codec: args.record_codec,
        ..PipelineOptions::default()
    };

    let mut pipeline: Pipeline<WebcamCapture, Box<dyn DisplaySink>> = Pipeline::new(
        engine,
        display,
        CaptionRenderer::new(args.font.as_deref()),
        settings,
        inbox,
        options,
    );

    // Background failures are reported and leave the pipeline on black.
    if let Some(video) = &args.background_video {
        if let Err(err) = pipeline.set_background(video, BackgroundKind::Video) {
            tracing::warn!("{}", err);
        }
    } else if args.backgrounds.len() > 1 {
        pipeline.start_carousel(
            args.backgrounds.clone(),
            Duration::from_secs(args.carousel_secs),
            Instant::now(),
        );
    } else if let Some(image) = args.backgrounds.first() {
        if let Err(err) = pipeline.set_background(image, BackgroundKind::Image) {
            tracing::warn!("{}", err);
        }
    }

    let (capture_width, capture_height) = (args.capture_width, args.capture_height);
    pipeline.set_capture_opener(move |index| {
        WebcamCapture::new(index, capture_width, capture_height)
            .context("Failed to initialize webcam capture")
    });
    pipeline.open_capture(args.camera)?;

    if let Some(path) = args.record.clone() {
        if let Err(err) = pipeline.start_recording(path) {
            tracing::warn!("{}", err);
        }
    }

    let _control = control::spawn_stdin_reader(handle)?;
    tracing::info!("Type commands on stdin, `camera stop`/`camera start` to toggle, `quit` to stop");

    pipeline.run();
    tracing::info!("bgswap stopped");

    Ok(())
}
