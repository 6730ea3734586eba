use crate::config::Caption;
use crate::error::{PipelineError, PipelineResult};
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_text_mut;
use std::path::{Path, PathBuf};

/// Fonts with CJK coverage commonly installed on Linux, Windows, and macOS.
const SYSTEM_FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/opentype/noto/NotoSansCJK-Regular.ttc",
    "/usr/share/fonts/noto-cjk/NotoSansCJK-Regular.ttc",
    "/usr/share/fonts/google-noto-cjk/NotoSansCJK-Regular.ttc",
    "/usr/share/fonts/truetype/wqy/wqy-microhei.ttc",
    "/usr/share/fonts/truetype/droid/DroidSansFallbackFull.ttf",
    "C:\\Windows\\Fonts\\msyh.ttc",
    "/System/Library/Fonts/PingFang.ttc",
];

/// Merge foreground and background through a binary mask.
///
/// Every output byte is `(frame & mask) | (background & !mask)`, so a 255 mask
/// pixel keeps the camera pixel and a 0 mask pixel takes the background pixel.
/// There is no blending at the edges.
pub fn composite(
    frame: &RgbImage,
    mask: &RgbImage,
    background: &RgbImage,
) -> PipelineResult<RgbImage> {
    let _span = tracing::debug_span!("composite").entered();

    let dims = frame.dimensions();
    if mask.dimensions() != dims || background.dimensions() != dims {
        return Err(PipelineError::InvalidFrame(format!(
            "frame {:?}, mask {:?} and background {:?} differ in size",
            dims,
            mask.dimensions(),
            background.dimensions()
        )));
    }

    let pixels: Vec<u8> = frame
        .as_raw()
        .iter()
        .zip(mask.as_raw())
        .zip(background.as_raw())
        .map(|((&f, &m), &b)| (f & m) | (b & !m))
        .collect();

    RgbImage::from_raw(dims.0, dims.1, pixels)
        .ok_or_else(|| PipelineError::InvalidFrame("composited buffer has the wrong size".into()))
}

/// Draws captions with a font that covers Latin and CJK alike.
pub struct CaptionRenderer {
    font: Option<FontVec>,
    warned: bool,
}

impl CaptionRenderer {
    /// Load `font_path` if given, otherwise the first usable system font.
    ///
    /// A renderer without a font skips captions instead of failing.
    pub fn new(font_path: Option<&Path>) -> Self {
        let font = match font_path {
            Some(path) => match load_font(path) {
                Ok(font) => Some(font),
                Err(err) => {
                    tracing::warn!("Failed to load caption font {}: {}", path.display(), err);
                    None
                }
            },
            None => SYSTEM_FONT_CANDIDATES
                .iter()
                .map(PathBuf::from)
                .filter(|path| path.is_file())
                .find_map(|path| load_font(&path).ok()),
        };

        if font.is_none() {
            tracing::warn!("No caption font available, captions are disabled");
        }

        Self { font, warned: false }
    }

    pub fn without_font() -> Self {
        Self {
            font: None,
            warned: false,
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draw `caption` onto `image` if it has text.
    pub fn draw(&mut self, image: &mut RgbImage, caption: &Caption) {
        if !caption.is_visible() {
            return;
        }
        let Some(font) = &self.font else {
            if !self.warned {
                tracing::warn!("Caption {:?} not drawn: no font loaded", caption.text);
                self.warned = true;
            }
            return;
        };

        let color = Rgb([caption.color.r, caption.color.g, caption.color.b]);
        draw_text_mut(
            image,
            color,
            caption.x,
            caption.y,
            PxScale::from(caption.font_size),
            font,
            &caption.text,
        );
    }
}

fn load_font(path: &Path) -> Result<FontVec, String> {
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    // Index 0 works for both single fonts and .ttc collections.
    let font = FontVec::try_from_vec_and_index(bytes, 0).map_err(|e| e.to_string())?;
    tracing::info!("Loaded caption font {}", path.display());
    Ok(font)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RgbColor;

    fn checker(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            if (x / 3 + y / 2) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    #[test]
    fn mask_selects_frame_or_background_per_pixel() {
        let (w, h) = (37, 23);
        let frame = RgbImage::from_fn(w, h, |x, y| Rgb([x as u8, y as u8, (x * y) as u8]));
        let background = RgbImage::from_fn(w, h, |x, y| Rgb([200 - x as u8, 7, 100 + y as u8]));
        let mask = checker(w, h);

        let out = composite(&frame, &mask, &background).unwrap();
        for (x, y, pixel) in out.enumerate_pixels() {
            if mask.get_pixel(x, y)[0] == 255 {
                assert_eq!(pixel, frame.get_pixel(x, y));
            } else {
                assert_eq!(pixel, background.get_pixel(x, y));
            }
        }
    }

    #[test]
    fn all_foreground_and_all_background() {
        let frame = RgbImage::from_pixel(4, 4, Rgb([1, 2, 3]));
        let background = RgbImage::from_pixel(4, 4, Rgb([9, 8, 7]));

        let keep = composite(&frame, &RgbImage::from_pixel(4, 4, Rgb([255; 3])), &background).unwrap();
        assert_eq!(keep, frame);

        let replace = composite(&frame, &RgbImage::new(4, 4), &background).unwrap();
        assert_eq!(replace, background);
    }

    #[test]
    fn mismatched_sizes_are_rejected() {
        let frame = RgbImage::new(4, 4);
        assert!(composite(&frame, &RgbImage::new(4, 3), &RgbImage::new(4, 4)).is_err());
        assert!(composite(&frame, &RgbImage::new(4, 4), &RgbImage::new(5, 4)).is_err());
    }

    #[test]
    fn empty_caption_leaves_image_untouched() {
        let mut renderer = CaptionRenderer::new(None);
        let mut image = RgbImage::from_pixel(50, 20, Rgb([5, 5, 5]));
        let before = image.clone();
        renderer.draw(&mut image, &Caption::default());
        assert_eq!(image, before);
    }

    #[test]
    fn missing_font_disables_captions_without_failing() {
        let mut renderer = CaptionRenderer::new(Some(Path::new("no/such/font.ttf")));
        assert!(!renderer.has_font());

        let mut image = RgbImage::new(50, 20);
        let caption = Caption {
            text: "Hello 你好".into(),
            color: RgbColor::new(255, 0, 0),
            ..Caption::default()
        };
        renderer.draw(&mut image, &caption);
        assert!(image.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn latin_and_cjk_captions_draw_with_system_font() {
        let mut renderer = CaptionRenderer::new(None);
        if !renderer.has_font() {
            return;
        }
        for text in ["Oath", "宣誓"] {
            let mut image = RgbImage::new(200, 80);
            let caption = Caption {
                text: text.into(),
                x: 5,
                y: 5,
                font_size: 40.0,
                color: RgbColor::new(255, 255, 255),
            };
            renderer.draw(&mut image, &caption);
            assert!(image.pixels().any(|p| p.0 != [0, 0, 0]), "{text} drew nothing");
        }
    }
}
