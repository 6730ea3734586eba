//! Runtime-mutable pipeline settings.
//!
//! A `Settings` value is an immutable snapshot: the pipeline reads exactly one
//! per tick, and control surfaces replace it wholesale through
//! [`crate::control::ControlHandle`].

use std::fmt;
use std::str::FromStr;

/// Default segmentation threshold.
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Truecolor RGB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RgbColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl RgbColor {
    pub const BLACK: RgbColor = RgbColor { r: 0, g: 0, b: 0 };

    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl fmt::Display for RgbColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl FromStr for RgbColor {
    type Err = String;

    /// Accepts `#rrggbb`, `rrggbb`, or `r,g,b`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((r, rest)) = s.split_once(',') {
            let (g, b) = rest
                .split_once(',')
                .ok_or_else(|| format!("expected r,g,b but got {s:?}"))?;
            let channel = |v: &str| {
                v.trim()
                    .parse::<u8>()
                    .map_err(|_| format!("color channel {v:?} is not in 0-255"))
            };
            return Ok(RgbColor::new(channel(r)?, channel(g)?, channel(b)?));
        }

        let hex = s.strip_prefix('#').unwrap_or(s);
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(format!("expected #rrggbb but got {s:?}"));
        }
        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| format!("invalid hex color {s:?}"))
        };
        Ok(RgbColor::new(channel(0)?, channel(2)?, channel(4)?))
    }
}

/// Caption drawn on every composited frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Caption {
    pub text: String,
    pub x: i32,
    pub y: i32,
    pub font_size: f32,
    pub color: RgbColor,
}

impl Default for Caption {
    fn default() -> Self {
        Self {
            text: String::new(),
            x: 10,
            y: 10,
            font_size: 40.0,
            color: RgbColor::BLACK,
        }
    }
}

impl Caption {
    pub fn is_visible(&self) -> bool {
        !self.text.is_empty() && self.font_size > 0.0
    }
}

/// Everything a tick reads from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    threshold: f32,
    pub caption: Caption,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            caption: Caption::default(),
        }
    }
}

impl Settings {
    pub fn new(threshold: f32, caption: Caption) -> Self {
        let mut settings = Self {
            threshold: DEFAULT_THRESHOLD,
            caption,
        };
        settings.set_threshold(threshold);
        settings
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Clamp into (0, 1]. Non-finite values are ignored.
    pub fn set_threshold(&mut self, threshold: f32) {
        if !threshold.is_finite() {
            tracing::warn!("Ignoring non-finite threshold {}", threshold);
            return;
        }
        self.threshold = threshold.clamp(f32::EPSILON, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colors() {
        assert_eq!("#ff8000".parse::<RgbColor>().unwrap(), RgbColor::new(255, 128, 0));
        assert_eq!("00ff00".parse::<RgbColor>().unwrap(), RgbColor::new(0, 255, 0));
        assert_eq!("1, 2,3".parse::<RgbColor>().unwrap(), RgbColor::new(1, 2, 3));
        assert!("256,0,0".parse::<RgbColor>().is_err());
        assert!("#12345".parse::<RgbColor>().is_err());
        assert!("#gg0000".parse::<RgbColor>().is_err());
        assert!("红色".parse::<RgbColor>().is_err());
    }

    #[test]
    fn color_display_round_trips() {
        let color = RgbColor::new(18, 52, 86);
        assert_eq!(color.to_string(), "#123456");
        assert_eq!(color.to_string().parse::<RgbColor>().unwrap(), color);
    }

    #[test]
    fn threshold_is_clamped_into_unit_interval() {
        let mut settings = Settings::default();
        settings.set_threshold(1.7);
        assert_eq!(settings.threshold(), 1.0);
        settings.set_threshold(0.0);
        assert!(settings.threshold() > 0.0);
        settings.set_threshold(0.3);
        assert_eq!(settings.threshold(), 0.3);
        settings.set_threshold(f32::NAN);
        assert_eq!(settings.threshold(), 0.3);
    }

    #[test]
    fn empty_caption_is_hidden() {
        let mut caption = Caption::default();
        assert!(!caption.is_visible());
        caption.text = "宣誓 Oath".into();
        assert!(caption.is_visible());
    }
}
