// ============================================================================
// COLOR MODEL — canonical unit RGBA plus hex / 0-255 RGB / HSL encodings
// ============================================================================
//
// Every encoding converts to and from the canonical `Color` only, so adding a
// model costs one `ColorModel` impl instead of a converter per pair.

use image::Rgba;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Canonical color: straight (non-premultiplied) RGBA, every channel in [0, 1].
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

#[inline(always)]
fn unit(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

impl Color {
    pub const TRANSPARENT: Color = Color { r: 0.0, g: 0.0, b: 0.0, a: 0.0 };
    pub const BLACK: Color = Color { r: 0.0, g: 0.0, b: 0.0, a: 1.0 };
    pub const WHITE: Color = Color { r: 1.0, g: 1.0, b: 1.0, a: 1.0 };
    pub const RED: Color = Color { r: 1.0, g: 0.0, b: 0.0, a: 1.0 };
    pub const GREEN: Color = Color { r: 0.0, g: 1.0, b: 0.0, a: 1.0 };
    pub const BLUE: Color = Color { r: 0.0, g: 0.0, b: 1.0, a: 1.0 };

    /// Build a color, clamping every channel into [0, 1].
    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r: unit(r), g: unit(g), b: unit(b), a: unit(a) }
    }

    pub fn rgb(r: f32, g: f32, b: f32) -> Self {
        Self::new(r, g, b, 1.0)
    }

    pub fn clamped(self) -> Self {
        Self::new(self.r, self.g, self.b, self.a)
    }

    pub fn with_alpha(self, a: f32) -> Self {
        Self { a: unit(a), ..self }
    }

    pub fn is_transparent(&self) -> bool {
        self.a <= 0.0
    }

    pub fn from_rgba8(p: [u8; 4]) -> Self {
        Self {
            r: p[0] as f32 / 255.0,
            g: p[1] as f32 / 255.0,
            b: p[2] as f32 / 255.0,
            a: p[3] as f32 / 255.0,
        }
    }

    pub fn to_rgba8(&self) -> [u8; 4] {
        [byte(self.r), byte(self.g), byte(self.b), byte(self.a)]
    }

    /// True when both colors encode to the same 8-bit quad.
    pub fn same_rgba8(&self, other: &Color) -> bool {
        self.to_rgba8() == other.to_rgba8()
    }

    /// Parse `#RGB`, `#RGBA`, `#RRGGBB` or `#RRGGBBAA` (alpha trailing).
    pub fn from_hex(s: &str) -> Result<Self> {
        HexColor::new(s).to_canonical()
    }

    /// Parse a hex string, falling back to transparent black when it is
    /// clearly invalid.
    pub fn from_hex_or_default(s: &str) -> Self {
        Self::from_hex(s).unwrap_or(Color::TRANSPARENT)
    }

    /// `RRGGBBAA`, uppercase, no `#`.
    pub fn to_hex(&self) -> String {
        HexColor::from_canonical(*self, true, 0).digits
    }

    pub fn lerp(self, other: Color, t: f32) -> Color {
        let t = unit(t);
        let inv = 1.0 - t;
        Color::new(
            self.r * inv + other.r * t,
            self.g * inv + other.g * t,
            self.b * inv + other.b * t,
            self.a * inv + other.a * t,
        )
    }

    /// Maximum per-channel difference in unit space, in [0, 1].
    /// Two fully transparent colors are identical regardless of their RGB.
    pub fn distance(&self, other: &Color) -> f32 {
        if self.a <= 0.0 && other.a <= 0.0 {
            return 0.0;
        }
        if self.a <= 0.0 || other.a <= 0.0 {
            return (self.a - other.a).abs();
        }
        let r = (self.r - other.r).abs();
        let g = (self.g - other.g).abs();
        let b = (self.b - other.b).abs();
        let a = (self.a - other.a).abs();
        r.max(g).max(b).max(a)
    }

    pub fn approx_eq(&self, other: &Color, eps: f32) -> bool {
        (self.r - other.r).abs() <= eps
            && (self.g - other.g).abs() <= eps
            && (self.b - other.b).abs() <= eps
            && (self.a - other.a).abs() <= eps
    }
}

#[inline(always)]
fn byte(v: f32) -> u8 {
    (unit(v) * 255.0).round() as u8
}

impl From<Rgba<u8>> for Color {
    fn from(p: Rgba<u8>) -> Self {
        Color::from_rgba8(p.0)
    }
}

impl From<Color> for Rgba<u8> {
    fn from(c: Color) -> Self {
        Rgba(c.to_rgba8())
    }
}

impl From<Rgba<f32>> for Color {
    fn from(p: Rgba<f32>) -> Self {
        Color { r: p.0[0], g: p.0[1], b: p.0[2], a: p.0[3] }
    }
}

impl From<Color> for Rgba<f32> {
    fn from(c: Color) -> Self {
        Rgba([c.r, c.g, c.b, c.a])
    }
}

// -- Hub-and-spoke conversion --------------------------------------------------

/// A color encoding that converts through the canonical [`Color`].
pub trait ColorModel: Sized {
    fn to_canonical(&self) -> Result<Color>;

    /// Encode a canonical color.  With `round` set, components are rounded to
    /// `decimals` places; either way they are clamped to the model's range.
    fn from_canonical(color: Color, round: bool, decimals: u32) -> Self;
}

/// Convert between any two models via the canonical form.
pub fn convert<A: ColorModel, B: ColorModel>(value: &A, round: bool, decimals: u32) -> Result<B> {
    Ok(B::from_canonical(value.to_canonical()?, round, decimals))
}

/// Round `v` to `decimals` decimal places.
pub fn round_to(v: f32, decimals: u32) -> f32 {
    let f = 10f32.powi(decimals.min(7) as i32);
    (v * f).round() / f
}

impl ColorModel for Color {
    fn to_canonical(&self) -> Result<Color> {
        Ok(self.clamped())
    }

    fn from_canonical(color: Color, round: bool, decimals: u32) -> Self {
        let c = color.clamped();
        if round {
            Color::new(
                round_to(c.r, decimals),
                round_to(c.g, decimals),
                round_to(c.b, decimals),
                round_to(c.a, decimals),
            )
        } else {
            c
        }
    }
}

/// Where the alpha byte sits in a 4- or 8-digit hex string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AlphaPosition {
    Leading,
    #[default]
    Trailing,
}

/// Byte-hex encoding such as `#FF8800`, `F80`, `80FF8800`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HexColor {
    pub digits: String,
    pub alpha: AlphaPosition,
}

impl HexColor {
    pub fn new(s: &str) -> Self {
        Self { digits: s.to_string(), alpha: AlphaPosition::Trailing }
    }

    pub fn with_alpha_position(s: &str, alpha: AlphaPosition) -> Self {
        Self { digits: s.to_string(), alpha }
    }

    fn channel_bytes(&self) -> Result<[u8; 4]> {
        let s = self.digits.trim();
        let s = s.strip_prefix('#').unwrap_or(s);
        if let Some(bad) = s.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(EngineError::format(format!(
                "'{}' contains non-hex character '{}'",
                self.digits, bad
            )));
        }
        let nibble = |c: u8| -> u8 {
            match c {
                b'0'..=b'9' => c - b'0',
                b'a'..=b'f' => c - b'a' + 10,
                _ => c - b'A' + 10,
            }
        };
        let raw = s.as_bytes();
        let expanded: Vec<u8> = match raw.len() {
            3 | 4 => raw.iter().map(|&c| nibble(c) * 17).collect(),
            6 | 8 => raw
                .chunks(2)
                .map(|pair| nibble(pair[0]) * 16 + nibble(pair[1]))
                .collect(),
            n => {
                return Err(EngineError::format(format!(
                    "'{}' has {} hex digits, expected 3, 4, 6 or 8",
                    self.digits, n
                )));
            }
        };
        Ok(match (expanded.len(), self.alpha) {
            (3, _) => [expanded[0], expanded[1], expanded[2], 255],
            (_, AlphaPosition::Trailing) => [expanded[0], expanded[1], expanded[2], expanded[3]],
            (_, AlphaPosition::Leading) => [expanded[1], expanded[2], expanded[3], expanded[0]],
        })
    }
}

impl ColorModel for HexColor {
    fn to_canonical(&self) -> Result<Color> {
        Ok(Color::from_rgba8(self.channel_bytes()?))
    }

    /// Hex is always byte-quantised; `round`/`decimals` do not apply.
    fn from_canonical(color: Color, _round: bool, _decimals: u32) -> Self {
        let [r, g, b, a] = color.to_rgba8();
        Self {
            digits: format!("{:02X}{:02X}{:02X}{:02X}", r, g, b, a),
            alpha: AlphaPosition::Trailing,
        }
    }
}

/// Floating RGB in 0–255 with unit alpha.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rgb255 {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl ColorModel for Rgb255 {
    fn to_canonical(&self) -> Result<Color> {
        Ok(Color::new(self.r / 255.0, self.g / 255.0, self.b / 255.0, self.a))
    }

    fn from_canonical(color: Color, round: bool, decimals: u32) -> Self {
        let c = color.clamped();
        let ch = |v: f32| {
            let v = (v * 255.0).clamp(0.0, 255.0);
            if round { round_to(v, decimals) } else { v }
        };
        Self {
            r: ch(c.r),
            g: ch(c.g),
            b: ch(c.b),
            a: if round { round_to(c.a, decimals) } else { c.a },
        }
    }
}

/// HSL with hue in degrees [0, 360), saturation/lightness in percent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hsl {
    pub h: f32,
    pub s: f32,
    pub l: f32,
    pub a: f32,
}

impl ColorModel for Hsl {
    fn to_canonical(&self) -> Result<Color> {
        let h = (self.h / 360.0).rem_euclid(1.0);
        let (r, g, b) = hsl_to_rgb(h, unit(self.s / 100.0), unit(self.l / 100.0));
        Ok(Color::new(r, g, b, self.a))
    }

    fn from_canonical(color: Color, round: bool, decimals: u32) -> Self {
        let c = color.clamped();
        let (h, s, l) = rgb_to_hsl(c.r, c.g, c.b);
        let out = Self { h: h * 360.0, s: s * 100.0, l: l * 100.0, a: c.a };
        if round {
            Self {
                h: round_to(out.h, decimals),
                s: round_to(out.s, decimals),
                l: round_to(out.l, decimals),
                a: round_to(out.a, decimals),
            }
        } else {
            out
        }
    }
}

// -- Colour-space helpers (unit ranges) ---------------------------------------

/// RGB → (hue, saturation, lightness), all in [0, 1].
pub(crate) fn rgb_to_hsl(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) * 0.5;

    if (max - min).abs() < f32::EPSILON {
        return (0.0, 0.0, l);
    }

    let d = max - min;
    let s = if l > 0.5 { d / (2.0 - max - min) } else { d / (max + min) };
    let h = if max == r {
        ((g - b) / d + if g < b { 6.0 } else { 0.0 }) / 6.0
    } else if max == g {
        ((b - r) / d + 2.0) / 6.0
    } else {
        ((r - g) / d + 4.0) / 6.0
    };
    (h, s, l)
}

fn hue_to_rgb(p: f32, q: f32, t: f32) -> f32 {
    let t = t.rem_euclid(1.0);
    if t < 1.0 / 6.0 {
        p + (q - p) * 6.0 * t
    } else if t < 0.5 {
        q
    } else if t < 2.0 / 3.0 {
        p + (q - p) * (2.0 / 3.0 - t) * 6.0
    } else {
        p
    }
}

pub(crate) fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s <= 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn hex_shorthand_and_full_forms() {
        let c = Color::from_hex("#F80").unwrap();
        assert_eq!(c.to_rgba8(), [255, 136, 0, 255]);

        let c = Color::from_hex("ff880080").unwrap();
        assert_eq!(c.to_rgba8(), [255, 136, 0, 128]);

        let lead = HexColor::with_alpha_position("80FF8800", AlphaPosition::Leading);
        assert_eq!(lead.to_canonical().unwrap().to_rgba8(), [255, 136, 0, 128]);
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert!(matches!(Color::from_hex("#GG0000"), Err(EngineError::Format(_))));
        assert!(matches!(Color::from_hex("12345"), Err(EngineError::Format(_))));
        assert_eq!(Color::from_hex_or_default("nope"), Color::TRANSPARENT);
    }

    #[test]
    fn hex_encoding_clamps_out_of_range_values() {
        let wild = Color { r: 1.7, g: -0.3, b: 0.5, a: 1.0 };
        assert_eq!(HexColor::from_canonical(wild, false, 0).digits, "FF0080FF");
    }

    #[test]
    fn rgb255_rounding_honours_decimals() {
        let c = Color::new(0.123456, 0.5, 1.0, 0.33333);
        let rounded = Rgb255::from_canonical(c, true, 1);
        assert_eq!(rounded.r, 31.5);
        assert_eq!(rounded.b, 255.0);
        assert_eq!(rounded.a, 0.3);
    }

    #[test]
    fn hsl_known_values() {
        let red = Hsl::from_canonical(Color::RED, true, 2);
        assert_eq!((red.h, red.s, red.l), (0.0, 100.0, 50.0));
        let back: Color = convert::<Hsl, Color>(&Hsl { h: 240.0, s: 100.0, l: 50.0, a: 1.0 }, false, 0).unwrap();
        assert!(back.approx_eq(&Color::BLUE, 1e-6));
    }

    #[test]
    fn distance_treats_transparent_as_equal() {
        let a = Color::new(1.0, 0.0, 0.0, 0.0);
        let b = Color::new(0.0, 1.0, 0.0, 0.0);
        assert_eq!(a.distance(&b), 0.0);
        assert!((Color::BLACK.distance(&Color::WHITE) - 1.0).abs() < 1e-6);
    }

    proptest! {
        #[test]
        fn round_trip_through_every_model(r in 0u8..=255, g in 0u8..=255, b in 0u8..=255, a in 0u8..=255) {
            let c = Color::from_rgba8([r, g, b, a]);
            let tol = 1.0 / 255.0 + 1e-6;

            let hex: HexColor = convert(&c, false, 0).unwrap();
            let back: Color = convert(&hex, false, 0).unwrap();
            prop_assert!(back.approx_eq(&c, tol));

            let rgb: Rgb255 = convert(&c, false, 0).unwrap();
            let back: Color = convert(&rgb, false, 0).unwrap();
            prop_assert!(back.approx_eq(&c, tol));

            let hsl: Hsl = convert(&c, false, 0).unwrap();
            let back: Color = convert(&hsl, false, 0).unwrap();
            prop_assert!(back.approx_eq(&c, tol));
            prop_assert_eq!(back.to_rgba8(), c.to_rgba8());
        }
    }
}
