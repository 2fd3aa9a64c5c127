// ============================================================================
// BLEND CORE — separable / non-separable modes + Porter-Duff source-over
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::color::Color;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    ColorDodge,
    ColorBurn,
    HardLight,
    SoftLight,
    Difference,
    Exclusion,
    Additive,
    Subtract,
    Divide,
    LinearBurn,
    LinearLight,
    VividLight,
    PinLight,
    HardMix,
    Negation,
    Reflect,
    Glow,
    Hue,
    Saturation,
    Color,
    Luminosity,
}

/// Per-channel mix function: `(backdrop, source) -> mixed`.
pub type SeparableFn = fn(f32, f32) -> f32;
/// Whole-RGB mix function: `(backdrop, source) -> mixed`.
pub type NonSeparableFn = fn([f32; 3], [f32; 3]) -> [f32; 3];

/// How a mode mixes the color channels before alpha composition.
#[derive(Clone, Copy)]
pub enum BlendKind {
    Separable(SeparableFn),
    NonSeparable(NonSeparableFn),
}

impl BlendMode {
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Multiply,
            BlendMode::Screen,
            BlendMode::Overlay,
            BlendMode::Darken,
            BlendMode::Lighten,
            BlendMode::ColorDodge,
            BlendMode::ColorBurn,
            BlendMode::HardLight,
            BlendMode::SoftLight,
            BlendMode::Difference,
            BlendMode::Exclusion,
            BlendMode::Additive,
            BlendMode::Subtract,
            BlendMode::Divide,
            BlendMode::LinearBurn,
            BlendMode::LinearLight,
            BlendMode::VividLight,
            BlendMode::PinLight,
            BlendMode::HardMix,
            BlendMode::Negation,
            BlendMode::Reflect,
            BlendMode::Glow,
            BlendMode::Hue,
            BlendMode::Saturation,
            BlendMode::Color,
            BlendMode::Luminosity,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "Normal",
            BlendMode::Multiply => "Multiply",
            BlendMode::Screen => "Screen",
            BlendMode::Overlay => "Overlay",
            BlendMode::Darken => "Darken",
            BlendMode::Lighten => "Lighten",
            BlendMode::ColorDodge => "Color Dodge",
            BlendMode::ColorBurn => "Color Burn",
            BlendMode::HardLight => "Hard Light",
            BlendMode::SoftLight => "Soft Light",
            BlendMode::Difference => "Difference",
            BlendMode::Exclusion => "Exclusion",
            BlendMode::Additive => "Additive",
            BlendMode::Subtract => "Subtract",
            BlendMode::Divide => "Divide",
            BlendMode::LinearBurn => "Linear Burn",
            BlendMode::LinearLight => "Linear Light",
            BlendMode::VividLight => "Vivid Light",
            BlendMode::PinLight => "Pin Light",
            BlendMode::HardMix => "Hard Mix",
            BlendMode::Negation => "Negation",
            BlendMode::Reflect => "Reflect",
            BlendMode::Glow => "Glow",
            BlendMode::Hue => "Hue",
            BlendMode::Saturation => "Saturation",
            BlendMode::Color => "Color",
            BlendMode::Luminosity => "Luminosity",
        }
    }

    /// Case-insensitive lookup by display name; spaces, dashes and
    /// underscores are ignored (`"color-dodge"`, `"ColorDodge"`).
    pub fn from_name(name: &str) -> Option<Self> {
        let key: String = name
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '_'))
            .flat_map(|c| c.to_lowercase())
            .collect();
        Self::all().iter().copied().find(|m| {
            m.name().replace(' ', "").to_lowercase() == key
        })
    }

    /// Stable index for compact serialization.
    pub fn to_u8(&self) -> u8 {
        Self::all().iter().position(|m| m == self).unwrap_or(0) as u8
    }

    /// Unknown values decode as `Normal`.
    pub fn from_u8(v: u8) -> Self {
        Self::all().get(v as usize).copied().unwrap_or_default()
    }

    pub fn kind(&self) -> BlendKind {
        use BlendKind::{NonSeparable, Separable};
        match self {
            BlendMode::Normal => Separable(normal),
            BlendMode::Multiply => Separable(multiply),
            BlendMode::Screen => Separable(screen),
            BlendMode::Overlay => Separable(overlay),
            BlendMode::Darken => Separable(f32::min),
            BlendMode::Lighten => Separable(f32::max),
            BlendMode::ColorDodge => Separable(color_dodge),
            BlendMode::ColorBurn => Separable(color_burn),
            BlendMode::HardLight => Separable(hard_light),
            BlendMode::SoftLight => Separable(soft_light),
            BlendMode::Difference => Separable(difference),
            BlendMode::Exclusion => Separable(exclusion),
            BlendMode::Additive => Separable(additive),
            BlendMode::Subtract => Separable(subtract),
            BlendMode::Divide => Separable(divide),
            BlendMode::LinearBurn => Separable(linear_burn),
            BlendMode::LinearLight => Separable(linear_light),
            BlendMode::VividLight => Separable(vivid_light),
            BlendMode::PinLight => Separable(pin_light),
            BlendMode::HardMix => Separable(hard_mix),
            BlendMode::Negation => Separable(negation),
            BlendMode::Reflect => Separable(reflect),
            BlendMode::Glow => Separable(glow),
            BlendMode::Hue => NonSeparable(hue),
            BlendMode::Saturation => NonSeparable(saturation),
            BlendMode::Color => NonSeparable(color),
            BlendMode::Luminosity => NonSeparable(luminosity),
        }
    }

    /// Mixed RGB of `source` over `backdrop`, before alpha composition.
    pub fn mix(&self, backdrop: [f32; 3], source: [f32; 3]) -> [f32; 3] {
        match self.kind() {
            BlendKind::Separable(f) => [
                f(backdrop[0], source[0]),
                f(backdrop[1], source[1]),
                f(backdrop[2], source[2]),
            ],
            BlendKind::NonSeparable(f) => f(backdrop, source),
        }
    }
}

/// Composite `source` over `backdrop` with `mode`; `opacity` scales the
/// source alpha.
pub fn blend(backdrop: Color, source: Color, mode: BlendMode, opacity: f32) -> Color {
    let a_s = source.a * opacity.clamp(0.0, 1.0);
    if a_s <= 0.0 {
        return backdrop;
    }
    if mode == BlendMode::Normal && a_s >= 1.0 {
        return source;
    }

    let a_b = backdrop.a;
    let r_a = a_s + a_b - a_s * a_b;
    if r_a <= 0.0 {
        return Color::TRANSPARENT;
    }

    let cb = [backdrop.r, backdrop.g, backdrop.b];
    let cs = [source.r, source.g, source.b];
    let mixed = mode.mix(cb, cs);

    let w_b = a_b * (1.0 - a_s);
    let w_m = a_b * a_s;
    let w_s = (1.0 - a_b) * a_s;
    let ch = |i: usize| (w_b * cb[i] + w_m * mixed[i] + w_s * cs[i]) / r_a;

    Color::new(ch(0), ch(1), ch(2), r_a)
}

// -- Separable channel functions (backdrop, source) ----------------------------

fn normal(_b: f32, s: f32) -> f32 {
    s
}

fn multiply(b: f32, s: f32) -> f32 {
    b * s
}

fn screen(b: f32, s: f32) -> f32 {
    b + s - b * s
}

fn hard_light(b: f32, s: f32) -> f32 {
    if s <= 0.5 {
        multiply(b, 2.0 * s)
    } else {
        screen(b, 2.0 * s - 1.0)
    }
}

fn overlay(b: f32, s: f32) -> f32 {
    hard_light(s, b)
}

fn color_dodge(b: f32, s: f32) -> f32 {
    if b <= 0.0 {
        0.0
    } else if s >= 1.0 {
        1.0
    } else {
        (b / (1.0 - s)).min(1.0)
    }
}

fn color_burn(b: f32, s: f32) -> f32 {
    if b >= 1.0 {
        1.0
    } else if s <= 0.0 {
        0.0
    } else {
        1.0 - ((1.0 - b) / s).min(1.0)
    }
}

fn soft_light(b: f32, s: f32) -> f32 {
    if s <= 0.5 {
        b - (1.0 - 2.0 * s) * b * (1.0 - b)
    } else {
        let d = if b <= 0.25 {
            ((16.0 * b - 12.0) * b + 4.0) * b
        } else {
            b.sqrt()
        };
        b + (2.0 * s - 1.0) * (d - b)
    }
}

fn difference(b: f32, s: f32) -> f32 {
    (b - s).abs()
}

fn exclusion(b: f32, s: f32) -> f32 {
    b + s - 2.0 * b * s
}

fn additive(b: f32, s: f32) -> f32 {
    (b + s).min(1.0)
}

fn subtract(b: f32, s: f32) -> f32 {
    (b - s).max(0.0)
}

fn divide(b: f32, s: f32) -> f32 {
    if s <= 0.0 { 1.0 } else { (b / s).min(1.0) }
}

fn linear_burn(b: f32, s: f32) -> f32 {
    (b + s - 1.0).max(0.0)
}

fn linear_light(b: f32, s: f32) -> f32 {
    (b + 2.0 * s - 1.0).clamp(0.0, 1.0)
}

fn vivid_light(b: f32, s: f32) -> f32 {
    if s <= 0.5 {
        let s2 = 2.0 * s;
        if s2 <= 0.0 { 0.0 } else { (1.0 - (1.0 - b) / s2).max(0.0) }
    } else {
        let s2 = 2.0 * (s - 0.5);
        if s2 >= 1.0 { 1.0 } else { (b / (1.0 - s2)).min(1.0) }
    }
}

fn pin_light(b: f32, s: f32) -> f32 {
    if s <= 0.5 { b.min(2.0 * s) } else { b.max(2.0 * (s - 0.5)) }
}

fn hard_mix(b: f32, s: f32) -> f32 {
    if b + s >= 1.0 { 1.0 } else { 0.0 }
}

fn negation(b: f32, s: f32) -> f32 {
    1.0 - (1.0 - b - s).abs()
}

fn reflect(b: f32, s: f32) -> f32 {
    if s >= 1.0 { 1.0 } else { (b * b / (1.0 - s)).min(1.0) }
}

fn glow(b: f32, s: f32) -> f32 {
    reflect(s, b)
}

// -- Non-separable helpers ------------------------------------------------------

fn lum(c: [f32; 3]) -> f32 {
    0.3 * c[0] + 0.59 * c[1] + 0.11 * c[2]
}

fn clip_color(c: [f32; 3]) -> [f32; 3] {
    let l = lum(c);
    let n = c[0].min(c[1]).min(c[2]);
    let x = c[0].max(c[1]).max(c[2]);
    let mut out = c;
    if n < 0.0 {
        let d = l - n;
        for v in &mut out {
            *v = if d > 0.0 { l + (*v - l) * l / d } else { l };
        }
    }
    if x > 1.0 {
        let d = x - l;
        for v in &mut out {
            *v = if d > 0.0 { l + (*v - l) * (1.0 - l) / d } else { l };
        }
    }
    out
}

fn set_lum(c: [f32; 3], l: f32) -> [f32; 3] {
    let d = l - lum(c);
    clip_color([c[0] + d, c[1] + d, c[2] + d])
}

fn sat(c: [f32; 3]) -> f32 {
    c[0].max(c[1]).max(c[2]) - c[0].min(c[1]).min(c[2])
}

fn set_sat(c: [f32; 3], s: f32) -> [f32; 3] {
    let mut idx = [0usize, 1, 2];
    idx.sort_by(|&a, &b| c[a].total_cmp(&c[b]));
    let (lo, mid, hi) = (idx[0], idx[1], idx[2]);

    let mut out = [0.0; 3];
    if c[hi] > c[lo] {
        out[mid] = (c[mid] - c[lo]) * s / (c[hi] - c[lo]);
        out[hi] = s;
    }
    out
}

fn hue(b: [f32; 3], s: [f32; 3]) -> [f32; 3] {
    set_lum(set_sat(s, sat(b)), lum(b))
}

fn saturation(b: [f32; 3], s: [f32; 3]) -> [f32; 3] {
    set_lum(set_sat(b, sat(s)), lum(b))
}

fn color(b: [f32; 3], s: [f32; 3]) -> [f32; 3] {
    set_lum(s, lum(b))
}

fn luminosity(b: [f32; 3], s: [f32; 3]) -> [f32; 3] {
    set_lum(b, lum(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-5;

    #[test]
    fn transparent_source_returns_backdrop_for_every_mode() {
        let backdrop = Color::new(0.2, 0.4, 0.6, 0.8);
        for &mode in BlendMode::all() {
            assert_eq!(blend(backdrop, Color::TRANSPARENT, mode, 1.0), backdrop, "{:?}", mode);
        }
    }

    #[test]
    fn opaque_normal_returns_source_exactly() {
        let src = Color::new(0.3, 0.1, 0.9, 1.0);
        assert_eq!(blend(Color::WHITE, src, BlendMode::Normal, 1.0), src);
        assert_eq!(blend(Color::TRANSPARENT, src, BlendMode::Normal, 1.0), src);
    }

    #[test]
    fn zero_opacity_is_identity() {
        let backdrop = Color::new(0.5, 0.5, 0.5, 1.0);
        assert_eq!(blend(backdrop, Color::RED, BlendMode::Multiply, 0.0), backdrop);
    }

    #[test]
    fn half_alpha_normal_over_opaque() {
        let out = blend(Color::BLACK, Color::WHITE.with_alpha(0.5), BlendMode::Normal, 1.0);
        assert!(out.approx_eq(&Color::new(0.5, 0.5, 0.5, 1.0), EPS));
    }

    #[test]
    fn source_over_transparent_backdrop_keeps_source_color() {
        // With ab = 0 the mixed term vanishes for every mode.
        let src = Color::new(0.2, 0.7, 0.4, 0.5);
        for &mode in BlendMode::all() {
            let out = blend(Color::TRANSPARENT, src, mode, 1.0);
            assert!(out.approx_eq(&src, EPS), "{:?}: {:?}", mode, out);
        }
    }

    #[test]
    fn multiply_and_screen_opaque() {
        let b = Color::rgb(0.5, 0.25, 1.0);
        let s = Color::rgb(0.5, 1.0, 0.0);
        let m = blend(b, s, BlendMode::Multiply, 1.0);
        assert!(m.approx_eq(&Color::rgb(0.25, 0.25, 0.0), EPS));
        let sc = blend(b, s, BlendMode::Screen, 1.0);
        assert!(sc.approx_eq(&Color::rgb(0.75, 1.0, 1.0), EPS));
    }

    #[test]
    fn luminosity_keeps_backdrop_hue() {
        let b = [1.0, 0.0, 0.0];
        let out = luminosity(b, [0.5, 0.5, 0.5]);
        assert!((lum(out) - 0.5).abs() < 1e-4);
        assert!(out[0] > out[1] && out[1] == out[2]);
    }

    #[test]
    fn color_mode_grey_source_is_grey() {
        let out = color([0.2, 0.6, 0.9], [0.4, 0.4, 0.4]);
        let l = lum([0.2, 0.6, 0.9]);
        for v in out {
            assert!((v - l).abs() < 1e-5);
        }
    }

    #[test]
    fn clip_color_stays_in_range() {
        for c in [[1.4, 0.2, -0.3], [-0.5, 0.1, 0.2], [2.0, 2.0, 0.9]] {
            for v in clip_color(c) {
                assert!((-1e-5..=1.0 + 1e-5).contains(&v), "{:?}", c);
            }
        }
    }

    #[test]
    fn names_round_trip() {
        for &mode in BlendMode::all() {
            assert_eq!(BlendMode::from_name(mode.name()), Some(mode));
            assert_eq!(BlendMode::from_u8(mode.to_u8()), mode);
        }
        assert_eq!(BlendMode::from_name("color-dodge"), Some(BlendMode::ColorDodge));
        assert_eq!(BlendMode::from_u8(250), BlendMode::Normal);
    }
}
