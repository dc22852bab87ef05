//! Color handling for full-color bulbs and light strips.
//!
//! Accepts named colors, `#RRGGBB` strings, and bare six-digit hex; all
//! resolve to (hue, saturation) pairs in the device's units (hue 0..360,
//! saturation 0..100).

use crate::error::TapoError;

/// Named colors resolvable anywhere a color is accepted.
const NAMED_COLORS: &[(&str, u16, u8)] = &[
    ("red", 0, 100),
    ("orange", 30, 100),
    ("yellow", 60, 100),
    ("green", 120, 100),
    ("cyan", 180, 100),
    ("blue", 240, 100),
    ("purple", 270, 100),
    ("magenta", 300, 100),
    ("pink", 330, 60),
    ("white", 0, 0),
    ("warm_white", 30, 20),
    ("cool_white", 210, 20),
];

/// Converts RGB (each 0..255) to device HSV: hue 0..360, saturation and
/// value 0..100, each rounded to the nearest integer.
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u16, u8, u8) {
    let rf = r as f64 / 255.0;
    let gf = g as f64 / 255.0;
    let bf = b as f64 / 255.0;
    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let diff = max - min;

    let hue = if diff == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (((gf - bf) / diff) % 6.0)
    } else if max == gf {
        60.0 * ((bf - rf) / diff + 2.0)
    } else {
        60.0 * ((rf - gf) / diff + 4.0)
    };
    let hue = if hue < 0.0 { hue + 360.0 } else { hue };

    let saturation = if max == 0.0 { 0.0 } else { diff / max };
    let value = max;

    (
        hue.round() as u16 % 360,
        (saturation * 100.0).round() as u8,
        (value * 100.0).round() as u8,
    )
}

fn parse_hex(input: &str) -> Option<(u8, u8, u8)> {
    let hex = input.strip_prefix('#').unwrap_or(input);
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some((r, g, b))
}

/// Resolves a color name or hex string to a (hue, saturation) pair.
pub fn resolve_color(input: &str) -> Result<(u16, u8), TapoError> {
    let trimmed = input.trim();
    let lower = trimmed.to_ascii_lowercase();
    if let Some((_, hue, saturation)) = NAMED_COLORS
        .iter()
        .find(|(name, _, _)| *name == lower.as_str())
    {
        return Ok((*hue, *saturation));
    }
    if let Some((r, g, b)) = parse_hex(trimmed) {
        let (hue, saturation, _) = rgb_to_hsv(r, g, b);
        return Ok((hue, saturation));
    }
    Err(TapoError::InvalidRequest(format!(
        "unrecognized color '{trimmed}'"
    )))
}
