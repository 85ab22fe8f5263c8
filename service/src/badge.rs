//! SVG badge rendering for the shield endpoints
//!
//! Shields-style badges with a label section and a value section. Glyph
//! widths use a fixed average advance instead of font metrics, which keeps
//! rendering dependency-free and deterministic; the output matches what
//! badge consumers (READMEs, camo proxies) expect closely enough.

use serde::Deserialize;

/// Average horizontal advance per character, scaled by font size
const CHAR_ADVANCE: f32 = 0.62;

/// Horizontal padding inside each section, in pixels
const SECTION_PADDING: f32 = 5.0;

const LABEL_COLOR: &str = "#555";
const DEFAULT_VALUE_COLOR: &str = "#007ec6";
const DEFAULT_FONT_SIZE: u32 = 11;

/// Badge style families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadgeStyle {
    /// Rounded corners, subtle vertical gradient
    Flat,
    /// Square corners, no gradient
    FlatSquare,
    /// Rounded corners, pronounced gradient
    Plastic,
}

impl BadgeStyle {
    /// Parse a style name; `-simple` variants drop the label section.
    /// Unknown names fall back to flat, as the original does.
    fn parse(style: &str) -> (Self, bool) {
        match style {
            "flat" => (Self::Flat, false),
            "flat-simple" => (Self::Flat, true),
            "flat-square" => (Self::FlatSquare, false),
            "flat-square-simple" => (Self::FlatSquare, true),
            "plastic" => (Self::Plastic, false),
            "plastic-simple" => (Self::Plastic, true),
            _ => (Self::Flat, false),
        }
    }

    fn corner_radius(self) -> u32 {
        match self {
            Self::FlatSquare => 0,
            Self::Flat => 3,
            Self::Plastic => 4,
        }
    }

    fn gradient(self) -> Option<&'static str> {
        match self {
            Self::FlatSquare => None,
            Self::Flat => Some(
                r##"<linearGradient id="s" x2="0" y2="100%"><stop offset="0" stop-color="#bbb" stop-opacity=".1"/><stop offset="1" stop-opacity=".1"/></linearGradient>"##,
            ),
            Self::Plastic => Some(
                r##"<linearGradient id="s" x2="0" y2="100%"><stop offset="0" stop-color="#fff" stop-opacity=".7"/><stop offset=".1" stop-color="#aaa" stop-opacity=".1"/><stop offset=".9" stop-color="#000" stop-opacity=".3"/><stop offset="1" stop-color="#000" stop-opacity=".5"/></linearGradient>"##,
            ),
        }
    }
}

/// Query parameters accepted by the shield endpoints
#[derive(Debug, Deserialize)]
pub struct BadgeQuery {
    /// Named background color for the value section
    pub bgcolor: Option<String>,
    /// Label text, default `counter`
    pub text: Option<String>,
    /// Style name, default `flat`
    pub style: Option<String>,
    /// Font size in pixels, default 11
    pub fontsize: Option<String>,
}

/// Render a badge for a counter value from the shield query parameters
pub fn render(query: &BadgeQuery, value: i64) -> String {
    let bg = named_color(query.bgcolor.as_deref().unwrap_or("blue"));
    let label = query.text.as_deref().unwrap_or("counter");
    let (style, simple) = BadgeStyle::parse(
        &query
            .style
            .as_deref()
            .unwrap_or("flat")
            .to_ascii_lowercase(),
    );
    let font_size = query
        .fontsize
        .as_deref()
        .and_then(|s| s.parse().ok())
        .filter(|&s| s > 0 && s <= 64)
        .unwrap_or(DEFAULT_FONT_SIZE);

    let value = value.to_string();
    if simple {
        render_sections(None, &value, bg, style, font_size)
    } else {
        render_sections(Some(label), &value, bg, style, font_size)
    }
}

/// Map a named color to its hex value; unknown names render black
fn named_color(name: &str) -> &'static str {
    match name.trim().to_ascii_lowercase().as_str() {
        "blue" => "#007ec6",
        "brightgreen" => "#4c1",
        "green" => "#97ca00",
        "grey" => "#555",
        "lightgrey" => "#9f9f9f",
        "orange" => "#fe7d37",
        "red" => "#e05d44",
        "yellow" => "#dfb317",
        "yellowgreen" => "#a4a61d",
        _ => "#000000",
    }
}

fn text_width(text: &str, font_size: u32) -> f32 {
    text.chars().count() as f32 * font_size as f32 * CHAR_ADVANCE + SECTION_PADDING * 2.0
}

fn render_sections(
    label: Option<&str>,
    value: &str,
    bg: &str,
    style: BadgeStyle,
    font_size: u32,
) -> String {
    let height = (font_size as f32 * 1.8).round() as u32;
    let label_width = label.map_or(0.0, |l| text_width(l, font_size)).round();
    let value_width = text_width(value, font_size).round();
    let total = label_width + value_width;
    let radius = style.corner_radius();
    let gradient = style.gradient().unwrap_or("");
    let overlay = if style.gradient().is_some() {
        format!(r##"<rect width="{total}" height="{height}" fill="url(#s)" rx="{radius}"/>"##)
    } else {
        String::new()
    };

    let baseline = (height as f32 * 0.7).round() as u32;
    let mut body = String::new();
    if let Some(label) = label {
        body.push_str(&format!(
            r##"<rect width="{label_width}" height="{height}" fill="{LABEL_COLOR}"/><text x="{x}" y="{baseline}" fill="#fff" font-family="Verdana,Geneva,sans-serif" font-size="{font_size}" text-anchor="middle">{label}</text>"##,
            x = label_width / 2.0,
            label = escape(label),
        ));
    }
    body.push_str(&format!(
        r##"<rect x="{label_width}" width="{value_width}" height="{height}" fill="{bg}"/><text x="{x}" y="{baseline}" fill="#fff" font-family="Verdana,Geneva,sans-serif" font-size="{font_size}" text-anchor="middle">{value}</text>"##,
        x = label_width + value_width / 2.0,
        value = escape(value),
    ));

    format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{total}" height="{height}" role="img"><defs>{gradient}<clipPath id="r"><rect width="{total}" height="{height}" rx="{radius}" fill="#fff"/></clipPath></defs><g clip-path="url(#r)">{body}{overlay}</g></svg>"##,
    )
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
