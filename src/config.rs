//! Conversion configuration — page geometry, spacing, break policies and
//! fonts. Supplied by the embedding application; the converter only reads it.

use serde::{Deserialize, Serialize};

/// How a system-break (`<sb>`) or page-break (`<pb>`) element is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakPolicy {
    /// The element is skipped entirely.
    Ignore,
    /// The element forces a new system before the next measure.
    SystemBreak,
    /// Reserved for page layout; currently logged as not implemented.
    PageBreak,
}

/// How stave labels are rendered at the left of each system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelMode {
    /// No labels.
    None,
    /// Abbreviated labels in every system.
    Abbreviated,
    /// Full labels in the first system, abbreviated labels afterwards.
    FullThenAbbreviated,
}

/// An opaque font descriptor, passed through to the rendering backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FontSpec {
    pub family: String,
    pub size: f64,
    /// Style, weight or both, space separated (e.g. "bold italic").
    pub weight: String,
}

impl FontSpec {
    pub fn new(family: &str, size: f64, weight: &str) -> Self {
        Self {
            family: family.to_string(),
            size,
            weight: weight.to_string(),
        }
    }
}

/// Conversion settings. `Config::default()` matches the reference defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The width of the page
    pub page_width: f64,
    /// The top page margin
    pub page_top_margin: f64,
    /// The left page margin
    pub page_left_margin: f64,
    /// The right page margin
    pub page_right_margin: f64,
    /// The vertical spacing between two stave systems
    pub system_spacing: f64,
    /// The default spacing between two staves within a system; overridden
    /// by the spacing attribute of a staffDef element
    pub stave_spacing: f64,
    /// Whether fermata attributes on note-like elements are rendered
    pub render_fermata_attributes: bool,
    /// How `<sb>` elements are handled
    pub on_system_break: BreakPolicy,
    /// How `<pb>` elements are handled
    pub on_page_break: BreakPolicy,
    /// Stave label display mode
    pub label_mode: LabelMode,
    /// The font used for lyrics syllables
    pub lyrics_font: FontSpec,
    /// The font used for annotations (for example, "pizz.")
    pub annot_font: FontSpec,
    /// The font used for dynamics
    pub dynam_font: FontSpec,
    /// The tempo font
    pub tempo_font: FontSpec,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_width: 800.0,
            page_top_margin: 60.0,
            page_left_margin: 20.0,
            page_right_margin: 20.0,
            system_spacing: 90.0,
            stave_spacing: 60.0,
            render_fermata_attributes: true,
            on_system_break: BreakPolicy::SystemBreak,
            on_page_break: BreakPolicy::SystemBreak,
            label_mode: LabelMode::None,
            lyrics_font: FontSpec::new("Times", 13.0, ""),
            annot_font: FontSpec::new("Times", 15.0, "italic"),
            dynam_font: FontSpec::new("Times", 18.0, "bold italic"),
            tempo_font: FontSpec::new("Times", 17.0, "bold"),
        }
    }
}

/// The print space derived from the page config. The top compensates the
/// backend's default top spacing of four line distances so absolute values
/// can be specified in the config.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PrintSpace {
    pub top: f64,
    pub left: f64,
    pub right: f64,
    pub width: f64,
}

impl PrintSpace {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            top: cfg.page_top_margin - 40.0,
            left: cfg.page_left_margin,
            right: cfg.page_width - cfg.page_right_margin,
            width: (cfg.page_width - cfg.page_right_margin - cfg.page_left_margin).floor() - 1.0,
        }
    }
}
