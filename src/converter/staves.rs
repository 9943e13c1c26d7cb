//! Per-stave clef/key/meter context, carried across measures and systems.
//!
//! A score-level definition updates every stave, a stave-level definition
//! one stave; both mark the changed attributes for redisplay. The walker
//! consumes the display flags at each measure boundary.

use std::collections::BTreeMap;

use log::warn;
use roxmltree::Node;

use crate::error::ConvertError;
use crate::model::Meter;
use crate::tables;

use super::serialize_element;

/// Height of a five-line stave in layout units.
pub(crate) const STAVE_HEIGHT: f64 = 40.0;

/// Persistent context for one stave number.
#[derive(Debug, Clone)]
pub(crate) struct StaveContext {
    clef: Option<String>,
    key_fifths: Option<i32>,
    meter: Option<Meter>,
    pub label: Option<String>,
    pub label_abbr: Option<String>,
    /// Spacing below this stave, overriding the configured default.
    pub spacing: Option<f64>,
    show_clef: bool,
    show_key: bool,
    show_time: bool,
}

impl StaveContext {
    fn new() -> Self {
        Self {
            clef: None,
            key_fifths: None,
            meter: None,
            label: None,
            label_abbr: None,
            spacing: None,
            show_clef: false,
            show_key: false,
            show_time: false,
        }
    }

    /// The clef currently in effect (treble until defined otherwise).
    pub fn clef(&self) -> &str {
        self.clef.as_deref().unwrap_or("treble")
    }

    /// The meter currently in effect (4/4 until defined otherwise).
    pub fn meter(&self) -> Meter {
        self.meter.unwrap_or_default()
    }

    fn set_clef(&mut self, clef: String) {
        if self.clef.as_deref() != Some(clef.as_str()) {
            self.show_clef = true;
        }
        self.clef = Some(clef);
    }

    fn set_key(&mut self, fifths: i32) {
        if self.key_fifths != Some(fifths) {
            self.show_key = true;
        }
        self.key_fifths = Some(fifths);
    }

    fn set_meter(&mut self, meter: Meter) {
        if self.meter != Some(meter) {
            self.show_time = true;
        }
        self.meter = Some(meter);
    }

    /// Updates the clef for a mid-measure clef change without marking it
    /// for stave-start display (it is shown as an event modifier instead).
    pub fn clef_change_in_measure(&mut self, clef: String) -> String {
        self.clef = Some(clef.clone());
        clef
    }

    /// Whether the clef must be displayed now; clears the flag.
    pub fn show_clef_check(&mut self) -> bool {
        let show = self.show_clef && self.clef.is_some();
        self.show_clef = false;
        show
    }

    /// Whether the key signature must be displayed now; clears the flag.
    pub fn show_key_check(&mut self) -> Option<i32> {
        let fifths = if self.show_key { self.key_fifths } else { None };
        self.show_key = false;
        fifths
    }

    /// Whether the time signature must be displayed now; clears the flag.
    pub fn show_time_check(&mut self) -> Option<Meter> {
        let meter = if self.show_time { self.meter } else { None };
        self.show_time = false;
        meter
    }

    fn force_display(&mut self) {
        self.show_clef = self.clef.is_some();
        self.show_key = self.key_fifths.is_some();
        self.show_time = self.meter.is_some();
    }
}

/// Stave definitions read from a scoreDef/staffDef element, used as
/// inherited defaults for nested staffDef elements.
#[derive(Debug, Clone, Default)]
struct DefAttrs {
    clef: Option<String>,
    key_fifths: Option<i32>,
    meter: Option<Meter>,
}

fn read_def_attrs(node: &Node) -> DefAttrs {
    let clef = node.attribute("clef.shape").map(|shape| {
        let line = node
            .attribute("clef.line")
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(0);
        tables::clef_name(shape, line).to_string()
    });
    let key_fifths = node
        .attribute("key.sig")
        .and_then(tables::key_sig_fifths);
    let meter = match (
        node.attribute("meter.count")
            .and_then(|v| v.parse::<u32>().ok()),
        node.attribute("meter.unit")
            .and_then(|v| v.parse::<u32>().ok()),
    ) {
        // bounds keep all downstream tick arithmetic overflow-free
        (Some(count), Some(unit))
            if (1..=64).contains(&count) && (1..=128).contains(&unit) =>
        {
            Some(Meter { count, unit })
        }
        (Some(count), Some(unit)) => {
            warn!(
                "Meter {count}/{unit} is not supported. Ignoring meter definition."
            );
            None
        }
        _ => None,
    };
    DefAttrs {
        clef,
        key_fifths,
        meter,
    }
}

/// All stave contexts of the score, plus the running vertical extent used
/// for placing the next system.
#[derive(Debug, Default)]
pub(crate) struct ScoreContext {
    staves: BTreeMap<i32, StaveContext>,
    /// Lowest y coordinate of the most recently laid-out system.
    pub lowest_y: f64,
}

impl ScoreContext {
    /// Processes a score-level definition: score defaults apply to every
    /// known stave, nested staffDef elements create or update single
    /// staves.
    pub fn process_score_def(&mut self, node: &Node) -> Result<(), ConvertError> {
        let defaults = read_def_attrs(node);

        for ctx in self.staves.values_mut() {
            if let Some(ref clef) = defaults.clef {
                ctx.set_clef(clef.clone());
            }
            if let Some(fifths) = defaults.key_fifths {
                ctx.set_key(fifths);
            }
            if let Some(meter) = defaults.meter {
                ctx.set_meter(meter);
            }
        }

        for child in node.descendants().filter(|n| n.is_element()) {
            if child.tag_name().name() == "staffDef" {
                self.process_staff_def_with_defaults(&child, &defaults)?;
            }
        }
        Ok(())
    }

    /// Processes a standalone stave-level definition.
    pub fn process_staff_def(&mut self, node: &Node) -> Result<(), ConvertError> {
        self.process_staff_def_with_defaults(node, &DefAttrs::default())
    }

    fn process_staff_def_with_defaults(
        &mut self,
        node: &Node,
        defaults: &DefAttrs,
    ) -> Result<(), ConvertError> {
        let stave_n = node
            .attribute("n")
            .and_then(|v| v.parse::<i32>().ok())
            .ok_or_else(|| ConvertError::InvalidStaveNumber {
                element: serialize_element(node),
            })?;

        let own = read_def_attrs(node);
        let ctx = self.staves.entry(stave_n).or_insert_with(StaveContext::new);

        if let Some(clef) = own.clef.or_else(|| defaults.clef.clone()) {
            ctx.set_clef(clef);
        }
        if let Some(fifths) = own.key_fifths.or(defaults.key_fifths) {
            ctx.set_key(fifths);
        }
        if let Some(meter) = own.meter.or(defaults.meter) {
            ctx.set_meter(meter);
        }
        if let Some(label) = node.attribute("label") {
            ctx.label = Some(label.to_string());
        }
        if let Some(abbr) = node.attribute("label.abbr") {
            ctx.label_abbr = Some(abbr.to_string());
        }
        if let Some(spacing) = node.attribute("spacing").and_then(|v| v.parse().ok()) {
            ctx.spacing = Some(spacing);
        }
        Ok(())
    }

    pub fn stave(&mut self, stave_n: i32) -> Option<&mut StaveContext> {
        self.staves.get_mut(&stave_n)
    }

    pub fn stave_ref(&self, stave_n: i32) -> Option<&StaveContext> {
        self.staves.get(&stave_n)
    }

    pub fn all_staves(&self) -> impl Iterator<Item = (&i32, &StaveContext)> {
        self.staves.iter()
    }

    /// Marks every stave's full context for redisplay (system start).
    pub fn force_stave_start_infos(&mut self) {
        for ctx in self.staves.values_mut() {
            ctx.force_display();
        }
    }

    /// Marks every stave's full context for redisplay (section start).
    pub fn force_section_start_infos(&mut self) {
        self.force_stave_start_infos();
    }

    /// Computes the y coordinate of each stave for a system starting at
    /// `top`, stacking staves by their spacing (or the default).
    pub fn stave_ys(&self, top: f64, default_spacing: f64) -> BTreeMap<i32, f64> {
        let mut ys = BTreeMap::new();
        let mut y = top;
        for (&stave_n, ctx) in &self.staves {
            ys.insert(stave_n, y);
            y += STAVE_HEIGHT + ctx.spacing.unwrap_or(default_spacing);
        }
        ys
    }
}
