//! Pointer-style annotations: directives, dynamics, fermatas and
//! ornaments. Each references a single event (by id or by time position,
//! resolved to an id before it gets here) and is attached to that event as
//! a modifier during finalization.

use log::warn;

use crate::config::FontSpec;
use crate::model::{EventModifier, Placement, RenderEvent};
use crate::tables;

use super::registry::EventRegistry;

/// The modifier family a collection produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PointerKind {
    Directive,
    Dynamic,
    Fermata,
    Ornament,
}

/// One pointer annotation waiting for finalization.
#[derive(Debug, Clone)]
pub(crate) struct PointerModel {
    /// Id of the referenced event, already resolved from startid/tstamp.
    pub start_id: String,
    pub text: Option<String>,
    pub place: Option<Placement>,
    /// Horizontal shift from the @ho attribute, staff-space units.
    pub x_shift: f64,
    /// Form attribute (inverted fermatas).
    pub form: Option<String>,
    pub accid_upper: Option<String>,
    pub accid_lower: Option<String>,
}

/// A collection of same-kind pointer annotations.
#[derive(Debug)]
pub(crate) struct PointerCollection {
    kind: PointerKind,
    font: FontSpec,
    models: Vec<PointerModel>,
}

impl PointerCollection {
    pub fn new(kind: PointerKind, font: FontSpec) -> Self {
        Self {
            kind,
            font,
            models: Vec::new(),
        }
    }

    pub fn add(&mut self, model: PointerModel) {
        self.models.push(model);
    }

    /// Attaches every model to its referenced event; a dangling reference
    /// is reported and dropped.
    pub fn finalize(&self, registry: &EventRegistry, events: &mut [RenderEvent]) {
        for model in &self.models {
            let Some(record) = registry.get(&model.start_id) else {
                warn!(
                    "{:?} could not be rendered: referenced event \"{}\" \
                     was not found. Skipping.",
                    self.kind, model.start_id
                );
                continue;
            };
            let event = &mut events[record.event.0];
            match self.kind {
                PointerKind::Directive => {
                    if let Some(text) = &model.text {
                        event.modifiers.push(EventModifier::Text {
                            text: text.clone(),
                            font: self.font.clone(),
                            placement: model.place.unwrap_or(Placement::Above),
                            x_shift: model.x_shift,
                        });
                    }
                }
                PointerKind::Dynamic => {
                    if let Some(text) = &model.text {
                        event.modifiers.push(EventModifier::Text {
                            text: text.clone(),
                            font: self.font.clone(),
                            placement: model.place.unwrap_or(Placement::Below),
                            x_shift: model.x_shift,
                        });
                    }
                }
                PointerKind::Fermata => {
                    let above = model.place != Some(Placement::Below)
                        && model.form.as_deref() != Some("inv");
                    event.modifiers.push(EventModifier::Fermata { above });
                }
                PointerKind::Ornament => {
                    event.modifiers.push(EventModifier::Ornament {
                        upper_accidental: model
                            .accid_upper
                            .as_deref()
                            .and_then(tables::accidental)
                            .map(String::from),
                        lower_accidental: model
                            .accid_lower
                            .as_deref()
                            .and_then(tables::accidental)
                            .map(String::from),
                    });
                }
            }
        }
    }
}
