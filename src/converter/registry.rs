//! Identifier registry — maps xml:id values to the render events they
//! produced, plus the positional metadata connector resolution needs.

use std::collections::HashMap;

use crate::model::{EventIx, StemDir};

/// Registry entry for one identified musical event.
#[derive(Debug, Clone)]
pub(crate) struct EventRecord {
    pub event: EventIx,
    /// Index of the system the event was created in (weak back-reference,
    /// used only for cross-system connector splitting).
    pub system: usize,
    /// Stem-direction hint of the enclosing layer, if the stave had
    /// multiple layers.
    pub layer_dir: Option<StemDir>,
    /// For chords: the pitch indices within the chord this identifier
    /// addresses. Empty for plain notes and rests.
    pub chord_indices: Vec<usize>,
}

/// All identified events of one conversion pass. Rebuilt from empty at the
/// start of each pass; entries are write-once per id, with a later
/// duplicate id overwriting the earlier one (last write wins).
#[derive(Debug, Default)]
pub(crate) struct EventRegistry {
    map: HashMap<String, EventRecord>,
}

impl EventRegistry {
    pub fn insert(&mut self, id: String, record: EventRecord) {
        self.map.insert(id, record);
    }

    pub fn get(&self, id: &str) -> Option<&EventRecord> {
        self.map.get(id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
