//! Event-link engine — the generic two-endpoint reference resolver used by
//! every spanning-annotation kind, plus the deferred-position table for
//! time-position references into not-yet-visited locations.

use std::collections::HashMap;

use log::warn;

use crate::model::{CurveDir, Pitch, Placement};

use super::registry::{EventRecord, EventRegistry};

/// Addresses a point in document traversal order. Used only as a lookup
/// key for deferred resolution, never as ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LocationKey {
    pub measure: usize,
    pub stave: i32,
    pub layer: i32,
}

/// Parameters stored with a link; which fields are meaningful depends on
/// the annotation kind.
#[derive(Debug, Clone, Default)]
pub(crate) struct LinkParams {
    /// Slur stack-nesting level.
    pub nesting_level: i32,
    /// Tie matching key: pitch and stave of the endpoint.
    pub pitch: Option<Pitch>,
    pub stave_n: i32,
    /// Explicit curve direction from a curvedir attribute.
    pub curve_dir: Option<CurveDir>,
    pub place: Option<Placement>,
    /// Hairpin form ("cres" / "dim").
    pub form: Option<String>,
    pub y_shift_start: Option<f64>,
    pub y_shift_end: Option<f64>,
}

/// One spanning annotation instance. Resolved only when both endpoint ids
/// are present; an unresolved link at finalize time is reported, never
/// fatal.
#[derive(Debug, Clone)]
pub(crate) struct EventLink {
    pub start_id: Option<String>,
    pub end_id: Option<String>,
    pub params: LinkParams,
}

impl EventLink {
    pub fn new(start_id: Option<String>, end_id: Option<String>) -> Self {
        Self {
            start_id,
            end_id,
            params: LinkParams::default(),
        }
    }
}

/// Ordered collection of links for one annotation kind. Matching is
/// injected per kind via the predicate passed to [`LinkCollection::close`].
#[derive(Debug, Default)]
pub(crate) struct LinkCollection {
    links: Vec<EventLink>,
}

impl LinkCollection {
    /// Opens a link with a known start and unknown end.
    pub fn open_start(&mut self, start_id: &str, params: LinkParams) {
        let mut link = EventLink::new(Some(start_id.to_string()), None);
        link.params = params;
        self.links.push(link);
    }

    /// Adds a link whose endpoints are already known (element-based
    /// annotations with explicit references). Either id may still be
    /// missing and supplied later via [`LinkCollection::set_end`].
    pub fn push(&mut self, link: EventLink) -> usize {
        self.links.push(link);
        self.links.len() - 1
    }

    /// Scans unresolved links oldest-first for one whose parameters match
    /// and supplies the missing end; if none matches, a new link with only
    /// the end id is created, to be matched later from the other side.
    pub fn close(
        &mut self,
        end_id: &str,
        params: LinkParams,
        matches: impl Fn(&LinkParams, &LinkParams) -> bool,
    ) {
        for link in self.links.iter_mut() {
            if link.end_id.is_none() && link.start_id.is_some() && matches(&link.params, &params) {
                link.end_id = Some(end_id.to_string());
                return;
            }
        }
        let mut link = EventLink::new(None, Some(end_id.to_string()));
        link.params = params;
        self.links.push(link);
    }

    /// Supplies the end id of the link at `index` (deferred resolution).
    pub fn set_end(&mut self, index: usize, end_id: String) {
        if let Some(link) = self.links.get_mut(index) {
            link.end_id = Some(end_id);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventLink> {
        self.links.iter()
    }
}

/// Looks up both endpoint records of a link. Logs and returns `None` when
/// neither endpoint resolves; a link with exactly one resolved endpoint is
/// also reported and skipped (no partial connector is emitted for
/// unresolved links).
pub(crate) fn resolve_endpoints<'a>(
    registry: &'a EventRegistry,
    link: &EventLink,
    kind: &str,
) -> Option<(&'a EventRecord, &'a EventRecord)> {
    let first = link.start_id.as_deref().and_then(|id| registry.get(id));
    let last = link.end_id.as_deref().and_then(|id| registry.get(id));
    match (first, last) {
        (Some(f), Some(l)) => Some((f, l)),
        _ => {
            warn!(
                "{kind} could not be processed: start \"{}\" or end \"{}\" \
                 could not be resolved. Skipping {kind}.",
                link.start_id.as_deref().unwrap_or("?"),
                link.end_id.as_deref().unwrap_or("?"),
            );
            None
        }
    }
}

// ─── Deferred-position table ─────────────────────────────────────────

/// The annotation collection a pending entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingKind {
    Tie,
    Slur,
    Hairpin,
}

/// A pending link end waiting for its location to be walked.
#[derive(Debug, Clone)]
pub(crate) struct PendingRef {
    pub kind: PendingKind,
    /// Index of the link within its collection.
    pub link: usize,
    /// Target beat within the meter of the referenced location (1-based).
    pub tstamp: f64,
}

/// Pending cross-reference resolutions keyed by the location that will
/// make them resolvable. Each entry is consumed at most once, at the first
/// visit of its key; entries under never-visited keys stay pending and are
/// surfaced as unresolved links at finalize time.
#[derive(Debug, Default)]
pub(crate) struct DeferredTable {
    entries: HashMap<LocationKey, Vec<PendingRef>>,
}

impl DeferredTable {
    pub fn register(&mut self, key: LocationKey, pending: PendingRef) {
        self.entries.entry(key).or_default().push(pending);
    }

    /// Removes and returns all entries waiting on `key`.
    pub fn take(&mut self, key: &LocationKey) -> Vec<PendingRef> {
        self.entries.remove(key).unwrap_or_default()
    }
}

/// Finds the event id at a beat position within a layer's onset list.
/// Falls back to the first event at or after the beat; a beat past the end
/// of the layer resolves to nothing.
pub(crate) fn event_at_tstamp(onsets: &[(f64, String)], tstamp: f64) -> Option<&str> {
    for (beat, id) in onsets {
        if (beat - tstamp).abs() < 0.001 {
            return Some(id);
        }
    }
    onsets
        .iter()
        .find(|(beat, _)| *beat >= tstamp)
        .map(|(_, id)| id.as_str())
}
