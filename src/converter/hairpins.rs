//! Hairpin (crescendo/diminuendo wedge) resolution.
//!
//! Hairpins are always element-based: each carries explicit start/end
//! references or time positions, so there is no attribute matching. The
//! form attribute selects the wedge kind.

use log::warn;

use crate::model::{Hairpin, HairpinKind};

use super::links::{resolve_endpoints, EventLink, LinkCollection};
use super::registry::EventRegistry;

#[derive(Debug, Default)]
pub(crate) struct Hairpins {
    links: LinkCollection,
}

impl Hairpins {
    pub fn add_link(&mut self, link: EventLink) -> usize {
        self.links.push(link)
    }

    pub fn set_end(&mut self, index: usize, end_id: String) {
        self.links.set_end(index, end_id);
    }

    pub fn finalize(&self, registry: &EventRegistry) -> Vec<Hairpin> {
        let mut hairpins = Vec::new();
        for link in self.links.iter() {
            let kind = match link.params.form.as_deref() {
                Some("cres") => HairpinKind::Crescendo,
                Some("dim") => HairpinKind::Diminuendo,
                other => {
                    warn!(
                        "Hairpin form \"{}\" is not supported. Skipping hairpin.",
                        other.unwrap_or("")
                    );
                    continue;
                }
            };
            let Some((first, last)) = resolve_endpoints(registry, link, "hairpin") else {
                continue;
            };
            hairpins.push(Hairpin {
                kind,
                start: first.event,
                end: last.event,
                place: link.params.place,
            });
        }
        hairpins
    }
}
