//! meilayout converts MEI (Music Encoding Initiative) documents into a
//! fully resolved notation layout graph.
//!
//! The conversion walks the score once in document order, carrying the
//! clef/key/meter context per stave, collecting tickable events into
//! voices, and registering every identified event. Spanning annotations
//! (ties, slurs, hairpins, directives and friends) are resolved against
//! the completed registry in a finalization pass, so forward references
//! work without lookahead. A last pass distributes measure widths across
//! each system and justifies the voices horizontally.
//!
//! ```no_run
//! use meilayout::{convert_mei, Config};
//!
//! let xml = std::fs::read_to_string("score.mei")?;
//! let graph = convert_mei(&xml, &Config::default())?;
//! println!("{} systems", graph.systems.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
mod converter;
pub mod error;
pub mod model;
pub mod tables;

pub use config::{BreakPolicy, Config, FontSpec, LabelMode, PrintSpace};
pub use error::ConvertError;
pub use model::LayoutGraph;

/// Parses an MEI document and converts it into a layout graph.
pub fn convert_mei(xml: &str, cfg: &Config) -> Result<LayoutGraph, ConvertError> {
    let options = roxmltree::ParsingOptions {
        allow_dtd: true,
        ..Default::default()
    };
    let doc = roxmltree::Document::parse_with_options(xml, options)?;
    convert_document(doc.root_element(), cfg)
}

/// Converts an already-parsed document node (the document root, or any
/// node containing a `<score>` element).
pub fn convert_document(
    root: roxmltree::Node<'_, '_>,
    cfg: &Config,
) -> Result<LayoutGraph, ConvertError> {
    converter::Converter::new(cfg.clone()).run(root)
}

/// Serializes a layout graph to pretty-printed JSON.
pub fn graph_to_json(graph: &LayoutGraph) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(graph)
}
