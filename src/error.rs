//! Structural conversion failures.
//!
//! Only defects that make the rest of the document meaningless are errors;
//! everything recoverable (missing durations, dangling references, unknown
//! elements) is logged with a fallback and conversion continues.

use thiserror::Error;

/// A fatal structural failure. Raised immediately to the top-level
/// conversion call; no partial layout graph is ever returned.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// The input could not be parsed as XML at all.
    #[error("XML parse error: {0}")]
    Xml(#[from] roxmltree::Error),

    /// The document contains no `<score>` element.
    #[error("no score element found in the document")]
    NoScore,

    /// A `<staff>` element has a missing or non-integer `@n` attribute.
    #[error("<{element}> must have an @n attribute of type integer")]
    InvalidStaveNumber { element: String },

    /// A `<staff>` element references a stave number for which no
    /// `staffDef` exists anywhere in the document.
    #[error(
        "<{element}> refers to stave \"{stave_n}\", but no corresponding \
         stave definition could be found in the document"
    )]
    UnknownStave { element: String, stave_n: i32 },

    /// A slur attribute token does not match the `[it]` / `[it][1-9]` grammar.
    #[error("badly formed slur attribute: \"{token}\"")]
    MalformedSlurAttribute { token: String },
}
