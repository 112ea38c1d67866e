//! Suggestion candidates as presented to the host editor.

use crate::geometry::Span;

/// An extra edit applied alongside accepting a suggestion (e.g. an
/// auto-import insertion). The host applies the primary edit and all
/// satellites as one undo-atomic transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatelliteEdit {
    pub span: Span,
    pub new_text: String,
}

/// A completion candidate in host shape.
///
/// `text` is the primary insertion text; `snippet` carries a snippet body
/// instead when the server marked the item as such. Exactly one of the two
/// is consulted on acceptance.
#[derive(Debug, Clone, Default)]
pub struct Suggestion {
    /// Display label shown in the suggestion list.
    pub label: String,
    /// Primary insertion text (plain).
    pub text: String,
    /// Snippet body, when the item uses snippet insert format.
    pub snippet: Option<String>,
    /// Text used for narrowing; candidates without it are excluded from
    /// prefix filtering entirely.
    pub filter_text: Option<String>,
    /// Kind label (e.g. "function", "module"), empty when absent.
    pub kind: String,
    /// Short type/signature detail.
    pub detail: Option<String>,
    /// Longer documentation, filled in lazily by resolve.
    pub documentation: Option<String>,
    /// Replace-on-accept range; `insert_span` is used unless the caller
    /// explicitly requests replace semantics.
    pub insert_span: Option<Span>,
    pub replace_span: Option<Span>,
    /// Edits applied together with acceptance, in one undo step.
    pub satellite_edits: Vec<SatelliteEdit>,
}

impl Suggestion {
    /// The text the narrowing filter ranks against.
    #[must_use]
    pub fn filter_key(&self) -> Option<&str> {
        self.filter_text.as_deref()
    }

    /// The span to replace on acceptance.
    ///
    /// Replace semantics only when explicitly requested by the caller;
    /// otherwise the insert span.
    #[must_use]
    pub fn accept_span(&self, replace_on_accept: bool) -> Option<Span> {
        if replace_on_accept {
            self.replace_span.or(self.insert_span)
        } else {
            self.insert_span
        }
    }
}
