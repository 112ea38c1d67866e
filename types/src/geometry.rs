//! Buffer geometry shared between the host editor and the runtime.
//!
//! Points are 0-indexed (line, column) pairs matching the wire protocol's
//! position encoding. Display code is responsible for 1-indexing.

use serde::{Deserialize, Serialize};

/// A 0-indexed (line, column) position in a document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Point {
    pub line: u32,
    #[serde(rename = "character")]
    pub column: u32,
}

impl Point {
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// A half-open range of buffer positions, `start <= end`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Point,
    pub end: Point,
}

impl Span {
    /// Construct a span, swapping the endpoints if given in reverse.
    #[must_use]
    pub fn new(start: Point, end: Point) -> Self {
        if end < start {
            Self { start: end, end: start }
        } else {
            Self { start, end }
        }
    }

    /// Whether `point` falls inside the span (start inclusive, end inclusive).
    ///
    /// End-inclusive because a cursor sitting at the end of a diagnostic's
    /// range still addresses it for contextual actions.
    #[must_use]
    pub fn contains(&self, point: Point) -> bool {
        self.start <= point && point <= self.end
    }

    /// Smallest span covering both `self` and `other`.
    #[must_use]
    pub fn union(&self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Whether two spans overlap (touching endpoints count).
    #[must_use]
    pub fn intersects(&self, other: Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({},{})-({},{})",
            self.start.line, self.start.column, self.end.line, self.end.column
        )
    }
}
