//! Fuzzy subsequence scorer for suggestion narrowing.
//!
//! Greedy left-to-right subsequence match, case-insensitive, with
//! bonuses for the shapes people actually type: prefix matches,
//! consecutive runs, word-boundary hits, and exact-case hits. The
//! absolute score only matters relative to other candidates for the
//! same needle.

const BONUS_PREFIX: i32 = 15;
const BONUS_WORD_BOUNDARY: i32 = 10;
const BONUS_CONSECUTIVE: i32 = 5;
const BONUS_CASE_MATCH: i32 = 1;
const PENALTY_GAP: i32 = -1;
const PENALTY_GAP_MAX: i32 = -5;

/// A successful match: the score and the matched haystack positions
/// (byte offsets), for highlighting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub score: i32,
    pub positions: Vec<usize>,
}

fn is_word_boundary(prev: Option<char>, current: char) -> bool {
    match prev {
        None => true,
        Some(p) => {
            matches!(p, '_' | '-' | '.' | ':' | '/' | ' ')
                || (p.is_lowercase() && current.is_uppercase())
        }
    }
}

/// Score `needle` against `haystack`.
///
/// Returns `None` unless every needle character appears in order in the
/// haystack. An empty needle matches everything with score zero.
#[must_use]
pub fn score(needle: &str, haystack: &str) -> Option<Match> {
    if needle.is_empty() {
        return Some(Match {
            score: 0,
            positions: Vec::new(),
        });
    }

    let mut needle_chars = needle.chars().peekable();
    let mut total = 0i32;
    let mut positions = Vec::with_capacity(needle.len());
    let mut prev_char: Option<char> = None;
    let mut prev_matched = false;
    let mut gap = 0i32;

    for (offset, hay_char) in haystack.char_indices() {
        let Some(&want) = needle_chars.peek() else {
            break;
        };
        if hay_char.eq_ignore_ascii_case(&want)
            || hay_char.to_lowercase().eq(want.to_lowercase())
        {
            needle_chars.next();
            positions.push(offset);

            if positions.len() == 1 && offset == 0 {
                total += BONUS_PREFIX;
            }
            if is_word_boundary(prev_char, hay_char) {
                total += BONUS_WORD_BOUNDARY;
            }
            if prev_matched {
                total += BONUS_CONSECUTIVE;
            }
            if hay_char == want {
                total += BONUS_CASE_MATCH;
            }
            total += gap.max(PENALTY_GAP_MAX);
            gap = 0;
            prev_matched = true;
        } else {
            gap += PENALTY_GAP;
            prev_matched = false;
        }
        prev_char = Some(hay_char);
    }

    if needle_chars.peek().is_some() {
        return None;
    }
    // Shorter candidates win ties: "for" over "format!" for needle "for".
    let unmatched = haystack.chars().count() as i32 - positions.len() as i32;
    total -= unmatched;
    Some(Match {
        score: total,
        positions,
    })
}
