//! Word error rate scoring
//!
//! Compares a hypothesis transcript against a reference after applying the
//! same normalization to both: lowercase, punctuation removed, runs of
//! whitespace collapsed, ends trimmed. Alignment is a word-level minimum
//! edit distance; `wer = (S + D + I) / N` where N is the reference length.

use serde::{Deserialize, Serialize};

/// ASCII characters in the Unicode punctuation (`P*`) categories.
/// Symbols such as `$`, `+`, `<`, `=`, `^` and `~` are `S*` and are kept.
const ASCII_PUNCTUATION: &str = "!\"#%&'()*,-./:;?@[\\]_{}";

/// Whether `c` is punctuation for normalization purposes.
///
/// ASCII follows the Unicode `P*` categories exactly. Outside ASCII the
/// Latin-1, General Punctuation, Indic, Arabic, CJK and fullwidth
/// punctuation blocks are covered; rarer scripts' marks are not.
fn is_punctuation(c: char) -> bool {
    if c.is_ascii() {
        return ASCII_PUNCTUATION.contains(c);
    }
    matches!(
        c,
        '\u{00A1}' | '\u{00A7}' | '\u{00AB}' | '\u{00B6}' | '\u{00B7}' | '\u{00BB}' | '\u{00BF}'
            | '\u{0964}' | '\u{0965}' | '\u{0970}'
            | '\u{060C}' | '\u{061B}' | '\u{061F}' | '\u{066A}'..='\u{066D}' | '\u{06D4}'
            | '\u{2010}'..='\u{2027}'
            | '\u{2030}'..='\u{2043}'
            | '\u{2045}'..='\u{2051}'
            | '\u{2053}'..='\u{205E}'
            | '\u{3001}'..='\u{3003}'
            | '\u{3008}'..='\u{3011}'
            | '\u{3014}'..='\u{301F}'
            | '\u{3030}' | '\u{303D}' | '\u{30FB}'
            | '\u{FF01}'..='\u{FF03}'
            | '\u{FF05}'..='\u{FF0A}'
            | '\u{FF0C}'..='\u{FF0F}'
            | '\u{FF1A}' | '\u{FF1B}' | '\u{FF1F}' | '\u{FF20}'
            | '\u{FF3B}'..='\u{FF3D}'
            | '\u{FF3F}' | '\u{FF5B}' | '\u{FF5D}'
            | '\u{FF5F}'..='\u{FF65}'
    )
}

/// Alignment breakdown returned alongside a transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WerReport {
    /// `None` when the reference is unusable (see `error`)
    pub wer: Option<f64>,
    pub hits: usize,
    pub substitutions: usize,
    pub deletions: usize,
    pub insertions: usize,
    pub reference_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WerReport {
    fn unusable_reference(message: &str) -> Self {
        Self {
            wer: None,
            hits: 0,
            substitutions: 0,
            deletions: 0,
            insertions: 0,
            reference_length: 0,
            error: Some(message.to_string()),
        }
    }

    fn all_deleted(reference_length: usize) -> Self {
        Self {
            wer: Some(1.0),
            hits: 0,
            substitutions: 0,
            deletions: reference_length,
            insertions: 0,
            reference_length,
            error: None,
        }
    }
}

/// Normalize text before alignment
pub fn normalize(text: &str) -> String {
    let stripped: String = text
        .to_lowercase()
        .chars()
        .filter(|c| !is_punctuation(*c))
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Score `hypothesis` against `reference`.
///
/// # Examples
///
/// ```
/// use transcribe_common::wer::compute_wer;
///
/// let report = compute_wer("the cat sat", "The cat sat.");
/// assert_eq!(report.wer, Some(0.0));
/// assert_eq!(report.hits, 3);
/// ```
pub fn compute_wer(hypothesis: &str, reference: &str) -> WerReport {
    if reference.trim().is_empty() {
        return WerReport::unusable_reference("Reference text is empty");
    }
    if hypothesis.trim().is_empty() {
        return WerReport::all_deleted(reference.split_whitespace().count());
    }

    let reference = normalize(reference);
    let hypothesis = normalize(hypothesis);

    if reference.is_empty() {
        return WerReport::unusable_reference("Reference text is empty after normalization");
    }

    let ref_words: Vec<&str> = reference.split(' ').collect();
    if hypothesis.is_empty() {
        return WerReport::all_deleted(ref_words.len());
    }
    let hyp_words: Vec<&str> = hypothesis.split(' ').collect();

    let ops = align(&ref_words, &hyp_words);
    let reference_length = ops.hits + ops.substitutions + ops.deletions;
    let errors = ops.substitutions + ops.deletions + ops.insertions;

    WerReport {
        wer: Some(errors as f64 / reference_length as f64),
        hits: ops.hits,
        substitutions: ops.substitutions,
        deletions: ops.deletions,
        insertions: ops.insertions,
        reference_length,
        error: None,
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct EditCounts {
    hits: usize,
    substitutions: usize,
    deletions: usize,
    insertions: usize,
}

/// Minimum edit alignment with a backtrace.
///
/// Ties prefer the diagonal (hit/substitution), then deletion, then insertion.
fn align(reference: &[&str], hypothesis: &[&str]) -> EditCounts {
    let rows = reference.len() + 1;
    let cols = hypothesis.len() + 1;
    let mut cost = vec![0usize; rows * cols];
    let at = |r: usize, c: usize| r * cols + c;

    for r in 0..rows {
        cost[at(r, 0)] = r;
    }
    for c in 0..cols {
        cost[at(0, c)] = c;
    }
    for r in 1..rows {
        for c in 1..cols {
            let diagonal = cost[at(r - 1, c - 1)]
                + usize::from(reference[r - 1] != hypothesis[c - 1]);
            let deletion = cost[at(r - 1, c)] + 1;
            let insertion = cost[at(r, c - 1)] + 1;
            cost[at(r, c)] = diagonal.min(deletion).min(insertion);
        }
    }

    let mut counts = EditCounts::default();
    let (mut r, mut c) = (reference.len(), hypothesis.len());
    while r > 0 || c > 0 {
        if r > 0 && c > 0 {
            let same = reference[r - 1] == hypothesis[c - 1];
            if cost[at(r, c)] == cost[at(r - 1, c - 1)] + usize::from(!same) {
                if same {
                    counts.hits += 1;
                } else {
                    counts.substitutions += 1;
                }
                r -= 1;
                c -= 1;
                continue;
            }
        }
        if r > 0 && cost[at(r, c)] == cost[at(r - 1, c)] + 1 {
            counts.deletions += 1;
            r -= 1;
        } else {
            counts.insertions += 1;
            c -= 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_punctuation_and_spacing() {
        assert_eq!(normalize("  Hello,   World!  "), "hello world");
        assert_eq!(normalize("नमस्ते। दुनिया"), "नमस्ते दुनिया");
    }

    #[test]
    fn test_identical_after_normalization() {
        let report = compute_wer("hello world", "Hello, World!");
        assert_eq!(report.wer, Some(0.0));
        assert_eq!(report.hits, 2);
        assert_eq!(report.reference_length, 2);
    }

    #[test]
    fn test_mixed_edits() {
        // ref: a b c d / hyp: a x c d e -> 1 sub, 1 ins
        let report = compute_wer("a x c d e", "a b c d");
        assert_eq!(report.substitutions, 1);
        assert_eq!(report.insertions, 1);
        assert_eq!(report.deletions, 0);
        assert_eq!(report.hits, 3);
        assert_eq!(report.wer, Some(0.5));
    }

    #[test]
    fn test_deletions_counted() {
        let report = compute_wer("a d", "a b c d");
        assert_eq!(report.deletions, 2);
        assert_eq!(report.hits, 2);
        assert_eq!(report.wer, Some(0.5));
    }

    #[test]
    fn test_empty_reference_has_no_score() {
        let report = compute_wer("anything", "   ");
        assert_eq!(report.wer, None);
        assert_eq!(report.error.as_deref(), Some("Reference text is empty"));
    }

    #[test]
    fn test_punctuation_only_reference() {
        let report = compute_wer("anything", "?!.");
        assert_eq!(report.wer, None);
        assert!(report.error.unwrap().contains("after normalization"));
    }

    #[test]
    fn test_empty_hypothesis_is_all_deletions() {
        let report = compute_wer("", "one two three");
        assert_eq!(report.wer, Some(1.0));
        assert_eq!(report.deletions, 3);
        assert_eq!(report.reference_length, 3);
    }

    #[test]
    fn test_ascii_symbols_kept() {
        assert_eq!(normalize("$5 + 3 = 8 <ok> ^|~`"), "$5 + 3 = 8 <ok> ^|~`");
        assert_eq!(normalize("a_b {c} [d] #e @f"), "ab c d e f");
    }

    #[test]
    fn test_non_ascii_punctuation_removed() {
        assert_eq!(normalize("नमस्ते। कैसे हो॥"), "नमस्ते कैसे हो");
        assert_eq!(normalize("こんにちは、世界。"), "こんにちは世界");
        assert_eq!(normalize("‹quoted›‐dash"), "quoteddash");
        assert_eq!(normalize("«hola» ¿qué?"), "hola qué");
    }
}
