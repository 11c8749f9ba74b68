//! Visible / reasoning classification of streamed text.
//!
//! Models emit chain-of-thought between a pair of markers (`<think>` …
//! `</think>` by default). Fragments arrive with arbitrary boundaries, so a
//! marker may be split across any number of deltas. The classifier keeps an
//! explicit region flag plus a pending buffer that only ever holds a
//! possible marker prefix; it never rescans accumulated output.
//!
//! Marker matching is ASCII case-insensitive.

use serde::{Deserialize, Serialize};

/// Which channel a piece of text belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Visible,
    Reasoning,
}

/// A classified piece of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub text: String,
}

impl Segment {
    pub fn visible(text: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Visible,
            text: text.into(),
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Reasoning,
            text: text.into(),
        }
    }
}

/// Snapshot of the classifier's carried state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifierState {
    /// Inside the reasoning region.
    pub in_reasoning: bool,
    /// Held-back text that may be the start of the next marker.
    pub pending: String,
}

/// Restartable, chunk-boundary-safe marker transducer.
#[derive(Debug, Clone)]
pub struct DeltaClassifier {
    open_marker: String,
    close_marker: String,
    state: ClassifierState,
}

impl DeltaClassifier {
    /// Create a classifier for the given marker pair.
    ///
    /// An empty marker never matches.
    pub fn new(open_marker: impl Into<String>, close_marker: impl Into<String>) -> Self {
        Self {
            open_marker: open_marker.into(),
            close_marker: close_marker.into(),
            state: ClassifierState::default(),
        }
    }

    /// Classifier for `<think>` / `</think>`.
    pub fn think_tags() -> Self {
        Self::new("<think>", "</think>")
    }

    pub fn state(&self) -> &ClassifierState {
        &self.state
    }

    pub fn in_reasoning(&self) -> bool {
        self.state.in_reasoning
    }

    /// Classify one fragment.
    ///
    /// Returns the segments that are certain; a trailing partial marker is
    /// held back until the next call or [`finish`](Self::finish). Adjacent
    /// segments of the same kind are merged and empty ones are never emitted.
    pub fn feed(&mut self, delta: &str) -> Vec<Segment> {
        let mut segments = Vec::new();
        if delta.is_empty() {
            return segments;
        }

        let mut input = std::mem::take(&mut self.state.pending);
        input.push_str(delta);
        let mut rest = input.as_str();

        loop {
            let marker = self.active_marker();
            if let Some(pos) = find_marker(rest, marker) {
                let marker_len = marker.len();
                push_segment(&mut segments, self.current_kind(), &rest[..pos]);
                rest = &rest[pos + marker_len..];
                self.state.in_reasoning = !self.state.in_reasoning;
                continue;
            }

            let held = partial_marker_suffix(rest, marker);
            let split = rest.len() - held;
            push_segment(&mut segments, self.current_kind(), &rest[..split]);
            self.state.pending = rest[split..].to_string();
            break;
        }

        segments
    }

    /// Emit whatever is held back, in the active region.
    pub fn finish(&mut self) -> Option<Segment> {
        if self.state.pending.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.state.pending);
        Some(Segment {
            kind: self.current_kind(),
            text,
        })
    }

    /// Back to the visible region with nothing pending.
    pub fn reset(&mut self) {
        self.state = ClassifierState::default();
    }

    fn active_marker(&self) -> &str {
        if self.state.in_reasoning {
            &self.close_marker
        } else {
            &self.open_marker
        }
    }

    fn current_kind(&self) -> SegmentKind {
        if self.state.in_reasoning {
            SegmentKind::Reasoning
        } else {
            SegmentKind::Visible
        }
    }
}

fn push_segment(segments: &mut Vec<Segment>, kind: SegmentKind, text: &str) {
    if text.is_empty() {
        return;
    }
    match segments.last_mut() {
        Some(last) if last.kind == kind => last.text.push_str(text),
        _ => segments.push(Segment {
            kind,
            text: text.to_string(),
        }),
    }
}

/// Byte offset of the first case-insensitive occurrence of `marker`.
fn find_marker(haystack: &str, marker: &str) -> Option<usize> {
    let needle = marker.as_bytes();
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

/// Length of the longest suffix of `text` that is a strict prefix of `marker`.
fn partial_marker_suffix(text: &str, marker: &str) -> usize {
    let bytes = text.as_bytes();
    let needle = marker.as_bytes();
    let longest = needle.len().saturating_sub(1).min(bytes.len());

    (1..=longest)
        .rev()
        .find(|&k| {
            let start = bytes.len() - k;
            text.is_char_boundary(start) && bytes[start..].eq_ignore_ascii_case(&needle[..k])
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed all chunks then finish; return (visible, reasoning).
    fn run(classifier: &mut DeltaClassifier, chunks: &[&str]) -> (String, String) {
        let mut visible = String::new();
        let mut reasoning = String::new();
        let mut collect = |seg: Segment| match seg.kind {
            SegmentKind::Visible => visible.push_str(&seg.text),
            SegmentKind::Reasoning => reasoning.push_str(&seg.text),
        };
        for chunk in chunks {
            for seg in classifier.feed(chunk) {
                collect(seg);
            }
        }
        if let Some(seg) = classifier.finish() {
            collect(seg);
        }
        (visible, reasoning)
    }

    #[test]
    fn plain_text_is_visible() {
        let mut c = DeltaClassifier::think_tags();
        assert_eq!(c.feed("Hello there"), vec![Segment::visible("Hello there")]);
        assert!(c.finish().is_none());
    }

    #[test]
    fn splits_reasoning_in_one_fragment() {
        let mut c = DeltaClassifier::think_tags();
        let segs = c.feed("<think>plan</think>Answer");
        assert_eq!(
            segs,
            vec![Segment::reasoning("plan"), Segment::visible("Answer")]
        );
        assert!(!c.in_reasoning());
    }

    #[test]
    fn markers_split_across_three_fragments() {
        let mut c = DeltaClassifier::think_tags();
        let (visible, reasoning) = run(&mut c, &["A<thi", "nk>B</th", "ink>C"]);
        assert_eq!(visible, "AC");
        assert_eq!(reasoning, "B");
    }

    #[test]
    fn partial_marker_is_held_back() {
        let mut c = DeltaClassifier::think_tags();
        assert_eq!(c.feed("abc<th"), vec![Segment::visible("abc")]);
        assert_eq!(c.state().pending, "<th");
        assert_eq!(c.feed("ink>x"), vec![Segment::reasoning("x")]);
        assert!(c.state().pending.is_empty());
    }

    #[test]
    fn false_prefix_is_released() {
        let mut c = DeltaClassifier::think_tags();
        assert_eq!(c.feed("a <thin"), vec![Segment::visible("a ")]);
        assert_eq!(c.feed("g>"), vec![Segment::visible("<thing>")]);
    }

    #[test]
    fn markers_are_case_insensitive() {
        let mut c = DeltaClassifier::think_tags();
        let (visible, reasoning) = run(&mut c, &["<THINK>Hmm</Think>ok"]);
        assert_eq!(visible, "ok");
        assert_eq!(reasoning, "Hmm");
    }

    #[test]
    fn unterminated_reasoning_flushes_on_finish() {
        let mut c = DeltaClassifier::think_tags();
        let (visible, reasoning) = run(&mut c, &["<think>still thinking </th"]);
        assert_eq!(visible, "");
        assert_eq!(reasoning, "still thinking </th");
        assert!(c.in_reasoning());
    }

    #[test]
    fn trailing_partial_open_marker_is_visible_on_finish() {
        let mut c = DeltaClassifier::think_tags();
        let (visible, reasoning) = run(&mut c, &["price < 5 <"]);
        assert_eq!(visible, "price < 5 <");
        assert!(reasoning.is_empty());
    }

    #[test]
    fn empty_input_leaves_state_untouched() {
        let mut c = DeltaClassifier::think_tags();
        c.feed("<think>a</th");
        let before = c.state().clone();
        assert!(c.feed("").is_empty());
        assert_eq!(c.state(), &before);
    }

    #[test]
    fn custom_markers() {
        let mut c = DeltaClassifier::new("[[", "]]");
        let (visible, reasoning) = run(&mut c, &["x[", "[y]", "]z"]);
        assert_eq!(visible, "xz");
        assert_eq!(reasoning, "y");
    }

    #[test]
    fn empty_marker_never_matches() {
        let mut c = DeltaClassifier::new("", "</think>");
        assert_eq!(c.feed("<think>x"), vec![Segment::visible("<think>x")]);
    }

    #[test]
    fn multibyte_text_near_markers() {
        let mut c = DeltaClassifier::think_tags();
        let (visible, reasoning) = run(&mut c, &["héllo<think>思考", "</think>wörld 🎉"]);
        assert_eq!(visible, "héllowörld 🎉");
        assert_eq!(reasoning, "思考");
    }

    #[test]
    fn reset_returns_to_visible() {
        let mut c = DeltaClassifier::think_tags();
        c.feed("<think>abc<");
        c.reset();
        assert_eq!(c.state(), &ClassifierState::default());
        assert_eq!(c.feed("x"), vec![Segment::visible("x")]);
    }

    #[test]
    fn output_is_invariant_under_every_two_way_split() {
        let samples = [
            "A<think>B</think>C",
            "<think></think>",
            "no markers at all",
            "<think>r1</think>v1<THINK>r2</think>v2",
            "a<<think>>b</thin</think>c",
            "ünï<think>çødé</think>ß",
            "<think>open only",
            "</think> close first",
        ];

        for sample in samples {
            let expected = run(&mut DeltaClassifier::think_tags(), &[sample]);
            for (i, _) in sample.char_indices().skip(1) {
                let got = run(&mut DeltaClassifier::think_tags(), &[&sample[..i], &sample[i..]]);
                assert_eq!(got, expected, "sample {sample:?} split at {i}");
            }
        }
    }

    #[test]
    fn output_is_invariant_when_fed_char_by_char() {
        let sample = "x<think>reason ing</think>answer<think>more";
        let expected = run(&mut DeltaClassifier::think_tags(), &[sample]);
        let chars: Vec<String> = sample.chars().map(String::from).collect();
        let refs: Vec<&str> = chars.iter().map(String::as_str).collect();
        assert_eq!(run(&mut DeltaClassifier::think_tags(), &refs), expected);
    }
}
