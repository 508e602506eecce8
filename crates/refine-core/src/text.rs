//! Text utilities: document segmentation, CJK-aware length counting, and
//! UTF-8-safe truncation.

/// Sentence-ending punctuation recognized when splitting long paragraphs.
const SENTENCE_ENDINGS: [char; 7] = ['。', '！', '？', '；', '.', '!', '?'];

/// Split a document into ordered segments.
///
/// Paragraph boundaries (newlines) are the primary split points. Any
/// paragraph whose effective length (see [`text_length`]) exceeds
/// `max_chars` is further split on sentence-ending punctuation, with
/// sentences packed greedily into chunks of at most `max_chars`.
/// Whitespace-only pieces are dropped.
pub fn split_into_segments(text: &str, max_chars: usize) -> Vec<String> {
    let mut segments = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if text_length(line) <= max_chars {
            segments.push(line.to_string());
        } else {
            segments.extend(split_long_paragraph(line, max_chars));
        }
    }
    segments
}

fn split_long_paragraph(paragraph: &str, max_chars: usize) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in paragraph.chars() {
        current.push(ch);
        if SENTENCE_ENDINGS.contains(&ch) {
            sentences.push(std::mem::take(&mut current));
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current);
    }

    // Pack sentences greedily; a single oversized sentence stands alone.
    let mut chunks = Vec::new();
    let mut chunk = String::new();
    let mut chunk_len = 0usize;
    for sentence in sentences {
        let len = text_length(&sentence);
        if chunk_len > 0 && chunk_len + len > max_chars {
            chunks.push(std::mem::take(&mut chunk));
            chunk_len = 0;
        }
        chunk.push_str(&sentence);
        chunk_len += len;
    }
    if !chunk.trim().is_empty() {
        chunks.push(chunk);
    }
    chunks
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4e00}'..='\u{9fff}')
}

/// Effective text length for threshold decisions.
///
/// CJK text is measured by ideograph count; everything else by ASCII letter
/// count. Punctuation, digits, and whitespace never count, so a heading like
/// "1.2" or "第三章" is measured by its meaningful characters only.
pub fn text_length(s: &str) -> usize {
    let cjk = s.chars().filter(|c| is_cjk(*c)).count();
    if cjk > 0 {
        cjk
    } else {
        s.chars().filter(|c| c.is_ascii_alphabetic()).count()
    }
}

/// Truncate a string to at most `max_bytes` bytes at a char boundary.
///
/// Returns the longest prefix of `s` whose byte length is ≤ `max_bytes`
/// and that does not split a multi-byte character.
#[inline]
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    // `floor_char_boundary` is nightly-only, so implement it ourselves.
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncate `s` and append a suffix (e.g. `"..."`) if the original exceeds
/// `max_bytes`. The returned string is at most `max_bytes` bytes long
/// including the suffix.
pub fn truncate_with_suffix(s: &str, max_bytes: usize, suffix: &str) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let body_budget = max_bytes.saturating_sub(suffix.len());
    let prefix = truncate_str(s, body_budget);
    format!("{prefix}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── split_into_segments ──────────────────────────────────────────────

    #[test]
    fn splits_on_newlines() {
        let text = "first paragraph\nsecond paragraph\n\nthird";
        let segs = split_into_segments(text, 500);
        assert_eq!(segs, vec!["first paragraph", "second paragraph", "third"]);
    }

    #[test]
    fn drops_whitespace_only_lines() {
        let segs = split_into_segments("a\n   \n\t\nb", 500);
        assert_eq!(segs, vec!["a", "b"]);
    }

    #[test]
    fn short_paragraph_kept_whole() {
        let segs = split_into_segments("短段落。", 500);
        assert_eq!(segs, vec!["短段落。"]);
    }

    #[test]
    fn long_paragraph_split_on_sentence_endings() {
        let sentence = "这是一个句子。".repeat(20); // effective length 100
        let segs = split_into_segments(&sentence, 50);
        assert!(segs.len() > 1);
        for seg in &segs {
            assert!(text_length(seg) <= 50, "chunk too long: {seg}");
        }
        assert_eq!(segs.concat(), sentence);
    }

    #[test]
    fn punctuation_heavy_paragraph_measured_by_effective_length() {
        // 90 raw chars but only 60 ideographs; a raw character count would
        // split this at max_chars 70, the effective length keeps it whole.
        let paragraph = "你好。".repeat(30);
        let segs = split_into_segments(&paragraph, 70);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0], paragraph);
    }

    #[test]
    fn oversized_single_sentence_stands_alone() {
        let sentence = "字".repeat(120); // no terminator at all
        let segs = split_into_segments(&sentence, 50);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0], sentence);
    }

    #[test]
    fn ascii_sentences_packed() {
        let para = "One sentence here. Another one follows! A third? And a fourth.";
        let segs = split_into_segments(para, 40);
        assert!(segs.len() >= 2);
        for seg in &segs {
            assert!(text_length(seg) <= 40 || !seg.contains(' '));
        }
    }

    #[test]
    fn empty_input() {
        assert!(split_into_segments("", 500).is_empty());
        assert!(split_into_segments("\n\n\n", 500).is_empty());
    }

    #[test]
    fn order_preserved() {
        let text = "alpha\nbeta\ngamma";
        assert_eq!(split_into_segments(text, 500), vec!["alpha", "beta", "gamma"]);
    }

    // ── text_length ──────────────────────────────────────────────────────

    #[test]
    fn cjk_counted_when_present() {
        assert_eq!(text_length("这是中文"), 4);
        // Mixed: only ideographs count once any are present
        assert_eq!(text_length("第1章 Introduction"), 2);
    }

    #[test]
    fn ascii_letters_counted_otherwise() {
        assert_eq!(text_length("hello world"), 10);
        assert_eq!(text_length("1.2.3"), 0);
        assert_eq!(text_length("   "), 0);
    }

    // ── truncate_str ─────────────────────────────────────────────────────

    #[test]
    fn ascii_within_limit() {
        assert_eq!(truncate_str("hello", 10), "hello");
    }

    #[test]
    fn ascii_truncated() {
        assert_eq!(truncate_str("hello world", 5), "hello");
    }

    #[test]
    fn multibyte_boundary_snaps_back() {
        // '中' is 3 bytes
        let s = "ab中cd";
        assert_eq!(truncate_str(s, 3), "ab");
        assert_eq!(truncate_str(s, 4), "ab");
        assert_eq!(truncate_str(s, 5), "ab中");
    }

    #[test]
    fn zero_max() {
        assert_eq!(truncate_str("hello", 0), "");
    }

    // ── truncate_with_suffix ─────────────────────────────────────────────

    #[test]
    fn suffix_fits() {
        assert_eq!(truncate_with_suffix("hello", 10, "..."), "hello");
    }

    #[test]
    fn suffix_truncates_ascii() {
        assert_eq!(truncate_with_suffix("hello world", 8, "..."), "hello...");
    }

    #[test]
    fn suffix_truncates_at_multibyte_boundary() {
        let s = "中文内容很长";
        let result = truncate_with_suffix(s, 10, "...");
        assert!(result.len() <= 10);
        assert!(result.ends_with("..."));
    }
}
