//! Byte-bounded text chunker.
//!
//! Splits document text into ordered, non-empty chunks that respect a
//! target byte size. Splitting happens on paragraph boundaries first; a
//! paragraph larger than the target falls back to sentence boundaries
//! (terminal punctuation followed by whitespace), packing sentences
//! greedily. A single sentence longer than the target is emitted whole —
//! meaning is preserved over strict size bounds, never truncated.
//!
//! Paragraph and sentence spans keep their separators, so concatenating
//! the produced chunks (minus any configured overlap) reconstructs the
//! input byte-for-byte.

use crate::models::Chunk;

/// Split `text` into chunks for `document_id` with contiguous 0-based
/// ordinals. Whitespace-only input produces no chunks.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    target_bytes: usize,
    overlap_bytes: usize,
) -> Vec<Chunk> {
    split_text(text, target_bytes, overlap_bytes)
        .into_iter()
        .enumerate()
        .map(|(ordinal, text)| Chunk {
            document_id: document_id.to_string(),
            ordinal,
            text,
        })
        .collect()
}

/// Core splitter. Returns chunk texts in document order.
///
/// When `overlap_bytes > 0`, every chunk after the first is prefixed with
/// the last `overlap_bytes` bytes (snapped to a char boundary) of the
/// previous chunk's fresh content.
pub fn split_text(text: &str, target_bytes: usize, overlap_bytes: usize) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut segments: Vec<String> = Vec::new();
    let mut current = String::new();

    for para in text.split_inclusive("\n\n") {
        if para.len() > target_bytes {
            // Oversized paragraph: flush, then pack its sentences.
            flush(&mut segments, &mut current);
            for sentence in split_sentences(para) {
                if !current.is_empty() && current.len() + sentence.len() > target_bytes {
                    flush(&mut segments, &mut current);
                }
                current.push_str(sentence);
            }
        } else {
            if !current.is_empty() && current.len() + para.len() > target_bytes {
                flush(&mut segments, &mut current);
            }
            current.push_str(para);
        }
    }
    flush(&mut segments, &mut current);

    if overlap_bytes == 0 {
        return segments;
    }

    let mut out = Vec::with_capacity(segments.len());
    for (i, seg) in segments.iter().enumerate() {
        if i == 0 {
            out.push(seg.clone());
        } else {
            let prev = &segments[i - 1];
            let prefix = suffix_on_char_boundary(prev, overlap_bytes);
            out.push(format!("{}{}", prefix, seg));
        }
    }
    out
}

fn flush(segments: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        segments.push(std::mem::take(current));
    }
}

/// Split on sentence boundaries: a run of terminal punctuation (`.`, `!`,
/// `?`) followed by whitespace ends a sentence, and the whitespace stays
/// with the preceding span so concatenation reconstructs the input.
fn split_sentences(s: &str) -> Vec<&str> {
    let bytes = s.as_bytes();
    let mut spans = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if matches!(bytes[i], b'.' | b'!' | b'?') {
            let mut j = i + 1;
            while j < bytes.len() && matches!(bytes[j], b'.' | b'!' | b'?') {
                j += 1;
            }
            if j >= bytes.len() || bytes[j].is_ascii_whitespace() {
                while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                    j += 1;
                }
                spans.push(&s[start..j]);
                start = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }

    if start < s.len() {
        spans.push(&s[start..]);
    }
    spans
}

/// The last `max` bytes of `s`, snapped forward to a char boundary.
fn suffix_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
