//! Transcript chunking: bounded overlapping windows over long text.
//!
//! Deterministic and pure. Windows overlap so sentence fragments cut at a
//! boundary still appear whole in one of the neighboring segments; counts are
//! in characters, not bytes, since transcripts are frequently non-ASCII.

/// Characters per summarization segment
pub const DEFAULT_TARGET_CHARS: usize = 4000;

/// Characters shared between consecutive segments
pub const DEFAULT_OVERLAP_CHARS: usize = 300;

/// Split `text` into overlapping segments of at most `target_chars`.
///
/// Returns the whole text as a single segment when it fits; otherwise windows
/// advance by `target_chars - overlap_chars` each step. Segments are
/// whitespace-trimmed and empty slices are dropped.
pub fn chunk(text: &str, target_chars: usize, overlap_chars: usize) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() <= target_chars {
        return vec![trimmed.to_string()];
    }

    let step = target_chars.saturating_sub(overlap_chars).max(1);
    let mut segments = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + target_chars).min(chars.len());
        let slice: String = chars[start..end].iter().collect();
        let slice = slice.trim();
        if !slice.is_empty() {
            segments.push(slice.to_string());
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }

    segments
}
