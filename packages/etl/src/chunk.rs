//! Text chunking for embedding.
//!
//! Pure functions with no side effects: text in, ordered chunks out.
//! Splits greedily on the first separator that produces a chunk under the
//! size limit, carries a trailing overlap into the next chunk, and snaps
//! chunk starts to word boundaries so no chunk begins mid-word.

/// Configuration for [`chunk_text`].
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Maximum chunk size in bytes
    pub size: usize,
    /// Trailing bytes of each chunk repeated at the start of the next
    pub overlap: usize,
    /// Separators tried in order when looking for a split point
    pub separators: Vec<String>,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size: 1000,
            overlap: 100,
            separators: vec![
                "\n\n".to_string(),
                "\n".to_string(),
                ". ".to_string(),
                " ".to_string(),
            ],
        }
    }
}

impl ChunkConfig {
    /// Set the chunk size.
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    /// Set the overlap.
    pub fn with_overlap(mut self, overlap: usize) -> Self {
        self.overlap = overlap;
        self
    }
}

/// Split text into ordered chunks.
///
/// Every chunk is non-empty and at most `config.size` bytes; the last chunk
/// may be under-size. Empty or whitespace-only input yields no chunks.
pub fn chunk_text(text: &str, config: &ChunkConfig) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= config.size {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let remaining = &text[start..];
        if remaining.len() <= config.size {
            let piece = remaining.trim();
            if !piece.is_empty() {
                chunks.push(piece.to_string());
            }
            break;
        }

        let window_end = floor_char_boundary(remaining, config.size);
        let cut = find_cut(remaining, window_end, &config.separators);

        let piece = remaining[..cut].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }

        // Carry a trailing overlap into the next chunk, but never start
        // mid-word: snap forward to the next word start, falling back to a
        // clean cut when the overlap region has no boundary.
        let mut next = floor_char_boundary(remaining, cut.saturating_sub(config.overlap));
        if next > 0 {
            next = snap_to_word_start(remaining, next, cut);
        }
        if next == 0 {
            next = cut;
        }
        start += next;
    }

    chunks
}

/// Find the split point within `window_end` bytes: the last occurrence of
/// the first separator present, or a hard cut when none matches.
fn find_cut(remaining: &str, window_end: usize, separators: &[String]) -> usize {
    for sep in separators {
        if let Some(pos) = remaining[..window_end].rfind(sep.as_str()) {
            if pos > 0 {
                return pos + sep.len();
            }
        }
    }
    // No separator in the window: cut at the limit, keeping at least one char
    window_end.max(ceil_char_boundary(remaining, 1))
}

/// Advance `candidate` to the start of the next word unless it already sits
/// on one. Returns `limit` when no word boundary exists before it.
fn snap_to_word_start(s: &str, candidate: usize, limit: usize) -> usize {
    let prev_is_boundary = s[..candidate]
        .chars()
        .next_back()
        .map_or(true, |c| c.is_whitespace());
    if prev_is_boundary {
        return candidate;
    }
    match s[candidate..limit].find(char::is_whitespace) {
        Some(offset) => {
            let after_word = candidate + offset;
            let rest = &s[after_word..limit];
            after_word + (rest.len() - rest.trim_start().len())
        }
        None => limit,
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index.min(s.len())
}
