/// Word-boundary transcript chunker with character-budget windows.
///
/// Chunks never split words. Consecutive chunks share roughly
/// `chunk_overlap` characters of trailing context so a sentence cut at a
/// window edge is still retrievable from the neighboring chunk.
pub struct TranscriptChunker {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for TranscriptChunker {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

impl TranscriptChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        // Overlap must leave forward progress
        let chunk_overlap = chunk_overlap.min(chunk_size.saturating_sub(1));
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap,
        }
    }

    pub fn chunk(&self, text: &str) -> Vec<String> {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return Vec::new();
        }
        let mut chunks = Vec::new();
        let mut start = 0usize;
        while start < words.len() {
            let mut end = start;
            let mut len = 0usize;
            while end < words.len() {
                let add = words[end].len() + usize::from(len > 0);
                if len + add > self.chunk_size && len > 0 {
                    break;
                }
                len += add;
                end += 1;
            }
            chunks.push(words[start..end].join(" "));
            if end >= words.len() {
                break;
            }
            // Back up enough words to cover the overlap budget
            let mut overlap_len = 0usize;
            let mut next_start = end;
            while next_start > start + 1 && overlap_len < self.chunk_overlap {
                next_start -= 1;
                overlap_len += words[next_start].len() + 1;
            }
            start = next_start;
        }
        chunks
    }
}
