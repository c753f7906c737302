//! Recursive character chunker with overlap.
//!
//! Text is split on the largest separator present (paragraph, line, sentence,
//! word, then single characters) until every piece fits `size`. Pieces are then
//! merged greedily into chunks; each chunk after the first starts with up to
//! `overlap` trailing characters of the previous one. Lengths are counted in
//! `char`s, never bytes.
//!
//! Dropping the first `overlap` characters of every chunk after the first and
//! concatenating reconstructs the input exactly.

use tracing::trace;

use crate::errors::RagError;
use crate::record::{Chunk, Document};

/// Separators tried in order; `""` means "split into characters".
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "! ", "? ", " ", ""];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

/// One chunk plus where it sits in the source text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Offset of the first character, in chars.
    pub start: usize,
    /// Characters shared with the previous chunk.
    pub overlap: usize,
    pub text: String,
}

/// Contiguous slice of the input that already fits the size limit.
#[derive(Clone, Copy, Debug)]
struct Piece {
    byte_start: usize,
    byte_end: usize,
    chars: usize,
}

#[derive(Clone, Copy, Debug)]
struct Open {
    byte_start: usize,
    byte_end: usize,
    char_start: usize,
    chars: usize,
    overlap: usize,
}

impl Chunker {
    /// # Errors
    /// [`RagError::Config`] unless `0 <= overlap < size`.
    pub fn new(size: usize, overlap: usize) -> Result<Self, RagError> {
        if size == 0 {
            return Err(RagError::Config("chunk size must be > 0".into()));
        }
        if overlap >= size {
            return Err(RagError::Config(format!(
                "chunk overlap ({overlap}) must be smaller than chunk size ({size})"
            )));
        }
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Chunk texts in order.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        self.split(text).into_iter().map(|s| s.text).collect()
    }

    /// Chunks of a document's overview, with per-chunk metadata.
    pub fn chunk_document(&self, doc: &Document) -> Vec<Chunk> {
        self.chunk(&doc.overview_text)
            .into_iter()
            .enumerate()
            .map(|(i, text)| Chunk {
                source_document_id: doc.id.clone(),
                chunk_index: i,
                text,
                metadata: doc.chunk_metadata(i),
            })
            .collect()
    }

    /// Chunks with their char offsets and overlap lengths.
    pub fn split(&self, text: &str) -> Vec<ChunkSpan> {
        if text.is_empty() {
            return Vec::new();
        }

        let mut pieces = Vec::new();
        self.split_recursive(text, 0, SEPARATORS, &mut pieces);

        let mut out: Vec<ChunkSpan> = Vec::new();
        let mut open: Option<Open> = None;
        let mut char_pos = 0usize;

        for p in pieces {
            open = Some(match open {
                None => Open {
                    byte_start: p.byte_start,
                    byte_end: p.byte_end,
                    char_start: char_pos,
                    chars: p.chars,
                    overlap: 0,
                },
                Some(mut cur) if cur.chars + p.chars <= self.size => {
                    cur.byte_end = p.byte_end;
                    cur.chars += p.chars;
                    cur
                }
                Some(cur) => {
                    out.push(span_of(text, &cur));
                    // never let the carried tail push the new chunk over `size`
                    let ov = self.overlap.min(cur.chars).min(self.size - p.chars);
                    let byte_start = tail_start(text, &cur, ov);
                    Open {
                        byte_start,
                        byte_end: p.byte_end,
                        char_start: char_pos - ov,
                        chars: ov + p.chars,
                        overlap: ov,
                    }
                }
            });
            char_pos += p.chars;
        }
        if let Some(cur) = open {
            out.push(span_of(text, &cur));
        }

        trace!(
            "chunker::split chars={} size={} overlap={} chunks={}",
            char_pos,
            self.size,
            self.overlap,
            out.len()
        );
        out
    }

    fn split_recursive(&self, text: &str, base: usize, seps: &[&str], out: &mut Vec<Piece>) {
        let chars = text.chars().count();
        if chars <= self.size {
            if chars > 0 {
                out.push(Piece {
                    byte_start: base,
                    byte_end: base + text.len(),
                    chars,
                });
            }
            return;
        }

        let found = seps
            .iter()
            .position(|s| s.is_empty() || text.contains(*s));
        let (sep, rest) = match found {
            Some(i) => (seps[i], &seps[i + 1..]),
            None => ("", &[][..]),
        };

        if sep.is_empty() {
            for (i, c) in text.char_indices() {
                out.push(Piece {
                    byte_start: base + i,
                    byte_end: base + i + c.len_utf8(),
                    chars: 1,
                });
            }
            return;
        }

        let mut offset = base;
        for seg in split_keeping_separator(text, sep) {
            self.split_recursive(seg, offset, rest, out);
            offset += seg.len();
        }
    }
}

fn span_of(text: &str, cur: &Open) -> ChunkSpan {
    ChunkSpan {
        start: cur.char_start,
        overlap: cur.overlap,
        text: text[cur.byte_start..cur.byte_end].to_string(),
    }
}

/// Byte offset where the last `n` chars of `cur` begin.
fn tail_start(text: &str, cur: &Open, n: usize) -> usize {
    if n == 0 {
        return cur.byte_end;
    }
    text[cur.byte_start..cur.byte_end]
        .char_indices()
        .rev()
        .nth(n - 1)
        .map(|(i, _)| cur.byte_start + i)
        .unwrap_or(cur.byte_start)
}

/// Splits on `separator`, keeping it attached to the preceding segment.
fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let mut result = Vec::new();
    let mut start = 0;

    while let Some(pos) = text[start..].find(separator) {
        let end = start + pos + separator.len();
        result.push(&text[start..end]);
        start = end;
    }

    if start < text.len() {
        result.push(&text[start..]);
    }

    result
}

/// Inverse of [`Chunker::split`]: drops each chunk's overlap and concatenates.
pub fn reconstruct(spans: &[ChunkSpan]) -> String {
    let mut s = String::new();
    for span in spans {
        s.extend(span.text.chars().skip(span.overlap));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlap_not_below_size() {
        assert!(Chunker::new(50, 50).is_err());
        assert!(Chunker::new(50, 60).is_err());
        assert!(Chunker::new(0, 0).is_err());
        assert!(Chunker::new(50, 49).is_ok());
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        let c = Chunker::new(50, 10).unwrap();
        assert!(c.chunk("").is_empty());
    }

    #[test]
    fn short_text_yields_one_chunk() {
        let c = Chunker::new(50, 0).unwrap();
        assert_eq!(
            c.chunk("The dark knight rises to fight crime"),
            vec!["The dark knight rises to fight crime".to_string()]
        );
    }

    #[test]
    fn unbroken_text_120_chars() {
        let text = "abcdefghij".repeat(12);
        let c = Chunker::new(50, 10).unwrap();
        let spans = c.split(&text);
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].text, text[0..50]);
        assert_eq!(spans[1].text, text[40..90]);
        assert_eq!(spans[2].text, text[80..120]);
        let tail0: String = spans[0].text.chars().skip(40).collect();
        assert!(spans[1].text.starts_with(&tail0));
        assert_eq!(reconstruct(&spans), text);
    }

    #[test]
    fn prefers_sentence_boundaries() {
        let text = "Neo meets Morpheus. Trinity fights agents. Zion waits.";
        let c = Chunker::new(25, 0).unwrap();
        assert_eq!(
            c.chunk(text),
            vec!["Neo meets Morpheus. ", "Trinity fights agents. ", "Zion waits."]
        );
    }

    #[test]
    fn counts_chars_not_bytes() {
        let text = "é".repeat(30);
        let c = Chunker::new(10, 2).unwrap();
        let spans = c.split(&text);
        assert!(spans.iter().all(|s| s.text.chars().count() <= 10));
        assert_eq!(reconstruct(&spans), text);
    }

    #[test]
    fn deterministic() {
        let text = "Paragraph one is here.\n\nParagraph two, a little longer than one.";
        let c = Chunker::new(30, 5).unwrap();
        assert_eq!(c.split(text), c.split(text));
    }

    #[test]
    fn document_chunks_carry_index_metadata() {
        let doc = Document::new("7", "Se7en", "word ".repeat(30));
        let c = Chunker::new(40, 5).unwrap();
        let chunks = c.chunk_document(&doc);
        assert!(chunks.len() > 1);
        for (i, ch) in chunks.iter().enumerate() {
            assert_eq!(ch.chunk_index, i);
            assert_eq!(ch.metadata["chunk"], serde_json::json!(i));
            assert_eq!(ch.metadata["documentId"], serde_json::json!("7"));
        }
    }
}
