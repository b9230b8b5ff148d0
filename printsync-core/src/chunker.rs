//! Page-range chunking: partitions a multi-part page selection into
//! printer-submittable units that are homogeneous in physical media.
//!
//! Selections address 1-based page numbers over the concatenation of all
//! parts, in part order. `"4-5,16-"` over parts of 5/10/5 pages selects
//! pages 4-5 of part 0 and all of part 2. A chunk may span part boundaries
//! as long as the media format stays the same; any mismatch starts a new
//! chunk.

use crate::contract::DocumentPart;
use crate::error::{EngineError, Result};

/// A span of pages inside one part, in the part's local 1-based numbering.
/// `begin` and `end` are both inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSpan {
    pub part: usize,
    pub begin: u32,
    pub end: u32,
}

impl PageSpan {
    pub fn pages(&self) -> u32 {
        self.end - self.begin + 1
    }
}

/// A maximal run of selected pages sharing one media format - the unit
/// submitted to the print backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub media: String,
    pub spans: Vec<PageSpan>,
}

impl Chunk {
    pub fn pages(&self) -> u32 {
        self.spans.iter().map(PageSpan::pages).sum()
    }
}

/// Parse a selection expression into ordered, disjoint global page ranges
/// (inclusive, 1-based). A blank expression selects every page; over zero
/// pages that is the empty selection.
///
/// Accepted terms, comma-separated: `"7"`, `"4-5"`, `"16-"` (to the end).
/// Terms must be ascending and non-overlapping.
pub fn parse_selection(expr: &str, total_pages: u32) -> Result<Vec<(u32, u32)>> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(if total_pages == 0 {
            Vec::new()
        } else {
            vec![(1, total_pages)]
        });
    }

    let malformed = |term: &str| {
        EngineError::Content(format!("malformed page selection term {term:?} in {expr:?}"))
    };

    let mut ranges = Vec::new();
    let mut previous_end = 0u32;
    for term in expr.split(',') {
        let term = term.trim();
        let (begin, end) = match term.split_once('-') {
            None => {
                let page: u32 = term.parse().map_err(|_| malformed(term))?;
                (page, page)
            }
            Some((begin, "")) => {
                let begin: u32 = begin.trim().parse().map_err(|_| malformed(term))?;
                (begin, total_pages)
            }
            Some((begin, end)) => {
                let begin: u32 = begin.trim().parse().map_err(|_| malformed(term))?;
                let end: u32 = end.trim().parse().map_err(|_| malformed(term))?;
                (begin, end)
            }
        };
        if begin == 0 || end < begin {
            return Err(malformed(term));
        }
        if end > total_pages {
            return Err(EngineError::Content(format!(
                "selection term {term:?} exceeds the document's {total_pages} pages"
            )));
        }
        if begin <= previous_end {
            return Err(EngineError::Content(format!(
                "selection terms must be ascending and disjoint: {term:?} in {expr:?}"
            )));
        }
        previous_end = end;
        ranges.push((begin, end));
    }
    Ok(ranges)
}

/// Partition a page selection over `parts` into media-homogeneous chunks.
///
/// Walking the selection in part order, a range is appended to the current
/// chunk exactly when its media format equals the chunk's, regardless of
/// which part it comes from. Concatenating every chunk's spans in order
/// reproduces the input selection with no gaps or overlaps. An empty
/// selection yields an empty chunk list.
pub fn chunk_selection(parts: &[DocumentPart], expr: &str) -> Result<Vec<Chunk>> {
    let total_pages: u32 = parts.iter().map(|p| p.pages).sum();
    let ranges = parse_selection(expr, total_pages)?;

    let mut chunks: Vec<Chunk> = Vec::new();
    for (begin, end) in ranges {
        for span in split_to_parts(parts, begin, end) {
            let media = &parts[span.part].media;
            match chunks.last_mut() {
                Some(chunk) if chunk.media == *media => chunk.spans.push(span),
                _ => chunks.push(Chunk {
                    media: media.clone(),
                    spans: vec![span],
                }),
            }
        }
    }
    Ok(chunks)
}

/// Map a chunk's local spans back to global page ranges over the
/// concatenated parts, merging adjacent spans. This is what the print
/// backend consumes as its page list.
pub fn global_ranges(parts: &[DocumentPart], chunk: &Chunk) -> Vec<(u32, u32)> {
    let mut offsets = Vec::with_capacity(parts.len());
    let mut offset = 0u32;
    for part in parts {
        offsets.push(offset);
        offset += part.pages;
    }

    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for span in &chunk.spans {
        let begin = offsets[span.part] + span.begin;
        let end = offsets[span.part] + span.end;
        match ranges.last_mut() {
            Some(last) if last.1 + 1 == begin => last.1 = end,
            _ => ranges.push((begin, end)),
        }
    }
    ranges
}

/// Split one global page range at part boundaries, yielding local spans in
/// visiting order. `parse_selection` already guarantees the range is inside
/// the document.
fn split_to_parts(parts: &[DocumentPart], begin: u32, end: u32) -> Vec<PageSpan> {
    let mut spans = Vec::new();
    let mut offset = 0u32;
    for (index, part) in parts.iter().enumerate() {
        if part.pages == 0 {
            continue;
        }
        let part_begin = offset + 1;
        let part_end = offset + part.pages;
        offset = part_end;
        if end < part_begin || begin > part_end {
            continue;
        }
        spans.push(PageSpan {
            part: index,
            begin: begin.max(part_begin) - part_begin + 1,
            end: end.min(part_end) - part_begin + 1,
        });
    }
    spans
}
