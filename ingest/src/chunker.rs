//! Recursive, structure-preserving text chunker.
//!
//! Splits on a separator ladder (paragraph breaks first, then lines, CJK and
//! Latin sentence terminators, commas, spaces, characters) targeting
//! `chunk_size` characters with `chunk_overlap` characters carried from each
//! chunk into the next, snapped to a sentence boundary. Protected regions
//! (fenced code, markdown tables, LaTeX math, image references) are never
//! split, even when larger than `max_chunk_size`.

use once_cell::sync::Lazy;
use regex::Regex;

use corpora_config::ChunkingConfig;
use corpora_models::chunk::ChunkType;

#[derive(Debug, Clone, Copy)]
pub struct ChunkerSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub max_chunk_size: usize,
}

impl Default for ChunkerSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            max_chunk_size: 2000,
        }
    }
}

impl From<&ChunkingConfig> for ChunkerSettings {
    fn from(config: &ChunkingConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            max_chunk_size: config.max_chunk_size,
        }
    }
}

/// One produced chunk: byte span in the source text plus its content copy.
#[derive(Debug, Clone)]
pub struct ChunkSpan {
    pub start: usize,
    pub end: usize,
    pub content: String,
    pub chunk_type: ChunkType,
}

/// Separator ladder, tried in priority order. Every entry of one level is
/// treated as equivalent; the split lands after the separator.
const LEVELS: &[&[&str]] = &[
    &["\n\n\n"],
    &["\n\n"],
    &["\n"],
    &["\u{3002}", "\u{FF01}", "\u{FF1F}", "\u{FF1B}"], // 。！？；
    &[".", "!", "?", ";"],
    &[",", "\u{FF0C}"], // , ，
    &[" "],
];

const SENTENCE_TERMINATORS: [char; 8] =
    ['.', '!', '?', ';', '\u{3002}', '\u{FF01}', '\u{FF1F}', '\u{FF1B}'];

static FENCED_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static LATEX_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\$\$.*?\$\$").unwrap());
static LATEX_INLINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$[^$\n]+\$").unwrap());
static IMAGE_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());

/// Byte intervals that must not be split, sorted and merged.
fn protected_intervals(text: &str) -> Vec<(usize, usize)> {
    let mut intervals: Vec<(usize, usize)> = Vec::new();

    for pattern in [&*FENCED_CODE, &*LATEX_BLOCK, &*IMAGE_REF] {
        for m in pattern.find_iter(text) {
            intervals.push((m.start(), m.end()));
        }
    }
    // Inline math only outside already-protected spans (a $ inside a code
    // fence is not math).
    for m in LATEX_INLINE.find_iter(text) {
        let covered = intervals
            .iter()
            .any(|&(s, e)| m.start() >= s && m.end() <= e);
        if !covered {
            intervals.push((m.start(), m.end()));
        }
    }

    // Markdown tables: runs of two or more consecutive lines starting with |.
    let mut line_start = 0;
    let mut table_start: Option<usize> = None;
    let mut table_lines = 0;
    let mut push_table = |start: Option<usize>, end: usize, lines: usize, out: &mut Vec<(usize, usize)>| {
        if let Some(s) = start {
            if lines >= 2 {
                out.push((s, end));
            }
        }
    };
    for line in text.split_inclusive('\n') {
        let line_end = line_start + line.len();
        if line.trim_start().starts_with('|') {
            if table_start.is_none() {
                table_start = Some(line_start);
                table_lines = 0;
            }
            table_lines += 1;
        } else {
            push_table(table_start.take(), line_start, table_lines, &mut intervals);
        }
        line_start = line_end;
    }
    push_table(table_start.take(), text.len(), table_lines, &mut intervals);

    intervals.sort_unstable();
    // Merge overlaps.
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (start, end) in intervals {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// A split at byte position `pos` would cut a protected region open.
fn inside_protected(pos: usize, intervals: &[(usize, usize)]) -> bool {
    intervals.iter().any(|&(s, e)| pos > s && pos < e)
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Candidate split positions (byte offsets, exclusive of range ends) for one
/// separator level inside `range`.
fn split_positions(
    text: &str,
    range: (usize, usize),
    separators: &[&str],
    intervals: &[(usize, usize)],
) -> Vec<usize> {
    let slice = &text[range.0..range.1];
    let mut positions: Vec<usize> = Vec::new();
    for separator in separators {
        for (offset, matched) in slice.match_indices(separator) {
            let position = range.0 + offset + matched.len();
            if position > range.0 && position < range.1 && !inside_protected(position, intervals) {
                positions.push(position);
            }
        }
    }
    positions.sort_unstable();
    positions.dedup();
    positions
}

/// Character-level fallback: fixed-size splits on char boundaries, jumping
/// over protected regions so they stay whole.
fn char_split(
    text: &str,
    range: (usize, usize),
    intervals: &[(usize, usize)],
    settings: &ChunkerSettings,
    out: &mut Vec<(usize, usize)>,
) {
    let mut start = range.0;
    let mut count = 0;
    for (offset, _) in text[range.0..range.1].char_indices() {
        let position = range.0 + offset;
        if position == start {
            continue;
        }
        count += 1;
        if count >= settings.chunk_size && !inside_protected(position, intervals) {
            out.push((start, position));
            start = position;
            count = 0;
        }
    }
    if start < range.1 {
        out.push((start, range.1));
    }
}

fn split_recursive(
    text: &str,
    range: (usize, usize),
    level: usize,
    intervals: &[(usize, usize)],
    settings: &ChunkerSettings,
    out: &mut Vec<(usize, usize)>,
) {
    if range.0 >= range.1 {
        return;
    }
    if char_len(&text[range.0..range.1]) <= settings.chunk_size {
        out.push(range);
        return;
    }
    if level >= LEVELS.len() {
        char_split(text, range, intervals, settings, out);
        return;
    }

    let positions = split_positions(text, range, LEVELS[level], intervals);
    if positions.is_empty() {
        split_recursive(text, range, level + 1, intervals, settings, out);
        return;
    }

    let mut previous = range.0;
    for position in positions.into_iter().chain(std::iter::once(range.1)) {
        if position <= previous {
            continue;
        }
        let piece = (previous, position);
        if char_len(&text[piece.0..piece.1]) <= settings.chunk_size {
            out.push(piece);
        } else {
            split_recursive(text, piece, level + 1, intervals, settings, out);
        }
        previous = position;
    }
}

/// Where the next chunk should start so that roughly `chunk_overlap` chars
/// are carried over, snapped to the sentence boundary nearest the window
/// start and never inside a protected region.
fn overlap_start(
    text: &str,
    chunk_start: usize,
    chunk_end: usize,
    intervals: &[(usize, usize)],
    settings: &ChunkerSettings,
) -> usize {
    if settings.chunk_overlap == 0 {
        return chunk_end;
    }

    // Walk back chunk_overlap chars from the end, staying on a boundary.
    let mut desired = chunk_end;
    let mut walked = 0;
    for (offset, _) in text[chunk_start..chunk_end].char_indices().rev() {
        desired = chunk_start + offset;
        walked += 1;
        if walked >= settings.chunk_overlap {
            break;
        }
    }
    if desired <= chunk_start {
        return chunk_end.min(chunk_start.max(desired));
    }

    // Snap forward to just after the first sentence terminator in the window.
    let window = &text[desired..chunk_end];
    for (offset, c) in window.char_indices() {
        if SENTENCE_TERMINATORS.contains(&c) {
            let mut boundary = desired + offset + c.len_utf8();
            // Skip the space following a Latin terminator.
            if let Some(next) = text[boundary..chunk_end].chars().next() {
                if next == ' ' {
                    boundary += 1;
                }
            }
            if boundary < chunk_end && !inside_protected(boundary, intervals) {
                return boundary;
            }
        }
    }

    if inside_protected(desired, intervals) {
        // Do not resurrect half a protected region; start clean after it.
        let containing = intervals.iter().find(|&&(s, e)| desired > s && desired < e);
        if let Some(&(_, e)) = containing {
            return e.min(chunk_end);
        }
    }
    desired
}

/// Pack pieces into chunks of at most `chunk_size` chars (oversized protected
/// pieces stay whole) and thread the overlap between consecutive chunks.
fn assemble(
    text: &str,
    pieces: &[(usize, usize)],
    intervals: &[(usize, usize)],
    settings: &ChunkerSettings,
) -> Vec<ChunkSpan> {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut current_start = match pieces.first() {
        Some(piece) => piece.0,
        None => return Vec::new(),
    };
    let mut current_end = current_start;

    for &(_, piece_end) in pieces {
        let prospective = char_len(&text[current_start..piece_end]);
        if current_end > current_start && prospective > settings.chunk_size {
            spans.push((current_start, current_end));
            current_start =
                overlap_start(text, current_start, current_end, intervals, settings);
        }
        current_end = piece_end;
    }
    if current_end > current_start {
        spans.push((current_start, current_end));
    }

    spans
        .into_iter()
        .filter(|&(s, e)| !text[s..e].trim().is_empty())
        .map(|(start, end)| {
            let content = text[start..end].to_string();
            let chunk_type = detect_chunk_type(&content);
            ChunkSpan {
                start,
                end,
                content,
                chunk_type,
            }
        })
        .collect()
}

/// Content-shape heuristics for the chunk type tag.
pub fn detect_chunk_type(content: &str) -> ChunkType {
    let trimmed = content.trim_start();
    if trimmed.contains("```")
        || trimmed.contains("fn ")
        || trimmed.contains("def ")
        || trimmed.contains("class ")
        || trimmed.contains("SELECT ")
        || trimmed.contains("import ")
    {
        return ChunkType::Code;
    }
    if content.matches('|').count() > 4 && content.contains('\n') {
        return ChunkType::Table;
    }
    if trimmed.starts_with("![") || trimmed.contains("<img") {
        return ChunkType::ImageCaption;
    }
    ChunkType::Text
}

/// Chunk a parsed document's text.
pub fn chunk_text(text: &str, settings: &ChunkerSettings) -> Vec<ChunkSpan> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let intervals = protected_intervals(text);
    let mut pieces = Vec::new();
    split_recursive(text, (0, text.len()), 0, &intervals, settings, &mut pieces);
    assemble(text, &pieces, &intervals, settings)
}
