use crate::config::PipelineConfig;
use crate::error::IngestError;
use crate::models::Chunk;
use crate::parser::PageText;
use regex::Regex;

/// Inserted between the texts of consecutive non-empty pages.
pub const PAGE_SEPARATOR: &str = "\n\n";

/// Preferred break points, strongest first.
const BREAKS: [&str; 4] = ["\n\n", "\n", ". ", " "];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl From<&PipelineConfig> for ChunkingConfig {
    fn from(value: &PipelineConfig) -> Self {
        Self {
            chunk_size: value.chunk_size,
            overlap: value.chunk_overlap,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::Configuration(
                "chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(IngestError::Configuration(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    /// How far back from the window edge a break point may be taken.
    ///
    /// Always smaller than `chunk_size - overlap`, so every window advances.
    fn lookback(&self) -> usize {
        (self.chunk_size / 10).min((self.chunk_size - self.overlap) / 2)
    }
}

struct TextNormalizer {
    horizontal: Regex,
    blank_lines: Regex,
}

impl TextNormalizer {
    fn new() -> Result<Self, IngestError> {
        Ok(Self {
            horizontal: Regex::new(r"[ \t\u{a0}\u{feff}]+")?,
            blank_lines: Regex::new(r"\n{3,}")?,
        })
    }

    fn normalize(&self, text: &str) -> String {
        let unified = text.replace("\r\n", "\n").replace('\r', "\n");
        let collapsed = self.horizontal.replace_all(&unified, " ");
        let trimmed_lines = collapsed
            .lines()
            .map(str::trim)
            .collect::<Vec<_>>()
            .join("\n");
        self.blank_lines
            .replace_all(&trimmed_lines, PAGE_SEPARATOR)
            .trim()
            .to_string()
    }
}

/// Collapses runs of spaces and tabs, trims lines and squeezes blank-line runs
/// down to a single paragraph break.
pub fn normalize_page_text(text: &str) -> Result<String, IngestError> {
    Ok(TextNormalizer::new()?.normalize(text))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageSpan {
    number: u32,
    start: usize,
    end: usize,
}

/// The document text the chunker windows over, with per-page character spans.
#[derive(Debug, Clone)]
pub struct PreparedText {
    chars: Vec<char>,
    spans: Vec<PageSpan>,
}

impl PreparedText {
    pub fn from_pages(pages: &[PageText]) -> Result<Self, IngestError> {
        let normalizer = TextNormalizer::new()?;
        let mut chars = Vec::new();
        let mut spans = Vec::new();

        for page in pages {
            let normalized = normalizer.normalize(&page.text);
            if normalized.is_empty() {
                continue;
            }
            if !chars.is_empty() {
                chars.extend(PAGE_SEPARATOR.chars());
            }
            let start = chars.len();
            chars.extend(normalized.chars());
            spans.push(PageSpan {
                number: page.number,
                start,
                end: chars.len(),
            });
        }

        Ok(Self { chars, spans })
    }

    pub fn text(&self) -> String {
        self.chars.iter().collect()
    }

    pub fn char_len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    fn pages_touching(&self, start: usize, end: usize) -> Vec<u32> {
        let touching: Vec<u32> = self
            .spans
            .iter()
            .filter(|span| span.start < end && span.end > start)
            .map(|span| span.number)
            .collect();

        if !touching.is_empty() {
            return touching;
        }

        // Only separator characters: attribute to the page before them.
        self.spans
            .iter()
            .rev()
            .find(|span| span.start <= start)
            .map(|span| vec![span.number])
            .unwrap_or_default()
    }

    /// First page that starts strictly after `position`.
    fn next_page_start(&self, position: usize) -> Option<usize> {
        self.spans
            .iter()
            .map(|span| span.start)
            .find(|&start| start > position)
    }

    fn find_break(&self, start: usize, hard_end: usize, lookback: usize) -> usize {
        let floor = hard_end - lookback;
        for separator in BREAKS {
            let separator: Vec<char> = separator.chars().collect();
            let lower = floor.max(start + separator.len());
            if lower > hard_end {
                continue;
            }
            let found = (lower..=hard_end)
                .rev()
                .find(|&end| self.chars[end - separator.len()..end] == separator[..]);
            if let Some(end) = found {
                return end;
            }
        }
        hard_end
    }
}

/// Splits ordered pages into overlapping chunks.
///
/// Every chunk is an exact slice of [`PreparedText::text`]; consecutive chunks
/// share exactly `overlap` characters and sequence indexes start at 0 with no gaps.
/// A window never runs past the start of the next page: that page's first chunk
/// begins `overlap` characters before it, so its windows do not depend on the
/// length of earlier pages.
pub fn chunk_pages(
    document_id: &str,
    pages: &[PageText],
    config: ChunkingConfig,
) -> Result<Vec<Chunk>, IngestError> {
    config.validate()?;
    let prepared = PreparedText::from_pages(pages)?;
    Ok(chunk_prepared(document_id, &prepared, config))
}

pub fn chunk_prepared(
    document_id: &str,
    prepared: &PreparedText,
    config: ChunkingConfig,
) -> Vec<Chunk> {
    let total = prepared.char_len();
    let lookback = config.lookback();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < total {
        let hard_end = start + config.chunk_size;
        let next_page = prepared.next_page_start(start + config.overlap);
        let end = match next_page {
            Some(page_start) if hard_end >= page_start => page_start,
            _ if hard_end >= total => total,
            _ => prepared.find_break(start, hard_end, lookback),
        };

        let text: String = prepared.chars[start..end].iter().collect();
        chunks.push(Chunk {
            document_id: document_id.to_string(),
            sequence_index: chunks.len() as u64,
            page_numbers: prepared.pages_touching(start, end),
            start_char: start,
            end_char: end,
            char_len: end - start,
            text,
        });

        if end == total {
            break;
        }
        start = end - config.overlap;
    }

    chunks
}
