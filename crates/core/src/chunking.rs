use crate::config::ChunkingSettings;
use crate::error::PipelineError;
use regex::Regex;
use serde_json::{Map, Value};

pub const CHUNK_METHOD: &str = "sliding_window_logical";

/// Abbreviations protected from sentence splitting. Order is fixed so the
/// placeholder substitution is deterministic.
const ABBREVIATIONS: [&str; 12] = [
    "Dr.", "Mr.", "Mrs.", "Ms.", "Prof.", "Inc.", "Corp.", "Ltd.", "etc.", "vs.", "e.g.", "i.e.",
];

/// Sentences shorter than this many characters are treated as noise.
const MIN_SENTENCE_CHARS: usize = 10;

#[derive(Debug, Clone)]
pub struct TextChunk {
    pub content: String,
    pub index: usize,
    pub word_count: usize,
    pub char_count: usize,
    pub token_count: usize,
    pub file_type: String,
}

impl TextChunk {
    /// Chunk metadata in the shape stored alongside each vector entry.
    pub fn metadata(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("file_type".into(), Value::String(self.file_type.clone()));
        map.insert("word_count".into(), Value::from(self.word_count));
        map.insert("char_count".into(), Value::from(self.char_count));
        map.insert("token_count".into(), Value::from(self.token_count));
        map.insert("chunk_method".into(), Value::String(CHUNK_METHOD.into()));
        map
    }
}

/// Sentence-aligned sliding-window chunker. Budgets are whitespace word
/// counts, the token proxy used throughout the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_tokens: usize,
    overlap_tokens: usize,
}

impl Chunker {
    pub fn new(settings: ChunkingSettings) -> Self {
        Self {
            max_tokens: settings.max_tokens,
            overlap_tokens: settings.overlap_tokens,
        }
    }

    pub fn chunk(&self, text: &str, file_type: &str) -> Result<Vec<TextChunk>, PipelineError> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let sentences = split_into_sentences(text)?;

        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0usize;
        let mut chunk_index = 0usize;

        for sentence in sentences {
            let sentence_tokens = sentence.split_whitespace().count();

            if current_tokens + sentence_tokens > self.max_tokens && !current.is_empty() {
                chunks.push(make_chunk(current.trim(), chunk_index, file_type));

                if self.overlap_tokens > 0 {
                    // Seed the next chunk with the tail of the emitted one so
                    // neighbouring chunks share context.
                    let overlap = last_words(&current, self.overlap_tokens);
                    current = format!("{overlap} {sentence}");
                    current_tokens = current.split_whitespace().count();
                } else {
                    current_tokens = sentence_tokens;
                    current = sentence;
                }

                chunk_index += 1;
            } else {
                if current.is_empty() {
                    current = sentence;
                } else {
                    current.push(' ');
                    current.push_str(&sentence);
                }
                current_tokens = current.split_whitespace().count();
            }
        }

        if !current.trim().is_empty() {
            chunks.push(make_chunk(current.trim(), chunk_index, file_type));
        }

        Ok(chunks)
    }
}

fn make_chunk(content: &str, index: usize, file_type: &str) -> TextChunk {
    let word_count = content.split_whitespace().count();
    TextChunk {
        content: content.to_string(),
        index,
        word_count,
        char_count: content.chars().count(),
        token_count: word_count,
        file_type: file_type.to_string(),
    }
}

/// Split text on sentence terminators, protecting known abbreviations and
/// dropping fragments of [`MIN_SENTENCE_CHARS`] characters or fewer.
pub fn split_into_sentences(text: &str) -> Result<Vec<String>, PipelineError> {
    let mut shielded = text.to_string();
    for (position, abbreviation) in ABBREVIATIONS.iter().enumerate() {
        shielded = shielded.replace(abbreviation, &placeholder(position));
    }

    let boundary = Regex::new(r"[.!?]+\s+")?;

    let sentences = boundary
        .split(&shielded)
        .map(|sentence| {
            let mut restored = sentence.to_string();
            for (position, abbreviation) in ABBREVIATIONS.iter().enumerate() {
                restored = restored.replace(&placeholder(position), abbreviation);
            }
            restored.trim().to_string()
        })
        .filter(|sentence| sentence.chars().count() > MIN_SENTENCE_CHARS)
        .collect();

    Ok(sentences)
}

fn placeholder(position: usize) -> String {
    format!("__ABBR_{position}__")
}

/// The last `count` whitespace words of `text`, or all of it when shorter.
fn last_words(text: &str, count: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= count {
        return text.to_string();
    }
    words[words.len() - count..].join(" ")
}
