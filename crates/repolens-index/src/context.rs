//! Token-budgeted context assembly for retrieved chunks.
//!
//! Budgets are approximate: one token is counted as four characters, the same
//! estimate the chunker uses when sizing chunks.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::chunker::CHARS_PER_TOKEN;
use crate::retriever::RetrievedChunk;

const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert programming assistant with deep knowledge of software development.
Your role is to help developers understand their codebase by:
- Answering questions about code functionality and structure
- Explaining complex code patterns and algorithms
- Identifying potential bugs or issues
- Suggesting improvements and best practices
- Providing clear, concise explanations

Use the provided code context to give accurate, relevant answers. If the context doesn't contain enough information, say so clearly.
Always cite specific files and line numbers when referencing code.";

const INSTRUCTIONS: &str = "# Instructions

Answer the user's query based on the code context provided above. Be specific and reference exact file paths, function names, and line numbers when applicable.
If the context is insufficient to answer the question completely, acknowledge what you can answer and what information is missing.";

fn default_max_tokens() -> usize {
    4000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

/// Aggregate view of a chunk set, used for logging and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextSummary {
    pub total_chunks: usize,
    pub unique_files: usize,
    pub languages: BTreeMap<String, usize>,
    pub chunk_types: BTreeMap<String, usize>,
    pub avg_similarity: f32,
    pub files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ContextAssembler {
    max_chars: usize,
}

impl ContextAssembler {
    #[must_use]
    pub fn new(config: &ContextConfig) -> Self {
        Self {
            max_chars: config.max_tokens.saturating_mul(CHARS_PER_TOKEN),
        }
    }

    #[must_use]
    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Format chunks in order until the character budget would be exceeded.
    ///
    /// A chunk that does not fit ends the context; later, smaller chunks are
    /// not considered.
    #[must_use]
    pub fn assemble(&self, chunks: &[RetrievedChunk], max_chunks: Option<usize>) -> String {
        let limit = max_chunks.unwrap_or(chunks.len());
        let mut parts = Vec::new();
        let mut total = 0usize;

        for (i, chunk) in chunks.iter().take(limit).enumerate() {
            let part = format_chunk(i + 1, chunk);
            let len = part.chars().count();
            if total + len > self.max_chars {
                tracing::debug!(
                    included = parts.len(),
                    budget = self.max_chars,
                    "context budget reached"
                );
                break;
            }
            total += len;
            parts.push(part);
        }

        parts.join("\n\n")
    }

    /// Build a complete prompt: system text, code context, optional
    /// instructions and the user query.
    #[must_use]
    pub fn assemble_prompt(
        &self,
        chunks: &[RetrievedChunk],
        query: &str,
        system_prompt: Option<&str>,
        include_instructions: bool,
    ) -> String {
        let mut sections = vec![system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT).to_owned()];

        let context = self.assemble(chunks, None);
        if !context.is_empty() {
            sections.push(format!("# Relevant Code Context\n\n{context}"));
        }
        if include_instructions {
            sections.push(INSTRUCTIONS.to_owned());
        }
        sections.push(format!("# User Query\n\n{query}"));

        sections.join("\n\n")
    }
}

fn is_meaningful(value: &str) -> bool {
    !value.is_empty() && value != "unknown"
}

fn format_chunk(index: usize, chunk: &RetrievedChunk) -> String {
    let mut header = format!("[{index}] {}", chunk.file_path);
    if is_meaningful(&chunk.name) {
        let _ = write!(header, " {}: {}", chunk.chunk_type, chunk.name);
    }
    if is_meaningful(&chunk.language) {
        let _ = write!(header, " ({})", chunk.language);
    }

    let mut out = header;
    let _ = write!(
        out,
        "\n```{}\n{}\n```",
        chunk.language.to_lowercase(),
        chunk.code
    );

    let mut meta = Vec::new();
    if chunk.start_line > 0 && chunk.end_line > 0 {
        meta.push(format!("Lines {}-{}", chunk.start_line, chunk.end_line));
    }
    meta.push(format!("Relevance: {:.2}%", chunk.similarity * 100.0));
    let _ = write!(out, "\n({})", meta.join(", "));

    out
}

#[must_use]
pub fn summarize(chunks: &[RetrievedChunk]) -> ContextSummary {
    let mut languages = BTreeMap::new();
    let mut chunk_types = BTreeMap::new();
    let mut files = BTreeSet::new();
    let mut similarity_sum = 0.0f32;

    for chunk in chunks {
        *languages.entry(chunk.language.clone()).or_insert(0) += 1;
        *chunk_types.entry(chunk.chunk_type.clone()).or_insert(0) += 1;
        files.insert(chunk.file_path.clone());
        similarity_sum += chunk.similarity;
    }

    #[allow(clippy::cast_precision_loss)]
    let avg_similarity = if chunks.is_empty() {
        0.0
    } else {
        similarity_sum / chunks.len() as f32
    };

    ContextSummary {
        total_chunks: chunks.len(),
        unique_files: files.len(),
        languages,
        chunk_types,
        avg_similarity,
        files: files.into_iter().collect(),
    }
}

/// Group chunks by file path, each group ordered by start line.
#[must_use]
pub fn group_by_file(chunks: &[RetrievedChunk]) -> BTreeMap<&str, Vec<&RetrievedChunk>> {
    let mut groups: BTreeMap<&str, Vec<&RetrievedChunk>> = BTreeMap::new();
    for chunk in chunks {
        groups.entry(chunk.file_path.as_str()).or_default().push(chunk);
    }
    for group in groups.values_mut() {
        group.sort_by_key(|c| c.start_line);
    }
    groups
}

/// One line per file listing its languages, chunk count and chunk types.
#[must_use]
pub fn file_summary(chunks: &[RetrievedChunk]) -> String {
    let mut out = String::from("# Files in Context\n");
    for (path, group) in group_by_file(chunks) {
        let languages: BTreeSet<&str> = group.iter().map(|c| c.language.as_str()).collect();
        let types: BTreeSet<&str> = group.iter().map(|c| c.chunk_type.as_str()).collect();
        let _ = write!(
            out,
            "\n- {path} ({}): {} chunk(s) - {}",
            languages.into_iter().collect::<Vec<_>>().join(", "),
            group.len(),
            types.into_iter().collect::<Vec<_>>().join(", "),
        );
    }
    out
}

#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / CHARS_PER_TOKEN
}

/// Cut `text` down to roughly `max_tokens`, marking the elided side with `...`.
#[must_use]
pub fn truncate_to_tokens(text: &str, max_tokens: usize, preserve_end: bool) -> String {
    let max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    let len = text.chars().count();
    if len <= max_chars {
        return text.to_owned();
    }
    if preserve_end {
        let tail: String = text.chars().skip(len - max_chars).collect();
        format!("...\n{tail}")
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}\n...")
    }
}
