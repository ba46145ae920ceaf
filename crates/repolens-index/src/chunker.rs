//! Size-bounded chunking of parsed units and prose.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::languages::detect_language;
use crate::parser::{ChunkType, CodeUnit, parse_signature};

/// Characters per token used for every size estimate.
pub const CHARS_PER_TOKEN: usize = 4;

const SPLIT_WINDOW: usize = 10;
const MAX_COMPLEXITY: usize = 1000;
const PREVIEW_CHARS: usize = 100;
const DOCSTRING_LINE_CHARS: usize = 200;
const DOCSTRING_FULL_CHARS: usize = 500;
const MAX_IMPORT_LINES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    #[serde(default = "default_max_chunk_tokens")]
    pub max_chunk_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
}

fn default_max_chunk_tokens() -> usize {
    1000
}

fn default_overlap_tokens() -> usize {
    50
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_tokens: default_max_chunk_tokens(),
            overlap_tokens: default_overlap_tokens(),
        }
    }
}

impl ChunkerConfig {
    #[must_use]
    pub fn max_chars(&self) -> usize {
        self.max_chunk_tokens.saturating_mul(CHARS_PER_TOKEN).max(1)
    }

    #[must_use]
    pub fn overlap_chars(&self) -> usize {
        self.overlap_tokens.saturating_mul(CHARS_PER_TOKEN)
    }
}

/// A retrievable unit of content with its location and derived metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub code: String,
    pub language: String,
    pub chunk_type: ChunkType,
    pub name: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub line_count: usize,

    pub char_count: usize,
    pub token_count_estimate: usize,
    pub complexity_estimate: usize,
    pub loc: usize,
    pub preview: String,

    pub signature: Option<String>,
    pub signature_params: Option<String>,
    pub signature_return: Option<String>,
    pub param_count: Option<usize>,
    pub decorators: Vec<String>,
    pub docstring: Option<String>,
    pub docstring_full: Option<String>,
    pub imports: Vec<String>,
    pub is_public: bool,
    pub is_property: bool,
    pub is_async: bool,

    pub is_partial: bool,
    pub part_number: Option<usize>,
    pub parent_chunk: Option<String>,
    pub parent_signature: Option<String>,

    pub commit_hash: String,
    pub is_uncommitted: bool,
    /// Content hash of the source file this chunk was cut from.
    pub file_hash: String,
}

impl Chunk {
    #[must_use]
    pub fn new(
        file_path: &str,
        language: &str,
        chunk_type: ChunkType,
        name: &str,
        code: String,
        start_line: usize,
        end_line: usize,
    ) -> Self {
        Self {
            id: String::new(),
            code,
            language: language.to_owned(),
            chunk_type,
            name: name.to_owned(),
            file_path: file_path.to_owned(),
            start_line,
            end_line,
            line_count: (end_line + 1).saturating_sub(start_line),
            char_count: 0,
            token_count_estimate: 0,
            complexity_estimate: 0,
            loc: 0,
            preview: String::new(),
            signature: None,
            signature_params: None,
            signature_return: None,
            param_count: None,
            decorators: Vec::new(),
            docstring: None,
            docstring_full: None,
            imports: Vec::new(),
            is_public: true,
            is_property: false,
            is_async: false,
            is_partial: false,
            part_number: None,
            parent_chunk: None,
            parent_signature: None,
            commit_hash: String::new(),
            is_uncommitted: false,
            file_hash: String::new(),
        }
    }

    fn from_unit(unit: CodeUnit) -> Self {
        let mut chunk = Self::new(
            &unit.file_path,
            unit.language.id(),
            unit.unit_type,
            &unit.name,
            unit.code,
            unit.start_line,
            unit.end_line,
        );
        if let Some(sig) = unit.signature {
            let parts = parse_signature(&sig);
            chunk.signature_params = Some(parts.params);
            chunk.signature_return = Some(parts.return_type);
            chunk.param_count = Some(parts.param_count);
            chunk.signature = Some(sig);
        }
        if let Some(doc) = unit.docstring {
            chunk.docstring = Some(
                doc.lines()
                    .next()
                    .unwrap_or_default()
                    .chars()
                    .take(DOCSTRING_LINE_CHARS)
                    .collect(),
            );
            chunk.docstring_full = Some(doc.chars().take(DOCSTRING_FULL_CHARS).collect());
        }
        chunk.decorators = unit.decorators;
        chunk.imports = unit.imports;
        chunk
    }

    /// Metadata written next to the vector. Every value is a string.
    #[must_use]
    pub fn payload(&self) -> HashMap<String, serde_json::Value> {
        let mut m = HashMap::new();
        let mut put = |k: &str, v: String| {
            m.insert(k.to_owned(), serde_json::Value::String(v));
        };
        put("file_path", self.file_path.clone());
        put("language", self.language.clone());
        put("chunk_type", self.chunk_type.as_str().to_owned());
        put("name", self.name.clone());
        put("start_line", self.start_line.to_string());
        put("end_line", self.end_line.to_string());
        put("line_count", self.line_count.to_string());
        put("char_count", self.char_count.to_string());
        put("token_count_estimate", self.token_count_estimate.to_string());
        put("complexity_estimate", self.complexity_estimate.to_string());
        put("loc", self.loc.to_string());
        put("preview", self.preview.clone());
        put("is_public", self.is_public.to_string());
        put("is_property", self.is_property.to_string());
        put("is_async", self.is_async.to_string());
        put("is_partial", self.is_partial.to_string());
        put("commit_hash", self.commit_hash.clone());
        put("is_uncommitted", self.is_uncommitted.to_string());
        put("file_hash", self.file_hash.clone());

        if let Some(v) = &self.signature {
            put("signature", v.clone());
        }
        if let Some(v) = &self.signature_params {
            put("signature_params", v.clone());
        }
        if let Some(v) = &self.signature_return {
            put("signature_return", v.clone());
        }
        if let Some(v) = self.param_count {
            put("param_count", v.to_string());
        }
        if !self.decorators.is_empty() {
            put("decorators", self.decorators.join("\n"));
        }
        if let Some(v) = &self.docstring {
            put("docstring", v.clone());
        }
        if let Some(v) = &self.docstring_full {
            put("docstring_full", v.clone());
        }
        if !self.imports.is_empty() {
            put("imports", self.imports.join("\n"));
        }
        if let Some(v) = self.part_number {
            put("part_number", v.to_string());
        }
        if let Some(v) = &self.parent_chunk {
            put("parent_chunk", v.clone());
        }
        if let Some(v) = &self.parent_signature {
            put("parent_signature", v.clone());
        }
        m
    }
}

/// Stable id of the `ordinal`-th chunk of a file within a collection.
#[must_use]
pub fn chunk_id(collection: &str, file_path: &str, ordinal: usize, name: &str) -> String {
    format!("{collection}_{file_path}_{ordinal}_{name}")
}

/// Text sent to the embedder: location and imports prepended to the raw code.
#[must_use]
pub fn embedding_text(chunk: &Chunk) -> String {
    compose_embedding_text(
        &chunk.file_path,
        chunk.chunk_type.as_str(),
        &chunk.name,
        &chunk.language,
        chunk.imports.iter().map(String::as_str),
        &chunk.code,
    )
}

pub(crate) fn compose_embedding_text<'a>(
    file_path: &str,
    chunk_type: &str,
    name: &str,
    language: &str,
    imports: impl IntoIterator<Item = &'a str>,
    code: &str,
) -> String {
    let mut text = String::with_capacity(code.len() + 256);

    text.push_str("# ");
    text.push_str(file_path);
    text.push('\n');

    text.push_str("# ");
    text.push_str(chunk_type);
    text.push_str(": ");
    text.push_str(name);
    text.push('\n');

    text.push_str("# Language: ");
    text.push_str(language);
    text.push('\n');

    for import in imports.into_iter().take(MAX_IMPORT_LINES) {
        text.push_str(import);
        text.push('\n');
    }

    text.push_str(code);
    text
}

/// Turn parsed units into finalized chunks, splitting any unit over the size cap.
#[must_use]
pub fn chunk_units(units: Vec<CodeUnit>, config: &ChunkerConfig) -> Vec<Chunk> {
    let max_chars = config.max_chars();
    let mut out = Vec::with_capacity(units.len());
    for unit in units {
        let chunk = Chunk::from_unit(unit);
        let len = chunk.code.chars().count();
        if len <= max_chars {
            out.push(finalize(chunk));
        } else {
            tracing::debug!(name = %chunk.name, chars = len, "splitting oversized unit");
            out.extend(split_with_overlap(&chunk, config));
        }
    }
    out
}

fn split_with_overlap(chunk: &Chunk, config: &ChunkerConfig) -> Vec<Chunk> {
    let lines: Vec<&str> = chunk.code.split('\n').collect();
    let avg_line = avg_line_len(&chunk.code, lines.len());
    let lines_per_chunk = lines_for(config.max_chars(), avg_line).max(1);
    let overlap_lines = lines_for(config.overlap_chars(), avg_line);

    let mut parts = Vec::new();
    let mut prev_end: usize = 0;
    for (idx, split) in find_split_points(&lines, lines_per_chunk)
        .into_iter()
        .enumerate()
    {
        let part_number = idx + 1;
        let start = prev_end.saturating_sub(overlap_lines);
        let mut part = chunk.clone();
        part.code = lines[start..split].join("\n");
        part.name = format!("{}_part{part_number}", chunk.name);
        part.start_line = chunk.start_line + start;
        part.end_line = chunk.start_line + split - 1;
        part.line_count = split - start;
        part.is_partial = true;
        part.part_number = Some(part_number);
        part.parent_chunk = Some(chunk.name.clone());
        part.parent_signature.clone_from(&chunk.signature);
        if part_number > 1 {
            part.docstring = None;
            part.docstring_full = None;
        }
        parts.push(finalize(part));
        prev_end = split;
    }
    parts
}

#[allow(clippy::cast_precision_loss)]
fn avg_line_len(text: &str, line_count: usize) -> f64 {
    let chars = text.chars().count();
    if line_count == 0 || chars == 0 {
        return 100.0;
    }
    chars as f64 / line_count as f64
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn lines_for(chars: usize, avg_line: f64) -> usize {
    (chars as f64 / avg_line) as usize
}

/// Exclusive end indices of each part; strictly increasing, the last equals `lines.len()`.
pub(crate) fn find_split_points(lines: &[&str], target: usize) -> Vec<usize> {
    let len = lines.len();
    let target = target.max(1);
    let mut points = Vec::new();
    let mut current = 0;

    while current < len {
        let target_pos = current + target;
        if target_pos >= len {
            points.push(len);
            break;
        }

        let search_start = target_pos.saturating_sub(SPLIT_WINDOW).max(current + 1);
        let search_end = (target_pos + SPLIT_WINDOW).min(len);

        // A plain line never beats the target position.
        let mut best = target_pos;
        let mut best_score = 1;
        for i in search_start..search_end {
            let score = score_split_point(lines, i);
            if score > best_score {
                best_score = score;
                best = i;
            }
        }
        points.push(best);
        current = best;
    }
    points
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// How good a place line `idx` is to start a new part.
pub(crate) fn score_split_point(lines: &[&str], idx: usize) -> u32 {
    let Some(raw) = lines.get(idx) else {
        return 0;
    };
    let line = raw.trim();
    if line.is_empty() {
        return 10;
    }
    if line.starts_with('#') || line.starts_with("//") || line.starts_with("/*") {
        return 8;
    }
    if let Some(next) = lines.get(idx + 1)
        && indent_of(next) < indent_of(raw)
    {
        return 7;
    }
    if matches!(line, "}" | ")" | "]") || line.starts_with("return") || line.starts_with('}') {
        return 6;
    }
    1
}

/// Chunk a file the parser produced no units for.
#[must_use]
pub fn chunk_text(content: &str, file_path: &str, config: &ChunkerConfig) -> Vec<Chunk> {
    let path = Path::new(file_path);
    let is_markdown = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("md") || e.eq_ignore_ascii_case("markdown"));
    if is_markdown {
        chunk_markdown(content, file_path, config)
    } else {
        chunk_generic_text(content, file_path, config)
    }
}

fn chunk_markdown(content: &str, file_path: &str, config: &ChunkerConfig) -> Vec<Chunk> {
    let max_chars = config.max_chars();
    let lines: Vec<&str> = content.split('\n').collect();
    let mut chunks = Vec::new();

    let mut section: Vec<&str> = Vec::new();
    let mut section_chars = 0usize;
    let mut header: Option<String> = None;
    let mut start = 1;
    let mut in_fence = false;

    let flush = |chunks: &mut Vec<Chunk>, section: &[&str], name: &str, start: usize, end: usize| {
        let text = section.join("\n");
        if text.trim().is_empty() {
            return;
        }
        chunks.push(Chunk::new(
            file_path,
            "markdown",
            ChunkType::Section,
            name,
            text,
            start,
            end,
        ));
    };

    for (i, line) in lines.iter().enumerate() {
        let line_no = i + 1;
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
        }

        if !in_fence && trimmed.starts_with('#') {
            if !section.is_empty() {
                let name = header.as_deref().unwrap_or("intro");
                flush(&mut chunks, &section, name, start, line_no - 1);
            }
            header = Some(trimmed.trim_start_matches('#').trim().to_owned());
            section.clear();
            section_chars = 0;
            start = line_no;
        }

        if !section.is_empty() {
            section_chars += 1;
        }
        section_chars += line.chars().count();
        section.push(line);

        if section_chars > max_chars {
            let name = header.as_deref().unwrap_or("content");
            flush(&mut chunks, &section, name, start, line_no);
            section.clear();
            section_chars = 0;
            start = line_no + 1;
        }
    }

    if !section.is_empty() {
        let name = header.as_deref().unwrap_or("content");
        flush(&mut chunks, &section, name, start, lines.len());
    }

    chunks.into_iter().map(finalize).collect()
}

fn chunk_generic_text(content: &str, file_path: &str, config: &ChunkerConfig) -> Vec<Chunk> {
    let language = detect_language(Path::new(file_path)).id();
    let stem = Path::new(file_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_path);
    let lines: Vec<&str> = content.split('\n').collect();
    let avg_line = avg_line_len(content, lines.len());
    let lines_per_chunk = lines_for(config.max_chars(), avg_line).max(1);
    let overlap_lines = lines_for(config.overlap_chars(), avg_line);
    let step = lines_per_chunk.saturating_sub(overlap_lines).max(1);

    let mut chunks = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let end = (i + lines_per_chunk).min(lines.len());
        let text = lines[i..end].join("\n");
        if !text.trim().is_empty() {
            let name = format!("{stem}_part{}", chunks.len() + 1);
            chunks.push(finalize(Chunk::new(
                file_path,
                language,
                ChunkType::Text,
                &name,
                text,
                i + 1,
                end,
            )));
        }
        if end == lines.len() {
            break;
        }
        i += step;
    }
    chunks
}

/// Stamp size metrics, complexity and classification flags onto a chunk.
#[must_use]
pub fn finalize(mut chunk: Chunk) -> Chunk {
    let code = &chunk.code;
    chunk.char_count = code.chars().count();
    chunk.token_count_estimate = chunk.char_count / CHARS_PER_TOKEN;
    chunk.preview = if chunk.char_count > PREVIEW_CHARS {
        let mut p: String = code.chars().take(PREVIEW_CHARS).collect();
        p.push_str("...");
        p
    } else {
        code.clone()
    };

    let loc = code
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .count();
    let count = |needle: &str| code.matches(needle).count();
    let complexity = loc
        + count("if ") * 2
        + count("elif ") * 2
        + count("else:")
        + count("for ") * 3
        + count("while ") * 3
        + count("try:") * 2
        + count("except ") * 2
        + count("lambda ") * 2
        + count("yield ") * 2;
    chunk.complexity_estimate = complexity.min(MAX_COMPLEXITY);
    chunk.loc = loc;

    if chunk.chunk_type == ChunkType::Function {
        chunk.is_public = !chunk.name.starts_with('_');
        chunk.is_property = chunk.decorators.iter().any(|d| d.contains("@property"));
        chunk.is_async = chunk
            .signature
            .as_deref()
            .is_some_and(|s| s.contains("async def") || s.contains("async function") || s.contains("async "));
    } else {
        chunk.is_public = true;
        chunk.is_property = false;
        chunk.is_async = false;
    }
    chunk
}
