//! Line-oriented structural parser.
//!
//! Recognises function and class openers for Python and JavaScript/TypeScript,
//! treats other code languages as a single file unit, and leaves prose to the
//! text chunker. Parsing never fails: malformed input just yields fewer units.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::languages::{Lang, detect_language};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Function,
    Class,
    File,
    Section,
    Text,
    /// Top-level code outside any recognised unit.
    Code,
}

impl ChunkType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::File => "file",
            Self::Section => "section",
            Self::Text => "text",
            Self::Code => "code",
        }
    }
}

impl std::fmt::Display for ChunkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A semantic unit of a source file. Line numbers are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeUnit {
    pub code: String,
    pub unit_type: ChunkType,
    pub name: String,
    pub file_path: String,
    pub language: Lang,
    pub start_line: usize,
    pub end_line: usize,
    pub signature: Option<String>,
    pub decorators: Vec<String>,
    pub docstring: Option<String>,
    pub imports: Vec<String>,
}

/// Parsed pieces of a signature line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureParts {
    pub params: String,
    pub return_type: String,
    pub param_count: usize,
}

/// Split `content` into semantic units. Returns no units for prose files.
#[must_use]
pub fn parse(file_path: &str, content: &str) -> Vec<CodeUnit> {
    let lang = detect_language(Path::new(file_path));
    let lines: Vec<&str> = content.lines().collect();
    match lang {
        Lang::Python => parse_python(file_path, &lines),
        Lang::JavaScript | Lang::TypeScript => parse_javascript(file_path, lang, &lines),
        Lang::Markdown | Lang::Text => Vec::new(),
        _ => parse_whole_file(file_path, lang, content, lines.len()),
    }
}

struct UnitStart {
    start: usize,
    unit_type: ChunkType,
    name: String,
    signature: Option<String>,
    decorators: Vec<String>,
    docstring: Option<String>,
}

fn build_unit(
    file_path: &str,
    language: Lang,
    lines: &[&str],
    head: UnitStart,
    end_exclusive: usize,
) -> CodeUnit {
    let code = lines[head.start..end_exclusive].join("\n");
    let imports = extract_imports(&code, language);
    CodeUnit {
        code,
        unit_type: head.unit_type,
        name: head.name,
        file_path: file_path.to_owned(),
        language,
        start_line: head.start + 1,
        end_line: end_exclusive,
        signature: head.signature,
        decorators: head.decorators,
        docstring: head.docstring,
        imports,
    }
}

fn python_opener(stripped: &str) -> Option<(ChunkType, String)> {
    let def = stripped
        .strip_prefix("async def ")
        .or_else(|| stripped.strip_prefix("def "));
    if let Some(rest) = def {
        let name = rest.split('(').next().unwrap_or_default().trim();
        return Some((ChunkType::Function, name.to_owned()));
    }
    if let Some(rest) = stripped.strip_prefix("class ") {
        let name = rest
            .split(['(', ':'])
            .next()
            .unwrap_or_default()
            .trim();
        return Some((ChunkType::Class, name.to_owned()));
    }
    None
}

fn parse_python(file_path: &str, lines: &[&str]) -> Vec<CodeUnit> {
    let mut units = Vec::new();
    let mut current: Option<UnitStart> = None;

    for (i, line) in lines.iter().enumerate() {
        let Some((unit_type, name)) = python_opener(line.trim()) else {
            continue;
        };

        let mut first = i;
        while first > 0 && lines[first - 1].trim().starts_with('@') {
            first -= 1;
        }
        if let Some(prev) = current.as_ref() {
            first = first.max(prev.start + 1);
        }
        let decorators = lines[first..i]
            .iter()
            .map(|l| l.trim().to_owned())
            .collect();

        if let Some(prev) = current.take() {
            units.push(build_unit(file_path, Lang::Python, lines, prev, first));
        }

        let (signature, sig_end) = python_signature(lines, i);
        current = Some(UnitStart {
            start: first,
            unit_type,
            name,
            signature: Some(signature),
            decorators,
            docstring: python_docstring(lines, sig_end + 1),
        });
    }

    if let Some(prev) = current {
        units.push(build_unit(file_path, Lang::Python, lines, prev, lines.len()));
    }
    units
}

/// Signature text from the opener until parentheses balance on a line with `:`.
fn python_signature(lines: &[&str], opener: usize) -> (String, usize) {
    let mut depth: i64 = 0;
    let mut end = opener;
    for (i, line) in lines.iter().enumerate().skip(opener) {
        end = i;
        depth += paren_delta(line);
        if depth <= 0 && line.contains(':') {
            break;
        }
    }
    (lines[opener..=end].join("\n"), end)
}

fn paren_delta(line: &str) -> i64 {
    let open = line.matches('(').count();
    let close = line.matches(')').count();
    i64::try_from(open).unwrap_or(i64::MAX) - i64::try_from(close).unwrap_or(i64::MAX)
}

fn python_docstring(lines: &[&str], at: usize) -> Option<String> {
    let first = lines.get(at)?.trim();
    let quote = if first.starts_with("\"\"\"") {
        "\"\"\""
    } else if first.starts_with("'''") {
        "'''"
    } else {
        return None;
    };
    let quote_char = quote.chars().next().unwrap_or('"');

    if first.matches(quote).count() >= 2 {
        let text = first.trim_matches(quote_char).trim();
        return (!text.is_empty()).then(|| text.to_owned());
    }

    let mut parts = vec![first.trim_matches(quote_char).trim().to_owned()];
    for line in &lines[at + 1..] {
        let trimmed = line.trim();
        if trimmed.contains(quote) {
            parts.push(trimmed.trim_matches(quote_char).trim().to_owned());
            break;
        }
        parts.push(trimmed.to_owned());
    }
    let text = parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!text.is_empty()).then_some(text)
}

fn js_opener(stripped: &str) -> Option<(ChunkType, String)> {
    if let Some(rest) = stripped.strip_prefix("class ") {
        let name = rest
            .split(['{', ' '])
            .next()
            .unwrap_or_default()
            .trim();
        return Some((ChunkType::Class, name.to_owned()));
    }
    if let Some((_, rest)) = stripped.split_once("function ") {
        let name = rest.split('(').next().unwrap_or_default().trim();
        let name = if name.is_empty() { "anonymous" } else { name };
        return Some((ChunkType::Function, name.to_owned()));
    }
    if stripped.contains("=>") {
        return Some((ChunkType::Function, arrow_name(stripped)));
    }
    None
}

fn arrow_name(stripped: &str) -> String {
    let Some((lhs, _)) = stripped.split_once('=') else {
        return "anonymous".into();
    };
    let name = lhs
        .split_whitespace()
        .filter(|w| !matches!(*w, "export" | "default" | "const" | "let" | "var"))
        .collect::<Vec<_>>()
        .join(" ");
    let name = name.split(':').next().unwrap_or_default().trim();
    if name.is_empty() || name.contains(['(', ')', '.', '\'', '"']) {
        "anonymous".into()
    } else {
        name.to_owned()
    }
}

fn brace_delta(line: &str) -> i64 {
    let open = line.matches('{').count();
    let close = line.matches('}').count();
    i64::try_from(open).unwrap_or(i64::MAX) - i64::try_from(close).unwrap_or(i64::MAX)
}

fn parse_javascript(file_path: &str, lang: Lang, lines: &[&str]) -> Vec<CodeUnit> {
    let mut units = Vec::new();
    let mut current: Option<UnitStart> = None;
    let mut depth: i64 = 0;

    for (i, line) in lines.iter().enumerate() {
        let stripped = line.trim();

        if let Some((unit_type, name)) = js_opener(stripped) {
            if depth <= 0
                && let Some(prev) = current.take()
            {
                units.push(build_unit(file_path, lang, lines, prev, i));
                depth = 0;
            }
            if current.is_none() {
                current = Some(UnitStart {
                    start: i,
                    unit_type,
                    name,
                    signature: Some(stripped.trim_end_matches('{').trim().to_owned()),
                    decorators: Vec::new(),
                    docstring: None,
                });
            }
        }

        if current.is_none() && !stripped.is_empty() {
            current = Some(UnitStart {
                start: i,
                unit_type: ChunkType::Code,
                name: "unknown".into(),
                signature: None,
                decorators: Vec::new(),
                docstring: None,
            });
        }
        if current.is_some() {
            depth += brace_delta(stripped);
        }
    }

    if let Some(prev) = current {
        units.push(build_unit(file_path, lang, lines, prev, lines.len()));
    }
    units
}

fn parse_whole_file(file_path: &str, lang: Lang, content: &str, line_count: usize) -> Vec<CodeUnit> {
    if content.trim().is_empty() {
        return Vec::new();
    }
    let name = Path::new(file_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_path)
        .to_owned();
    vec![CodeUnit {
        code: content.to_owned(),
        unit_type: ChunkType::File,
        name,
        file_path: file_path.to_owned(),
        language: lang,
        start_line: 1,
        end_line: line_count.max(1),
        signature: None,
        decorators: Vec::new(),
        docstring: None,
        imports: extract_imports(content, lang),
    }]
}

/// Import statements appearing in `code`.
#[must_use]
pub fn extract_imports(code: &str, lang: Lang) -> Vec<String> {
    code.lines()
        .map(str::trim)
        .filter(|l| match lang {
            Lang::Python => l.starts_with("import ") || l.starts_with("from "),
            Lang::JavaScript | Lang::TypeScript => {
                l.starts_with("import ") || l.starts_with("require(") || l.contains("= require(")
            }
            _ => false,
        })
        .map(str::to_owned)
        .collect()
}

/// Split a signature into parameters, return type and parameter count.
#[must_use]
pub fn parse_signature(signature: &str) -> SignatureParts {
    let mut parts = SignatureParts::default();
    if let (Some(open), Some(close)) = (signature.find('('), signature.rfind(')'))
        && open < close
    {
        let params = signature[open + 1..close].trim();
        parts.params = params.to_owned();
        parts.param_count = params
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty() && *p != "self" && *p != "cls")
            .count();
    }
    if let Some((_, after)) = signature.split_once("->") {
        parts.return_type = after.split(':').next().unwrap_or_default().trim().to_owned();
    }
    parts
}
