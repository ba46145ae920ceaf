//! Language detection and file eligibility.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Python,
    JavaScript,
    TypeScript,
    Java,
    Go,
    Rust,
    Ruby,
    C,
    Cpp,
    Markdown,
    Text,
}

impl Lang {
    /// Identifier stored in chunk payloads.
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Java => "java",
            Self::Go => "go",
            Self::Rust => "rust",
            Self::Ruby => "ruby",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::Markdown => "markdown",
            Self::Text => "text",
        }
    }

    /// Whether the parser produces code units for this language.
    #[must_use]
    pub fn is_code(self) -> bool {
        !matches!(self, Self::Markdown | Self::Text)
    }
}

impl std::fmt::Display for Lang {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Detect language from file extension; unknown extensions are [`Lang::Text`].
#[must_use]
pub fn detect_language(path: &Path) -> Lang {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return Lang::Text;
    };
    match ext.to_ascii_lowercase().as_str() {
        "py" => Lang::Python,
        "js" | "jsx" | "mjs" | "cjs" => Lang::JavaScript,
        "ts" | "tsx" => Lang::TypeScript,
        "java" => Lang::Java,
        "go" => Lang::Go,
        "rs" => Lang::Rust,
        "rb" => Lang::Ruby,
        "c" => Lang::C,
        "cpp" | "cc" | "h" | "hpp" => Lang::Cpp,
        "md" | "markdown" => Lang::Markdown,
        _ => Lang::Text,
    }
}

const BINARY_EXTENSIONS: &[&str] = &[
    "pyc", "pyo", "so", "dylib", "dll", "exe", "jpg", "jpeg", "png", "gif", "ico", "pdf", "zip",
    "tar", "gz", "bz2", "xz", "db", "sqlite", "sqlite3",
];

const ALLOWED_HIDDEN: &[&str] = &[".gitignore", ".env.example"];

const SKIP_DIRS: &[&str] = &[
    "node_modules",
    "__pycache__",
    ".git",
    ".venv",
    "venv",
    "env",
    "dist",
    "build",
];

/// Whether a repository-relative path is worth indexing.
#[must_use]
pub fn should_index(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|e| e.to_str())
        && BINARY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
    {
        return false;
    }

    if let Some(name) = path.file_name().and_then(|n| n.to_str())
        && name.starts_with('.')
        && !ALLOWED_HIDDEN.contains(&name)
    {
        return false;
    }

    !path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|part| SKIP_DIRS.contains(&part))
    })
}
