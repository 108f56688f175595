//! Source file management for diagnostics.
//!
//! The SourceMap holds every translation-unit input (files and standard
//! input) and hands out source IDs so spans stay valid across the
//! lexer's logical source stack.

use std::collections::HashMap;
use std::path::PathBuf;

/// Unique identifier for a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u32);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// A source file with its content and metadata.
#[derive(Debug, Clone)]
pub struct Source {
    pub id: SourceId,
    /// Optional file path (None for standard input).
    pub path: Option<PathBuf>,
    pub content: String,
}

impl Source {
    /// Display name for diagnostics.
    pub fn name(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "*stdin*".to_string())
    }

    /// Get 1-based line and column for a byte offset.
    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let mut line = 1;
        let mut col = 1;
        for (i, ch) in self.content.char_indices() {
            if i >= offset {
                break;
            }
            if ch == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        (line, col)
    }
}

/// Manages a collection of source files.
#[derive(Debug, Default, Clone)]
pub struct SourceMap {
    sources: HashMap<SourceId, Source>,
    path_to_id: HashMap<PathBuf, SourceId>,
    next_id: u32,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source file with a path. Re-adding the same path returns
    /// the existing ID.
    pub fn add_file(&mut self, path: impl Into<PathBuf>, content: impl Into<String>) -> SourceId {
        let path = path.into();
        let content = content.into();

        if let Some(&id) = self.path_to_id.get(&path) {
            return id;
        }

        let id = SourceId(self.next_id);
        self.next_id += 1;

        self.path_to_id.insert(path.clone(), id);
        self.sources.insert(
            id,
            Source {
                id,
                path: Some(path),
                content,
            },
        );

        id
    }

    /// Add a pathless source (standard input or an inline test snippet).
    pub fn add_inline(&mut self, content: impl Into<String>) -> SourceId {
        let id = SourceId(self.next_id);
        self.next_id += 1;

        self.sources.insert(
            id,
            Source {
                id,
                path: None,
                content: content.into(),
            },
        );

        id
    }

    pub fn get(&self, id: SourceId) -> Option<&Source> {
        self.sources.get(&id)
    }

    /// Render a byte position as `file:line:column`.
    pub fn locate(&self, span: Span) -> String {
        match self.get(span.source) {
            Some(source) => {
                let (line, col) = source.line_col(span.start);
                format!("{}:{}:{}", source.name(), line, col)
            }
            None => "<unknown>".to_string(),
        }
    }
}

/// A byte range in one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub source: SourceId,
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(source: SourceId, start: usize, end: usize) -> Self {
        Self { source, start, end }
    }

    pub fn point(source: SourceId, offset: usize) -> Self {
        Self::new(source, offset, offset)
    }

    /// Merge two spans (smallest start to largest end).
    pub fn merge(self, other: Self) -> Self {
        debug_assert_eq!(self.source, other.source);
        Self {
            source: self.source,
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl Default for Span {
    fn default() -> Self {
        Self {
            source: SourceId(0),
            start: 0,
            end: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_col() {
        let mut map = SourceMap::new();
        let id = map.add_file("t.c", "int x;\nint y;\n");
        let src = map.get(id).unwrap();
        assert_eq!(src.line_col(0), (1, 1));
        assert_eq!(src.line_col(4), (1, 5));
        assert_eq!(src.line_col(7), (2, 1));
    }

    #[test]
    fn test_locate() {
        let mut map = SourceMap::new();
        let id = map.add_file("t.c", "int x;\nint +;\n");
        assert_eq!(map.locate(Span::point(id, 11)), "t.c:2:5");
    }

    #[test]
    fn test_stdin_name() {
        let mut map = SourceMap::new();
        let id = map.add_inline("int main() { return 0; }");
        assert_eq!(map.get(id).unwrap().name(), "*stdin*");
    }
}
