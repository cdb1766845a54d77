//! Parser plug-ins: raw file in, structured documents out.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::schema::{ParserKind, SourceConfig};
use crate::error::ParseError;
use crate::model::{RawFile, SourceKind, StructuredDocument};

pub mod json;
pub mod plain;

pub use json::JsonTranscriptParser;
pub use plain::PlainTextParser;

/// Format-specific conversion of one file into an ordered document set.
///
/// Must be deterministic: identical input yields identical output, which
/// idempotent re-ingestion depends on.
pub trait Parser: Send + Sync {
    fn name(&self) -> &str;

    fn parse(&self, file: &RawFile) -> Result<Vec<StructuredDocument>, ParseError>;
}

/// Maps source kinds to their parser.
#[derive(Clone, Default)]
pub struct ParserRegistry {
    parsers: HashMap<SourceKind, Arc<dyn Parser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the built-in parser named by each configured source.
    pub fn from_sources(sources: &[SourceConfig]) -> Self {
        let mut registry = Self::new();
        for source in sources {
            let parser: Arc<dyn Parser> = match source.parser {
                ParserKind::Plain => Arc::new(PlainTextParser::new(
                    source.kind.clone(),
                    source.entity_kind.clone(),
                )),
                ParserKind::Json => Arc::new(JsonTranscriptParser::new(
                    source.kind.clone(),
                    source.entity_kind.clone(),
                )),
            };
            registry.register(source.kind.clone(), parser);
        }
        registry
    }

    /// Registers (or replaces) the parser for a source kind.
    pub fn register(&mut self, kind: SourceKind, parser: Arc<dyn Parser>) {
        log::debug!("Registered parser '{}' for source kind '{}'", parser.name(), kind);
        self.parsers.insert(kind, parser);
    }

    pub fn get(&self, kind: &SourceKind) -> Result<Arc<dyn Parser>, ParseError> {
        self.parsers
            .get(kind)
            .cloned()
            .ok_or_else(|| ParseError::NoParser(kind.to_string()))
    }

    pub fn contains(&self, kind: &SourceKind) -> bool {
        self.parsers.contains_key(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn source(kind: &str, parser: ParserKind) -> SourceConfig {
        SourceConfig {
            kind: kind.into(),
            entity_kind: "segment".into(),
            directory: PathBuf::from("/in"),
            extensions: vec![],
            include: vec![],
            recursive: false,
            parser,
            prune_missing: false,
        }
    }

    #[test]
    fn test_from_sources() {
        let registry = ParserRegistry::from_sources(&[
            source("notes", ParserKind::Plain),
            source("captions", ParserKind::Json),
        ]);
        assert_eq!(registry.get(&"notes".into()).unwrap().name(), "plain");
        assert_eq!(registry.get(&"captions".into()).unwrap().name(), "json");
    }

    #[test]
    fn test_missing_parser() {
        let registry = ParserRegistry::new();
        assert_eq!(
            registry.get(&"vtt".into()).err(),
            Some(ParseError::NoParser("vtt".to_string()))
        );
    }
}
