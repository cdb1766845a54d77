use super::Parser;
use crate::error::ParseError;
use crate::model::{EntityKind, RawFile, SourceKind, StructuredDocument};

/// Treats a whole text file as one document titled by its first line.
pub struct PlainTextParser {
    source_kind: SourceKind,
    entity_kind: EntityKind,
}

impl PlainTextParser {
    pub fn new(source_kind: SourceKind, entity_kind: EntityKind) -> Self {
        Self {
            source_kind,
            entity_kind,
        }
    }
}

impl Parser for PlainTextParser {
    fn name(&self) -> &str {
        "plain"
    }

    fn parse(&self, file: &RawFile) -> Result<Vec<StructuredDocument>, ParseError> {
        let text = std::str::from_utf8(&file.bytes).map_err(|e| ParseError::Malformed {
            path: file.path.clone(),
            message: format!("not valid UTF-8: {}", e),
        })?;

        let body = text.trim();
        if body.is_empty() {
            return Ok(Vec::new());
        }

        let title = body
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default();

        Ok(vec![StructuredDocument::new(
            self.source_kind.clone(),
            self.entity_kind.clone(),
            title,
            body,
        )])
    }
}
