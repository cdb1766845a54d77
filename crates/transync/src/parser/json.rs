use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::Parser;
use crate::error::ParseError;
use crate::model::{EntityKind, RawFile, SourceKind, StructuredDocument};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranscriptFile {
    title: String,
    #[serde(default)]
    recorded_at: Option<DateTime<Utc>>,
    segments: Vec<Segment>,
}

#[derive(Debug, Deserialize)]
struct Segment {
    #[serde(default)]
    speaker: Option<String>,
    text: String,
}

/// Reads `{title, recordedAt?, segments: [{speaker?, text}]}` files,
/// emitting one document per segment.
pub struct JsonTranscriptParser {
    source_kind: SourceKind,
    entity_kind: EntityKind,
}

impl JsonTranscriptParser {
    pub fn new(source_kind: SourceKind, entity_kind: EntityKind) -> Self {
        Self {
            source_kind,
            entity_kind,
        }
    }
}

impl Parser for JsonTranscriptParser {
    fn name(&self) -> &str {
        "json"
    }

    fn parse(&self, file: &RawFile) -> Result<Vec<StructuredDocument>, ParseError> {
        let transcript: TranscriptFile =
            serde_json::from_slice(&file.bytes).map_err(|e| ParseError::Malformed {
                path: file.path.clone(),
                message: e.to_string(),
            })?;

        let docs = transcript
            .segments
            .into_iter()
            .enumerate()
            .map(|(i, segment)| {
                let mut doc = StructuredDocument::new(
                    self.source_kind.clone(),
                    self.entity_kind.clone(),
                    format!("{} #{}", transcript.title, i + 1),
                    segment.text,
                );
                doc.attribution = segment.speaker;
                doc.recorded_at = transcript.recorded_at;
                doc.metadata
                    .insert("transcript".to_string(), transcript.title.clone());
                doc
            })
            .collect();

        Ok(docs)
    }
}
