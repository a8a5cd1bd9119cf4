//! Embedded Command Extraction
//!
//! Models are prompted to embed structured commands in their free-form output
//! using the syntax `<marker><command_name> <json_object>`, for example
//! `aidis:context_store {"content": "...", "type": "code"}`. This module finds
//! those commands, parses their payloads and validates them against the
//! [`CommandSchemaRegistry`]. A malformed fragment is logged and skipped so it
//! never invalidates the rest of a response.

use crate::schema::CommandSchemaRegistry;
use regex::Regex;
use serde::Serialize;
use serde_json::{Deserializer, Map, Value};
use tracing::{debug, warn};

/// Marker that introduces an embedded command.
pub const DEFAULT_MARKER: &str = "aidis:";

/// A command found in model output that passed schema validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedCommand {
    pub name: String,
    /// The normalized payload, with schema defaults applied.
    pub payload: Map<String, Value>,
}

/// Scans text for embedded commands.
///
/// Every call to [`CommandExtractor::extract`] starts a fresh scan; the
/// extractor holds no cursor between calls.
#[derive(Clone)]
pub struct CommandExtractor {
    registry: CommandSchemaRegistry,
    marker: String,
    pattern: Regex,
}

impl CommandExtractor {
    pub fn new(registry: CommandSchemaRegistry) -> Self {
        Self::with_marker(registry, DEFAULT_MARKER)
    }

    /// Creates an extractor that recognizes a custom marker.
    pub fn with_marker(registry: CommandSchemaRegistry, marker: &str) -> Self {
        let source = format!(r"{}([A-Za-z0-9_]+)\s*\{{", regex::escape(marker));
        // The marker is escaped, so the pattern is always valid.
        let pattern = Regex::new(&source).expect("escaped marker forms a valid pattern");
        Self {
            registry,
            marker: marker.to_string(),
            pattern,
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn registry(&self) -> &CommandSchemaRegistry {
        &self.registry
    }

    /// Extracts every valid embedded command, in order of appearance.
    pub fn extract(&self, text: &str) -> Vec<ExtractedCommand> {
        let mut commands = Vec::new();
        let mut cursor = 0;

        while let Some(caps) = self.pattern.captures_at(text, cursor) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                break;
            };
            let name = name.as_str();
            // The match ends on the payload's opening brace.
            let payload_start = whole.end() - 1;

            let mut values = Deserializer::from_str(&text[payload_start..]).into_iter::<Value>();
            match values.next() {
                Some(Ok(payload)) => {
                    // Resume after the payload so markers quoted inside it are not re-read.
                    cursor = payload_start + values.byte_offset();
                    if let Some(command) = self.validate_payload(name, payload) {
                        commands.push(command);
                    }
                }
                Some(Err(e)) => {
                    warn!(command = name, error = %e, "Skipping embedded command with malformed JSON");
                    cursor = whole.end();
                }
                None => cursor = whole.end(),
            }
        }

        debug!(count = commands.len(), "Extracted embedded commands");
        commands
    }

    /// Single-shot validation: the first valid embedded command in `text`.
    pub fn validate_str(&self, text: &str) -> Option<ExtractedCommand> {
        self.extract(text).into_iter().next()
    }

    fn validate_payload(&self, name: &str, payload: Value) -> Option<ExtractedCommand> {
        if !payload.is_object() {
            debug!(command = name, "Skipping embedded command whose payload is not an object");
            return None;
        }
        let Some(schema) = self.registry.get(name) else {
            warn!(command = name, "Skipping unknown embedded command");
            return None;
        };
        match schema.validate(payload) {
            Ok(payload) => Some(ExtractedCommand {
                name: name.to_string(),
                payload,
            }),
            Err(e) => {
                warn!(command = name, error = %e, "Skipping embedded command that failed validation");
                None
            }
        }
    }
}

impl Default for CommandExtractor {
    fn default() -> Self {
        Self::new(CommandSchemaRegistry::with_defaults())
    }
}
