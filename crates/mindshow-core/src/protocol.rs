//! LED controller wire protocol
//!
//! Controllers speak a small JSON protocol over a persistent message
//! transport. Two kinds of inbound frames share the same stream:
//!
//! ```text
//! {"ack": 1}                          control document (starts with '{')
//! {"fps": 59.8, ...}                  unsolicited status document
//! {"vars": {"hue": 0.3}}              reply to getVars
//! AB12CD34\tsparkfire\nEF56...\n      pattern list text (no leading '{')
//! ```
//!
//! [`classify_frame`] separates them with a prefix check before any JSON
//! decoding happens. Pattern list text may be split across several frames;
//! [`CatalogAssembler`] accumulates it until a frame ends with a line ending.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::error::{ProtocolError, ProtocolResult};

/// Upper bound on buffered pattern list text.
pub const MAX_CATALOG_BYTES: usize = 1 << 20;

// ============================================================================
// Outbound Requests
// ============================================================================

/// Request sent to a controller.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Handshake / liveness probe: `{"ping": true}`
    Ping,
    /// Pattern catalog request: `{"listPrograms": true}`
    ListPrograms,
    /// Activate a pattern by catalog id: `{"activeProgramId": "<id>"}`
    ActivateProgram {
        /// Catalog id
        id: String,
    },
    /// Set any subset of pattern variables: `{"setVars": {...}}`
    SetVars(BTreeMap<String, f64>),
    /// Read current variables: `{"getVars": true}`
    GetVars,
}

impl Request {
    /// Serialize to the text frame sent on the wire.
    #[must_use]
    pub fn to_frame(&self) -> String {
        let doc = match self {
            Self::Ping => json!({ "ping": true }),
            Self::ListPrograms => json!({ "listPrograms": true }),
            Self::ActivateProgram { id } => json!({ "activeProgramId": id }),
            Self::SetVars(vars) => json!({ "setVars": vars }),
            Self::GetVars => json!({ "getVars": true }),
        };
        doc.to_string()
    }

    /// Whether the controller answers this request.
    ///
    /// Pattern switches and variable sets are fire-and-forget.
    #[must_use]
    pub const fn expects_reply(&self) -> bool {
        matches!(self, Self::Ping | Self::ListPrograms | Self::GetVars)
    }

    /// Short name for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::ListPrograms => "listPrograms",
            Self::ActivateProgram { .. } => "activeProgramId",
            Self::SetVars(_) => "setVars",
            Self::GetVars => "getVars",
        }
    }
}

// ============================================================================
// Inbound Control Documents
// ============================================================================

/// A decoded JSON control document.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    /// Handshake acknowledgement
    Ack,
    /// Periodic status report carrying the render frame rate
    Status {
        /// Frames per second reported by the controller
        fps: f64,
    },
    /// Current pattern variables
    Vars(BTreeMap<String, f64>),
    /// Any other well-formed document
    Unknown(Value),
}

impl ControlMessage {
    /// Decode a JSON control document.
    ///
    /// Recognition order is `vars`, then `ack`, then `fps`. Documents with
    /// none of these keys decode to [`ControlMessage::Unknown`].
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if the text is not a JSON object or a
    /// recognized field has the wrong shape.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let Value::Object(doc) = value else {
            return Err(ProtocolError::NotAnObject(truncate(text)));
        };

        if let Some(vars) = doc.get("vars") {
            return decode_vars(vars).map(Self::Vars);
        }
        if doc.contains_key("ack") {
            return Ok(Self::Ack);
        }
        if let Some(fps) = doc.get("fps") {
            let fps = fps.as_f64().ok_or_else(|| ProtocolError::MalformedField {
                field: "fps",
                detail: format!("expected a number, got {fps}"),
            })?;
            return Ok(Self::Status { fps });
        }
        Ok(Self::Unknown(Value::Object(doc)))
    }

    /// Whether this document proves the peer is a controller.
    #[must_use]
    pub const fn is_handshake_reply(&self) -> bool {
        matches!(self, Self::Ack | Self::Status { .. })
    }
}

fn decode_vars(vars: &Value) -> ProtocolResult<BTreeMap<String, f64>> {
    let Value::Object(map) = vars else {
        return Err(ProtocolError::MalformedField {
            field: "vars",
            detail: format!("expected an object, got {}", truncate(&vars.to_string())),
        });
    };
    Ok(numeric_entries(map))
}

/// Keep numeric entries; array-valued pattern variables are not tracked.
fn numeric_entries(map: &Map<String, Value>) -> BTreeMap<String, f64> {
    map.iter()
        .filter_map(|(name, v)| v.as_f64().map(|f| (name.clone(), f)))
        .collect()
}

fn truncate(text: &str) -> String {
    const LIMIT: usize = 64;
    match text.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

// ============================================================================
// Frame Classification
// ============================================================================

/// An inbound frame after classification.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// JSON control document
    Control(ControlMessage),
    /// Raw pattern list text, possibly a fragment
    PatternList(String),
}

/// Classify an inbound text frame by its first character.
///
/// # Errors
///
/// Returns [`ProtocolError`] if a frame starting with `{` fails to decode.
pub fn classify_frame(text: &str) -> ProtocolResult<InboundFrame> {
    if text.starts_with('{') {
        ControlMessage::decode(text).map(InboundFrame::Control)
    } else {
        Ok(InboundFrame::PatternList(text.to_string()))
    }
}

// ============================================================================
// Pattern Catalog
// ============================================================================

/// One pattern advertised by a controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatternEntry {
    /// Opaque catalog id used to activate the pattern
    pub id: String,
    /// Human-readable pattern name
    pub name: String,
}

/// Ordered id to name mapping with unique ids.
///
/// Order follows the controller's listing, which is what "first match" means
/// in [`PatternCatalog::find_by_substring`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatternCatalog {
    entries: Vec<PatternEntry>,
}

impl PatternCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Parse newline/tab-delimited `<id>\t<name>` records.
    ///
    /// Lines without a tab are skipped. A repeated id keeps its first
    /// position and takes the later name.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut catalog = Self::new();
        for line in text.split(['\n', '\r']) {
            let Some((id, name)) = line.split_once('\t') else {
                continue;
            };
            let id = id.trim();
            if id.is_empty() {
                continue;
            }
            catalog.insert(id, name.trim());
        }
        catalog
    }

    /// Insert or rename an entry.
    pub fn insert(&mut self, id: &str, name: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.name = name.to_string();
        } else {
            self.entries.push(PatternEntry {
                id: id.to_string(),
                name: name.to_string(),
            });
        }
    }

    /// Name for a catalog id.
    #[must_use]
    pub fn name_of(&self, id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.name.as_str())
    }

    /// Whether the catalog contains the id.
    #[must_use]
    pub fn contains_id(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// First entry whose name contains `needle`, ignoring case.
    #[must_use]
    pub fn find_by_substring(&self, needle: &str) -> Option<&PatternEntry> {
        let needle = needle.to_lowercase();
        self.entries
            .iter()
            .find(|e| e.name.to_lowercase().contains(&needle))
    }

    /// Iterate entries in listing order.
    pub fn iter(&self) -> impl Iterator<Item = &PatternEntry> {
        self.entries.iter()
    }

    /// Number of patterns
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy into a sorted id to name map.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|e| (e.id.clone(), e.name.clone()))
            .collect()
    }
}

// ============================================================================
// Catalog Assembly
// ============================================================================

/// Accumulates pattern list fragments until the end-of-list marker.
#[derive(Debug, Default)]
pub struct CatalogAssembler {
    buffer: String,
    fragments: usize,
}

impl CatalogAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one pattern list frame.
    ///
    /// Returns `Ok(Some(catalog))` once a frame ending in `\n` or `\r`
    /// arrives, and resets for the next listing.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::EmptyCatalog`] if the finished text held content but
    /// no records, [`ProtocolError::CatalogTooLarge`] if the buffer overflows.
    pub fn push(&mut self, fragment: &str) -> ProtocolResult<Option<PatternCatalog>> {
        if self.buffer.len() + fragment.len() > MAX_CATALOG_BYTES {
            self.reset();
            return Err(ProtocolError::CatalogTooLarge(MAX_CATALOG_BYTES));
        }
        self.buffer.push_str(fragment);
        self.fragments += 1;

        if !fragment.ends_with(['\n', '\r']) {
            return Ok(None);
        }

        let text = std::mem::take(&mut self.buffer);
        let fragments = std::mem::take(&mut self.fragments);
        let catalog = PatternCatalog::parse(&text);
        if catalog.is_empty() && !text.trim().is_empty() {
            return Err(ProtocolError::EmptyCatalog);
        }
        tracing::trace!(patterns = catalog.len(), fragments, "pattern list complete");
        Ok(Some(catalog))
    }

    /// Whether a partial listing is buffered.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Drop any partial listing.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.fragments = 0;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "AB12CD34\tsparkfire\nEF56GH78\trainbow\n";

    #[test]
    fn test_request_frames() {
        assert_eq!(Request::Ping.to_frame(), r#"{"ping":true}"#);
        assert_eq!(Request::ListPrograms.to_frame(), r#"{"listPrograms":true}"#);
        assert_eq!(Request::GetVars.to_frame(), r#"{"getVars":true}"#);
        assert_eq!(
            Request::ActivateProgram { id: "AB12CD34".into() }.to_frame(),
            r#"{"activeProgramId":"AB12CD34"}"#
        );

        let mut vars = BTreeMap::new();
        vars.insert("hue".to_string(), 0.5);
        vars.insert("colorMoodBias".to_string(), 0.25);
        assert_eq!(
            Request::SetVars(vars).to_frame(),
            r#"{"setVars":{"colorMoodBias":0.25,"hue":0.5}}"#
        );
    }

    #[test]
    fn test_fire_and_forget_requests() {
        assert!(Request::Ping.expects_reply());
        assert!(Request::GetVars.expects_reply());
        assert!(!Request::SetVars(BTreeMap::new()).expects_reply());
        assert!(!Request::ActivateProgram { id: "x".into() }.expects_reply());
    }

    #[test]
    fn test_decode_control_messages() {
        assert_eq!(ControlMessage::decode(r#"{"ack":1}"#), Ok(ControlMessage::Ack));
        assert_eq!(
            ControlMessage::decode(r#"{"fps":59.5,"vmerr":0}"#),
            Ok(ControlMessage::Status { fps: 59.5 })
        );

        let ControlMessage::Vars(vars) =
            ControlMessage::decode(r#"{"vars":{"hue":0.3,"palette":[1,2]}}"#).unwrap()
        else {
            panic!("expected vars");
        };
        assert_eq!(vars.len(), 1);
        assert_eq!(vars["hue"], 0.3);

        assert!(matches!(
            ControlMessage::decode(r#"{"activeProgram":{}}"#),
            Ok(ControlMessage::Unknown(_))
        ));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            ControlMessage::decode("{not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            ControlMessage::decode("[1,2]"),
            Err(ProtocolError::NotAnObject(_))
        ));
        assert!(matches!(
            ControlMessage::decode(r#"{"fps":"fast"}"#),
            Err(ProtocolError::MalformedField { field: "fps", .. })
        ));
        assert!(matches!(
            ControlMessage::decode(r#"{"vars":3}"#),
            Err(ProtocolError::MalformedField { field: "vars", .. })
        ));
    }

    #[test]
    fn test_handshake_reply_recognition() {
        assert!(ControlMessage::Ack.is_handshake_reply());
        assert!(ControlMessage::Status { fps: 30.0 }.is_handshake_reply());
        assert!(!ControlMessage::Vars(BTreeMap::new()).is_handshake_reply());
    }

    #[test]
    fn test_classify_by_prefix() {
        assert_eq!(
            classify_frame(r#"{"ack":true}"#),
            Ok(InboundFrame::Control(ControlMessage::Ack))
        );
        assert_eq!(
            classify_frame(LISTING),
            Ok(InboundFrame::PatternList(LISTING.to_string()))
        );
    }

    #[test]
    fn test_catalog_parse() {
        let catalog = PatternCatalog::parse(LISTING);
        let expected: BTreeMap<String, String> = [
            ("AB12CD34".to_string(), "sparkfire".to_string()),
            ("EF56GH78".to_string(), "rainbow".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(catalog.to_map(), expected);
        assert_eq!(catalog.iter().next().map(|e| e.id.as_str()), Some("AB12CD34"));
    }

    #[test]
    fn test_catalog_parse_idempotent() {
        assert_eq!(PatternCatalog::parse(LISTING), PatternCatalog::parse(LISTING));
    }

    #[test]
    fn test_catalog_skips_junk_and_keeps_last_duplicate() {
        let catalog = PatternCatalog::parse("garbage\r\nA\tone\nB\ttwo\tparts\nA\tuno\n");
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.name_of("A"), Some("uno"));
        assert_eq!(catalog.name_of("B"), Some("two\tparts"));
        assert_eq!(catalog.iter().next().map(|e| e.id.as_str()), Some("A"));
    }

    #[test]
    fn test_substring_match() {
        let catalog = PatternCatalog::parse(LISTING);
        assert_eq!(
            catalog.find_by_substring("fire").map(|e| e.id.as_str()),
            Some("AB12CD34")
        );
        assert_eq!(
            catalog.find_by_substring("RAIN").map(|e| e.id.as_str()),
            Some("EF56GH78")
        );
        assert!(catalog.find_by_substring("nonexistent").is_none());
    }

    #[test]
    fn test_assembler_waits_for_line_ending() {
        let mut asm = CatalogAssembler::new();
        assert_eq!(asm.push("AB12CD34\tspark").unwrap(), None);
        assert!(asm.is_pending());
        let catalog = asm.push("fire\nEF56GH78\trainbow\n").unwrap().unwrap();
        assert_eq!(catalog, PatternCatalog::parse(LISTING));
        assert!(!asm.is_pending());
    }

    #[test]
    fn test_assembler_empty_listing() {
        let mut asm = CatalogAssembler::new();
        assert_eq!(asm.push("\n").unwrap(), Some(PatternCatalog::new()));
        assert_eq!(asm.push("no tabs here\n"), Err(ProtocolError::EmptyCatalog));
    }

    #[test]
    fn test_assembler_overflow() {
        let mut asm = CatalogAssembler::new();
        let chunk = "x".repeat(MAX_CATALOG_BYTES / 2 + 1);
        assert_eq!(asm.push(&chunk).unwrap(), None);
        assert!(matches!(
            asm.push(&chunk),
            Err(ProtocolError::CatalogTooLarge(_))
        ));
        assert!(!asm.is_pending());
    }
}
