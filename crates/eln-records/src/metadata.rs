use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use eln_types::parse_filename;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RecordError, RecordResult};

/// Which projection to build from a stored document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetadataType {
    Draft,
    Final,
}

/// Lightweight view of a stored document, used for listings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub sop_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub variables: Vec<String>,
    #[serde(flatten)]
    pub kind: MetadataKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetadataKind {
    Draft(DraftFields),
    Final(FinalFields),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DraftFields {
    pub draft_id: String,
    pub draft_uuid: String,
    pub session_id: String,
    pub completion_percentage: f64,
    pub title: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalFields {
    pub eln_uuid: String,
    pub filename: String,
    pub status: String,
}

impl Metadata {
    /// Project a stored envelope.
    ///
    /// Filename variables are recovered from the stored filename; documents
    /// whose filename does not parse get an empty variable list.
    pub fn from_document(document: &Value, metadata_type: MetadataType) -> RecordResult<Self> {
        let sop_id = required_str(document, "sop_id")?;
        let user_id = required_str(document, "user_id")?;
        let raw_timestamp = required_str(document, "timestamp")?;
        let timestamp = parse_timestamp(&raw_timestamp).ok_or_else(|| {
            RecordError::Validation(format!("unparseable timestamp: {raw_timestamp}"))
        })?;
        let checksum = optional_str(document, "checksum").filter(|c| !c.is_empty());
        let variables = optional_str(document, "filename")
            .and_then(|name| parse_filename(&name).ok())
            .map(|parsed| parsed.variables)
            .unwrap_or_default();

        let (kind, size_bytes) = match metadata_type {
            MetadataType::Draft => {
                let draft_id = required_str(document, "draft_id")?;
                let draft_uuid = optional_str(document, "draft_uuid")
                    .filter(|u| !u.is_empty())
                    .unwrap_or_else(|| draft_id.rsplit('-').next().unwrap_or_default().to_string());
                let size = match document.get("size_bytes").and_then(Value::as_u64) {
                    Some(size) => size,
                    None => compact_len(document.get("form_data").unwrap_or(&Value::Null))?,
                };
                let kind = MetadataKind::Draft(DraftFields {
                    draft_id,
                    draft_uuid,
                    session_id: optional_str(document, "session_id")
                        .unwrap_or_else(|| "default".to_string()),
                    completion_percentage: document
                        .get("completion_percentage")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0),
                    title: optional_str(document, "title"),
                });
                (kind, size)
            }
            MetadataType::Final => {
                let kind = MetadataKind::Final(FinalFields {
                    eln_uuid: required_str(document, "eln_uuid")?,
                    filename: required_str(document, "filename")?,
                    status: optional_str(document, "status").unwrap_or_else(|| "final".to_string()),
                });
                (kind, compact_len(document)?)
            }
        };

        Ok(Self {
            sop_id,
            user_id,
            timestamp,
            size_bytes,
            checksum,
            variables,
            kind,
        })
    }

    /// The record's short id: `draft_uuid` for drafts, `eln_uuid` for finals.
    pub fn uuid(&self) -> &str {
        match &self.kind {
            MetadataKind::Draft(d) => &d.draft_uuid,
            MetadataKind::Final(f) => &f.eln_uuid,
        }
    }

    /// Storage basename (filename without `.json`).
    pub fn basename(&self) -> &str {
        match &self.kind {
            MetadataKind::Draft(d) => &d.draft_id,
            MetadataKind::Final(f) => f.filename.strip_suffix(".json").unwrap_or(&f.filename),
        }
    }

    pub fn as_draft(&self) -> Option<&DraftFields> {
        match &self.kind {
            MetadataKind::Draft(d) => Some(d),
            MetadataKind::Final(_) => None,
        }
    }

    pub fn as_final(&self) -> Option<&FinalFields> {
        match &self.kind {
            MetadataKind::Final(f) => Some(f),
            MetadataKind::Draft(_) => None,
        }
    }
}

/// Parse an ISO-8601 timestamp. Values without an offset are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn compact_len(value: &Value) -> RecordResult<u64> {
    Ok(serde_json::to_vec(value)?.len() as u64)
}

fn required_str(document: &Value, field: &str) -> RecordResult<String> {
    optional_str(document, field)
        .ok_or_else(|| RecordError::Validation(format!("document is missing `{field}`")))
}

fn optional_str(document: &Value, field: &str) -> Option<String> {
    document.get(field).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn draft_doc() -> Value {
        json!({
            "draft_id": "draft-u1-p1-pt1-20250729_120000-abcd1234",
            "draft_uuid": "abcd1234",
            "filename": "draft-u1-p1-pt1-20250729_120000-abcd1234.json",
            "sop_id": "S1",
            "user_id": "u1",
            "session_id": "sess",
            "timestamp": "2025-07-29T12:00:00.000000+00:00",
            "form_data": {"a": 1},
            "completion_percentage": 42.5,
            "title": null,
            "size_bytes": 7,
            "status": "draft"
        })
    }

    #[test]
    fn draft_projection() {
        let meta = Metadata::from_document(&draft_doc(), MetadataType::Draft).unwrap();
        assert_eq!(meta.uuid(), "abcd1234");
        assert_eq!(meta.basename(), "draft-u1-p1-pt1-20250729_120000-abcd1234");
        assert_eq!(meta.variables, vec!["p1", "pt1"]);
        assert_eq!(meta.size_bytes, 7);
        assert!(meta.checksum.is_none());
        let draft = meta.as_draft().unwrap();
        assert_eq!(draft.session_id, "sess");
        assert_eq!(draft.completion_percentage, 42.5);
        assert!(draft.title.is_none());
    }

    #[test]
    fn draft_uuid_falls_back_to_id_suffix() {
        let mut doc = draft_doc();
        doc["draft_uuid"] = json!("");
        let meta = Metadata::from_document(&doc, MetadataType::Draft).unwrap();
        assert_eq!(meta.uuid(), "abcd1234");
    }

    #[test]
    fn final_projection_measures_whole_envelope() {
        let doc = json!({
            "eln_uuid": "ffff0000",
            "filename": "final-u1-p1-20250729_120000-ffff0000.json",
            "sop_id": "S1",
            "user_id": "u1",
            "timestamp": "2025-07-29T12:00:00+00:00",
            "form_data": {},
            "checksum": "abc",
            "status": "final"
        });
        let meta = Metadata::from_document(&doc, MetadataType::Final).unwrap();
        assert_eq!(meta.size_bytes, serde_json::to_vec(&doc).unwrap().len() as u64);
        assert_eq!(meta.checksum.as_deref(), Some("abc"));
        assert_eq!(meta.basename(), "final-u1-p1-20250729_120000-ffff0000");
        assert_eq!(meta.as_final().unwrap().status, "final");
    }

    #[test]
    fn missing_required_field_is_validation_error() {
        let err = Metadata::from_document(&json!({"sop_id": "S1"}), MetadataType::Final).unwrap_err();
        assert!(matches!(err, RecordError::Validation(_)));
    }

    #[test]
    fn naive_timestamps_are_utc() {
        let naive = parse_timestamp("2025-01-02T03:04:05.123456").unwrap();
        let aware = parse_timestamp("2025-01-02T03:04:05.123456+00:00").unwrap();
        assert_eq!(naive, aware);
        let shifted = parse_timestamp("2025-01-02T05:04:05+02:00").unwrap();
        assert_eq!(shifted, Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn serializes_with_kind_tag() {
        let meta = Metadata::from_document(&draft_doc(), MetadataType::Draft).unwrap();
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["kind"], "draft");
        assert_eq!(value["draft_id"], "draft-u1-p1-pt1-20250729_120000-abcd1234");
    }
}
