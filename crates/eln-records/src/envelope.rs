//! Assembly of the stored document envelope.
//!
//! Envelopes are serialized with sorted keys; `serde_json::Map` keeps keys
//! ordered, so `to_vec` output is canonical.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use eln_store::Attributes;
use eln_types::DocumentType;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::RecordResult;

pub const SCHEMA_CONTEXT: &str = "https://schema.org";
pub const DATASET_TYPE: &str = "Dataset";
pub const DEFAULT_SESSION_ID: &str = "default";

/// Identity and ownership shared by both envelope shapes.
#[derive(Clone, Debug)]
pub struct EnvelopeBase<'a> {
    pub filename: &'a str,
    pub short_id: &'a str,
    pub sop_id: &'a str,
    pub user_id: &'a str,
    pub timestamp: DateTime<Utc>,
    pub form_data: &'a Value,
}

/// Draft-only envelope inputs.
#[derive(Clone, Debug, Default)]
pub struct DraftParts<'a> {
    pub session_id: Option<&'a str>,
    pub completion_percentage: f64,
    pub title: Option<&'a str>,
}

/// Final-only envelope inputs.
#[derive(Clone, Debug, Default)]
pub struct FinalParts<'a> {
    pub sop_metadata: Option<&'a Value>,
    pub field_definitions: Option<&'a Value>,
    pub draft_uuid: &'a str,
    pub draft_id: &'a str,
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Hex SHA-256 of the sorted-key JSON of `form_data`.
pub fn checksum(form_data: &Value) -> RecordResult<String> {
    Ok(hex::encode(Sha256::digest(serde_json::to_vec(form_data)?)))
}

pub fn draft_envelope(base: &EnvelopeBase<'_>, parts: &DraftParts<'_>) -> RecordResult<Value> {
    let size_bytes = serde_json::to_vec(base.form_data)?.len();
    let draft_id = base
        .filename
        .strip_suffix(".json")
        .unwrap_or(base.filename);
    Ok(json!({
        "draft_id": draft_id,
        "draft_uuid": base.short_id,
        "filename": base.filename,
        "sop_id": base.sop_id,
        "user_id": base.user_id,
        "session_id": parts.session_id.unwrap_or(DEFAULT_SESSION_ID),
        "timestamp": format_timestamp(base.timestamp),
        "form_data": base.form_data,
        "completion_percentage": parts.completion_percentage,
        "title": parts.title,
        "size_bytes": size_bytes,
        "status": "draft",
    }))
}

pub fn final_envelope(base: &EnvelopeBase<'_>, parts: &FinalParts<'_>) -> RecordResult<Value> {
    Ok(json!({
        "@context": SCHEMA_CONTEXT,
        "@type": DATASET_TYPE,
        "eln_uuid": base.short_id,
        "draft_uuid": parts.draft_uuid,
        "draft_id": parts.draft_id,
        "filename": base.filename,
        "sop_id": base.sop_id,
        "user_id": base.user_id,
        "timestamp": format_timestamp(base.timestamp),
        "form_data": base.form_data,
        "sop_metadata": parts.sop_metadata.cloned().unwrap_or_else(|| json!({})),
        "field_definitions": parts.field_definitions.cloned().unwrap_or_else(|| json!([])),
        "checksum": checksum(base.form_data)?,
        "status": "final",
    }))
}

/// Object attributes written next to an envelope, read back from it.
pub fn storage_attributes(doc_type: DocumentType, document: &Value) -> Attributes {
    let field = |name: &str| {
        document
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let uuid_field = match doc_type {
        DocumentType::Submissions => "eln_uuid",
        _ => "draft_uuid",
    };

    let mut attrs = Attributes::new();
    attrs.insert(format!("{doc_type}-uuid"), field(uuid_field));
    attrs.insert("user-id".into(), field("user_id"));
    attrs.insert("status".into(), field("status"));
    attrs.insert("timestamp".into(), field("timestamp"));
    if doc_type == DocumentType::Submissions {
        attrs.insert("checksum".into(), field("checksum"));
    }
    attrs
}

pub fn to_bytes(document: &Value) -> RecordResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(document)?))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn base<'a>(form: &'a Value, filename: &'a str) -> EnvelopeBase<'a> {
        EnvelopeBase {
            filename,
            short_id: "abcd1234",
            sop_id: "S1",
            user_id: "u1",
            timestamp: Utc.with_ymd_and_hms(2025, 7, 29, 12, 0, 0).unwrap(),
            form_data: form,
        }
    }

    #[test]
    fn timestamps_carry_micros_and_offset() {
        let ts = Utc.with_ymd_and_hms(2025, 7, 29, 12, 0, 0).unwrap();
        assert_eq!(format_timestamp(ts), "2025-07-29T12:00:00.000000+00:00");
    }

    #[test]
    fn checksum_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(checksum(&a).unwrap(), checksum(&b).unwrap());
        assert_eq!(checksum(&a).unwrap().len(), 64);
        assert_ne!(checksum(&a).unwrap(), checksum(&json!({"b": 2})).unwrap());
    }

    #[test]
    fn draft_shape() {
        let form = json!({"sample": "x"});
        let doc = draft_envelope(
            &base(&form, "draft-u1-p1-20250729_120000-abcd1234.json"),
            &DraftParts::default(),
        )
        .unwrap();
        assert_eq!(doc["draft_id"], "draft-u1-p1-20250729_120000-abcd1234");
        assert_eq!(doc["draft_uuid"], "abcd1234");
        assert_eq!(doc["session_id"], DEFAULT_SESSION_ID);
        assert_eq!(doc["size_bytes"], 14);
        assert!(doc.get("checksum").is_none());
        assert!(doc["title"].is_null());
    }

    #[test]
    fn final_shape() {
        let form = json!({"sample": "x"});
        let parts = FinalParts {
            draft_uuid: "dddd0000",
            draft_id: "draft-u1-p1-20250729_110000-dddd0000",
            ..FinalParts::default()
        };
        let doc = final_envelope(&base(&form, "final-u1-p1-20250729_120000-abcd1234.json"), &parts)
            .unwrap();
        assert_eq!(doc["@context"], SCHEMA_CONTEXT);
        assert_eq!(doc["@type"], DATASET_TYPE);
        assert_eq!(doc["eln_uuid"], "abcd1234");
        assert_eq!(doc["draft_uuid"], "dddd0000");
        assert_eq!(doc["sop_metadata"], json!({}));
        assert_eq!(doc["field_definitions"], json!([]));
        assert_eq!(doc["checksum"], checksum(&form).unwrap());
    }

    #[test]
    fn attributes_follow_document_type() {
        let form = json!({});
        let doc = final_envelope(&base(&form, "f.json"), &FinalParts::default()).unwrap();
        let attrs = storage_attributes(DocumentType::Submissions, &doc);
        assert_eq!(attrs["submissions-uuid"], "abcd1234");
        assert_eq!(attrs["user-id"], "u1");
        assert!(attrs.contains_key("checksum"));

        let doc = draft_envelope(&base(&form, "d.json"), &DraftParts::default()).unwrap();
        let attrs = storage_attributes(DocumentType::Drafts, &doc);
        assert_eq!(attrs["drafts-uuid"], "abcd1234");
        assert!(!attrs.contains_key("checksum"));
    }

    #[test]
    fn serialized_keys_are_sorted() {
        let form = json!({"z": 1, "a": 2});
        let doc = draft_envelope(&base(&form, "d.json"), &DraftParts::default()).unwrap();
        let text = String::from_utf8(to_bytes(&doc).unwrap().to_vec()).unwrap();
        let completion = text.find("\"completion_percentage\"").unwrap();
        let user = text.find("\"user_id\"").unwrap();
        assert!(completion < user);
        assert!(text.contains(r#"{"a":2,"z":1}"#));
    }
}
