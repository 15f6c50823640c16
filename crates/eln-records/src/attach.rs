//! Moving uploaded temporary files onto a finalized record.
//!
//! An attach request runs `Validating → Moving → PatchingParent → Done`.
//! Moving is stage-then-commit: every temp blob is copied first, the parent
//! is patched to reference the copies, and only then are the temp blobs
//! deleted. A failure before the patch lands removes the staged copies and
//! leaves the temp blobs in place, so the request can be retried as is.

use std::collections::HashSet;

use eln_types::escape::{final_attachment_name, original_name};
use eln_types::{escape_field_id, unescape_field_id, DocumentType};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::{AttachmentCode, RecordError, RecordResult};
use crate::store::{attachments_prefix, DocumentStore};

/// Outcome of [`AttachmentWorkflow::validate`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<AttachmentCode>,
    pub details: Map<String, Value>,
}

impl ValidationReport {
    fn passed(validated_files: usize) -> Self {
        let mut details = Map::new();
        details.insert("validated_files".into(), json!(validated_files));
        Self {
            valid: true,
            errors: Vec::new(),
            details,
        }
    }

    fn failed(code: AttachmentCode, details: Map<String, Value>) -> Self {
        Self {
            valid: false,
            errors: vec![code],
            details,
        }
    }
}

/// One file reference written into the parent record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedFile {
    pub final_path: String,
    pub original_name: String,
    pub file_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AttachOutcome {
    pub final_keys: Vec<String>,
    pub entries: Vec<AttachedFile>,
    /// Temp blobs that could not be removed after the parent was patched.
    pub leftover_temp_keys: Vec<String>,
}

/// The field id as it appears in temp keys and in `form_data`.
#[derive(Clone, Debug)]
struct FieldIds {
    escaped: String,
    unescaped: String,
}

impl FieldIds {
    fn new(field_id: &str) -> Self {
        let unescaped = unescape_field_id(field_id);
        Self {
            escaped: escape_field_id(&unescaped),
            unescaped,
        }
    }
}

struct Checked {
    eln_key: String,
    resolved: Vec<(String, String)>,
}

struct Failure {
    code: AttachmentCode,
    details: Map<String, Value>,
}

impl Failure {
    fn new(code: AttachmentCode, details: Value) -> Self {
        Self {
            code,
            details: details.as_object().cloned().unwrap_or_default(),
        }
    }
}

/// Attachment operations over a [`DocumentStore`].
#[derive(Clone, Copy, Debug)]
pub struct AttachmentWorkflow<'a> {
    store: &'a DocumentStore,
}

impl<'a> AttachmentWorkflow<'a> {
    pub fn new(store: &'a DocumentStore) -> Self {
        Self { store }
    }

    /// Check that an attach request can proceed. Never copies or deletes.
    pub async fn validate(
        &self,
        eln_uuid: &str,
        field_id: &str,
        file_ids: &[String],
        user_id: &str,
        sop_id: &str,
    ) -> ValidationReport {
        let field = FieldIds::new(field_id);
        match self.check(eln_uuid, &field, file_ids, user_id, sop_id).await {
            Ok(checked) => ValidationReport::passed(checked.resolved.len()),
            Err(failure) => {
                warn!(eln_uuid, field_id, code = %failure.code, "attach validation failed");
                ValidationReport::failed(failure.code, failure.details)
            }
        }
    }

    /// Move temp uploads onto the final record `eln_uuid` and reference
    /// them from `form_data[field_id]`.
    pub async fn attach(
        &self,
        eln_uuid: &str,
        field_id: &str,
        file_ids: &[String],
        user_id: &str,
        sop_id: &str,
    ) -> RecordResult<AttachOutcome> {
        if file_ids.is_empty() {
            debug!(eln_uuid, field_id, "nothing to attach");
            return Ok(AttachOutcome::default());
        }
        let field = FieldIds::new(field_id);
        let lock = self.store.attach_lock(eln_uuid);
        let _guard = lock.lock().await;

        let checked = self
            .check(eln_uuid, &field, file_ids, user_id, sop_id)
            .await
            .map_err(|failure| {
                warn!(eln_uuid, field_id, code = %failure.code, "attach rejected");
                RecordError::Attachment {
                    code: failure.code,
                    details: failure.details,
                }
            })?;

        let entries = self.stage(&checked, &field, user_id, sop_id).await?;
        let final_keys: Vec<String> = entries.iter().map(|e| e.final_path.clone()).collect();

        if let Err(err) = self.patch_parent(&checked, &field, &entries).await {
            error!(eln_uuid, error = %err, "failed to patch parent record");
            self.discard(&final_keys).await;
            return Err(err);
        }

        let mut leftover_temp_keys = Vec::new();
        for (_, temp_key) in &checked.resolved {
            match self.store.backend().delete(DocumentType::Drafts, temp_key).await {
                Ok(_) => debug!(key = %temp_key, "removed temp upload"),
                Err(err) => {
                    warn!(key = %temp_key, error = %err, "failed to remove temp upload");
                    leftover_temp_keys.push(temp_key.clone());
                }
            }
        }

        info!(eln_uuid, field = %field.unescaped, files = entries.len(), "attached files");
        Ok(AttachOutcome {
            final_keys,
            entries,
            leftover_temp_keys,
        })
    }

    async fn check(
        &self,
        eln_uuid: &str,
        field: &FieldIds,
        file_ids: &[String],
        user_id: &str,
        sop_id: &str,
    ) -> Result<Checked, Failure> {
        let unexpected = |err: RecordError| {
            Failure::new(
                AttachmentCode::ValidationFailed,
                json!({ "unexpected_error": err.to_string() }),
            )
        };

        if self.store.find_sop(sop_id).await.map_err(unexpected)?.is_none() {
            return Err(Failure::new(
                AttachmentCode::SopNotFound,
                json!({ "sop_id": sop_id }),
            ));
        }

        let Some(eln_key) = self
            .store
            .find_final_key(sop_id, eln_uuid)
            .await
            .map_err(unexpected)?
        else {
            return Err(Failure::new(
                AttachmentCode::ElnNotFound,
                json!({ "eln_uuid": eln_uuid, "sop_id": sop_id }),
            ));
        };

        let document = match self.store.load(DocumentType::Submissions, &eln_key).await {
            Ok(document) => document,
            Err(RecordError::Serialization(err)) => {
                return Err(Failure::new(
                    AttachmentCode::ElnCorrupted,
                    json!({ "reason": err.to_string() }),
                ));
            }
            Err(err) if err.is_not_found() => {
                return Err(Failure::new(
                    AttachmentCode::ElnNotFound,
                    json!({ "eln_uuid": eln_uuid, "sop_id": sop_id }),
                ));
            }
            Err(err) => return Err(unexpected(err)),
        };

        if !field_is_referenced(&document, field) {
            return Err(Failure::new(
                AttachmentCode::FieldNotFound,
                json!({ "field_id": field.unescaped }),
            ));
        }
        if let Some(reason) = unpatchable_reason(&document, field) {
            return Err(Failure::new(
                AttachmentCode::FieldNotFound,
                json!({ "field_id": field.unescaped, "reason": reason }),
            ));
        }

        let mut resolved = Vec::with_capacity(file_ids.len());
        let mut missing = Vec::new();
        let mut ambiguous = Vec::new();
        let mut seen = HashSet::new();
        for file_id in file_ids.iter().filter(|id| seen.insert(id.as_str())) {
            let prefix = format!(
                "{}{user_id}-{}-{file_id}-",
                attachments_prefix(DocumentType::Drafts, sop_id),
                field.escaped
            );
            let mut keys = self
                .store
                .backend()
                .list_raw_files(DocumentType::Drafts, &prefix)
                .await
                .map_err(|e| unexpected(e.into()))?;
            match keys.len() {
                0 => missing.push(file_id.clone()),
                1 => resolved.push((file_id.clone(), keys.remove(0))),
                _ => ambiguous.push(file_id.clone()),
            }
        }

        if !missing.is_empty() || !ambiguous.is_empty() {
            let mut details = json!({
                "missing_files": missing,
                "missing_count": missing.len(),
            });
            if !ambiguous.is_empty() {
                details["ambiguous_files"] = json!(ambiguous);
            }
            return Err(Failure::new(AttachmentCode::FilesNotFound, details));
        }

        Ok(Checked { eln_key, resolved })
    }

    /// Copy every temp blob to its final key. On failure the copies made so
    /// far are removed.
    async fn stage(
        &self,
        checked: &Checked,
        field: &FieldIds,
        user_id: &str,
        sop_id: &str,
    ) -> RecordResult<Vec<AttachedFile>> {
        let final_prefix = attachments_prefix(DocumentType::Submissions, sop_id);
        let mut entries: Vec<AttachedFile> = Vec::with_capacity(checked.resolved.len());

        for (file_id, temp_key) in &checked.resolved {
            let temp_name = temp_key.rsplit('/').next().unwrap_or(temp_key);
            let final_key = format!("{final_prefix}{}", final_attachment_name(temp_name));
            let copied = self
                .store
                .backend()
                .copy(DocumentType::Drafts, temp_key, DocumentType::Submissions, &final_key)
                .await;
            if let Err(err) = copied {
                error!(file_id = %file_id, temp_key = %temp_key, error = %err, "failed to stage attachment");
                let staged: Vec<String> = entries.iter().map(|e| e.final_path.clone()).collect();
                self.discard(&staged).await;
                return Err(err.into());
            }
            debug!(from = %temp_key, to = %final_key, "staged attachment");
            entries.push(AttachedFile {
                final_path: final_key,
                original_name: original_name(temp_name, user_id, &field.unescaped, file_id),
                file_id: file_id.clone(),
            });
        }
        Ok(entries)
    }

    /// Reference the staged copies from the parent. Never replaces submitted
    /// values: a non-object `form_data` or field value is an error.
    async fn patch_parent(
        &self,
        checked: &Checked,
        field: &FieldIds,
        entries: &[AttachedFile],
    ) -> RecordResult<()> {
        let eln_key = checked.eln_key.as_str();
        let mut document = self.store.load(DocumentType::Submissions, eln_key).await?;
        if let Some(reason) = unpatchable_reason(&document, field) {
            return Err(RecordError::Validation(format!("record {eln_key}: {reason}")));
        }
        let Some(root) = document.as_object_mut() else {
            return Err(RecordError::Validation(format!(
                "record {eln_key} is not a JSON object"
            )));
        };
        let files = serde_json::to_value(entries)?;
        let form = root
            .entry("form_data")
            .or_insert_with(|| Value::Object(Map::new()));
        if form.is_null() {
            *form = Value::Object(Map::new());
        }
        let Some(form) = form.as_object_mut() else {
            return Err(RecordError::Validation(format!(
                "record {eln_key}: form_data is not an object"
            )));
        };

        match form.get_mut(&field.unescaped) {
            Some(Value::Object(existing)) => {
                existing.insert("files".into(), files);
                existing.remove("uploadedUrls");
            }
            Some(Value::Null) | None => {
                let file_ids: Vec<&str> =
                    checked.resolved.iter().map(|(id, _)| id.as_str()).collect();
                form.insert(
                    field.unescaped.clone(),
                    json!({ "fileIds": file_ids, "files": files }),
                );
            }
            Some(_) => {
                return Err(RecordError::Validation(format!(
                    "record {eln_key}: field {} holds a submitted value",
                    field.unescaped
                )));
            }
        }

        self.store
            .put_document(DocumentType::Submissions, eln_key, &document)
            .await
    }

    async fn discard(&self, keys: &[String]) {
        for key in keys {
            if let Err(err) = self.store.backend().delete(DocumentType::Submissions, key).await {
                warn!(key = %key, error = %err, "failed to remove staged attachment");
            }
        }
    }
}

/// Why the parent's `form_data` cannot take file references for `field`.
fn unpatchable_reason(document: &Value, field: &FieldIds) -> Option<&'static str> {
    match document.get("form_data") {
        None | Some(Value::Null) => None,
        Some(Value::Object(form)) => match form.get(&field.unescaped) {
            None | Some(Value::Null) | Some(Value::Object(_)) => None,
            Some(_) => Some("field holds a non-object value"),
        },
        Some(_) => Some("form_data is not an object"),
    }
}

fn field_is_referenced(document: &Value, field: &FieldIds) -> bool {
    let form = document.get("form_data").and_then(Value::as_object);
    if form.is_some_and(|f| f.contains_key(&field.escaped) || f.contains_key(&field.unescaped)) {
        return true;
    }
    document
        .get("field_definitions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .any(|def| {
            let id = def.get("id").and_then(Value::as_str);
            let is_file = def.get("type").and_then(Value::as_str) == Some("file");
            is_file && (id == Some(field.escaped.as_str()) || id == Some(field.unescaped.as_str()))
        })
}
