use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use eln_store::{open_backend, Attributes, Backend, StorageConfig};
use eln_types::escape::{escape_field_id, temp_file_key};
use eln_types::names::RECORD_EXTENSION;
use eln_types::{parse_filename, Clock, DocumentType, IdentityGenerator, Status};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::attach::AttachmentWorkflow;
use crate::caller::CallerIdentity;
use crate::envelope::{
    draft_envelope, final_envelope, storage_attributes, to_bytes, DraftParts, EnvelopeBase,
    FinalParts,
};
use crate::error::{RecordError, RecordResult};
use crate::metadata::{parse_timestamp, Metadata, MetadataType};
use crate::upload;

/// Extensions under which a SOP definition may be stored.
const SOP_EXTENSIONS: [&str; 3] = [".json", ".yaml", ".yml"];

/// Optional inputs to [`DocumentStore::save`].
#[derive(Clone, Debug, Default)]
pub struct SaveExtras {
    pub session_id: Option<String>,
    /// Schema field ids used when a filename variable is blank.
    pub field_ids: Vec<String>,
    pub field_definitions: Option<Value>,
    pub sop_metadata: Option<Value>,
    /// Back-reference for finals; looked up from the newest draft when unset.
    pub draft_uuid: Option<String>,
    pub draft_id: Option<String>,
    pub completion_percentage: f64,
    pub title: Option<String>,
    /// Overwrite this existing draft instead of minting a new identity.
    pub replace_draft: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SaveRequest {
    pub doc_type: DocumentType,
    pub sop_id: String,
    pub user_id: String,
    pub status: String,
    pub filename_variables: Vec<String>,
    pub data: Value,
    pub extras: SaveExtras,
}

impl SaveRequest {
    pub fn draft(
        caller: &CallerIdentity,
        sop_id: impl Into<String>,
        filename_variables: Vec<String>,
        data: Value,
    ) -> Self {
        Self::for_type(DocumentType::Drafts, Status::Draft, caller, sop_id, filename_variables, data)
    }

    pub fn submission(
        caller: &CallerIdentity,
        sop_id: impl Into<String>,
        filename_variables: Vec<String>,
        data: Value,
    ) -> Self {
        Self::for_type(
            DocumentType::Submissions,
            Status::Final,
            caller,
            sop_id,
            filename_variables,
            data,
        )
    }

    pub fn with_extras(mut self, extras: SaveExtras) -> Self {
        self.extras = extras;
        self
    }

    fn for_type(
        doc_type: DocumentType,
        status: Status,
        caller: &CallerIdentity,
        sop_id: impl Into<String>,
        filename_variables: Vec<String>,
        data: Value,
    ) -> Self {
        Self {
            doc_type,
            sop_id: sop_id.into(),
            user_id: caller.user_id().to_string(),
            status: status.as_str().to_string(),
            filename_variables,
            data,
            extras: SaveExtras::default(),
        }
    }
}

/// Filters applied by [`DocumentStore::list`]. Empty fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub user_id: Option<String>,
    pub status: Option<String>,
    /// Compared by position against the variables in the stored filename.
    pub filename_variables: Vec<String>,
}

impl ListFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    fn matches(&self, document: &Value) -> bool {
        let field = |name: &str| document.get(name).and_then(Value::as_str);
        if let Some(user_id) = &self.user_id {
            if field("user_id") != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(status) = &self.status {
            if field("status") != Some(status.as_str()) {
                return false;
            }
        }
        if self.filename_variables.is_empty() {
            return true;
        }
        let Some(parsed) = field("filename").and_then(|name| parse_filename(name).ok()) else {
            return false;
        };
        self.filename_variables
            .iter()
            .enumerate()
            .all(|(i, var)| parsed.variables.get(i) == Some(var))
    }
}

/// A temporary upload accepted by [`DocumentStore::upload_temp_file`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoredUpload {
    pub file_id: String,
    pub key: String,
    pub original_name: String,
    pub size: usize,
}

/// Storage key of a document. `basename` is ignored for SOPs.
pub fn document_key(doc_type: DocumentType, sop_id: &str, basename: &str) -> String {
    match doc_type {
        DocumentType::Sops => format!("sops/{sop_id}{RECORD_EXTENSION}"),
        _ => format!("{doc_type}/{sop_id}/{basename}{RECORD_EXTENSION}"),
    }
}

/// Prefix under which a SOP's attachment blobs live.
pub fn attachments_prefix(doc_type: DocumentType, sop_id: &str) -> String {
    format!("{doc_type}/{sop_id}/attachments/")
}

pub fn is_attachment_key(key: &str) -> bool {
    key.contains("/attachments/")
}

/// Backend-agnostic document store for drafts, finals and SOPs.
pub struct DocumentStore {
    backend: Arc<dyn Backend>,
    identity: IdentityGenerator,
    clock: Arc<dyn Clock>,
    attach_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DocumentStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_identity(backend, IdentityGenerator::new())
    }

    /// Use a specific identity generator; its clock also stamps documents.
    pub fn with_identity(backend: Arc<dyn Backend>, identity: IdentityGenerator) -> Self {
        let clock = Arc::clone(identity.clock());
        Self {
            backend,
            identity,
            clock,
            attach_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &StorageConfig) -> RecordResult<Self> {
        let backend = open_backend(config)?;
        let identity = IdentityGenerator::new().with_max_attempts(config.max_id_attempts);
        Ok(Self::with_identity(backend, identity))
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn identity(&self) -> &IdentityGenerator {
        &self.identity
    }

    pub fn attachments(&self) -> AttachmentWorkflow<'_> {
        AttachmentWorkflow::new(self)
    }

    // ---- writes ----

    /// Save a draft or a final record.
    ///
    /// Returns the draft id for drafts and the short id for finals.
    pub async fn save(&self, request: SaveRequest) -> RecordResult<(String, Metadata)> {
        let SaveRequest {
            doc_type,
            sop_id,
            user_id,
            status,
            filename_variables,
            data,
            extras,
        } = request;

        let expected = doc_type.expected_status().ok_or_else(|| {
            RecordError::Validation("sop documents are written with save_sop".into())
        })?;
        let status: Status = status.parse()?;
        if status != expected {
            return Err(RecordError::Validation(format!(
                "{doc_type} must have status {expected}, got {status}"
            )));
        }

        let now = self.clock.now();
        let (filename, short_id) = match extras.replace_draft.as_deref() {
            Some(draft_id) => existing_draft_identity(doc_type, draft_id)?,
            None => {
                let name = self.identity.generate_at(
                    status.as_str(),
                    &user_id,
                    &filename_variables,
                    &extras.field_ids,
                    now,
                    None,
                )?;
                (name.filename, name.short_id)
            }
        };
        let basename = filename
            .strip_suffix(RECORD_EXTENSION)
            .unwrap_or(&filename)
            .to_string();
        let key = document_key(doc_type, &sop_id, &basename);
        let base = EnvelopeBase {
            filename: &filename,
            short_id: &short_id,
            sop_id: &sop_id,
            user_id: &user_id,
            timestamp: now,
            form_data: &data,
        };

        let (document, metadata_type, returned_id) = if doc_type == DocumentType::Submissions {
            let (draft_uuid, draft_id) = match extras.draft_uuid.clone() {
                Some(uuid) => (uuid, extras.draft_id.clone().unwrap_or_default()),
                None => self.latest_draft_reference(&sop_id, &user_id).await,
            };
            if self.backend.head(doc_type, &key).await? {
                warn!(key = %key, "refusing to overwrite final record");
                return Err(RecordError::ImmutableViolation { key });
            }
            let parts = FinalParts {
                sop_metadata: extras.sop_metadata.as_ref(),
                field_definitions: extras.field_definitions.as_ref(),
                draft_uuid: &draft_uuid,
                draft_id: &draft_id,
            };
            (final_envelope(&base, &parts)?, MetadataType::Final, short_id.clone())
        } else {
            let parts = DraftParts {
                session_id: extras.session_id.as_deref(),
                completion_percentage: extras.completion_percentage,
                title: extras.title.as_deref(),
            };
            (draft_envelope(&base, &parts)?, MetadataType::Draft, basename.clone())
        };

        self.put_document(doc_type, &key, &document).await?;
        info!(doc_type = %doc_type, key = %key, "saved document");
        let metadata = Metadata::from_document(&document, metadata_type)?;
        Ok((returned_id, metadata))
    }

    /// Store a SOP definition at `sops/{sop_id}.json`.
    pub async fn save_sop(&self, sop_id: &str, definition: &Value) -> RecordResult<String> {
        let key = document_key(DocumentType::Sops, sop_id, "");
        let mut attrs = Attributes::new();
        attrs.insert("sop-id".into(), sop_id.to_string());
        self.backend
            .put(DocumentType::Sops, &key, to_bytes(definition)?, &attrs)
            .await?;
        info!(sop_id, key = %key, "saved sop");
        Ok(key)
    }

    pub async fn delete(&self, doc_type: DocumentType, sop_id: &str, id: &str) -> RecordResult<bool> {
        let key = document_key(doc_type, sop_id, id);
        let existed = self.backend.delete(doc_type, &key).await?;
        info!(doc_type = %doc_type, key = %key, existed, "deleted document");
        Ok(existed)
    }

    /// Write a temporary upload blob to the drafts attachment area.
    pub async fn store_temp_file(
        &self,
        file_id: &str,
        content: Bytes,
        user_id: &str,
        field_id: &str,
        sop_id: &str,
        original_name: &str,
    ) -> RecordResult<String> {
        let key = temp_file_key(sop_id, user_id, field_id, file_id, original_name);
        let mut attrs = Attributes::new();
        attrs.insert("user-id".into(), user_id.to_string());
        attrs.insert("field-id".into(), field_id.to_string());
        attrs.insert("file-id".into(), file_id.to_string());
        let size = content.len();
        self.backend
            .put(DocumentType::Drafts, &key, content, &attrs)
            .await?;
        info!(key = %key, size, "stored temporary upload");
        Ok(key)
    }

    /// Screen an upload, mint a file id unused for this user and field, and
    /// store it.
    pub async fn upload_temp_file(
        &self,
        original_name: &str,
        content: Bytes,
        user_id: &str,
        field_id: &str,
        sop_id: &str,
    ) -> RecordResult<StoredUpload> {
        let screened = upload::validate_file(original_name, &content)?;

        let prefix = format!(
            "{}{user_id}-{}-",
            attachments_prefix(DocumentType::Drafts, sop_id),
            escape_field_id(field_id)
        );
        let taken: HashSet<String> = self
            .backend
            .list_raw_files(DocumentType::Drafts, &prefix)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('-').next())
            .map(str::to_string)
            .collect();
        let exists: &dyn Fn(&str) -> bool = &|id| taken.contains(id);
        let file_id = self.identity.generate_short_id(Some(exists), "temp file id")?;

        let key = self
            .store_temp_file(
                &file_id,
                content,
                user_id,
                field_id,
                sop_id,
                &screened.sanitized_name,
            )
            .await?;
        Ok(StoredUpload {
            file_id,
            key,
            original_name: screened.sanitized_name,
            size: screened.size,
        })
    }

    // ---- reads ----

    /// Fetch a document; `None` when it does not exist.
    pub async fn get(
        &self,
        doc_type: DocumentType,
        sop_id: &str,
        basename: &str,
    ) -> RecordResult<Option<Value>> {
        let key = document_key(doc_type, sop_id, basename);
        match self.load(doc_type, &key).await {
            Ok(document) => Ok(Some(document)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// List metadata for a SOP, newest first.
    ///
    /// An empty `sop_id` with [`DocumentType::Drafts`] lists drafts across
    /// every SOP. A `limit` of `None` or `Some(0)` is unlimited.
    pub async fn list(
        &self,
        doc_type: DocumentType,
        sop_id: &str,
        metadata_type: MetadataType,
        filter: &ListFilter,
        limit: Option<usize>,
    ) -> RecordResult<Vec<Metadata>> {
        let prefix = if doc_type == DocumentType::Drafts && sop_id.is_empty() {
            "drafts/".to_string()
        } else {
            format!("{doc_type}/{sop_id}/")
        };
        let mut items: Vec<Metadata> = self
            .collect(doc_type, &prefix, metadata_type, |doc| filter.matches(doc))
            .await?
            .into_iter()
            .map(|(_, metadata)| metadata)
            .collect();
        if let Some(limit) = limit.filter(|l| *l > 0) {
            items.truncate(limit);
        }
        Ok(items)
    }

    /// Find a final record by its short id, scanning every SOP.
    ///
    /// This reads the whole submissions area and is expensive.
    pub async fn get_by_uuid(&self, uuid: &str) -> RecordResult<(Value, Metadata)> {
        let suffix = format!("-{uuid}{RECORD_EXTENSION}");
        let entries = self
            .backend
            .list_by_prefix(DocumentType::Submissions, "submissions/")
            .await?;
        for entry in entries
            .iter()
            .filter(|e| !is_attachment_key(&e.key) && e.key.ends_with(&suffix))
        {
            let document = match self.load(DocumentType::Submissions, &entry.key).await {
                Ok(document) => document,
                Err(err) => {
                    warn!(key = %entry.key, error = %err, "failed to check document");
                    continue;
                }
            };
            if document.get("eln_uuid").and_then(Value::as_str) != Some(uuid) {
                continue;
            }
            match Metadata::from_document(&document, MetadataType::Final) {
                Ok(metadata) => return Ok((document, metadata)),
                Err(err) => warn!(key = %entry.key, error = %err, "skipping unreadable record"),
            }
        }
        Err(RecordError::NotFound(format!("final record with uuid {uuid}")))
    }

    /// Finals of a SOP whose `form_data` equals every filter value exactly.
    pub async fn query_by_fields(
        &self,
        sop_id: &str,
        filters: &Map<String, Value>,
    ) -> RecordResult<Vec<(Value, Metadata)>> {
        let prefix = format!("submissions/{sop_id}/");
        self.collect(DocumentType::Submissions, &prefix, MetadataType::Final, |doc| {
            let form = doc.get("form_data");
            filters.iter().all(|(field, expected)| {
                form.and_then(|f| f.get(field)).unwrap_or(&Value::Null) == expected
            })
        })
        .await
    }

    /// Locate a SOP definition key, tolerating extension and `sop` prefix
    /// variations.
    pub async fn find_sop(&self, sop_id: &str) -> RecordResult<Option<String>> {
        for name in [sop_id.to_string(), format!("sop{sop_id}")] {
            for ext in SOP_EXTENSIONS {
                let key = format!("sops/{name}{ext}");
                if self.backend.head(DocumentType::Sops, &key).await? {
                    return Ok(Some(key));
                }
            }
        }

        // Case-insensitive suffix match covers `Test4` vs `sopTest4` vs `test4`.
        let wanted = sop_id.to_lowercase();
        let keys = self
            .backend
            .list_raw_files(DocumentType::Sops, "sops/")
            .await?;
        Ok(keys.into_iter().find(|key| {
            let file = key.rsplit('/').next().unwrap_or(key);
            SOP_EXTENSIONS
                .iter()
                .find_map(|ext| file.strip_suffix(ext))
                .is_some_and(|stem| stem.to_lowercase().ends_with(&wanted))
        }))
    }

    // ---- maintenance ----

    /// Delete drafts of a SOP older than `retention_days`.
    ///
    /// Items that cannot be read or deleted are logged and skipped.
    pub async fn cleanup_older_than(&self, sop_id: &str, retention_days: u32) -> RecordResult<usize> {
        let cutoff = self.clock.now() - Duration::days(i64::from(retention_days));
        let entries = self
            .backend
            .list_by_prefix(DocumentType::Drafts, &format!("drafts/{sop_id}/"))
            .await?;

        let mut deleted = 0;
        for entry in entries.iter().filter(|e| !is_attachment_key(&e.key)) {
            match self.draft_is_expired(&entry.key, cutoff).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(key = %entry.key, error = %err, "failed to process draft");
                    continue;
                }
            }
            match self.backend.delete(DocumentType::Drafts, &entry.key).await {
                Ok(true) => {
                    deleted += 1;
                    debug!(key = %entry.key, "deleted expired draft");
                }
                Ok(false) => {}
                Err(err) => warn!(key = %entry.key, error = %err, "failed to delete draft"),
            }
        }
        info!(sop_id, retention_days, deleted, "draft retention sweep finished");
        Ok(deleted)
    }

    // ---- crate internals ----

    pub(crate) async fn load(&self, doc_type: DocumentType, key: &str) -> RecordResult<Value> {
        let bytes = self.backend.get(doc_type, key).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub(crate) async fn put_document(
        &self,
        doc_type: DocumentType,
        key: &str,
        document: &Value,
    ) -> RecordResult<()> {
        let attrs = storage_attributes(doc_type, document);
        self.backend
            .put(doc_type, key, to_bytes(document)?, &attrs)
            .await?;
        Ok(())
    }

    /// Key of the final record of `sop_id` with short id `eln_uuid`.
    pub(crate) async fn find_final_key(
        &self,
        sop_id: &str,
        eln_uuid: &str,
    ) -> RecordResult<Option<String>> {
        let suffix = format!("-{eln_uuid}{RECORD_EXTENSION}");
        let entries = self
            .backend
            .list_by_prefix(DocumentType::Submissions, &format!("submissions/{sop_id}/"))
            .await?;
        Ok(entries
            .into_iter()
            .map(|e| e.key)
            .find(|key| !is_attachment_key(key) && key.ends_with(&suffix)))
    }

    /// Per-record lock serializing attach requests in this process.
    pub(crate) fn attach_lock(&self, eln_uuid: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .attach_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(eln_uuid.to_string()).or_default())
    }

    async fn collect(
        &self,
        doc_type: DocumentType,
        prefix: &str,
        metadata_type: MetadataType,
        keep: impl Fn(&Value) -> bool,
    ) -> RecordResult<Vec<(Value, Metadata)>> {
        let entries = self.backend.list_by_prefix(doc_type, prefix).await?;
        debug!(prefix, count = entries.len(), "listed documents");

        let mut items = Vec::new();
        for entry in entries.iter().filter(|e| !is_attachment_key(&e.key)) {
            let document = match self.load(doc_type, &entry.key).await {
                Ok(document) => document,
                Err(err) => {
                    warn!(key = %entry.key, error = %err, "failed to load document");
                    continue;
                }
            };
            if !keep(&document) {
                debug!(key = %entry.key, "filtered out");
                continue;
            }
            match Metadata::from_document(&document, metadata_type) {
                Ok(metadata) => items.push((document, metadata)),
                Err(err) => warn!(key = %entry.key, error = %err, "failed to project metadata"),
            }
        }
        items.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp));
        Ok(items)
    }

    async fn latest_draft_reference(&self, sop_id: &str, user_id: &str) -> (String, String) {
        let filter = ListFilter::for_user(user_id);
        match self
            .list(DocumentType::Drafts, sop_id, MetadataType::Draft, &filter, Some(1))
            .await
        {
            Ok(drafts) => drafts
                .first()
                .and_then(Metadata::as_draft)
                .map(|d| (d.draft_uuid.clone(), d.draft_id.clone()))
                .unwrap_or_default(),
            Err(err) => {
                warn!(sop_id, user_id, error = %err, "could not resolve latest draft");
                (String::new(), String::new())
            }
        }
    }

    async fn draft_is_expired(&self, key: &str, cutoff: DateTime<Utc>) -> RecordResult<bool> {
        let document = self.load(DocumentType::Drafts, key).await?;
        let raw = document
            .get("timestamp")
            .and_then(Value::as_str)
            .ok_or_else(|| RecordError::Validation("draft has no timestamp".into()))?;
        let timestamp = parse_timestamp(raw)
            .ok_or_else(|| RecordError::Validation(format!("unparseable timestamp: {raw}")))?;
        Ok(timestamp < cutoff)
    }
}

fn existing_draft_identity(doc_type: DocumentType, draft_id: &str) -> RecordResult<(String, String)> {
    if doc_type != DocumentType::Drafts {
        return Err(RecordError::Validation(
            "only drafts can be replaced in place".into(),
        ));
    }
    let parsed = parse_filename(&format!("{draft_id}{RECORD_EXTENSION}"))?;
    if parsed.status != Status::Draft {
        return Err(RecordError::Validation(format!("{draft_id} is not a draft id")));
    }
    Ok((parsed.filename(), parsed.short_id))
}

impl fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentStore")
            .field("backend", &self.backend.name())
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
