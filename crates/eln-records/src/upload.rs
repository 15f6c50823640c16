//! Screening of user uploads before they reach temporary storage.
//!
//! Checks run in a fixed order and stop at the first failure: name present,
//! extension not dangerous, extension allowed, non-empty, within size, no
//! executable signature, and for text formats no script injection markers.

use std::fmt;

use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Largest single file accepted.
pub const MAX_FILE_SIZE: usize = 25 * 1024 * 1024;

/// Largest combined size of one upload batch.
pub const MAX_TOTAL_UPLOAD_SIZE: usize = 100 * 1024 * 1024;

pub const MAX_FILES_PER_UPLOAD: usize = 10;

/// Number of leading bytes scanned for executable markers.
pub const CONTENT_SCAN_LEN: usize = 1024;

pub const MAX_FILENAME_LEN: usize = 255;

/// Replacement for names that sanitize to nothing.
pub const UNNAMED_FILE: &str = "unnamed_file.bin";

pub const ALLOWED_EXTENSIONS: &[&str] = &[
    ".pdf", ".doc", ".docx", ".txt", ".rtf", ".xls", ".xlsx", ".xlsm", ".csv", ".png", ".jpg",
    ".jpeg", ".gif", ".bmp", ".tiff", ".svg", ".zip", ".tar", ".gz", ".json", ".xml", ".yaml",
    ".yml",
];

pub const DANGEROUS_EXTENSIONS: &[&str] = &[
    ".exe", ".bat", ".cmd", ".com", ".scr", ".pif", ".vbs", ".js", ".jar", ".sh", ".bash", ".php",
    ".asp", ".aspx", ".jsp", ".pl", ".py", ".rb", ".msi", ".deb", ".rpm", ".dmg", ".app", ".run",
];

/// Formats whose content is also scanned for script injection.
const TEXT_EXTENSIONS: &[&str] = &[".txt", ".csv", ".json", ".xml", ".yaml", ".yml"];

/// Magic numbers that must not open an upload.
const BINARY_SIGNATURES: &[&[u8]] = &[b"MZ", b"\x7fELF", b"\xfe\xed\xfa"];

/// Script markers searched (case-insensitively) in the scanned window.
const SCRIPT_MARKERS: &[&str] = &["#!/bin/", "<?php"];

const SUSPICIOUS_PATTERNS: &[&str] = &[
    "<script",
    "</script>",
    "javascript:",
    "vbscript:",
    "onload=",
    "onerror=",
    "onclick=",
    "eval(",
    "document.cookie",
    "document.write",
];

const UNSAFE_NAME_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '\0'];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadCode {
    NoFilename,
    FileTooLarge,
    DangerousFileType,
    UnsupportedFileType,
    EmptyFile,
    ExecutableContent,
    SuspiciousContent,
    TooManyFiles,
    TotalSizeTooLarge,
}

impl UploadCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoFilename => "NO_FILENAME",
            Self::FileTooLarge => "FILE_TOO_LARGE",
            Self::DangerousFileType => "DANGEROUS_FILE_TYPE",
            Self::UnsupportedFileType => "UNSUPPORTED_FILE_TYPE",
            Self::EmptyFile => "EMPTY_FILE",
            Self::ExecutableContent => "EXECUTABLE_CONTENT",
            Self::SuspiciousContent => "SUSPICIOUS_CONTENT",
            Self::TooManyFiles => "TOO_MANY_FILES",
            Self::TotalSizeTooLarge => "TOTAL_SIZE_TOO_LARGE",
        }
    }
}

impl fmt::Display for UploadCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected upload.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{code}: {message}")]
pub struct UploadError {
    pub code: UploadCode,
    pub message: String,
    pub details: Map<String, Value>,
}

impl UploadError {
    fn new(code: UploadCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details: details.as_object().cloned().unwrap_or_default(),
        }
    }
}

/// An upload that passed screening.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScreenedFile {
    pub sanitized_name: String,
    /// Lowercase, including the leading dot.
    pub extension: String,
    pub size: usize,
}

/// Screen one file.
pub fn validate_file(name: &str, content: &[u8]) -> Result<ScreenedFile, UploadError> {
    if name.trim().is_empty() {
        return Err(UploadError::new(
            UploadCode::NoFilename,
            "No filename provided",
            json!({}),
        ));
    }

    let extension = extension_of(name);
    if DANGEROUS_EXTENSIONS.contains(&extension.as_str()) {
        return Err(UploadError::new(
            UploadCode::DangerousFileType,
            format!("Files of type {extension} are not allowed for security reasons."),
            json!({ "extension": extension }),
        ));
    }
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(UploadError::new(
            UploadCode::UnsupportedFileType,
            format!("File type {extension} is not supported."),
            json!({ "extension": extension, "allowed_extensions": ALLOWED_EXTENSIONS }),
        ));
    }

    if content.is_empty() {
        return Err(UploadError::new(
            UploadCode::EmptyFile,
            "The uploaded file is empty.",
            json!({}),
        ));
    }
    if content.len() > MAX_FILE_SIZE {
        return Err(UploadError::new(
            UploadCode::FileTooLarge,
            format!(
                "File is too large ({:.1} MB). Maximum size is {} MB.",
                content.len() as f64 / (1024.0 * 1024.0),
                MAX_FILE_SIZE / (1024 * 1024)
            ),
            json!({ "size": content.len(), "max_size": MAX_FILE_SIZE }),
        ));
    }

    check_content(content, &extension)?;

    Ok(ScreenedFile {
        sanitized_name: sanitize_filename(name),
        extension,
        size: content.len(),
    })
}

/// Screen batch limits given `(name, size)` pairs.
pub fn validate_batch(files: &[(&str, usize)]) -> Result<(), UploadError> {
    if files.len() > MAX_FILES_PER_UPLOAD {
        return Err(UploadError::new(
            UploadCode::TooManyFiles,
            format!(
                "Too many files selected ({}). Maximum {MAX_FILES_PER_UPLOAD} files per upload.",
                files.len()
            ),
            json!({ "file_count": files.len(), "max_files": MAX_FILES_PER_UPLOAD }),
        ));
    }
    let total: usize = files.iter().map(|(_, size)| size).sum();
    if total > MAX_TOTAL_UPLOAD_SIZE {
        return Err(UploadError::new(
            UploadCode::TotalSizeTooLarge,
            format!(
                "Total upload size is too large. Maximum is {} MB.",
                MAX_TOTAL_UPLOAD_SIZE / (1024 * 1024)
            ),
            json!({ "total_size": total, "max_total_size": MAX_TOTAL_UPLOAD_SIZE }),
        ));
    }
    Ok(())
}

fn check_content(content: &[u8], extension: &str) -> Result<(), UploadError> {
    let executable = || {
        UploadError::new(
            UploadCode::ExecutableContent,
            "File contains executable content and cannot be uploaded for security reasons.",
            json!({ "extension": extension }),
        )
    };

    if BINARY_SIGNATURES.iter().any(|sig| content.starts_with(sig)) {
        return Err(executable());
    }
    let window = &content[..content.len().min(CONTENT_SCAN_LEN)];
    let head = String::from_utf8_lossy(window).to_lowercase();
    if SCRIPT_MARKERS.iter().any(|marker| head.contains(marker)) {
        return Err(executable());
    }

    if TEXT_EXTENSIONS.contains(&extension) {
        let text = String::from_utf8_lossy(content).to_lowercase();
        if let Some(pattern) = SUSPICIOUS_PATTERNS.iter().find(|p| text.contains(*p)) {
            return Err(UploadError::new(
                UploadCode::SuspiciousContent,
                "File contains potentially unsafe content and cannot be uploaded for security reasons.",
                json!({ "pattern": pattern }),
            ));
        }
    }
    Ok(())
}

/// Lowercase extension of the final path segment, including the dot.
pub fn extension_of(name: &str) -> String {
    let file = base_name(name);
    match file.rfind('.') {
        Some(0) | None => String::new(),
        Some(idx) => file[idx..].to_lowercase(),
    }
}

/// Strip directories and unsafe characters and bound the length.
pub fn sanitize_filename(name: &str) -> String {
    let mut file: String = base_name(name)
        .chars()
        .map(|c| if UNSAFE_NAME_CHARS.contains(&c) { '_' } else { c })
        .collect();

    if file.chars().count() > MAX_FILENAME_LEN {
        let ext = match file.rfind('.') {
            Some(idx) if idx > 0 && file[idx..].chars().count() < MAX_FILENAME_LEN => {
                file[idx..].to_string()
            }
            _ => String::new(),
        };
        let keep = MAX_FILENAME_LEN.saturating_sub(ext.chars().count());
        let stem: String = file.chars().take(keep).collect();
        file = format!("{stem}{ext}");
    }

    if file.is_empty() || file == "." || file == ".." {
        return UNNAMED_FILE.to_string();
    }
    file
}

fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}
