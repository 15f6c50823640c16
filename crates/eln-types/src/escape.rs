//! Reversible escaping for field ids embedded in attachment filenames.
//!
//! Attachment blobs are named `{user}-{field}-{file_id}-{original}`. Field
//! ids may contain `-`, which would shift every later component, so the
//! temporary name carries the escaped form and the permanent name is rebuilt
//! with the original id.

/// Token substituted for `-` inside an escaped field id.
pub const HYPHEN_TOKEN: &str = "__HYPHEN__";

/// Replace every `-` with [`HYPHEN_TOKEN`].
///
/// Escaping an already-escaped id is a no-op.
pub fn escape_field_id(field_id: &str) -> String {
    field_id.replace('-', HYPHEN_TOKEN)
}

/// Replace every [`HYPHEN_TOKEN`] with `-`.
pub fn unescape_field_id(escaped: &str) -> String {
    escaped.replace(HYPHEN_TOKEN, "-")
}

/// Prefix shared by every temporary blob of one upload.
///
/// `{user}-{escaped field}-{file_id}-`
pub fn temp_file_prefix(user_id: &str, field_id: &str, file_id: &str) -> String {
    format!("{user_id}-{}-{file_id}-", escape_field_id(field_id))
}

/// Name of a temporary upload blob.
pub fn temp_file_name(user_id: &str, field_id: &str, file_id: &str, original: &str) -> String {
    format!("{}{original}", temp_file_prefix(user_id, field_id, file_id))
}

/// Drafts-bucket key of a temporary upload blob.
pub fn temp_file_key(
    sop_id: &str,
    user_id: &str,
    field_id: &str,
    file_id: &str,
    original: &str,
) -> String {
    format!(
        "drafts/{sop_id}/attachments/{}",
        temp_file_name(user_id, field_id, file_id, original)
    )
}

/// Rebuild a temporary blob name with the unescaped field id.
///
/// Names with fewer than four components are returned unchanged.
pub fn final_attachment_name(temp_name: &str) -> String {
    let parts: Vec<&str> = temp_name.splitn(4, '-').collect();
    if parts.len() < 4 {
        return temp_name.to_string();
    }
    format!(
        "{}-{}-{}-{}",
        parts[0],
        unescape_field_id(parts[1]),
        parts[2],
        parts[3]
    )
}

/// Recover the user's original filename from a temporary blob name.
pub fn original_name(temp_name: &str, user_id: &str, field_id: &str, file_id: &str) -> String {
    let prefix = temp_file_prefix(user_id, field_id, file_id);
    temp_name
        .strip_prefix(&prefix)
        .unwrap_or(temp_name)
        .to_string()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn temp_key_lives_under_drafts_attachments() {
        assert_eq!(
            temp_file_key("S1", "u1", "sample-id", "ab12cd34", "run 1.csv"),
            "drafts/S1/attachments/u1-sample__HYPHEN__id-ab12cd34-run 1.csv"
        );
    }

    #[test]
    fn escape_replaces_every_hyphen() {
        assert_eq!(escape_field_id("sample-id-2"), "sample__HYPHEN__id__HYPHEN__2");
        assert_eq!(unescape_field_id("sample__HYPHEN__id__HYPHEN__2"), "sample-id-2");
    }

    #[test]
    fn escape_is_idempotent() {
        let once = escape_field_id("a-b");
        assert_eq!(escape_field_id(&once), once);
    }

    #[test]
    fn temp_names_carry_escaped_field() {
        let name = temp_file_name("u1", "raw-data", "deadbeef", "plate-1.csv");
        assert_eq!(name, "u1-raw__HYPHEN__data-deadbeef-plate-1.csv");
        assert_eq!(final_attachment_name(&name), "u1-raw-data-deadbeef-plate-1.csv");
        assert_eq!(original_name(&name, "u1", "raw-data", "deadbeef"), "plate-1.csv");
    }

    #[test]
    fn final_name_passes_short_names_through() {
        assert_eq!(final_attachment_name("a-b-c"), "a-b-c");
    }

    #[test]
    fn original_name_falls_back_to_full_name() {
        assert_eq!(original_name("other.csv", "u1", "f", "id"), "other.csv");
    }

    proptest! {
        #[test]
        fn escape_roundtrip(id in "[a-z0-9_-]{0,24}") {
            prop_assume!(!id.contains(HYPHEN_TOKEN));
            let escaped = escape_field_id(&id);
            prop_assert!(!escaped.contains('-'));
            prop_assert_eq!(unescape_field_id(&escaped), id);
        }
    }
}
