//! Filename-variable extraction from SOP field definitions.
//!
//! A field contributes to the record filename when one of its `children` is a
//! configuration object with `filename_component: true` and an integer
//! `order`. Fields may be nested arbitrarily deep under `children`.

use serde_json::Value;

use crate::names::{normalize, EMPTY_COMPONENT};

/// Ordered filename variables together with the field ids they came from.
///
/// `field_ids` doubles as the fallback list for
/// [`IdentityGenerator::generate`](crate::IdentityGenerator::generate).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilenameComponents {
    pub field_ids: Vec<String>,
    pub values: Vec<String>,
}

/// Extract normalized filename variables from `form_data` using the SOP's
/// field definitions.
pub fn extract_filename_variables(form_data: &Value, sop_fields: &[Value]) -> FilenameComponents {
    let mut found: Vec<(i64, String)> = Vec::new();
    for field in sop_fields {
        collect_filename_fields(field, &mut found);
    }
    // Stable: fields with equal order keep schema order.
    found.sort_by_key(|(order, _)| *order);

    let mut components = FilenameComponents::default();
    for (_, field_id) in found {
        let raw = match form_data.get(&field_id) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        let value = normalize(&raw);
        components.values.push(if value.is_empty() {
            EMPTY_COMPONENT.to_string()
        } else {
            value
        });
        components.field_ids.push(field_id);
    }
    components
}

fn collect_filename_fields(node: &Value, found: &mut Vec<(i64, String)>) {
    let children = node
        .get("children")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    if node.get("type").is_some_and(is_truthy) {
        let order = children.iter().find_map(|child| {
            let flagged = child
                .get("filename_component")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if flagged {
                child.get("order").and_then(Value::as_i64)
            } else {
                None
            }
        });
        if let Some(order) = order {
            let id = node.get("id").and_then(Value::as_str).unwrap_or_default();
            found.push((order, id.to_string()));
        }
    }

    for child in children {
        collect_filename_fields(child, found);
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema() -> Vec<Value> {
        vec![
            json!({
                "id": "patient_id",
                "type": "string",
                "children": [{ "filename_component": true, "order": 2 }]
            }),
            json!({
                "id": "task_1",
                "type": "task",
                "children": [
                    {
                        "id": "project-id",
                        "type": "string",
                        "children": [{ "filename_component": true, "order": 1 }]
                    },
                    { "id": "notes", "type": "string" }
                ]
            }),
            json!({
                "id": "ignored",
                "type": "string",
                "children": [{ "filename_component": true, "order": "3" }]
            }),
        ]
    }

    #[test]
    fn finds_nested_fields_in_order() {
        let form = json!({ "project-id": "PROJ-001", "patient_id": "Pt 7" });
        let components = extract_filename_variables(&form, &schema());
        assert_eq!(components.field_ids, vec!["project-id", "patient_id"]);
        assert_eq!(components.values, vec!["proj_001", "pt_7"]);
    }

    #[test]
    fn missing_values_become_empty() {
        let form = json!({ "project-id": null, "patient_id": 42 });
        let components = extract_filename_variables(&form, &schema());
        assert_eq!(components.values, vec!["empty", "42"]);
    }

    #[test]
    fn fields_without_type_are_skipped() {
        let fields = vec![json!({
            "id": "untyped",
            "children": [{ "filename_component": true, "order": 1 }]
        })];
        let components = extract_filename_variables(&json!({}), &fields);
        assert!(components.field_ids.is_empty());
    }
}
