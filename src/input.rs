//! Loading work items from files.
//!
//! Accepts a JSON array of objects or JSON lines (one object per line).

use std::collections::HashSet;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::WorkItem;

/// Read work items from `path`.
///
/// When `id_field` is set, each item's id is taken from that field instead
/// of `id` (string or number values are accepted).
pub fn load_items(path: &Path, id_field: Option<&str>) -> Result<Vec<WorkItem>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Input(format!("cannot read {}: {e}", path.display())))?;
    let items = parse_items(&content, id_field)?;
    debug!(path = %path.display(), count = items.len(), "loaded work items");
    Ok(items)
}

/// Parse work items from a JSON array or JSON-lines string.
pub fn parse_items(content: &str, id_field: Option<&str>) -> Result<Vec<WorkItem>> {
    let values: Vec<Value> = if content.trim_start().starts_with('[') {
        serde_json::from_str(content)
            .map_err(|e| Error::Input(format!("bad JSON array: {e}")))?
    } else {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line)
                    .map_err(|e| Error::Input(format!("line {}: {e}", n + 1)))
            })
            .collect::<Result<_>>()?
    };

    values
        .into_iter()
        .enumerate()
        .map(|(pos, value)| to_work_item(pos, value, id_field.unwrap_or("id")))
        .collect()
}

fn to_work_item(pos: usize, value: Value, id_field: &str) -> Result<WorkItem> {
    let Value::Object(mut fields) = value else {
        return Err(Error::Input(format!("item {pos}: expected a JSON object")));
    };

    let id = match fields.get(id_field) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    if id.is_empty() {
        return Err(Error::Input(format!(
            "item {pos}: missing or empty '{id_field}'"
        )));
    }

    fields.remove("id");
    Ok(WorkItem { id, fields })
}

/// Keep the first occurrence of every id, preserving order.
pub fn dedup_items(items: Vec<WorkItem>) -> Vec<WorkItem> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| {
            let fresh = seen.insert(item.id.clone());
            if !fresh {
                warn!(id = %item.id, "dropping duplicate work item");
            }
            fresh
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_occurrence_in_order() {
        let items = vec![
            WorkItem::new("a").with_field("n", 1),
            WorkItem::new("b"),
            WorkItem::new("a").with_field("n", 2),
            WorkItem::new("c"),
        ];
        let deduped = dedup_items(items);
        let ids: Vec<_> = deduped.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(deduped[0].field("n"), Some(&serde_json::json!(1)));
    }
}
