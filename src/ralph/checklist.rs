//! Checklist item format/parse (§8 "Round-trip and idempotence":
//! `ParseChecklist(FormatChecklist(items))` preserves description, category,
//! and status for every item, noting only that ids are reassigned — match by
//! description).
//!
//! This is a plain data transform, not a renderer: it has no file I/O and no
//! opinion on where the markdown text comes from or goes, so it sits
//! alongside the rest of `ralph` rather than the out-of-scope
//! content-as-markdown layer that owns that job.
//!
//! Grounded on the teacher's adjacent repo pattern for PRD-style task
//! checklists (`RalphTask { id, title, description }` plus a `- [x]`/`- [ ]`
//! markdown rendering), extended with a bracketed category suffix since this
//! spec's checklist model carries one and the teacher's didn't.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistStatus {
    Pending,
    Done,
    Failed,
}

impl ChecklistStatus {
    fn marker(self) -> char {
        match self {
            ChecklistStatus::Pending => ' ',
            ChecklistStatus::Done => 'x',
            ChecklistStatus::Failed => '!',
        }
    }

    fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            " " => Some(ChecklistStatus::Pending),
            "x" | "X" => Some(ChecklistStatus::Done),
            "!" => Some(ChecklistStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: String,
    pub description: String,
    pub category: Option<String>,
    pub status: ChecklistStatus,
}

/// Render items as a markdown checkbox list, one per line:
/// `- [x] description (category)` or `- [ ] description` with no category.
pub fn format_checklist(items: &[ChecklistItem]) -> String {
    items
        .iter()
        .map(|item| match &item.category {
            Some(category) => format!("- [{}] {} ({category})", item.status.marker(), item.description),
            None => format!("- [{}] {}", item.status.marker(), item.description),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse a markdown checkbox list back into items. Ids are reassigned
/// sequentially (1-based, in line order) — callers that need stable ids
/// across a round trip must match items by description instead.
pub fn parse_checklist(text: &str) -> Vec<ChecklistItem> {
    text.lines()
        .filter_map(parse_line)
        .enumerate()
        .map(|(i, (description, category, status))| ChecklistItem {
            id: (i + 1).to_string(),
            description,
            category,
            status,
        })
        .collect()
}

fn parse_line(line: &str) -> Option<(String, Option<String>, ChecklistStatus)> {
    let line = line.trim();
    let rest = line.strip_prefix("- [")?;
    let (marker, rest) = rest.split_once(']')?;
    let status = ChecklistStatus::from_marker(marker)?;
    let rest = rest.trim();
    if let Some(body) = rest.strip_suffix(')') {
        if let Some(idx) = body.rfind(" (") {
            let description = body[..idx].trim().to_string();
            let category = body[idx + 2..].trim().to_string();
            if !description.is_empty() {
                return Some((description, Some(category), status));
            }
        }
    }
    if rest.is_empty() {
        return None;
    }
    Some((rest.to_string(), None, status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn items() -> Vec<ChecklistItem> {
        vec![
            ChecklistItem {
                id: "a".to_string(),
                description: "write tests".to_string(),
                category: Some("testing".to_string()),
                status: ChecklistStatus::Done,
            },
            ChecklistItem {
                id: "b".to_string(),
                description: "update docs".to_string(),
                category: None,
                status: ChecklistStatus::Pending,
            },
            ChecklistItem {
                id: "c".to_string(),
                description: "ship release".to_string(),
                category: Some("release".to_string()),
                status: ChecklistStatus::Failed,
            },
        ]
    }

    #[test]
    fn round_trip_preserves_description_category_and_status() {
        let original = items();
        let parsed = parse_checklist(&format_checklist(&original));
        assert_eq!(parsed.len(), original.len());
        for (source, parsed) in original.iter().zip(parsed.iter()) {
            assert_eq!(parsed.description, source.description);
            assert_eq!(parsed.category, source.category);
            assert_eq!(parsed.status, source.status);
        }
    }

    #[test]
    fn ids_are_reassigned_sequentially() {
        let parsed = parse_checklist(&format_checklist(&items()));
        let ids: Vec<&str> = parsed.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn blank_lines_are_ignored() {
        let text = "- [x] a\n\n- [ ] b\n";
        assert_eq!(parse_checklist(text).len(), 2);
    }

    fn arb_status() -> impl Strategy<Value = ChecklistStatus> {
        prop_oneof![
            Just(ChecklistStatus::Pending),
            Just(ChecklistStatus::Done),
            Just(ChecklistStatus::Failed),
        ]
    }

    fn arb_word() -> impl Strategy<Value = String> {
        "[a-zA-Z][a-zA-Z ]{0,19}".prop_map(|s| s.trim().to_string())
    }

    proptest! {
        #[test]
        fn round_trip_holds_for_arbitrary_items(
            descriptions in prop::collection::vec(arb_word().prop_filter("non-empty", |s| !s.is_empty()), 1..6),
            categories in prop::collection::vec(prop::option::of(arb_word().prop_filter("non-empty", |s| !s.is_empty())), 1..6),
            statuses in prop::collection::vec(arb_status(), 1..6),
        ) {
            let len = descriptions.len().min(categories.len()).min(statuses.len());
            let original: Vec<ChecklistItem> = (0..len)
                .map(|i| ChecklistItem {
                    id: i.to_string(),
                    description: descriptions[i].clone(),
                    category: categories[i].clone(),
                    status: statuses[i],
                })
                .collect();

            let parsed = parse_checklist(&format_checklist(&original));
            prop_assert_eq!(parsed.len(), original.len());
            for (source, parsed) in original.iter().zip(parsed.iter()) {
                prop_assert_eq!(&parsed.description, &source.description);
                prop_assert_eq!(&parsed.category, &source.category);
                prop_assert_eq!(parsed.status, source.status);
            }
        }
    }
}
