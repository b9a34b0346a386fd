//! Per-hat tool profiles (§4.5's table), built once from the group-based
//! rules and cached behind the same grant-lookup structure the teacher uses
//! for agent-scoped access (`ToolAccessPolicy`, just keyed by hat name
//! instead of agent name).

use crate::tools::access::ToolAccessPolicy;
use crate::tools::catalog::{ToolCatalog, ToolGroup};

/// The closed set of hat names (mirrors `ralph::Hat`, kept as plain strings
/// here to avoid a dependency cycle between `tools` and `ralph`).
pub const HAT_NAMES: &[&str] = &[
    "explorer", "planner", "designer", "creator", "critic", "editor", "resolver",
];

/// Build the full hat → tool-id access policy from the fixed catalog.
/// Unknown hat names fall back to `explorer`'s (safe-default) profile when
/// queried through [`resolve_tools`].
pub fn build_profiles(catalog: &ToolCatalog) -> ToolAccessPolicy {
    let mut policy = ToolAccessPolicy::new();
    for hat in HAT_NAMES {
        let ids = allowed_ids_for_hat(catalog, hat);
        policy.grant_many(hat, &ids);
    }
    policy
}

/// Resolve the tool set for a hat directly from the catalog, without an
/// intermediate `ToolAccessPolicy`. Unknown hats resolve as `explorer`.
pub fn resolve_tools(catalog: &ToolCatalog, hat: &str) -> Vec<String> {
    let hat = if HAT_NAMES.contains(&hat) { hat } else { "explorer" };
    allowed_ids_for_hat(catalog, hat)
}

fn allowed_ids_for_hat(catalog: &ToolCatalog, hat: &str) -> Vec<String> {
    let (groups, read_only_required): (Vec<ToolGroup>, bool) = match hat {
        "explorer" | "planner" | "designer" => (
            vec![
                ToolGroup::FsRead,
                ToolGroup::GitRead,
                ToolGroup::Web,
                ToolGroup::Runtime,
                ToolGroup::Mail,
                ToolGroup::Calendar,
            ],
            true,
        ),
        "creator" | "resolver" => (
            vec![
                ToolGroup::FsRead,
                ToolGroup::FsWrite,
                ToolGroup::GitRead,
                ToolGroup::GitWrite,
                ToolGroup::Github,
                ToolGroup::Web,
                ToolGroup::Runtime,
                ToolGroup::Quality,
                ToolGroup::Mail,
                ToolGroup::Calendar,
            ],
            false,
        ),
        "critic" => (
            vec![
                ToolGroup::FsRead,
                ToolGroup::GitRead,
                ToolGroup::Web,
                ToolGroup::Quality,
                ToolGroup::Runtime,
                ToolGroup::Mail,
                ToolGroup::Calendar,
            ],
            true,
        ),
        "editor" => (
            vec![
                ToolGroup::FsRead,
                ToolGroup::FsWrite,
                ToolGroup::GitRead,
                ToolGroup::GitWrite,
                ToolGroup::Github,
                ToolGroup::Web,
                ToolGroup::Runtime,
                ToolGroup::Quality,
                ToolGroup::Completion,
                ToolGroup::Mail,
                ToolGroup::Calendar,
            ],
            false,
        ),
        _ => unreachable!("allowed_ids_for_hat is always called with a validated hat name"),
    };

    let mut ids: Vec<String> = groups
        .into_iter()
        .flat_map(|group| catalog.ids_in_group(group))
        .filter(|id| {
            if !read_only_required {
                return true;
            }
            catalog.get(id).map(|entry| entry.read_only).unwrap_or(false)
        })
        .collect();
    ids.sort();
    ids.dedup();
    ids
}
