//! Hats (§3, §4.6): the closed set of roles a session moves through, and the
//! event-driven routing table between them.
//!
//! Mirrors `tools::profiles::HAT_NAMES` exactly — kept as a real enum here
//! (rather than a string) since `ralph` owns the transition logic, while
//! `tools` only needs the names to key its access policy.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A session's current role. Determines which tools are available
/// (`tools::profiles::resolve_tools`) and which prompt is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hat {
    Explorer,
    Planner,
    Designer,
    Creator,
    Critic,
    Editor,
    Resolver,
}

impl Hat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hat::Explorer => "explorer",
            Hat::Planner => "planner",
            Hat::Designer => "designer",
            Hat::Creator => "creator",
            Hat::Critic => "critic",
            Hat::Editor => "editor",
            Hat::Resolver => "resolver",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "explorer" => Some(Hat::Explorer),
            "planner" => Some(Hat::Planner),
            "designer" => Some(Hat::Designer),
            "creator" => Some(Hat::Creator),
            "critic" => Some(Hat::Critic),
            "editor" => Some(Hat::Editor),
            "resolver" => Some(Hat::Resolver),
            _ => None,
        }
    }
}

impl fmt::Display for Hat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry in a session's hat history (§3). All but the last entry in a
/// session's history must have `ended_at` set and a non-empty `exit_event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HatVisit {
    pub hat: Hat,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub exit_event: Option<String>,
}

impl HatVisit {
    pub fn open(hat: Hat, started_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            hat,
            started_at,
            ended_at: None,
            exit_event: None,
        }
    }
}

/// The fixed routing table (§4.6 step 8): a transition event names exactly
/// one destination hat.
pub fn target_hat(event: &str) -> Option<Hat> {
    match event {
        "plan.complete" => Some(Hat::Designer),
        "design.complete" => Some(Hat::Creator),
        "implementation.done" => Some(Hat::Critic),
        "review.approved" => Some(Hat::Editor),
        "review.rejected" => Some(Hat::Creator),
        "task.blocked" => Some(Hat::Resolver),
        "resolved" => Some(Hat::Creator),
        _ => None,
    }
}

/// A session may not visit the same hat more than this many times.
pub const MAX_HAT_VISITS: u32 = 3;
/// A session may not make more than this many total hat transitions.
pub const MAX_TOTAL_TRANSITIONS: u32 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_strings() {
        for hat in [
            Hat::Explorer,
            Hat::Planner,
            Hat::Designer,
            Hat::Creator,
            Hat::Critic,
            Hat::Editor,
            Hat::Resolver,
        ] {
            assert_eq!(Hat::from_str(hat.as_str()), Some(hat));
        }
    }

    #[test]
    fn matches_tools_profiles_hat_names() {
        let names: Vec<&str> = crate::tools::profiles::HAT_NAMES.to_vec();
        for name in names {
            assert!(Hat::from_str(name).is_some(), "unknown hat name {name}");
        }
    }

    #[test]
    fn routing_table_covers_every_documented_event() {
        assert_eq!(target_hat("plan.complete"), Some(Hat::Designer));
        assert_eq!(target_hat("design.complete"), Some(Hat::Creator));
        assert_eq!(target_hat("implementation.done"), Some(Hat::Critic));
        assert_eq!(target_hat("review.approved"), Some(Hat::Editor));
        assert_eq!(target_hat("review.rejected"), Some(Hat::Creator));
        assert_eq!(target_hat("task.blocked"), Some(Hat::Resolver));
        assert_eq!(target_hat("resolved"), Some(Hat::Creator));
        assert_eq!(target_hat("task.complete"), None);
        assert_eq!(target_hat("nonsense"), None);
    }
}
