//! The prompt assembly contract (§4.6 step 3).
//!
//! Out of scope per the spec: prompt template storage. Only the rendering
//! contract matters here — given a hat, an objective, and a session, produce
//! the text that goes to the LLM as a system prompt or a handoff/completion
//! nudge. [`DefaultPromptAssembler`] is a minimal, literal rendering kept
//! only so the loop has something to run against; real template storage and
//! authoring lives elsewhere.

use crate::ralph::hat::Hat;
use crate::store::Objective;

/// Renders the text the Ralph loop sends to the LLM at each step. Template
/// storage and authoring are deliberately out of scope here.
pub trait PromptAssembler: Send + Sync {
    /// The system prompt for one hat, given the objective it's working.
    fn system_prompt(&self, hat: Hat, objective: &Objective) -> String;

    /// The very first user message seeding the conversation.
    fn initial_task_prompt(&self, objective: &Objective) -> String;

    /// Nudges the model to keep going after a turn with no tool use and no
    /// terminal signal.
    fn continuation_prompt(&self, hat: Hat) -> String;

    /// The note handed to the next hat on a transition, summarizing why the
    /// previous hat exited.
    fn handoff_prompt(&self, previous_hat: Hat, event: &str, scratchpad: &str) -> String;
}

/// A literal, unadorned rendering of each prompt kind.
#[derive(Debug, Clone, Default)]
pub struct DefaultPromptAssembler;

impl PromptAssembler for DefaultPromptAssembler {
    fn system_prompt(&self, hat: Hat, objective: &Objective) -> String {
        format!(
            "You are acting as the {hat} for objective \"{title}\".\n\
             Description: {description}\n\
             Base branch: {branch}\n\
             Signal checklist progress with CHECKLIST_DONE:<id> or \
             CHECKLIST_FAILED:<id>:<reason>, working notes with \
             SCRATCHPAD:<text>, and hand off or finish with EVENT:<name>.",
            hat = hat,
            title = objective.title,
            description = objective.description,
            branch = objective.base_branch,
        )
    }

    fn initial_task_prompt(&self, objective: &Objective) -> String {
        if objective.checklist.is_empty() {
            format!("Begin work on: {}", objective.description)
        } else {
            let items = objective
                .checklist
                .iter()
                .enumerate()
                .map(|(i, item)| format!("{}. {item}", i + 1))
                .collect::<Vec<_>>()
                .join("\n");
            format!(
                "Complete the following checklist. Each item is numbered; signal \
                 completion with CHECKLIST_DONE:<number>:\n{items}"
            )
        }
    }

    fn continuation_prompt(&self, _hat: Hat) -> String {
        "Continue. Use a tool, signal a checklist update, or emit an EVENT when you're ready to \
         hand off or finish."
            .to_string()
    }

    fn handoff_prompt(&self, previous_hat: Hat, event: &str, scratchpad: &str) -> String {
        format!(
            "The {previous_hat} hat exited with event \"{event}\".\n\
             Carried-over notes:\n{scratchpad}"
        )
    }
}
