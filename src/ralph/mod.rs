//! The Ralph execution loop (§2 "C6"): hats, signal parsing, session state,
//! completion reporting, and the bounded multi-phase loop itself.

pub mod chat_client;
pub mod checklist;
pub mod checkpoint;
pub mod hat;
pub mod loop_;
pub mod prompt;
pub mod session;
pub mod signals;

pub use chat_client::{ChatClient, ChatResponse, ContentBlock, GenAiChatClient, Message, Role};
pub use checklist::{format_checklist, parse_checklist, ChecklistItem, ChecklistStatus};
pub use checkpoint::CompletionReport;
pub use hat::{target_hat, Hat, HatVisit, MAX_HAT_VISITS, MAX_TOTAL_TRANSITIONS};
pub use loop_::{NoProjectHints, ProjectHintsLoader, RalphContext, RalphLoop};
pub use prompt::{DefaultPromptAssembler, PromptAssembler};
pub use session::{Project, Session, WorkerSecrets};
pub use signals::{parse_signals, Signal};
