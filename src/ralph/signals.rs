//! Line-oriented signal parsing out of LLM response text (§4.6).
//!
//! Four signal prefixes are recognized anywhere in the response, possibly
//! more than once: `CHECKLIST_DONE:<item_id>`, `CHECKLIST_FAILED:<item_id>:
//! <reason>`, `SCRATCHPAD:<content>`, `EVENT:<name>`. A scratchpad signal's
//! content runs from its own line up to (but not including) the next line
//! that opens a new signal, or the end of the text.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    ChecklistDone(String),
    ChecklistFailed(String, String),
    Scratchpad(String),
    Event(String),
}

const CHECKLIST_DONE: &str = "CHECKLIST_DONE:";
const CHECKLIST_FAILED: &str = "CHECKLIST_FAILED:";
const SCRATCHPAD: &str = "SCRATCHPAD:";
const EVENT: &str = "EVENT:";

fn is_signal_line(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with(CHECKLIST_DONE)
        || line.starts_with(CHECKLIST_FAILED)
        || line.starts_with(SCRATCHPAD)
        || line.starts_with(EVENT)
}

/// Parse every signal out of one response's text, in order of appearance.
/// Empty bodies (e.g. a bare `EVENT:` with nothing after it) are dropped.
pub fn parse_signals(text: &str) -> Vec<Signal> {
    let lines: Vec<&str> = text.lines().collect();
    let mut signals = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let trimmed = lines[i].trim_start();
        if let Some(rest) = trimmed.strip_prefix(CHECKLIST_DONE) {
            let id = rest.trim().to_string();
            if !id.is_empty() {
                signals.push(Signal::ChecklistDone(id));
            }
            i += 1;
        } else if let Some(rest) = trimmed.strip_prefix(CHECKLIST_FAILED) {
            if let Some((id, reason)) = rest.split_once(':') {
                let id = id.trim().to_string();
                let reason = reason.trim().to_string();
                if !id.is_empty() {
                    signals.push(Signal::ChecklistFailed(id, reason));
                }
            }
            i += 1;
        } else if let Some(rest) = trimmed.strip_prefix(EVENT) {
            let name = rest.trim().to_string();
            if !name.is_empty() {
                signals.push(Signal::Event(name));
            }
            i += 1;
        } else if let Some(rest) = trimmed.strip_prefix(SCRATCHPAD) {
            let mut body = vec![rest.trim_start().to_string()];
            let mut j = i + 1;
            while j < lines.len() && !is_signal_line(lines[j]) {
                body.push(lines[j].to_string());
                j += 1;
            }
            let content = body.join("\n").trim().to_string();
            if !content.is_empty() {
                signals.push(Signal::Scratchpad(content));
            }
            i = j;
        } else {
            i += 1;
        }
    }
    signals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_four_signal_kinds() {
        let text = "some narration\n\
                     CHECKLIST_DONE: item-1\n\
                     CHECKLIST_FAILED: item-2: out of scope\n\
                     EVENT: plan.complete\n";
        let signals = parse_signals(text);
        assert_eq!(
            signals,
            vec![
                Signal::ChecklistDone("item-1".to_string()),
                Signal::ChecklistFailed("item-2".to_string(), "out of scope".to_string()),
                Signal::Event("plan.complete".to_string()),
            ]
        );
    }

    #[test]
    fn scratchpad_runs_until_next_signal_or_end() {
        let text = "SCRATCHPAD: line one\nline two\nline three\nEVENT: resolved\n";
        let signals = parse_signals(text);
        assert_eq!(
            signals,
            vec![
                Signal::Scratchpad("line one\nline two\nline three".to_string()),
                Signal::Event("resolved".to_string()),
            ]
        );
    }

    #[test]
    fn scratchpad_at_end_of_text_runs_to_completion() {
        let text = "SCRATCHPAD: only this\nand this\n";
        let signals = parse_signals(text);
        assert_eq!(signals, vec![Signal::Scratchpad("only this\nand this".to_string())]);
    }

    #[test]
    fn multiple_signals_of_the_same_kind_are_all_captured() {
        let text = "CHECKLIST_DONE: a\nCHECKLIST_DONE: b\nCHECKLIST_DONE: c\n";
        let signals = parse_signals(text);
        assert_eq!(signals.len(), 3);
    }

    #[test]
    fn empty_bodies_are_dropped() {
        let text = "EVENT:\nCHECKLIST_DONE:   \n";
        assert!(parse_signals(text).is_empty());
    }

    #[test]
    fn text_with_no_signals_yields_nothing() {
        assert!(parse_signals("just plain narration, no signals here").is_empty());
    }
}
