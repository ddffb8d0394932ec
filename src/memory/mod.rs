// ── Memory Policy (§4.5) ──────────────────────────────────────────────────
// Shortens a message list to fit a token budget before each model turn.
// Both strategies share one token estimator so that boundary-finding is
// stable and reproducible across runs — precision matters less than that
// a decision made once stays made.

use crate::atoms::types::{Message, Role};
use crate::registry::pricing::estimate_tokens;

/// Outcome of applying a memory strategy: either the history already fit
/// and nothing changes, or it was reshaped and the thread's running
/// summary (Summarize strategy only) needs persisting.
pub struct ShapedMemory {
    pub messages: Vec<Message>,
    pub updated_summary: Option<String>,
}

fn message_tokens(msg: &Message) -> u64 {
    estimate_tokens(&msg.content.as_text())
}

/// Find the largest suffix of `messages` whose total token estimate is
/// `<= budget`, then widen the cut left until it starts with a user
/// message — never mid-tool-call (§4.5 Trim).
fn trim_boundary(messages: &[Message], budget: u64) -> usize {
    let mut total = 0u64;
    let mut start = messages.len();
    for (i, msg) in messages.iter().enumerate().rev() {
        let cost = message_tokens(msg);
        if total + cost > budget && start != messages.len() {
            break;
        }
        total += cost;
        start = i;
    }
    while start < messages.len() && messages[start].role != Role::User {
        start += 1;
    }
    start
}

/// Keep the most recent messages whose token estimate sums to `<= budget`,
/// cutting at a boundary that starts with a user message (§4.5 Trim).
pub fn trim(messages: &[Message], budget: u64) -> ShapedMemory {
    if messages.is_empty() {
        return ShapedMemory { messages: Vec::new(), updated_summary: None };
    }
    let total: u64 = messages.iter().map(message_tokens).sum();
    if total <= budget {
        return ShapedMemory { messages: messages.to_vec(), updated_summary: None };
    }
    let start = trim_boundary(messages, budget);
    ShapedMemory { messages: messages[start..].to_vec(), updated_summary: None }
}

/// Fold messages older than `keep_recent` into a running summary string,
/// then keep only the `keep_recent` most recent messages. `existing_summary`
/// is `None` on the thread's first summarization. The caller supplies
/// `summarize_fn` (a call into the model with the initial-summary or
/// existing-summary prompt per §4.5) so this module stays model-agnostic.
pub fn summarize<F>(messages: &[Message], existing_summary: Option<&str>, keep_recent: usize, summarize_fn: F) -> ShapedMemory
where
    F: FnOnce(Option<&str>, &[Message]) -> String,
{
    if messages.len() <= keep_recent {
        return ShapedMemory { messages: messages.to_vec(), updated_summary: existing_summary.map(str::to_string) };
    }
    let split = messages.len() - keep_recent;
    let (to_fold, recent) = messages.split_at(split);
    let updated_summary = summarize_fn(existing_summary, to_fold);
    ShapedMemory { messages: recent.to_vec(), updated_summary: Some(updated_summary) }
}

pub const INITIAL_SUMMARY_PROMPT: &str =
    "Summarize the following conversation so far, preserving decisions, facts, and open threads.";
pub const EXISTING_SUMMARY_PROMPT: &str =
    "Here is the running summary so far. Fold in the following new messages, keeping it concise.";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::MessageContent;

    fn msg(role: Role, text: &str) -> Message {
        Message { role, content: MessageContent::Text(text.to_string()), tool_calls: None, tool_call_id: None, name: None }
    }

    #[test]
    fn trim_empty_history_passes_through_unchanged() {
        let shaped = trim(&[], 100);
        assert!(shaped.messages.is_empty());
    }

    #[test]
    fn trim_under_budget_is_returned_verbatim() {
        let messages = vec![msg(Role::User, "hi"), msg(Role::Assistant, "hello")];
        let shaped = trim(&messages, 1000);
        assert_eq!(shaped.messages.len(), 2);
    }

    #[test]
    fn trim_cuts_at_a_user_message_boundary() {
        let messages = vec![
            msg(Role::User, &"a".repeat(400)),
            msg(Role::Assistant, &"b".repeat(400)),
            msg(Role::User, &"c".repeat(400)),
            msg(Role::Assistant, &"d".repeat(400)),
        ];
        let shaped = trim(&messages, 250);
        assert_eq!(shaped.messages.first().unwrap().role, Role::User);
    }

    #[test]
    fn summarize_keeps_recent_and_folds_the_rest() {
        let messages: Vec<Message> = (0..10).map(|i| msg(Role::User, &format!("msg{i}"))).collect();
        let shaped = summarize(&messages, None, 3, |existing, folded| {
            assert!(existing.is_none());
            format!("folded {} messages", folded.len())
        });
        assert_eq!(shaped.messages.len(), 3);
        assert_eq!(shaped.updated_summary.unwrap(), "folded 7 messages");
    }

    #[test]
    fn summarize_under_keep_recent_is_untouched() {
        let messages = vec![msg(Role::User, "hi")];
        let shaped = summarize(&messages, Some("prior summary"), 5, |_, _| unreachable!());
        assert_eq!(shaped.messages.len(), 1);
        assert_eq!(shaped.updated_summary.as_deref(), Some("prior summary"));
    }
}
