use serde_json::Value;

use chatrelay_types::{Conversation, Part, Role, Turn};
use chatrelay_wire::decode_history_entry;

/// Repairs a client-supplied history so the upstream model accepts it.
///
/// Entries without a recognizable role, or without usable leading content,
/// are dropped. Everything before the first `user` turn is dropped. Adjacent
/// `user`/`user` and `model`/`model` turns collapse to the later one, while
/// runs of `tool` turns are left alone. The result is either empty or starts
/// with `user`, and normalizing it again changes nothing.
pub fn normalize_history(raw: &[Value]) -> Conversation {
    normalize_turns(
        raw.iter()
            .filter_map(decode_history_entry)
            .filter(Turn::has_usable_content)
            .map(without_function_parts)
            .collect(),
    )
}

/// Call/response pairs only exist inside one resolution; a client's copy of
/// one would reach the model unmatched.
fn without_function_parts(mut turn: Turn) -> Turn {
    turn.parts
        .retain(|part| !matches!(part, Part::FunctionCall(_) | Part::FunctionResponse(_)));
    turn
}

pub fn normalize_turns(turns: Vec<Turn>) -> Conversation {
    let aligned = turns
        .into_iter()
        .filter(Turn::has_usable_content)
        .skip_while(|turn| turn.role != Role::User);

    let mut out: Vec<Turn> = Vec::new();
    for turn in aligned {
        let superseded = out
            .last()
            .map(|prev| prev.role == turn.role && turn.role != Role::Tool)
            .unwrap_or(false);
        if superseded {
            out.pop();
        }
        out.push(turn);
    }
    Conversation::from_turns(out)
}

/// Keeps the most recent `max_turns` turns (`0` keeps everything), then
/// re-aligns so the window still opens with a `user` turn.
pub fn truncate_history(conversation: Conversation, max_turns: usize) -> Conversation {
    if max_turns == 0 || conversation.len() <= max_turns {
        return conversation;
    }
    let mut turns = conversation.into_turns();
    let window = turns.split_off(turns.len() - max_turns);
    Conversation::from_turns(
        window
            .into_iter()
            .skip_while(|turn| turn.role != Role::User)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_types::{ToolInvocation, ToolResult};
    use serde_json::{json, Map};

    fn text_of(conversation: &Conversation) -> Vec<(Role, String)> {
        conversation
            .turns()
            .iter()
            .map(|t| (t.role, t.text()))
            .collect()
    }

    #[test]
    fn leading_model_turn_and_user_run_collapse() {
        let raw = vec![
            json!({"role": "model"}),
            json!({"role": "user", "parts": [{"text": "hi"}]}),
            json!({"role": "user", "parts": [{"text": "hi again"}]}),
        ];
        let normalized = normalize_history(&raw);
        assert_eq!(text_of(&normalized), vec![(Role::User, "hi again".to_string())]);
    }

    #[test]
    fn history_without_user_turn_is_empty() {
        let raw = vec![
            json!({"role": "model", "parts": [{"text": "welcome"}]}),
            json!({"role": "assistant", "text": "how can I help?"}),
        ];
        assert!(normalize_history(&raw).is_empty());
        assert!(normalize_history(&[]).is_empty());
    }

    #[test]
    fn unusable_entries_are_dropped_before_adjacency_checks() {
        let raw = vec![
            json!({"role": "user", "parts": [{"text": "first"}]}),
            json!({"role": "model", "parts": []}),
            json!({"role": "model", "parts": [{"text": "   "}]}),
            json!({"role": "robot", "parts": [{"text": "beep"}]}),
            json!("not an object"),
            json!({"role": "user", "parts": [{"text": "second"}]}),
            json!({"role": "model", "parts": [{"text": "answer"}]}),
        ];
        let normalized = normalize_history(&raw);
        assert_eq!(
            text_of(&normalized),
            vec![
                (Role::User, "second".to_string()),
                (Role::Model, "answer".to_string())
            ]
        );
    }

    #[test]
    fn model_runs_keep_the_later_turn() {
        let raw = vec![
            json!({"role": "user", "parts": ["q"]}),
            json!({"role": "model", "parts": ["draft"]}),
            json!({"role": "MODEL", "parts": ["final"]}),
            json!({"role": "user", "content": "thanks"}),
        ];
        assert_eq!(
            text_of(&normalize_history(&raw)),
            vec![
                (Role::User, "q".to_string()),
                (Role::Model, "final".to_string()),
                (Role::User, "thanks".to_string())
            ]
        );
    }

    #[test]
    fn function_parts_from_clients_are_not_content() {
        let raw = vec![
            json!({"role": "user", "parts": [{"text": "weather?"}]}),
            json!({"role": "model", "parts": [{"functionCall": {"name": "web_search", "args": {"query": "weather"}}}]}),
            json!({"role": "function", "parts": [{"functionResponse": {"name": "web_search", "response": {"results": []}}}]}),
            json!({"role": "model", "parts": [{"text": "sunny"}]}),
        ];
        assert_eq!(
            normalize_history(&raw).roles(),
            vec![Role::User, Role::Model]
        );
    }

    #[test]
    fn trailing_function_parts_are_stripped_from_client_turns() {
        let raw = vec![
            json!({"role": "user", "parts": [{"text": "gold?"}]}),
            json!({"role": "model", "parts": [
                {"text": "Searching"},
                {"functionCall": {"name": "web_search", "args": {"query": "gold"}}}
            ]}),
            json!({"role": "user", "parts": [
                {"text": "and silver?"},
                {"functionResponse": {"name": "web_search", "response": {"results": []}}}
            ]}),
        ];
        let normalized = normalize_history(&raw);
        assert_eq!(
            text_of(&normalized),
            vec![
                (Role::User, "gold?".to_string()),
                (Role::Model, "Searching".to_string()),
                (Role::User, "and silver?".to_string())
            ]
        );
        assert!(normalized
            .turns()
            .iter()
            .flat_map(|t| t.parts.iter())
            .all(|p| matches!(p, Part::Text(_))));
        assert_eq!(normalize_turns(normalized.clone().into_turns()), normalized);
    }

    #[test]
    fn tool_runs_are_kept() {
        let turns = vec![
            Turn::user_text("look these up"),
            Turn::new(Role::Tool, vec![Part::text("result one")]),
            Turn::new(Role::Tool, vec![Part::text("result two")]),
            Turn::model_text("done"),
        ];
        assert_eq!(
            normalize_turns(turns).roles(),
            vec![Role::User, Role::Tool, Role::Tool, Role::Model]
        );
    }

    #[test]
    fn normalizing_twice_is_identity() {
        let raw = vec![
            json!({"role": "tool", "parts": [{"text": "orphan"}]}),
            json!({"role": "user", "parts": [{"text": "a"}]}),
            json!({"role": "user", "parts": [{"text": "b"}, {"inlineData": {"mimeType": "image/png", "data": "aGk="}}]}),
            json!({"role": "model", "parts": [{"text": "c"}]}),
            json!({"role": "model", "parts": [{"text": "d"}]}),
            json!({"role": "tool", "parts": [{"text": "e"}]}),
            json!({"role": "tool", "parts": [{"text": "f"}]}),
            json!({"role": "user", "parts": [{"text": ""}]}),
        ];
        let once = normalize_history(&raw);
        let twice = normalize_turns(once.clone().into_turns());
        assert_eq!(once, twice);
        assert_eq!(once.turns()[0].parts.len(), 2);
    }

    #[test]
    fn truncation_keeps_a_user_first_suffix() {
        let turns = vec![
            Turn::user_text("1"),
            Turn::model_text("2"),
            Turn::user_text("3"),
            Turn::model_text("4"),
            Turn::user_text("5"),
            Turn::model_text("6"),
        ];
        let conversation = normalize_turns(turns);

        let truncated = truncate_history(conversation.clone(), 3);
        assert_eq!(
            text_of(&truncated),
            vec![(Role::User, "5".to_string()), (Role::Model, "6".to_string())]
        );
        assert_eq!(truncate_history(conversation.clone(), 4).len(), 4);
        assert_eq!(truncate_history(conversation.clone(), 0), conversation);
    }

    #[test]
    fn truncation_can_cut_into_a_tool_exchange() {
        let conversation = Conversation::from_turns(vec![
            Turn::user_text("find gold price"),
            Turn::model_call(ToolInvocation::new("web_search", Map::new())),
            Turn::tool_result("web_search", &ToolResult::success(json!({"results": []}))),
            Turn::model_text("no data"),
        ]);
        assert!(truncate_history(conversation, 3).is_empty());
    }
}
