//! Pure parser from one raw Telegram update to an inbound message or a skip.
//!
//! Only `message.text` updates normalize into an `InboundMessage`; every
//! other payload shape yields a stable skip reason. No I/O, no clock, no
//! mutation of the input.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use iris_core::InboundMessage;

/// Enumerates stable skip reasons for unsupported update payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateSkipReason {
    InvalidUpdateId,
    MissingMessage,
    UnsupportedUpdateType,
    MissingChat,
    MissingUser,
    EmptyText,
}

impl UpdateSkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUpdateId => "invalid-update-id",
            Self::MissingMessage => "missing-message",
            Self::UnsupportedUpdateType => "unsupported-update-type",
            Self::MissingChat => "missing-chat",
            Self::MissingUser => "missing-user",
            Self::EmptyText => "empty-text",
        }
    }
}

/// Whether a present-but-empty `message.text` still parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextPolicy {
    #[default]
    AllowEmpty,
    RejectEmpty,
}

/// Normalized parser output for one Telegram update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTelegramUpdate {
    pub update_id: Option<String>,
    pub inbound: Option<InboundMessage>,
    pub skip: Option<UpdateSkipReason>,
}

impl ParsedTelegramUpdate {
    fn skipped(update_id: Option<String>, skip: UpdateSkipReason) -> Self {
        Self {
            update_id,
            inbound: None,
            skip: Some(skip),
        }
    }
}

// Update kinds Telegram can deliver besides plain messages. Their presence
// distinguishes "unsupported type" from a payload with no message at all.
const NON_MESSAGE_UPDATE_KEYS: &[&str] = &[
    "edited_message",
    "channel_post",
    "edited_channel_post",
    "callback_query",
    "inline_query",
    "chosen_inline_result",
    "my_chat_member",
    "chat_member",
];

/// Parses one raw update with the default text policy (empty text allowed).
pub fn parse_update(raw_update: &Value) -> ParsedTelegramUpdate {
    parse_update_with_policy(raw_update, TextPolicy::AllowEmpty)
}

pub fn parse_update_with_policy(raw_update: &Value, policy: TextPolicy) -> ParsedTelegramUpdate {
    let Some(update_id) = coerce_id(raw_update.get("update_id")) else {
        return ParsedTelegramUpdate::skipped(None, UpdateSkipReason::InvalidUpdateId);
    };

    let message = match raw_update.get("message") {
        Some(Value::Object(message)) => message,
        Some(_) => {
            return ParsedTelegramUpdate::skipped(
                Some(update_id),
                UpdateSkipReason::UnsupportedUpdateType,
            );
        }
        None => {
            let skip = if NON_MESSAGE_UPDATE_KEYS
                .iter()
                .any(|key| raw_update.get(*key).is_some())
            {
                UpdateSkipReason::UnsupportedUpdateType
            } else {
                UpdateSkipReason::MissingMessage
            };
            return ParsedTelegramUpdate::skipped(Some(update_id), skip);
        }
    };

    let text = match message.get("text") {
        Some(Value::String(text)) => text.clone(),
        _ => {
            return ParsedTelegramUpdate::skipped(
                Some(update_id),
                UpdateSkipReason::UnsupportedUpdateType,
            );
        }
    };
    if matches!(policy, TextPolicy::RejectEmpty) && text.trim().is_empty() {
        return ParsedTelegramUpdate::skipped(Some(update_id), UpdateSkipReason::EmptyText);
    }

    let Some(chat_id) = coerce_id(message.get("chat").and_then(|chat| chat.get("id"))) else {
        return ParsedTelegramUpdate::skipped(Some(update_id), UpdateSkipReason::MissingChat);
    };
    let Some(user_id) = coerce_id(message.get("from").and_then(|sender| sender.get("id"))) else {
        return ParsedTelegramUpdate::skipped(Some(update_id), UpdateSkipReason::MissingUser);
    };

    let received_ts_ms = message
        .get("date")
        .and_then(Value::as_u64)
        .map(|seconds| seconds.saturating_mul(1_000))
        .unwrap_or(0);

    let inbound = InboundMessage {
        update_id: update_id.clone(),
        chat_id,
        user_id: Some(user_id),
        text,
        message_id: coerce_id(message.get("message_id")),
        received_ts_ms,
    };
    ParsedTelegramUpdate {
        update_id: Some(update_id),
        inbound: Some(inbound),
        skip: None,
    }
}

// Canonical id form: integers render as plain decimal (no leading zeros),
// anything else keeps its trimmed string shape.
fn coerce_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Number(number) => number.as_i64().map(|id| id.to_string()),
        Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<i64>() {
                Ok(numeric) => Some(numeric.to_string()),
                Err(_) => Some(trimmed.to_string()),
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn text_update(update_id: u64, chat_id: i64, text: &str) -> Value {
        json!({
            "update_id": update_id,
            "message": {
                "message_id": 42,
                "date": 1_760_100_000_u64,
                "text": text,
                "chat": {"id": chat_id},
                "from": {"id": 7, "username": "ops"}
            }
        })
    }

    #[test]
    fn functional_parse_update_normalizes_text_message() {
        let parsed = parse_update(&text_update(1001, -100_555, "hello"));
        assert_eq!(parsed.skip, None);
        let inbound = parsed.inbound.expect("inbound");
        assert_eq!(inbound.update_id, "1001");
        assert_eq!(inbound.chat_id, "-100555");
        assert_eq!(inbound.user_id.as_deref(), Some("7"));
        assert_eq!(inbound.text, "hello");
        assert_eq!(inbound.message_id.as_deref(), Some("42"));
        assert_eq!(inbound.received_ts_ms, 1_760_100_000_000);
    }

    #[test]
    fn unit_parse_update_is_deterministic_for_identical_input() {
        let raw = text_update(1001, 42, "same");
        assert_eq!(parse_update(&raw), parse_update(&raw));
    }

    #[test]
    fn unit_parse_update_coerces_string_ids_to_canonical_decimal() {
        let raw = json!({
            "update_id": "0042",
            "message": {
                "text": "hi",
                "chat": {"id": "007"},
                "from": {"id": "0099"}
            }
        });
        let inbound = parse_update(&raw).inbound.expect("inbound");
        assert_eq!(inbound.update_id, "42");
        assert_eq!(inbound.chat_id, "7");
        assert_eq!(inbound.user_id.as_deref(), Some("99"));
        assert_eq!(inbound.received_ts_ms, 0);
    }

    #[test]
    fn unit_parse_update_skips_update_without_usable_id() {
        let parsed = parse_update(&json!({"message": {"text": "hi"}}));
        assert_eq!(parsed.update_id, None);
        assert_eq!(parsed.skip, Some(UpdateSkipReason::InvalidUpdateId));
    }

    #[test]
    fn unit_parse_update_distinguishes_missing_message_from_other_kinds() {
        let bare = parse_update(&json!({"update_id": 1}));
        assert_eq!(bare.skip, Some(UpdateSkipReason::MissingMessage));

        let edit = parse_update(&json!({
            "update_id": 2,
            "edited_message": {"text": "changed", "chat": {"id": 42}, "from": {"id": 7}}
        }));
        assert_eq!(edit.skip, Some(UpdateSkipReason::UnsupportedUpdateType));
        assert_eq!(edit.update_id.as_deref(), Some("2"));

        let callback = parse_update(&json!({"update_id": 3, "callback_query": {"id": "cb"}}));
        assert_eq!(callback.skip, Some(UpdateSkipReason::UnsupportedUpdateType));
    }

    #[test]
    fn unit_parse_update_skips_media_message_without_text() {
        let parsed = parse_update(&json!({
            "update_id": 4,
            "message": {"photo": [{"file_id": "abc"}], "chat": {"id": 42}, "from": {"id": 7}}
        }));
        assert_eq!(parsed.skip, Some(UpdateSkipReason::UnsupportedUpdateType));
        assert_eq!(parsed.inbound, None);
    }

    #[test]
    fn unit_parse_update_skips_message_missing_chat_or_user() {
        let no_chat = parse_update(&json!({
            "update_id": 5,
            "message": {"text": "hi", "from": {"id": 7}}
        }));
        assert_eq!(no_chat.skip, Some(UpdateSkipReason::MissingChat));

        let no_user = parse_update(&json!({
            "update_id": 6,
            "message": {"text": "hi", "chat": {"id": 42}}
        }));
        assert_eq!(no_user.skip, Some(UpdateSkipReason::MissingUser));
    }

    #[test]
    fn functional_text_policy_controls_empty_text_handling() {
        let raw = text_update(7, 42, "   ");
        let allowed = parse_update_with_policy(&raw, TextPolicy::AllowEmpty);
        assert!(allowed.inbound.is_some());
        assert_eq!(allowed.skip, None);

        let rejected = parse_update_with_policy(&raw, TextPolicy::RejectEmpty);
        assert_eq!(rejected.skip, Some(UpdateSkipReason::EmptyText));
        assert_eq!(rejected.update_id.as_deref(), Some("7"));
    }

    #[test]
    fn regression_parse_update_does_not_mutate_input() {
        let raw = text_update(8, 42, "hello");
        let before = raw.clone();
        let _ = parse_update(&raw);
        assert_eq!(raw, before);
    }
}
