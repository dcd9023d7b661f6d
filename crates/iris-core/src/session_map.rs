use anyhow::{bail, Result};

use crate::contracts::InboundMessage;

/// Default stable session mapping for Telegram-style chat ids.
pub fn telegram_session_id(chat_id: &str) -> Result<String> {
    let value = chat_id.trim();
    if value.is_empty() {
        bail!("chat_id must be a non-empty string");
    }
    Ok(format!("telegram:{value}"))
}

/// Resolves the default session identifier for one inbound message.
pub fn session_id_for_inbound(inbound: &InboundMessage) -> Result<String> {
    telegram_session_id(&inbound.chat_id)
}
