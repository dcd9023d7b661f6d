//! Telegram Bot API transport for the iris channel runtime.
//!
//! Composes the long-polling API client, the pure update parser, and the
//! durable cursor store into the channel adapter port, with
//! seen/pending/processed bookkeeping so restarts neither lose nor
//! re-deliver updates.

pub mod adapter;
pub mod api_client;
pub mod cursor_state;
pub mod update_parser;

pub use adapter::TelegramChannelAdapter;
pub use api_client::{TelegramApiClient, TelegramApiClientConfig, TelegramApiError, TelegramApiErrorKind};
pub use cursor_state::{CursorStateError, CursorStateStore, CURSOR_STATE_SCHEMA};
pub use update_parser::{parse_update, ParsedTelegramUpdate, TextPolicy, UpdateSkipReason};
