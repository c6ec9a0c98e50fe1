//! ChatML-style history rendering
//!
//! Each message renders as
//!
//! ```text
//! <|im_start|>{role}\n{content}<|im_end|>\n
//! ```
//!
//! followed by an open assistant turn when the template asks for a cue.
//! [`split`] is the inverse of [`render`] for content that does not itself
//! contain the delimiters; [`try_render`] rejects content that does.

use thiserror::Error;

use crate::types::{ChatHistory, Message, Role, TemplateConfig};

/// Opens a role block
pub const ROLE_OPEN: &str = "<|im_start|>";

/// Closes a role block
pub const ROLE_CLOSE: &str = "<|im_end|>";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("expected <|im_start|> at byte {0}")]
    ExpectedOpen(usize),

    #[error("role name starting at byte {0} is not terminated by a newline")]
    UnterminatedRole(usize),

    #[error("message starting at byte {0} has no closing <|im_end|>")]
    UnterminatedMessage(usize),

    #[error("expected newline after <|im_end|> at byte {0}")]
    ExpectedNewline(usize),

    #[error("message {index} contains the delimiter {delimiter}")]
    DelimiterInContent { index: usize, delimiter: &'static str },
}

/// The open assistant block a rendered prompt ends with
pub fn assistant_cue() -> String {
    format!("{ROLE_OPEN}{}\n", Role::Assistant.as_str())
}

/// Renders `history`, refusing messages whose content contains a role
/// delimiter
pub fn try_render(
    history: &ChatHistory,
    config: &TemplateConfig,
) -> Result<String, TemplateError> {
    for (index, message) in history.into_iter().enumerate() {
        for delimiter in [ROLE_OPEN, ROLE_CLOSE] {
            if message.content.contains(delimiter) {
                return Err(TemplateError::DelimiterInContent { index, delimiter });
            }
        }
    }
    Ok(render(history, config))
}

/// Renders `history` into a prompt string.
///
/// Content is copied as is. Use [`try_render`] when it may contain the
/// delimiters.
pub fn render(history: &ChatHistory, config: &TemplateConfig) -> String {
    let mut prompt = String::new();
    for message in history {
        prompt.push_str(ROLE_OPEN);
        prompt.push_str(message.role.as_str());
        prompt.push('\n');
        prompt.push_str(&message.content);
        prompt.push_str(ROLE_CLOSE);
        prompt.push('\n');
    }
    if config.add_assistant_cue {
        prompt.push_str(&assistant_cue());
    }
    prompt
}

/// Parses a rendered prompt back into a history.
///
/// A trailing assistant cue is dropped when the template adds one.
pub fn split(text: &str, config: &TemplateConfig) -> Result<ChatHistory, TemplateError> {
    let cue = assistant_cue();
    let mut history = ChatHistory::new();
    let mut offset = 0;

    while offset < text.len() {
        let rest = &text[offset..];
        if config.add_assistant_cue && rest == cue {
            break;
        }
        if !rest.starts_with(ROLE_OPEN) {
            return Err(TemplateError::ExpectedOpen(offset));
        }

        let role_start = offset + ROLE_OPEN.len();
        let role_len = text[role_start..]
            .find('\n')
            .ok_or(TemplateError::UnterminatedRole(role_start))?;
        let role = Role::from_name(&text[role_start..role_start + role_len]);

        let content_start = role_start + role_len + 1;
        let content_len = text[content_start..]
            .find(ROLE_CLOSE)
            .ok_or(TemplateError::UnterminatedMessage(offset))?;
        let content = &text[content_start..content_start + content_len];

        let close_end = content_start + content_len + ROLE_CLOSE.len();
        if !text[close_end..].starts_with('\n') {
            return Err(TemplateError::ExpectedNewline(close_end));
        }

        history.push(Message::new(role, content));
        offset = close_end + 1;
    }

    Ok(history)
}
