//! Human-readable rendering of sessions and messages, for logs and
//! debugging output.

use crate::types::{AiPart, ChatMessage, Session, UserPart};
use std::fmt;

impl fmt::Display for UserPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserPart::Text(text) => write!(f, "Text: {}", text.replace('\n', "\n    ")),
            UserPart::FunctionResponse(response) => {
                write!(f, "FunctionResponse: name={}", response.name)?;
                if let Some(id) = &response.id {
                    write!(f, ", id={id}")?;
                }
                write!(f, "\n    Result: {}", response.text.replace('\n', "\n    "))
            }
        }
    }
}

impl fmt::Display for AiPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AiPart::Text(text) => write!(f, "Text: {}", text.replace('\n', "\n    ")),
            AiPart::FunctionCall(call) => {
                write!(f, "FunctionCall: name={}", call.name)?;
                if let Some(id) = &call.id {
                    write!(f, ", id={id}")?;
                }
                let args = serde_json::to_string(&call.args)
                    .unwrap_or_else(|_| call.args.to_string());
                write!(f, "\n    Args: {args}")
            }
        }
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatMessage::User(user) => {
                writeln!(f, "User:")?;
                for part in &user.parts {
                    writeln!(f, "  {part}")?;
                }
            }
            ChatMessage::Ai(ai) => {
                writeln!(f, "Assistant:")?;
                for part in &ai.parts {
                    writeln!(f, "  {part}")?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(developer) = &self.developer {
            writeln!(f, "Developer: {}", developer.text().replace('\n', "\n  "))?;
        }
        for message in &self.messages {
            write!(f, "{message}")?;
        }
        Ok(())
    }
}
