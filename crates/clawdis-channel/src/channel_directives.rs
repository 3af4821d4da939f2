//! User-authored `/...` directive parsing.
//!
//! Directives ride at the start of a message body; parsing strips them off
//! and the scheduler applies them to the session entry before the remaining
//! text (the command body) reaches the agent.

use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
/// Enumerates supported `Directive` values.
pub enum Directive {
    New,
    Reset,
    Thinking { level: String },
    Verbose { level: String },
    Activation { mode: String },
    Unknown { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDirectives {
    pub directives: Vec<Directive>,
    /// The body with directive lines removed.
    pub command_body: String,
}

/// Parses leading directive lines out of a message body.
///
/// Only lines at the head of the message are treated as directives; a `/`
/// later in the text is ordinary content.
pub fn parse_directives(body: &str) -> ParsedDirectives {
    let mut directives = Vec::new();
    let mut remaining_lines = Vec::new();
    let mut in_head = true;

    for line in body.lines() {
        let trimmed = line.trim();
        if in_head && trimmed.starts_with('/') && !trimmed.starts_with("//") {
            let mut parts = trimmed[1..].split_whitespace();
            let name = parts.next().unwrap_or_default().to_ascii_lowercase();
            let argument = parts.next().unwrap_or_default().to_string();
            let directive = match name.as_str() {
                "new" => Directive::New,
                "reset" => Directive::Reset,
                "thinking" => Directive::Thinking { level: argument },
                "verbose" => Directive::Verbose { level: argument },
                "activation" => Directive::Activation { mode: argument },
                _ => Directive::Unknown { name },
            };
            directives.push(directive);
            continue;
        }
        if !trimmed.is_empty() {
            in_head = false;
        }
        remaining_lines.push(line);
    }

    ParsedDirectives {
        directives,
        command_body: remaining_lines.join("\n").trim().to_string(),
    }
}
