/**
 * LOG LINE GRAMMAR - Parser for the tagged line format spoken by workers
 *
 * FORMAT:
 *   [<tag>] [<severity>] [<timestamp>] <message>
 *
 * The tag is an instance id on the heartbeat channel and an app name on the
 * log-stream channel. Tag, severity and timestamp are mandatory and non-empty;
 * the message is free text (it may itself contain brackets) and may be empty.
 * A trailing line terminator is not part of the message.
 *
 * Parsing never panics: every malformed input maps to a `LineError` that the
 * transports surface as a diagnostic before moving on.
 */

use std::fmt;

/// Severity label carried by every line. Only ERROR and FATAL escalate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
    Other(String),
}

impl Severity {
    /// Case-insensitive mapping of a severity label.
    pub fn parse(label: &str) -> Self {
        let label = label.trim();
        match label.to_ascii_uppercase().as_str() {
            "DEBUG" => Severity::Debug,
            "INFO" => Severity::Info,
            "WARN" | "WARNING" => Severity::Warning,
            "ERROR" => Severity::Error,
            "FATAL" | "CRITICAL" => Severity::Fatal,
            _ => Severity::Other(label.to_string()),
        }
    }

    /// True for severities that must be persisted and trigger remediation.
    pub fn escalates(&self) -> bool {
        matches!(self, Severity::Error | Severity::Fatal)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
            Severity::Other(label) => label,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed worker line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub tag: String,
    pub severity: Severity,
    pub timestamp: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Tag,
    Severity,
    Timestamp,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Tag => "tag",
            Field::Severity => "severity",
            Field::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LineError {
    #[error("expected '[' opening the {0} field")]
    MissingField(Field),
    #[error("unterminated {0} field")]
    Unterminated(Field),
    #[error("empty {0} field")]
    EmptyField(Field),
    #[error("expected a space after the {0} field")]
    MissingSeparator(Field),
}

/// Splits `[value]rest` into `(value, rest)`.
fn bracketed(input: &str, field: Field) -> Result<(&str, &str), LineError> {
    let rest = input
        .strip_prefix('[')
        .ok_or(LineError::MissingField(field))?;
    let end = rest.find(']').ok_or(LineError::Unterminated(field))?;
    let value = rest[..end].trim();
    if value.is_empty() {
        return Err(LineError::EmptyField(field));
    }
    Ok((value, &rest[end + 1..]))
}

fn separator(input: &str, after: Field) -> Result<&str, LineError> {
    input
        .strip_prefix(' ')
        .ok_or(LineError::MissingSeparator(after))
}

/// Parses a full `[tag] [severity] [timestamp] message` line.
pub fn parse_line(text: &str) -> Result<LogLine, LineError> {
    let text = text.trim_end_matches(['\r', '\n']);

    let (tag, rest) = bracketed(text, Field::Tag)?;
    let rest = separator(rest, Field::Tag)?;
    let (severity, rest) = bracketed(rest, Field::Severity)?;
    let rest = separator(rest, Field::Severity)?;
    let (timestamp, rest) = bracketed(rest, Field::Timestamp)?;
    let message = if rest.is_empty() {
        rest
    } else {
        separator(rest, Field::Timestamp)?
    };

    Ok(LogLine {
        tag: tag.to_string(),
        severity: Severity::parse(severity),
        timestamp: timestamp.to_string(),
        message: message.to_string(),
    })
}

/// First bracketed tag of a message when followed by whitespace,
/// e.g. `worker-A` for `[worker-A] [INFO] ...`.
pub fn leading_tag(text: &str) -> Option<&str> {
    let rest = text.strip_prefix('[')?;
    let end = rest.find(']')?;
    let tag = &rest[..end];
    let followed_by_space = rest[end + 1..].starts_with(char::is_whitespace);
    if tag.is_empty() || !followed_by_space {
        return None;
    }
    Some(tag)
}
