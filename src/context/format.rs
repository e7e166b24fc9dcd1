//! Single-string encoding of context data for transport headers.
//!
//! Layout: sections separated by `||`, each section a one-letter direction
//! tag followed by `|`-separated `key:value` entries:
//!
//! ```text
//! d|tenant:acme|user:42||b|locale:en
//! ```
//!
//! Entries whose key or value contains `|` or `:` (or whose key is empty) are
//! written as `:base64(key):base64(value)`. Only
//! [`DataScope::AcrossTransports`] entries are encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::{ConquerorContext, DataScope, Direction};
use crate::error::{ConquerorError, Result};

/// Header carrying the encoded context data.
pub const CONTEXT_HEADER: &str = "conqueror-context";

/// W3C trace context header.
pub const TRACE_PARENT_HEADER: &str = "traceparent";

const SECTION_SEPARATOR: &str = "||";
const ENTRY_SEPARATOR: char = '|';
const KEY_VALUE_SEPARATOR: char = ':';

fn tag(direction: Direction) -> char {
    match direction {
        Direction::Downstream => 'd',
        Direction::Upstream => 'u',
        Direction::Bidirectional => 'b',
    }
}

fn direction_for_tag(tag: &str) -> Option<Direction> {
    match tag {
        "d" => Some(Direction::Downstream),
        "u" => Some(Direction::Upstream),
        "b" => Some(Direction::Bidirectional),
        _ => None,
    }
}

fn needs_escaping(s: &str) -> bool {
    s.contains(ENTRY_SEPARATOR) || s.contains(KEY_VALUE_SEPARATOR)
}

impl ConquerorContext {
    /// Encode downstream and bidirectional data for a client to server hop.
    ///
    /// Returns `None` if there is nothing to send.
    pub fn encode_downstream(&self) -> Option<String> {
        self.encode_directions(&[Direction::Downstream, Direction::Bidirectional])
    }

    /// Encode upstream and bidirectional data for a server to client hop.
    ///
    /// Returns `None` if there is nothing to send.
    pub fn encode_upstream(&self) -> Option<String> {
        self.encode_directions(&[Direction::Upstream, Direction::Bidirectional])
    }

    fn encode_directions(&self, directions: &[Direction]) -> Option<String> {
        let mut out = String::new();

        for &direction in directions {
            let mut tagged = false;
            for (key, value, scope) in self.data(direction).entries() {
                if scope != DataScope::AcrossTransports {
                    continue;
                }

                if !tagged {
                    if !out.is_empty() {
                        out.push_str(SECTION_SEPARATOR);
                    }
                    out.push(tag(direction));
                    tagged = true;
                }

                out.push(ENTRY_SEPARATOR);
                if key.is_empty() || needs_escaping(&key) || needs_escaping(&value) {
                    out.push(KEY_VALUE_SEPARATOR);
                    out.push_str(&STANDARD.encode(key));
                    out.push(KEY_VALUE_SEPARATOR);
                    out.push_str(&STANDARD.encode(value));
                } else {
                    out.push_str(&key);
                    out.push(KEY_VALUE_SEPARATOR);
                    out.push_str(&value);
                }
            }
        }

        (!out.is_empty()).then_some(out)
    }

    /// Decode an encoded string into this context.
    ///
    /// Decoded entries are stored with [`DataScope::AcrossTransports`] and
    /// overwrite existing entries with the same key. Nothing is written if
    /// the input is malformed.
    pub fn decode(&self, encoded: &str) -> Result<()> {
        let entries = parse(encoded)?;
        for (direction, key, value) in entries {
            self.data(direction).set(key, value);
        }
        Ok(())
    }

    /// Decode several encoded strings (e.g. repeated header values).
    pub fn decode_all<'a, I>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for value in values {
            self.decode(value)?;
        }
        Ok(())
    }
}

fn parse(encoded: &str) -> Result<Vec<(Direction, String, String)>> {
    let mut entries = Vec::new();
    if encoded.is_empty() {
        return Ok(entries);
    }

    for section in encoded.split(SECTION_SEPARATOR) {
        let direction = section
            .get(..1)
            .and_then(direction_for_tag)
            .ok_or_else(|| invalid(format!("unknown context data section `{section}`")))?;

        let rest = section[1..]
            .strip_prefix(ENTRY_SEPARATOR)
            .ok_or_else(|| invalid(format!("empty context data section `{section}`")))?;

        for entry in rest.split(ENTRY_SEPARATOR) {
            let (key, value) = parse_entry(entry)?;
            entries.push((direction, key, value));
        }
    }

    Ok(entries)
}

fn parse_entry(entry: &str) -> Result<(String, String)> {
    if let Some(escaped) = entry.strip_prefix(KEY_VALUE_SEPARATOR) {
        let (key, value) = escaped
            .split_once(KEY_VALUE_SEPARATOR)
            .ok_or_else(|| invalid(format!("malformed escaped entry `{entry}`")))?;
        return Ok((decode_base64(key)?, decode_base64(value)?));
    }

    let (key, value) = entry
        .split_once(KEY_VALUE_SEPARATOR)
        .ok_or_else(|| invalid(format!("malformed entry `{entry}`")))?;
    Ok((key.to_string(), value.to_string()))
}

fn decode_base64(s: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(s)
        .map_err(|e| invalid(format!("invalid base64 `{s}`: {e}")))?;
    String::from_utf8(bytes).map_err(|e| invalid(format!("invalid UTF-8 in `{s}`: {e}")))
}

fn invalid(message: String) -> ConquerorError {
    ConquerorError::InvalidContextData(message)
}
