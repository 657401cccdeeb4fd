/// GDB/MI output parser
///
/// This module handles parsing GDB/MI protocol output into structured data,
/// plus the line framing of the raw stdout byte stream.

use crate::types::*;
use crate::{GdbError, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Internal parse steps report a bare message
type ParseResult<T> = std::result::Result<T, String>;
type Chars<'a> = std::iter::Peekable<std::str::Chars<'a>>;

fn record_header() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| Regex::new(r"^(\d*)([\^*+=~@&(])").expect("valid record header regex"))
}

/// Parse a line of GDB/MI output
pub fn parse_gdb_output(line: &str) -> Result<GdbOutput> {
    parse_line(line).map_err(GdbError::ParseError)
}

fn parse_line(line: &str) -> ParseResult<GdbOutput> {
    let line = line.trim_end_matches(['\r', '\n']);

    if line.trim().is_empty() {
        return Err("Empty line".into());
    }

    let caps = match record_header().captures(line) {
        Some(caps) => caps,
        // Raw text without a sigil (seen on Windows) is plain console output
        None => return Ok(GdbOutput::Stream(console_verbatim(line))),
    };

    let token = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok());
    let sigil = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    let rest = &line[caps.get(0).map(|m| m.end()).unwrap_or(0)..];

    match sigil {
        "(" => {
            if line.trim_end().starts_with("(gdb)") {
                Ok(GdbOutput::Prompt)
            } else {
                Ok(GdbOutput::Stream(console_verbatim(line)))
            }
        }
        "~" | "@" | "&" => {
            let stream_type = match sigil {
                "~" => StreamType::Console,
                "@" => StreamType::Target,
                _ => StreamType::Log,
            };
            let content = parse_c_string(rest).unwrap_or_else(|| rest.to_string());
            Ok(GdbOutput::Stream(StreamRecord { stream_type, content }))
        }
        "^" => parse_result_record(token, rest).map(GdbOutput::Result),
        _ => {
            let kind = match sigil {
                "*" => AsyncKind::Exec,
                "+" => AsyncKind::Status,
                _ => AsyncKind::Notify,
            };
            parse_async_record(token, kind, rest).map(GdbOutput::Async)
        }
    }
}

fn console_verbatim(line: &str) -> StreamRecord {
    StreamRecord {
        stream_type: StreamType::Console,
        content: line.to_string(),
    }
}

/// Split `class,results` at the first comma
fn split_class(rest: &str) -> (&str, Option<&str>) {
    match rest.find(',') {
        Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
        None => (rest, None),
    }
}

/// Parse a result record body (everything after `^`)
fn parse_result_record(token: Option<u32>, rest: &str) -> ParseResult<GdbResult> {
    let (class_str, results_str) = split_class(rest);
    if class_str.is_empty() {
        return Err("Missing result class".into());
    }

    let results = match results_str {
        Some(s) => parse_result_list(s)?,
        None => Tuple::new(),
    };

    Ok(GdbResult {
        token,
        class: ResultClass::parse(class_str),
        results,
    })
}

/// Parse an async record body (everything after `*`, `+` or `=`)
fn parse_async_record(token: Option<u32>, kind: AsyncKind, rest: &str) -> ParseResult<AsyncRecord> {
    let (class_str, results_str) = split_class(rest);
    if class_str.is_empty() {
        return Err("Missing async class".into());
    }

    let results = match results_str {
        Some(s) => parse_result_list(s)?,
        None => Tuple::new(),
    };

    Ok(AsyncRecord {
        token,
        kind,
        class: AsyncClass::parse(class_str),
        results,
    })
}

/// Parse result key-value pairs
pub fn parse_results(input: &str) -> Result<Tuple> {
    parse_result_list(input).map_err(GdbError::ParseError)
}

fn parse_result_list(input: &str) -> ParseResult<Tuple> {
    let mut results = Tuple::new();
    let mut chars = input.chars().peekable();

    while chars.peek().is_some() {
        if chars.peek() == Some(&'{') {
            // MI2 appends nameless location rows after `bkpt={...}`
            let _ = parse_value(&mut chars)?;
            log::debug!("Skipped nameless tuple in result list");
        } else {
            let key = parse_identifier(&mut chars)?;

            if chars.next() != Some('=') {
                return Err(format!("Expected '=' after key '{}'", key));
            }

            match parse_value(&mut chars)? {
                Some(value) => {
                    results.insert(key, value);
                }
                None => log::debug!("Dropping unterminated value for '{}'", key),
            }
        }

        match chars.next() {
            Some(',') | None => {}
            Some(other) => return Err(format!("Unexpected '{}' between results", other)),
        }
    }

    Ok(results)
}

/// Parse an identifier (key name)
fn parse_identifier(chars: &mut Chars) -> ParseResult<String> {
    let mut identifier = String::new();

    while let Some(&ch) = chars.peek() {
        if ch.is_alphanumeric() || ch == '_' || ch == '-' {
            identifier.push(ch);
            chars.next();
        } else {
            break;
        }
    }

    if identifier.is_empty() {
        return Err("Empty identifier".into());
    }

    Ok(identifier)
}

/// Parse a value (string, list, or tuple).
///
/// `Ok(None)` means the input ended inside the value: the substructure is
/// treated as absent instead of failing the whole line.
fn parse_value(chars: &mut Chars) -> ParseResult<Option<Value>> {
    match chars.peek() {
        Some('"') => {
            chars.next();
            Ok(parse_c_string_body(chars).map(Value::String))
        }
        Some('[') => {
            chars.next();
            parse_list(chars)
        }
        Some('{') => {
            chars.next();
            parse_tuple(chars)
        }
        Some(_) => {
            let mut string_val = String::new();

            while let Some(&ch) = chars.peek() {
                if ch == ',' || ch == ']' || ch == '}' {
                    break;
                }
                string_val.push(ch);
                chars.next();
            }

            if string_val.is_empty() {
                return Err("Empty value".into());
            }

            Ok(Some(Value::String(string_val)))
        }
        None => Ok(None),
    }
}

fn parse_list(chars: &mut Chars) -> ParseResult<Option<Value>> {
    let mut list = Vec::new();

    if chars.peek() == Some(&']') {
        chars.next();
        return Ok(Some(Value::List(list)));
    }

    loop {
        let item = match chars.peek() {
            None => return Ok(None),
            Some('"') | Some('[') | Some('{') => parse_value(chars)?,
            Some(_) => {
                // `[frame={...},frame={...}]`: names inside lists are dropped
                parse_identifier(chars)?;
                if chars.next() != Some('=') {
                    return Err("Expected '=' in list entry".into());
                }
                parse_value(chars)?
            }
        };

        match item {
            Some(value) => list.push(value),
            None => return Ok(None),
        }

        match chars.next() {
            Some(',') => continue,
            Some(']') => return Ok(Some(Value::List(list))),
            None => return Ok(None),
            Some(other) => return Err(format!("Unexpected '{}' in list", other)),
        }
    }
}

fn parse_tuple(chars: &mut Chars) -> ParseResult<Option<Value>> {
    if chars.peek() == Some(&'}') {
        chars.next();
        return Ok(Some(Value::Tuple(Tuple::new())));
    }

    // `{"a","b"}`: GDB left out the names, so this is really a list
    if chars.peek() == Some(&'"') {
        let mut values = Vec::new();
        loop {
            match parse_value(chars)? {
                Some(value) => values.push(value),
                None => return Ok(None),
            }
            match chars.next() {
                Some(',') => continue,
                Some('}') => return Ok(Some(Value::List(values))),
                None => return Ok(None),
                Some(other) => return Err(format!("Unexpected '{}' in tuple", other)),
            }
        }
    }

    let mut tuple = Tuple::new();
    loop {
        if chars.peek().is_none() {
            return Ok(None);
        }
        let key = parse_identifier(chars)?;
        match chars.next() {
            Some('=') => {}
            None => return Ok(None),
            Some(_) => return Err("Expected '=' in tuple".into()),
        }

        match parse_value(chars)? {
            Some(value) => {
                tuple.insert(key, value);
            }
            None => return Ok(None),
        }

        match chars.next() {
            Some(',') => continue,
            Some('}') => return Ok(Some(Value::Tuple(tuple))),
            None => return Ok(None),
            Some(other) => return Err(format!("Unexpected '{}' in tuple", other)),
        }
    }
}

/// Decode the body of a C string, the opening quote already consumed.
///
/// Octal escapes produce raw bytes, so the whole body is assembled as bytes
/// and decoded as UTF-8 at the end. Returns `None` if the closing quote is
/// missing.
fn parse_c_string_body(chars: &mut Chars) -> Option<String> {
    let mut bytes: Vec<u8> = Vec::new();
    let mut utf8 = [0u8; 4];

    loop {
        let ch = chars.next()?;
        match ch {
            '"' => return Some(String::from_utf8_lossy(&bytes).into_owned()),
            '\\' => match chars.next()? {
                'n' => bytes.push(b'\n'),
                't' => bytes.push(b'\t'),
                'r' => bytes.push(b'\r'),
                '\\' => bytes.push(b'\\'),
                '"' => bytes.push(b'"'),
                digit @ '0'..='7' => {
                    let mut code = digit.to_digit(8).unwrap_or(0);
                    for _ in 0..2 {
                        match chars.peek().and_then(|c| c.to_digit(8)) {
                            Some(d) => {
                                code = code * 8 + d;
                                chars.next();
                            }
                            None => break,
                        }
                    }
                    bytes.push((code & 0xff) as u8);
                }
                other => {
                    bytes.push(b'\\');
                    bytes.extend_from_slice(other.encode_utf8(&mut utf8).as_bytes());
                }
            },
            other => bytes.extend_from_slice(other.encode_utf8(&mut utf8).as_bytes()),
        }
    }
}

/// Parse a C-style string (removes quotes and handles escape sequences)
pub fn parse_c_string(input: &str) -> Option<String> {
    let mut chars = input.chars().peekable();
    if chars.next() != Some('"') {
        return None;
    }
    let decoded = parse_c_string_body(&mut chars)?;
    if chars.next().is_some() {
        return None;
    }
    Some(decoded)
}

/// Escape a string so GDB reads it back as a single C-string argument
pub fn escape_c_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 2);
    out.push('"');
    for ch in input.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Splits a byte stream into lines, holding partial lines between chunks
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and take every line it completed (terminators stripped)
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left once the stream ends
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
        Some(line)
    }
}
