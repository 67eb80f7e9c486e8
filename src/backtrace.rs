//! Backtrace parsing for both GDB dialects.
//!
//! The MI front-end answers `-stack-list-frames` with structured
//! `frame={...}` records; console GDB answers `backtrace` with one
//! `#N ...` line per frame. Both reduce to the same [`StackFrame`] value
//! type so the aggregator sees a single currency. Console lines go through
//! a [`FrameInterner`] so a frame line is parsed once no matter how many
//! threads or samples repeat it.

use std::collections::HashMap;

use crate::error::ProfilerError;

/// Anchor that opens the structured frame list in an MI reply.
const STACK_MARKER: &str = ",stack=[";

/// One call site in a sampled backtrace.
///
/// Stack identity is the address sequence; function, file, and line are
/// display data only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Instruction address, zero when the debugger did not report one.
    pub address: u64,
    /// Function name, empty when unresolved.
    pub function: String,
    /// Source file, empty when unknown.
    pub file: String,
    /// Source line, -1 when unknown.
    pub line: i32,
}

/// The frames of one stopped thread, innermost first.
#[derive(Debug, Clone)]
pub struct ParsedStack {
    pub thread: String,
    pub frames: Vec<StackFrame>,
}

/// Parse the structured reply to `-stack-list-frames`.
///
/// Returns the frames innermost first. An empty `stack=[]` block parses to
/// an empty vector; a reply without the block, or with an unbalanced frame
/// record, is a parse failure the caller drops.
pub fn parse_stack_list(response: &str) -> Result<Vec<StackFrame>, ProfilerError> {
    let start = response
        .find(STACK_MARKER)
        .ok_or_else(|| ProfilerError::Parse("no stack= block in response".into()))?;
    let body = &response[start + STACK_MARKER.len()..];
    let end = body
        .find(']')
        .ok_or_else(|| ProfilerError::Parse("unterminated stack= block".into()))?;
    let body = &body[..end];

    if body.is_empty() {
        return Ok(Vec::new());
    }
    if !body.starts_with("frame=") {
        return Err(ProfilerError::Parse(
            "stack= block does not open with frame=".into(),
        ));
    }

    let mut frames = Vec::new();
    for record in body.split("frame=").skip(1) {
        frames.push(parse_frame_record(record)?);
    }
    Ok(frames)
}

/// Parse one `{key="value",...}` frame record. Unknown keys are ignored.
fn parse_frame_record(record: &str) -> Result<StackFrame, ProfilerError> {
    let open = record
        .find('{')
        .ok_or_else(|| ProfilerError::Parse(format!("frame record missing '{{': {record}")))?;
    let close = record[open..]
        .find('}')
        .ok_or_else(|| ProfilerError::Parse(format!("frame record missing '}}': {record}")))?;
    let body = &record[open + 1..open + close];

    let mut frame = StackFrame {
        address: 0,
        function: String::new(),
        file: String::new(),
        line: -1,
    };
    for field in body.split(',') {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        let value = unquote(value);
        match key {
            "addr" => frame.address = parse_hex_address(value).unwrap_or(0),
            "func" => frame.function = value.to_string(),
            "file" => frame.file = value.to_string(),
            "line" => frame.line = value.parse().unwrap_or(-1),
            _ => {}
        }
    }
    Ok(frame)
}

/// Strip a leading quotation mark and cut the value at the next one.
fn unquote(value: &str) -> &str {
    let value = value.strip_prefix('"').unwrap_or(value);
    match value.find('"') {
        Some(end) => &value[..end],
        None => value,
    }
}

fn parse_hex_address(text: &str) -> Option<u64> {
    let digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}

/// Interner for console backtrace lines.
///
/// The same syntactic frame line is the same logical frame regardless of
/// which thread produced it, so lines are keyed by their address-to-end
/// substring and mapped to dense, stable IDs with the parsed frames in a
/// parallel arena.
#[derive(Debug, Default)]
pub struct FrameInterner {
    ids: HashMap<String, u32>,
    frames: Vec<StackFrame>,
}

impl FrameInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct frame lines seen so far.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The frame interned under `id`.
    pub fn get(&self, id: u32) -> &StackFrame {
        &self.frames[id as usize]
    }

    /// Intern one `#N ...` backtrace line.
    ///
    /// Returns `None` for lines that do not carry an address and a
    /// function name; those are not frames.
    pub fn intern(&mut self, line: &str) -> Option<u32> {
        let addr_start = line.find(" 0x")? + 1;
        let key = &line[addr_start..];
        if let Some(&id) = self.ids.get(key) {
            return Some(id);
        }
        let frame = parse_console_frame(key)?;
        let id = self.frames.len() as u32;
        self.ids.insert(key.to_string(), id);
        self.frames.push(frame);
        Some(id)
    }
}

/// Parse the address-to-end substring of a console backtrace line:
/// `0xADDR in FUNC (...) at FILE:LINE` with the `(...)`/`at` tail parts
/// optional in either order. The function name ends at the earlier of
/// ` (...) ` and ` at `.
fn parse_console_frame(text: &str) -> Option<StackFrame> {
    let address = parse_hex_address(text.split_whitespace().next()?)?;

    let name_start = text.find(" in ")? + " in ".len();
    let tail = &text[name_start..];
    let name_end = match (tail.find(" (...) "), tail.find(" at ")) {
        (Some(p), Some(a)) => p.min(a),
        (Some(p), None) => p,
        (None, Some(a)) => a,
        (None, None) => return None,
    };
    let function = tail[..name_end].to_string();

    let (file, line) = match tail.find(" at ") {
        Some(at) => parse_location(&tail[at + " at ".len()..]),
        None => (String::new(), -1),
    };

    Some(StackFrame {
        address,
        function,
        file,
        line,
    })
}

/// Split a `FILE:LINE` location; the line number is optional.
fn parse_location(text: &str) -> (String, i32) {
    let text = text.trim_end();
    match text.rsplit_once(':') {
        Some((file, line)) => match line.parse() {
            Ok(line) => (file.to_string(), line),
            Err(_) => (text.to_string(), -1),
        },
        None => (text.to_string(), -1),
    }
}

/// Parse a console `backtrace` reply as a single stack for `thread`.
///
/// Lines that are not `#N` frame lines are skipped; frame lines the
/// interner rejects are skipped too. Returns `None` when nothing parsed.
pub fn parse_console_backtrace(
    interner: &mut FrameInterner,
    thread: &str,
    lines: &[&str],
) -> Option<ParsedStack> {
    let mut frames = Vec::new();
    for line in lines {
        if !line.starts_with('#') {
            continue;
        }
        if let Some(id) = interner.intern(line) {
            frames.push(interner.get(id).clone());
        }
    }
    if frames.is_empty() {
        None
    } else {
        Some(ParsedStack {
            thread: thread.to_string(),
            frames,
        })
    }
}

/// Split an all-threads backtrace reply into one stack per thread.
///
/// A line starting with `Thread ` opens a group; the `#N` lines after it
/// belong to that group until the first non-frame line. The thread name is
/// the `LWP <id>` portion of the header when present, else a synthetic
/// `thread-<ordinal>`.
pub fn parse_all_threads(interner: &mut FrameInterner, response: &str) -> Vec<ParsedStack> {
    let lines: Vec<&str> = response.lines().collect();
    let mut stacks = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if !lines[i].starts_with("Thread ") {
            i += 1;
            continue;
        }
        let header = lines[i];
        let mut j = i + 1;
        while j < lines.len() && lines[j].starts_with('#') {
            j += 1;
        }
        if j > i + 1 {
            let name = thread_name(header, stacks.len());
            if let Some(stack) = parse_console_backtrace(interner, &name, &lines[i + 1..j]) {
                stacks.push(stack);
            }
        }
        i = j.max(i + 1);
    }
    stacks
}

fn thread_name(header: &str, ordinal: usize) -> String {
    if let Some(start) = header.find("(LWP ") {
        if let Some(len) = header[start..].find(')') {
            return header[start + 1..start + len].to_string();
        }
    }
    format!("thread-{ordinal}")
}
