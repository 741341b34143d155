//! Parser for the patch-text envelope.

use super::{FileOperation, Hunk, Patch, PatchError, PatchLine};

const BEGIN: &str = "*** Begin Patch";
const END: &str = "*** End Patch";
const ADD_FILE: &str = "*** Add File: ";
const DELETE_FILE: &str = "*** Delete File: ";
const UPDATE_FILE: &str = "*** Update File: ";
const MOVE_TO: &str = "*** Move to: ";
const HUNK_MARKER: &str = "@@";

// Parser position within the envelope.
enum State {
    // Inside an Add operation, collecting `+` lines.
    Add { path: String, lines: Vec<String> },
    // Inside an Update operation; `in_hunk` is false until the first `@@`.
    Update {
        path: String,
        move_to: Option<String>,
        hunks: Vec<Hunk>,
        in_hunk: bool,
    },
    // Between operations.
    Idle,
}

/// Parse patch text into an ordered [`Patch`].
///
/// Directive keywords are fixed strings and matched exactly. Anything that
/// looks like a directive but is not one of the known forms fails the parse;
/// no file is touched by a parse failure.
pub fn parse_patch(text: &str) -> Result<Patch, PatchError> {
    let mut lines = text.lines();

    // Leading blank lines are tolerated, the envelope itself is strict.
    loop {
        match lines.next() {
            Some(l) if l.trim().is_empty() => continue,
            Some(l) if l == BEGIN => break,
            _ => return Err(PatchError::MissingBegin),
        }
    }

    let mut operations = Vec::new();
    let mut state = State::Idle;
    let mut ended = false;

    for line in lines.by_ref() {
        if line == END {
            flush(&mut state, &mut operations);
            ended = true;
            break;
        }

        if let Some(rest) = line.strip_prefix(ADD_FILE) {
            flush(&mut state, &mut operations);
            state = State::Add {
                path: required_path(rest, "*** Add File:")?,
                lines: Vec::new(),
            };
            continue;
        }
        if let Some(rest) = line.strip_prefix(DELETE_FILE) {
            flush(&mut state, &mut operations);
            operations.push(FileOperation::Delete {
                path: required_path(rest, "*** Delete File:")?,
            });
            state = State::Idle;
            continue;
        }
        if let Some(rest) = line.strip_prefix(UPDATE_FILE) {
            flush(&mut state, &mut operations);
            state = State::Update {
                path: required_path(rest, "*** Update File:")?,
                move_to: None,
                hunks: Vec::new(),
                in_hunk: false,
            };
            continue;
        }
        if let Some(rest) = line.strip_prefix(MOVE_TO) {
            match &mut state {
                State::Update { move_to, .. } => {
                    *move_to = Some(required_path(rest, "*** Move to:")?);
                }
                _ => return Err(PatchError::OrphanMove),
            }
            continue;
        }
        if line.starts_with("***") {
            return Err(PatchError::UnknownDirective(line.to_string()));
        }

        match &mut state {
            State::Add { lines, .. } => {
                let Some(content) = line.strip_prefix('+') else {
                    return Err(PatchError::MalformedLine(line.to_string()));
                };
                lines.push(content.to_string());
            }
            State::Update { hunks, in_hunk, .. } => {
                if line.starts_with(HUNK_MARKER) {
                    // `@@` opens a hunk; any trailing header text is ignored.
                    hunks.push(Hunk::default());
                    *in_hunk = true;
                    continue;
                }
                match hunks.last_mut() {
                    Some(hunk) if *in_hunk => hunk.lines.push(parse_hunk_line(line)?),
                    _ => return Err(PatchError::LineOutsideHunk(line.to_string())),
                }
            }
            State::Idle => {
                if line.trim().is_empty() {
                    continue;
                }
                return Err(PatchError::LineOutsideHunk(line.to_string()));
            }
        }
    }

    if !ended {
        return Err(PatchError::MissingEnd);
    }
    Ok(Patch { operations })
}

fn required_path(rest: &str, directive: &'static str) -> Result<String, PatchError> {
    let path = rest.trim();
    if path.is_empty() {
        return Err(PatchError::MissingPath(directive));
    }
    Ok(path.to_string())
}

fn parse_hunk_line(line: &str) -> Result<PatchLine, PatchError> {
    if let Some(rest) = line.strip_prefix('+') {
        return Ok(PatchLine::Add(rest.to_string()));
    }
    if let Some(rest) = line.strip_prefix('-') {
        return Ok(PatchLine::Remove(rest.to_string()));
    }
    if let Some(rest) = line.strip_prefix(' ') {
        return Ok(PatchLine::Context(rest.to_string()));
    }
    // Editors routinely strip the single space from blank context lines.
    if line.is_empty() {
        return Ok(PatchLine::Context(String::new()));
    }
    Err(PatchError::MalformedLine(line.to_string()))
}

fn flush(state: &mut State, operations: &mut Vec<FileOperation>) {
    match std::mem::replace(state, State::Idle) {
        State::Add { path, lines } => operations.push(FileOperation::Add { path, lines }),
        State::Update {
            path,
            move_to,
            hunks,
            ..
        } => operations.push(FileOperation::Update {
            path,
            move_to,
            hunks,
        }),
        State::Idle => {}
    }
}
