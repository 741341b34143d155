//! The `apply_patch` text format: parser and execution engine.
//!
//! A patch is a line-oriented envelope:
//!
//! ```text
//! *** Begin Patch
//! *** Update File: src/lib.rs
//! @@
//!  fn main() {
//! -    old();
//! +    new();
//!  }
//! *** End Patch
//! ```
//!
//! Operations execute in document order. Each file is edited in memory and
//! written only after all of its hunks matched; a failing operation stops
//! the patch but does not roll back files already written.

mod apply;
mod parser;

pub use apply::{FileStore, LocalFileStore, PatchEngine};
pub use parser::parse_patch;

/// One line inside a hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// A contiguous block of context/add/remove lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hunk {
    pub lines: Vec<PatchLine>,
}

/// A single file operation. Paths are project-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOperation {
    Add {
        path: String,
        lines: Vec<String>,
    },
    Delete {
        path: String,
    },
    Update {
        path: String,
        move_to: Option<String>,
        hunks: Vec<Hunk>,
    },
}

impl FileOperation {
    pub fn path(&self) -> &str {
        match self {
            FileOperation::Add { path, .. }
            | FileOperation::Delete { path }
            | FileOperation::Update { path, .. } => path,
        }
    }
}

/// An ordered patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    pub operations: Vec<FileOperation>,
}

/// Parse or execution failure.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("patch must start with '*** Begin Patch'")]
    MissingBegin,

    #[error("patch is missing '*** End Patch'")]
    MissingEnd,

    #[error("unknown patch directive: '{0}'")]
    UnknownDirective(String),

    #[error("missing file path after '{0}'")]
    MissingPath(&'static str),

    #[error("'*** Move to:' is only valid inside an update operation")]
    OrphanMove,

    #[error("patch line outside of a hunk: '{0}'")]
    LineOutsideHunk(String),

    #[error("malformed patch line: '{0}'")]
    MalformedLine(String),

    #[error("{path}: hunk does not match file content near '{line}'")]
    HunkMismatch { path: String, line: String },

    #[error("reading {path}: {message}")]
    Read { path: String, message: String },

    #[error("writing {path}: {message}")]
    Write { path: String, message: String },

    #[error("{op} {path}: {message}")]
    FileSystem {
        op: &'static str,
        path: String,
        message: String,
    },
}
