// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parsing of `zfs diff -FHt` output into [InodeChange] records.
//!
//! Each row has the shape `timestamp, change, type, path[, extra]`, where
//! `extra` is the new path of a rename or the link count delta of a
//! modification. The timestamp is not kept.

mod escape;

pub use escape::{decode_escaped_path, DecodeError};

use crate::host::ExecutionError;
use std::fmt;

/// The kind of filesystem object reported by `zfs diff -F`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InodeType {
    BlockDevice,
    CharacterDevice,
    Directory,
    Door,
    NamedPipe,
    SymbolicLink,
    EventPort,
    Socket,
    File,
}

impl InodeType {
    fn from_token(token: &str) -> Option<Self> {
        use InodeType::*;
        Some(match token {
            "B" => BlockDevice,
            "C" => CharacterDevice,
            "/" => Directory,
            ">" => Door,
            "|" => NamedPipe,
            "@" => SymbolicLink,
            "P" => EventPort,
            "=" => Socket,
            "F" => File,
            _ => return None,
        })
    }
}

/// How an object changed between the two sides of the diff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Removed,
    Created,
    Modified,
    Renamed,
}

impl ChangeType {
    fn from_token(token: &str) -> Option<Self> {
        use ChangeType::*;
        Some(match token {
            "-" => Removed,
            "+" => Created,
            "M" => Modified,
            "R" => Renamed,
            _ => return None,
        })
    }

    /// Accepted field counts, including the leading timestamp.
    fn field_counts(&self) -> &'static [usize] {
        match self {
            ChangeType::Removed | ChangeType::Created => &[4],
            ChangeType::Modified => &[4, 5],
            ChangeType::Renamed => &[5],
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeType::Removed => "removed",
            ChangeType::Created => "created",
            ChangeType::Modified => "modified",
            ChangeType::Renamed => "renamed",
        };
        write!(f, "{s}")
    }
}

/// A single change to a filesystem object, as reported by `zfs diff`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InodeChange {
    path: String,
    new_path: Option<String>,
    inode_type: InodeType,
    change: ChangeType,
    reference_count_change: i64,
}

impl InodeChange {
    /// The affected path; for renames, the path before the rename.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The destination of a rename. `None` for every other change.
    pub fn new_path(&self) -> Option<&str> {
        self.new_path.as_deref()
    }

    pub fn inode_type(&self) -> InodeType {
        self.inode_type
    }

    pub fn change(&self) -> ChangeType {
        self.change
    }

    /// Change in hard link count. Zero unless the tool reported one.
    pub fn reference_count_change(&self) -> i64 {
        self.reference_count_change
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DiffError {
    #[error("zfs diff execution error: {0}")]
    ExternalCommandFailed(#[from] ExecutionError),

    #[error(
        "Malformed diff row {row} ({content:?}): expected {expected} fields, \
         found {found}"
    )]
    MalformedRow {
        row: usize,
        content: String,
        expected: String,
        found: usize,
    },

    #[error("Unknown change kind '{token}' in diff row {row} ({content:?})")]
    UnknownChangeKind { row: usize, content: String, token: String },

    #[error("Unknown object type '{token}' in diff row {row} ({content:?})")]
    UnknownObjectType { row: usize, content: String, token: String },

    #[error("Invalid {field} in diff row {row} ({content:?}): {err}")]
    InvalidPath {
        row: usize,
        content: String,
        field: &'static str,
        #[source]
        err: DecodeError,
    },

    #[error(
        "Invalid reference count change '{value}' in diff row {row} \
         ({content:?})"
    )]
    InvalidReferenceCount { row: usize, content: String, value: String },
}

/// Parses every row of `zfs diff -FHt` output, in order.
///
/// The first row which fails to parse aborts the whole parse; no partial
/// result is returned alongside an error.
pub fn parse_inode_changes<R, S>(
    rows: &[R],
) -> Result<Vec<InodeChange>, DiffError>
where
    R: AsRef<[S]>,
    S: AsRef<str>,
{
    rows.iter()
        .enumerate()
        .map(|(index, row)| parse_inode_change(index, row.as_ref()))
        .collect()
}

fn parse_inode_change<S: AsRef<str>>(
    index: usize,
    row: &[S],
) -> Result<InodeChange, DiffError> {
    let content = || {
        row.iter().map(|field| field.as_ref()).collect::<Vec<_>>().join("\t")
    };
    let field = |i: usize| row[i].as_ref();

    // Everything past the timestamp is needed to identify the layout.
    if row.len() < 2 {
        return Err(DiffError::MalformedRow {
            row: index,
            content: content(),
            expected: "at least 4".to_string(),
            found: row.len(),
        });
    }

    let change = ChangeType::from_token(field(1)).ok_or_else(|| {
        DiffError::UnknownChangeKind {
            row: index,
            content: content(),
            token: field(1).to_string(),
        }
    })?;

    let counts = change.field_counts();
    if !counts.contains(&row.len()) {
        let expected = counts
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(" or ");
        return Err(DiffError::MalformedRow {
            row: index,
            content: content(),
            expected,
            found: row.len(),
        });
    }

    let inode_type = InodeType::from_token(field(2)).ok_or_else(|| {
        DiffError::UnknownObjectType {
            row: index,
            content: content(),
            token: field(2).to_string(),
        }
    })?;

    let decode = |i: usize, name: &'static str| {
        decode_escaped_path(field(i)).map_err(|err| DiffError::InvalidPath {
            row: index,
            content: content(),
            field: name,
            err,
        })
    };

    let path = decode(3, "path")?;
    let mut new_path = None;
    let mut reference_count_change = 0;
    match change {
        ChangeType::Renamed => new_path = Some(decode(4, "new path")?),
        ChangeType::Modified if row.len() == 5 => {
            reference_count_change = parse_reference_count(field(4))
                .ok_or_else(|| DiffError::InvalidReferenceCount {
                    row: index,
                    content: content(),
                    value: field(4).to_string(),
                })?;
        }
        _ => (),
    }

    Ok(InodeChange {
        path,
        new_path,
        inode_type,
        change,
        reference_count_change,
    })
}

/// Parses a signed link count delta such as `+1` or `-2`.
///
/// The tool prints the delta in parentheses, e.g. `(+1)`; those are
/// accepted too. The sign is mandatory.
fn parse_reference_count(field: &str) -> Option<i64> {
    let value = field
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .unwrap_or(field);
    let digits = value.strip_prefix(['+', '-'])?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse::<i64>().ok()
}
