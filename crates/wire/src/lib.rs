//! RoomAgent Wire
//!
//! Fixed-width binary records exchanged between the host and sandboxed agents.
//!
//! Data Buffer layout (all integers little-endian):
//!
//! ```text
//! [task_count: u32][member_count: u32]
//! task_count   x [id: 36 bytes, NUL padded][blocked: u8]
//! member_count x [key: 36 bytes, NUL padded][load: u32][last_active: u32]
//! ```
//!
//! Assignment record: `[task_id: 36 bytes][member_key: 36 bytes]`.

pub mod policy;

use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Layout revision shared by host and guest. Bumped on any offset change.
pub const WIRE_VERSION: u8 = 1;

/// Width of every identifier slot.
pub const ID_SLOT_LEN: usize = 36;
/// `task_count` + `member_count`.
pub const HEADER_LEN: usize = 8;
pub const TASK_RECORD_LEN: usize = ID_SLOT_LEN + 1;
pub const MEMBER_RECORD_LEN: usize = ID_SLOT_LEN + 4 + 4;
pub const ASSIGNMENT_RECORD_LEN: usize = ID_SLOT_LEN * 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("{field} identifier is {len} bytes, slot holds {max}")]
    IdentifierTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("{field} identifier contains a NUL byte")]
    EmbeddedNul { field: &'static str },
    #[error("too many {field} records: {count}")]
    TooManyRecords { field: &'static str, count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("buffer too short: {len} < {min}")]
    TooShort { len: usize, min: usize },
    #[error("buffer length {actual} does not match header (expected {expected})")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("identifier is not valid UTF-8")]
    InvalidUtf8,
}

/// One task as seen by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub blocked: bool,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, blocked: bool) -> Self {
        Self {
            id: id.into(),
            blocked,
        }
    }
}

/// One room member as seen by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub key: String,
    pub load: u32,
    /// Seconds since the unix epoch.
    pub last_active: u32,
}

impl MemberRecord {
    pub fn new(key: impl Into<String>, load: u32, last_active: u32) -> Self {
        Self {
            key: key.into(),
            load,
            last_active,
        }
    }
}

/// A (task, assignee) pair emitted by an agent. Identifiers are unpadded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssignmentEvent {
    pub task_id: String,
    pub member_key: String,
}

impl AssignmentEvent {
    pub fn new(task_id: impl Into<String>, member_key: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            member_key: member_key.into(),
        }
    }
}

/// Decoded contents of a Data Buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBuffer {
    pub tasks: Vec<TaskRecord>,
    pub members: Vec<MemberRecord>,
}

/// Record counts and derived byte ranges of a Data Buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub task_count: usize,
    pub member_count: usize,
}

impl BufferLayout {
    pub fn new(task_count: usize, member_count: usize) -> Self {
        Self {
            task_count,
            member_count,
        }
    }

    /// Read the header and check the total length against it.
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::TooShort {
                len: bytes.len(),
                min: HEADER_LEN,
            });
        }
        let task_count = read_u32(bytes, 0) as usize;
        let member_count = read_u32(bytes, 4) as usize;
        let layout = Self::new(task_count, member_count);
        let expected = layout.total_len();
        if expected != Some(bytes.len()) {
            return Err(DecodeError::LengthMismatch {
                expected: expected.unwrap_or(usize::MAX),
                actual: bytes.len(),
            });
        }
        Ok(layout)
    }

    /// `8 + 37 * tasks + 44 * members`, or `None` on overflow.
    pub fn total_len(&self) -> Option<usize> {
        let tasks = self.task_count.checked_mul(TASK_RECORD_LEN)?;
        let members = self.member_count.checked_mul(MEMBER_RECORD_LEN)?;
        HEADER_LEN.checked_add(tasks)?.checked_add(members)
    }

    pub fn task_region(&self) -> Range<usize> {
        HEADER_LEN..HEADER_LEN + self.task_count * TASK_RECORD_LEN
    }

    /// Member records begin immediately after the last task record.
    pub fn member_region(&self) -> Range<usize> {
        let start = self.task_region().end;
        start..start + self.member_count * MEMBER_RECORD_LEN
    }
}

/// Encode tasks and members into a Data Buffer.
///
/// Oversized identifiers are rejected, never truncated.
pub fn encode_buffer(
    tasks: &[TaskRecord],
    members: &[MemberRecord],
) -> Result<Vec<u8>, EncodingError> {
    let task_count = count_u32("task", tasks.len())?;
    let member_count = count_u32("member", members.len())?;

    for task in tasks {
        check_identifier("task", &task.id)?;
    }
    for member in members {
        check_identifier("member", &member.key)?;
    }

    let layout = BufferLayout::new(tasks.len(), members.len());
    let total = layout.total_len().ok_or(EncodingError::TooManyRecords {
        field: "task",
        count: tasks.len(),
    })?;

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&task_count.to_le_bytes());
    buf.extend_from_slice(&member_count.to_le_bytes());
    for task in tasks {
        write_slot(&mut buf, &task.id);
        buf.push(u8::from(task.blocked));
    }
    for member in members {
        write_slot(&mut buf, &member.key);
        buf.extend_from_slice(&member.load.to_le_bytes());
        buf.extend_from_slice(&member.last_active.to_le_bytes());
    }
    debug_assert_eq!(buf.len(), total);
    Ok(buf)
}

/// Decode a complete Data Buffer.
pub fn decode_buffer(bytes: &[u8]) -> Result<DataBuffer, DecodeError> {
    let layout = BufferLayout::parse(bytes)?;

    let tasks = bytes[layout.task_region()]
        .chunks_exact(TASK_RECORD_LEN)
        .map(|record| {
            Ok(TaskRecord {
                id: decode_identifier(&record[..ID_SLOT_LEN])?,
                blocked: record[ID_SLOT_LEN] != 0,
            })
        })
        .collect::<Result<Vec<_>, DecodeError>>()?;

    let members = bytes[layout.member_region()]
        .chunks_exact(MEMBER_RECORD_LEN)
        .map(|record| {
            Ok(MemberRecord {
                key: decode_identifier(&record[..ID_SLOT_LEN])?,
                load: read_u32(record, ID_SLOT_LEN),
                last_active: read_u32(record, ID_SLOT_LEN + 4),
            })
        })
        .collect::<Result<Vec<_>, DecodeError>>()?;

    Ok(DataBuffer { tasks, members })
}

/// Encode an assignment into its 72-byte record.
pub fn encode_assignment(
    event: &AssignmentEvent,
) -> Result<[u8; ASSIGNMENT_RECORD_LEN], EncodingError> {
    check_identifier("task", &event.task_id)?;
    check_identifier("member", &event.member_key)?;
    let mut record = [0u8; ASSIGNMENT_RECORD_LEN];
    record[..event.task_id.len()].copy_from_slice(event.task_id.as_bytes());
    record[ID_SLOT_LEN..ID_SLOT_LEN + event.member_key.len()]
        .copy_from_slice(event.member_key.as_bytes());
    Ok(record)
}

/// Decode a 72-byte assignment record into `(task_id, member_key)`.
pub fn decode_assignment(bytes: &[u8]) -> Result<AssignmentEvent, DecodeError> {
    if bytes.len() != ASSIGNMENT_RECORD_LEN {
        return Err(DecodeError::LengthMismatch {
            expected: ASSIGNMENT_RECORD_LEN,
            actual: bytes.len(),
        });
    }
    Ok(AssignmentEvent {
        task_id: decode_identifier(&bytes[..ID_SLOT_LEN])?,
        member_key: decode_identifier(&bytes[ID_SLOT_LEN..])?,
    })
}

/// Logical string of an identifier slot: everything before the first NUL,
/// or the whole slot if it has none.
pub fn decode_identifier(slot: &[u8]) -> Result<String, DecodeError> {
    let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
    std::str::from_utf8(&slot[..end])
        .map(str::to_owned)
        .map_err(|_| DecodeError::InvalidUtf8)
}

/// Validate that an identifier fits a slot and survives a round trip.
pub fn check_identifier(field: &'static str, id: &str) -> Result<(), EncodingError> {
    if id.len() > ID_SLOT_LEN {
        return Err(EncodingError::IdentifierTooLong {
            field,
            len: id.len(),
            max: ID_SLOT_LEN,
        });
    }
    if id.as_bytes().contains(&0) {
        return Err(EncodingError::EmbeddedNul { field });
    }
    Ok(())
}

fn count_u32(field: &'static str, count: usize) -> Result<u32, EncodingError> {
    u32::try_from(count).map_err(|_| EncodingError::TooManyRecords { field, count })
}

fn write_slot(buf: &mut Vec<u8>, id: &str) {
    let mut slot = [0u8; ID_SLOT_LEN];
    slot[..id.len()].copy_from_slice(id.as_bytes());
    buf.extend_from_slice(&slot);
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}
