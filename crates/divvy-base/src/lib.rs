use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Error = anyhow::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Upper bound on the serialized size of one work item. The master refuses
/// to hand off anything larger; a worker never reads more than this from one
/// connection.
pub const MAX_FRAME_SIZE: usize = 16384;

/// 1-based index of a slot in the worker pool. Stable for the lifetime of a
/// master run: the child process behind a slot may be re-created after a
/// crash, but the number is never reused for a different slot.
#[derive(Copy, Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct WorkerNum(pub u32);

impl fmt::Display for WorkerNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How a reaped worker ended.
#[derive(Copy, Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum WorkerStatus {
    Exited(u8),
    Signaled(u8),
}

impl WorkerStatus {
    pub fn is_clean(&self) -> bool {
        matches!(self, WorkerStatus::Exited(0))
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Exited(code) => write!(f, "exited with code {code}"),
            WorkerStatus::Signaled(signum) => write!(f, "killed by signal {signum}"),
        }
    }
}

/// One unit of work: a heterogeneous tuple of JSON-serializable values,
/// produced by a task's dispatch generator and consumed by `perform` in
/// exactly one worker.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct WorkItem(pub Vec<serde_json::Value>);

impl WorkItem {
    /// Serialize for the wire. One frame is one connection: the master
    /// writes the frame in full and closes, and the close marks end-of-item.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let frame = serde_json::to_vec(self)?;
        if frame.len() > MAX_FRAME_SIZE {
            bail!(
                "work item serializes to {} bytes, over the {MAX_FRAME_SIZE}-byte frame limit",
                frame.len()
            );
        }
        Ok(frame)
    }

    /// Decode one frame. An empty frame is end-of-stream, not an item: the
    /// master hung up without writing.
    pub fn from_frame(frame: &[u8]) -> Result<Option<Self>> {
        if frame.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(frame)?))
    }

    /// Render each field as a plain string: strings unquoted, everything
    /// else in its JSON form.
    pub fn field_strings(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|value| match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()
    }
}

#[macro_export]
macro_rules! wnum {
    [$n:expr] => { $crate::WorkerNum($n) };
}

#[macro_export]
macro_rules! item {
    [$($v:expr),* $(,)?] => {
        $crate::WorkItem(vec![$(::serde_json::json!($v)),*])
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let item = item![7, "seven", true];
        let frame = item.to_frame().unwrap();
        assert_eq!(WorkItem::from_frame(&frame).unwrap(), Some(item));
    }

    #[test]
    fn frame_at_limit_accepted() {
        // ["aaa...a"] serializes to the string plus 4 bytes of punctuation.
        let item = item!["a".repeat(MAX_FRAME_SIZE - 4)];
        let frame = item.to_frame().unwrap();
        assert_eq!(frame.len(), MAX_FRAME_SIZE);
        assert_eq!(WorkItem::from_frame(&frame).unwrap(), Some(item));
    }

    #[test]
    fn frame_over_limit_rejected() {
        let item = item!["a".repeat(MAX_FRAME_SIZE - 3)];
        let message = format!("{}", item.to_frame().unwrap_err());
        assert_eq!(
            message,
            format!(
                "work item serializes to {} bytes, over the {MAX_FRAME_SIZE}-byte frame limit",
                MAX_FRAME_SIZE + 1
            )
        );
    }

    #[test]
    fn empty_frame_is_end_of_stream() {
        assert_eq!(WorkItem::from_frame(b"").unwrap(), None);
    }

    #[test]
    fn malformed_frame_is_an_error() {
        assert!(WorkItem::from_frame(b"[1, 2").is_err());
        assert!(WorkItem::from_frame(b"{\"not\": \"a tuple\"}").is_err());
    }

    #[test]
    fn field_strings() {
        assert_eq!(
            item![3, "b", true, [1, 2]].field_strings(),
            vec!["3", "b", "true", "[1,2]"]
        );
    }

    #[test]
    fn worker_status_display() {
        assert_eq!(WorkerStatus::Exited(7).to_string(), "exited with code 7");
        assert_eq!(WorkerStatus::Signaled(9).to_string(), "killed by signal 9");
        assert!(WorkerStatus::Exited(0).is_clean());
        assert!(!WorkerStatus::Exited(1).is_clean());
        assert!(!WorkerStatus::Signaled(15).is_clean());
    }
}
