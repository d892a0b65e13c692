//! Task identity and descriptive information.

use std::fmt;

/// Kernel task identifier.
///
/// The agent holds tasks by id only. A task that disappears is detected when
/// a kernel call on its id fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl fmt::LowerHex for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Scheduling state as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    #[default]
    Ready,
    Running,
    Blocked,
    Suspended,
    Dormant,
}

impl TaskState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Blocked => "BLOCKED",
            Self::Suspended => "SUSPENDED",
            Self::Dormant => "DORMANT",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task as seen by a single walk of the kernel's task table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub current_priority: u32,
    pub real_priority: u32,
    pub stack_size: usize,
    pub stack_area: u64,
    pub state: TaskState,
}

impl TaskInfo {
    pub fn new(id: TaskId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            current_priority: 0,
            real_priority: 0,
            stack_size: 0,
            stack_area: 0,
            state: TaskState::Ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_format() {
        let id = TaskId(0x0a01_0001);
        assert_eq!(id.to_string(), "0a010001");
        assert_eq!(format!("{id:x}"), "a010001");
    }

    #[test]
    fn test_state_names() {
        assert_eq!(TaskState::Suspended.to_string(), "SUSPENDED");
        assert_eq!(TaskState::default(), TaskState::Ready);
    }
}
