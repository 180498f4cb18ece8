//! Domain primitive types used across the rtbench workspace.

use std::fmt;

use chrono::{DateTime, Utc};

/// Identifier of a benchmark container, unique within a supervisor namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the root filesystem snapshot backing this container.
    #[must_use]
    pub fn snapshot_key(&self) -> String {
        format!("{}-snapshot", self.0)
    }

    /// CNI attachment id of the container's default network.
    #[must_use]
    pub fn attachment_id(&self) -> String {
        format!("default-{}", self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a task as reported by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// The supervisor does not know the state.
    Unknown,
    /// Task created but its process not started.
    Created,
    /// Process is running.
    Running,
    /// Process has exited.
    Stopped,
    /// Process is frozen.
    Paused,
    /// Process is being frozen.
    Pausing,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Paused => write!(f, "paused"),
            Self::Pausing => write!(f, "pausing"),
        }
    }
}

/// Lifecycle phase of a managed container, as seen by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerState {
    /// Task start returned.
    Started,
    /// The task's exit was observed on its exit channel.
    Exited,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Termination result delivered once per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code of the task's init process.
    pub code: u32,
    /// When the process was reaped, if the supervisor reported it.
    pub exited_at: Option<DateTime<Utc>>,
}
