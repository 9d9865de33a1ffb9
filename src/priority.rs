//! Logical priority tiers and their execution priorities
//!
//! Callers pick a [`PriorityClass`]; the dispatcher only ever sees the
//! [`ExecutionPriority`] it maps to. The mapping is a table, so a new tier is a
//! single entry in [`PRIORITY_TABLE`].

use std::fmt;

/// Priority tier requested by a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PriorityClass {
    /// Run wherever the default work runs
    Inherit,
    /// Ordinary work with no special urgency
    #[default]
    Default,
    /// Work nobody is waiting on
    Background,
    /// Background work that should not starve
    HighBackground,
    /// Background work that may wait indefinitely
    LowBackground,
    /// Work a user is actively waiting on
    Interactive,
}

/// Execution priority of a backing context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExecutionPriority {
    /// Lowest execution priority
    Background,
    /// Default execution priority
    Medium,
    /// Elevated execution priority
    High,
    /// Highest execution priority
    UserInitiated,
}

/// Total mapping from tier to execution priority
pub const PRIORITY_TABLE: &[(PriorityClass, ExecutionPriority)] = &[
    (PriorityClass::Inherit, ExecutionPriority::Medium),
    (PriorityClass::Default, ExecutionPriority::Medium),
    (PriorityClass::Background, ExecutionPriority::Background),
    (PriorityClass::HighBackground, ExecutionPriority::High),
    (PriorityClass::LowBackground, ExecutionPriority::Background),
    (PriorityClass::Interactive, ExecutionPriority::UserInitiated),
];

impl PriorityClass {
    /// Every tier, in declaration order
    pub const ALL: [Self; 6] = [
        Self::Inherit,
        Self::Default,
        Self::Background,
        Self::HighBackground,
        Self::LowBackground,
        Self::Interactive,
    ];

    /// Execution priority this tier runs at
    #[must_use]
    pub fn execution_priority(self) -> ExecutionPriority {
        PRIORITY_TABLE
            .iter()
            .find(|(class, _)| *class == self)
            .map_or(ExecutionPriority::Medium, |(_, priority)| *priority)
    }
}

impl From<PriorityClass> for ExecutionPriority {
    fn from(class: PriorityClass) -> Self {
        class.execution_priority()
    }
}

impl ExecutionPriority {
    /// Every execution priority, lowest first
    pub const ALL: [Self; 4] = [
        Self::Background,
        Self::Medium,
        Self::High,
        Self::UserInitiated,
    ];

    /// Short name used in thread names and log fields
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Background => "background",
            Self::Medium => "medium",
            Self::High => "high",
            Self::UserInitiated => "user-initiated",
        }
    }
}

impl fmt::Display for ExecutionPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
