//! Lifecycle transition table.
//!
//! ```text
//!              init             start
//!  DISABLED ─────────▶ INITIALIZED ─────────────┐
//!     ▲                   │ enable              ▼
//!     │ deinit            ▼          start   RUNNING
//!     │ (any)          ENABLED ────────────▶   │
//!     │                   │ stop/disable        │ stop/disable
//!     │                   ▼                     ▼
//!     └───────────────  STOPPED ◀───────────────┘
//!                         │ start / enable
//!                         └──────▶ RUNNING / ENABLED
//!
//!  any failing call ──▶ ERROR   (only deinit leaves it)
//! ```
//!
//! `reconfigure` is accepted in STOPPED and DISABLED and never changes the
//! state on success.

use core::fmt;

use super::ModuleStatus;

/// A lifecycle operation the orchestrator can apply to a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleOp {
    Init,
    Start,
    Stop,
    Enable,
    Disable,
    Reconfigure,
    Deinit,
}

impl LifecycleOp {
    pub const ALL: [Self; 7] = [
        Self::Init,
        Self::Start,
        Self::Stop,
        Self::Enable,
        Self::Disable,
        Self::Reconfigure,
        Self::Deinit,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Reconfigure => "reconfigure",
            Self::Deinit => "deinit",
        }
    }

    /// Whether the operation may be invoked while the module is in `from`.
    pub const fn permits(self, from: ModuleStatus) -> bool {
        use ModuleStatus as S;
        match self {
            Self::Init => matches!(from, S::Disabled),
            Self::Start => matches!(from, S::Initialized | S::Stopped | S::Enabled),
            Self::Enable => matches!(from, S::Initialized | S::Stopped),
            Self::Stop | Self::Disable => matches!(from, S::Running | S::Enabled),
            Self::Reconfigure => matches!(from, S::Stopped | S::Disabled),
            Self::Deinit => true,
        }
    }

    /// State after the operation succeeds from `from`.
    pub const fn target(self, from: ModuleStatus) -> ModuleStatus {
        match self {
            Self::Init => ModuleStatus::Initialized,
            Self::Start => ModuleStatus::Running,
            Self::Enable => ModuleStatus::Enabled,
            Self::Stop | Self::Disable => ModuleStatus::Stopped,
            Self::Reconfigure => from,
            Self::Deinit => ModuleStatus::Disabled,
        }
    }
}

impl fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether `to` is reachable from `from` in one step (including the
/// failure edge into ERROR).
pub fn is_valid_step(from: ModuleStatus, to: ModuleStatus) -> bool {
    if to == ModuleStatus::Error {
        return from != ModuleStatus::Unknown;
    }
    LifecycleOp::ALL
        .iter()
        .any(|op| op.permits(from) && op.target(from) == to)
}
