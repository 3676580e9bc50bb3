use serde::{Deserialize, Serialize};
use std::fmt;

use crate::bail;
use crate::error::{ErrorKind, MirrorResult};

/// Lifecycle state of a mirror.
///
/// ```text
/// SETUP -> RUNNING <-> PAUSING <-> PAUSED <-> RESUMING <-> RUNNING
///                                    |  ^
///                                    v  |
///                                  EDITING -> RESUMING
///
/// any state except DROPPED -> DROPPING -> DROPPED
/// any state except DROPPING and DROPPED -> ERROR -> RESUMING
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MirrorState {
    /// The mirror record exists and its first run has not opened the connectors yet.
    Setup,
    /// The running loop applies batches.
    Running,
    /// A pause was requested and the loop is finishing its in-flight batch.
    Pausing,
    /// No loop is running. The only state in which configuration edits are accepted.
    Paused,
    /// The loop is being started with the current configuration.
    Resuming,
    /// A configuration edit is being validated and its added tables registered for snapshot.
    Editing,
    /// The mirror is being torn down.
    Dropping,
    /// The mirror was torn down.
    Dropped,
    /// An unrecovered failure stopped the mirror. Leaving it requires an explicit resume.
    Error,
}

impl MirrorState {
    /// Returns `true` if the mirror can move from `self` to `target`.
    pub fn can_transition_to(&self, target: MirrorState) -> bool {
        use MirrorState::*;

        match (self, target) {
            (Dropped, _) => false,
            (_, Dropping) => true,
            (Dropping, Dropped) => true,
            (Dropping, _) => false,
            (_, Error) => true,

            (Setup, Running) => true,
            (Running, Pausing) => true,
            (Pausing, Running | Paused) => true,
            (Paused, Resuming | Editing) => true,
            (Resuming, Running | Paused) => true,
            (Editing, Resuming | Paused) => true,
            (Error, Resuming) => true,

            _ => false,
        }
    }

    /// Checks that the mirror can move from `self` to `target`.
    ///
    /// Returns an [`ErrorKind::IllegalTransition`] error naming both states otherwise.
    pub fn check_transition(&self, target: MirrorState) -> MirrorResult<()> {
        if !self.can_transition_to(target) {
            bail!(
                ErrorKind::IllegalTransition,
                "Illegal mirror state transition",
                format!("The mirror cannot move from {self} to {target}")
            );
        }

        Ok(())
    }

    /// Returns `true` if configuration edits are accepted in this state.
    pub fn accepts_config_update(&self) -> bool {
        matches!(self, MirrorState::Paused)
    }

    /// Returns `true` if a running loop may exist for a mirror in this state.
    pub fn has_running_loop(&self) -> bool {
        matches!(
            self,
            MirrorState::Setup | MirrorState::Running | MirrorState::Pausing | MirrorState::Resuming
        )
    }

    pub fn as_static_str(&self) -> &'static str {
        match self {
            MirrorState::Setup => "SETUP",
            MirrorState::Running => "RUNNING",
            MirrorState::Pausing => "PAUSING",
            MirrorState::Paused => "PAUSED",
            MirrorState::Resuming => "RESUMING",
            MirrorState::Editing => "EDITING",
            MirrorState::Dropping => "DROPPING",
            MirrorState::Dropped => "DROPPED",
            MirrorState::Error => "ERROR",
        }
    }
}

impl fmt::Display for MirrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_static_str())
    }
}
