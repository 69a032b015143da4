use crate::coordination::FileVersion;

/// What a refresh changed about the conflict set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictChange {
    Unchanged,
    /// Versions appeared that were not known before.
    Detected { conflicts: usize },
    /// Every known conflict went away.
    Resolved,
}

/// Mirror of the coordination service's view of an item's versions.
///
/// The tracker never resolves anything on its own; it only follows what the
/// service reports after each coordinated access.
#[derive(Clone, Debug, Default)]
pub struct ConflictTracker {
    current: Option<FileVersion>,
    conflicts: Vec<FileVersion>,
}

impl ConflictTracker {
    pub fn refresh(&mut self, current: Option<FileVersion>, conflicts: Vec<FileVersion>) -> ConflictChange {
        let gained = conflicts
            .iter()
            .any(|v| !self.conflicts.iter().any(|known| known.id == v.id));
        let had_conflicts = !self.conflicts.is_empty();

        self.current = current;
        self.conflicts = conflicts;

        if gained {
            ConflictChange::Detected {
                conflicts: self.conflicts.len(),
            }
        } else if had_conflicts && self.conflicts.is_empty() {
            ConflictChange::Resolved
        } else {
            ConflictChange::Unchanged
        }
    }

    pub fn current(&self) -> Option<&FileVersion> {
        self.current.as_ref()
    }

    pub fn conflicts(&self) -> &[FileVersion] {
        &self.conflicts
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.conflicts.clear();
    }
}
