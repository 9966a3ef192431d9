use crate::graph::Target;

/// A chain of targets dispatched to one minion as a single unit.
///
/// Targets are dependency-ordered: entry 0 depends on no other entry
/// and must build first, entry 1 depends only on entry 0, and so on.
/// Keeping a dependency chain on one machine avoids a round trip per
/// target just to unlock its sole dependent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    targets: Vec<Target>,
}

impl WorkUnit {
    pub fn new(targets: Vec<Target>) -> Self {
        Self { targets }
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn into_targets(self) -> Vec<Target> {
        self.targets
    }
}
