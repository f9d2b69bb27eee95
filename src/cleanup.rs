/// Ordered undo actions for sandbox resources
///
/// Every setup step that creates a kernel or filesystem resource pushes the
/// action that removes it. On failure, or at normal teardown, the stack is
/// unwound in reverse order. Undo failures are teardown warnings: they are
/// logged and never escalated.
use crate::types::Result;

struct UndoAction {
    label: String,
    action: Box<dyn FnOnce() -> Result<()>>,
}

/// Statistics about an unwind
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub completed: usize,
    pub failed: usize,
}

/// Stack of undo actions, unwound on drop unless committed
#[derive(Default)]
pub struct UndoStack {
    actions: Vec<UndoAction>,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the action that reverses a step that just succeeded
    pub fn push<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        let label = label.into();
        log::debug!("registered cleanup: {}", label);
        self.actions.push(UndoAction {
            label,
            action: Box::new(action),
        });
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every registered action, newest first
    pub fn unwind(&mut self) -> CleanupStats {
        let mut stats = CleanupStats::default();
        while let Some(undo) = self.actions.pop() {
            log::debug!("cleanup: {}", undo.label);
            match (undo.action)() {
                Ok(()) => stats.completed += 1,
                Err(e) => {
                    log::warn!("cleanup '{}' failed: {}", undo.label, e);
                    stats.failed += 1;
                }
            }
        }
        stats
    }

    /// Keep the resources: drop the actions without running them.
    /// Used once ownership of the resources moves elsewhere.
    pub fn commit(mut self) {
        self.actions.clear();
    }
}

impl Drop for UndoStack {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            self.unwind();
        }
    }
}
