//! Ordered resource release.

use tracing::debug;

type Release = Box<dyn FnOnce() + Send>;

/// Release callbacks run most-recently-acquired first.
///
/// Every resource a container acquires during startup is registered here
/// at the moment it is acquired. [`ReleaseStack::drain`] runs the
/// callbacks in reverse order; dropping a non-empty stack drains it too,
/// so a startup that fails partway still releases what it took.
#[derive(Default)]
pub struct ReleaseStack {
    entries: Vec<(String, Release)>,
}

impl ReleaseStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a release callback.
    pub fn push(&mut self, label: impl Into<String>, release: impl FnOnce() + Send + 'static) {
        self.entries.push((label.into(), Box::new(release)));
    }

    /// Number of resources still held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Moves every entry of `other` on top of this stack, keeping order.
    pub fn absorb(&mut self, mut other: ReleaseStack) {
        self.entries.append(&mut other.entries);
    }

    /// Runs every callback, last pushed first.
    pub fn drain(&mut self) {
        while let Some((label, release)) = self.entries.pop() {
            debug!("Releasing {}", label);
            release();
        }
    }
}

impl Drop for ReleaseStack {
    fn drop(&mut self) {
        self.drain();
    }
}

impl std::fmt::Debug for ReleaseStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(label, _)| label))
            .finish()
    }
}
