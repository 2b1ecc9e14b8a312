//! Log-noise suppression for repeated failures.

/// Number of consecutive identical failures logged at WARN before downgrading to DEBUG.
pub(crate) const MAX_CONSECUTIVE_SAME_ERROR: u32 = 3;

/// Tracks consecutive occurrences of the same failure category.
///
/// The first `max_consecutive` occurrences of a category report `true` from
/// [`ErrorTracker::record_error`] (log at WARN); later ones report `false` (log at DEBUG).
/// A different category restarts the count.
#[derive(Debug)]
pub(crate) struct ErrorTracker<K> {
    last_error_kind: Option<K>,
    consecutive_same_error: u32,
    max_consecutive: u32,
}

impl<K: Copy + Eq> ErrorTracker<K> {
    pub(crate) const fn new(max_consecutive: u32) -> Self {
        Self {
            last_error_kind: None,
            consecutive_same_error: 0,
            max_consecutive,
        }
    }

    pub(crate) fn record_error(&mut self, kind: K) -> bool {
        let same = self.last_error_kind == Some(kind);
        let should_warn = !same || self.consecutive_same_error < self.max_consecutive;

        if same {
            self.consecutive_same_error = self.consecutive_same_error.saturating_add(1);
        } else {
            self.consecutive_same_error = 1;
            self.last_error_kind = Some(kind);
        }

        should_warn
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive_same_error = 0;
        self.last_error_kind = None;
    }

    #[cfg(test)]
    pub(crate) const fn consecutive_count(&self) -> u32 {
        self.consecutive_same_error
    }
}
