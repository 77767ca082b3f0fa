//! Priority levels and the fixed task-category enumeration.
//!
//! A [`Priority`] is an integer urgency tag in `[1, MAX_LEVELS]`; lower value
//! means executed sooner. The pool core consumes only `Priority` — the
//! [`TaskCategory`] enumeration is the external mapping layer that callers go
//! through when they classify work rather than pick a raw level.

use thiserror::Error;

/// Number of distinct priority levels. Levels are `1..=MAX_LEVELS`.
pub const MAX_LEVELS: usize = 10;

/// Validated priority level. Lower value = more urgent.
///
/// Immutable after creation; ordering of `Priority` values matches urgency
/// ordering (`Priority::MOST_URGENT < Priority::LOWEST`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    /// Level 1, dispatched before everything else.
    pub const MOST_URGENT: Priority = Priority(1);
    /// Level `MAX_LEVELS`, dispatched after everything else.
    pub const LOWEST: Priority = Priority(MAX_LEVELS as u8);

    /// Creates a priority from a raw level.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPriority`] if `level` is outside `1..=MAX_LEVELS`.
    pub fn new(level: u8) -> Result<Self, InvalidPriority> {
        if level == 0 || level as usize > MAX_LEVELS {
            return Err(InvalidPriority(level));
        }
        Ok(Priority(level))
    }

    /// The raw level, in `1..=MAX_LEVELS`.
    #[inline]
    pub fn level(self) -> u8 {
        self.0
    }

    /// Zero-based index for per-level arrays (`level - 1`).
    #[inline]
    pub(crate) fn index(self) -> usize {
        (self.0 - 1) as usize
    }

    /// Internal constructor for indices produced by scanning per-level arrays.
    #[inline]
    pub(crate) fn from_index(index: usize) -> Self {
        debug_assert!(index < MAX_LEVELS);
        Priority(index as u8 + 1)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rejected priority level outside the valid range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("priority level {0} outside valid range 1..={MAX_LEVELS}")]
pub struct InvalidPriority(pub u8);

/// Fixed classification of submitted work.
///
/// The category-to-level mapping is fixed: I/O-bound work preempts
/// compute-bound work, which preempts unclassified work. [`Other`] is the
/// default for submissions that do not classify themselves.
///
/// [`Other`]: TaskCategory::Other
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum TaskCategory {
    Io,
    Computational,
    #[default]
    Other,
}

impl TaskCategory {
    /// The priority level this category maps to.
    pub fn priority(self) -> Priority {
        match self {
            TaskCategory::Io => Priority(1),
            TaskCategory::Computational => Priority(2),
            TaskCategory::Other => Priority(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_full_range() {
        for level in 1..=MAX_LEVELS as u8 {
            assert_eq!(Priority::new(level).unwrap().level(), level);
        }
    }

    #[test]
    fn rejects_out_of_range() {
        assert_eq!(Priority::new(0), Err(InvalidPriority(0)));
        assert_eq!(
            Priority::new(MAX_LEVELS as u8 + 1),
            Err(InvalidPriority(MAX_LEVELS as u8 + 1))
        );
    }

    #[test]
    fn ordering_matches_urgency() {
        assert!(Priority::MOST_URGENT < Priority::LOWEST);
        assert!(Priority::new(2).unwrap() < Priority::new(7).unwrap());
    }

    #[test]
    fn category_mapping_is_fixed() {
        assert_eq!(TaskCategory::Io.priority().level(), 1);
        assert_eq!(TaskCategory::Computational.priority().level(), 2);
        assert_eq!(TaskCategory::Other.priority().level(), 3);
        assert_eq!(TaskCategory::default(), TaskCategory::Other);
    }

    #[test]
    fn index_roundtrip() {
        for level in 1..=MAX_LEVELS as u8 {
            let p = Priority::new(level).unwrap();
            assert_eq!(Priority::from_index(p.index()), p);
        }
    }
}
