//! Collection of independent per-item failures.

use std::fmt;

/// Failures of a bulk operation whose items are attempted independently.
///
/// Each entry pairs the item (a job ID, a node name) with its error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MultiError<E> {
    failures: Vec<(String, E)>,
}

impl<E> Default for MultiError<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> MultiError<E> {
    /// Creates an empty collection.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            failures: Vec::new(),
        }
    }

    /// Records the failure of `item`.
    pub fn push(&mut self, item: impl Into<String>, error: E) {
        self.failures.push((item.into(), error));
    }

    /// Returns `true` when nothing failed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of failed items.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.failures.len()
    }

    /// Failed items and their errors, in the order they were recorded.
    #[must_use]
    pub fn failures(&self) -> &[(String, E)] {
        &self.failures
    }

    /// Converts into `Ok(())` when empty.
    ///
    /// # Errors
    ///
    /// Returns `self` when at least one failure was recorded.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl<E: fmt::Display> fmt::Display for MultiError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} operation(s) failed", self.failures.len())?;
        for (item, error) in &self.failures {
            write!(f, "\n  {item}: {error}")?;
        }
        Ok(())
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for MultiError<E> {}

impl<E> FromIterator<(String, E)> for MultiError<E> {
    fn from_iter<I: IntoIterator<Item = (String, E)>>(iter: I) -> Self {
        Self {
            failures: iter.into_iter().collect(),
        }
    }
}

impl<E> Extend<(String, E)> for MultiError<E> {
    fn extend<I: IntoIterator<Item = (String, E)>>(&mut self, iter: I) {
        self.failures.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn empty_collection_is_ok() {
        let errors: MultiError<String> = MultiError::new();
        assert!(errors.into_result().is_ok());
    }

    #[rstest]
    fn display_lists_every_failure() {
        let mut errors = MultiError::new();
        errors.push("job-a", String::from("timed out"));
        errors.push("job-b", String::from("rejected"));

        let rendered = errors.to_string();

        assert_eq!(errors.len(), 2);
        assert!(rendered.starts_with("2 operation(s) failed"));
        assert!(rendered.contains("job-a: timed out"));
        assert!(rendered.contains("job-b: rejected"));
    }
}
