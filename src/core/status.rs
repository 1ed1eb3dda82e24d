use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Lifecycle state of an entry in the persistence context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityStatus {
    /// Tracked and dirty-checked at flush
    Managed,
    /// Tracked but never dirty-checked
    ReadOnly,
    /// Scheduled for deletion
    Deleted,
    /// Deleted from the database during the current flush
    Gone,
    /// Instantiated, references still being resolved
    Loading,
    /// Persisted, but its insert waits on transient dependencies
    Saving,
}

impl EntityStatus {
    pub fn is_deleted_or_gone(self) -> bool {
        matches!(self, EntityStatus::Deleted | EntityStatus::Gone)
    }

    pub fn is_live(self) -> bool {
        matches!(
            self,
            EntityStatus::Managed | EntityStatus::ReadOnly | EntityStatus::Saving
        )
    }
}

/// When the session synchronises in-memory state with the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FlushMode {
    /// Before queries touching pending changes, and at commit
    #[default]
    Auto,
    /// Only at commit
    Commit,
    /// Before every query and at commit
    Always,
    /// Only when flush is called explicitly
    Manual,
}

impl FromStr for FlushMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(FlushMode::Auto),
            "commit" => Ok(FlushMode::Commit),
            "always" => Ok(FlushMode::Always),
            "manual" => Ok(FlushMode::Manual),
            other => Err(AppError::ConfigurationError(format!(
                "Unknown flush mode '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for FlushMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlushMode::Auto => "auto",
            FlushMode::Commit => "commit",
            FlushMode::Always => "always",
            FlushMode::Manual => "manual",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LockMode {
    #[default]
    None,
    /// Verify the version against the database immediately
    Read,
    /// Bump the version at the next flush even without changes
    OptimisticForceIncrement,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_mode_parsing() {
        assert_eq!("AUTO".parse::<FlushMode>().unwrap(), FlushMode::Auto);
        assert_eq!("manual".parse::<FlushMode>().unwrap(), FlushMode::Manual);
        assert!("sometimes".parse::<FlushMode>().is_err());
    }

    #[test]
    fn test_status_predicates() {
        assert!(EntityStatus::Gone.is_deleted_or_gone());
        assert!(EntityStatus::Saving.is_live());
        assert!(!EntityStatus::Loading.is_live());
    }
}
