//! Error types for the Keel state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
///
/// Table-level failures name the table so an operator can tell a corrupt
/// `tasks` record from an unreadable `pending_deploys` one.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open state store: {0}")]
    Open(String),

    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open table `{table}`: {reason}")]
    Table { table: String, reason: String },

    #[error("cannot read table `{table}`: {reason}")]
    Read { table: String, reason: String },

    #[error("cannot write table `{table}`: {reason}")]
    Write { table: String, reason: String },

    #[error("cannot encode record for table `{table}`: {reason}")]
    Serialize { table: String, reason: String },

    #[error("corrupt record in table `{table}`: {reason}")]
    Deserialize { table: String, reason: String },

    #[error("no record `{key}` in table `{table}`")]
    NotFound { table: String, key: String },
}

impl StateError {
    /// The table the failure happened in, when it is tied to one.
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::Open(_) | Self::Transaction(_) => None,
            Self::Table { table, .. }
            | Self::Read { table, .. }
            | Self::Write { table, .. }
            | Self::Serialize { table, .. }
            | Self::Deserialize { table, .. }
            | Self::NotFound { table, .. } => Some(table),
        }
    }
}
