use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds of the pipeline, distinguished by recovery policy.
///
/// - `Shutdown`: sentinel returned by every public entry point once a
///   stage's closed flag is set. Nothing retries it.
/// - `Transient`: store or filesystem trouble; the owning scheduler
///   retries on its next tick (the merger poll backs off additively).
/// - `Entity`: one image or row failed; it is flagged and skipped, the
///   batch continues.
/// - `Config`: a proposed configuration was rejected; the previous
///   committed configuration stays in effect.
/// - `Invariant`: a programmer-invariant violation; logged at warning
///   level and the entity is disabled so the next pass cleans it up.
#[derive(Debug, Error)]
pub enum Error {
    #[error("shutdown")]
    Shutdown,

    #[error("transient: {0}")]
    Transient(String),

    #[error("entity {entity}: {reason}")]
    Entity { entity: String, reason: String },

    #[error("configuration: {0}")]
    Config(String),

    #[error("invariant: {0}")]
    Invariant(String),
}

impl Error {
    pub fn entity(entity: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Entity {
            entity: entity.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Transient(format!("db: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transient(format!("io: {err}"))
    }
}
