use std::fmt;

/// Coarse classification shared by every error type in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Validation,
    Config,
    Auth,
    Transport,
    Timeout,
    Cancelled,
    Internal,
    Disposed,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::Validation => "validation",
            ErrorKind::Config => "configuration",
            ErrorKind::Auth => "authorization",
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
            ErrorKind::Disposed => "disposed",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Accumulates independent failures, e.g. one per validated field or one
/// per attempted key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompoundError {
    errors: Vec<String>,
}

impl CompoundError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: impl fmt::Display) {
        self.errors.push(err.to_string());
    }

    pub fn size(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// `Ok(())` when nothing was accumulated.
    pub fn into_result(self) -> Result<(), CompoundError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for CompoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "1 error occurred:\n\t* {}", self.errors[0]),
            n => {
                write!(f, "{} errors occurred:", n)?;
                for e in &self.errors {
                    write!(f, "\n\t* {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for CompoundError {}

impl<E: fmt::Display> FromIterator<E> for CompoundError {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        Self {
            errors: iter.into_iter().map(|e| e.to_string()).collect(),
        }
    }
}
