//! Error taxonomy for the keel runtime.
//!
//! Every failure mode is a distinct [`CoreError`] variant so callers can match
//! by identity via [`CoreError::kind`] / [`CoreError::has_kind`]. Phases that
//! can fail independently (eager instantiation, module registration, required
//! config checks, shutdown hooks) report a single [`CoreError::Aggregate`]
//! that still identity-matches any contained variant.

use std::fmt;

/// Discriminant for [`CoreError`], used for identity matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Resolution target missing.
    NotFound,
    /// Dependency cycle during resolution or layering.
    Cycle,
    /// Same service key registered twice without an explicit replace.
    Duplicate,
    /// Two modules with the same name.
    DuplicateModule,
    /// A value cannot be populated by injection.
    NotSettable,
    /// A value's runtime type does not match the requested type.
    TypeMismatch,
    /// Registration attempted after build.
    AlreadyBuilt,
    /// Provider declaration is invalid (e.g. eager transient).
    InvalidProvider,
    /// Operational call on a stopped subsystem.
    NotRunning,
    /// A provider or job panicked.
    ProviderPanic,
    /// A required config key declared by a provider is not set.
    MissingConfig,
    /// A lifecycle hook failed or timed out.
    Hook,
    /// Wrapper carrying the resolution chain around a root cause.
    Resolution,
    /// Composite of independent failures.
    Aggregate,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Error type shared by the container, lifecycle engine, app, and config layer.
#[derive(Debug)]
pub enum CoreError {
    NotFound { key: String },
    Cycle { chain: Vec<String> },
    Duplicate { key: String },
    DuplicateModule { name: String },
    NotSettable { key: String, reason: String },
    TypeMismatch { key: String, expected: &'static str },
    AlreadyBuilt,
    InvalidProvider { key: String, reason: String },
    NotRunning { subsystem: &'static str },
    ProviderPanic { key: String, payload: String },
    MissingConfig { provider: String, key: String },
    Hook { key: String, message: String },
    Resolution { chain: Vec<String>, source: Box<CoreError> },
    Aggregate(Vec<CoreError>),
}

impl CoreError {
    /// The discriminant of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotFound { .. } => ErrorKind::NotFound,
            CoreError::Cycle { .. } => ErrorKind::Cycle,
            CoreError::Duplicate { .. } => ErrorKind::Duplicate,
            CoreError::DuplicateModule { .. } => ErrorKind::DuplicateModule,
            CoreError::NotSettable { .. } => ErrorKind::NotSettable,
            CoreError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            CoreError::AlreadyBuilt => ErrorKind::AlreadyBuilt,
            CoreError::InvalidProvider { .. } => ErrorKind::InvalidProvider,
            CoreError::NotRunning { .. } => ErrorKind::NotRunning,
            CoreError::ProviderPanic { .. } => ErrorKind::ProviderPanic,
            CoreError::MissingConfig { .. } => ErrorKind::MissingConfig,
            CoreError::Hook { .. } => ErrorKind::Hook,
            CoreError::Resolution { .. } => ErrorKind::Resolution,
            CoreError::Aggregate(_) => ErrorKind::Aggregate,
        }
    }

    /// Whether this error is, wraps, or aggregates an error of `kind`.
    ///
    /// Pierces [`CoreError::Resolution`] and [`CoreError::Aggregate`] so a
    /// joined build error answers "does this include NotFound?" directly.
    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        if self.kind() == kind {
            return true;
        }
        match self {
            CoreError::Resolution { source, .. } => source.has_kind(kind),
            CoreError::Aggregate(errors) => errors.iter().any(|e| e.has_kind(kind)),
            _ => false,
        }
    }

    /// Wrap `self` with the resolution chain active at the failure site.
    ///
    /// Errors already carrying a chain pass through untouched so nested
    /// resolve frames do not stack wrappers.
    pub(crate) fn in_chain(self, chain: Vec<String>) -> CoreError {
        match self {
            already @ CoreError::Resolution { .. } => already,
            source => CoreError::Resolution {
                chain,
                source: Box::new(source),
            },
        }
    }

    /// The underlying error, with any [`CoreError::Resolution`] wrapper peeled.
    pub fn root_cause(&self) -> &CoreError {
        match self {
            CoreError::Resolution { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Join independent failures: `Ok(())` when empty, the error itself when
    /// singular, [`CoreError::Aggregate`] otherwise.
    pub fn join(mut errors: Vec<CoreError>) -> Result<(), CoreError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(CoreError::Aggregate(errors)),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::NotFound { key } => write!(f, "service not registered: {key}"),
            CoreError::Cycle { chain } => {
                write!(f, "circular dependency detected: {}", chain.join(" -> "))
            }
            CoreError::Duplicate { key } => {
                write!(
                    f,
                    "service already registered: {key} (use .replace() to override)"
                )
            }
            CoreError::DuplicateModule { name } => {
                write!(f, "module already installed: {name}")
            }
            CoreError::NotSettable { key, reason } => {
                write!(f, "cannot inject into {key}: {reason}")
            }
            CoreError::TypeMismatch { key, expected } => {
                write!(f, "type mismatch for '{key}': expected {expected}")
            }
            CoreError::AlreadyBuilt => {
                write!(f, "container is built; registration is closed")
            }
            CoreError::InvalidProvider { key, reason } => {
                write!(f, "invalid provider for {key}: {reason}")
            }
            CoreError::NotRunning { subsystem } => write!(f, "{subsystem} is not running"),
            CoreError::ProviderPanic { key, payload } => {
                write!(f, "provider for {key} panicked: {payload}")
            }
            CoreError::MissingConfig { provider, key } => {
                write!(
                    f,
                    "provider \"{provider}\": required config key \"{key}\" is not set"
                )
            }
            CoreError::Hook { key, message } => write!(f, "service {key}: {message}"),
            CoreError::Resolution { chain, source } => {
                write!(f, "resolving {}: {source}", chain.join(" -> "))
            }
            CoreError::Aggregate(errors) => {
                write!(f, "{} error(s) occurred:", errors.len())?;
                for err in errors {
                    write!(f, "\n  - {err}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Resolution { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_kind_pierces_resolution_wrapper() {
        let err = CoreError::Resolution {
            chain: vec!["A".into(), "B".into()],
            source: Box::new(CoreError::NotFound { key: "B".into() }),
        };
        assert!(err.has_kind(ErrorKind::NotFound));
        assert!(err.has_kind(ErrorKind::Resolution));
        assert!(!err.has_kind(ErrorKind::Cycle));
    }

    #[test]
    fn has_kind_pierces_aggregate() {
        let err = CoreError::Aggregate(vec![
            CoreError::Duplicate { key: "X".into() },
            CoreError::Resolution {
                chain: vec!["A".into()],
                source: Box::new(CoreError::Cycle {
                    chain: vec!["A".into(), "A".into()],
                }),
            },
        ]);
        assert!(err.has_kind(ErrorKind::Duplicate));
        assert!(err.has_kind(ErrorKind::Cycle));
        assert!(!err.has_kind(ErrorKind::NotFound));
    }

    #[test]
    fn resolution_message_reads_outermost_chain() {
        let err = CoreError::Resolution {
            chain: vec!["app.Server".into(), "app.Db".into()],
            source: Box::new(CoreError::NotFound {
                key: "app.Db".into(),
            }),
        };
        assert_eq!(
            err.to_string(),
            "resolving app.Server -> app.Db: service not registered: app.Db"
        );
    }

    #[test]
    fn in_chain_does_not_stack() {
        let err = CoreError::NotFound { key: "X".into() }
            .in_chain(vec!["A".into(), "X".into()])
            .in_chain(vec!["B".into(), "A".into(), "X".into()]);
        match err {
            CoreError::Resolution { chain, source } => {
                assert_eq!(chain, vec!["A".to_string(), "X".to_string()]);
                assert!(matches!(*source, CoreError::NotFound { .. }));
            }
            other => panic!("expected Resolution, got {other}"),
        }
    }

    #[test]
    fn join_collapses_singular() {
        assert!(CoreError::join(Vec::new()).is_ok());
        let single = CoreError::join(vec![CoreError::AlreadyBuilt]).unwrap_err();
        assert!(matches!(single, CoreError::AlreadyBuilt));
        let joined =
            CoreError::join(vec![CoreError::AlreadyBuilt, CoreError::AlreadyBuilt]).unwrap_err();
        assert!(matches!(joined, CoreError::Aggregate(ref v) if v.len() == 2));
    }

    #[test]
    fn missing_config_message_format() {
        let err = CoreError::MissingConfig {
            provider: "keel_scheduler::Cron".into(),
            key: "scheduler.timezone".into(),
        };
        assert_eq!(
            err.to_string(),
            "provider \"keel_scheduler::Cron\": required config key \"scheduler.timezone\" is not set"
        );
    }
}
