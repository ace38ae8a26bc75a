use std::{
    borrow::Cow,
    fmt::{Debug, Display},
    panic::Location,
};

use serde::{ser::SerializeStruct, Serialize};
use strum_macros::IntoStaticStr;

use crate::job::FailureKind;

/// The package could not be accepted: integrity, parsing or version
/// handshake failures detected before any host mutation.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum BootstrapError {
    #[error("Failed to extract package archive")]
    Extract,
    #[error("Package has no checksums.md5 digest file")]
    ChecksumsMissing,
    #[error("Package digest file is malformed")]
    ChecksumsInvalid,
    #[error("Checksum mismatch for '{path}' in package")]
    ChecksumMismatch { path: String },
    #[error("File '{path}' is listed in the package checksums but missing")]
    FileMissing { path: String },
    #[error("Failed to parse manifest")]
    ManifestParse,
    #[error("Package requires engine {required} but {installed} is installed and no engine is bundled")]
    EngineTooOld { required: String, installed: String },
    #[error("Bundled engine failed checksum verification")]
    BundledEngineIntegrity,
    #[error("Failed to hand off to the bundled engine")]
    Handoff,
}

/// A phase of a running job failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ServicingError {
    #[error("Pre-check '{name}' failed: {diagnostic}")]
    PrecheckFailed { name: String, diagnostic: String },
    #[error("Action #{index} '{name}' failed")]
    ActionFailed { index: usize, name: String },
    #[error("Post-check '{name}' failed: {diagnostic}")]
    PostcheckFailed { name: String, diagnostic: String },
    #[error("Rollback step #{index} failed")]
    RollbackStepFailed { index: usize },
    #[error("Rollback failed while restoring backup '{backup}'")]
    RestoreFailed { backup: String },
    #[error("No backup available to roll back to")]
    NoBackupForRollback,
}

/// The persisted engine state could not be read or written, or denies
/// starting a job.
#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum StateError {
    #[error("Failed to create state layout under '{base}'")]
    CreateLayout { base: String },
    #[error("Another update job is already running")]
    Busy,
    #[error("Failed to persist job '{job_id}'")]
    WriteJob { job_id: String },
}

#[derive(Debug, Eq, thiserror::Error, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

/// Top-level error classification. Every variant family corresponds to a row
/// of the operator-facing failure taxonomy.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Servicing(#[from] ServicingError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl ErrorKind {
    /// Stable failure kind recorded on job records and surfaced over HTTP.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ErrorKind::Bootstrap(e) => match e {
                BootstrapError::ManifestParse => FailureKind::ManifestParse,
                BootstrapError::EngineTooOld { .. } => FailureKind::EngineTooOld,
                BootstrapError::Handoff => FailureKind::Internal,
                _ => FailureKind::Integrity,
            },
            ErrorKind::Servicing(e) => match e {
                ServicingError::PrecheckFailed { .. } => FailureKind::PrecheckFailed,
                ServicingError::ActionFailed { .. } => FailureKind::ActionFailed,
                ServicingError::PostcheckFailed { .. } => FailureKind::PostcheckFailed,
                _ => FailureKind::RollbackFailed,
            },
            ErrorKind::State(e) => match e {
                StateError::Busy => FailureKind::Busy,
                _ => FailureKind::Internal,
            },
            ErrorKind::Internal(_) => FailureKind::Internal,
        }
    }
}

struct UpdaterErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<Cow<'static, str>>,
}

/// Structured error carrying a stable kind, the construction site and an
/// optional unstructured cause chain.
pub struct UpdaterError(Box<UpdaterErrorInner>);

impl UpdaterError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        UpdaterError(Box::new(UpdaterErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn with_source(kind: impl Into<ErrorKind>, source: anyhow::Error) -> Self {
        UpdaterError(Box::new(UpdaterErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: Some(source),
            context: Vec::new(),
        }))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }

    pub fn failure_kind(&self) -> FailureKind {
        self.0.kind.failure_kind()
    }

    pub fn exit_code(&self) -> i32 {
        self.failure_kind().exit_code()
    }

    /// The operator-facing message: the kind message plus the cause chain.
    pub fn message(&self) -> String {
        let mut message = self.0.kind.to_string();
        if let Some(ref source) = self.0.source {
            message.push_str(&format!(": {source:#}"));
        }
        message
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured `UpdaterError` of the given kind.
    fn structured(self, kind: K) -> Result<T, UpdaterError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, UpdaterError> {
        match self {
            Some(t) => Ok(t),
            None => Err(UpdaterError::new(kind)),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, UpdaterError> {
        match self {
            Ok(t) => Ok(t),
            Err(e) => Err(UpdaterError::with_source(kind, e.into())),
        }
    }
}

pub trait UpdaterResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, UpdaterError>;
}

impl<T> UpdaterResultExt<T> for Result<T, UpdaterError> {
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, UpdaterError> {
        if let Err(ref mut e) = self {
            e.0.context.push(context.into());
        }
        self
    }
}

impl Display for UpdaterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

impl Debug for UpdaterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        for (i, context) in self.0.context.iter().enumerate() {
            if i == 0 {
                writeln!(f, "\n\nContext:")?;
            }
            writeln!(f, "{i: >5}: {context}")?;
        }

        if let Some(ref source) = self.0.source {
            write!(f, "\n\nCaused by:\n    {source:#}")?;
        }
        Ok(())
    }
}

impl Serialize for UpdaterError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("updater-error", 5)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        match self.0.kind {
            ErrorKind::Bootstrap(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Servicing(ref e) => state.serialize_field("error", e)?,
            ErrorKind::State(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Internal(ref e) => state.serialize_field("error", e)?,
        }
        state.serialize_field("kind", self.failure_kind().as_str())?;
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{e:#}")))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use serde_json::Value;

    use super::*;

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(
            UpdaterError::new(BootstrapError::ChecksumMismatch {
                path: "files/x".into()
            })
            .failure_kind(),
            FailureKind::Integrity
        );
        assert_eq!(
            UpdaterError::new(StateError::Busy).failure_kind(),
            FailureKind::Busy
        );
        assert_eq!(
            UpdaterError::new(ServicingError::RestoreFailed {
                backup: "b".into()
            })
            .failure_kind(),
            FailureKind::RollbackFailed
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            UpdaterError::new(BootstrapError::EngineTooOld {
                required: "2.0.0".into(),
                installed: "1.0.0".into(),
            })
            .exit_code(),
            3
        );
        assert_eq!(UpdaterError::new(BootstrapError::ManifestParse).exit_code(), 5);
        assert_eq!(UpdaterError::new(StateError::Busy).exit_code(), 7);
        assert_eq!(
            UpdaterError::new(ServicingError::NoBackupForRollback).exit_code(),
            6
        );
    }

    #[test]
    fn test_structured_conversion() {
        let error = std::fs::read("/nonexistent-path-1234")
            .context("failed to read file")
            .structured(BootstrapError::Extract)
            .unwrap_err();
        assert_eq!(error.failure_kind(), FailureKind::Integrity);
        assert!(error.message().contains("failed to read file"));
    }

    #[test]
    fn test_serialize() {
        let error = UpdaterError::new(ServicingError::PrecheckFailed {
            name: "http_check".into(),
            diagnostic: "connection refused".into(),
        });
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["kind"], Value::String("precheck_failed".into()));
        assert_eq!(value["category"], Value::String("servicing".into()));
        assert!(value["message"]
            .as_str()
            .unwrap()
            .contains("Pre-check 'http_check' failed"));
        assert_eq!(value["cause"], Value::Null);
    }
}
