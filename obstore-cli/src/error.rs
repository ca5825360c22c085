//! Error types emitted by the observation store CLI.
//!
//! Keep this error type reasonably small, as every command helper returns
//! `Result<_, CliError>`; store errors are boxed for that reason.

use std::sync::Arc;

use camino::Utf8PathBuf;
use obstore_core::{SchemaDefinitionError, StoreError};
use thiserror::Error;

/// Errors emitted by the observation store CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Provided arguments failed Clap validation.
    #[error(transparent)]
    ArgumentParsing(#[from] clap::Error),
    /// Configuration layering failed (files, env, CLI).
    #[error("failed to load configuration: {0}")]
    Configuration(#[from] Arc<ortho_config::OrthoError>),
    /// A required option is missing after configuration merging.
    #[error("missing {field} (set --{field} or {env})")]
    MissingArgument {
        /// Flag name without leading dashes.
        field: &'static str,
        /// Environment variable that can supply the value.
        env: &'static str,
    },
    /// A referenced input path does not exist on disk.
    #[error("{field} path {path:?} does not exist")]
    MissingSourceFile {
        /// Flag naming the path.
        field: &'static str,
        /// Path that was not found.
        path: Utf8PathBuf,
    },
    /// A referenced input path exists but is not a file.
    #[error("{field} path {path:?} exists but is not a file")]
    SourcePathNotFile {
        /// Flag naming the path.
        field: &'static str,
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// A referenced input path could not be inspected due to an IO error.
    #[error("failed to inspect {field} path {path:?}: {source}")]
    InspectSourcePath {
        /// Flag naming the path.
        field: &'static str,
        /// Path being inspected.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The bounding box flag is not four comma-separated numbers.
    #[error("bounding box {value:?} must be minx,miny,maxx,maxy")]
    InvalidBoundingBox {
        /// Rejected flag value.
        value: String,
    },
    /// Opening or reading the ingest input failed.
    #[error("failed to read input {path:?}: {source}")]
    ReadInput {
        /// Input file.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The ingest input holds no records.
    #[error("input {path:?} holds no records")]
    EmptyInput {
        /// Input file.
        path: Utf8PathBuf,
    },
    /// Every non-blank input line was rejected.
    #[error("no record in {path:?} could be stored ({rejected} rejected); first: {first}")]
    NoValidRecords {
        /// Input file.
        path: Utf8PathBuf,
        /// Number of rejected lines.
        rejected: usize,
        /// Why the first line was rejected.
        #[source]
        first: Box<CliError>,
    },
    /// An input line is not a valid JSON record.
    #[error("line {line} of {path:?} is not a valid record: {source}")]
    ParseRecord {
        /// Input file.
        path: Utf8PathBuf,
        /// One-based line number.
        line: usize,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
    /// An input record disagrees with the shape of the first record.
    #[error("line {line} of {path:?}: {reason}")]
    InconsistentRecord {
        /// Input file.
        path: Utf8PathBuf,
        /// One-based line number.
        line: usize,
        /// What differs.
        reason: String,
    },
    /// The stream schema derived from the input is unusable.
    #[error("cannot derive a stream schema: {0}")]
    Schema(#[from] SchemaDefinitionError),
    /// The store rejected an operation.
    #[error(transparent)]
    Store(#[from] Box<StoreError>),
    /// Serialising command output failed.
    #[error("failed to serialise output: {0}")]
    SerialiseOutput(#[source] serde_json::Error),
    /// Writing command output failed.
    #[error("failed to write output: {0}")]
    WriteOutput(#[source] std::io::Error),
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        Self::Store(Box::new(err))
    }
}
