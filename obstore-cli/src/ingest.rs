//! `ingest` command: append JSON-lines observations and commit them.
//!
//! Each input line is an object of the form
//! `{"producer": "buoy-1", "foi": "harbour", "time": 12.5, "x": 1.0, "y": 2.0, "values": [0.3]}`.
//! `foi`, `x`/`y` and `values` are optional, but every line must have the
//! same shape as the first well-formed one; other lines are skipped and counted. The stream schema is an `F64` time field, the
//! optional `F64` location pair, then one `F64` per value.

use std::io::{BufRead, BufReader, Write};

use camino::Utf8PathBuf;
use clap::Parser;
use log::{info, warn};
use obstore_core::{
    AppendOutcome, FieldKind, ObservationStore, RecordKey, RecordSchema, StoreConfig, StreamHandle,
    TupleWriter, VersionId,
};
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

use crate::{
    ARG_BUCKET_SPAN, ARG_INPUT, ARG_SPATIAL, ARG_STORE, ARG_STREAM, CliError, ENV_INGEST_INPUT,
    ENV_INGEST_STORE, ENV_INGEST_STREAM, require_existing, write_json_line,
};

/// CLI arguments for the `ingest` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Append the JSON-lines observations in an input file to a \
                 stream, creating the store and stream when missing, then \
                 commit them. Paths can come from CLI flags, configuration \
                 files, or environment variables.",
    about = "Append JSON-lines observations to a stream"
)]
#[ortho_config(prefix = "OBSTORE")]
pub(crate) struct IngestArgs {
    /// Path to the store's page file.
    #[arg(long = ARG_STORE, value_name = "path")]
    #[serde(default)]
    pub(crate) store: Option<Utf8PathBuf>,
    /// Stream to append to.
    #[arg(long = ARG_STREAM, value_name = "name")]
    #[serde(default)]
    pub(crate) stream: Option<String>,
    /// JSON-lines file of observations.
    #[arg(long = ARG_INPUT, value_name = "path")]
    #[serde(default)]
    pub(crate) input: Option<Utf8PathBuf>,
    /// Index record locations when the stream is created.
    #[arg(long = ARG_SPATIAL, value_name = "bool", num_args = 0..=1, default_missing_value = "true")]
    #[serde(default)]
    pub(crate) spatial: Option<bool>,
    /// Time bucket width in seconds for a newly created store.
    #[arg(long = ARG_BUCKET_SPAN, value_name = "seconds")]
    #[serde(default)]
    pub(crate) bucket_span: Option<f64>,
}

impl IngestArgs {
    fn into_config(self) -> Result<IngestConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        IngestConfig::try_from(merged)
    }
}

/// Resolved `ingest` command configuration.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IngestConfig {
    pub(crate) store: Utf8PathBuf,
    pub(crate) stream: String,
    pub(crate) input: Utf8PathBuf,
    pub(crate) spatial: bool,
    pub(crate) bucket_span: Option<f64>,
}

impl IngestConfig {
    fn store_config(&self) -> StoreConfig {
        let config = StoreConfig::new(&self.store);
        match self.bucket_span {
            Some(span) => config.with_bucket_span(span),
            None => config,
        }
    }
}

impl TryFrom<IngestArgs> for IngestConfig {
    type Error = CliError;

    fn try_from(args: IngestArgs) -> Result<Self, Self::Error> {
        let store = args.store.ok_or(CliError::MissingArgument {
            field: ARG_STORE,
            env: ENV_INGEST_STORE,
        })?;
        let stream = args.stream.ok_or(CliError::MissingArgument {
            field: ARG_STREAM,
            env: ENV_INGEST_STREAM,
        })?;
        let input = args.input.ok_or(CliError::MissingArgument {
            field: ARG_INPUT,
            env: ENV_INGEST_INPUT,
        })?;
        Ok(Self {
            store,
            stream,
            input,
            spatial: args.spatial.unwrap_or(false),
            bucket_span: args.bucket_span,
        })
    }
}

/// One line of ingest input.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct InputRecord {
    pub(crate) producer: String,
    #[serde(default)]
    pub(crate) foi: Option<String>,
    pub(crate) time: f64,
    #[serde(default)]
    pub(crate) x: Option<f64>,
    #[serde(default)]
    pub(crate) y: Option<f64>,
    #[serde(default)]
    pub(crate) values: Vec<f64>,
}

/// Fields present on an input record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordShape {
    pub(crate) located: bool,
    pub(crate) values: usize,
}

impl RecordShape {
    pub(crate) fn of(record: &InputRecord) -> Result<Self, String> {
        let located = match (record.x, record.y) {
            (Some(_), Some(_)) => true,
            (None, None) => false,
            _ => return Err(String::from("x and y must be given together")),
        };
        Ok(Self {
            located,
            values: record.values.len(),
        })
    }

    /// Schema of a stream holding records of this shape.
    pub(crate) fn schema(self) -> Result<RecordSchema, CliError> {
        let mut names = vec![String::from("time")];
        let mut fields = vec![FieldKind::F64];
        if self.located {
            names.extend([String::from("x"), String::from("y")]);
            fields.extend([FieldKind::F64, FieldKind::F64]);
        }
        names.extend((0..self.values).map(|i| format!("v{i}")));
        fields.extend(std::iter::repeat_n(FieldKind::F64, self.values));
        let schema = RecordSchema::new(names.join(", "), fields)?;
        Ok(if self.located {
            schema.with_location(1, 2)?
        } else {
            schema
        })
    }
}

impl InputRecord {
    fn key(&self) -> RecordKey {
        let key = RecordKey::new(self.producer.as_str(), self.time);
        match &self.foi {
            Some(foi) => key.with_foi(foi.as_str()),
            None => key,
        }
    }

    pub(crate) fn payload(&self) -> Vec<u8> {
        let mut writer = TupleWriter::new().f64(self.time);
        if let (Some(x), Some(y)) = (self.x, self.y) {
            writer = writer.f64(x).f64(y);
        }
        self.values
            .iter()
            .fold(writer, |writer, value| writer.f64(*value))
            .finish()
    }
}

/// Result of an ingest run, printed as one JSON line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct IngestSummary {
    pub(crate) stream: String,
    pub(crate) records: usize,
    /// Records left out of the spatial index.
    pub(crate) unindexed: usize,
    /// Input lines skipped because they could not be stored.
    pub(crate) rejected: usize,
    pub(crate) version: VersionId,
}

pub(crate) fn run_ingest(args: IngestArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let config = resolve_ingest_config(args)?;
    let summary = ingest(&config)?;
    write_json_line(writer, &summary)
}

pub(crate) fn resolve_ingest_config(args: IngestArgs) -> Result<IngestConfig, CliError> {
    let config = args.into_config()?;
    require_existing(&config.input, ARG_INPUT)?;
    Ok(config)
}

/// Appends input lines to one stream, opened on the first well-formed record.
struct Appender<'a> {
    config: &'a IngestConfig,
    store: &'a ObservationStore,
    stream: Option<(StreamHandle, RecordShape)>,
}

impl Appender<'_> {
    /// Append one non-blank input line. Every error is specific to the line.
    fn append(&mut self, number: usize, line: &str) -> Result<AppendOutcome, CliError> {
        let record: InputRecord =
            serde_json::from_str(line).map_err(|source| CliError::ParseRecord {
                path: self.config.input.clone(),
                line: number,
                source,
            })?;
        let inconsistent = |reason: String| CliError::InconsistentRecord {
            path: self.config.input.clone(),
            line: number,
            reason,
        };
        let shape = RecordShape::of(&record).map_err(inconsistent)?;
        let (handle, expected) = match self.stream.take() {
            Some(stream) => stream,
            None => {
                let schema = shape.schema()?;
                let handle =
                    self.store
                        .open_stream(&self.config.stream, schema, self.config.spatial)?;
                (handle, shape)
            }
        };
        let outcome = if expected == shape {
            self.store
                .append(&handle, record.key(), record.payload())
                .map_err(CliError::from)
        } else {
            Err(inconsistent(format!(
                "record shape {shape:?} differs from the first record's {expected:?}"
            )))
        };
        self.stream = Some((handle, expected));
        outcome
    }
}

/// Append every storable line of the input and commit them.
///
/// A line that does not parse, does not match the first well-formed record's
/// shape, or is refused by the store is skipped with a warning and counted
/// as rejected. The run fails only when no line could be stored.
pub(crate) fn ingest(config: &IngestConfig) -> Result<IngestSummary, CliError> {
    let read_error = |source| CliError::ReadInput {
        path: config.input.clone(),
        source,
    };
    let file = obstore_fs::open_utf8_file(&config.input).map_err(read_error)?;
    let store = ObservationStore::open(&config.store_config())?;

    let mut appender = Appender {
        config,
        store: &store,
        stream: None,
    };
    let mut records = 0;
    let mut unindexed = 0;
    let mut rejected = 0;
    let mut first_rejection = None;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(read_error)?;
        if line.trim().is_empty() {
            continue;
        }
        match appender.append(index + 1, &line) {
            Ok(outcome) => {
                records += 1;
                if !outcome.is_indexed() {
                    unindexed += 1;
                }
            }
            Err(err) => {
                warn!("skipping record: {err}");
                rejected += 1;
                first_rejection.get_or_insert(err);
            }
        }
    }

    if records == 0 {
        return Err(match first_rejection {
            Some(first) => CliError::NoValidRecords {
                path: config.input.clone(),
                rejected,
                first: Box::new(first),
            },
            None => CliError::EmptyInput {
                path: config.input.clone(),
            },
        });
    }
    let version = store.commit()?;
    info!(
        "ingested {records} records from {} into stream `{}` ({rejected} rejected)",
        config.input, config.stream
    );
    Ok(IngestSummary {
        stream: config.stream.clone(),
        records,
        unindexed,
        rejected,
        version,
    })
}
