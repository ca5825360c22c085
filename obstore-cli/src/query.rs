//! `query` command: print the records of a stream matching a filter.

use std::io::Write;

use camino::Utf8PathBuf;
use clap::Parser;
use geo::{Coord, Polygon, Rect};
use obstore_core::{
    FieldKind, Filter, PayloadError, Record, RecordSchema, StoreError, TupleReader,
};
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    ARG_BBOX, ARG_END, ARG_FOI, ARG_LATEST, ARG_PRODUCER, ARG_START, ARG_STORE, ARG_STREAM,
    CliError, ENV_QUERY_STORE, ENV_QUERY_STREAM, open_existing, write_json_line,
};

/// CLI arguments for the `query` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    long_about = "Print the committed records of a stream as JSON lines. \
                 Constraints combine as a conjunction; repeat --producer \
                 or --foi to accept several values.",
    about = "Print matching records as JSON lines"
)]
#[ortho_config(prefix = "OBSTORE")]
pub(crate) struct QueryArgs {
    /// Path to the store's page file.
    #[arg(long = ARG_STORE, value_name = "path")]
    #[serde(default)]
    pub(crate) store: Option<Utf8PathBuf>,
    /// Stream to query.
    #[arg(long = ARG_STREAM, value_name = "name")]
    #[serde(default)]
    pub(crate) stream: Option<String>,
    /// Earliest timestamp, inclusive.
    #[arg(long = ARG_START, value_name = "seconds")]
    #[serde(default)]
    pub(crate) start: Option<f64>,
    /// Latest timestamp, inclusive.
    #[arg(long = ARG_END, value_name = "seconds")]
    #[serde(default)]
    pub(crate) end: Option<f64>,
    /// Only the latest record of each producer; overrides --start/--end.
    #[arg(long = ARG_LATEST, value_name = "bool", num_args = 0..=1, default_missing_value = "true")]
    #[serde(default)]
    pub(crate) latest: Option<bool>,
    /// Producer to include.
    #[arg(long = ARG_PRODUCER, value_name = "id")]
    #[serde(default)]
    pub(crate) producers: Vec<String>,
    /// Feature of interest to include.
    #[arg(long = ARG_FOI, value_name = "id")]
    #[serde(default)]
    pub(crate) fois: Vec<String>,
    /// Region of interest as `minx,miny,maxx,maxy`.
    #[arg(long = ARG_BBOX, value_name = "box", allow_hyphen_values = true)]
    #[serde(default)]
    pub(crate) bbox: Option<String>,
}

impl QueryArgs {
    fn into_config(self) -> Result<QueryConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        QueryConfig::try_from(merged)
    }
}

/// Resolved `query` command configuration.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QueryConfig {
    pub(crate) store: Utf8PathBuf,
    pub(crate) stream: String,
    pub(crate) filter: Filter,
}

impl TryFrom<QueryArgs> for QueryConfig {
    type Error = CliError;

    fn try_from(args: QueryArgs) -> Result<Self, Self::Error> {
        let store = args.store.ok_or(CliError::MissingArgument {
            field: ARG_STORE,
            env: ENV_QUERY_STORE,
        })?;
        let stream = args.stream.ok_or(CliError::MissingArgument {
            field: ARG_STREAM,
            env: ENV_QUERY_STREAM,
        })?;

        let mut filter = if args.latest.unwrap_or(false) {
            Filter::new().latest()
        } else {
            match (args.start, args.end) {
                (None, None) => Filter::new(),
                (start, end) => Filter::new().with_time_range(
                    start.unwrap_or(f64::NEG_INFINITY),
                    end.unwrap_or(f64::INFINITY),
                ),
            }
        };
        if !args.producers.is_empty() {
            filter = filter.with_producers(args.producers);
        }
        if !args.fois.is_empty() {
            filter = filter.with_fois(args.fois);
        }
        if let Some(bbox) = args.bbox {
            filter = filter.with_roi(parse_bbox(&bbox)?);
        }
        Ok(Self {
            store,
            stream,
            filter,
        })
    }
}

/// Parse `minx,miny,maxx,maxy` into a rectangle.
pub(crate) fn parse_bbox(value: &str) -> Result<Polygon<f64>, CliError> {
    let invalid = || CliError::InvalidBoundingBox {
        value: value.to_owned(),
    };
    let numbers = value
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;
    let [min_x, min_y, max_x, max_y] = numbers.as_slice() else {
        return Err(invalid());
    };
    if min_x > max_x || min_y > max_y {
        return Err(invalid());
    }
    Ok(Rect::new(
        Coord { x: *min_x, y: *min_y },
        Coord { x: *max_x, y: *max_y },
    )
    .to_polygon())
}

/// One printed record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct RecordLine {
    pub(crate) producer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) foi: Option<String>,
    pub(crate) time: f64,
    pub(crate) fields: Vec<Value>,
}

impl RecordLine {
    pub(crate) fn decode(schema: &RecordSchema, record: Record) -> Result<Self, PayloadError> {
        let reader = TupleReader::new(schema, &record.payload);
        let fields = schema
            .fields
            .iter()
            .enumerate()
            .map(|(field, kind)| match kind {
                FieldKind::Bool => reader.bool(field).map(Value::from),
                FieldKind::U8 => reader.u8(field).map(Value::from),
                FieldKind::Text => reader.text(field).map(Value::from),
                FieldKind::I32 | FieldKind::I64 | FieldKind::F32 | FieldKind::F64 => {
                    reader.number(field).map(Value::from)
                }
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            producer: record.key.producer_id,
            foi: record.key.foi_id,
            time: record.key.timestamp,
            fields,
        })
    }
}

pub(crate) fn run_query(args: QueryArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let config = args.into_config()?;
    query(&config, writer).map(|_| ())
}

/// Print every match, returning how many were printed.
pub(crate) fn query(config: &QueryConfig, writer: &mut dyn Write) -> Result<usize, CliError> {
    let store = open_existing(&config.store)?;
    let schema = store.stream_schema(&config.stream)?;
    let mut printed = 0;
    for record in store.query(&config.stream, &config.filter)? {
        let line = RecordLine::decode(&schema, record?).map_err(|err| {
            CliError::from(StoreError::SchemaMismatch {
                stream: config.stream.clone(),
                reason: err.to_string(),
            })
        })?;
        write_json_line(writer, &line)?;
        printed += 1;
    }
    Ok(printed)
}

#[cfg(test)]
pub(crate) fn config_from_layers_for_test(
    layers: Vec<ortho_config::MergeLayer<'static>>,
) -> Result<QueryConfig, CliError> {
    let merged = QueryArgs::merge_from_layers(layers).map_err(CliError::from)?;
    QueryConfig::try_from(merged)
}
