//! Command-line interface for loading and inspecting observation stores.
#![forbid(unsafe_code)]

use std::io::Write;

use camino::Utf8Path;
use clap::{Parser, Subcommand};
use obstore_core::{ObservationStore, StoreConfig};
use serde::Serialize;

mod error;
mod info;
mod ingest;
mod query;

pub use error::CliError;

use info::InfoArgs;
use ingest::IngestArgs;
use query::QueryArgs;

const ARG_STORE: &str = "store";
const ARG_STREAM: &str = "stream";
const ARG_INPUT: &str = "input";
const ARG_SPATIAL: &str = "spatial";
const ARG_BUCKET_SPAN: &str = "bucket-span";
const ARG_START: &str = "start";
const ARG_END: &str = "end";
const ARG_PRODUCER: &str = "producer";
const ARG_FOI: &str = "foi";
const ARG_BBOX: &str = "bbox";
const ARG_LATEST: &str = "latest";
const ENV_INGEST_STORE: &str = "OBSTORE_CMDS_INGEST_STORE";
const ENV_INGEST_STREAM: &str = "OBSTORE_CMDS_INGEST_STREAM";
const ENV_INGEST_INPUT: &str = "OBSTORE_CMDS_INGEST_INPUT";
const ENV_QUERY_STORE: &str = "OBSTORE_CMDS_QUERY_STORE";
const ENV_QUERY_STREAM: &str = "OBSTORE_CMDS_QUERY_STREAM";
const ENV_INFO_STORE: &str = "OBSTORE_CMDS_INFO_STORE";

/// Run the CLI with the current process arguments and environment.
pub fn run() -> Result<(), CliError> {
    let cli = Cli::try_parse().map_err(CliError::ArgumentParsing)?;
    let mut stdout = std::io::stdout().lock();
    dispatch(cli.command, &mut stdout)
}

fn dispatch(command: Command, writer: &mut dyn Write) -> Result<(), CliError> {
    match command {
        Command::Ingest(args) => ingest::run_ingest(args, writer),
        Command::Query(args) => query::run_query(args, writer),
        Command::Info(args) => info::run_info(args, writer),
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "obstore",
    about = "Load, query and inspect time-indexed observation stores",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Append JSON-lines observations to a stream and commit them.
    Ingest(IngestArgs),
    /// Print the records of a stream that match a filter.
    Query(QueryArgs),
    /// Summarise every stream of a store.
    Info(InfoArgs),
}

/// Confirm `path` names an existing regular file.
fn require_existing(path: &Utf8Path, field: &'static str) -> Result<(), CliError> {
    match obstore_fs::file_is_file(path) {
        Ok(true) => Ok(()),
        Ok(false) if path.exists() => Err(CliError::SourcePathNotFile {
            field,
            path: path.to_path_buf(),
        }),
        Ok(false) => Err(CliError::MissingSourceFile {
            field,
            path: path.to_path_buf(),
        }),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            Err(CliError::MissingSourceFile {
                field,
                path: path.to_path_buf(),
            })
        }
        Err(source) => Err(CliError::InspectSourcePath {
            field,
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Open a store whose page file must already exist.
fn open_existing(path: &Utf8Path) -> Result<ObservationStore, CliError> {
    require_existing(path, ARG_STORE)?;
    Ok(ObservationStore::open(&StoreConfig::new(path))?)
}

fn write_json_line(writer: &mut dyn Write, value: &impl Serialize) -> Result<(), CliError> {
    let line = serde_json::to_string(value).map_err(CliError::SerialiseOutput)?;
    writer
        .write_all(line.as_bytes())
        .map_err(CliError::WriteOutput)?;
    writer.write_all(b"\n").map_err(CliError::WriteOutput)
}

#[cfg(test)]
mod tests;
