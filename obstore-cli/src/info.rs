//! `info` command: one summary line per stream.

use std::io::Write;

use camino::Utf8PathBuf;
use clap::Parser;
use obstore_core::ObservationStore;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

use crate::{ARG_STORE, CliError, ENV_INFO_STORE, open_existing, write_json_line};

/// CLI arguments for the `info` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(about = "Summarise the streams of a store")]
#[ortho_config(prefix = "OBSTORE")]
pub(crate) struct InfoArgs {
    /// Path to the store's page file.
    #[arg(long = ARG_STORE, value_name = "path")]
    #[serde(default)]
    pub(crate) store: Option<Utf8PathBuf>,
}

/// Summary of one stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct StreamSummary {
    pub(crate) stream: String,
    pub(crate) schema: String,
    pub(crate) spatial: bool,
    pub(crate) records: usize,
    pub(crate) fois: usize,
    /// Earliest and latest timestamps; absent for empty streams.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) time_range: Option<(f64, f64)>,
}

pub(crate) fn run_info(args: InfoArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let merged = args.load_and_merge().map_err(CliError::Configuration)?;
    let store_path = merged.store.ok_or(CliError::MissingArgument {
        field: ARG_STORE,
        env: ENV_INFO_STORE,
    })?;
    let store = open_existing(&store_path)?;
    for summary in summarise(&store)? {
        write_json_line(writer, &summary)?;
    }
    Ok(())
}

pub(crate) fn summarise(store: &ObservationStore) -> Result<Vec<StreamSummary>, CliError> {
    store
        .streams()
        .into_iter()
        .map(|name| -> Result<StreamSummary, CliError> {
            let handle = store.stream(&name)?;
            Ok(StreamSummary {
                schema: handle.schema().description.clone(),
                spatial: handle.indexes_locations(),
                records: store.record_count(&name)?,
                fois: store.foi_ids(&name, None)?.len(),
                time_range: store.time_range(&name, None)?,
                stream: name,
            })
        })
        .collect()
}
