//! Behaviour-driven step definitions driving the CLI command scenarios.

use super::helpers::{Workspace, buoy_lines, json_lines};
use super::*;
use camino::Utf8PathBuf;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use std::cell::RefCell;

/// Aggregates CLI scenario state so each step only needs a single world
/// argument.
struct CliWorld {
    workspace: Workspace,
    input: RefCell<Option<Utf8PathBuf>>,
    output: RefCell<Vec<u8>>,
    result: RefCell<Option<Result<(), CliError>>>,
}

impl CliWorld {
    fn new() -> Self {
        Self {
            workspace: Workspace::new(),
            input: RefCell::new(None),
            output: RefCell::new(Vec::new()),
            result: RefCell::new(None),
        }
    }

    fn input(&self) -> Utf8PathBuf {
        self.input.borrow().clone().expect("input file written")
    }

    /// Parse and run one invocation, keeping only its own output.
    fn invoke(&self, args: &[&str]) {
        let mut output = Vec::new();
        let invocation = std::iter::once("obstore").chain(args.iter().copied());
        let outcome = Cli::try_parse_from(invocation)
            .map_err(CliError::ArgumentParsing)
            .and_then(|cli| dispatch(cli.command, &mut output));
        self.output.replace(output);
        self.result.replace(Some(outcome));
    }

    fn summarise(&self) {
        let store = self.workspace.store();
        self.invoke(&["info", "--store", store.as_str()]);
        self.expect_success();
    }

    fn assert_buoys_listed(&self) {
        let lines = json_lines(&self.output.borrow());
        let [summary] = lines.as_slice() else {
            panic!("expected one summary line, found {lines:?}");
        };
        assert_eq!(summary["stream"], "buoys");
        assert_eq!(summary["records"], 10);
        assert_eq!(summary["spatial"], true);
    }

    fn expect_success(&self) {
        let borrowed = self.result.borrow();
        if let Err(err) = borrowed.as_ref().expect("command ran") {
            panic!("expected success, found {err:?}");
        }
    }
}

#[fixture]
fn world() -> CliWorld {
    CliWorld::new()
}

#[given("a JSON-lines file of buoy readings")]
fn buoy_file(#[from(world)] world: &CliWorld) {
    let lines = buoy_lines();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let path = world.workspace.write_input("buoys.jsonl", &refs);
    world.input.replace(Some(path));
}

#[given("a JSON-lines file of buoy readings with two malformed lines")]
fn noisy_buoy_file(#[from(world)] world: &CliWorld) {
    let mut lines = buoy_lines();
    lines.insert(3, String::from(r#"{"producer":"north","time":"late"}"#));
    lines.push(String::from("{truncated"));
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let path = world.workspace.write_input("noisy.jsonl", &refs);
    world.input.replace(Some(path));
}

#[when("I ingest the file into the \"buoys\" stream with spatial indexing")]
fn ingest_buoys(#[from(world)] world: &CliWorld) {
    let store = world.workspace.store();
    let input = world.input();
    world.invoke(&[
        "ingest",
        "--store",
        store.as_str(),
        "--stream",
        "buoys",
        "--input",
        input.as_str(),
        "--spatial",
    ]);
    world.expect_success();
}

#[when("I ingest the file without naming a store")]
fn ingest_without_store(#[from(world)] world: &CliWorld) {
    let input = world.input();
    world.invoke(&["ingest", "--stream", "buoys", "--input", input.as_str()]);
}

#[when("I query the \"buoys\" stream with the bounding box \"1,1,2,2\"")]
fn query_box(#[from(world)] world: &CliWorld) {
    let store = world.workspace.store();
    world.invoke(&[
        "query",
        "--store",
        store.as_str(),
        "--stream",
        "buoys",
        "--bbox",
        "1,1,2,2",
    ]);
    world.expect_success();
}

#[when("I ask for the store summary")]
fn ask_for_summary(#[from(world)] world: &CliWorld) {
    world.summarise();
}

#[then("the query prints 4 records")]
fn prints_four(#[from(world)] world: &CliWorld) {
    let lines = json_lines(&world.output.borrow());
    assert_eq!(lines.len(), 4, "expected four records in the box");
    assert!(
        lines
            .iter()
            .all(|line| line["producer"] == "north" || line["producer"] == "south")
    );
}

#[then("the CLI reports that the \"store\" flag is missing")]
fn reports_missing_store(#[from(world)] world: &CliWorld) {
    let borrowed = world.result.borrow();
    let error = borrowed
        .as_ref()
        .expect("result recorded")
        .as_ref()
        .expect_err("expected error");
    match error {
        CliError::MissingArgument { field, env } => {
            assert_eq!(*field, ARG_STORE);
            assert_eq!(*env, ENV_INGEST_STORE);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[then("the ingest stores 10 records and rejects 2 lines")]
fn ingest_counts_rejections(#[from(world)] world: &CliWorld) {
    let lines = json_lines(&world.output.borrow());
    let [summary] = lines.as_slice() else {
        panic!("expected one ingest summary, found {lines:?}");
    };
    assert_eq!(summary["records"], 10);
    assert_eq!(summary["rejected"], 2);
    assert_eq!(summary["unindexed"], 0);
}

#[then("the store summary lists the \"buoys\" stream with 10 records")]
fn store_summary_lists_buoys(#[from(world)] world: &CliWorld) {
    world.summarise();
    world.assert_buoys_listed();
}

#[then("the summary lists the \"buoys\" stream with 10 records")]
fn summary_lists_buoys(#[from(world)] world: &CliWorld) {
    world.assert_buoys_listed();
}

macro_rules! register_cli_scenario {
    ($fn_name:ident, $scenario_title:literal) => {
        #[scenario(path = "tests/features/cli_commands.feature", name = $scenario_title)]
        fn $fn_name(#[from(world)] world: CliWorld) {
            let _ = world;
        }
    };
}

register_cli_scenario!(
    ingest_and_query,
    "ingesting observations and querying a region"
);
register_cli_scenario!(rejecting_missing_store, "rejecting a missing store path");
register_cli_scenario!(summarising_store, "summarising a store");
register_cli_scenario!(
    skipping_malformed_lines,
    "skipping malformed lines during ingest"
);
