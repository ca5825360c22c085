//! Test helpers for writing ingest inputs and reading command output.

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::Value;
use tempfile::TempDir;

/// Scratch directory holding a store path and an input file.
pub(super) struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    pub(super) fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 workspace");
        Self { _dir: dir, root }
    }

    pub(super) fn store(&self) -> Utf8PathBuf {
        self.root.join("data/observations.obs")
    }

    pub(super) fn path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }

    /// Write `lines` as a JSON-lines file and return its path.
    pub(super) fn write_input(&self, name: &str, lines: &[&str]) -> Utf8PathBuf {
        let path = self.path(name);
        write_utf8(&path, lines.join("\n").as_bytes());
        path
    }
}

pub(super) fn write_utf8(path: &Utf8Path, contents: &[u8]) {
    std::fs::write(path, contents).expect("write file");
}

/// Ten located buoy readings: two producers, five readings each, walking
/// diagonally from the origin.
pub(super) fn buoy_lines() -> Vec<String> {
    (0..5)
        .flat_map(|i| {
            ["north", "south"].into_iter().map(move |producer| {
                let foi = if producer == "north" { "harbour" } else { "reef" };
                format!(
                    r#"{{"producer":"{producer}","foi":"{foi}","time":{i}.0,"x":{i}.0,"y":{i}.0,"values":[{i}.5]}}"#
                )
            })
        })
        .collect()
}

/// Decode JSON-lines command output.
pub(super) fn json_lines(output: &[u8]) -> Vec<Value> {
    std::str::from_utf8(output)
        .expect("utf-8 output")
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect()
}
