//! Conflict resolution capability.
//!
//! The engine treats the interactive merge tool as a black box: it hands
//! over the destination, source and partially merged states of one
//! document and gets back the resolved document, or nothing when the
//! resolution was abandoned. Any implementation satisfies the contract;
//! the default shells out to a three-pane merge tool over serialized
//! files.

use std::fs;
use std::process::Command;

use bson::{Bson, Document};

use crate::error::{Error, Result};

/// Resolves one conflicted document at a time.
pub trait Resolver {
    /// Produce the resolved document, or `None` when the resolution was
    /// abandoned (the conflict stays recorded).
    fn resolve(
        &self,
        destination: &Document,
        source: &Document,
        merged: &Document,
    ) -> Result<Option<Document>>;
}

/// Canonical document encoding for the merge-tool file exchange.
pub fn to_canonical_json(document: &Document) -> Result<String> {
    let value = Bson::Document(document.clone()).into_relaxed_extjson();
    Ok(serde_json::to_string_pretty(&value)?)
}

pub fn from_canonical_json(text: &str) -> Result<Document> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let bson = Bson::try_from(value)
        .map_err(|err| Error::MergeTool(format!("invalid document produced: {err}")))?;
    match bson {
        Bson::Document(document) => Ok(document),
        other => Err(Error::MergeTool(format!(
            "expected a document, got {other}"
        ))),
    }
}

/// External three-pane merge tool invoked over serialized documents.
///
/// The tool is called with the `DESTINATION`, `MERGED` and `SOURCE` file
/// paths; a zero exit reports the resolution through the `MERGED` file.
pub struct MergeTool {
    program: String,
    extra_args: Vec<String>,
}

impl MergeTool {
    pub fn new(program: impl Into<String>) -> MergeTool {
        MergeTool {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    /// The invocation the original tooling uses.
    pub fn meld() -> MergeTool {
        MergeTool {
            program: "meld".to_string(),
            extra_args: vec![
                "--auto-merge".to_string(),
                "-L".to_string(),
                "REMOTE".to_string(),
                "-L".to_string(),
                "MERGED".to_string(),
                "-L".to_string(),
                "LOCAL".to_string(),
            ],
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> MergeTool {
        self.extra_args = args;
        self
    }
}

impl Resolver for MergeTool {
    fn resolve(
        &self,
        destination: &Document,
        source: &Document,
        merged: &Document,
    ) -> Result<Option<Document>> {
        let dir = tempfile::tempdir()?;
        let destination_path = dir.path().join("DESTINATION");
        let merged_path = dir.path().join("MERGED");
        let source_path = dir.path().join("SOURCE");

        fs::write(&destination_path, to_canonical_json(destination)?)?;
        fs::write(&merged_path, to_canonical_json(merged)?)?;
        fs::write(&source_path, to_canonical_json(source)?)?;

        let status = Command::new(&self.program)
            .arg(&destination_path)
            .arg(&merged_path)
            .arg(&source_path)
            .args(&self.extra_args)
            .status()
            .map_err(|err| Error::MergeTool(format!("failed to run '{}': {err}", self.program)))?;

        if !status.success() {
            return Ok(None);
        }
        let text = match fs::read_to_string(&merged_path) {
            Ok(text) => text,
            Err(_) => return Ok(None),
        };
        Ok(Some(from_canonical_json(&text)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use bson::oid::ObjectId;

    #[test]
    fn canonical_json_round_trips_object_ids() {
        let document = doc! {"_id": ObjectId::new(), "x": 1_i64, "name": "A"};
        let text = to_canonical_json(&document).unwrap();
        assert_eq!(from_canonical_json(&text).unwrap(), document);
    }

    #[cfg(unix)]
    #[test]
    fn zero_exit_returns_the_merged_file() {
        // `true` exits zero without touching the files, so the partial
        // merge comes back unchanged.
        let tool = MergeTool::new("true");
        let merged = doc! {"_id": 1_i64, "x": 2_i64};
        let resolved = tool
            .resolve(&doc! {"x": 1}, &doc! {"x": 3}, &merged)
            .unwrap();
        assert_eq!(resolved, Some(merged));
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_aborts_the_resolution() {
        let tool = MergeTool::new("false");
        let resolved = tool
            .resolve(&doc! {"x": 1}, &doc! {"x": 3}, &doc! {"x": 1})
            .unwrap();
        assert!(resolved.is_none());
    }
}
