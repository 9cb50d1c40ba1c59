use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::info;

use crate::{Capability, ParamSpec, ToolError, ToolSpec};
use planwise_domain::ToolArguments;

const DEFAULT_FILE_STEM: &str = "report";
const MARKDOWN_EXTENSION: &str = ".md";

/// Reduce an untrusted filename to a single safe component ending in `.md`.
#[must_use]
pub fn sanitize_filename(raw: &str) -> String {
    let last = raw
        .rsplit(|ch: char| ch == '/' || ch == '\\')
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = last
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    let mut name = if cleaned.is_empty() {
        DEFAULT_FILE_STEM.to_string()
    } else {
        cleaned.to_string()
    };
    if !name.ends_with(MARKDOWN_EXTENSION) {
        name.push_str(MARKDOWN_EXTENSION);
    }
    name
}

const SAVE_PARAMS: &[ParamSpec] = &[
    ParamSpec {
        name: "filename",
        description: "report file name; directories are ignored",
        required: true,
        max_len: 255,
    },
    ParamSpec {
        name: "content",
        description: "markdown body to write",
        required: true,
        max_len: 4_000_000,
    },
];

const SAVE_SPEC: ToolSpec = ToolSpec {
    name: "save_findings",
    description: "Write a markdown report into the output directory.",
    params: SAVE_PARAMS,
    primary_param: "content",
};

/// `save_findings` capability, confined to one output directory.
#[derive(Debug, Clone)]
pub struct SaveFindings {
    output_dir: PathBuf,
}

impl SaveFindings {
    #[must_use]
    pub fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
        }
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn resolve(&self, filename: &str) -> Result<PathBuf, ToolError> {
        fs::create_dir_all(&self.output_dir).map_err(|err| {
            ToolError::Failed(format!(
                "cannot create output dir {}: {err}",
                self.output_dir.display()
            ))
        })?;
        let root = self.output_dir.canonicalize().map_err(|err| {
            ToolError::Failed(format!(
                "cannot resolve output dir {}: {err}",
                self.output_dir.display()
            ))
        })?;
        let target = root.join(sanitize_filename(filename));
        if target.parent() != Some(root.as_path()) {
            return Err(ToolError::Validation(format!(
                "filename {filename} resolves outside the output directory"
            )));
        }
        if fs::symlink_metadata(&target).is_ok_and(|meta| meta.file_type().is_symlink()) {
            return Err(ToolError::Validation(format!(
                "refusing to write through symlink {}",
                target.display()
            )));
        }
        Ok(target)
    }
}

impl Capability for SaveFindings {
    fn spec(&self) -> &ToolSpec {
        &SAVE_SPEC
    }

    fn call(&self, arguments: &ToolArguments) -> Result<Value, ToolError> {
        let filename = crate::required_str(arguments, "filename")?;
        let content = crate::required_str(arguments, "content")?;
        let target = self.resolve(filename)?;
        fs::write(&target, content).map_err(|err| {
            ToolError::Failed(format!("cannot write {}: {err}", target.display()))
        })?;
        info!(path = %target.display(), bytes = content.len(), "findings saved");
        Ok(json!({
            "path": target.to_string_lossy(),
            "bytes": content.len(),
        }))
    }
}
