// crates/flowruntime/src/loader.rs
use flowcore::{FlowDefinition, FlowError};
use std::path::{Path, PathBuf};

/// Reads flow definitions from `*.json` files in a directory
pub struct DefinitionLoader {
    dir: PathBuf,
}

impl DefinitionLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load every definition file, sorted by file name. A missing directory
    /// yields no definitions.
    pub fn load_definitions(&self) -> Result<Vec<FlowDefinition>, FlowError> {
        if !self.dir.exists() {
            tracing::warn!("Definition directory {} does not exist", self.dir.display());
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension() == Some("json".as_ref()) {
                paths.push(path);
            }
        }
        paths.sort();

        paths.iter().map(|path| load_definition(path)).collect()
    }
}

pub fn load_definition(path: &Path) -> Result<FlowDefinition, FlowError> {
    let definition: FlowDefinition = serde_json::from_reader(std::fs::File::open(path)?)?;
    tracing::debug!("Loaded definition '{}' from {}", definition.flow_type, path.display());
    Ok(definition)
}
