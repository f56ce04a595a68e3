//! Code units, code paths and the isolated loader
//!
//! A code unit is a named wasm module (binary or text). A code path is the
//! ordered set of in-memory units and file-system locations a loader draws
//! from. Restricted and support code each come as one code path.

pub mod hostlib;
pub mod isolated;

use crate::config::types::{Result, SandboxError};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const WASM_MAGIC: &[u8] = b"\0asm";

/// Immutable named binary artifact
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeUnit {
    name: String,
    bytes: Arc<[u8]>,
}

impl CodeUnit {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self {
            name: name.into(),
            bytes: Arc::from(bytes),
        }
    }

    /// Load a `*.wasm` or `*.wat` file. The unit name is the file stem.
    pub fn from_file(path: &Path) -> Result<Self> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| SandboxError::Config(format!("Bad unit file name: {}", path.display())))?;
        let bytes = fs::read(path)?;
        Ok(Self::new(name, bytes))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_binary(&self) -> bool {
        self.bytes.starts_with(WASM_MAGIC)
    }

    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.bytes()).into()
    }
}

fn is_unit_file(path: &Path) -> bool {
    path.is_file()
        && matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("wasm") | Some("wat")
        )
}

/// Ordered in-memory units followed by file-system locations.
#[derive(Clone, Debug, Default)]
pub struct CodePath {
    units: Vec<CodeUnit>,
    locations: Vec<PathBuf>,
}

impl CodePath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an in-memory unit. Names are unique within a code path.
    pub fn add_unit(&mut self, unit: CodeUnit) -> Result<()> {
        if self.units.iter().any(|u| u.name == unit.name) {
            return Err(SandboxError::DuplicateUnit(unit.name));
        }
        self.units.push(unit);
        Ok(())
    }

    pub fn with_unit(mut self, unit: CodeUnit) -> Result<Self> {
        self.add_unit(unit)?;
        Ok(self)
    }

    /// Add a unit file or a directory of unit files.
    pub fn add_location(&mut self, location: impl Into<PathBuf>) {
        self.locations.push(location.into());
    }

    pub fn with_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.add_location(location);
        self
    }

    pub fn units(&self) -> &[CodeUnit] {
        &self.units
    }

    pub fn locations(&self) -> &[PathBuf] {
        &self.locations
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty() && self.locations.is_empty()
    }

    /// All units in resolution order: memory units, then each location.
    /// A unit shadowed by an earlier one of the same name is skipped.
    pub fn resolve(&self) -> Result<Vec<CodeUnit>> {
        let mut seen: HashSet<String> = self.units.iter().map(|u| u.name.clone()).collect();
        let mut resolved = self.units.clone();

        for location in &self.locations {
            let files = if location.is_dir() {
                let mut files: Vec<PathBuf> = fs::read_dir(location)?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|p| is_unit_file(p))
                    .collect();
                files.sort();
                files
            } else if is_unit_file(location) {
                vec![location.clone()]
            } else {
                return Err(SandboxError::Config(format!(
                    "Code path location is not a unit file or directory: {}",
                    location.display()
                )));
            };

            for file in files {
                let unit = CodeUnit::from_file(&file)?;
                if seen.insert(unit.name.clone()) {
                    resolved.push(unit);
                } else {
                    log::debug!("Unit '{}' at {} is shadowed", unit.name, file.display());
                }
            }
        }
        Ok(resolved)
    }

    /// Write the in-memory units into `dir` and return an equivalent code
    /// path made only of locations.
    pub fn materialise(&self, dir: &Path) -> Result<CodePath> {
        let mut out = CodePath::new();
        if !self.units.is_empty() {
            fs::create_dir_all(dir)?;
            for unit in &self.units {
                let ext = if unit.is_binary() { "wasm" } else { "wat" };
                fs::write(dir.join(format!("{}.{}", unit.name, ext)), unit.bytes())?;
            }
            out.add_location(dir);
        }
        for location in &self.locations {
            out.add_location(location.clone());
        }
        Ok(out)
    }
}
