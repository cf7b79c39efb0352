use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Position of a rule or term inside the policy document it was compiled from.
///
/// Rows and columns are zero-based; they are rendered one-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub file: Option<String>,
    pub row: usize,
    pub column: usize,
}

impl Location {
    pub fn new(file: Option<String>, row: usize, column: usize) -> Self {
        Self { file, row, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, " at line {}, column {}", self.row + 1, self.column + 1)?;
        if let Some(ref file) = self.file {
            write!(f, " in file {}", file)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum SourceInfo {
    /// From a compiled policy document.
    Policy { location: Arc<Location> },

    /// Created as a temporary variable
    TemporaryVariable,

    /// From an FFI call
    Ffi,

    /// Created for a test
    Test,
}

impl SourceInfo {
    pub fn ffi() -> Self {
        Self::Ffi
    }

    pub fn location(&self) -> Option<&Location> {
        match self {
            Self::Policy { location } => Some(location),
            _ => None,
        }
    }
}

/// Book-keeping for the policy documents loaded into a knowledge base.
#[derive(Debug, Default)]
pub struct Sources {
    /// Map from source ID to the filename it was loaded from, if any.
    sources: HashMap<u64, Option<String>>,
    /// Map from filename to source ID.
    loaded_files: HashMap<String, u64>,
    /// Map from content fingerprint to filename.
    loaded_content: HashMap<u64, String>,
}

impl Sources {
    /// Register a document. Returns a message describing the conflict if a document with the
    /// same filename or the same contents under a different name was already loaded.
    pub fn add_source(
        &mut self,
        src_id: u64,
        filename: Option<&str>,
        fingerprint: u64,
    ) -> Result<(), String> {
        if let Some(filename) = filename {
            match (
                self.loaded_content.get(&fingerprint),
                self.loaded_files.contains_key(filename),
            ) {
                (Some(other_file), true) if other_file == filename => {
                    return Err(format!("File {} has already been loaded.", filename))
                }
                (_, true) => {
                    return Err(format!(
                        "A file with the name {}, but different contents has already been loaded.",
                        filename
                    ))
                }
                (Some(other_file), _) => {
                    return Err(format!(
                        "A file with the same contents as {} named {} has already been loaded.",
                        filename, other_file
                    ))
                }
                _ => {}
            }
            self.loaded_content.insert(fingerprint, filename.to_owned());
            self.loaded_files.insert(filename.to_owned(), src_id);
        }
        self.sources.insert(src_id, filename.map(str::to_owned));
        Ok(())
    }

    pub fn filename(&self, src_id: u64) -> Option<&str> {
        self.sources.get(&src_id).and_then(|f| f.as_deref())
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_sources() {
        let mut sources = Sources::default();
        sources.add_source(1, Some("a.polar"), 10).unwrap();
        // Anonymous documents are never considered duplicates.
        sources.add_source(2, None, 10).unwrap();
        sources.add_source(3, None, 10).unwrap();

        let err = sources.add_source(4, Some("a.polar"), 10).unwrap_err();
        assert!(err.contains("has already been loaded"));

        let err = sources.add_source(5, Some("a.polar"), 11).unwrap_err();
        assert!(err.contains("different contents"));

        let err = sources.add_source(6, Some("b.polar"), 10).unwrap_err();
        assert!(err.contains("same contents"));

        assert_eq!(sources.len(), 3);
        assert_eq!(sources.filename(1), Some("a.polar"));
        assert_eq!(sources.filename(2), None);
    }
}
