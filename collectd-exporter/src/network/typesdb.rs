//! Parser for collectd's `types.db` data-set definitions.
//!
//! Each non-comment line names a type followed by its data sources:
//!
//! ```text
//! if_octets    rx:DERIVE:0:U, tx:DERIVE:0:U
//! ```

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

/// types.db errors.
#[derive(Debug, Error)]
pub enum TypesDbError {
    #[error("Failed to read types.db: {0}")]
    Io(#[from] std::io::Error),
    #[error("types.db line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// One data source of a data set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceSpec {
    pub name: String,
    /// Declared type as written, e.g. `DERIVE`.
    pub kind: String,
}

/// Data-set definitions keyed by type name.
#[derive(Debug, Clone, Default)]
pub struct TypesDb {
    types: HashMap<String, Vec<DataSourceSpec>>,
}

impl TypesDb {
    /// Load definitions from a file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, TypesDbError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse definitions from text. Later definitions of a type replace earlier ones.
    pub fn parse(content: &str) -> Result<Self, TypesDbError> {
        let mut types = HashMap::new();

        for (i, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (type_name, rest) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| TypesDbError::Parse {
                    line: i + 1,
                    message: format!("no data sources for {line:?}"),
                })?;

            let sources = rest
                .split(',')
                .map(|spec| parse_data_source(spec.trim()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|message| TypesDbError::Parse {
                    line: i + 1,
                    message,
                })?;

            types.insert(type_name.to_string(), sources);
        }

        Ok(Self { types })
    }

    /// Data-source names for `type_name`, if defined.
    pub fn names(&self, type_name: &str) -> Option<Vec<String>> {
        self.types
            .get(type_name)
            .map(|sources| sources.iter().map(|s| s.name.clone()).collect())
    }

    pub fn get(&self, type_name: &str) -> Option<&[DataSourceSpec]> {
        self.types.get(type_name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

fn parse_data_source(spec: &str) -> Result<DataSourceSpec, String> {
    let fields: Vec<&str> = spec.split(':').collect();
    match fields.as_slice() {
        [name, kind, _min, _max] if !name.is_empty() => Ok(DataSourceSpec {
            name: name.to_string(),
            kind: kind.to_string(),
        }),
        _ => Err(format!("malformed data source {spec:?}")),
    }
}
