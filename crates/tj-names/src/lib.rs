#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tj_types::{KeyFields, Table};

/// Extensions peeled before the data extension when trimming a file name.
const COMPRESSION_EXTENSIONS: [&str; 5] = [".gz", ".xz", ".zst", ".bz2", ".lz4"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("prefix-by-filename and suffix naming are mutually exclusive")]
    ConflictingModes,
    #[error("number of suffixes ({found}) should be equal to number of sources ({expected})")]
    SuffixCountMismatch { expected: usize, found: usize },
    #[error("no suffix configured for source #{file_index}")]
    MissingSuffix { file_index: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ColumnNaming {
    #[default]
    None,
    PrefixFilename {
        trim_extension: bool,
    },
    Suffix {
        suffixes: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingPolicy {
    pub naming: ColumnNaming,
    /// Decorate a name only when an earlier source already used it.
    pub only_duplicates: bool,
}

impl NamingPolicy {
    pub fn from_flags(
        prefix_filename: bool,
        trim_extension: bool,
        suffixes: Vec<String>,
        only_duplicates: bool,
        source_count: usize,
    ) -> Result<Self, NameError> {
        let naming = match (prefix_filename, suffixes.is_empty()) {
            (true, false) => return Err(NameError::ConflictingModes),
            (true, true) => ColumnNaming::PrefixFilename { trim_extension },
            (false, false) => {
                if suffixes.len() != source_count {
                    return Err(NameError::SuffixCountMismatch {
                        expected: source_count,
                        found: suffixes.len(),
                    });
                }
                ColumnNaming::Suffix { suffixes }
            }
            (false, true) => ColumnNaming::None,
        };
        Ok(Self {
            naming,
            only_duplicates,
        })
    }

    /// Prefix and suffix modes always produce a header, even for header-less input.
    #[must_use]
    pub fn decorates(&self) -> bool {
        !matches!(self.naming, ColumnNaming::None)
    }

    fn decorate(
        &self,
        name: &str,
        table: &Table,
        registry: &mut NameRegistry,
    ) -> Result<String, NameError> {
        if !self.decorates() {
            return Ok(name.to_owned());
        }
        if self.only_duplicates && registry.claim(name) {
            return Ok(name.to_owned());
        }
        match &self.naming {
            ColumnNaming::None => Ok(name.to_owned()),
            ColumnNaming::PrefixFilename { trim_extension } => Ok(format!(
                "{}-{name}",
                file_identifier(table.name(), *trim_extension)
            )),
            ColumnNaming::Suffix { suffixes } => suffixes
                .get(table.file_index())
                .map(|suffix| format!("{name}-{suffix}"))
                .ok_or(NameError::MissingSuffix {
                    file_index: table.file_index(),
                }),
        }
    }
}

/// Base names already handed out during one join.
#[derive(Debug, Clone, Default)]
pub struct NameRegistry {
    used: HashSet<String>,
}

impl NameRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `name` had not been claimed before.
    pub fn claim(&mut self, name: &str) -> bool {
        self.used.insert(name.to_owned())
    }
}

/// Base file name of `path`, optionally with its extension removed
/// (`dir/b.csv.gz` → `b`).
#[must_use]
pub fn file_identifier(path: &str, trim_extension: bool) -> String {
    let base = Path::new(path)
        .file_name()
        .map_or_else(|| path.to_owned(), |name| name.to_string_lossy().into_owned());
    if !trim_extension {
        return base;
    }

    let mut stem = base.as_str();
    if let Some(ext) = COMPRESSION_EXTENSIONS
        .iter()
        .find(|ext| stem.len() > ext.len() && stem.ends_with(*ext))
    {
        stem = &stem[..stem.len() - ext.len()];
    }
    match stem.rfind('.') {
        Some(dot) if dot > 0 => stem[..dot].to_owned(),
        _ => stem.to_owned(),
    }
}

/// Names for a header-less table: `key<j>` for key columns in selector order,
/// `c<pos>` for the rest.
#[must_use]
pub fn synthetic_names(width: usize, key_fields: &KeyFields) -> Vec<String> {
    (1..=width)
        .map(|pos| match key_fields.component_index(pos) {
            Some(component) => format!("key{}", component + 1),
            None => format!("c{pos}"),
        })
        .collect()
}

fn column_names(table: &Table) -> Vec<String> {
    match table.header() {
        Some(header) => header.to_vec(),
        None => synthetic_names(table.width(), table.key_fields()),
    }
}

/// Appends the non-key columns `table` contributes to `existing`.
pub fn resolve_header(
    existing: &[String],
    table: &Table,
    policy: &NamingPolicy,
    registry: &mut NameRegistry,
) -> Result<Vec<String>, NameError> {
    let mut header = existing.to_vec();
    for (pos, name) in column_names(table).iter().enumerate() {
        if table.key_fields().contains(pos + 1) {
            continue;
        }
        header.push(policy.decorate(name, table, registry)?);
    }
    Ok(header)
}

/// Tracks the output header from the seed table through every merge step.
#[derive(Debug, Clone)]
pub struct HeaderResolver {
    policy: NamingPolicy,
    registry: NameRegistry,
    columns: Vec<String>,
    seed_has_header: bool,
}

impl HeaderResolver {
    #[must_use]
    pub fn new(policy: NamingPolicy) -> Self {
        Self {
            policy,
            registry: NameRegistry::new(),
            columns: Vec::new(),
            seed_has_header: false,
        }
    }

    /// Starts the header from the seed table. Its key columns keep their names;
    /// its other columns go through the naming policy like every later source.
    pub fn seed(&mut self, table: &Table) -> Result<(), NameError> {
        self.seed_has_header = table.header().is_some();
        let mut columns = Vec::with_capacity(table.width());
        for (pos, name) in column_names(table).into_iter().enumerate() {
            if table.key_fields().contains(pos + 1) {
                columns.push(name);
            } else {
                columns.push(self.policy.decorate(&name, table, &mut self.registry)?);
            }
        }
        self.columns = columns;
        Ok(())
    }

    pub fn extend(&mut self, table: &Table) -> Result<(), NameError> {
        self.columns = resolve_header(&self.columns, table, &self.policy, &mut self.registry)?;
        Ok(())
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// The output header, if one should be written at all.
    #[must_use]
    pub fn finish(self) -> Option<Vec<String>> {
        (self.seed_has_header || self.policy.decorates()).then_some(self.columns)
    }
}
