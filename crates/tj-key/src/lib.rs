#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tj_types::{KeyFields, Record, Table};

/// Joins key components into one composite string.
///
/// Reserved, not escaped: a field containing this sequence can alias a
/// different component split.
pub const KEY_SEPARATOR: &str = "\u{1f}tj\u{1f}";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeKey(String);

impl CompositeKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.replace(KEY_SEPARATOR, "|"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOptions {
    /// Fold the composite to lower case before comparison. Emitted fields keep
    /// their original spelling.
    pub case_insensitive: bool,
    /// Rows whose key components are all empty never match anything.
    pub ignore_null: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key field {field} out of range (row has {width} fields)")]
    FieldOutOfRange { field: usize, width: usize },
    #[error("row {row}: {source}")]
    Row {
        row: usize,
        #[source]
        source: Box<KeyError>,
    },
}

impl KeyError {
    fn at_row(self, row: usize) -> Self {
        Self::Row {
            row,
            source: Box::new(self),
        }
    }
}

fn key_parts<'a>(row: &'a [String], fields: &KeyFields) -> Result<Vec<&'a str>, KeyError> {
    fields
        .positions()
        .iter()
        .map(|&field| {
            row.get(field - 1)
                .map(String::as_str)
                .ok_or(KeyError::FieldOutOfRange {
                    field,
                    width: row.len(),
                })
        })
        .collect()
}

fn compose(parts: &[&str], options: KeyOptions) -> Option<CompositeKey> {
    if options.ignore_null && parts.iter().all(|part| part.is_empty()) {
        return None;
    }
    let joined = parts.join(KEY_SEPARATOR);
    if options.case_insensitive {
        Some(CompositeKey(joined.to_lowercase()))
    } else {
        Some(CompositeKey(joined))
    }
}

/// Builds the composite key of `row`. `Ok(None)` means the row is excluded from
/// matching by the ignore-null option.
pub fn extract_key(
    row: &[String],
    fields: &KeyFields,
    options: KeyOptions,
) -> Result<Option<CompositeKey>, KeyError> {
    let parts = key_parts(row, fields)?;
    Ok(compose(&parts, options))
}

/// Keys of every row in order; row numbers in errors are 1-based.
pub fn extract_keys(
    rows: &[Record],
    fields: &KeyFields,
    options: KeyOptions,
) -> Result<Vec<Option<CompositeKey>>, KeyError> {
    rows.iter()
        .enumerate()
        .map(|(pos, row)| extract_key(row, fields, options).map_err(|err| err.at_row(pos + 1)))
        .collect()
}

/// Key → row positions for one table, in input order. Built per merge step.
#[derive(Debug, Default, Clone)]
pub struct KeyIndex {
    slots: HashMap<CompositeKey, Vec<usize>>,
    indexed_rows: usize,
    skipped_rows: usize,
}

impl KeyIndex {
    pub fn build(
        rows: &[Record],
        fields: &KeyFields,
        options: KeyOptions,
    ) -> Result<Self, KeyError> {
        let mut index = Self {
            slots: HashMap::with_capacity(rows.len()),
            ..Self::default()
        };
        for (pos, row) in rows.iter().enumerate() {
            match extract_key(row, fields, options).map_err(|err| err.at_row(pos + 1))? {
                Some(key) => {
                    index.slots.entry(key).or_default().push(pos);
                    index.indexed_rows += 1;
                }
                None => index.skipped_rows += 1,
            }
        }
        Ok(index)
    }

    #[must_use]
    pub fn get(&self, key: &CompositeKey) -> Option<&[usize]> {
        self.slots.get(key).map(Vec::as_slice)
    }

    #[must_use]
    pub fn distinct_keys(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn indexed_rows(&self) -> usize {
        self.indexed_rows
    }

    /// Rows left out by ignore-null.
    #[must_use]
    pub fn skipped_rows(&self) -> usize {
        self.skipped_rows
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceEntry {
    components: Vec<String>,
    seen_in_seed: bool,
}

impl KeyspaceEntry {
    /// Key components as spelled by the first row that produced the key.
    #[must_use]
    pub fn components(&self) -> &[String] {
        &self.components
    }

    #[must_use]
    pub fn seen_in_seed(&self) -> bool {
        self.seen_in_seed
    }
}

/// Every distinct key across all sources, kept in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct Keyspace {
    order: Vec<CompositeKey>,
    entries: HashMap<CompositeKey, KeyspaceEntry>,
    options: KeyOptions,
}

impl Keyspace {
    #[must_use]
    pub fn new(options: KeyOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Records the keys of one source. Returns how many keys were new.
    pub fn collect(&mut self, rows: &[Record], fields: &KeyFields) -> Result<usize, KeyError> {
        let mut added = 0;
        for (pos, row) in rows.iter().enumerate() {
            let parts = key_parts(row, fields).map_err(|err| err.at_row(pos + 1))?;
            let Some(key) = compose(&parts, self.options) else {
                continue;
            };
            if self.entries.contains_key(&key) {
                continue;
            }
            self.entries.insert(
                key.clone(),
                KeyspaceEntry {
                    components: parts.iter().map(|part| (*part).to_owned()).collect(),
                    seen_in_seed: false,
                },
            );
            self.order.push(key);
            added += 1;
        }
        Ok(added)
    }

    pub fn collect_table(&mut self, table: &Table) -> Result<usize, KeyError> {
        self.collect(table.rows(), table.key_fields())
    }

    /// Flags every key present in the seed rows. Keys still unflagged afterwards
    /// need a placeholder row.
    pub fn mark_seed(&mut self, rows: &[Record], fields: &KeyFields) -> Result<(), KeyError> {
        for key in extract_keys(rows, fields, self.options)?.into_iter().flatten() {
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.seen_in_seed = true;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Entries not present in the seed, in first-seen order.
    pub fn unseen(&self) -> impl Iterator<Item = &KeyspaceEntry> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key))
            .filter(|entry| !entry.seen_in_seed)
    }
}

/// One pass over every table, first included.
pub fn build_keyspace<'a>(
    tables: impl IntoIterator<Item = &'a Table>,
    options: KeyOptions,
) -> Result<Keyspace, KeyError> {
    let mut keyspace = Keyspace::new(options);
    for table in tables {
        keyspace.collect_table(table)?;
    }
    Ok(keyspace)
}
