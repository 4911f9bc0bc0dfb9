#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One parsed row: an ordered sequence of text fields.
pub type Record = Vec<String>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    #[default]
    Inner,
    Left,
    Outer,
}

impl JoinMode {
    /// Whether first-table rows without a partner survive a merge step.
    #[must_use]
    pub fn keeps_unmatched(self) -> bool {
        !matches!(self, Self::Inner)
    }

    #[must_use]
    pub fn needs_keyspace(self) -> bool {
        matches!(self, Self::Outer)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("key field list must not be empty")]
    EmptyKeyFields,
    #[error("field positions are 1-based, found 0")]
    ZeroFieldPosition,
    #[error("{name}: field {field} out of range (table has {width} fields)")]
    FieldOutOfRange {
        name: String,
        field: usize,
        width: usize,
    },
}

/// Resolved 1-based key field positions for one table, in selector order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyFields(Vec<usize>);

impl KeyFields {
    pub fn new(positions: Vec<usize>) -> Result<Self, TableError> {
        if positions.is_empty() {
            return Err(TableError::EmptyKeyFields);
        }
        if positions.contains(&0) {
            return Err(TableError::ZeroFieldPosition);
        }
        Ok(Self(positions))
    }

    #[must_use]
    pub fn positions(&self) -> &[usize] {
        &self.0
    }

    /// Number of key components, which must agree across all tables.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn contains(&self, position: usize) -> bool {
        self.0.contains(&position)
    }

    /// Number of distinct columns consumed by the key. A selector may name the
    /// same column twice; it still only removes one column from a table.
    #[must_use]
    pub fn distinct_count(&self) -> usize {
        self.0.iter().collect::<BTreeSet<_>>().len()
    }

    #[must_use]
    pub fn max_position(&self) -> usize {
        self.0.iter().copied().max().unwrap_or(0)
    }

    /// Selector index of the first component that reads `position`.
    #[must_use]
    pub fn component_index(&self, position: usize) -> Option<usize> {
        self.0.iter().position(|p| *p == position)
    }

    pub fn validate_width(&self, name: &str, width: usize) -> Result<(), TableError> {
        match self.0.iter().find(|p| **p > width) {
            Some(field) => Err(TableError::FieldOutOfRange {
                name: name.to_owned(),
                field: *field,
                width,
            }),
            None => Ok(()),
        }
    }
}

/// A fully parsed source: optional header, rows, and its key fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: String,
    file_index: usize,
    header: Option<Record>,
    rows: Vec<Record>,
    key_fields: KeyFields,
}

impl Table {
    /// Builds a table and checks the key fields against the header width, or
    /// the first row's width when there is no header.
    pub fn new(
        name: impl Into<String>,
        file_index: usize,
        header: Option<Record>,
        rows: Vec<Record>,
        key_fields: KeyFields,
    ) -> Result<Self, TableError> {
        let table = Self {
            name: name.into(),
            file_index,
            header,
            rows,
            key_fields,
        };
        if table.header.is_some() || !table.rows.is_empty() {
            table.key_fields.validate_width(&table.name, table.width())?;
        }
        Ok(table)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Zero-based position of the source in the join order.
    #[must_use]
    pub fn file_index(&self) -> usize {
        self.file_index
    }

    #[must_use]
    pub fn header(&self) -> Option<&[String]> {
        self.header.as_deref()
    }

    #[must_use]
    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    #[must_use]
    pub fn key_fields(&self) -> &KeyFields {
        &self.key_fields
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn width(&self) -> usize {
        match (&self.header, self.rows.first()) {
            (Some(header), _) => header.len(),
            (None, Some(row)) => row.len(),
            (None, None) => 0,
        }
    }

    /// Columns a merge step appends when this table joins the result.
    #[must_use]
    pub fn non_key_width(&self) -> usize {
        self.width().saturating_sub(self.key_fields.distinct_count())
    }

    #[must_use]
    pub fn into_parts(self) -> (Option<Record>, Vec<Record>, KeyFields) {
        (self.header, self.rows, self.key_fields)
    }
}
