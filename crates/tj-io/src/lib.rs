#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};

use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tj_types::{KeyFields, Record, Table, TableError};
use tracing::debug;

const STDIN_PATH: &str = "-";

#[derive(Debug, Error)]
pub enum IoError {
    #[error("{path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{name}: {source}")]
    Read {
        name: String,
        #[source]
        source: csv::Error,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Pattern(#[from] regex::Error),
    #[error("invalid field selector {token:?}: {reason}")]
    InvalidSelector { token: String, reason: &'static str },
    #[error("{name}: column {column:?} not found in header row")]
    UnknownColumn { name: String, column: String },
    #[error("{name}: column names in selector {selector:?} need a header row")]
    NamesWithoutHeader { name: String, selector: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFormat {
    pub delimiter: u8,
    pub has_header: bool,
    /// Lines starting with this byte are ignored.
    pub comment: Option<u8>,
}

impl Default for SourceFormat {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
            comment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SelectorToken {
    Position(usize),
    Range(usize, usize),
    Name(String),
    Pattern(String),
}

/// A parsed, not yet resolved, key selector such as `1,3-4` or `id,name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSelector {
    raw: String,
    tokens: Vec<SelectorToken>,
}

/// Splits a `;`-separated multi-source selector into one string per source.
/// Every segment must name at least one field.
pub fn split_selector_specs(spec: &str) -> Result<Vec<String>, IoError> {
    spec.split(';')
        .map(str::trim)
        .map(|part| {
            if part.is_empty() {
                Err(IoError::InvalidSelector {
                    token: spec.to_owned(),
                    reason: "empty selector between ';' separators",
                })
            } else {
                Ok(part.to_owned())
            }
        })
        .collect()
}

fn parse_position(token: &str) -> Result<usize, IoError> {
    match token.parse::<usize>() {
        Ok(0) => Err(IoError::InvalidSelector {
            token: token.to_owned(),
            reason: "field positions are 1-based",
        }),
        Ok(value) => Ok(value),
        Err(_) => Err(IoError::InvalidSelector {
            token: token.to_owned(),
            reason: "not a field position",
        }),
    }
}

fn is_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

impl FieldSelector {
    /// `fuzzy` turns column names into `*` wildcard patterns.
    pub fn parse(spec: &str, fuzzy: bool) -> Result<Self, IoError> {
        let mut tokens = Vec::new();
        for token in spec.split(',').map(str::trim) {
            if token.is_empty() {
                return Err(IoError::InvalidSelector {
                    token: spec.to_owned(),
                    reason: "empty field",
                });
            }
            if is_digits(token) {
                tokens.push(SelectorToken::Position(parse_position(token)?));
                continue;
            }
            match token.split_once('-') {
                Some((start, end)) if is_digits(start) && is_digits(end) => {
                    let (start, end) = (parse_position(start)?, parse_position(end)?);
                    if start > end {
                        return Err(IoError::InvalidSelector {
                            token: token.to_owned(),
                            reason: "range start is after its end",
                        });
                    }
                    tokens.push(SelectorToken::Range(start, end));
                }
                _ if fuzzy => tokens.push(SelectorToken::Pattern(token.to_owned())),
                _ => tokens.push(SelectorToken::Name(token.to_owned())),
            }
        }
        Ok(Self {
            raw: spec.to_owned(),
            tokens,
        })
    }

    #[must_use]
    pub fn uses_names(&self) -> bool {
        self.tokens
            .iter()
            .any(|token| matches!(token, SelectorToken::Name(_) | SelectorToken::Pattern(_)))
    }

    /// Turns the selector into 1-based positions for one source and checks
    /// them against the source's width.
    pub fn resolve(
        &self,
        name: &str,
        header: Option<&[String]>,
        width: usize,
    ) -> Result<KeyFields, IoError> {
        let header = match header {
            Some(header) => header,
            None if self.uses_names() => {
                return Err(IoError::NamesWithoutHeader {
                    name: name.to_owned(),
                    selector: self.raw.clone(),
                })
            }
            None => &[],
        };

        let mut positions = Vec::new();
        for token in &self.tokens {
            match token {
                SelectorToken::Position(pos) => positions.push(*pos),
                SelectorToken::Range(start, end) => positions.extend(*start..=*end),
                SelectorToken::Name(column) => {
                    let pos = header.iter().position(|h| h == column).ok_or_else(|| {
                        IoError::UnknownColumn {
                            name: name.to_owned(),
                            column: column.clone(),
                        }
                    })?;
                    positions.push(pos + 1);
                }
                SelectorToken::Pattern(pattern) => {
                    let matcher = glob_to_regex(pattern)?;
                    let before = positions.len();
                    positions.extend(
                        header
                            .iter()
                            .enumerate()
                            .filter(|(_, h)| matcher.is_match(h))
                            .map(|(pos, _)| pos + 1),
                    );
                    if positions.len() == before {
                        return Err(IoError::UnknownColumn {
                            name: name.to_owned(),
                            column: pattern.clone(),
                        });
                    }
                }
            }
        }
        let fields = KeyFields::new(positions)?;
        fields.validate_width(name, width)?;
        Ok(fields)
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex, IoError> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Ok(Regex::new(&format!("^{body}$"))?)
}

fn to_record(record: &StringRecord) -> Record {
    record.iter().map(str::to_owned).collect()
}

/// Parses one delimited source. `Ok(None)` means the source had no content at
/// all; a header without rows still yields an (empty) table.
pub fn read_table<R: Read>(
    reader: R,
    name: &str,
    file_index: usize,
    format: &SourceFormat,
    selector: &FieldSelector,
) -> Result<Option<Table>, IoError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(format.delimiter)
        .has_headers(false)
        .comment(format.comment)
        .flexible(false)
        .from_reader(reader);

    let mut header = None;
    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|source| IoError::Read {
            name: name.to_owned(),
            source,
        })?;
        if line == 0 && format.has_header {
            header = Some(to_record(&record));
        } else {
            rows.push(to_record(&record));
        }
    }

    if header.is_none() && rows.is_empty() {
        debug!(source = name, "source has no content");
        return Ok(None);
    }

    let width = match (&header, rows.first()) {
        (Some(header), _) => header.len(),
        (None, Some(row)) => row.len(),
        (None, None) => 0,
    };
    let key_fields = selector.resolve(name, header.as_deref(), width)?;
    debug!(source = name, rows = rows.len(), width, "source parsed");
    Ok(Some(Table::new(name, file_index, header, rows, key_fields)?))
}

/// Opens `path` for reading; `-` is standard input.
pub fn open_source(path: &str) -> Result<Box<dyn Read>, IoError> {
    if path == STDIN_PATH {
        return Ok(Box::new(io::stdin()));
    }
    let file = File::open(path).map_err(|source| IoError::Open {
        path: path.to_owned(),
        source,
    })?;
    Ok(Box::new(BufReader::new(file)))
}

pub fn read_source(
    path: &str,
    file_index: usize,
    format: &SourceFormat,
    selector: &FieldSelector,
) -> Result<Option<Table>, IoError> {
    read_table(open_source(path)?, path, file_index, format, selector)
}

/// Reads extra input paths, one per line. Blank lines are ignored.
pub fn read_infile_list(path: &str) -> Result<Vec<String>, IoError> {
    let reader = BufReader::new(open_source(path)?);
    let mut paths = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            paths.push(line.to_owned());
        }
    }
    Ok(paths)
}

pub fn write_table<W: Write>(
    writer: W,
    header: Option<&[String]>,
    rows: &[Record],
    delimiter: u8,
) -> Result<(), IoError> {
    let mut writer = WriterBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_writer(writer);
    if let Some(header) = header {
        writer.write_record(header)?;
    }
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}
