#![forbid(unsafe_code)]

//! Drives one join invocation: configuration checks, the seed table, one merge
//! step per remaining source, and the final header plus rows.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use tj_join::{
    append_unseen_keys, JoinError, JoinExecutionOptions, MergePlan, MergeSpec, MergeTrace,
    RunningResult,
};
use tj_key::{KeyError, KeyOptions, Keyspace};
use tj_names::{HeaderResolver, NameError, NamingPolicy};
use tj_runtime::{DecisionAction, EvidenceLedger, RuntimePolicy};
use tj_types::{JoinMode, Record, Table};

/// Source name that reads standard input.
pub const STDIN_SOURCE: &str = "-";

/// Selector used when none is given: the first column of every source.
pub const DEFAULT_SELECTOR: &str = "1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("two or more sources needed (got {0})")]
    TooFewSources(usize),
    #[error("number of key selectors ({found}) should be equal to number of sources ({expected})")]
    SelectorCountMismatch { expected: usize, found: usize },
    #[error("left join and outer join are mutually exclusive")]
    ConflictingJoinModes,
    #[error("stdin not allowed when using outer join")]
    StreamingSourceWithOuterJoin,
    #[error(transparent)]
    Naming(#[from] NameError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Naming(#[from] NameError),
    #[error("{name}: {source}")]
    Keyspace {
        name: String,
        #[source]
        source: KeyError,
    },
    #[error("{name}: merge step would emit {rows} rows, above the cap of {cap}")]
    RowCapExceeded {
        name: String,
        rows: usize,
        cap: usize,
    },
    #[error("keyspace can only be observed while seeding (session is {0:?})")]
    KeyspaceClosed(SessionState),
}

/// Everything that shapes the join itself, independent of where rows come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinConfig {
    pub mode: JoinMode,
    /// Keep unmatched first-table rows even in an inner join.
    pub keep_unmatched: bool,
    pub key: KeyOptions,
    pub na: String,
    pub naming: NamingPolicy,
    pub no_out_header: bool,
    pub execution: JoinExecutionOptions,
    pub runtime: RuntimePolicy,
}

impl JoinConfig {
    #[must_use]
    pub fn keeps_unmatched(&self) -> bool {
        self.keep_unmatched || self.mode.keeps_unmatched()
    }

    #[must_use]
    pub fn merge_spec(&self) -> MergeSpec {
        MergeSpec {
            keep_unmatched: self.keeps_unmatched(),
            na: self.na.clone(),
            key: self.key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub path: String,
    /// Unresolved field selector for this source.
    pub selector: String,
}

impl SourceSpec {
    #[must_use]
    pub fn is_stdin(&self) -> bool {
        self.path == STDIN_SOURCE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPlan {
    pub config: JoinConfig,
    pub sources: Vec<SourceSpec>,
}

/// Raw option values as they arrive from a command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinFlags {
    pub sources: Vec<String>,
    /// One selector per source, or a single selector shared by all.
    pub selectors: Vec<String>,
    pub left_join: bool,
    pub outer_join: bool,
    pub keep_unmatched: bool,
    pub ignore_case: bool,
    pub ignore_null: bool,
    pub na: String,
    pub prefix_filename: bool,
    pub prefix_trim_ext: bool,
    pub only_duplicates: bool,
    pub suffixes: Vec<String>,
    pub no_out_header: bool,
    pub max_rows: Option<usize>,
    pub execution: JoinExecutionOptions,
}

impl JoinFlags {
    pub fn into_plan(self) -> Result<JoinPlan, ConfigError> {
        let source_count = self.sources.len();
        if source_count < 2 {
            return Err(ConfigError::TooFewSources(source_count));
        }

        let selectors = broadcast_selectors(self.selectors, source_count)?;

        let mode = match (self.left_join, self.outer_join) {
            (true, true) => return Err(ConfigError::ConflictingJoinModes),
            (true, false) => JoinMode::Left,
            (false, true) => JoinMode::Outer,
            (false, false) => JoinMode::Inner,
        };
        if mode.needs_keyspace() && self.sources.iter().any(|path| path == STDIN_SOURCE) {
            return Err(ConfigError::StreamingSourceWithOuterJoin);
        }

        let naming = NamingPolicy::from_flags(
            self.prefix_filename,
            self.prefix_trim_ext,
            self.suffixes,
            self.only_duplicates,
            source_count,
        )?;

        let runtime = match self.max_rows {
            Some(cap) => RuntimePolicy::hardened(Some(cap)),
            None => RuntimePolicy::strict(),
        };

        let config = JoinConfig {
            mode,
            keep_unmatched: self.keep_unmatched,
            key: KeyOptions {
                case_insensitive: self.ignore_case,
                ignore_null: self.ignore_null,
            },
            na: self.na,
            naming,
            no_out_header: self.no_out_header,
            execution: self.execution,
            runtime,
        };
        let sources = self
            .sources
            .into_iter()
            .zip(selectors)
            .map(|(path, selector)| SourceSpec { path, selector })
            .collect();
        Ok(JoinPlan { config, sources })
    }
}

fn broadcast_selectors(
    selectors: Vec<String>,
    source_count: usize,
) -> Result<Vec<String>, ConfigError> {
    match selectors.len() {
        0 => Ok(vec![DEFAULT_SELECTOR.to_owned(); source_count]),
        1 => Ok(vec![selectors[0].clone(); source_count]),
        n if n == source_count => Ok(selectors),
        found => Err(ConfigError::SelectorCountMismatch {
            expected: source_count,
            found,
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Seeding,
    Merging,
    Emitting,
}

/// The combined table handed to the writer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedTable {
    pub header: Option<Record>,
    pub rows: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub source: String,
    pub input_rows: usize,
    pub trace: MergeTrace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub config: JoinConfig,
    pub seed: Option<String>,
    pub skipped_sources: Vec<String>,
    pub synthesized_rows: usize,
    pub steps: Vec<StepReport>,
    pub output_rows: usize,
    pub output_columns: usize,
    pub ledger: EvidenceLedger,
}

impl RunReport {
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug)]
pub struct JoinSession {
    config: JoinConfig,
    state: SessionState,
    result: Option<RunningResult>,
    header: HeaderResolver,
    keyspace: Option<Keyspace>,
    ledger: EvidenceLedger,
    seed: Option<String>,
    skipped_sources: Vec<String>,
    synthesized_rows: usize,
    steps: Vec<StepReport>,
}

impl JoinSession {
    #[must_use]
    pub fn new(config: JoinConfig) -> Self {
        let keyspace = config
            .mode
            .needs_keyspace()
            .then(|| Keyspace::new(config.key));
        Self {
            header: HeaderResolver::new(config.naming.clone()),
            config,
            state: SessionState::Seeding,
            result: None,
            keyspace,
            ledger: EvidenceLedger::new(),
            seed: None,
            skipped_sources: Vec::new(),
            synthesized_rows: 0,
            steps: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn needs_keyspace(&self) -> bool {
        self.keyspace.is_some()
    }

    /// Keyspace pass for outer joins: every source, seed included, must be
    /// observed before the first `push`. A no-op for inner and left joins.
    pub fn observe(&mut self, table: &Table) -> Result<(), SessionError> {
        if self.state != SessionState::Seeding {
            return Err(SessionError::KeyspaceClosed(self.state));
        }
        if let Some(keyspace) = self.keyspace.as_mut() {
            let added = keyspace
                .collect_table(table)
                .map_err(|source| SessionError::Keyspace {
                    name: table.name().to_owned(),
                    source,
                })?;
            debug!(source = table.name(), added, "keyspace updated");
        }
        Ok(())
    }

    /// Seeds the result with the first non-empty table, then merges each later
    /// one. Tables without data rows are skipped.
    pub fn push(&mut self, table: Table) -> Result<(), SessionError> {
        if table.is_empty() {
            self.skip_empty(table.name(), "no data rows");
            return Ok(());
        }

        match self.result.take() {
            None => self.seed(table),
            Some(result) => self.merge(result, table),
        }
    }

    /// Records a source that is left out of the join. The state does not move.
    pub fn skip_empty(&mut self, name: &str, detail: &str) {
        self.config
            .runtime
            .decide_empty_source(name, detail, &mut self.ledger);
        self.skipped_sources.push(name.to_owned());
    }

    fn seed(&mut self, table: Table) -> Result<(), SessionError> {
        self.header.seed(&table)?;
        info!(source = table.name(), rows = table.len(), "seeding join result");
        self.seed = Some(table.name().to_owned());

        let name = table.name().to_owned();
        if let Some(keyspace) = self.keyspace.as_mut() {
            keyspace
                .mark_seed(table.rows(), table.key_fields())
                .map_err(|source| SessionError::Keyspace {
                    name: name.clone(),
                    source,
                })?;
        }

        let mut result = RunningResult::seed(table);
        if let Some(keyspace) = self.keyspace.as_ref() {
            self.synthesized_rows = append_unseen_keys(&mut result, keyspace, &self.config.na);
            self.config.runtime.note_keyspace_synthesis(
                keyspace.len(),
                self.synthesized_rows,
                &mut self.ledger,
            );
        }

        self.result = Some(result);
        self.state = SessionState::Merging;
        Ok(())
    }

    fn merge(&mut self, result: RunningResult, table: Table) -> Result<(), SessionError> {
        let spec = self.config.merge_spec();
        let plan = MergePlan::build(&result, &table, &spec)?;

        let skipped = plan.index().skipped_rows();
        if skipped > 0 {
            self.config
                .runtime
                .note_null_keys(table.name(), skipped, &mut self.ledger);
        }

        let rows = plan.output_rows();
        let action = self
            .config
            .runtime
            .decide_join_admission(table.name(), rows, &mut self.ledger);
        if action == DecisionAction::Reject {
            return Err(SessionError::RowCapExceeded {
                name: table.name().to_owned(),
                rows,
                cap: self.config.runtime.join_row_cap.unwrap_or(rows),
            });
        }

        let (merged, trace) = plan.execute(self.config.execution);
        self.header.extend(&table)?;
        info!(
            source = table.name(),
            input_rows = table.len(),
            output_rows = trace.output_rows,
            matched = trace.matched_rows,
            unmatched = trace.unmatched_rows,
            "merged source"
        );
        self.steps.push(StepReport {
            source: table.name().to_owned(),
            input_rows: table.len(),
            trace,
        });
        self.result = Some(merged);
        Ok(())
    }

    /// Ends the session and yields the output table with its run report.
    #[must_use]
    pub fn finish(mut self) -> (JoinedTable, RunReport) {
        self.state = SessionState::Emitting;
        let rows = self
            .result
            .take()
            .map(RunningResult::into_rows)
            .unwrap_or_default();
        let header = if self.config.no_out_header {
            None
        } else {
            self.header.finish()
        };

        let report = RunReport {
            output_rows: rows.len(),
            output_columns: header
                .as_ref()
                .map(Vec::len)
                .or_else(|| rows.first().map(Vec::len))
                .unwrap_or(0),
            config: self.config,
            seed: self.seed,
            skipped_sources: self.skipped_sources,
            synthesized_rows: self.synthesized_rows,
            steps: self.steps,
            ledger: self.ledger,
        };
        (JoinedTable { header, rows }, report)
    }
}

/// Joins fully loaded tables in order. Outer joins run the keyspace pass over
/// all of them first.
pub fn join_tables(
    tables: Vec<Table>,
    config: JoinConfig,
) -> Result<(JoinedTable, RunReport), SessionError> {
    if tables.len() < 2 {
        return Err(ConfigError::TooFewSources(tables.len()).into());
    }
    let mut session = JoinSession::new(config);
    if session.needs_keyspace() {
        for table in &tables {
            session.observe(table)?;
        }
    }
    for table in tables {
        session.push(table)?;
    }
    Ok(session.finish())
}
