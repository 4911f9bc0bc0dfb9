#![forbid(unsafe_code)]

use std::{iter, mem::size_of};

use bumpalo::{collections::Vec as BumpVec, Bump};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tj_key::{extract_keys, CompositeKey, KeyError, KeyIndex, KeyOptions, Keyspace};
use tj_types::{KeyFields, Record, Table};

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("{name}: {source}")]
    Key {
        name: String,
        #[source]
        source: KeyError,
    },
    #[error("{name}: key selects {found} fields but the first table's key selects {expected}")]
    KeyArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for JoinExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

/// Per-step policy: what happens to result rows without a partner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSpec {
    pub keep_unmatched: bool,
    pub na: String,
    pub key: KeyOptions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeTrace {
    pub used_arena: bool,
    pub output_rows: usize,
    pub estimated_bytes: usize,
    pub matched_rows: usize,
    pub unmatched_rows: usize,
}

/// The combined rows accumulated so far. Key positions always refer to the
/// seed table's columns, which stay at the front of every row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningResult {
    rows: Vec<Record>,
    key_fields: KeyFields,
    width: usize,
}

impl RunningResult {
    #[must_use]
    pub fn seed(table: Table) -> Self {
        let width = table.width();
        let (_, rows, key_fields) = table.into_parts();
        Self {
            rows,
            key_fields,
            width,
        }
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
    pub fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<Record> {
        self.rows
    }
}

/// Appends one placeholder row per keyspace key the seed never produced. Key
/// columns carry the key components, every other column the na text.
pub fn append_unseen_keys(result: &mut RunningResult, keyspace: &Keyspace, na: &str) -> usize {
    let before = result.rows.len();
    for entry in keyspace.unseen() {
        let mut record = vec![na.to_owned(); result.width];
        for (component, position) in entry.components().iter().zip(result.key_fields.positions()) {
            if let Some(slot) = record.get_mut(position - 1) {
                slot.clone_from(component);
            }
        }
        result.rows.push(record);
    }
    result.rows.len() - before
}

/// A merge step whose index is built and whose output size is known, but whose
/// rows are not yet materialized.
#[derive(Debug)]
pub struct MergePlan<'a> {
    result: &'a RunningResult,
    table: &'a Table,
    spec: &'a MergeSpec,
    result_keys: Vec<Option<CompositeKey>>,
    index: KeyIndex,
    output_rows: usize,
}

impl<'a> MergePlan<'a> {
    pub fn build(
        result: &'a RunningResult,
        table: &'a Table,
        spec: &'a MergeSpec,
    ) -> Result<Self, JoinError> {
        let expected = result.key_fields.arity();
        let found = table.key_fields().arity();
        if expected != found {
            return Err(JoinError::KeyArityMismatch {
                name: table.name().to_owned(),
                expected,
                found,
            });
        }

        let index =
            KeyIndex::build(table.rows(), table.key_fields(), spec.key).map_err(|source| {
                JoinError::Key {
                    name: table.name().to_owned(),
                    source,
                }
            })?;
        let result_keys =
            extract_keys(&result.rows, &result.key_fields, spec.key).map_err(|source| {
                JoinError::Key {
                    name: "joined result".to_owned(),
                    source,
                }
            })?;

        let mut plan = Self {
            result,
            table,
            spec,
            result_keys,
            index,
            output_rows: 0,
        };
        plan.output_rows = plan.estimate_output_rows();
        Ok(plan)
    }

    /// Exact row count the step will emit.
    #[must_use]
    pub fn output_rows(&self) -> usize {
        self.output_rows
    }

    #[must_use]
    pub fn index(&self) -> &KeyIndex {
        &self.index
    }

    fn estimate_output_rows(&self) -> usize {
        self.result_keys
            .iter()
            .map(|key| match self.lookup(key) {
                Some(matches) => matches.len(),
                None if self.spec.keep_unmatched => 1,
                None => 0,
            })
            .sum()
    }

    fn lookup(&self, key: &Option<CompositeKey>) -> Option<&[usize]> {
        key.as_ref().and_then(|key| self.index.get(key))
    }

    fn walk_pairs(&self, mut emit: impl FnMut(usize, Option<usize>)) {
        for (result_pos, key) in self.result_keys.iter().enumerate() {
            if let Some(matches) = self.lookup(key) {
                for table_pos in matches {
                    emit(result_pos, Some(*table_pos));
                }
                continue;
            }

            if self.spec.keep_unmatched {
                emit(result_pos, None);
            }
        }
    }

    pub fn execute(self, options: JoinExecutionOptions) -> (RunningResult, MergeTrace) {
        let estimated_bytes = estimate_intermediate_bytes(self.output_rows);
        let use_arena = options.use_arena && estimated_bytes <= options.arena_budget_bytes;

        let rows = if use_arena {
            let arena = Bump::new();
            let mut pairs = BumpVec::with_capacity_in(self.output_rows, &arena);
            self.walk_pairs(|result_pos, table_pos| pairs.push((result_pos, table_pos)));
            self.materialize(&pairs)
        } else {
            let mut pairs = Vec::with_capacity(self.output_rows);
            self.walk_pairs(|result_pos, table_pos| pairs.push((result_pos, table_pos)));
            self.materialize(&pairs)
        };

        let matched_rows = self.matched_rows();
        let trace = MergeTrace {
            used_arena: use_arena,
            output_rows: rows.len(),
            estimated_bytes,
            matched_rows,
            unmatched_rows: rows.len() - matched_rows,
        };
        let merged = RunningResult {
            rows,
            key_fields: self.result.key_fields.clone(),
            width: self.result.width + self.table.non_key_width(),
        };
        (merged, trace)
    }

    fn matched_rows(&self) -> usize {
        self.result_keys
            .iter()
            .filter_map(|key| self.lookup(key))
            .map(<[usize]>::len)
            .sum()
    }

    fn materialize(&self, pairs: &[(usize, Option<usize>)]) -> Vec<Record> {
        let pad = self.table.non_key_width();
        let key_fields = self.table.key_fields();
        pairs
            .iter()
            .map(|&(result_pos, table_pos)| {
                let base = &self.result.rows[result_pos];
                let mut row = Vec::with_capacity(base.len() + pad);
                row.extend(base.iter().cloned());
                match table_pos {
                    Some(table_pos) => row.extend(
                        self.table.rows()[table_pos]
                            .iter()
                            .enumerate()
                            .filter(|(pos, _)| !key_fields.contains(pos + 1))
                            .map(|(_, value)| value.clone()),
                    ),
                    None => row.extend(iter::repeat(self.spec.na.clone()).take(pad)),
                }
                row
            })
            .collect()
    }
}

fn estimate_intermediate_bytes(output_rows: usize) -> usize {
    output_rows.saturating_mul(size_of::<(usize, Option<usize>)>())
}

/// Builds the index over `table` and merges it against `result` in one call.
pub fn merge_table(
    result: &RunningResult,
    table: &Table,
    spec: &MergeSpec,
    options: JoinExecutionOptions,
) -> Result<(RunningResult, MergeTrace), JoinError> {
    Ok(MergePlan::build(result, table, spec)?.execute(options))
}

#[cfg(test)]
mod tests {
    use tj_key::{build_keyspace, KeyOptions};
    use tj_types::{KeyFields, Table};

    use super::{
        append_unseen_keys, merge_table, JoinError, JoinExecutionOptions, MergePlan, MergeSpec,
        RunningResult,
    };

    fn rec(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| (*f).to_owned()).collect()
    }

    fn table(name: &str, index: usize, rows: &[&[&str]], key: &[usize]) -> Table {
        Table::new(
            name,
            index,
            None,
            rows.iter().map(|row| rec(row)).collect(),
            KeyFields::new(key.to_vec()).expect("fields"),
        )
        .expect("table")
    }

    fn spec(keep_unmatched: bool, na: &str) -> MergeSpec {
        MergeSpec {
            keep_unmatched,
            na: na.to_owned(),
            key: KeyOptions::default(),
        }
    }

    fn global() -> JoinExecutionOptions {
        JoinExecutionOptions {
            use_arena: false,
            arena_budget_bytes: 0,
        }
    }

    #[test]
    fn inner_merge_keeps_only_matched_rows() {
        let a = table("a", 0, &[&["1", "10"], &["2", "20"]], &[1]);
        let b = table("b", 1, &[&["1", "100"], &["3", "300"]], &[1]);
        let result = RunningResult::seed(a);

        let (out, trace) = merge_table(&result, &b, &spec(false, ""), JoinExecutionOptions::default())
            .expect("merge");
        assert_eq!(out.rows(), &[rec(&["1", "10", "100"])]);
        assert_eq!(out.width(), 3);
        assert_eq!(trace.matched_rows, 1);
        assert_eq!(trace.unmatched_rows, 0);
    }

    #[test]
    fn left_merge_pads_unmatched_with_na() {
        let a = table("a", 0, &[&["1", "10"], &["2", "20"]], &[1]);
        let b = table("b", 1, &[&["1", "100", "u"], &["3", "300", "v"]], &[1]);
        let result = RunningResult::seed(a);

        let (out, trace) =
            merge_table(&result, &b, &spec(true, "NA"), global()).expect("merge");
        assert_eq!(
            out.rows(),
            &[rec(&["1", "10", "100", "u"]), rec(&["2", "20", "NA", "NA"])]
        );
        assert_eq!(trace.unmatched_rows, 1);
    }

    #[test]
    fn duplicate_keys_fan_out_in_table_order() {
        let a = table("a", 0, &[&["k", "1"], &["k", "2"], &["x", "3"]], &[1]);
        let b = table("b", 1, &[&["k", "10"], &["k", "20"]], &[1]);
        let result = RunningResult::seed(a);

        let (out, _) = merge_table(&result, &b, &spec(false, ""), global()).expect("merge");
        assert_eq!(
            out.rows(),
            &[
                rec(&["k", "1", "10"]),
                rec(&["k", "1", "20"]),
                rec(&["k", "2", "10"]),
                rec(&["k", "2", "20"]),
            ]
        );
    }

    #[test]
    fn key_columns_of_new_table_are_dropped_wherever_they_sit() {
        let a = table("a", 0, &[&["1", "a"]], &[1]);
        let b = table("b", 1, &[&["p", "1", "q"]], &[2]);
        let result = RunningResult::seed(a);

        let (out, _) = merge_table(&result, &b, &spec(false, ""), global()).expect("merge");
        assert_eq!(out.rows(), &[rec(&["1", "a", "p", "q"])]);
    }

    #[test]
    fn zero_row_table_empties_inner_and_pads_left() {
        let b = Table::new(
            "b",
            1,
            Some(rec(&["id", "y", "z"])),
            Vec::new(),
            KeyFields::new(vec![1]).expect("fields"),
        )
        .expect("b");
        let result = RunningResult::seed(table("a", 0, &[&["1", "10"]], &[1]));

        let (inner, _) = merge_table(&result, &b, &spec(false, ""), global()).expect("inner");
        assert!(inner.is_empty());

        let (left, _) = merge_table(&result, &b, &spec(true, "-"), global()).expect("left");
        assert_eq!(left.rows(), &[rec(&["1", "10", "-", "-"])]);
    }

    #[test]
    fn null_result_key_is_unmatched_but_kept_by_left_join() {
        let a = table("a", 0, &[&["", "10"], &["1", "20"]], &[1]);
        let b = table("b", 1, &[&["", "x"], &["1", "y"]], &[1]);
        let result = RunningResult::seed(a);
        let merge_spec = MergeSpec {
            keep_unmatched: true,
            na: "NA".to_owned(),
            key: KeyOptions {
                case_insensitive: false,
                ignore_null: true,
            },
        };

        let (out, _) = merge_table(&result, &b, &merge_spec, global()).expect("merge");
        assert_eq!(out.rows(), &[rec(&["", "10", "NA"]), rec(&["1", "20", "y"])]);
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let result = RunningResult::seed(table("a", 0, &[&["1", "2"]], &[1]));
        let b = table("b", 1, &[&["1", "2"]], &[1, 2]);
        let err = merge_table(&result, &b, &spec(false, ""), global()).expect_err("arity");
        assert!(matches!(
            err,
            JoinError::KeyArityMismatch {
                expected: 1,
                found: 2,
                ..
            }
        ));
    }

    #[test]
    fn out_of_range_row_is_fatal() {
        let result = RunningResult::seed(table("a", 0, &[&["1", "2"]], &[2]));
        let b = Table::new(
            "b",
            1,
            None,
            vec![rec(&["1", "2"]), rec(&["1"])],
            KeyFields::new(vec![2]).expect("fields"),
        )
        .expect("b");
        let err = merge_table(&result, &b, &spec(false, ""), global()).expect_err("range");
        assert_eq!(
            err.to_string(),
            "b: row 2: key field 2 out of range (row has 1 fields)"
        );
    }

    #[test]
    fn arena_merge_matches_global_allocator_behavior() {
        let a = table("a", 0, &[&["k", "1"], &["k", "2"], &["x", "3"]], &[1]);
        let b = table("b", 1, &[&["k", "10"], &["k", "20"]], &[1]);
        let result = RunningResult::seed(a);
        let merge_spec = spec(true, "");

        let (arena, arena_trace) =
            merge_table(&result, &b, &merge_spec, JoinExecutionOptions::default())
                .expect("arena");
        let (plain, plain_trace) =
            merge_table(&result, &b, &merge_spec, global()).expect("global");
        assert_eq!(arena, plain);
        assert!(arena_trace.used_arena);
        assert!(!plain_trace.used_arena);
    }

    #[test]
    fn arena_falls_back_when_budget_is_too_small() {
        let a = table("a", 0, &[&["a", "1"], &["a", "2"], &["a", "3"]], &[1]);
        let b = table("b", 1, &[&["a", "10"], &["a", "20"]], &[1]);
        let result = RunningResult::seed(a);
        let merge_spec = spec(false, "");

        let plan = MergePlan::build(&result, &b, &merge_spec).expect("plan");
        assert_eq!(plan.output_rows(), 6);
        let options = JoinExecutionOptions {
            use_arena: true,
            arena_budget_bytes: 1,
        };
        let (out, trace) = plan.execute(options);
        assert_eq!(out.len(), 6);
        assert!(!trace.used_arena);
        assert!(trace.estimated_bytes > options.arena_budget_bytes);
    }

    #[test]
    fn unseen_keys_become_placeholder_rows() {
        let a = table("a", 0, &[&["x", "1", "10"]], &[2]);
        let b = table("b", 1, &[&["1", "p"], &["3", "q"]], &[1]);
        let mut keyspace = build_keyspace([&a, &b], KeyOptions::default()).expect("keyspace");
        keyspace.mark_seed(a.rows(), a.key_fields()).expect("mark");

        let mut result = RunningResult::seed(a);
        let added = append_unseen_keys(&mut result, &keyspace, "NA");
        assert_eq!(added, 1);
        assert_eq!(result.rows()[1], rec(&["NA", "3", "NA"]));
    }
}
