#![forbid(unsafe_code)]

//! Property tests for join completeness, totality, key coverage (two and three
//! sources) and header arity over small random tables with many repeated keys.

use std::collections::BTreeSet;

use proptest::prelude::*;

use tj_session::{join_tables, JoinConfig};
use tj_types::{JoinMode, KeyFields, Table};

const NA: &str = "NA";

// ---------------------------------------------------------------------------
// Strategy generators
// ---------------------------------------------------------------------------

/// A row of `width` fields whose first field is a key from a tiny alphabet.
fn arb_row(width: usize) -> impl Strategy<Value = Vec<String>> {
    (
        "[a-d]",
        proptest::collection::vec("[0-9]{1,2}", width - 1),
    )
        .prop_map(|(key, mut rest)| {
            rest.insert(0, key);
            rest
        })
}

fn arb_table(name: &'static str, index: usize, width: usize) -> impl Strategy<Value = Table> {
    proptest::collection::vec(arb_row(width), 1..12).prop_map(move |rows| {
        let header = (0..width)
            .map(|pos| {
                if pos == 0 {
                    "id".to_owned()
                } else {
                    format!("{name}{pos}")
                }
            })
            .collect();
        Table::new(
            name,
            index,
            Some(header),
            rows,
            KeyFields::new(vec![1]).expect("fields"),
        )
        .expect("table")
    })
}

fn arb_table_pair() -> impl Strategy<Value = (Table, Table)> {
    (2..5usize, 2..5usize)
        .prop_flat_map(|(width_a, width_b)| (arb_table("a", 0, width_a), arb_table("b", 1, width_b)))
}

fn arb_table_triple() -> impl Strategy<Value = (Table, Table, Table)> {
    (2..4usize, 2..4usize, 2..4usize).prop_flat_map(|(wa, wb, wc)| {
        (
            arb_table("a", 0, wa),
            arb_table("b", 1, wb),
            arb_table("c", 2, wc),
        )
    })
}

fn config(mode: JoinMode) -> JoinConfig {
    JoinConfig {
        mode,
        na: NA.to_owned(),
        ..JoinConfig::default()
    }
}

fn keys(table: &Table) -> Vec<&str> {
    table.rows().iter().map(|row| row[0].as_str()).collect()
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Every (a, b) pair with equal keys appears exactly once, nothing else does.
    #[test]
    fn prop_inner_join_is_complete_many_to_many((a, b) in arb_table_pair()) {
        let (out, _) = join_tables(vec![a.clone(), b.clone()], config(JoinMode::Inner))
            .expect("join");

        let mut expected = Vec::new();
        for row_a in a.rows() {
            for row_b in b.rows() {
                if row_a[0] == row_b[0] {
                    let mut row = row_a.clone();
                    row.extend(row_b[1..].iter().cloned());
                    expected.push(row);
                }
            }
        }
        prop_assert_eq!(out.rows, expected);
    }

    /// Left join keeps every first-table row; unmatched rows appear once, padded.
    #[test]
    fn prop_left_join_is_total((a, b) in arb_table_pair()) {
        let (out, _) = join_tables(vec![a.clone(), b.clone()], config(JoinMode::Left))
            .expect("join");
        let b_keys: BTreeSet<&str> = keys(&b).into_iter().collect();

        for row_a in a.rows() {
            let occurrences = out
                .rows
                .iter()
                .filter(|row| row[..row_a.len()] == row_a[..])
                .count();
            prop_assert!(occurrences >= 1);
            if !b_keys.contains(row_a[0].as_str()) {
                let mut padded = row_a.clone();
                padded.extend(std::iter::repeat(NA.to_owned()).take(b.non_key_width()));
                let exact = out.rows.iter().filter(|row| **row == padded).count();
                prop_assert_eq!(exact, occurrences);
            }
        }
    }

    /// Outer join key column covers exactly the union of source keys.
    #[test]
    fn prop_outer_join_covers_key_union((a, b) in arb_table_pair()) {
        let (out, _) = join_tables(vec![a.clone(), b.clone()], config(JoinMode::Outer))
            .expect("join");
        let union: BTreeSet<&str> = keys(&a).into_iter().chain(keys(&b)).collect();
        let produced: BTreeSet<&str> = out.rows.iter().map(|row| row[0].as_str()).collect();
        prop_assert_eq!(produced, union);
    }

    /// With three sources, keys first seen in a later source still reach the
    /// output, and every row has the accumulated width.
    #[test]
    fn prop_outer_join_covers_three_way_union((a, b, c) in arb_table_triple()) {
        let (out, _) = join_tables(
            vec![a.clone(), b.clone(), c.clone()],
            config(JoinMode::Outer),
        )
        .expect("join");
        let union: BTreeSet<&str> = keys(&a)
            .into_iter()
            .chain(keys(&b))
            .chain(keys(&c))
            .collect();
        let produced: BTreeSet<&str> = out.rows.iter().map(|row| row[0].as_str()).collect();
        prop_assert_eq!(produced, union);

        let width = a.width() + b.non_key_width() + c.non_key_width();
        for row in &out.rows {
            prop_assert_eq!(row.len(), width);
        }
    }

    /// Header length is the seed width plus each later source's non-key width,
    /// and every row has that many fields.
    #[test]
    fn prop_header_arity_matches_rows((a, b) in arb_table_pair()) {
        for mode in [JoinMode::Inner, JoinMode::Left, JoinMode::Outer] {
            let (out, _) = join_tables(vec![a.clone(), b.clone()], config(mode)).expect("join");
            let header = out.header.expect("header");
            prop_assert_eq!(header.len(), a.width() + b.width() - 1);
            for row in &out.rows {
                prop_assert_eq!(row.len(), header.len());
            }
        }
    }

    /// A self-join reproduces each row with its non-key columns repeated.
    #[test]
    fn prop_self_join_contains_each_row((a, _) in arb_table_pair()) {
        let again = Table::new(
            "a-again",
            1,
            a.header().map(<[String]>::to_vec),
            a.rows().to_vec(),
            a.key_fields().clone(),
        )
        .expect("self");
        let (out, _) = join_tables(vec![a.clone(), again], config(JoinMode::Inner))
            .expect("join");
        for row in a.rows() {
            let mut doubled = row.clone();
            doubled.extend(row[1..].iter().cloned());
            prop_assert!(out.rows.contains(&doubled));
        }
    }
}
