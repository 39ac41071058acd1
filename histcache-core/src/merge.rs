//! Merge fetched fragments into the cached table and enforce its invariants.
//!
//! Fragments are appended after the existing table in enumeration order. Any
//! violation (duplicate or out-of-order index, an id fragment carrying rows
//! for another id, schema drift) is a `CacheError::Integrity`: it points at a
//! bug in the fetcher or inconsistent upstream data, so it is never retried.

use crate::error::{CacheError, CacheResult};
use crate::key::ChunkKey;
use polars::prelude::*;
use std::collections::HashSet;

/// Zero-column frames (e.g. `DataFrame::empty()`) carry no table at all.
fn has_table(df: &DataFrame) -> bool {
    df.width() > 0
}

fn read_index<K: ChunkKey>(df: &DataFrame, index_column: &str, what: &str) -> CacheResult<Vec<K>> {
    let column = df.column(index_column).map_err(|_| {
        CacheError::Integrity(format!("{what} has no index column '{index_column}'"))
    })?;
    K::read_index(column)
}

/// Vertically concatenate `existing` and `fragments`. Frames without rows
/// add nothing and are skipped, so their schema is not checked; the rest must
/// agree on column names, order and dtypes. With no rows anywhere, the first
/// frame that has columns is kept as the (empty) table.
fn concat(existing: Option<&DataFrame>, fragments: &[DataFrame]) -> CacheResult<DataFrame> {
    let all = || existing.into_iter().chain(fragments.iter()).filter(|df| has_table(df));
    let mut parts = all().filter(|df| df.height() > 0);

    let Some(first) = parts.next() else {
        return Ok(all().next().cloned().unwrap_or_else(DataFrame::empty));
    };
    let mut merged = first.clone();
    for part in parts {
        merged
            .vstack_mut(part)
            .map_err(|e| CacheError::integrity_from_polars("fragment schema mismatch", e))?;
    }
    Ok(merged)
}

/// Merge for sequential caches: the index must be strictly increasing across
/// the existing tail and every fragment row.
pub fn merge_sequential<K: ChunkKey>(
    existing: Option<&DataFrame>,
    keys: &[K],
    fragments: &[DataFrame],
    index_column: &str,
) -> CacheResult<DataFrame> {
    check_fragment_count(keys, fragments)?;

    let mut previous: Option<K> = match existing {
        Some(df) if df.height() > 0 => {
            read_index::<K>(&df.tail(Some(1)), index_column, "cached table")?
                .pop()
        }
        _ => None,
    };

    for (key, fragment) in keys.iter().zip(fragments) {
        if fragment.height() == 0 {
            continue;
        }
        let what = format!("fragment for chunk {key}");
        for value in read_index::<K>(fragment, index_column, &what)? {
            if let Some(prev) = &previous {
                if value <= *prev {
                    return Err(CacheError::Integrity(format!(
                        "{what}: index value {value} does not come after {prev}"
                    )));
                }
            }
            previous = Some(value);
        }
    }

    concat(existing, fragments)
}

/// Merge for id caches: each fragment holds one non-empty row group for its
/// own id, no id appears twice, and the merged row groups are exactly
/// `fetched` followed by `keys`.
pub fn merge_ids<K: ChunkKey>(
    existing: Option<&DataFrame>,
    fetched: &[K],
    keys: &[K],
    fragments: &[DataFrame],
    index_column: &str,
) -> CacheResult<DataFrame> {
    check_fragment_count(keys, fragments)?;

    let already: HashSet<&K> = fetched.iter().collect();
    for (key, fragment) in keys.iter().zip(fragments) {
        if already.contains(key) {
            return Err(CacheError::Integrity(format!("id {key} is already cached")));
        }
        if fragment.height() == 0 {
            return Err(CacheError::Integrity(format!(
                "fragment for id {key} has no rows"
            )));
        }
        let what = format!("fragment for id {key}");
        if let Some(other) = read_index::<K>(fragment, index_column, &what)?
            .into_iter()
            .find(|v| v != key)
        {
            return Err(CacheError::Integrity(format!("{what} contains rows for id {other}")));
        }
    }

    let merged = concat(existing, fragments)?;

    let expected: Vec<&K> = fetched.iter().chain(keys.iter()).collect();
    let actual = if merged.height() > 0 {
        row_groups(read_index::<K>(&merged, index_column, "merged table")?)
    } else {
        Vec::new()
    };

    let mut seen = HashSet::new();
    if let Some(dup) = actual.iter().find(|id| !seen.insert(*id)) {
        return Err(CacheError::Integrity(format!(
            "id {dup} appears in more than one row group"
        )));
    }
    if actual.len() != expected.len() || actual.iter().zip(&expected).any(|(a, e)| a != *e) {
        return Err(CacheError::Integrity(format!(
            "merged ids {} do not match fetched ids {}",
            join(actual.iter()),
            join(expected.iter().copied()),
        )));
    }

    Ok(merged)
}

fn check_fragment_count<K>(keys: &[K], fragments: &[DataFrame]) -> CacheResult<()> {
    if keys.len() == fragments.len() {
        Ok(())
    } else {
        Err(CacheError::Integrity(format!(
            "{} fragments for {} chunk keys",
            fragments.len(),
            keys.len()
        )))
    }
}

/// Collapse runs of equal consecutive ids.
fn row_groups<K: PartialEq>(ids: Vec<K>) -> Vec<K> {
    let mut groups: Vec<K> = Vec::new();
    for id in ids {
        if groups.last() != Some(&id) {
            groups.push(id);
        }
    }
    groups
}

fn join<'a, K: ChunkKey>(ids: impl Iterator<Item = &'a K>) -> String {
    let parts: Vec<String> = ids.map(|id| id.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(rows: &[i64]) -> DataFrame {
        let values: Vec<f64> = rows.iter().map(|r| *r as f64 * 1.5).collect();
        df!("index" => rows, "value" => values).unwrap()
    }

    fn ids(rows: &[&str]) -> DataFrame {
        let n: Vec<i64> = (0..rows.len() as i64).collect();
        df!("index" => rows, "n" => n).unwrap()
    }

    fn index_i64(df: &DataFrame) -> Vec<i64> {
        i64::read_index(df.column("index").unwrap()).unwrap()
    }

    #[test]
    fn sequential_appends_in_key_order() {
        let existing = seq(&[1, 2]);
        let merged = merge_sequential(
            Some(&existing),
            &[3i64, 4],
            &[seq(&[3]), seq(&[4, 5])],
            "index",
        )
        .unwrap();
        assert_eq!(index_i64(&merged), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn sequential_without_existing() {
        let merged = merge_sequential(None, &[0i64, 1], &[seq(&[0]), seq(&[1])], "index").unwrap();
        assert_eq!(merged.height(), 2);
    }

    #[test]
    fn duplicate_against_existing_tail_rejected() {
        let existing = seq(&[1, 2]);
        let err = merge_sequential(Some(&existing), &[3i64], &[seq(&[2])], "index").unwrap_err();
        assert!(matches!(err, CacheError::Integrity(_)));
        assert!(err.to_string().contains("does not come after 2"));
    }

    #[test]
    fn overlap_across_fragments_rejected() {
        let err =
            merge_sequential(None, &[1i64, 2], &[seq(&[1, 2]), seq(&[2, 3])], "index").unwrap_err();
        assert!(matches!(err, CacheError::Integrity(_)));
    }

    #[test]
    fn empty_fragments_are_allowed() {
        let empty = seq(&[]);
        let merged =
            merge_sequential(Some(&seq(&[1])), &[2i64, 3], &[empty, seq(&[3])], "index").unwrap();
        assert_eq!(index_i64(&merged), vec![1, 3]);
    }

    #[test]
    fn zero_column_fragments_are_skipped() {
        let merged = merge_sequential(
            None,
            &[1i64, 2],
            &[DataFrame::empty(), DataFrame::empty()],
            "index",
        )
        .unwrap();
        assert_eq!(merged.width(), 0);
    }

    #[test]
    fn empty_fragment_with_other_schema_is_skipped() {
        // A day without data answered with an index-only frame.
        let index_only = df!("index" => Vec::<i64>::new()).unwrap();
        let merged = merge_sequential(
            Some(&seq(&[1])),
            &[2i64, 3],
            &[index_only, seq(&[3])],
            "index",
        )
        .unwrap();
        assert_eq!(index_i64(&merged), vec![1, 3]);
        assert_eq!(merged.width(), 2);
    }

    #[test]
    fn only_empty_fragments_keep_a_schema() {
        let merged = merge_sequential(None, &[1i64], &[seq(&[])], "index").unwrap();
        assert_eq!(merged.height(), 0);
        assert_eq!(merged.width(), 2);
    }

    #[test]
    fn missing_index_column_rejected() {
        let frag = df!("other" => &[1i64]).unwrap();
        let err = merge_sequential(None, &[1i64], &[frag], "index").unwrap_err();
        assert!(err.to_string().contains("no index column 'index'"));
    }

    #[test]
    fn schema_drift_rejected() {
        let drifted = df!("index" => &[3i64], "value" => &["text"]).unwrap();
        let err = merge_sequential(Some(&seq(&[1])), &[3i64], &[drifted], "index").unwrap_err();
        assert!(matches!(err, CacheError::Integrity(_)));
    }

    #[test]
    fn fragment_count_must_match_keys() {
        let err = merge_sequential(None, &[1i64, 2], &[seq(&[1])], "index").unwrap_err();
        assert!(err.to_string().contains("1 fragments for 2 chunk keys"));
    }

    #[test]
    fn ids_append_row_groups() {
        let existing = ids(&["a", "a", "b"]);
        let fetched = vec!["a".to_string(), "b".to_string()];
        let merged = merge_ids(
            Some(&existing),
            &fetched,
            &["c".to_string()],
            &[ids(&["c", "c"])],
            "index",
        )
        .unwrap();
        assert_eq!(
            String::read_index(merged.column("index").unwrap()).unwrap(),
            ["a", "a", "b", "c", "c"]
        );
    }

    #[test]
    fn id_fragment_with_foreign_rows_rejected() {
        let err = merge_ids(None, &[], &["a".to_string()], &[ids(&["a", "b"])], "index")
            .unwrap_err();
        assert!(err.to_string().contains("contains rows for id b"));
    }

    #[test]
    fn id_fragment_without_rows_rejected() {
        let err = merge_ids(None, &[], &["a".to_string()], &[ids(&[])], "index").unwrap_err();
        assert!(err.to_string().contains("has no rows"));
    }

    #[test]
    fn refetching_cached_id_rejected() {
        let existing = ids(&["a"]);
        let err = merge_ids(
            Some(&existing),
            &["a".to_string()],
            &["a".to_string()],
            &[ids(&["a"])],
            "index",
        )
        .unwrap_err();
        assert!(err.to_string().contains("already cached"));
    }

    #[test]
    fn existing_table_must_match_fetched_list() {
        // The record claims only "a" was fetched but the table also holds "b".
        let existing = ids(&["a", "b"]);
        let err = merge_ids(
            Some(&existing),
            &["a".to_string()],
            &["c".to_string()],
            &[ids(&["c"])],
            "index",
        )
        .unwrap_err();
        assert!(err.to_string().contains("do not match"));
    }

    #[test]
    fn split_row_group_rejected() {
        let existing = ids(&["a", "b", "a"]);
        let fetched = vec!["a".to_string(), "b".to_string()];
        let err = merge_ids(Some(&existing), &fetched, &["c".to_string()], &[ids(&["c"])], "index")
            .unwrap_err();
        assert!(err.to_string().contains("more than one row group"));
    }
}
