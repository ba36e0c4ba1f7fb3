//! Merge-join reconciliation over in-memory row streams.

use dbshift::prelude::*;
use dbshift::reconcile::DiffCategory;
use pretty_assertions::assert_eq;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn employees(rows: &[(i64, &str, Option<f64>)]) -> Box<dyn RowSource> {
    let rows = rows
        .iter()
        .map(|(id, name, salary)| {
            vec![
                Value::Int(*id),
                Value::from(*name),
                salary.map(Value::Float).unwrap_or(Value::Null),
            ]
        })
        .collect();
    Box::new(VecSource::sorted(names(&["EMP_ID", "NAME", "SALARY"]), rows, &names(&["EMP_ID"]), 3).unwrap())
}

async fn reconcile(
    options: ReconcileOptions,
    source: Box<dyn RowSource>,
    target: Box<dyn RowSource>,
) -> (TableReconciliation, Vec<DiffRecord>) {
    let mut diffs: Vec<DiffRecord> = Vec::new();
    let result = Reconciler::new(options)
        .reconcile("EMPLOYEES", "EMPLOYEES", source, target, Some(&mut diffs), &CancellationToken::new())
        .await
        .unwrap();
    (result, diffs)
}

#[tokio::test]
async fn test_identical_tables_have_no_differences() {
    let rows = [(1, "ann", Some(10.0)), (2, "bob", None), (3, "cy", Some(12.5))];
    let (result, diffs) = reconcile(ReconcileOptions::new(names(&["EMP_ID"])), employees(&rows), employees(&rows)).await;

    assert!(!result.has_differences());
    assert_eq!(result.source.rows, 3);
    assert_eq!(result.target.rows, 3);
    assert_eq!(result.common_rows(), 3);
    assert!(result.checksum_match);
    assert_eq!(result.source.checksum, result.target.checksum);
    assert!(result.samples.is_empty());
    assert!(diffs.is_empty());
}

#[tokio::test]
async fn test_counts_are_consistent() {
    let source = [
        (1, "ann", Some(10.0)),
        (2, "bob", Some(11.0)),
        (3, "cy", None),
        (5, "ed", Some(9.0)),
        (7, "gus", Some(1.0)),
    ];
    let target = [
        (1, "ann", Some(10.0)),
        (3, "cy", Some(0.0)),
        (4, "di", Some(3.0)),
        (5, "Ed", Some(9.0)),
        (6, "flo", Some(2.0)),
    ];
    let (result, diffs) = reconcile(ReconcileOptions::new(names(&["EMP_ID"])), employees(&source), employees(&target)).await;

    assert_eq!(result.rows_not_in_target, 2);
    assert_eq!(result.rows_not_in_source, 2);
    assert_eq!(result.fields_mismatch, 2);
    assert_eq!(result.common_rows(), result.source.rows - result.rows_not_in_target);
    assert_eq!(result.common_rows(), result.target.rows - result.rows_not_in_source);
    assert_eq!(
        result.has_differences(),
        result.rows_not_in_target > 0 || result.rows_not_in_source > 0 || result.fields_mismatch > 0
    );
    assert_eq!(result.field_mismatch_counts.get("NAME"), Some(&1));
    assert_eq!(result.field_mismatch_counts.get("SALARY"), Some(&1));

    let categories: Vec<DiffCategory> = diffs.iter().map(|d| d.category).collect();
    assert_eq!(categories.iter().filter(|c| **c == DiffCategory::NotInTarget).count(), 2);
    assert_eq!(categories.iter().filter(|c| **c == DiffCategory::NotInSource).count(), 2);
    assert_eq!(categories.iter().filter(|c| **c == DiffCategory::FieldsMismatch).count(), 2);
}

#[tokio::test]
async fn test_predicate_applies_to_both_sides() {
    let source = [(1, "ann", Some(10.0)), (2, "bob", Some(11.0)), (3, "cy", Some(12.0))];
    let target = [(1, "ann", Some(10.0)), (2, "bob", Some(99.0))];
    let options = ReconcileOptions::new(names(&["EMP_ID"])).with_predicate(Some(Predicate::parse("EMP_ID < 2").unwrap()));
    let (result, _) = reconcile(options, employees(&source), employees(&target)).await;

    assert_eq!(result.source.rows, 1);
    assert_eq!(result.target.rows, 1);
    assert!(!result.has_differences());
}

#[tokio::test]
async fn test_excluded_columns_are_not_compared() {
    let source = [(1, "ann", Some(10.0)), (2, "bob", Some(11.0))];
    let target = [(1, "ann", Some(20.0)), (2, "bob", Some(21.0))];
    let options = ReconcileOptions::new(names(&["EMP_ID"])).with_projection(Projection::new(Vec::new(), names(&["SALARY"])));
    let (result, _) = reconcile(options, employees(&source), employees(&target)).await;

    assert_eq!(result.compared_columns, names(&["NAME"]));
    assert_eq!(result.fields_mismatch, 0);
    assert!(result.checksum_match);
}

#[tokio::test]
async fn test_numeric_representation_is_not_a_mismatch() {
    let source = Box::new(
        VecSource::sorted(
            names(&["ID", "AMOUNT"]),
            vec![vec![Value::Int(1), Value::Float(10.0)], vec![Value::Int(2), Value::Int(3)]],
            &names(&["ID"]),
            10,
        )
        .unwrap(),
    );
    let target = Box::new(
        VecSource::sorted(
            names(&["ID", "AMOUNT"]),
            vec![vec![Value::Int(1), Value::Int(10)], vec![Value::Int(2), Value::Float(3.0)]],
            &names(&["ID"]),
            10,
        )
        .unwrap(),
    );
    let (result, _) = reconcile(ReconcileOptions::new(names(&["ID"])), source, target).await;
    assert_eq!(result.fields_mismatch, 0);
}

#[tokio::test]
async fn test_duplicate_target_key_is_rejected() {
    let source = [(1, "ann", Some(10.0))];
    let target = [(1, "ann", Some(10.0)), (1, "ann", Some(10.0))];
    let err = Reconciler::new(ReconcileOptions::new(names(&["EMP_ID"])))
        .reconcile("EMPLOYEES", "EMPLOYEES", employees(&source), employees(&target), None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "KEY_UNIQUENESS");
}

#[tokio::test]
async fn test_padded_char_key_pairs_with_varchar_key() {
    let rows = |codes: &[&str]| {
        let rows = codes.iter().map(|c| vec![Value::from(*c), Value::from("x")]).collect();
        Box::new(VecSource::sorted(names(&["CODE", "NOTE"]), rows, &names(&["CODE"]), 10).unwrap()) as Box<dyn RowSource>
    };
    let (result, diffs) = reconcile(
        ReconcileOptions::new(names(&["CODE"])),
        rows(&["AB  ", "CD  "]),
        rows(&["AB", "CD"]),
    )
    .await;

    assert_eq!(result.rows_not_in_target, 0);
    assert_eq!(result.rows_not_in_source, 0);
    assert_eq!(result.common_rows(), 2);
    assert!(diffs.is_empty());
}
