//! Translator behaviour on whole scripts.

use dbshift::translator::{ConversionRequest, SAMPLE_PROCEDURE, Severity, Translator};
use pretty_assertions::assert_eq;
use sqlx::sqlite::SqlitePoolOptions;

fn translate(sql: &str) -> dbshift::translator::ConversionResult {
    Translator::new().translate(sql).unwrap()
}

#[test]
fn test_sel_abbreviation() {
    let result = translate("SEL a,b FROM t;");
    assert_eq!(result.target_sql, "SELECT a,b FROM t;");
    assert_eq!(result.issues.len(), 1);
    assert_eq!(result.issues[0].severity, Severity::Warning);
    assert_eq!(result.issues[0].line, 1);
    assert!(result.success);
}

#[test]
fn test_qualify_is_rewritten() {
    let sql = "SELECT * FROM t QUALIFY ROW_NUMBER() OVER (PARTITION BY a ORDER BY b DESC)=1;";
    let result = translate(sql);
    assert!(!result.target_sql.to_ascii_uppercase().contains("QUALIFY"));
    let errors: Vec<_> = result.errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].line, 1);
    assert!(errors[0].solution.is_some());
    // The rewrite is performed, so the conversion still succeeds.
    assert!(result.success);
}

#[tokio::test]
async fn test_qualify_rewrite_returns_same_rows() {
    let sql = "SELECT * FROM t QUALIFY ROW_NUMBER() OVER (PARTITION BY a ORDER BY b DESC)=1;";
    let rewritten = translate(sql).target_sql;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::query("CREATE TABLE t (a INTEGER, b INTEGER, c TEXT)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO t VALUES (1, 10, 'x'), (1, 20, 'y'), (2, 5, 'z'), (2, 7, 'w'), (3, 1, 'v')",
    )
    .execute(&pool)
    .await
    .unwrap();

    let rows: Vec<(i64, i64, String, i64)> = sqlx::query_as(&rewritten).fetch_all(&pool).await.unwrap();
    let mut kept: Vec<(i64, i64, String)> = rows.into_iter().map(|(a, b, c, _)| (a, b, c)).collect();
    kept.sort();
    assert_eq!(
        kept,
        vec![
            (1, 20, "y".to_string()),
            (2, 7, "w".to_string()),
            (3, 1, "v".to_string()),
        ]
    );
}

#[test]
fn test_db2_sql_round_trips() {
    let scripts = [
        "SELECT a, COALESCE(b, 0) AS b FROM s.t WHERE d > CURRENT DATE - 3 DAYS ORDER BY a FETCH FIRST 10 ROWS ONLY;",
        "INSERT INTO s.t (a, b) VALUES (1, 'SEL x');\nUPDATE s.t SET b = LENGTH(b) WHERE MOD(a, 2) = 0;",
        "CREATE PROCEDURE p ()\nLANGUAGE SQL\nBEGIN\n  IF SQLSTATE <> '00000' THEN SET x = 1; END IF;\nEND;",
        "-- comment with SEL and QUALIFY\nSELECT LOCATE('x', c) FROM t WHERE a <> 1",
        "SELECT sel, ins, del FROM t;",
        "SELECT a sel, b AS del FROM t WHERE sel IN (SELECT sel FROM u);",
    ];
    for sql in scripts {
        let result = translate(sql);
        assert_eq!(result.target_sql, sql);
        assert!(result.issues.is_empty(), "issues for {}: {:?}", sql, result.issues);
    }
}

#[test]
fn test_translation_is_idempotent() {
    let scripts = [
        SAMPLE_PROCEDURE,
        "SEL TOP 5 a, ZEROIFNULL(b) FROM t WHERE c NE 1 AND d = DATE '2024-01-31';",
        "SEL a, b FROM t\nQUALIFY RANK() OVER (ORDER BY a) <= 2;",
        "SELECT a MOD 3, CHARS(b), INDEX(b, 'x') FROM t WHERE x ^= 2;",
        "SELECT a FROM t SAMPLE 10;",
    ];
    for sql in scripts {
        let once = translate(sql);
        let twice = translate(&once.target_sql);
        assert_eq!(twice.target_sql, once.target_sql);
        if once.success {
            assert!(twice.issues.is_empty(), "second pass issues: {:?}", twice.issues);
        }
    }
}

#[test]
fn test_empty_and_blank_input() {
    for sql in ["", "   \n\t", "-- only a comment\n"] {
        let result = translate(sql);
        assert_eq!(result.target_sql, sql);
        assert!(result.issues.is_empty());
        assert!(result.success);
    }
}

#[test]
fn test_statements_on_one_line_get_their_own_issues() {
    let result = translate("SEL a FROM t; SEL b FROM u;\nDEL FROM v ALL;");
    assert_eq!(result.target_sql, "SELECT a FROM t; SELECT b FROM u;\nDELETE FROM v;");
    let lines: Vec<usize> = result.issues.iter().map(|i| i.line).collect();
    assert_eq!(lines, vec![1, 1, 2, 2]);
}

#[test]
fn test_unsupported_construct_marks_failure() {
    let result = translate("COLLECT STATISTICS ON t COLUMN (a);\nSEL a FROM t;");
    assert!(!result.success);
    assert!(result.target_sql.starts_with("/* UNSUPPORTED(dbshift): COLLECT STATISTICS */"));
    assert!(result.target_sql.ends_with("SELECT a FROM t;"));
    assert!(result.errors().any(|i| i.line == 1));
}

#[test]
fn test_procedure_terminator_opt_in() {
    let off = translate(SAMPLE_PROCEDURE);
    assert!(off.target_sql.trim_end().ends_with("END;"));

    let request = ConversionRequest::new(SAMPLE_PROCEDURE).with_procedure_terminator(true);
    let on = Translator::new().convert(&request).unwrap();
    assert!(on.target_sql.trim_end().ends_with("END@"));
}

#[test]
fn test_unterminated_string_is_an_error() {
    let err = Translator::new().translate("SELECT 'abc FROM t").unwrap_err();
    assert_eq!(err.code(), "TRANSLATION_ERROR");
}
