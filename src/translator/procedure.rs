//! Stored procedure rules.

use super::ast::*;
use super::lexer::TokenKind;
use super::parser::is_routine_definition;
use super::rewrite::Rewriter;

/// Teradata SQLCODE values with the DB2 SQLSTATE that carries the same
/// condition.
const SQLCODE_TO_SQLSTATE: &[(&str, &str)] = &[
    ("-5522", "42704"),
    ("3706", "42601"),
    ("-3706", "42601"),
    ("-2616", "22012"),
    ("-7547", "42884"),
    ("-2603", "23505"),
];

/// Codes whose meaning matches in both dialects. These are only mapped when
/// the comparison itself uses Teradata-only operator syntax.
const SHARED_SQLCODES: &[(&str, &str)] = &[("0", "00000"), ("100", "02000")];

/// SQLSTATE for a Teradata SQLCODE, if one is known.
pub fn sqlstate_for(code: &str) -> Option<&'static str> {
    SQLCODE_TO_SQLSTATE
        .iter()
        .chain(SHARED_SQLCODES)
        .find(|(c, _)| *c == code)
        .map(|(_, state)| *state)
}

/// Statement-level procedure rules: `REPLACE` forms, `SQL SECURITY`,
/// `LANGUAGE SQL`.
pub(super) fn apply(rw: &mut Rewriter, nodes: &mut Vec<Node>) {
    replace_to_create_or_replace(rw, nodes);
    if !is_procedure(nodes) {
        return;
    }
    remove_sql_security(rw, nodes);
    insert_language_sql(rw, nodes);
}

fn is_procedure(nodes: &[Node]) -> bool {
    is_routine_definition(nodes)
        && nodes
            .iter()
            .filter(|n| !n.is_trivia())
            .take(4)
            .any(|n| n.is_word("PROCEDURE"))
}

fn replace_to_create_or_replace(rw: &mut Rewriter, nodes: &mut Vec<Node>) {
    let Some(first) = next_significant(nodes, 0) else {
        return;
    };
    if !nodes[first].is_word("REPLACE") {
        return;
    }
    let Some(object) = next_significant(nodes, first + 1).and_then(|j| nodes[j].keyword()) else {
        return;
    };
    if !matches!(object.as_str(), "PROCEDURE" | "FUNCTION" | "VIEW" | "TRIGGER") {
        return;
    }
    let line = nodes[first].line();
    let replacement = [
        Node::word("CREATE", line),
        Node::space(line),
        Node::word("OR", line),
        Node::space(line),
        Node::word("REPLACE", line),
    ];
    nodes.splice(first..=first, replacement);
    rw.warn(
        line,
        format!("REPLACE {} is Teradata syntax", object),
        format!("Converted to CREATE OR REPLACE {}", object),
    );
}

/// Drop `SQL SECURITY <option>` from the procedure header.
fn remove_sql_security(rw: &mut Rewriter, nodes: &mut Vec<Node>) {
    let mut i = 0;
    while i < nodes.len() {
        if nodes[i].is_word("BEGIN") {
            return;
        }
        if !nodes[i].is_word("SQL") {
            i += 1;
            continue;
        }
        let security = next_significant(nodes, i + 1).filter(|&j| nodes[j].is_word("SECURITY"));
        let option = security.and_then(|j| next_significant(nodes, j + 1)).filter(|&k| {
            nodes[k]
                .keyword()
                .is_some_and(|w| matches!(w.as_str(), "INVOKER" | "DEFINER" | "CREATOR" | "OWNER"))
        });
        let Some(end) = option else {
            i += 1;
            continue;
        };
        let line = nodes[i].line();
        let option = nodes[end].keyword().unwrap_or_default();
        let mut remove_end = end + 1;
        if remove_end < nodes.len() && nodes[remove_end].is_kind(TokenKind::Whitespace) {
            remove_end += 1;
        }
        nodes.drain(i..remove_end);
        rw.warn(
            line,
            format!("SQL SECURITY {} is not supported in Db2 procedures", option),
            "Removed SQL SECURITY clause",
        );
        return;
    }
}

/// Db2 requires `LANGUAGE SQL` ahead of the body when the header has none.
fn insert_language_sql(rw: &mut Rewriter, nodes: &mut Vec<Node>) {
    let Some(begin) = nodes.iter().position(|n| n.is_word("BEGIN")) else {
        return;
    };
    if nodes[..begin].iter().any(|n| n.is_word("LANGUAGE")) {
        return;
    }
    let line = nodes[begin].line();
    let insertion = [
        Node::word("LANGUAGE", line),
        Node::space(line),
        Node::word("SQL", line),
        Node::token(TokenKind::Whitespace, "\n", line),
    ];
    nodes.splice(begin..begin, insertion);
    rw.warn(line, "Db2 procedures declare their language", "Inserted LANGUAGE SQL before BEGIN");
}

/// `SQLCODE <op> <code>` becomes `SQLSTATE <op> '<state>'` for codes that
/// differ between the dialects.
pub(super) fn sqlcode(rw: &mut Rewriter, nodes: &mut Vec<Node>, i: usize, next: Option<usize>) -> usize {
    let line = nodes[i].line();
    let Some(op_index) = next else {
        return i + 1;
    };
    let Some(op) = nodes[op_index]
        .as_token()
        .filter(|t| t.kind == TokenKind::Operator)
        .map(|t| t.text.clone())
    else {
        return i + 1;
    };
    let (normalized, teradata_only) = match op.as_str() {
        "=" => ("=", false),
        "<>" => ("<>", false),
        "!=" | "^=" => ("<>", true),
        _ => return i + 1,
    };

    let Some(k) = next_significant(nodes, op_index + 1) else {
        return i + 1;
    };
    let (code, end) = if nodes[k].as_token().is_some_and(|t| t.is_operator("-")) {
        match next_significant(nodes, k + 1) {
            Some(m) if nodes[m].is_kind(TokenKind::Number) => (format!("-{}", nodes[m].render()), m),
            _ => return i + 1,
        }
    } else if nodes[k].is_kind(TokenKind::Number) {
        (nodes[k].render(), k)
    } else {
        return i + 1;
    };

    let state = SQLCODE_TO_SQLSTATE
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, s)| *s)
        .or_else(|| if teradata_only { sqlstate_for(&code) } else { None });
    let Some(state) = state else {
        return i + 1;
    };

    let replacement = [
        Node::word("SQLSTATE", line),
        Node::space(line),
        Node::token(TokenKind::Operator, normalized, line),
        Node::space(line),
        Node::token(TokenKind::String, format!("'{}'", state), line),
    ];
    nodes.splice(i..=end, replacement);
    rw.warn(
        line,
        format!("SQLCODE {} has no direct Db2 equivalent", code),
        format!("Compared SQLSTATE '{}' instead", state),
    );
    i + 5
}

/// `SET v = ACTIVITY_COUNT` becomes `GET DIAGNOSTICS v = ROW_COUNT`.
pub(super) fn activity_count(rw: &mut Rewriter, nodes: &mut Vec<Node>, i: usize, prev: Option<usize>) -> usize {
    let line = nodes[i].line();
    let assign = prev.filter(|&p| nodes[p].as_token().is_some_and(|t| t.is_operator("=")));
    let variable = assign
        .and_then(|p| prev_significant(nodes, p))
        .filter(|&v| nodes[v].is_kind(TokenKind::Word));
    let set = variable
        .and_then(|v| prev_significant(nodes, v))
        .filter(|&s| nodes[s].is_word("SET"));

    let (Some(set), Some(variable)) = (set, variable) else {
        return i + 1 + rw.mark_unsupported(nodes, i, "ACTIVITY_COUNT outside a SET statement");
    };
    let replacement = [
        Node::word("GET", line),
        Node::space(line),
        Node::word("DIAGNOSTICS", line),
        Node::space(line),
        nodes[variable].clone(),
        Node::space(line),
        Node::token(TokenKind::Operator, "=", line),
        Node::space(line),
        Node::word("ROW_COUNT", line),
    ];
    nodes.splice(set..=i, replacement);
    rw.warn(
        line,
        "ACTIVITY_COUNT is not available in Db2",
        "Converted to GET DIAGNOSTICS ... = ROW_COUNT",
    );
    set + 9
}

/// End a procedure definition with `@` instead of its final `;`.
pub fn terminate(statement: &mut Statement) {
    if !is_procedure(&statement.nodes) {
        return;
    }
    if let Some(last) = prev_significant(&statement.nodes, statement.nodes.len()) {
        if let Node::Token(token) = &mut statement.nodes[last] {
            if token.kind == TokenKind::Semicolon {
                token.kind = TokenKind::Other;
                token.text = "@".to_string();
            }
        }
    }
}

/// Built-in Teradata procedure served by the sample endpoint.
pub const SAMPLE_PROCEDURE: &str = r#"REPLACE PROCEDURE sales.refresh_daily_summary (IN p_run_date DATE)
SQL SECURITY INVOKER
BEGIN
    DECLARE v_rows INTEGER DEFAULT 0;

    DEL FROM sales.daily_summary WHERE summary_date = p_run_date;

    INS INTO sales.daily_summary (summary_date, region_id, order_count, revenue)
    SEL p_run_date,
        region_id,
        COUNT(*),
        ZEROIFNULL(SUM(amount))
    FROM sales.orders
    WHERE order_date = p_run_date
      AND status NE 'CANCELLED'
    GROUP BY region_id;

    SET v_rows = ACTIVITY_COUNT;

    IF SQLCODE = -2603 THEN
        SIGNAL SQLSTATE '23505';
    END IF;

    INS INTO sales.top_customers
    SEL customer_id, region_id, revenue
    FROM sales.customer_revenue
    WHERE revenue_date > DATE '2024-01-01'
    QUALIFY ROW_NUMBER() OVER (PARTITION BY region_id ORDER BY revenue DESC) <= 10;
END;
"#;
