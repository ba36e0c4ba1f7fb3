//! Teradata to DB2 rewrite rules.
//!
//! Rules run over the token tree bottom-up: parenthesised groups first, then
//! token rules at the current level, then query-block rules (`TOP`,
//! `QUALIFY`). Every rule that changes text records an [`Issue`] at the
//! source line of the construct it touched.

use super::ast::*;
use super::lexer::{tokenize, TokenKind};
use super::parser::{build_tree, select_blocks};
use super::procedure;
use super::{Issue, Severity};

/// Prefix of the comment placed in front of constructs left unconverted.
pub const UNSUPPORTED_MARKER: &str = "/* UNSUPPORTED(dbshift):";

/// Derived table alias used by the `QUALIFY` rewrite.
const WINDOW_TABLE: &str = "WINDOW_T";

fn window_alias(n: usize) -> String {
    if n == 0 {
        "WINDOW_RN".to_string()
    } else {
        format!("WINDOW_RN{}", n + 1)
    }
}

/// Words after which `INDEX (` starts DDL rather than a function call.
const INDEX_DDL_WORDS: &[&str] = &[
    "CREATE", "UNIQUE", "PRIMARY", "DROP", "NO", "SECONDARY", "JOIN", "HASH", "ALTER", "ON",
];

/// Words after which a bare `DATE` is Teradata's current date.
const DATE_VALUE_WORDS: &[&str] = &[
    "SELECT", "SEL", "WHERE", "AND", "OR", "NOT", "WHEN", "THEN", "ELSE", "RETURN", "DEFAULT",
    "BETWEEN", "IN",
];

/// Accumulates issues while rules run over one script.
#[derive(Debug, Default)]
pub struct Rewriter {
    issues: Vec<Issue>,
    unsupported: usize,
}

impl Rewriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues in emission order and the number of constructs left marked.
    pub fn finish(self) -> (Vec<Issue>, usize) {
        (self.issues, self.unsupported)
    }

    pub fn rewrite_statement(&mut self, statement: &mut Statement) {
        if statement.is_blank() {
            return;
        }
        if self.statement_rules(&mut statement.nodes) {
            return;
        }
        procedure::apply(self, &mut statement.nodes);
        self.rewrite_nodes(&mut statement.nodes);
    }

    pub(super) fn warn(&mut self, line: usize, message: impl Into<String>, solution: impl Into<String>) {
        self.issues.push(Issue {
            line,
            message: message.into(),
            severity: Severity::Warning,
            solution: Some(solution.into()),
        });
    }

    pub(super) fn error(&mut self, line: usize, message: impl Into<String>, solution: Option<String>) {
        self.issues.push(Issue {
            line,
            message: message.into(),
            severity: Severity::Error,
            solution,
        });
    }

    /// Leave the construct at `at` in place behind an `UNSUPPORTED` marker.
    ///
    /// Returns how many nodes were inserted before `at` (0 when the marker is
    /// already there from an earlier pass).
    pub(super) fn mark_unsupported(&mut self, nodes: &mut Vec<Node>, at: usize, what: &str) -> usize {
        let line = nodes[at].line();
        self.unsupported += 1;
        self.error(
            line,
            format!("{} is not supported in Db2 and was left in place", what),
            None,
        );

        let marked = (0..at)
            .rev()
            .find(|&k| !nodes[k].is_kind(TokenKind::Whitespace))
            .and_then(|k| nodes[k].as_token())
            .is_some_and(|t| t.kind == TokenKind::BlockComment && t.text.starts_with(UNSUPPORTED_MARKER));
        if marked {
            return 0;
        }
        let marker = format!("{} {} */", UNSUPPORTED_MARKER, what);
        nodes.insert(at, Node::space(line));
        nodes.insert(at, Node::token(TokenKind::BlockComment, marker, line));
        2
    }

    /// Rules that look at the statement as a whole. Returns true when the
    /// statement is left entirely as-is.
    fn statement_rules(&mut self, nodes: &mut Vec<Node>) -> bool {
        let Some(first) = next_significant(nodes, 0) else {
            return true;
        };
        if nodes[first].is_kind(TokenKind::Dot) {
            let command = next_significant(nodes, first + 1)
                .and_then(|j| nodes[j].keyword())
                .unwrap_or_default();
            self.mark_unsupported(nodes, first, &format!("BTEQ command .{}", command));
            return true;
        }

        let second = next_significant(nodes, first + 1).and_then(|j| nodes[j].keyword());
        match nodes[first].keyword().as_deref() {
            Some("COLLECT") => {
                self.mark_unsupported(nodes, first, "COLLECT STATISTICS");
                return true;
            }
            Some("CREATE") | Some("REPLACE") if second.as_deref() == Some("MACRO") => {
                self.mark_unsupported(nodes, first, "Teradata macro");
                return true;
            }
            _ => {}
        }

        if nodes[first].is_word("DELETE") || nodes[first].is_word("DEL") {
            self.delete_all(nodes);
        }
        false
    }

    /// `DELETE FROM t ALL` deletes every row; DB2 has no `ALL` suffix.
    fn delete_all(&mut self, nodes: &mut Vec<Node>) {
        let mut last = prev_significant(nodes, nodes.len());
        if last.is_some_and(|i| nodes[i].is_kind(TokenKind::Semicolon)) {
            last = last.and_then(|i| prev_significant(nodes, i));
        }
        let Some(i) = last else { return };
        if !nodes[i].is_word("ALL") {
            return;
        }
        let line = nodes[i].line();
        let start = if i > 0 && nodes[i - 1].is_kind(TokenKind::Whitespace) {
            i - 1
        } else {
            i
        };
        nodes.drain(start..=i);
        self.warn(line, "DELETE ... ALL is Teradata syntax", "Removed ALL; DELETE without WHERE removes every row");
    }

    fn rewrite_nodes(&mut self, nodes: &mut Vec<Node>) {
        for node in nodes.iter_mut() {
            if let Node::Group(group) = node {
                self.rewrite_nodes(&mut group.children);
            }
        }
        self.rewrite_tokens(nodes);
        self.rewrite_blocks(nodes);
    }

    fn rewrite_tokens(&mut self, nodes: &mut Vec<Node>) {
        let mut i = 0;
        while i < nodes.len() {
            i = self.rewrite_at(nodes, i);
        }
    }

    /// Apply token rules at `i`; returns the index to continue from.
    fn rewrite_at(&mut self, nodes: &mut Vec<Node>, i: usize) -> usize {
        let Some(token) = nodes[i].as_token() else {
            return i + 1;
        };
        let line = token.line;

        if token.is_operator("^=") {
            nodes[i] = Node::token(TokenKind::Operator, "<>", line);
            self.warn(line, "Teradata ^= operator is not supported in Db2", "Converted ^= to <>");
            return i + 1;
        }
        if token.kind != TokenKind::Word {
            return i + 1;
        }

        let prev = prev_significant(nodes, i);
        if prev.is_some_and(|p| nodes[p].is_kind(TokenKind::Dot)) {
            return i + 1;
        }
        let next = next_significant(nodes, i + 1);
        let next_kind = next.and_then(|j| nodes[j].as_token()).map(|t| t.kind);
        let next_is_group = next.is_some_and(|j| nodes[j].is_group());

        match token.text.to_ascii_uppercase().as_str() {
            "SEL" => self.select_abbreviation(nodes, i, prev, next),
            "INS" | "UPD" | "DEL" if statement_position(nodes, prev) => self.dml_abbreviation(nodes, i),
            "ACTIVITY_COUNT" => procedure::activity_count(self, nodes, i, prev),
            "DATE" => self.date(nodes, i, prev, next),
            "INTERVAL" => self.interval(nodes, i, next),
            "ZEROIFNULL" | "NULLIFZERO" | "CHARACTERS" | "CHARS" | "INDEX" if next_is_group => {
                self.function(nodes, i, prev, next)
            }
            "MOD" => self.mod_operator(nodes, i, prev, next),
            "NE" => {
                let between_operands = prev.is_some_and(|p| nodes[p].is_operand())
                    && next.is_some_and(|j| nodes[j].is_operand());
                if between_operands {
                    nodes[i] = Node::token(TokenKind::Operator, "<>", line);
                    self.warn(line, "Teradata NE operator is not supported in Db2", "Converted NE to <>");
                }
                i + 1
            }
            "SQLCODE" => procedure::sqlcode(self, nodes, i, next),
            "SAMPLE" if next_kind == Some(TokenKind::Number) => {
                i + 1 + self.mark_unsupported(nodes, i, "SAMPLE clause")
            }
            "HASHROW" | "HASHBUCKET" | "HASHAMP" | "HASHBAKAMP" if next_is_group => {
                let what = format!("{} function", token.text.to_ascii_uppercase());
                i + 1 + self.mark_unsupported(nodes, i, &what)
            }
            "FORMAT" if next_kind == Some(TokenKind::String) => {
                i + 1 + self.mark_unsupported(nodes, i, "FORMAT phrase")
            }
            _ => i + 1,
        }
    }

    fn select_abbreviation(&mut self, nodes: &mut [Node], i: usize, prev: Option<usize>, next: Option<usize>) -> usize {
        if !query_position(nodes, prev) {
            return i + 1;
        }
        let used_as_name = next.is_some_and(|j| {
            matches!(
                nodes[j].as_token().map(|t| t.kind),
                Some(TokenKind::Dot | TokenKind::Comma | TokenKind::Operator | TokenKind::RParen)
            )
        }) || prev.is_some_and(|p| nodes[p].is_word("AS"));
        if used_as_name {
            return i + 1;
        }
        let line = nodes[i].line();
        nodes[i] = Node::word("SELECT", line);
        self.warn(line, "SEL abbreviation is not supported in Db2", "Converted SEL to SELECT");
        i + 1
    }

    fn dml_abbreviation(&mut self, nodes: &mut [Node], i: usize) -> usize {
        let line = nodes[i].line();
        let short = nodes[i].keyword().unwrap_or_default();
        let full = match short.as_str() {
            "INS" => "INSERT",
            "UPD" => "UPDATE",
            _ => "DELETE",
        };
        nodes[i] = Node::word(full, line);
        self.warn(
            line,
            format!("{} abbreviation is not supported in Db2", short),
            format!("Converted {} to {}", short, full),
        );
        i + 1
    }

    fn date(&mut self, nodes: &mut Vec<Node>, i: usize, prev: Option<usize>, next: Option<usize>) -> usize {
        let line = nodes[i].line();
        if let Some(j) = next.filter(|&j| nodes[j].is_kind(TokenKind::String)) {
            let literal = nodes[j].clone();
            let keyword = nodes[i].clone();
            let call = Node::Group(Group::synthetic(vec![literal], line));
            nodes.splice(i..=j, [keyword, call]);
            self.warn(line, "DATE literal format differs in Db2", "Converted to DATE() function format");
            return i + 2;
        }

        let value_position = match prev {
            None => true,
            Some(p) => match nodes[p].as_token() {
                Some(t) if t.kind == TokenKind::Operator => true,
                Some(t) if t.kind == TokenKind::Word => {
                    DATE_VALUE_WORDS.contains(&t.text.to_ascii_uppercase().as_str())
                }
                _ => false,
            },
        };
        let argument_follows = next.is_some_and(|j| nodes[j].is_group() || nodes[j].is_word("FORMAT"));
        if !value_position || argument_follows {
            return i + 1;
        }
        nodes.splice(i..=i, [Node::word("CURRENT", line), Node::space(line), Node::word("DATE", line)]);
        self.warn(
            line,
            "DATE without a literal is Teradata's current date",
            "Converted to CURRENT DATE",
        );
        i + 3
    }

    fn interval(&mut self, nodes: &mut Vec<Node>, i: usize, next: Option<usize>) -> usize {
        let line = nodes[i].line();
        let amount = next.and_then(|j| {
            let t = nodes[j].as_token().filter(|t| t.kind == TokenKind::String)?;
            let inner = t.text.trim_matches('\'').trim();
            let digits = inner.strip_prefix('-').unwrap_or(inner);
            (!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())).then(|| (j, inner.to_string()))
        });
        let unit = amount.as_ref().and_then(|(j, _)| {
            let k = next_significant(nodes, j + 1)?;
            let unit = nodes[k].keyword()?;
            matches!(unit.as_str(), "DAY" | "MONTH" | "YEAR" | "HOUR" | "MINUTE" | "SECOND").then_some((k, unit))
        });

        match (amount, unit) {
            (Some((_, amount)), Some((k, unit))) => {
                let replacement = [
                    Node::token(TokenKind::Number, amount.clone(), line),
                    Node::space(line),
                    Node::word(format!("{}S", unit), line),
                ];
                nodes.splice(i..=k, replacement);
                self.warn(
                    line,
                    "INTERVAL literals are not supported in Db2",
                    format!("Converted INTERVAL '{}' {} to {} {}S", amount, unit, amount, unit),
                );
                i + 3
            }
            _ => i + 1 + self.mark_unsupported(nodes, i, "INTERVAL expression"),
        }
    }

    fn function(&mut self, nodes: &mut [Node], i: usize, prev: Option<usize>, next: Option<usize>) -> usize {
        let Some(j) = next else { return i + 1 };
        let line = nodes[i].line();
        let name = nodes[i].keyword().unwrap_or_default();

        if name == "INDEX" {
            let ddl = prev
                .and_then(|p| nodes[p].keyword())
                .is_some_and(|w| INDEX_DDL_WORDS.contains(&w.as_str()));
            if ddl {
                return i + 1;
            }
        }

        let Node::Group(group) = &mut nodes[j] else {
            return i + 1;
        };
        let (replacement, solution) = match name.as_str() {
            "ZEROIFNULL" => {
                group.children.extend(zero_argument(line));
                ("COALESCE", "Converted ZEROIFNULL(x) to COALESCE(x, 0)")
            }
            "NULLIFZERO" => {
                group.children.extend(zero_argument(line));
                ("NULLIF", "Converted NULLIFZERO(x) to NULLIF(x, 0)")
            }
            "CHARACTERS" | "CHARS" => ("LENGTH", "Converted to LENGTH()"),
            "INDEX" => {
                let args: Vec<Vec<Node>> = split_commas(&group.children)
                    .into_iter()
                    .map(|arg| trim(arg).to_vec())
                    .collect();
                let [haystack, needle] = args.as_slice() else {
                    return i + 1;
                };
                let mut children = needle.clone();
                children.push(Node::token(TokenKind::Comma, ",", line));
                children.push(Node::space(line));
                children.extend(haystack.iter().cloned());
                group.children = children;
                ("LOCATE", "Converted INDEX(s, t) to LOCATE(t, s)")
            }
            _ => return i + 1,
        };
        nodes[i] = Node::word(replacement, line);
        self.warn(line, format!("{} is not a Db2 function", name), solution);
        i + 1
    }

    /// Infix `a MOD b` becomes `MOD(a, b)`.
    fn mod_operator(&mut self, nodes: &mut Vec<Node>, i: usize, prev: Option<usize>, next: Option<usize>) -> usize {
        let (Some(p), Some(n)) = (prev, next) else {
            return i + 1;
        };
        if !nodes[p].is_operand() {
            return i + 1;
        }
        let Some(right_end) = operand_end(nodes, n) else {
            return i + 1;
        };
        let left_start = operand_start(nodes, p);
        let line = nodes[i].line();

        let mut children: Vec<Node> = nodes[left_start..=p].to_vec();
        children.push(Node::token(TokenKind::Comma, ",", line));
        children.push(Node::space(line));
        children.extend(nodes[n..=right_end].iter().cloned());
        self.rewrite_tokens(&mut children);

        let call = [Node::word("MOD", line), Node::Group(Group::synthetic(children, line))];
        nodes.splice(left_start..=right_end, call);
        self.warn(line, "MOD operator is not supported in Db2", "Converted to MOD() function");
        left_start + 2
    }

    fn rewrite_blocks(&mut self, nodes: &mut Vec<Node>) {
        for block in select_blocks(nodes).iter().rev() {
            self.top(nodes, block);
        }
        self.qualify_blocks(nodes);
    }

    fn qualify_blocks(&mut self, nodes: &mut Vec<Node>) {
        for block in select_blocks(nodes).iter().rev() {
            if block.clause(ClauseKind::Qualify).is_some() {
                self.qualify(nodes, block);
            }
        }
    }

    /// `SELECT TOP n ...` becomes `SELECT ... FETCH FIRST n ROWS ONLY`. A
    /// branch of a set operation is parenthesised so the limit stays on it.
    fn top(&mut self, nodes: &mut Vec<Node>, block: &SelectBlock) {
        let select = block.clauses[0];
        let Some(mut j) = next_significant(nodes, select.body).filter(|&j| j < select.end) else {
            return;
        };
        if nodes[j].is_word("DISTINCT") || nodes[j].is_word("ALL") {
            match next_significant(nodes, j + 1) {
                Some(k) if k < select.end => j = k,
                _ => return,
            }
        }
        if !nodes[j].is_word("TOP") {
            return;
        }
        let line = nodes[j].line();
        let count = next_significant(nodes, j + 1).and_then(|k| {
            nodes[k]
                .as_token()
                .filter(|t| t.kind == TokenKind::Number)
                .map(|t| (k, t.text.clone()))
        });
        let Some((k, count)) = count else {
            self.mark_unsupported(nodes, j, "TOP with a computed row count");
            return;
        };
        let modifier = next_significant(nodes, k + 1)
            .is_some_and(|m| nodes[m].is_word("PERCENT") || nodes[m].is_word("WITH"));
        if modifier {
            self.mark_unsupported(nodes, j, "TOP n PERCENT or WITH TIES");
            return;
        }

        let mut remove_end = k + 1;
        if remove_end < nodes.len() && nodes[remove_end].is_kind(TokenKind::Whitespace) {
            remove_end += 1;
        }
        nodes.drain(j..remove_end);
        let end = block.end - (remove_end - j);
        let fetch = [
            Node::space(line),
            Node::word("FETCH", line),
            Node::space(line),
            Node::word("FIRST", line),
            Node::space(line),
            Node::token(TokenKind::Number, count.clone(), line),
            Node::space(line),
            Node::word("ROWS", line),
            Node::space(line),
            Node::word("ONLY", line),
        ];
        let fetch_len = fetch.len();
        nodes.splice(end..end, fetch);
        if in_set_operation(nodes, block.start, end + fetch_len) {
            let mut branch: Vec<Node> = nodes.drain(block.start..end + fetch_len).collect();
            self.qualify_blocks(&mut branch);
            nodes.insert(block.start, Node::Group(Group::synthetic(branch, line)));
        }
        self.warn(
            line,
            "TOP is not supported in Db2",
            format!("Converted TOP {} to FETCH FIRST {} ROWS ONLY", count, count),
        );
    }

    /// Rewrite a block carrying `QUALIFY` into a derived table that exposes
    /// each window function as a column, filtered by an outer `WHERE`.
    fn qualify(&mut self, nodes: &mut Vec<Node>, block: &SelectBlock) {
        let Some(qualify) = block.clause(ClauseKind::Qualify).copied() else {
            return;
        };
        let line = nodes[qualify.start].line();
        let Some(from) = block.clause(ClauseKind::From).copied() else {
            self.mark_unsupported(nodes, qualify.start, "QUALIFY without FROM");
            return;
        };

        let select = block.clauses[0];
        let mut list = trim(&nodes[select.body..select.end]);
        let mut distinct = false;
        if list.first().is_some_and(|n| n.is_word("DISTINCT")) {
            distinct = true;
            list = trim(&list[1..]);
        } else if list.first().is_some_and(|n| n.is_word("ALL")) {
            list = trim(&list[1..]);
        }

        let star = list.len() == 1 && list[0].as_token().is_some_and(|t| t.is_operator("*"));
        let inner_list = if star {
            match single_table_name(trim(&nodes[from.body..from.end])) {
                Some(name) => format!("{}.*", name),
                None => {
                    self.mark_unsupported(nodes, qualify.start, "QUALIFY over SELECT * from several tables");
                    return;
                }
            }
        } else {
            render(list)
        };
        let outer_names = if star { None } else { output_names(list) };
        if distinct && outer_names.is_none() {
            self.mark_unsupported(nodes, qualify.start, "QUALIFY with DISTINCT over unnamed columns");
            return;
        }

        let mut derived = DerivedColumns::new(outer_names.as_deref());
        let condition = derived.condition(trim(&nodes[qualify.body..qualify.end]));
        let order_by = block
            .clause(ClauseKind::OrderBy)
            .map(|c| derived.order_by(trim(&nodes[c.body..c.end])));

        let mut inner = format!("SELECT {}", inner_list);
        for (expr, alias) in &derived.items {
            inner.push_str(&format!(", {} AS {}", expr, alias));
        }
        for kind in [ClauseKind::From, ClauseKind::Where, ClauseKind::GroupBy, ClauseKind::Having] {
            if let Some(c) = block.clause(kind) {
                inner.push(' ');
                inner.push_str(&render_trimmed(&nodes[c.start..c.end]));
            }
        }

        let outer_list = match &outer_names {
            Some(names) => names.join(", "),
            None => "*".to_string(),
        };
        let mut text = format!(
            "SELECT {}{} FROM ({}) AS {} WHERE {}",
            if distinct { "DISTINCT " } else { "" },
            outer_list,
            inner,
            WINDOW_TABLE,
            condition
        );
        if let Some(order_by) = order_by {
            text.push_str(" ORDER BY ");
            text.push_str(&order_by);
        }
        if let Some(c) = block.clause(ClauseKind::Fetch) {
            text.push(' ');
            text.push_str(&render_trimmed(&nodes[c.start..c.end]));
        }

        let Ok(mut tokens) = tokenize(&text) else {
            self.mark_unsupported(nodes, qualify.start, "QUALIFY clause");
            return;
        };
        for token in &mut tokens {
            token.line = line;
        }
        nodes.splice(block.start..block.end, build_tree(tokens));

        let mut message = "QUALIFY is not supported in IBM Db2".to_string();
        if outer_names.is_none() && !derived.items.is_empty() {
            let helpers: Vec<&str> = derived.items.iter().map(|(_, alias)| alias.as_str()).collect();
            message.push_str(&format!(
                "; SELECT * now also returns the helper column(s) {}",
                helpers.join(", ")
            ));
        }
        self.error(line, message, Some("Converted to standard SQL with ROW_NUMBER()".to_string()));
    }
}

/// True when a statement may start right after `prev`.
fn statement_position(nodes: &[Node], prev: Option<usize>) -> bool {
    let Some(p) = prev else {
        return true;
    };
    if nodes[p].is_kind(TokenKind::Semicolon) {
        return true;
    }
    nodes[p]
        .keyword()
        .is_some_and(|w| matches!(w.as_str(), "BEGIN" | "THEN" | "ELSE" | "DO" | "LOOP" | "REPEAT"))
}

/// True when a query may start right after `prev`: at a statement or
/// sub-query start, after a set operator, or after the target of
/// `INSERT INTO t [(cols)]` or the CTEs of `WITH`.
fn query_position(nodes: &[Node], prev: Option<usize>) -> bool {
    let Some(p) = prev else {
        return true;
    };
    if statement_position(nodes, prev) {
        return true;
    }
    if is_set_operator(&nodes[p]) {
        return true;
    }
    if nodes[p].is_word("ALL") || nodes[p].is_word("DISTINCT") {
        return prev_significant(nodes, p).is_some_and(|q| is_set_operator(&nodes[q]));
    }
    if !nodes[p].is_group() && !is_name(&nodes[p]) {
        return false;
    }

    let start = nodes[..p]
        .iter()
        .rposition(|n| {
            n.is_kind(TokenKind::Semicolon)
                || n
                    .keyword()
                    .is_some_and(|w| matches!(w.as_str(), "BEGIN" | "THEN" | "ELSE" | "DO" | "LOOP" | "REPEAT"))
        })
        .map_or(0, |s| s + 1);
    let mut words = nodes[start..p].iter().filter_map(Node::keyword);
    match words.next().as_deref() {
        Some("INSERT" | "INS" | "WITH") => !words.any(|w| matches!(w.as_str(), "SELECT" | "SEL" | "VALUES")),
        _ => false,
    }
}

fn zero_argument(line: usize) -> [Node; 3] {
    [
        Node::token(TokenKind::Comma, ",", line),
        Node::space(line),
        Node::token(TokenKind::Number, "0", line),
    ]
}

fn is_name(node: &Node) -> bool {
    node.as_token()
        .is_some_and(|t| t.kind == TokenKind::QuotedIdent || (t.kind == TokenKind::Word && !is_reserved(&t.text)))
}

/// First index of the operand ending at `p` (qualified names and function
/// calls included).
fn operand_start(nodes: &[Node], p: usize) -> usize {
    if nodes[p].is_group() {
        return match prev_significant(nodes, p) {
            Some(q) if is_name(&nodes[q]) => q,
            _ => p,
        };
    }
    let mut start = p;
    while start >= 2 && nodes[start - 1].is_kind(TokenKind::Dot) && is_name(&nodes[start - 2]) {
        start -= 2;
    }
    start
}

/// Last index of the operand starting at `n`.
fn operand_end(nodes: &[Node], n: usize) -> Option<usize> {
    let node = &nodes[n];
    if node.is_group() || node.is_kind(TokenKind::Number) || node.is_kind(TokenKind::String) {
        return Some(n);
    }
    if !is_name(node) {
        return None;
    }
    let mut end = n;
    while end + 2 < nodes.len() && nodes[end + 1].is_kind(TokenKind::Dot) && is_name(&nodes[end + 2]) {
        end += 2;
    }
    match next_significant(nodes, end + 1) {
        Some(g) if nodes[g].is_group() => Some(g),
        _ => Some(end),
    }
}

/// Columns the outer query of a `QUALIFY` rewrite reads from the derived
/// table beyond the original select list.
struct DerivedColumns<'a> {
    /// Output names of the inner select list; `None` for `table.*`.
    names: Option<&'a [String]>,
    /// `(expression, alias)` pairs appended to the inner select list.
    items: Vec<(String, String)>,
    windows: usize,
    columns: usize,
}

impl<'a> DerivedColumns<'a> {
    fn new(names: Option<&'a [String]>) -> Self {
        Self {
            names,
            items: Vec::new(),
            windows: 0,
            columns: 0,
        }
    }

    fn window(&mut self, expr: String) -> String {
        let alias = window_alias(self.windows);
        self.windows += 1;
        self.items.push((expr, alias.clone()));
        alias
    }

    fn column(&mut self, expr: String) -> String {
        if let Some((_, alias)) = self.items.iter().find(|(e, _)| *e == expr) {
            return alias.clone();
        }
        self.columns += 1;
        let alias = format!("WINDOW_C{}", self.columns);
        self.items.push((expr, alias.clone()));
        alias
    }

    /// Outer name for a column reference (`col` or `tbl.col`).
    fn reference(&mut self, chain: &[Node]) -> String {
        let Some(last) = chain.last().map(Node::render) else {
            return String::new();
        };
        match self.names {
            None => last,
            Some(names) if names.iter().any(|n| n.eq_ignore_ascii_case(&last)) => last,
            Some(_) => self.column(render(chain)),
        }
    }

    /// Rewrite a `QUALIFY` condition for the outer query: window calls and
    /// columns not in the select list become helper columns.
    fn condition(&mut self, nodes: &[Node]) -> String {
        let mut out = String::new();
        let mut i = 0;
        while i < nodes.len() {
            if let Some(end) = window_call_end(nodes, i) {
                let alias = self.window(render(&nodes[i..=end]));
                out.push_str(&alias);
                i = end + 1;
                continue;
            }
            if let Some(end) = column_reference_end(nodes, i) {
                let name = self.reference(&nodes[i..=end]);
                out.push_str(&name);
                i = end + 1;
                continue;
            }
            match &nodes[i] {
                Node::Group(group) if !starts_query(&group.children) => {
                    out.push_str(&group.open.text);
                    out.push_str(&self.condition(&group.children));
                    if let Some(close) = &group.close {
                        out.push_str(&close.text);
                    }
                }
                node => node.render_into(&mut out),
            }
            i += 1;
        }
        out
    }

    /// Rewrite an `ORDER BY` list for the outer query.
    fn order_by(&mut self, nodes: &[Node]) -> String {
        let items: Vec<String> = split_commas(nodes)
            .into_iter()
            .map(|item| {
                let item = trim(item);
                let mut cut = item.len();
                while let Some(k) = prev_significant(item, cut).filter(|&k| {
                    item[k]
                        .keyword()
                        .is_some_and(|w| matches!(w.as_str(), "ASC" | "DESC" | "NULLS" | "FIRST" | "LAST"))
                }) {
                    cut = k;
                }
                let expr_end = prev_significant(item, cut).map_or(0, |k| k + 1);
                let expr = &item[..expr_end];
                let head = if expr.len() == 1 && expr[0].is_kind(TokenKind::Number) {
                    render(expr)
                } else if !expr.is_empty() && column_reference_end(expr, 0) == Some(expr.len() - 1) {
                    self.reference(expr)
                } else if self.names.is_none() {
                    unqualified(expr)
                } else {
                    self.column(render(expr))
                };
                format!("{}{}", head, render(&item[expr_end..]))
            })
            .collect();
        items.join(", ")
    }
}

/// Last index of a column reference starting at `i`; `None` when the name
/// there is a function, a type, or part of a keyword phrase.
fn column_reference_end(nodes: &[Node], i: usize) -> Option<usize> {
    if !is_name(&nodes[i]) || (i > 0 && nodes[i - 1].is_kind(TokenKind::Dot)) {
        return None;
    }
    let after_word = prev_significant(nodes, i).is_some_and(|p| is_name(&nodes[p]) || nodes[p].is_word("AS"));
    if after_word {
        return None;
    }
    let mut end = i;
    while end + 2 < nodes.len() && nodes[end + 1].is_kind(TokenKind::Dot) && is_name(&nodes[end + 2]) {
        end += 2;
    }
    let followed = next_significant(nodes, end + 1)
        .is_some_and(|n| nodes[n].is_group() || is_name(&nodes[n]) || nodes[n].is_kind(TokenKind::String));
    if followed { None } else { Some(end) }
}

fn starts_query(nodes: &[Node]) -> bool {
    next_significant(nodes, 0).is_some_and(|i| nodes[i].is_word("SELECT") || nodes[i].is_word("SEL"))
}

fn is_set_operator(node: &Node) -> bool {
    node.keyword()
        .is_some_and(|w| matches!(w.as_str(), "UNION" | "EXCEPT" | "INTERSECT" | "MINUS"))
}

/// True when the query block `start..end` is a branch of `UNION` and friends.
fn in_set_operation(nodes: &[Node], start: usize, end: usize) -> bool {
    if next_significant(nodes, end).is_some_and(|n| is_set_operator(&nodes[n])) {
        return true;
    }
    match prev_significant(nodes, start) {
        Some(p) if is_set_operator(&nodes[p]) => true,
        Some(p) if nodes[p].is_word("ALL") || nodes[p].is_word("DISTINCT") => {
            prev_significant(nodes, p).is_some_and(|q| is_set_operator(&nodes[q]))
        }
        _ => false,
    }
}

fn window_call_end(nodes: &[Node], i: usize) -> Option<usize> {
    if !nodes[i].is_kind(TokenKind::Word) {
        return None;
    }
    let args = next_significant(nodes, i + 1).filter(|&j| nodes[j].is_group())?;
    let over = next_significant(nodes, args + 1).filter(|&j| nodes[j].is_word("OVER"))?;
    next_significant(nodes, over + 1).filter(|&j| nodes[j].is_group())
}

/// Name usable as `<name>.*` when FROM holds exactly one table or derived
/// table.
fn single_table_name(from: &[Node]) -> Option<String> {
    let significant: Vec<&Node> = from.iter().filter(|n| !n.is_trivia()).collect();
    let mut i = 0;
    let mut name = String::new();
    match significant.first() {
        Some(node) if node.is_group() => i = 1,
        Some(node) if is_name(node) => {
            name.push_str(&node.render());
            i = 1;
            while i + 1 < significant.len() && significant[i].is_kind(TokenKind::Dot) && is_name(significant[i + 1]) {
                name.push('.');
                name.push_str(&significant[i + 1].render());
                i += 2;
            }
        }
        _ => return None,
    }
    if significant.get(i).is_some_and(|n| n.is_word("AS")) {
        i += 1;
    }
    match significant.get(i) {
        Some(alias) if is_name(alias) && i + 1 == significant.len() => Some(alias.render()),
        None if !name.is_empty() => Some(name),
        _ => None,
    }
}

/// Output column names of a select list, or `None` if any item has no
/// name an outer query could reference.
fn output_names(list: &[Node]) -> Option<Vec<String>> {
    split_commas(list)
        .into_iter()
        .map(|item| {
            let parts: Vec<&Node> = item.iter().filter(|n| !n.is_trivia()).collect();
            let last = *parts.last()?;
            if !is_name(last) {
                return None;
            }
            if parts.len() == 1 {
                return Some(last.render());
            }
            let before = parts[parts.len() - 2];
            let qualified_column = parts
                .iter()
                .enumerate()
                .all(|(k, n)| if k % 2 == 0 { is_name(n) } else { n.is_kind(TokenKind::Dot) });
            if qualified_column || before.is_word("AS") || before.is_operand() {
                Some(last.render())
            } else {
                None
            }
        })
        .collect()
}

/// Render an ORDER BY list with table qualifiers dropped.
fn unqualified(nodes: &[Node]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < nodes.len() {
        if is_name(&nodes[i]) && nodes.get(i + 1).is_some_and(|n| n.is_kind(TokenKind::Dot)) {
            i += 2;
            continue;
        }
        nodes[i].render_into(&mut out);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::parser::parse;
    use pretty_assertions::assert_eq;

    fn rewrite(sql: &str) -> (String, Vec<Issue>, usize) {
        let mut script = parse(sql).unwrap();
        let mut rewriter = Rewriter::new();
        for statement in &mut script.statements {
            rewriter.rewrite_statement(statement);
        }
        let (issues, unsupported) = rewriter.finish();
        (script.render(), issues, unsupported)
    }

    #[test]
    fn test_sel_abbreviation() {
        let (sql, issues, _) = rewrite("SEL a,b FROM t;");
        assert_eq!(sql, "SELECT a,b FROM t;");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Warning);
    }

    #[test]
    fn test_sel_as_column_name_untouched() {
        let (sql, issues, _) = rewrite("SELECT t.sel, sel + 1 FROM t");
        assert_eq!(sql, "SELECT t.sel, sel + 1 FROM t");
        assert!(issues.is_empty());
    }

    #[test]
    fn test_abbreviations_as_column_names_untouched() {
        let sql = "SELECT sel, ins, del FROM t;\nSELECT a AS x, b sel FROM t WHERE sel > 1;";
        let (out, issues, _) = rewrite(sql);
        assert_eq!(out, sql);
        assert!(issues.is_empty());
    }

    #[test]
    fn test_sel_at_query_starts() {
        let (sql, issues, _) = rewrite("SEL a FROM t UNION ALL SEL b FROM (SEL b FROM u) x;");
        assert_eq!(sql, "SELECT a FROM t UNION ALL SELECT b FROM (SELECT b FROM u) x;");
        assert_eq!(issues.len(), 3);

        let (sql, _, _) = rewrite("INS INTO t (a) SEL a FROM u;");
        assert_eq!(sql, "INSERT INTO t (a) SELECT a FROM u;");
    }

    #[test]
    fn test_date_literal() {
        let (sql, _, _) = rewrite("SELECT * FROM t WHERE d > DATE '2024-01-31'");
        assert_eq!(sql, "SELECT * FROM t WHERE d > DATE('2024-01-31')");
    }

    #[test]
    fn test_current_date() {
        let (sql, _, _) = rewrite("SELECT a FROM t WHERE d = DATE");
        assert_eq!(sql, "SELECT a FROM t WHERE d = CURRENT DATE");
        let (sql, issues, _) = rewrite("SELECT CAST(x AS DATE) FROM t WHERE d = CURRENT DATE");
        assert_eq!(sql, "SELECT CAST(x AS DATE) FROM t WHERE d = CURRENT DATE");
        assert!(issues.is_empty());
    }

    #[test]
    fn test_interval() {
        let (sql, issues, _) = rewrite("SELECT CURRENT_DATE + INTERVAL '3' DAY");
        assert_eq!(sql, "SELECT CURRENT_DATE + 3 DAYS");
        assert_eq!(issues[0].solution.as_deref(), Some("Converted INTERVAL '3' DAY to 3 DAYS"));
    }

    #[test]
    fn test_functions() {
        let (sql, issues, _) = rewrite("SELECT ZEROIFNULL(a), NULLIFZERO(b), CHARACTERS(c), INDEX(d, 'x') FROM t");
        assert_eq!(sql, "SELECT COALESCE(a, 0), NULLIF(b, 0), LENGTH(c), LOCATE('x', d) FROM t");
        assert_eq!(issues.len(), 4);
    }

    #[test]
    fn test_mod_infix() {
        let (sql, _, _) = rewrite("SELECT t.a MOD 7 FROM t WHERE ZEROIFNULL(b) MOD (c + 1) = 0");
        assert_eq!(sql, "SELECT MOD(t.a, 7) FROM t WHERE MOD(COALESCE(b, 0), (c + 1)) = 0");
        let (sql, issues, _) = rewrite("SELECT MOD(a, 7) FROM t");
        assert_eq!(sql, "SELECT MOD(a, 7) FROM t");
        assert!(issues.is_empty());
    }

    #[test]
    fn test_inequality() {
        let (sql, issues, _) = rewrite("SELECT a FROM t WHERE a NE 1 AND b ^= 2");
        assert_eq!(sql, "SELECT a FROM t WHERE a <> 1 AND b <> 2");
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn test_top() {
        let (sql, _, _) = rewrite("SELECT TOP 10 a FROM t ORDER BY a;");
        assert_eq!(sql, "SELECT a FROM t ORDER BY a FETCH FIRST 10 ROWS ONLY;");
    }

    #[test]
    fn test_top_in_union_branch() {
        let (sql, issues, _) = rewrite("SEL TOP 5 a FROM t UNION ALL SELECT TOP 2 b FROM u;");
        assert_eq!(
            sql,
            "(SELECT a FROM t FETCH FIRST 5 ROWS ONLY) UNION ALL (SELECT b FROM u FETCH FIRST 2 ROWS ONLY);"
        );
        assert_eq!(issues.len(), 3);

        let (sql, _, _) = rewrite("SELECT a FROM t UNION SELECT b FROM u FETCH FIRST 3 ROWS ONLY;");
        assert_eq!(sql, "SELECT a FROM t UNION SELECT b FROM u FETCH FIRST 3 ROWS ONLY;");
    }

    #[test]
    fn test_qualify_star() {
        let (sql, issues, unsupported) =
            rewrite("SELECT * FROM t QUALIFY ROW_NUMBER() OVER (PARTITION BY a ORDER BY b DESC)=1;");
        assert_eq!(
            sql,
            "SELECT * FROM (SELECT t.*, ROW_NUMBER() OVER (PARTITION BY a ORDER BY b DESC) AS WINDOW_RN FROM t) AS WINDOW_T WHERE WINDOW_RN=1;"
        );
        assert_eq!(unsupported, 0);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Error);
        assert_eq!(issues[0].line, 1);
    }

    #[test]
    fn test_qualify_named_columns() {
        let (sql, _, _) = rewrite(
            "SELECT e.id, e.dept, SUM(s) AS total FROM emp e WHERE e.active = 1 GROUP BY e.id, e.dept\nQUALIFY RANK() OVER (PARTITION BY e.dept ORDER BY SUM(s) DESC) <= 3 ORDER BY e.dept",
        );
        assert_eq!(
            sql,
            "SELECT id, dept, total FROM (SELECT e.id, e.dept, SUM(s) AS total, RANK() OVER (PARTITION BY e.dept ORDER BY SUM(s) DESC) AS WINDOW_RN FROM emp e WHERE e.active = 1 GROUP BY e.id, e.dept) AS WINDOW_T WHERE WINDOW_RN <= 3 ORDER BY dept"
        );
    }

    #[test]
    fn test_qualify_reads_columns_outside_select_list() {
        let (sql, _, _) = rewrite(
            "SELECT e.id, e.name FROM emp e QUALIFY ROW_NUMBER() OVER (PARTITION BY e.dept ORDER BY e.hired) = 1 AND e.active = 1 ORDER BY e.hired DESC, e.id",
        );
        assert_eq!(
            sql,
            "SELECT id, name FROM (SELECT e.id, e.name, ROW_NUMBER() OVER (PARTITION BY e.dept ORDER BY e.hired) AS WINDOW_RN, e.active AS WINDOW_C1, e.hired AS WINDOW_C2 FROM emp e) AS WINDOW_T WHERE WINDOW_RN = 1 AND WINDOW_C1 = 1 ORDER BY WINDOW_C2 DESC, id"
        );
    }

    #[test]
    fn test_qualify_star_drops_qualifiers() {
        let (sql, _, _) = rewrite("SELECT * FROM emp e QUALIFY RANK() OVER (ORDER BY e.pay) <= 2 AND e.dept = 'X'");
        assert_eq!(
            sql,
            "SELECT * FROM (SELECT e.*, RANK() OVER (ORDER BY e.pay) AS WINDOW_RN FROM emp e) AS WINDOW_T WHERE WINDOW_RN <= 2 AND dept = 'X'"
        );
    }

    #[test]
    fn test_qualify_in_subquery() {
        let (sql, issues, _) = rewrite(
            "SELECT x FROM (SEL x FROM t QUALIFY ROW_NUMBER() OVER (ORDER BY x) = 1) d",
        );
        assert_eq!(
            sql,
            "SELECT x FROM (SELECT x FROM (SELECT x, ROW_NUMBER() OVER (ORDER BY x) AS WINDOW_RN FROM t) AS WINDOW_T WHERE WINDOW_RN = 1) d"
        );
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn test_unsupported_marker_not_duplicated() {
        let (sql, issues, unsupported) = rewrite("SELECT a FROM t SAMPLE 10;");
        assert_eq!(sql, "SELECT a FROM t /* UNSUPPORTED(dbshift): SAMPLE clause */ SAMPLE 10;");
        assert_eq!(unsupported, 1);
        assert_eq!(issues[0].severity, Severity::Error);

        let (again, _, _) = rewrite(&sql);
        assert_eq!(again, sql);
    }

    #[test]
    fn test_bteq_command() {
        let (sql, _, unsupported) = rewrite(".LOGON tdpid/user,pass;\nSELECT 1;");
        assert_eq!(
            sql,
            "/* UNSUPPORTED(dbshift): BTEQ command .LOGON */ .LOGON tdpid/user,pass;\nSELECT 1;"
        );
        assert_eq!(unsupported, 1);
    }

    #[test]
    fn test_dml_abbreviations() {
        let (sql, issues, _) = rewrite("INS INTO t VALUES (1);\nUPD t SET a = 2;\nDEL FROM t ALL;");
        assert_eq!(sql, "INSERT INTO t VALUES (1);\nUPDATE t SET a = 2;\nDELETE FROM t;");
        let lines: Vec<usize> = issues.iter().map(|i| i.line).collect();
        assert_eq!(lines, vec![1, 2, 3, 3]);
    }

    #[test]
    fn test_strings_and_comments_untouched() {
        let sql = "SELECT 'SEL x QUALIFY' /* SEL TOP 5 */ FROM t -- ZEROIFNULL(a)\n";
        let (out, issues, _) = rewrite(sql);
        assert_eq!(out, sql);
        assert!(issues.is_empty());
    }
}
