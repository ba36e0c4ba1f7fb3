//! Recursive-descent structure parser.
//!
//! Builds the token tree, splits it into statements and locates query
//! blocks with their clause boundaries. Nothing here changes the text.

use super::ast::*;
use super::lexer::{tokenize, Token, TokenKind};
use crate::error::ShiftResult;

/// Parse a complete SQL script.
pub fn parse(input: &str) -> ShiftResult<Script> {
    let tokens = tokenize(input)?;
    let nodes = build_tree(tokens);
    Ok(Script {
        statements: split_statements(nodes),
    })
}

/// Nest tokens by parentheses. A stray `)` stays a plain token; groups still
/// open at end of input are closed implicitly with `close: None`.
pub fn build_tree(tokens: Vec<Token>) -> Vec<Node> {
    let mut stack: Vec<(Token, Vec<Node>)> = Vec::new();
    let mut root = Vec::new();

    for token in tokens {
        match token.kind {
            TokenKind::LParen => stack.push((token, Vec::new())),
            TokenKind::RParen => match stack.pop() {
                Some((open, children)) => {
                    let group = Node::Group(Group {
                        open,
                        children,
                        close: Some(token),
                    });
                    current(&mut stack, &mut root).push(group);
                }
                None => root.push(Node::Token(token)),
            },
            _ => current(&mut stack, &mut root).push(Node::Token(token)),
        }
    }

    while let Some((open, children)) = stack.pop() {
        let group = Node::Group(Group {
            open,
            children,
            close: None,
        });
        current(&mut stack, &mut root).push(group);
    }

    root
}

fn current<'a>(stack: &'a mut [(Token, Vec<Node>)], root: &'a mut Vec<Node>) -> &'a mut Vec<Node> {
    match stack.last_mut() {
        Some((_, children)) => children,
        None => root,
    }
}

/// True when the run starts a routine definition whose body may contain
/// `;` inside `BEGIN ... END`.
pub fn is_routine_definition(nodes: &[Node]) -> bool {
    let words: Vec<String> = nodes
        .iter()
        .filter(|n| !n.is_trivia())
        .take(4)
        .map(|n| n.keyword().unwrap_or_default())
        .collect();
    let words: Vec<&str> = words.iter().map(String::as_str).collect();
    let body = match words.as_slice() {
        ["CREATE", "OR", "REPLACE", kind, ..] => *kind,
        ["CREATE", kind, ..] | ["REPLACE", kind, ..] => *kind,
        _ => return false,
    };
    matches!(body, "PROCEDURE" | "FUNCTION" | "TRIGGER")
}

/// Split top-level nodes into statements on `;`.
///
/// Inside routine definitions the split only happens once every `BEGIN`
/// (and `CASE`) has been closed by its `END`.
pub fn split_statements(nodes: Vec<Node>) -> Vec<Statement> {
    let boundaries = statement_boundaries(&nodes);
    let mut statements = Vec::new();
    let mut current = Vec::new();
    let mut boundaries = boundaries.into_iter().peekable();

    for (i, node) in nodes.into_iter().enumerate() {
        current.push(node);
        if boundaries.peek() == Some(&i) {
            boundaries.next();
            statements.push(Statement {
                nodes: std::mem::take(&mut current),
            });
        }
    }
    if !current.is_empty() {
        statements.push(Statement { nodes: current });
    }
    statements
}

fn statement_boundaries(nodes: &[Node]) -> Vec<usize> {
    let mut boundaries = Vec::new();
    let mut at_start = true;
    let mut routine = false;
    let mut depth: i32 = 0;
    let mut skip_case_at = None;

    for (i, node) in nodes.iter().enumerate() {
        if node.is_trivia() {
            continue;
        }
        if at_start {
            routine = is_routine_definition(&nodes[i..]);
            depth = 0;
            at_start = false;
        }
        if node.is_kind(TokenKind::Semicolon) {
            if depth <= 0 {
                boundaries.push(i);
                at_start = true;
            }
            continue;
        }
        if !routine {
            continue;
        }
        match node.keyword().as_deref() {
            Some("BEGIN") => depth += 1,
            Some("CASE") if skip_case_at != Some(i) => depth += 1,
            Some("END") => {
                let next = next_significant(nodes, i + 1);
                let closes = next
                    .and_then(|j| nodes[j].keyword())
                    .map(|w| !matches!(w.as_str(), "IF" | "LOOP" | "WHILE" | "FOR" | "REPEAT"))
                    .unwrap_or(true);
                if closes {
                    depth -= 1;
                }
                if let Some(j) = next {
                    if nodes[j].is_word("CASE") {
                        skip_case_at = Some(j);
                    }
                }
            }
            _ => {}
        }
    }
    boundaries
}

fn is_select_keyword(node: &Node) -> bool {
    node.is_word("SELECT") || node.is_word("SEL")
}

/// Locate every query block in a node run (this level only).
pub fn select_blocks(nodes: &[Node]) -> Vec<SelectBlock> {
    let mut blocks = Vec::new();
    let mut i = 0;
    while i < nodes.len() {
        if is_select_keyword(&nodes[i]) {
            let block = parse_block(nodes, i);
            i = block.end.max(i + 1);
            blocks.push(block);
        } else {
            i += 1;
        }
    }
    blocks
}

fn parse_block(nodes: &[Node], start: usize) -> SelectBlock {
    let mut clauses = vec![Clause {
        kind: ClauseKind::Select,
        start,
        body: start + 1,
        end: nodes.len(),
    }];
    let mut end = nodes.len();
    let mut i = start + 1;

    while i < nodes.len() {
        let node = &nodes[i];
        if node.is_kind(TokenKind::Semicolon) {
            end = i;
            break;
        }
        let Some(word) = node.keyword() else {
            i += 1;
            continue;
        };
        let follower = next_significant(nodes, i + 1);
        let followed_by = |w: &str| follower.is_some_and(|j| nodes[j].is_word(w));
        let clause = match word.as_str() {
            "UNION" | "INTERSECT" | "EXCEPT" | "MINUS" | "SELECT" | "SEL" => {
                end = i;
                break;
            }
            "FROM" => Some((ClauseKind::From, i + 1)),
            "WHERE" => Some((ClauseKind::Where, i + 1)),
            "HAVING" => Some((ClauseKind::Having, i + 1)),
            "QUALIFY" => Some((ClauseKind::Qualify, i + 1)),
            "GROUP" if followed_by("BY") => follower.map(|j| (ClauseKind::GroupBy, j + 1)),
            "ORDER" if followed_by("BY") => follower.map(|j| (ClauseKind::OrderBy, j + 1)),
            "FETCH" if followed_by("FIRST") || followed_by("NEXT") => {
                Some((ClauseKind::Fetch, i + 1))
            }
            _ => None,
        };
        if let Some((kind, body)) = clause {
            if let Some(last) = clauses.last_mut() {
                last.end = i;
            }
            clauses.push(Clause {
                kind,
                start: i,
                body,
                end: nodes.len(),
            });
            i = body;
        } else {
            i += 1;
        }
    }

    let end = prev_significant(nodes, end).map(|j| j + 1).unwrap_or(start + 1).max(start + 1);
    for clause in &mut clauses {
        clause.end = clause.end.min(end);
        clause.body = clause.body.min(clause.end);
    }
    if let Some(last) = clauses.last_mut() {
        last.end = end;
    }

    SelectBlock { start, end, clauses }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statements(sql: &str) -> Vec<String> {
        parse(sql)
            .unwrap()
            .statements
            .iter()
            .map(Statement::render)
            .collect()
    }

    #[test]
    fn test_parse_is_lossless() {
        let sql = "SELECT (a + (b)) FROM t;\n-- done\n";
        assert_eq!(parse(sql).unwrap().render(), sql);
    }

    #[test]
    fn test_split_statements() {
        assert_eq!(
            statements("SELECT 1; SELECT 2;\nSELECT ';'"),
            vec!["SELECT 1;", " SELECT 2;", "\nSELECT ';'"]
        );
    }

    #[test]
    fn test_procedure_body_kept_whole() {
        let sql = "REPLACE PROCEDURE p()\nBEGIN\n  IF x = 1 THEN\n    SET y = 2;\n  END IF;\n  CASE WHEN a THEN SET b = 1; END CASE;\nEND;\nSELECT 1;";
        let parts = statements(sql);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].ends_with("END;"));
        assert_eq!(parts[1], "\nSELECT 1;");
    }

    #[test]
    fn test_unbalanced_parens_survive() {
        let sql = "SELECT (a FROM t";
        assert_eq!(parse(sql).unwrap().render(), sql);
        let sql = "SELECT a) FROM t";
        assert_eq!(parse(sql).unwrap().render(), sql);
    }

    #[test]
    fn test_select_block_clauses() {
        let script = parse("SELECT a, b FROM t WHERE a > 1 QUALIFY x = 1 ORDER BY b ;").unwrap();
        let nodes = &script.statements[0].nodes;
        let blocks = select_blocks(nodes);
        assert_eq!(blocks.len(), 1);
        let kinds: Vec<ClauseKind> = blocks[0].clauses.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ClauseKind::Select,
                ClauseKind::From,
                ClauseKind::Where,
                ClauseKind::Qualify,
                ClauseKind::OrderBy
            ]
        );
        let order = blocks[0].clause(ClauseKind::OrderBy).unwrap();
        assert_eq!(render_trimmed(&nodes[order.body..order.end]), "b");
        assert_eq!(render(&nodes[blocks[0].start..blocks[0].end]).trim_end(), "SELECT a, b FROM t WHERE a > 1 QUALIFY x = 1 ORDER BY b");
    }

    #[test]
    fn test_nested_clauses_stay_in_groups() {
        let script = parse("SELECT SUBSTRING(x FROM 2), ROW_NUMBER() OVER (ORDER BY y) FROM t").unwrap();
        let blocks = select_blocks(&script.statements[0].nodes);
        assert_eq!(blocks[0].clauses.len(), 2);
    }

    #[test]
    fn test_union_splits_blocks() {
        let script = parse("SELECT a FROM t UNION ALL SEL a FROM u").unwrap();
        assert_eq!(select_blocks(&script.statements[0].nodes).len(), 2);
    }
}
