//! Token tree and statement structure for the dialect translator.
//!
//! The tree is deliberately shallow: parenthesised groups nest, everything
//! else is a flat token run. Rendering a tree reproduces its source text
//! exactly, so rewrite rules only have to touch the nodes they change.

use super::lexer::{Token, TokenKind};

/// Words that never act as a column name or operand.
pub const RESERVED_WORDS: &[&str] = &[
    "select", "sel", "from", "where", "group", "order", "by", "having", "qualify", "union",
    "intersect", "except", "minus", "all", "distinct", "join", "left", "right", "inner",
    "outer", "full", "cross", "on", "using", "and", "or", "not", "null", "is", "in", "like",
    "between", "as", "case", "when", "then", "else", "end", "exists", "insert", "update",
    "delete", "into", "values", "set", "create", "replace", "drop", "alter", "table", "view",
    "procedure", "begin", "declare", "if", "while", "loop", "for", "do", "return", "top",
    "sample", "fetch", "first", "rows", "only", "mod", "ne", "with", "over", "partition",
];

pub fn is_reserved(word: &str) -> bool {
    let lower = word.to_ascii_lowercase();
    RESERVED_WORDS.contains(&lower.as_str())
}

/// A parenthesised group. `close` is `None` when the input ends before the
/// matching `)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub open: Token,
    pub children: Vec<Node>,
    pub close: Option<Token>,
}

impl Group {
    /// A well-formed group built by a rewrite rule.
    pub fn synthetic(children: Vec<Node>, line: usize) -> Self {
        Self {
            open: Token::new(TokenKind::LParen, "(", line),
            children,
            close: Some(Token::new(TokenKind::RParen, ")", line)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Token(Token),
    Group(Group),
}

impl Node {
    pub fn token(kind: TokenKind, text: impl Into<String>, line: usize) -> Self {
        Node::Token(Token::new(kind, text, line))
    }

    pub fn word(text: impl Into<String>, line: usize) -> Self {
        Self::token(TokenKind::Word, text, line)
    }

    pub fn space(line: usize) -> Self {
        Self::token(TokenKind::Whitespace, " ", line)
    }

    pub fn as_token(&self) -> Option<&Token> {
        match self {
            Node::Token(t) => Some(t),
            Node::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Node::Group(g) => Some(g),
            Node::Token(_) => None,
        }
    }

    pub fn is_trivia(&self) -> bool {
        self.as_token().is_some_and(Token::is_trivia)
    }

    pub fn is_word(&self, word: &str) -> bool {
        self.as_token().is_some_and(|t| t.is_word(word))
    }

    pub fn is_kind(&self, kind: TokenKind) -> bool {
        self.as_token().is_some_and(|t| t.kind == kind)
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Node::Group(_))
    }

    /// Line of the first token of this node.
    pub fn line(&self) -> usize {
        match self {
            Node::Token(t) => t.line,
            Node::Group(g) => g.open.line,
        }
    }

    /// Upper-cased word text, if this node is a word.
    pub fn keyword(&self) -> Option<String> {
        self.as_token()
            .filter(|t| t.kind == TokenKind::Word)
            .map(|t| t.text.to_ascii_uppercase())
    }

    /// True for nodes that can stand as a value in an expression.
    pub fn is_operand(&self) -> bool {
        match self {
            Node::Group(_) => true,
            Node::Token(t) => match t.kind {
                TokenKind::Word => !is_reserved(&t.text),
                TokenKind::QuotedIdent | TokenKind::String | TokenKind::Number => true,
                _ => false,
            },
        }
    }

    pub fn render_into(&self, out: &mut String) {
        match self {
            Node::Token(t) => out.push_str(&t.text),
            Node::Group(g) => {
                out.push_str(&g.open.text);
                for child in &g.children {
                    child.render_into(out);
                }
                if let Some(close) = &g.close {
                    out.push_str(&close.text);
                }
            }
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    /// Depth-first visit of every token, group delimiters included.
    pub fn for_each_token<'a>(&'a self, f: &mut impl FnMut(&'a Token)) {
        match self {
            Node::Token(t) => f(t),
            Node::Group(g) => {
                f(&g.open);
                for child in &g.children {
                    child.for_each_token(f);
                }
                if let Some(close) = &g.close {
                    f(close);
                }
            }
        }
    }
}

pub fn render(nodes: &[Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        node.render_into(&mut out);
    }
    out
}

/// Render with leading and trailing trivia dropped.
pub fn render_trimmed(nodes: &[Node]) -> String {
    render(trim(nodes))
}

/// Slice without leading and trailing whitespace or comments.
pub fn trim(nodes: &[Node]) -> &[Node] {
    let start = nodes.iter().position(|n| !n.is_trivia()).unwrap_or(nodes.len());
    let end = nodes
        .iter()
        .rposition(|n| !n.is_trivia())
        .map(|i| i + 1)
        .unwrap_or(start);
    &nodes[start..end.max(start)]
}

/// Index of the first non-trivia node at or after `from`.
pub fn next_significant(nodes: &[Node], from: usize) -> Option<usize> {
    (from..nodes.len()).find(|&i| !nodes[i].is_trivia())
}

/// Index of the last non-trivia node before `before`.
pub fn prev_significant(nodes: &[Node], before: usize) -> Option<usize> {
    (0..before.min(nodes.len())).rev().find(|&i| !nodes[i].is_trivia())
}

/// Split a node run on top-level commas.
pub fn split_commas(nodes: &[Node]) -> Vec<&[Node]> {
    nodes
        .split(|n| n.is_kind(TokenKind::Comma))
        .collect()
}

/// One SQL statement, including its trailing `;` and any trivia before it.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub nodes: Vec<Node>,
}

impl Statement {
    pub fn render(&self) -> String {
        render(&self.nodes)
    }

    /// True when the statement holds nothing but whitespace and comments.
    pub fn is_blank(&self) -> bool {
        self.nodes.iter().all(Node::is_trivia)
    }

    /// First significant word, upper-cased.
    pub fn leading_keyword(&self) -> Option<String> {
        next_significant(&self.nodes, 0).and_then(|i| self.nodes[i].keyword())
    }
}

/// A whole input text split into statements.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Script {
    pub statements: Vec<Statement>,
}

impl Script {
    pub fn render(&self) -> String {
        self.statements.iter().map(Statement::render).collect()
    }
}

/// Clauses of a query block, in the order Teradata evaluates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClauseKind {
    Select,
    From,
    Where,
    GroupBy,
    Having,
    Qualify,
    OrderBy,
    Fetch,
}

/// A clause within a node run.
///
/// `start` is the index of the introducing keyword, `body` the index just
/// past the keyword(s), `end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clause {
    pub kind: ClauseKind,
    pub start: usize,
    pub body: usize,
    pub end: usize,
}

/// One `SELECT ...` query block at a single nesting level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectBlock {
    pub start: usize,
    /// Exclusive; trailing trivia is not part of the block.
    pub end: usize,
    pub clauses: Vec<Clause>,
}

impl SelectBlock {
    pub fn clause(&self, kind: ClauseKind) -> Option<&Clause> {
        self.clauses.iter().find(|c| c.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_and_render() {
        let nodes = vec![
            Node::space(1),
            Node::word("a", 1),
            Node::token(TokenKind::LineComment, "-- x", 1),
        ];
        assert_eq!(render(&nodes), " a-- x");
        assert_eq!(render_trimmed(&nodes), "a");
        assert_eq!(trim(&[Node::space(1)]).len(), 0);
    }

    #[test]
    fn test_significant_navigation() {
        let nodes = vec![Node::word("a", 1), Node::space(1), Node::word("b", 1)];
        assert_eq!(next_significant(&nodes, 1), Some(2));
        assert_eq!(prev_significant(&nodes, 2), Some(0));
        assert_eq!(prev_significant(&nodes, 0), None);
    }

    #[test]
    fn test_operand_classification() {
        assert!(Node::word("amount", 1).is_operand());
        assert!(!Node::word("WHERE", 1).is_operand());
        assert!(Node::Group(Group::synthetic(vec![], 1)).is_operand());
    }
}
