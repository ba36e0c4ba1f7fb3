//! Row filter with WHERE-clause syntax, evaluated in-process so both sides
//! of a comparison are filtered identically regardless of database.
//!
//! Supported: comparisons (`= <> != ^= < <= > >=`), `AND`, `OR`, `NOT`,
//! `IS [NOT] NULL`, `[NOT] IN (...)`, `[NOT] BETWEEN .. AND ..`,
//! `[NOT] LIKE '...'` and parentheses. Evaluation follows SQL three-valued
//! logic; a row passes only when the predicate is TRUE.

use std::cmp::Ordering;

use crate::error::{ShiftError, ShiftResult};
use crate::translator::lexer::{Token, TokenKind, tokenize};

use super::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    fn from_operator(text: &str) -> Option<Self> {
        match text {
            "=" => Some(CompareOp::Eq),
            "<>" | "!=" | "^=" => Some(CompareOp::NotEq),
            "<" => Some(CompareOp::Lt),
            "<=" => Some(CompareOp::LtEq),
            ">" => Some(CompareOp::Gt),
            ">=" => Some(CompareOp::GtEq),
            _ => None,
        }
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::NotEq => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::LtEq => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::GtEq => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Column(String),
    /// Column resolved to its position in a row.
    Index(usize),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CompareOp, Operand),
    IsNull { operand: Operand, negated: bool },
    InList { operand: Operand, list: Vec<Operand>, negated: bool },
    Between { operand: Operand, low: Operand, high: Operand, negated: bool },
    Like { operand: Operand, pattern: String, negated: bool },
}

/// A parsed row filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    text: String,
    expr: Expr,
}

impl Predicate {
    /// Parse predicate text. A leading `WHERE` is accepted and ignored.
    pub fn parse(text: &str) -> ShiftResult<Self> {
        let tokens: Vec<Token> = tokenize(text)?.into_iter().filter(|t| !t.is_trivia()).collect();
        let mut parser = PredicateParser { tokens: &tokens, pos: 0 };
        if parser.peek_word("WHERE") {
            parser.pos += 1;
        }
        if parser.at_end() {
            return Err(invalid("empty predicate"));
        }
        let expr = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(invalid(format!("unexpected '{}' at line {}", token.text, token.line)));
        }
        Ok(Self {
            text: text.trim().to_string(),
            expr,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Column names referenced, in order of first use.
    pub fn columns(&self) -> Vec<String> {
        let mut names = Vec::new();
        visit_operands(&self.expr, &mut |operand| {
            if let Operand::Column(name) = operand {
                if !names.iter().any(|n: &String| n.eq_ignore_ascii_case(name)) {
                    names.push(name.clone());
                }
            }
        });
        names
    }

    /// Resolve column names against a stream's columns (case-insensitive).
    pub fn bind(&self, columns: &[String]) -> ShiftResult<BoundPredicate> {
        let expr = bind_expr(&self.expr, columns)?;
        Ok(BoundPredicate { expr })
    }
}

/// A predicate whose columns are resolved to row positions.
#[derive(Debug, Clone)]
pub struct BoundPredicate {
    expr: Expr,
}

impl BoundPredicate {
    pub fn matches(&self, row: &[Value]) -> bool {
        evaluate(&self.expr, row) == Some(true)
    }
}

fn invalid(message: impl Into<String>) -> ShiftError {
    ShiftError::InvalidRequest(format!("invalid predicate: {}", message.into()))
}

fn visit_operands(expr: &Expr, f: &mut impl FnMut(&Operand)) {
    match expr {
        Expr::And(a, b) | Expr::Or(a, b) => {
            visit_operands(a, f);
            visit_operands(b, f);
        }
        Expr::Not(inner) => visit_operands(inner, f),
        Expr::Compare(a, _, b) => {
            f(a);
            f(b);
        }
        Expr::IsNull { operand, .. } | Expr::Like { operand, .. } => f(operand),
        Expr::InList { operand, list, .. } => {
            f(operand);
            for item in list {
                f(item);
            }
        }
        Expr::Between { operand, low, high, .. } => {
            f(operand);
            f(low);
            f(high);
        }
    }
}

fn bind_operand(operand: &Operand, columns: &[String]) -> ShiftResult<Operand> {
    match operand {
        Operand::Column(name) => columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .map(Operand::Index)
            .ok_or_else(|| ShiftError::SchemaMismatch(format!("predicate column '{}' does not exist", name))),
        other => Ok(other.clone()),
    }
}

fn bind_expr(expr: &Expr, columns: &[String]) -> ShiftResult<Expr> {
    Ok(match expr {
        Expr::And(a, b) => Expr::And(Box::new(bind_expr(a, columns)?), Box::new(bind_expr(b, columns)?)),
        Expr::Or(a, b) => Expr::Or(Box::new(bind_expr(a, columns)?), Box::new(bind_expr(b, columns)?)),
        Expr::Not(inner) => Expr::Not(Box::new(bind_expr(inner, columns)?)),
        Expr::Compare(a, op, b) => Expr::Compare(bind_operand(a, columns)?, *op, bind_operand(b, columns)?),
        Expr::IsNull { operand, negated } => Expr::IsNull {
            operand: bind_operand(operand, columns)?,
            negated: *negated,
        },
        Expr::InList { operand, list, negated } => Expr::InList {
            operand: bind_operand(operand, columns)?,
            list: list
                .iter()
                .map(|item| bind_operand(item, columns))
                .collect::<ShiftResult<Vec<_>>>()?,
            negated: *negated,
        },
        Expr::Between { operand, low, high, negated } => Expr::Between {
            operand: bind_operand(operand, columns)?,
            low: bind_operand(low, columns)?,
            high: bind_operand(high, columns)?,
            negated: *negated,
        },
        Expr::Like { operand, pattern, negated } => Expr::Like {
            operand: bind_operand(operand, columns)?,
            pattern: pattern.clone(),
            negated: *negated,
        },
    })
}

fn resolve<'a>(operand: &'a Operand, row: &'a [Value]) -> &'a Value {
    const NULL: &Value = &Value::Null;
    match operand {
        Operand::Index(i) => row.get(*i).unwrap_or(NULL),
        Operand::Literal(value) => value,
        Operand::Column(_) => NULL,
    }
}

fn negate(value: Option<bool>, negated: bool) -> Option<bool> {
    if negated { value.map(|b| !b) } else { value }
}

fn evaluate(expr: &Expr, row: &[Value]) -> Option<bool> {
    match expr {
        Expr::And(a, b) => match (evaluate(a, row), evaluate(b, row)) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        Expr::Or(a, b) => match (evaluate(a, row), evaluate(b, row)) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        Expr::Not(inner) => evaluate(inner, row).map(|b| !b),
        Expr::Compare(a, op, b) => resolve(a, row)
            .sql_cmp(resolve(b, row))
            .map(|ordering| op.holds(ordering)),
        Expr::IsNull { operand, negated } => Some(resolve(operand, row).is_null() != *negated),
        Expr::InList { operand, list, negated } => {
            let value = resolve(operand, row);
            let mut saw_null = false;
            for item in list {
                match value.sql_cmp(resolve(item, row)) {
                    Some(Ordering::Equal) => return negate(Some(true), *negated),
                    Some(_) => {}
                    None => saw_null = true,
                }
            }
            negate(if saw_null { None } else { Some(false) }, *negated)
        }
        Expr::Between { operand, low, high, negated } => {
            let value = resolve(operand, row);
            let above = value.sql_cmp(resolve(low, row)).map(|o| o != Ordering::Less);
            let below = value.sql_cmp(resolve(high, row)).map(|o| o != Ordering::Greater);
            let inside = match (above, below) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            };
            negate(inside, *negated)
        }
        Expr::Like { operand, pattern, negated } => {
            let value = resolve(operand, row);
            let text = value.canonical()?;
            let pattern: Vec<char> = pattern.chars().collect();
            let text: Vec<char> = text.chars().collect();
            negate(Some(like_matches(&pattern, &text)), *negated)
        }
    }
}

/// `%` matches any run, `_` any single character.
fn like_matches(pattern: &[char], text: &[char]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

struct PredicateParser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> PredicateParser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek_word(&self, word: &str) -> bool {
        self.peek().is_some_and(|t| t.is_word(word))
    }

    fn peek_word_at(&self, offset: usize, word: &str) -> bool {
        self.tokens.get(self.pos + offset).is_some_and(|t| t.is_word(word))
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.peek_word(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_kind(&mut self, kind: TokenKind, what: &str) -> ShiftResult<&'a Token> {
        match self.peek() {
            Some(token) if token.kind == kind => {
                self.pos += 1;
                Ok(token)
            }
            Some(token) => Err(invalid(format!("expected {} but found '{}'", what, token.text))),
            None => Err(invalid(format!("expected {} but the predicate ended", what))),
        }
    }

    fn parse_or(&mut self) -> ShiftResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_word("OR") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ShiftResult<Expr> {
        let mut left = self.parse_not()?;
        while self.eat_word("AND") {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> ShiftResult<Expr> {
        if self.eat_word("NOT") {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_condition()
    }

    fn parse_condition(&mut self) -> ShiftResult<Expr> {
        if self.peek().is_some_and(|t| t.kind == TokenKind::LParen) && !self.parenthesised_operand() {
            self.pos += 1;
            let inner = self.parse_or()?;
            self.expect_kind(TokenKind::RParen, "')'")?;
            return Ok(inner);
        }

        let operand = self.parse_operand()?;

        if self.eat_word("IS") {
            let negated = self.eat_word("NOT");
            if !self.eat_word("NULL") {
                return Err(invalid("expected NULL after IS"));
            }
            return Ok(Expr::IsNull { operand, negated });
        }

        let negated = self.peek_word("NOT")
            && (self.peek_word_at(1, "IN") || self.peek_word_at(1, "BETWEEN") || self.peek_word_at(1, "LIKE"));
        if negated {
            self.pos += 1;
        }

        if self.eat_word("IN") {
            self.expect_kind(TokenKind::LParen, "'(' after IN")?;
            let mut list = vec![self.parse_operand()?];
            while self.peek().is_some_and(|t| t.kind == TokenKind::Comma) {
                self.pos += 1;
                list.push(self.parse_operand()?);
            }
            self.expect_kind(TokenKind::RParen, "')'")?;
            return Ok(Expr::InList { operand, list, negated });
        }
        if self.eat_word("BETWEEN") {
            let low = self.parse_operand()?;
            if !self.eat_word("AND") {
                return Err(invalid("expected AND in BETWEEN"));
            }
            let high = self.parse_operand()?;
            return Ok(Expr::Between { operand, low, high, negated });
        }
        if self.eat_word("LIKE") {
            let token = self.expect_kind(TokenKind::String, "a string pattern after LIKE")?;
            return Ok(Expr::Like {
                operand,
                pattern: unquote(&token.text, '\''),
                negated,
            });
        }

        match self.peek() {
            Some(token) if token.kind == TokenKind::Operator => {
                let op = CompareOp::from_operator(&token.text)
                    .ok_or_else(|| invalid(format!("unsupported operator '{}'", token.text)))?;
                self.pos += 1;
                let right = self.parse_operand()?;
                Ok(Expr::Compare(operand, op, right))
            }
            Some(token) => Err(invalid(format!("expected a comparison but found '{}'", token.text))),
            None => Err(invalid("expected a comparison")),
        }
    }

    /// `(col)` or `(-1)` used as a plain operand rather than a nested condition.
    fn parenthesised_operand(&self) -> bool {
        let inner = self.tokens.get(self.pos + 1);
        let close = self.tokens.get(self.pos + 2);
        inner.is_some_and(|t| matches!(t.kind, TokenKind::Word | TokenKind::QuotedIdent | TokenKind::Number | TokenKind::String))
            && close.is_some_and(|t| t.kind == TokenKind::RParen)
            && self
                .tokens
                .get(self.pos + 3)
                .is_some_and(|t| t.kind == TokenKind::Operator || t.is_word("IS") || t.is_word("IN") || t.is_word("BETWEEN") || t.is_word("LIKE") || t.is_word("NOT"))
    }

    fn parse_operand(&mut self) -> ShiftResult<Operand> {
        let token = self.peek().ok_or_else(|| invalid("expected a value"))?;
        match token.kind {
            TokenKind::LParen => {
                self.pos += 1;
                let operand = self.parse_operand()?;
                self.expect_kind(TokenKind::RParen, "')'")?;
                Ok(operand)
            }
            TokenKind::Operator if token.text == "-" || token.text == "+" => {
                self.pos += 1;
                let number = self.expect_kind(TokenKind::Number, "a number after sign")?;
                let text = format!("{}{}", token.text, number.text);
                Ok(Operand::Literal(number_value(&text)?))
            }
            TokenKind::Number => {
                self.pos += 1;
                Ok(Operand::Literal(number_value(&token.text)?))
            }
            TokenKind::String => {
                self.pos += 1;
                Ok(Operand::Literal(Value::Text(unquote(&token.text, '\''))))
            }
            TokenKind::QuotedIdent => {
                self.pos += 1;
                Ok(Operand::Column(self.qualified(unquote(&token.text, '"'))))
            }
            TokenKind::Word => {
                self.pos += 1;
                if token.is_word("NULL") {
                    Ok(Operand::Literal(Value::Null))
                } else if token.is_word("TRUE") {
                    Ok(Operand::Literal(Value::Bool(true)))
                } else if token.is_word("FALSE") {
                    Ok(Operand::Literal(Value::Bool(false)))
                } else {
                    Ok(Operand::Column(self.qualified(token.text.clone())))
                }
            }
            _ => Err(invalid(format!("unexpected '{}' at line {}", token.text, token.line))),
        }
    }

    /// `t.col` refers to `col`; table qualifiers are dropped.
    fn qualified(&mut self, mut name: String) -> String {
        while self.peek().is_some_and(|t| t.kind == TokenKind::Dot) {
            match self.tokens.get(self.pos + 1) {
                Some(next) if next.kind == TokenKind::Word => {
                    name = next.text.clone();
                    self.pos += 2;
                }
                Some(next) if next.kind == TokenKind::QuotedIdent => {
                    name = unquote(&next.text, '"');
                    self.pos += 2;
                }
                _ => break,
            }
        }
        name
    }
}

fn number_value(text: &str) -> ShiftResult<Value> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    text.parse::<f64>()
        .map(Value::Float)
        .map_err(|_| invalid(format!("bad number '{}'", text)))
}

fn unquote(text: &str, quote: char) -> String {
    let inner = text
        .strip_prefix(quote)
        .and_then(|s| s.strip_suffix(quote))
        .unwrap_or(text);
    let doubled: String = [quote, quote].iter().collect();
    inner.replace(&doubled, &quote.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::value::Row;

    fn columns() -> Vec<String> {
        vec!["ID".to_string(), "STATUS".to_string(), "AMOUNT".to_string()]
    }

    fn passes(predicate: &str, row: Row) -> bool {
        Predicate::parse(predicate).unwrap().bind(&columns()).unwrap().matches(&row)
    }

    fn row(id: i64, status: Option<&str>, amount: f64) -> Row {
        vec![Value::Int(id), status.into(), Value::Float(amount)]
    }

    #[test]
    fn test_comparisons() {
        assert!(passes("status = 'OPEN'", row(1, Some("OPEN"), 1.0)));
        assert!(passes("WHERE amount >= 10 AND id <> 2", row(1, Some("X"), 10.0)));
        assert!(!passes("amount > 10 OR id = 2", row(1, Some("X"), 10.0)));
        assert!(passes("NOT (id = 2)", row(1, None, 0.0)));
        assert!(passes("amount > -1.5", row(1, None, 0.0)));
    }

    #[test]
    fn test_three_valued_logic() {
        // NULL = 'OPEN' is unknown, so neither the test nor its negation passes.
        assert!(!passes("status = 'OPEN'", row(1, None, 0.0)));
        assert!(!passes("NOT status = 'OPEN'", row(1, None, 0.0)));
        assert!(passes("status = 'OPEN' OR id = 1", row(1, None, 0.0)));
        assert!(!passes("status NOT IN ('A', NULL)", row(1, Some("B"), 0.0)));
        assert!(passes("status IS NULL", row(1, None, 0.0)));
        assert!(passes("status IS NOT NULL", row(1, Some("A"), 0.0)));
    }

    #[test]
    fn test_in_between_like() {
        assert!(passes("id IN (1, 2, 3)", row(2, None, 0.0)));
        assert!(passes("amount BETWEEN 5 AND 10", row(2, None, 5.0)));
        assert!(passes("amount NOT BETWEEN 5 AND 10", row(2, None, 11.0)));
        assert!(passes("status LIKE 'OP%N'", row(2, Some("OPEN"), 0.0)));
        assert!(passes("status LIKE '_PEN'", row(2, Some("OPEN"), 0.0)));
        assert!(!passes("status LIKE 'C%'", row(2, Some("OPEN"), 0.0)));
    }

    #[test]
    fn test_columns_and_qualifiers() {
        let predicate = Predicate::parse("t.status = 'A' AND \"ID\" > 3 AND status <> 'B'").unwrap();
        assert_eq!(predicate.columns(), vec!["status", "ID"]);
    }

    #[test]
    fn test_unknown_column() {
        let predicate = Predicate::parse("missing = 1").unwrap();
        assert!(matches!(predicate.bind(&columns()), Err(ShiftError::SchemaMismatch(_))));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Predicate::parse("").is_err());
        assert!(Predicate::parse("id =").is_err());
        assert!(Predicate::parse("id = 1 garbage").is_err());
        assert!(Predicate::parse("(id = 1").is_err());
        assert!(Predicate::parse("status = 'open").is_err());
    }
}
