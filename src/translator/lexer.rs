//! SQL tokenizer using nom.
//!
//! Splits Teradata or DB2 source text into tokens without losing a single byte:
//! rendering the token texts back in order reproduces the input exactly.
//! Comments, string literals and quoted identifiers are single tokens, so
//! keywords inside them are never seen by the rewrite rules.

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_until, take_while, take_while1},
    character::complete::{anychar, char, digit0, digit1, multispace1, not_line_ending, one_of},
    combinator::{map, opt, recognize},
    multi::many0,
    sequence::{pair, tuple},
    IResult,
};

use crate::error::{ShiftError, ShiftResult};

/// Token classes produced by [`tokenize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Whitespace,
    LineComment,
    BlockComment,
    /// Identifier or keyword.
    Word,
    /// `"double quoted"` identifier.
    QuotedIdent,
    /// `'single quoted'` string literal.
    String,
    Number,
    Operator,
    LParen,
    RParen,
    Comma,
    Semicolon,
    Dot,
    Other,
}

/// A lexical token with its 1-based source line and byte offset.
///
/// Tokens synthesized by rewrite rules carry the line and offset of the
/// construct they replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    pub offset: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, line: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            line,
            offset: 0,
        }
    }

    pub fn at(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Whitespace and comments.
    pub fn is_trivia(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::Whitespace | TokenKind::LineComment | TokenKind::BlockComment
        )
    }

    /// Case-insensitive keyword/identifier comparison.
    pub fn is_word(&self, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(word)
    }

    pub fn is_operator(&self, op: &str) -> bool {
        self.kind == TokenKind::Operator && self.text == op
    }
}

/// Tokenize SQL text.
///
/// Fails only on unterminated string literals, quoted identifiers or block
/// comments; everything else lexes (unknown characters become
/// [`TokenKind::Other`]).
pub fn tokenize(input: &str) -> ShiftResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut rest = input;
    let mut line = 1;

    while !rest.is_empty() {
        if let Some(what) = unterminated(rest) {
            return Err(ShiftError::translation(line, format!("unterminated {}", what)));
        }
        let (remaining, (kind, text)) = next_token(rest)
            .map_err(|e| ShiftError::translation(line, format!("tokenizer failed: {:?}", e)))?;
        tokens.push(Token::new(kind, text, line).at(input.len() - rest.len()));
        line += text.matches('\n').count();
        rest = remaining;
    }

    Ok(tokens)
}

fn unterminated(input: &str) -> Option<&'static str> {
    if input.starts_with('\'') && string_literal(input).is_err() {
        Some("string literal")
    } else if input.starts_with('"') && quoted_identifier(input).is_err() {
        Some("quoted identifier")
    } else if input.starts_with("/*") && block_comment(input).is_err() {
        Some("block comment")
    } else {
        None
    }
}

fn next_token(input: &str) -> IResult<&str, (TokenKind, &str)> {
    alt((
        map(multispace1, |s| (TokenKind::Whitespace, s)),
        map(line_comment, |s| (TokenKind::LineComment, s)),
        map(block_comment, |s| (TokenKind::BlockComment, s)),
        map(string_literal, |s| (TokenKind::String, s)),
        map(quoted_identifier, |s| (TokenKind::QuotedIdent, s)),
        map(number, |s| (TokenKind::Number, s)),
        map(word, |s| (TokenKind::Word, s)),
        map(operator, |s| (TokenKind::Operator, s)),
        map(recognize(char('(')), |s| (TokenKind::LParen, s)),
        map(recognize(char(')')), |s| (TokenKind::RParen, s)),
        map(recognize(char(',')), |s| (TokenKind::Comma, s)),
        map(recognize(char(';')), |s| (TokenKind::Semicolon, s)),
        map(recognize(char('.')), |s| (TokenKind::Dot, s)),
        map(recognize(anychar), |s| (TokenKind::Other, s)),
    ))(input)
}

/// `-- ...` up to (not including) the line break.
fn line_comment(input: &str) -> IResult<&str, &str> {
    recognize(pair(tag("--"), not_line_ending))(input)
}

fn block_comment(input: &str) -> IResult<&str, &str> {
    recognize(tuple((tag("/*"), take_until("*/"), tag("*/"))))(input)
}

/// `'...'` with `''` as the embedded quote escape.
fn string_literal(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        char('\''),
        many0(alt((tag("''"), is_not("'")))),
        char('\''),
    )))(input)
}

fn quoted_identifier(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        char('"'),
        many0(alt((tag("\"\""), is_not("\"")))),
        char('"'),
    )))(input)
}

fn number(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        digit1,
        opt(pair(char('.'), digit0)),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )))(input)
}

fn word(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_alphabetic() || c == '_'),
        take_while(|c: char| c.is_alphanumeric() || c == '_' || c == '$' || c == '#'),
    ))(input)
}

fn operator(input: &str) -> IResult<&str, &str> {
    alt((
        tag("<>"),
        tag("<="),
        tag(">="),
        tag("^="),
        tag("!="),
        tag("||"),
        tag("**"),
        recognize(one_of("=<>+-*/%^|!&~")),
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<TokenKind> {
        tokenize(sql)
            .unwrap()
            .into_iter()
            .filter(|t| t.kind != TokenKind::Whitespace)
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_lossless() {
        let sql = "SEL a, 'it''s' /* c */ FROM t -- tail\nWHERE x >= 1.5;";
        let tokens = tokenize(sql).unwrap();
        let rendered: String = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(rendered, sql);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            kinds("SELECT \"My Col\", 'x' FROM s.t;"),
            vec![
                TokenKind::Word,
                TokenKind::QuotedIdent,
                TokenKind::Comma,
                TokenKind::String,
                TokenKind::Word,
                TokenKind::Word,
                TokenKind::Dot,
                TokenKind::Word,
                TokenKind::Semicolon,
            ]
        );
    }

    #[test]
    fn test_keywords_inside_strings_are_opaque() {
        let tokens = tokenize("SELECT 'QUALIFY SEL' FROM t").unwrap();
        assert!(tokens.iter().all(|t| !t.is_word("QUALIFY")));
        assert!(tokens.iter().any(|t| t.kind == TokenKind::String && t.text == "'QUALIFY SEL'"));
    }

    #[test]
    fn test_line_numbers() {
        let tokens = tokenize("SELECT a\nFROM t\n/* two\nlines */\nWHERE b = 1").unwrap();
        let where_token = tokens.iter().find(|t| t.is_word("WHERE")).unwrap();
        assert_eq!(where_token.line, 5);
        let from_token = tokens.iter().find(|t| t.is_word("FROM")).unwrap();
        assert_eq!(from_token.line, 2);
        assert_eq!(from_token.offset, 9);
    }

    #[test]
    fn test_operators() {
        let tokens = tokenize("a<>b^=c||d").unwrap();
        let ops: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Operator)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(ops, vec!["<>", "^=", "||"]);
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("SELECT 'abc\nFROM t").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Translation error at line 1: unterminated string literal"
        );
    }

    #[test]
    fn test_unterminated_comment() {
        assert!(tokenize("SELECT 1\n/* open").is_err());
    }
}
