use std::ops::Range;

use logos::Logos;

use crate::error::{LiveObjError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub span: Range<usize>,
    pub kind: TokenKind,
}

impl Token {
    pub fn start(&self) -> usize {
        self.span.start
    }
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\f\r]+")]
pub enum TokenKind {
    #[regex(r#""([^"\\]|\\.)*""#, |lex| unescape(lex.slice()))]
    #[regex(r#"'([^'\\]|\\.)*'"#, |lex| unescape(lex.slice()))]
    StringLiteral(String),
    #[regex("[0-9]+(\\.[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),
    #[regex("true|false", |lex| lex.slice() == "true")]
    Bool(bool),
    #[token("null")]
    KwNull,
    #[token("this")]
    KwThis,
    #[regex("[a-zA-Z_$][a-zA-Z0-9_$]*", |lex| lex.slice().to_string())]
    Identifier(String),
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(".")]
    Dot,
    #[token("?")]
    Interrogation,
    #[token(":")]
    Colon,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("==")]
    #[token("===")]
    EqEq,
    #[token("!=")]
    #[token("!==")]
    NEq,
    #[token("<")]
    LAngle,
    #[token("<=")]
    LtEq,
    #[token(">")]
    RAngle,
    #[token(">=")]
    GtEq,
    #[token("&&")]
    OpAnd,
    #[token("||")]
    OpOr,
    #[token("!")]
    Bang,
    /// End of input, appended by [`tokenize`].
    EoI,
}

/// Strip the quotes and resolve `\n`, `\t`, `\\` and quote escapes.
fn unescape(slice: &str) -> String {
    let inner = &slice[1..slice.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    for (kind, span) in TokenKind::lexer(source).spanned() {
        match kind {
            Ok(kind) => tokens.push(Token { span, kind }),
            Err(()) => {
                return Err(LiveObjError::Expression {
                    message: format!("unexpected input {:?}", &source[span.clone()]),
                    offset: span.start,
                })
            }
        }
    }
    tokens.push(Token {
        span: source.len()..source.len(),
        kind: TokenKind::EoI,
    });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_tokenize_member_access() {
        assert_eq!(
            kinds("this.size >= 2.5"),
            vec![
                TokenKind::KwThis,
                TokenKind::Dot,
                TokenKind::Identifier("size".into()),
                TokenKind::GtEq,
                TokenKind::Number(2.5),
                TokenKind::EoI,
            ]
        );
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            kinds("true trueish null"),
            vec![
                TokenKind::Bool(true),
                TokenKind::Identifier("trueish".into()),
                TokenKind::KwNull,
                TokenKind::EoI,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#"'it\'s' "a\"b""#),
            vec![
                TokenKind::StringLiteral("it's".into()),
                TokenKind::StringLiteral("a\"b".into()),
                TokenKind::EoI,
            ]
        );
    }

    #[test]
    fn test_bad_character_reports_offset() {
        match tokenize("1 + #") {
            Err(LiveObjError::Expression { offset, .. }) => assert_eq!(offset, 4),
            other => panic!("Expected Expression error, got {:?}", other),
        }
    }
}
