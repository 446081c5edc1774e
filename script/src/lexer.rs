//! Tokenization, using logos.
//!
//! The language is line-oriented: newlines terminate statements, so unlike
//! most whitespace they are real tokens. `#` comments run to end of line and
//! are stripped here.

use logos::Logos;

use crate::error::SyntaxError;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\f]+")]
#[logos(skip r"#[^\n]*")]
pub enum Token {
    // Keywords
    #[token("def", priority = 3)]
    Def,
    #[token("if", priority = 3)]
    If,
    #[token("else", priority = 3)]
    Else,
    #[token("while", priority = 3)]
    While,
    #[token("end", priority = 3)]
    End,
    #[token("return", priority = 3)]
    Return,
    #[token("raise", priority = 3)]
    Raise,
    #[token("pass", priority = 3)]
    Pass,
    #[token("and", priority = 3)]
    And,
    #[token("or", priority = 3)]
    Or,
    #[token("not", priority = 3)]
    Not,
    #[token("true", priority = 3)]
    True,
    #[token("false", priority = 3)]
    False,
    #[token("none", priority = 3)]
    None,

    // Literals
    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse().ok())]
    Float(f64),
    #[regex(r"[0-9]+", |lex| lex.slice().parse().ok())]
    Int(i64),
    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| unescape(lex.slice()))]
    Str(String),
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_owned())]
    Ident(String),

    // Operators
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
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LtEq,
    #[token("<")]
    Lt,
    #[token(">=")]
    GtEq,
    #[token(">")]
    Gt,
    #[token("=")]
    Assign,

    // Delimiters
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,

    #[token("\n")]
    Newline,
}

impl Token {
    /// Human-readable rendering for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier {name:?}"),
            Token::Int(v) => format!("number {v}"),
            Token::Float(v) => format!("number {v}"),
            Token::Str(_) => "string literal".to_owned(),
            Token::Newline => "end of line".to_owned(),
            other => format!("{other:?}").to_lowercase(),
        }
    }
}

/// A token plus where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: u32,
    pub column: u32,
}

/// Tokenize a whole source text, resolving byte spans to line/column.
pub fn lex(source: &str) -> Result<Vec<Spanned>, SyntaxError> {
    let line_starts = line_starts(source);
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    while let Some(result) = lexer.next() {
        let span = lexer.span();
        let (line, column) = position(&line_starts, span.start);
        match result {
            Ok(token) => tokens.push(Spanned {
                token,
                line,
                column,
            }),
            Err(()) => {
                return Err(SyntaxError {
                    message: format!("unrecognized input {:?}", lexer.slice()),
                    line,
                    column,
                })
            }
        }
    }
    Ok(tokens)
}

fn line_starts(source: &str) -> Vec<usize> {
    let mut starts = vec![0];
    for (offset, byte) in source.bytes().enumerate() {
        if byte == b'\n' {
            starts.push(offset + 1);
        }
    }
    starts
}

fn position(line_starts: &[usize], offset: usize) -> (u32, u32) {
    let line_index = match line_starts.binary_search(&offset) {
        Ok(i) => i,
        Err(i) => i - 1,
    };
    let column = offset - line_starts[line_index] + 1;
    (line_index as u32 + 1, column as u32)
}

fn unescape(slice: &str) -> Option<String> {
    let inner = &slice[1..slice.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            '0' => out.push('\0'),
            _ => return None,
        }
    }
    Some(out)
}
