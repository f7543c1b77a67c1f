use logos::Logos;

use super::{AsmError, Span};

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r]+")]
#[logos(skip(r";[^\n]*", allow_greedy = true))]
pub enum Token {
    #[token(".func")]
    Func,
    #[token(".end")]
    End,

    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("_")]
    Underscore,

    /// Numeric literal with its optional type suffix, kept as written.
    #[regex(r"-?[0-9]+(\.[0-9]+([eE][-+]?[0-9]+)?)?(i32|i64|u32|u64|f64)?", |lex| lex.slice().to_string())]
    Number(String),

    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| unescape(lex.slice()))]
    Str(String),

    /// `@name`: a function constant.
    #[regex(r"@[A-Za-z][A-Za-z0-9_]*", |lex| lex.slice()[1..].to_string())]
    FuncRef(String),

    /// Mnemonics, labels, registers (`R3`), globals (`g1`) and `true`/`false`.
    #[regex(r"[A-Za-z][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[token("\n")]
    Newline,
}

/// Strips the quotes and applies `\n \t \0 \\ \"` escapes.
fn unescape(quoted: &str) -> Option<String> {
    let inner = &quoted[1..quoted.len() - 1];
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
            '0' => out.push('\0'),
            other => out.push(other),
        }
    }
    Some(out)
}

pub fn lex(source: &str) -> Result<Vec<(Token, Span)>, AsmError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    while let Some(result) = lexer.next() {
        let range = lexer.span();
        let span = Span { start: range.start, end: range.end };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                let snippet = &source[range];
                let hint = if snippet.starts_with('"') {
                    "close the string on the same line".to_string()
                } else if snippet.starts_with('.') {
                    "directives are .func and .end".to_string()
                } else {
                    format!("unexpected character(s) '{snippet}'")
                };
                return Err(AsmError::new(format!("unexpected token '{snippet}'"), span).with_hint(hint));
            }
        }
    }
    Ok(tokens)
}
