//! Text assembler for `.orus` bytecode listings.
//!
//! ```text
//! .func main 0
//!     LOAD_I32_CONST R1, 40
//! loop:
//!     JUMP_IF_NOT_R R2, done
//! done:
//!     RETURN_R R1
//! .end
//! ```
//!
//! The first function is the entry point. Jumps are left unresolved so the
//! optimizer can still move code around; call `CompiledProgram::resolve_jumps`
//! before running.

pub mod lexer;
pub mod source_map;

use std::collections::HashMap;

pub use lexer::Token;
pub use source_map::SourceMap;

use crate::bytecode::{BytecodeError, Chunk, CompiledProgram, Label, Opcode, Operand};
use crate::heap::ObjectHeap;
use crate::value::Value;
use crate::vm::NO_CATCH_REGISTER;

/// Byte range in the assembler source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn merge(self, other: Span) -> Span {
        Span { start: self.start.min(other.start), end: self.end.max(other.end) }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct AsmError {
    pub message: String,
    pub span: Span,
    pub hint: Option<String>,
}

impl AsmError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        AsmError { message: message.into(), span, hint: None }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

type AsmResult<T> = Result<T, AsmError>;

/// Assembles `source` into a program. String literals are interned in `heap`.
pub fn assemble(source: &str, heap: &mut ObjectHeap) -> AsmResult<CompiledProgram> {
    let tokens = lexer::lex(source)?;
    let lines = split_lines(&tokens);
    let functions = collect_functions(&lines)?;
    let mut asm = Assembler {
        source_map: SourceMap::new(source),
        heap,
        functions,
        chunks: Vec::new(),
        current: None,
    };
    for line in &lines {
        asm.line(line)?;
    }
    if let Some(open) = asm.current.take() {
        return Err(AsmError::new(format!("function '{}' is missing .end", open.chunk.name), open.span));
    }
    if asm.chunks.is_empty() {
        return Err(AsmError::new("no functions defined", Span::UNKNOWN).with_hint("start one with `.func main 0`"));
    }
    tracing::debug!(functions = asm.chunks.len(), "assembled");
    Ok(CompiledProgram::new(asm.chunks))
}

type Line<'t> = &'t [(Token, Span)];

fn split_lines(tokens: &[(Token, Span)]) -> Vec<Line<'_>> {
    tokens.split(|(t, _)| *t == Token::Newline).filter(|l| !l.is_empty()).collect()
}

/// First pass: every `.func` name, so calls can refer forward.
fn collect_functions(lines: &[Line<'_>]) -> AsmResult<HashMap<String, u16>> {
    let mut functions = HashMap::new();
    for line in lines {
        if let [(Token::Func, _), (Token::Ident(name), span), ..] = line {
            let index = u16::try_from(functions.len())
                .map_err(|_| AsmError::new("too many functions", *span))?;
            if functions.insert(name.clone(), index).is_some() {
                return Err(AsmError::new(format!("function '{name}' is defined twice"), *span));
            }
        }
    }
    Ok(functions)
}

struct OpenFunction {
    chunk: Chunk,
    span: Span,
    labels: HashMap<String, Label>,
    /// First use of each label, for the undefined-label report.
    uses: HashMap<String, Span>,
}

struct Assembler<'h> {
    source_map: SourceMap,
    heap: &'h mut ObjectHeap,
    functions: HashMap<String, u16>,
    chunks: Vec<Chunk>,
    current: Option<OpenFunction>,
}

impl Assembler<'_> {
    fn line(&mut self, line: Line<'_>) -> AsmResult<()> {
        match line {
            [(Token::Func, span), rest @ ..] => self.begin_function(*span, rest),
            [(Token::End, span), rest @ ..] => {
                expect_end_of_line(rest)?;
                self.end_function(*span)
            }
            [(Token::Ident(name), span), (Token::Colon, colon), rest @ ..] => {
                self.define_label(name, span.merge(*colon))?;
                if rest.is_empty() { Ok(()) } else { self.instruction(rest) }
            }
            _ => self.instruction(line),
        }
    }

    fn begin_function(&mut self, span: Span, rest: Line<'_>) -> AsmResult<()> {
        if let Some(open) = &self.current {
            return Err(AsmError::new(format!("function '{}' is missing .end", open.chunk.name), open.span)
                .with_hint("functions cannot nest"));
        }
        let (name, arity) = match rest {
            [(Token::Ident(name), _), (Token::Number(arity), arity_span)] => {
                let arity = arity.parse::<u8>().map_err(|_| {
                    AsmError::new(format!("arity '{arity}' is not a number from 0 to 255"), *arity_span)
                })?;
                (name.clone(), arity)
            }
            _ => {
                let end = rest.last().map_or(span, |(_, s)| *s);
                return Err(AsmError::new("malformed .func", span.merge(end)).with_hint("write `.func name arity`"));
            }
        };
        self.current = Some(OpenFunction {
            chunk: Chunk::new(name, arity),
            span,
            labels: HashMap::new(),
            uses: HashMap::new(),
        });
        Ok(())
    }

    fn end_function(&mut self, span: Span) -> AsmResult<()> {
        let Some(open) = self.current.take() else {
            return Err(AsmError::new(".end without .func", span));
        };
        for (name, label) in &open.labels {
            if open.chunk.code.label_offset(*label).is_none() {
                let at = open.uses.get(name).copied().unwrap_or(span);
                return Err(AsmError::new(format!("label '{name}' is used but never defined"), at));
            }
        }
        self.chunks.push(open.chunk);
        Ok(())
    }

    fn open(&mut self, span: Span) -> AsmResult<&mut OpenFunction> {
        self.current
            .as_mut()
            .ok_or_else(|| AsmError::new("instruction outside a function", span).with_hint("wrap code in .func/.end"))
    }

    fn label(&mut self, name: &str, span: Span, is_use: bool) -> AsmResult<Label> {
        let open = self.open(span)?;
        if is_use {
            open.uses.entry(name.to_string()).or_insert(span);
        }
        let label = match open.labels.get(name) {
            Some(&label) => label,
            None => {
                let label = open.chunk.code.new_label(name);
                open.labels.insert(name.to_string(), label);
                label
            }
        };
        Ok(label)
    }

    fn define_label(&mut self, name: &str, span: Span) -> AsmResult<()> {
        let label = self.label(name, span, false)?;
        let open = self.open(span)?;
        open.chunk.code.define_label(label).map_err(|e| bytecode_error(e, span))
    }

    fn instruction(&mut self, line: Line<'_>) -> AsmResult<()> {
        let (mnemonic, span) = match line.first() {
            Some((Token::Ident(m), span)) => (m.as_str(), *span),
            Some((token, span)) => {
                return Err(AsmError::new(format!("expected a mnemonic, found {}", describe(token)), *span));
            }
            None => return Ok(()),
        };
        let op = Opcode::from_mnemonic(mnemonic).ok_or_else(|| {
            let err = AsmError::new(format!("unknown mnemonic '{mnemonic}'"), span);
            match suggest_mnemonic(mnemonic) {
                Some(s) => err.with_hint(format!("did you mean '{s}'?")),
                None => err,
            }
        })?;
        let args = split_operands(&line[1..], span)?;
        let layout = op.operands();
        if args.len() != layout.len() {
            let end = args.last().map_or(span, |a| a.span);
            return Err(AsmError::new(
                format!("{} expects {} operand(s), got {}", op.mnemonic(), layout.len(), args.len()),
                span.merge(end),
            ));
        }

        let mut values = Vec::with_capacity(layout.len());
        let mut jump = None;
        for (&kind, arg) in layout.iter().zip(&args) {
            match kind {
                Operand::Reg => values.push(self.register(op, arg, values.is_empty())?),
                Operand::Imm => values.push(immediate(arg, u8::MAX as u32)?),
                Operand::LoopId => values.push(immediate(arg, u16::MAX as u32)?),
                Operand::Global => values.push(global(arg)?),
                Operand::Const => values.push(self.constant(op, arg)?),
                _ => match arg.token {
                    Token::Ident(name) => jump = Some(self.label(name, arg.span, true)?),
                    other => {
                        return Err(AsmError::new(format!("expected a label, found {}", describe(other)), arg.span));
                    }
                },
            }
        }

        let (line_no, col) = self.source_map.lookup(span.start);
        let whole = span.merge(args.last().map_or(span, |a| a.span));
        let open = self.open(span)?;
        let result = match jump {
            Some(label) => open.chunk.code.emit_jump(op, &values, label, line_no, col),
            None => open.chunk.code.emit(op, &values, line_no, col),
        };
        result.map(|_| ()).map_err(|e| bytecode_error(e, whole))
    }

    fn register(&self, op: Opcode, arg: &Arg<'_>, first: bool) -> AsmResult<u32> {
        match arg.token {
            Token::Underscore if op == Opcode::TryBegin && first => Ok(NO_CATCH_REGISTER as u32),
            Token::Ident(name) => parse_indexed(name, 'R')
                .ok_or_else(|| AsmError::new(format!("'{name}' is not a register"), arg.span).with_hint("registers are R0 to R255")),
            other => Err(AsmError::new(format!("expected a register, found {}", describe(other)), arg.span)),
        }
    }

    fn constant(&mut self, op: Opcode, arg: &Arg<'_>) -> AsmResult<u32> {
        let value = match arg.token {
            Token::Number(text) => number_constant(op, text, arg.span)?,
            Token::Str(text) => Value::String(self.heap.intern(text)),
            Token::FuncRef(name) => match self.functions.get(name) {
                Some(&index) => Value::Function(index),
                None => return Err(AsmError::new(format!("unknown function '@{name}'"), arg.span)),
            },
            Token::Ident(word) if word == "true" => Value::Bool(true),
            Token::Ident(word) if word == "false" => Value::Bool(false),
            other => return Err(AsmError::new(format!("expected a constant, found {}", describe(other)), arg.span)),
        };
        let expected = match op {
            Opcode::LoadI32Const => Some("i32"),
            Opcode::LoadI64Const => Some("i64"),
            Opcode::LoadF64Const => Some("f64"),
            _ => None,
        };
        if let Some(label) = expected.filter(|&l| value.value_type().label() != l) {
            return Err(AsmError::new(format!("{} expects an {label} literal", op.mnemonic()), arg.span));
        }
        let open = self.open(arg.span)?;
        open.chunk.add_const(value).map(u32::from).map_err(|e| bytecode_error(e, arg.span))
    }
}

struct Arg<'t> {
    token: &'t Token,
    span: Span,
}

/// Splits `a, b, c` into single-token operands.
fn split_operands<'t>(tokens: Line<'t>, after: Span) -> AsmResult<Vec<Arg<'t>>> {
    let mut args = Vec::new();
    let mut expect_operand = true;
    for (token, span) in tokens {
        match (token, expect_operand) {
            (Token::Comma, false) => expect_operand = true,
            (Token::Comma, true) => return Err(AsmError::new("missing operand before ','", *span)),
            (_, true) => {
                args.push(Arg { token, span: *span });
                expect_operand = false;
            }
            (_, false) => {
                return Err(AsmError::new(format!("unexpected {}", describe(token)), *span)
                    .with_hint("separate operands with ','"));
            }
        }
    }
    if expect_operand && !args.is_empty() {
        let at = tokens.last().map_or(after, |(_, s)| *s);
        return Err(AsmError::new("trailing ','", at));
    }
    Ok(args)
}

fn expect_end_of_line(rest: Line<'_>) -> AsmResult<()> {
    match rest.first() {
        Some((token, span)) => Err(AsmError::new(format!("unexpected {}", describe(token)), *span)),
        None => Ok(()),
    }
}

/// `R12` -> 12, `g3` -> 3 for the given prefix.
fn parse_indexed(name: &str, prefix: char) -> Option<u32> {
    let digits = name.strip_prefix(prefix).or_else(|| name.strip_prefix(prefix.to_ascii_lowercase()))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u8>().ok().map(u32::from)
}

fn global(arg: &Arg<'_>) -> AsmResult<u32> {
    match arg.token {
        Token::Ident(name) => parse_indexed(name, 'G')
            .ok_or_else(|| AsmError::new(format!("'{name}' is not a global"), arg.span).with_hint("globals are g0 to g255")),
        other => Err(AsmError::new(format!("expected a global, found {}", describe(other)), arg.span)),
    }
}

fn immediate(arg: &Arg<'_>, max: u32) -> AsmResult<u32> {
    match arg.token {
        Token::Number(text) => text
            .parse::<u32>()
            .ok()
            .filter(|&n| n <= max)
            .ok_or_else(|| AsmError::new(format!("immediate '{text}' must be between 0 and {max}"), arg.span)),
        other => Err(AsmError::new(format!("expected an immediate, found {}", describe(other)), arg.span)),
    }
}

/// Reads a numeric literal. An explicit suffix wins; otherwise the load
/// opcode picks the type, and plain `LOAD_CONST` uses i32 (i64 when it does
/// not fit) or f64 for decimals.
fn number_constant(op: Opcode, text: &str, span: Span) -> AsmResult<Value> {
    let (digits, suffix) = match ["i32", "i64", "u32", "u64", "f64"].iter().find(|s| text.ends_with(*s)) {
        Some(s) => (&text[..text.len() - s.len()], Some(*s)),
        None => (text, None),
    };
    let is_decimal = digits.contains('.');
    let target = suffix.unwrap_or(match op {
        Opcode::LoadI64Const => "i64",
        Opcode::LoadF64Const => "f64",
        _ if is_decimal => "f64",
        Opcode::LoadI32Const => "i32",
        _ if digits.parse::<i32>().is_ok() => "i32",
        _ => "i64",
    });
    let out_of_range = || AsmError::new(format!("literal '{text}' does not fit in {target}"), span);
    if is_decimal && target != "f64" {
        return Err(AsmError::new(format!("'{text}' is not an integer literal"), span));
    }
    Ok(match target {
        "i32" => Value::I32(digits.parse().map_err(|_| out_of_range())?),
        "i64" => Value::I64(digits.parse().map_err(|_| out_of_range())?),
        "u32" => Value::U32(digits.parse().map_err(|_| out_of_range())?),
        "u64" => Value::U64(digits.parse().map_err(|_| out_of_range())?),
        _ => Value::F64(digits.parse().map_err(|_| out_of_range())?),
    })
}

fn bytecode_error(err: BytecodeError, span: Span) -> AsmError {
    AsmError::new(err.to_string(), span)
}

fn describe(token: &Token) -> String {
    match token {
        Token::Func => "'.func'".into(),
        Token::End => "'.end'".into(),
        Token::Comma => "','".into(),
        Token::Colon => "':'".into(),
        Token::Underscore => "'_'".into(),
        Token::Number(n) => format!("number '{n}'"),
        Token::Str(_) => "string literal".into(),
        Token::FuncRef(name) => format!("'@{name}'"),
        Token::Ident(name) => format!("'{name}'"),
        Token::Newline => "end of line".into(),
    }
}

/// Closest mnemonic within edit distance 3.
fn suggest_mnemonic(name: &str) -> Option<&'static str> {
    let upper = name.to_ascii_uppercase();
    Opcode::ALL
        .iter()
        .map(|op| (levenshtein(&upper, op.mnemonic()), op.mnemonic()))
        .filter(|&(d, _)| d <= 3)
        .min_by_key(|&(d, _)| d)
        .map(|(_, m)| m)
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut row = vec![i + 1; b.len() + 1];
        for (j, &cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            row[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(row[j] + 1);
        }
        prev = row;
    }
    prev[b.len()]
}
