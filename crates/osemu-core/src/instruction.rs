//! The synthetic instruction set executed by emulated processes.
//!
//! Every instruction is a variant of the closed [`Instruction`] enum.  The
//! scheduler asks an instruction for its [`virtual_address`] before running
//! it (to gate validity and residency), and the owning process runs it via
//! [`Instruction::execute`], which is a plain `match` over the variants.
//!
//! # Text form
//!
//! ```text
//! PRINT("Hello")            PRINT("x = " + x)
//! DECLARE x 10              ADD total x 5
//! SUBTRACT total total y    READ v 0x40
//! WRITE 0x40 total          WRITE 64 7
//! ```
//!
//! Opcodes are case-insensitive, addresses are decimal or `0x` hex.
//! [`parse_program`] splits a `;`-separated program, ignoring `;` inside
//! quoted strings.
//!
//! [`virtual_address`]: Instruction::virtual_address

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::{MemoryError, MemoryManager};
use crate::process::Pid;

/// Base address of the symbol-table page (logical page 0).
pub const SYMBOL_TABLE_BASE: u32 = 0;

/// A process register file: variable name to 16-bit value.
pub type Registers = BTreeMap<String, u16>;

/// Errors raised while executing a single instruction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("cannot parse `{0}` as a 16-bit value")]
    InvalidLiteral(String),
}

impl ExecError {
    /// Whether the same instruction may simply be retried on a later tick.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecError::Memory(e) => e.is_transient(),
            ExecError::InvalidLiteral(_) => false,
        }
    }
}

/// Errors from parsing the text form of an instruction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseInstructionError {
    #[error("empty instruction")]
    Empty,

    #[error("unknown opcode `{0}`")]
    UnknownOpcode(String),

    #[error("{opcode} expects {expected} operands, got {got}")]
    Arity {
        opcode: Opcode,
        expected: usize,
        got: usize,
    },

    #[error("invalid address `{0}`")]
    InvalidAddress(String),

    #[error("invalid value `{0}`")]
    InvalidValue(String),

    #[error("invalid variable name `{0}`")]
    InvalidName(String),

    #[error("unterminated string in `{0}`")]
    UnterminatedString(String),
}

/// Explicit opcode of an [`Instruction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Print,
    Declare,
    Add,
    Subtract,
    Read,
    Write,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Print => "PRINT",
            Opcode::Declare => "DECLARE",
            Opcode::Add => "ADD",
            Opcode::Subtract => "SUBTRACT",
            Opcode::Read => "READ",
            Opcode::Write => "WRITE",
        };
        f.write_str(name)
    }
}

impl FromStr for Opcode {
    type Err = ParseInstructionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PRINT" => Ok(Opcode::Print),
            "DECLARE" => Ok(Opcode::Declare),
            "ADD" => Ok(Opcode::Add),
            "SUBTRACT" | "SUB" => Ok(Opcode::Subtract),
            "READ" => Ok(Opcode::Read),
            "WRITE" => Ok(Opcode::Write),
            _ => Err(ParseInstructionError::UnknownOpcode(s.to_string())),
        }
    }
}

/// A value source: a literal, a register, or a token that is neither.
///
/// `Malformed` keeps a token that looks numeric but does not fit in 16
/// bits (or contains illegal characters).  Arithmetic reads it as 0; a
/// `WRITE` of a malformed value is a fatal error for the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Literal(u16),
    Register(String),
    Malformed(String),
}

impl Operand {
    /// Classify a raw token.
    pub fn parse(token: &str) -> Self {
        if let Some(value) = parse_number(token) {
            return match u16::try_from(value) {
                Ok(v) => Operand::Literal(v),
                Err(_) => Operand::Malformed(token.to_string()),
            };
        }
        if is_identifier(token) {
            Operand::Register(token.to_string())
        } else {
            Operand::Malformed(token.to_string())
        }
    }

    /// Value for arithmetic: missing registers and malformed tokens read 0.
    pub fn value_or_zero(&self, registers: &Registers) -> u16 {
        match self {
            Operand::Literal(v) => *v,
            Operand::Register(name) => registers.get(name).copied().unwrap_or(0),
            Operand::Malformed(_) => 0,
        }
    }

    /// Strict resolution used by `WRITE`.
    pub fn resolve(&self, registers: &Registers) -> Result<u16, ExecError> {
        match self {
            Operand::Malformed(token) => Err(ExecError::InvalidLiteral(token.clone())),
            other => Ok(other.value_or_zero(registers)),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(v) => write!(f, "{}", v),
            Operand::Register(name) | Operand::Malformed(name) => f.write_str(name),
        }
    }
}

/// One instruction of a synthetic program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Append a line to the process log, optionally followed by a register value.
    Print {
        message: String,
        append: Option<String>,
    },
    /// Store a value in the symbol table.
    Declare { var: String, value: u16 },
    Add {
        dest: String,
        src1: String,
        src2: Operand,
    },
    Subtract {
        dest: String,
        src1: String,
        src2: Operand,
    },
    /// Load a word from process memory into a register.
    Read { var: String, address: u32 },
    /// Store a register or literal into process memory.
    Write { address: u32, value: Operand },
}

/// Everything an instruction may touch while it runs.
pub struct ExecContext<'a> {
    pub pid: Pid,
    pub core: usize,
    pub name: &'a str,
    /// Simulated tick, used as the log timestamp.
    pub now: u64,
    pub registers: &'a mut Registers,
    pub log: &'a mut Vec<String>,
    pub memory: &'a mut MemoryManager,
}

impl ExecContext<'_> {
    fn emit(&mut self, text: &str) {
        self.log.push(format!(
            "Core {} | {}: {} [tick {}]",
            self.core, self.name, text, self.now
        ));
    }
}

impl Instruction {
    pub fn print(message: impl Into<String>) -> Self {
        Instruction::Print {
            message: message.into(),
            append: None,
        }
    }

    pub fn declare(var: impl Into<String>, value: u16) -> Self {
        Instruction::Declare {
            var: var.into(),
            value,
        }
    }

    pub fn add(dest: impl Into<String>, src1: impl Into<String>, src2: &str) -> Self {
        Instruction::Add {
            dest: dest.into(),
            src1: src1.into(),
            src2: Operand::parse(src2),
        }
    }

    pub fn subtract(dest: impl Into<String>, src1: impl Into<String>, src2: &str) -> Self {
        Instruction::Subtract {
            dest: dest.into(),
            src1: src1.into(),
            src2: Operand::parse(src2),
        }
    }

    pub fn read(var: impl Into<String>, address: u32) -> Self {
        Instruction::Read {
            var: var.into(),
            address,
        }
    }

    pub fn write(address: u32, value: &str) -> Self {
        Instruction::Write {
            address,
            value: Operand::parse(value),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Print { .. } => Opcode::Print,
            Instruction::Declare { .. } => Opcode::Declare,
            Instruction::Add { .. } => Opcode::Add,
            Instruction::Subtract { .. } => Opcode::Subtract,
            Instruction::Read { .. } => Opcode::Read,
            Instruction::Write { .. } => Opcode::Write,
        }
    }

    /// The virtual address whose page must be valid and resident before
    /// this instruction may run.  `DECLARE` targets the symbol table.
    pub fn virtual_address(&self) -> Option<u32> {
        match self {
            Instruction::Declare { .. } => Some(SYMBOL_TABLE_BASE),
            Instruction::Read { address, .. } | Instruction::Write { address, .. } => {
                Some(*address)
            }
            _ => None,
        }
    }

    /// Run the instruction against a process context.
    ///
    /// Residency misses surface as retryable [`ExecError`]s and leave
    /// registers, log and memory untouched.
    pub fn execute(&self, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        match self {
            Instruction::Print { message, append } => {
                let text = match append {
                    Some(var) => {
                        let value = ctx.registers.get(var).copied().unwrap_or(0);
                        format!("{}{}", message, value)
                    }
                    None => message.clone(),
                };
                ctx.emit(&text);
            }
            Instruction::Declare { var, value } => {
                if !ctx.memory.is_resident(ctx.pid, SYMBOL_TABLE_BASE) {
                    return Err(MemoryError::PageNotResident {
                        pid: ctx.pid,
                        page: 0,
                    }
                    .into());
                }
                ctx.registers.insert(var.clone(), *value);
            }
            Instruction::Add { dest, src1, src2 } => {
                let lhs = ctx.registers.get(src1).copied().unwrap_or(0);
                let rhs = src2.value_or_zero(ctx.registers);
                ctx.registers.insert(dest.clone(), lhs.saturating_add(rhs));
            }
            Instruction::Subtract { dest, src1, src2 } => {
                let lhs = ctx.registers.get(src1).copied().unwrap_or(0);
                let rhs = src2.value_or_zero(ctx.registers);
                ctx.registers.insert(dest.clone(), lhs.saturating_sub(rhs));
            }
            Instruction::Read { var, address } => {
                let value = ctx.memory.read(ctx.pid, *address)?;
                ctx.registers.insert(var.clone(), value);
                ctx.emit(&format!("READ {} = {} from {:#x}", var, value, address));
            }
            Instruction::Write { address, value } => {
                let value = value.resolve(ctx.registers)?;
                ctx.memory.write(ctx.pid, *address, value)?;
                ctx.emit(&format!("WRITE {} to {:#x}", value, address));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Print { message, append } => {
                let message = message.replace('\\', "\\\\").replace('"', "\\\"");
                match append {
                    Some(var) => write!(f, "PRINT(\"{}\" + {})", message, var),
                    None => write!(f, "PRINT(\"{}\")", message),
                }
            }
            Instruction::Declare { var, value } => write!(f, "DECLARE {} {}", var, value),
            Instruction::Add { dest, src1, src2 } => write!(f, "ADD {} {} {}", dest, src1, src2),
            Instruction::Subtract { dest, src1, src2 } => {
                write!(f, "SUBTRACT {} {} {}", dest, src1, src2)
            }
            Instruction::Read { var, address } => write!(f, "READ {} {:#x}", var, address),
            Instruction::Write { address, value } => write!(f, "WRITE {:#x} {}", address, value),
        }
    }
}

impl FromStr for Instruction {
    type Err = ParseInstructionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseInstructionError::Empty);
        }
        let split = s
            .find(|c: char| c.is_whitespace() || c == '(')
            .unwrap_or(s.len());
        let (head, rest) = s.split_at(split);
        let opcode: Opcode = head.parse()?;
        let operands: Vec<&str> = rest.split_whitespace().collect();
        let expect = |n: usize| {
            if operands.len() == n {
                Ok(())
            } else {
                Err(ParseInstructionError::Arity {
                    opcode,
                    expected: n,
                    got: operands.len(),
                })
            }
        };

        match opcode {
            Opcode::Print => parse_print(rest.trim()),
            Opcode::Declare => {
                expect(2)?;
                let value = parse_number(operands[1])
                    .and_then(|v| u16::try_from(v).ok())
                    .ok_or_else(|| ParseInstructionError::InvalidValue(operands[1].to_string()))?;
                Ok(Instruction::declare(name(operands[0])?, value))
            }
            Opcode::Add | Opcode::Subtract => {
                expect(3)?;
                let dest = name(operands[0])?;
                let src1 = name(operands[1])?;
                Ok(if opcode == Opcode::Add {
                    Instruction::add(dest, src1, operands[2])
                } else {
                    Instruction::subtract(dest, src1, operands[2])
                })
            }
            Opcode::Read => {
                expect(2)?;
                Ok(Instruction::read(name(operands[0])?, address(operands[1])?))
            }
            Opcode::Write => {
                expect(2)?;
                Ok(Instruction::write(address(operands[0])?, operands[1]))
            }
        }
    }
}

/// Parse a `;`-separated program.  Blank entries are skipped.  Inside a
/// quoted message `\"` and `\\` are escapes, so neither ends the string.
pub fn parse_program(text: &str) -> Result<Vec<Instruction>, ParseInstructionError> {
    let mut program = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            escaped = false;
            current.push(c);
            continue;
        }
        match c {
            '\\' if in_string => {
                escaped = true;
                current.push(c);
            }
            '"' => {
                in_string = !in_string;
                current.push(c);
            }
            ';' if !in_string => {
                if !current.trim().is_empty() {
                    program.push(current.parse()?);
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if in_string {
        return Err(ParseInstructionError::UnterminatedString(text.to_string()));
    }
    if !current.trim().is_empty() {
        program.push(current.parse()?);
    }
    Ok(program)
}

fn parse_print(rest: &str) -> Result<Instruction, ParseInstructionError> {
    let body = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .unwrap_or(rest)
        .trim();

    // `"text" + var` concatenates a register onto a quoted message.
    if let Some(after_quote) = body.strip_prefix('"') {
        let (message, end) = unescape_until_quote(after_quote)
            .ok_or_else(|| ParseInstructionError::UnterminatedString(rest.to_string()))?;
        let tail = after_quote[end + 1..].trim();
        if tail.is_empty() {
            return Ok(Instruction::Print {
                message,
                append: None,
            });
        }
        let var = tail
            .strip_prefix('+')
            .map(str::trim)
            .ok_or_else(|| ParseInstructionError::InvalidName(tail.to_string()))?;
        return Ok(Instruction::Print {
            message,
            append: Some(name(var)?),
        });
    }
    Ok(Instruction::print(body))
}

/// Message text up to the first unescaped `"`, and that quote's index.
/// A backslash before anything other than `"` or `\\` is kept as written.
fn unescape_until_quote(text: &str) -> Option<(String, usize)> {
    let mut message = String::new();
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Some((message, i)),
            '\\' => match chars.peek() {
                Some(&(_, next @ ('"' | '\\'))) => {
                    message.push(next);
                    chars.next();
                }
                _ => message.push(c),
            },
            _ => message.push(c),
        }
    }
    None
}

fn name(token: &str) -> Result<String, ParseInstructionError> {
    if is_identifier(token) {
        Ok(token.to_string())
    } else {
        Err(ParseInstructionError::InvalidName(token.to_string()))
    }
}

fn address(token: &str) -> Result<u32, ParseInstructionError> {
    parse_number(token)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| ParseInstructionError::InvalidAddress(token.to_string()))
}

/// Decimal or `0x`-prefixed hexadecimal.
fn parse_number(token: &str) -> Option<u64> {
    if let Some(hex) = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16).ok();
    }
    if token.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return token.parse().ok();
    }
    None
}

fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
