//! Linker script `MEMORY` region parsing
//!
//! Only enough of the linker script language is understood to evaluate the `ORIGIN` of a single
//! region, e.g.
//!
//! ```text
//! DSP (rwx) : ORIGIN = (0x01000000 + 384K), LENGTH = 64K
//! ```

use std::fs;
use std::path::Path;

use log::debug;
use thiserror::Error;

use crate::Error;

#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("The {} region on line {} has no ORIGIN", region, line)]
    MissingOrigin { region: String, line: usize },
    #[error("Unexpected character {:?} at position {} in {:?}", character, position, expression)]
    UnexpectedCharacter {
        character: char,
        position: usize,
        expression: String,
    },
    #[error("Unexpected end of expression {:?}", _0)]
    UnexpectedEnd(String),
    #[error("Invalid number {:?}", _0)]
    InvalidNumber(String),
    #[error("Division by zero in {:?}", _0)]
    DivisionByZero(String),
    #[error("The value of {:?} does not fit in 32 bits", _0)]
    Overflow(String),
}

/// The text of a linker script
#[derive(Debug, Clone, Default)]
pub struct LinkerScript {
    contents: String,
}

impl LinkerScript {
    /// Reads the linker script at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<LinkerScript, Error> {
        let contents = fs::read_to_string(path)?;

        Ok(LinkerScript { contents })
    }

    pub fn parse<S: Into<String>>(contents: S) -> LinkerScript {
        LinkerScript {
            contents: contents.into(),
        }
    }

    /// Evaluates the `ORIGIN` of the first memory region called `region`
    ///
    /// Returns `None` if the script doesn't declare the region.
    pub fn origin(&self, region: &str) -> Result<Option<u32>, ExpressionError> {
        for (index, line) in self.contents.lines().enumerate() {
            if !declares_region(line, region) {
                continue;
            }

            let position = line
                .find("ORIGIN")
                .ok_or_else(|| ExpressionError::MissingOrigin {
                    region: region.to_string(),
                    line: index + 1,
                })?;

            let rest = line[position + "ORIGIN".len()..].trim_start();
            let rest = rest.strip_prefix('=').unwrap_or(rest);
            let expression = top_level_operand(rest);
            let origin = evaluate(expression)?;

            debug!(
                "ORIGIN of {} on line {} is {:?} = {:#010x}",
                region,
                index + 1,
                expression.trim(),
                origin
            );

            return Ok(Some(origin));
        }

        Ok(None)
    }
}

/// Returns true if `line` starts a `MEMORY` entry for `region`
fn declares_region(line: &str, region: &str) -> bool {
    let line = line.trim_start();

    match line.strip_prefix(region) {
        Some(rest) => rest
            .chars()
            .next()
            .map_or(false, |c| c.is_whitespace() || c == '(' || c == ':'),
        None => false,
    }
}

/// Returns the part of `text` up to the first `,` that is not nested in parentheses
fn top_level_operand(text: &str) -> &str {
    let mut depth = 0i32;

    for (position, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth <= 0 => return &text[..position],
            _ => {}
        }
    }

    text
}

/// Evaluates an integer expression the way the linker evaluates `ORIGIN` and `LENGTH`
///
/// Supports decimal and `0x` literals with an optional `K` or `M` suffix, the binary operators
/// `| & << >> + - * / %`, unary minus and parentheses.
pub fn evaluate(expression: &str) -> Result<u32, ExpressionError> {
    let mut parser = ExpressionParser {
        expression,
        bytes: expression.as_bytes(),
        position: 0,
    };

    let value = parser.parse_or()?;

    parser.skip_whitespace();

    if let Some(c) = parser.peek() {
        return Err(parser.unexpected(c));
    }

    if value < 0 || value > i64::from(u32::MAX) {
        return Err(ExpressionError::Overflow(expression.to_string()));
    }

    Ok(value as u32)
}

struct ExpressionParser<'a> {
    expression: &'a str,
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ExpressionParser<'a> {
    fn peek(&self) -> Option<char> {
        self.bytes.get(self.position).map(|b| *b as char)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().map_or(false, |c| c.is_ascii_whitespace()) {
            self.position += 1;
        }
    }

    /// Consumes `token` if it is next in the input
    fn eat(&mut self, token: &str) -> bool {
        self.skip_whitespace();

        if self.expression[self.position..].starts_with(token) {
            self.position += token.len();
            true
        } else {
            false
        }
    }

    fn unexpected(&self, character: char) -> ExpressionError {
        ExpressionError::UnexpectedCharacter {
            character,
            position: self.position,
            expression: self.expression.to_string(),
        }
    }

    fn overflow(&self) -> ExpressionError {
        ExpressionError::Overflow(self.expression.to_string())
    }

    fn parse_or(&mut self) -> Result<i64, ExpressionError> {
        let mut value = self.parse_and()?;

        while self.eat("|") {
            value |= self.parse_and()?;
        }

        Ok(value)
    }

    fn parse_and(&mut self) -> Result<i64, ExpressionError> {
        let mut value = self.parse_shift()?;

        while self.eat("&") {
            value &= self.parse_shift()?;
        }

        Ok(value)
    }

    fn parse_shift(&mut self) -> Result<i64, ExpressionError> {
        let mut value = self.parse_sum()?;

        loop {
            if self.eat("<<") {
                let amount = self.parse_sum()?;
                value = shift(value, amount, shift_left).ok_or_else(|| self.overflow())?;
            } else if self.eat(">>") {
                let amount = self.parse_sum()?;
                value = shift(value, amount, i64::checked_shr).ok_or_else(|| self.overflow())?;
            } else {
                return Ok(value);
            }
        }
    }

    fn parse_sum(&mut self) -> Result<i64, ExpressionError> {
        let mut value = self.parse_product()?;

        loop {
            let result = if self.eat("+") {
                value.checked_add(self.parse_product()?)
            } else if self.eat("-") {
                value.checked_sub(self.parse_product()?)
            } else {
                return Ok(value);
            };

            value = result.ok_or_else(|| self.overflow())?;
        }
    }

    fn parse_product(&mut self) -> Result<i64, ExpressionError> {
        let mut value = self.parse_unary()?;

        loop {
            let result = if self.eat("*") {
                value.checked_mul(self.parse_unary()?)
            } else if self.eat("/") {
                let divisor = self.parse_unary()?;
                if divisor == 0 {
                    return Err(ExpressionError::DivisionByZero(self.expression.to_string()));
                }
                value.checked_div(divisor)
            } else if self.eat("%") {
                let divisor = self.parse_unary()?;
                if divisor == 0 {
                    return Err(ExpressionError::DivisionByZero(self.expression.to_string()));
                }
                value.checked_rem(divisor)
            } else {
                return Ok(value);
            };

            value = result.ok_or_else(|| self.overflow())?;
        }
    }

    fn parse_unary(&mut self) -> Result<i64, ExpressionError> {
        if self.eat("-") {
            let value = self.parse_unary()?;
            return value.checked_neg().ok_or_else(|| self.overflow());
        }

        if self.eat("(") {
            let value = self.parse_or()?;

            if !self.eat(")") {
                return match self.peek() {
                    Some(c) => Err(self.unexpected(c)),
                    None => Err(ExpressionError::UnexpectedEnd(self.expression.to_string())),
                };
            }

            return Ok(value);
        }

        self.parse_number()
    }

    fn parse_number(&mut self) -> Result<i64, ExpressionError> {
        self.skip_whitespace();

        let start = self.position;

        while self.peek().map_or(false, |c| c.is_ascii_alphanumeric()) {
            self.position += 1;
        }

        let literal = &self.expression[start..self.position];

        if literal.is_empty() {
            return match self.peek() {
                Some(c) => Err(self.unexpected(c)),
                None => Err(ExpressionError::UnexpectedEnd(self.expression.to_string())),
            };
        }

        parse_literal(literal).ok_or_else(|| ExpressionError::InvalidNumber(literal.to_string()))
    }
}

fn shift(value: i64, amount: i64, op: fn(i64, u32) -> Option<i64>) -> Option<i64> {
    if !(0..64).contains(&amount) {
        return None;
    }

    op(value, amount as u32)
}

/// Shifts left, failing when set bits are shifted out
fn shift_left(value: i64, amount: u32) -> Option<i64> {
    value
        .checked_shl(amount)
        .filter(|shifted| shifted >> amount == value)
}

/// Parses a number literal, e.g. `0x1000`, `4096`, `4K` or `1M`
fn parse_literal(literal: &str) -> Option<i64> {
    let lower = literal.to_ascii_lowercase();

    let (digits, multiplier) = if lower.starts_with("0x") {
        (&lower[..], 1)
    } else if let Some(digits) = lower.strip_suffix('k') {
        (digits, 1024)
    } else if let Some(digits) = lower.strip_suffix('m') {
        (digits, 1024 * 1024)
    } else {
        (&lower[..], 1)
    };

    let value = match digits.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };

    value.checked_mul(multiplier)
}
