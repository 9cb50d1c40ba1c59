use serde_json::{json, Value};

use crate::{Capability, ParamSpec, ToolError, ToolSpec};
use planwise_domain::ToolArguments;

pub const MAX_EXPRESSION_LEN: usize = 256;
pub const MAX_NESTING_DEPTH: usize = 64;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum CalcError {
    #[error("expression is empty")]
    Empty,
    #[error("expression is {len} characters, limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("unsupported character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("unsupported identifier '{ident}' at position {pos}")]
    UnexpectedIdentifier { ident: String, pos: usize },
    #[error("invalid number '{text}' at position {pos}")]
    InvalidNumber { text: String, pos: usize },
    #[error("unexpected '{token}' at position {pos}")]
    UnexpectedToken { token: String, pos: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("expression nesting exceeds {max} levels")]
    TooDeep { max: usize },
    #[error("division by zero")]
    DivisionByZero,
    #[error("result is not a finite number")]
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TokenKind {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Pow,
    LParen,
    RParen,
}

impl TokenKind {
    fn text(self) -> String {
        match self {
            Self::Number(value) => format!("{value}"),
            Self::Plus => "+".to_string(),
            Self::Minus => "-".to_string(),
            Self::Star => "*".to_string(),
            Self::Slash => "/".to_string(),
            Self::Percent => "%".to_string(),
            Self::Pow => "**".to_string(),
            Self::LParen => "(".to_string(),
            Self::RParen => ")".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

fn tokenize(input: &str) -> Result<Vec<Token>, CalcError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let ch = chars[pos];
        let kind = match ch {
            c if c.is_whitespace() => {
                pos += 1;
                continue;
            }
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' if chars.get(pos + 1) == Some(&'*') => {
                tokens.push(Token {
                    kind: TokenKind::Pow,
                    pos,
                });
                pos += 2;
                continue;
            }
            '*' => TokenKind::Star,
            '^' => TokenKind::Pow,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            c if c.is_ascii_digit() || c == '.' => {
                let start = pos;
                pos = scan_number(&chars, pos);
                let text: String = chars[start..pos].iter().collect();
                let value = text.parse::<f64>().map_err(|_| CalcError::InvalidNumber {
                    text: text.clone(),
                    pos: start,
                })?;
                tokens.push(Token {
                    kind: TokenKind::Number(value),
                    pos: start,
                });
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_') {
                    pos += 1;
                }
                return Err(CalcError::UnexpectedIdentifier {
                    ident: chars[start..pos].iter().collect(),
                    pos: start,
                });
            }
            other => return Err(CalcError::UnexpectedChar { ch: other, pos }),
        };
        tokens.push(Token { kind, pos });
        pos += 1;
    }
    Ok(tokens)
}

fn scan_number(chars: &[char], mut pos: usize) -> usize {
    while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
        pos += 1;
    }
    if pos < chars.len() && matches!(chars[pos], 'e' | 'E') {
        let mut exp = pos + 1;
        if exp < chars.len() && matches!(chars[exp], '+' | '-') {
            exp += 1;
        }
        if exp < chars.len() && chars[exp].is_ascii_digit() {
            pos = exp;
            while pos < chars.len() && chars[pos].is_ascii_digit() {
                pos += 1;
            }
        }
    }
    pos
}

struct Parser {
    tokens: Vec<Token>,
    cursor: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.cursor).copied()
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.peek();
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn descend(&mut self) -> Result<(), CalcError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(CalcError::TooDeep {
                max: MAX_NESTING_DEPTH,
            });
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Expr, CalcError> {
        let mut lhs = self.term()?;
        while let Some(token) = self.peek() {
            let op = match token.kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.cursor += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, CalcError> {
        let mut lhs = self.unary()?;
        while let Some(token) = self.peek() {
            let op = match token.kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.cursor += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, CalcError> {
        let op = match self.peek().map(|token| token.kind) {
            Some(TokenKind::Plus) => UnaryOp::Plus,
            Some(TokenKind::Minus) => UnaryOp::Neg,
            _ => return self.power(),
        };
        self.cursor += 1;
        self.descend()?;
        let operand = self.unary()?;
        self.depth -= 1;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    // `**` binds tighter than a unary sign on its left and accepts one on its right.
    fn power(&mut self) -> Result<Expr, CalcError> {
        let base = self.primary()?;
        if matches!(self.peek().map(|token| token.kind), Some(TokenKind::Pow)) {
            self.cursor += 1;
            self.descend()?;
            let exponent = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, CalcError> {
        let Some(token) = self.advance() else {
            return Err(CalcError::UnexpectedEnd);
        };
        match token.kind {
            TokenKind::Number(value) => Ok(Expr::Number(value)),
            TokenKind::LParen => {
                self.descend()?;
                let inner = self.expr()?;
                self.depth -= 1;
                match self.advance() {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => Ok(inner),
                    Some(other) => Err(CalcError::UnexpectedToken {
                        token: other.kind.text(),
                        pos: other.pos,
                    }),
                    None => Err(CalcError::UnexpectedEnd),
                }
            }
            other => Err(CalcError::UnexpectedToken {
                token: other.text(),
                pos: token.pos,
            }),
        }
    }
}

/// Parse an arithmetic expression into a tree.
///
/// # Errors
/// Returns a `CalcError` naming the offending token for anything outside the grammar.
pub fn parse_expression(input: &str) -> Result<Expr, CalcError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(CalcError::Empty);
    }
    let len = trimmed.chars().count();
    if len > MAX_EXPRESSION_LEN {
        return Err(CalcError::TooLong {
            len,
            max: MAX_EXPRESSION_LEN,
        });
    }

    let mut parser = Parser {
        tokens: tokenize(input)?,
        cursor: 0,
        depth: 0,
    };
    let expr = parser.expr()?;
    if let Some(extra) = parser.peek() {
        return Err(CalcError::UnexpectedToken {
            token: extra.kind.text(),
            pos: extra.pos,
        });
    }
    Ok(expr)
}

fn finite(value: f64) -> Result<f64, CalcError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CalcError::NonFinite)
    }
}

impl Expr {
    /// # Errors
    /// Returns an error on division or modulo by zero and on non-finite results.
    pub fn eval(&self) -> Result<f64, CalcError> {
        match self {
            Self::Number(value) => finite(*value),
            Self::Unary(UnaryOp::Plus, operand) => operand.eval(),
            Self::Unary(UnaryOp::Neg, operand) => Ok(-operand.eval()?),
            Self::Binary(op, lhs, rhs) => {
                let lhs = lhs.eval()?;
                let rhs = rhs.eval()?;
                let value = match op {
                    BinaryOp::Add => lhs + rhs,
                    BinaryOp::Sub => lhs - rhs,
                    BinaryOp::Mul => lhs * rhs,
                    BinaryOp::Div => {
                        if rhs == 0.0 {
                            return Err(CalcError::DivisionByZero);
                        }
                        lhs / rhs
                    }
                    // floored modulo: the result takes the sign of the divisor
                    BinaryOp::Mod => {
                        if rhs == 0.0 {
                            return Err(CalcError::DivisionByZero);
                        }
                        lhs - rhs * (lhs / rhs).floor()
                    }
                    BinaryOp::Pow => lhs.powf(rhs),
                };
                finite(value)
            }
        }
    }
}

/// # Errors
/// Returns a `CalcError` when the expression does not parse or evaluate.
pub fn evaluate(input: &str) -> Result<f64, CalcError> {
    parse_expression(input)?.eval()
}

const CALCULATOR_PARAMS: &[ParamSpec] = &[ParamSpec {
    name: "expression",
    description: "arithmetic over numbers with + - * / % ** and parentheses",
    required: true,
    max_len: MAX_EXPRESSION_LEN,
}];

const CALCULATOR_SPEC: ToolSpec = ToolSpec {
    name: "calculator",
    description: "Evaluate a numeric arithmetic expression, e.g. growth rates or CAGR.",
    params: CALCULATOR_PARAMS,
    primary_param: "expression",
};

#[derive(Debug, Clone, Copy, Default)]
pub struct Calculator;

impl Capability for Calculator {
    fn spec(&self) -> &ToolSpec {
        &CALCULATOR_SPEC
    }

    fn call(&self, arguments: &ToolArguments) -> Result<Value, ToolError> {
        let expression = crate::required_str(arguments, "expression")?;
        let value = evaluate(expression).map_err(|err| ToolError::Failed(err.to_string()))?;
        Ok(json!({ "expression": expression, "value": value }))
    }
}

#[cfg(test)]
mod tests {
    use super::{evaluate, CalcError, MAX_NESTING_DEPTH};
    use proptest::prelude::*;

    fn value(input: &str) -> f64 {
        match evaluate(input) {
            Ok(value) => value,
            Err(err) => panic!("{input} should evaluate: {err}"),
        }
    }

    #[test]
    fn percentage_change_evaluates_exactly() {
        assert!((value("(120-100)/100*100") - 20.0).abs() < f64::EPSILON);
        let encoded = serde_json::json!(value("(120-100)/100*100"));
        assert_eq!(encoded.to_string(), "20.0");
    }

    #[test]
    fn prose_is_rejected_with_token_and_position() {
        assert_eq!(
            evaluate("Calculate CAGR from step 3"),
            Err(CalcError::UnexpectedIdentifier {
                ident: "Calculate".to_string(),
                pos: 0
            })
        );
        assert_eq!(
            evaluate("2 + abs(3)"),
            Err(CalcError::UnexpectedIdentifier {
                ident: "abs".to_string(),
                pos: 4
            })
        );
        assert_eq!(
            evaluate("1 & 2"),
            Err(CalcError::UnexpectedChar { ch: '&', pos: 2 })
        );
    }

    #[test]
    fn precedence_and_associativity() {
        assert!((value("2 + 3 * 4") - 14.0).abs() < f64::EPSILON);
        assert!((value("2 ** 3 ** 2") - 512.0).abs() < f64::EPSILON);
        assert!((value("2 ^ 3 ^ 2") - 512.0).abs() < f64::EPSILON);
        assert!((value("-2 ** 2") + 4.0).abs() < f64::EPSILON);
        assert!((value("2 ** -1") - 0.5).abs() < f64::EPSILON);
        assert!((value("10 - 4 - 3") - 3.0).abs() < f64::EPSILON);
        assert!((value("-7 % 3") - 2.0).abs() < f64::EPSILON);
        assert!((value("1.5e2 / 3") - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cagr_template_evaluates() {
        let cagr = value("((10.9 / 3.66) ** (1/3) - 1) * 100");
        assert!((cagr - 43.87).abs() < 0.01, "{cagr}");
    }

    #[test]
    fn arithmetic_faults_are_errors() {
        assert_eq!(evaluate("1 / 0"), Err(CalcError::DivisionByZero));
        assert_eq!(evaluate("5 % (2 - 2)"), Err(CalcError::DivisionByZero));
        assert_eq!(evaluate("10 ** 400"), Err(CalcError::NonFinite));
        assert_eq!(evaluate("   "), Err(CalcError::Empty));
        assert_eq!(evaluate("(1 + 2"), Err(CalcError::UnexpectedEnd));
        assert!(matches!(
            evaluate("1 + 2)"),
            Err(CalcError::UnexpectedToken { pos: 5, .. })
        ));
        assert!(matches!(evaluate("1..2"), Err(CalcError::InvalidNumber { .. })));
    }

    #[test]
    fn limits_are_enforced() {
        let long = format!("1{}", "+1".repeat(200));
        assert!(matches!(evaluate(&long), Err(CalcError::TooLong { .. })));

        let deep = format!("{}1{}", "(".repeat(MAX_NESTING_DEPTH + 1), ")".repeat(MAX_NESTING_DEPTH + 1));
        assert_eq!(
            evaluate(&deep),
            Err(CalcError::TooDeep {
                max: MAX_NESTING_DEPTH
            })
        );
        let shallow = format!("{}1{}", "(".repeat(10), ")".repeat(10));
        assert!((value(&shallow) - 1.0).abs() < f64::EPSILON);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn integer_arithmetic_matches_native(a in -10_000_i64..10_000, b in -10_000_i64..10_000) {
            let sum = evaluate(&format!("{a} + {b}"));
            prop_assert_eq!(sum, Ok((a + b) as f64));
            let product = evaluate(&format!("({a}) * ({b})"));
            prop_assert_eq!(product, Ok((a * b) as f64));
            let difference = evaluate(&format!("{a} - ({b})"));
            prop_assert_eq!(difference, Ok((a - b) as f64));
        }

        #[test]
        fn whitespace_does_not_change_the_result(a in 0_i64..1_000, b in 1_i64..1_000) {
            let tight = evaluate(&format!("{a}/{b}"));
            let spaced = evaluate(&format!("  {a} /   {b} "));
            prop_assert_eq!(tight, spaced);
        }
    }
}
