//! A small boolean, arithmetic and comparison grammar.
//!
//! This is the general fallback used when an expression is neither a direct
//! variable, a path nor a filter pipe. It has a fixed operator set, no
//! function calls and no access to anything except the supplied
//! [`Bindings`].
//!
//! ```text
//! or         := and (("||" | "or") and)*
//! and        := not (("&&" | "and") not)*
//! not        := ("!" | "not") not | comparison
//! comparison := additive (("==" | "!=" | "<" | ">" | "<=" | ">=") additive)?
//! additive   := term (("+" | "-") term)*
//! term       := unary (("*" | "/" | "%") unary)*
//! unary      := "-" unary | primary
//! primary    := number | string | true | false | null | reference | "(" or ")"
//! ```

use std::cmp::Ordering;

use float_cmp::approx_eq;
use logos::Logos;
use snailquote::unescape;

use crate::TesseraError;
use crate::TesseraResult;
use crate::Value;

#[derive(Logos, Debug, Clone, Copy, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum ExprToken {
	#[token("&&")]
	AndAnd,
	#[token("||")]
	OrOr,
	#[token("!")]
	Bang,
	#[token("==")]
	Equal,
	#[token("!=")]
	NotEqual,
	#[token("<=")]
	LessEqual,
	#[token(">=")]
	GreaterEqual,
	#[token("<")]
	Less,
	#[token(">")]
	Greater,
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
	#[token("(")]
	OpenParen,
	#[token(")")]
	CloseParen,
	#[regex(r"[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?")]
	Number,
	#[regex(r#""([^"\\]|\\.)*""#)]
	DoubleQuoted,
	#[regex(r"'([^'\\]|\\.)*'")]
	SingleQuoted,
	#[regex(r"[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*|\[[^\]]*\])*")]
	Reference,
}

/// Variable lookups available to [`evaluate`].
pub trait Bindings {
	/// Resolve a reference such as `Count`, `User.Name` or `Items[0]`.
	/// `Ok(None)` means unbound.
	fn lookup(&self, reference: &str) -> TesseraResult<Option<Value>>;
}

/// Failures while evaluating. Syntax errors are not reported to callers.
enum Failure {
	Syntax,
	Lookup(TesseraError),
}

impl From<TesseraError> for Failure {
	fn from(error: TesseraError) -> Self {
		Self::Lookup(error)
	}
}

type Evaluated = Result<Value, Failure>;

/// Evaluate `text` against `bindings`.
///
/// Returns `Ok(None)` when the text is not a valid expression or evaluates to
/// null. Errors raised by a lookup are propagated.
pub fn evaluate(text: &str, bindings: &dyn Bindings) -> TesseraResult<Option<Value>> {
	let mut tokens = Vec::new();
	for (token, span) in ExprToken::lexer(text).spanned() {
		match token {
			Ok(token) => tokens.push((token, &text[span])),
			Err(()) => return Ok(None),
		}
	}

	if tokens.is_empty() {
		return Ok(None);
	}

	let mut parser = ExprParser {
		tokens,
		cursor: 0,
		bindings,
	};

	match parser.parse_or() {
		Ok(value) if parser.cursor == parser.tokens.len() => {
			Ok(if value.is_null() { None } else { Some(value) })
		}
		Ok(_) | Err(Failure::Syntax) => Ok(None),
		Err(Failure::Lookup(error)) => Err(error),
	}
}

struct ExprParser<'t, 'b> {
	tokens: Vec<(ExprToken, &'t str)>,
	cursor: usize,
	bindings: &'b dyn Bindings,
}

impl<'t> ExprParser<'t, '_> {
	fn peek(&self) -> Option<(ExprToken, &'t str)> {
		self.tokens.get(self.cursor).copied()
	}

	/// Consume the next token when it is the given keyword, ignoring case.
	fn eat_keyword(&mut self, keyword: &str) -> bool {
		match self.peek() {
			Some((ExprToken::Reference, text)) if text.eq_ignore_ascii_case(keyword) => {
				self.cursor += 1;
				true
			}
			_ => false,
		}
	}

	fn eat(&mut self, expected: ExprToken) -> bool {
		if self.peek().is_some_and(|(token, _)| token == expected) {
			self.cursor += 1;
			true
		} else {
			false
		}
	}

	fn parse_or(&mut self) -> Evaluated {
		let mut left = self.parse_and()?;
		while self.eat(ExprToken::OrOr) || self.eat_keyword("or") {
			let right = self.parse_and()?;
			left = Value::Bool(left.is_truthy() || right.is_truthy());
		}
		Ok(left)
	}

	fn parse_and(&mut self) -> Evaluated {
		let mut left = self.parse_not()?;
		while self.eat(ExprToken::AndAnd) || self.eat_keyword("and") {
			let right = self.parse_not()?;
			left = Value::Bool(left.is_truthy() && right.is_truthy());
		}
		Ok(left)
	}

	fn parse_not(&mut self) -> Evaluated {
		if self.eat(ExprToken::Bang) || self.eat_keyword("not") {
			let operand = self.parse_not()?;
			return Ok(Value::Bool(!operand.is_truthy()));
		}
		self.parse_comparison()
	}

	fn parse_comparison(&mut self) -> Evaluated {
		let left = self.parse_additive()?;
		let Some((operator, _)) = self.peek() else {
			return Ok(left);
		};

		let test: fn(&Value, &Value) -> bool = match operator {
			ExprToken::Equal => loosely_equal,
			ExprToken::NotEqual => |left, right| !loosely_equal(left, right),
			ExprToken::Less => |left, right| compare(left, right) == Some(Ordering::Less),
			ExprToken::Greater => |left, right| compare(left, right) == Some(Ordering::Greater),
			ExprToken::LessEqual => {
				|left, right| matches!(compare(left, right), Some(Ordering::Less | Ordering::Equal))
			}
			ExprToken::GreaterEqual => {
				|left, right| {
					matches!(
						compare(left, right),
						Some(Ordering::Greater | Ordering::Equal)
					)
				}
			}
			_ => return Ok(left),
		};

		self.cursor += 1;
		let right = self.parse_additive()?;
		Ok(Value::Bool(test(&left, &right)))
	}

	fn parse_additive(&mut self) -> Evaluated {
		let mut left = self.parse_term()?;
		loop {
			if self.eat(ExprToken::Plus) {
				let right = self.parse_term()?;
				left = add(&left, &right);
			} else if self.eat(ExprToken::Minus) {
				let right = self.parse_term()?;
				left = arithmetic(&left, &right, i64::checked_sub, |a, b| a - b);
			} else {
				return Ok(left);
			}
		}
	}

	fn parse_term(&mut self) -> Evaluated {
		let mut left = self.parse_unary()?;
		loop {
			if self.eat(ExprToken::Star) {
				let right = self.parse_unary()?;
				left = arithmetic(&left, &right, i64::checked_mul, |a, b| a * b);
			} else if self.eat(ExprToken::Slash) {
				let right = self.parse_unary()?;
				left = divide(&left, &right);
			} else if self.eat(ExprToken::Percent) {
				let right = self.parse_unary()?;
				left = arithmetic(&left, &right, i64::checked_rem, |a, b| {
					if b == 0.0 { f64::NAN } else { a % b }
				});
			} else {
				return Ok(left);
			}
		}
	}

	fn parse_unary(&mut self) -> Evaluated {
		if self.eat(ExprToken::Minus) {
			let operand = self.parse_unary()?;
			return Ok(match operand {
				Value::Int(value) => value.checked_neg().map_or(Value::Null, Value::Int),
				other => other.as_f64().map_or(Value::Null, |value| Value::Float(-value)),
			});
		}
		self.parse_primary()
	}

	fn parse_primary(&mut self) -> Evaluated {
		let Some((token, text)) = self.peek() else {
			return Err(Failure::Syntax);
		};
		self.cursor += 1;

		match token {
			ExprToken::Number => Ok(parse_number(text)),
			ExprToken::DoubleQuoted | ExprToken::SingleQuoted => Ok(Value::from(unquote(text))),
			ExprToken::Reference => {
				if text.eq_ignore_ascii_case("true") {
					Ok(Value::Bool(true))
				} else if text.eq_ignore_ascii_case("false") {
					Ok(Value::Bool(false))
				} else if text.eq_ignore_ascii_case("null") {
					Ok(Value::Null)
				} else if ["and", "or", "not"]
					.iter()
					.any(|keyword| text.eq_ignore_ascii_case(keyword))
				{
					Err(Failure::Syntax)
				} else {
					Ok(self.bindings.lookup(text)?.unwrap_or_default())
				}
			}
			ExprToken::OpenParen => {
				let value = self.parse_or()?;
				if self.eat(ExprToken::CloseParen) {
					Ok(value)
				} else {
					Err(Failure::Syntax)
				}
			}
			_ => Err(Failure::Syntax),
		}
	}
}

fn parse_number(text: &str) -> Value {
	if let Ok(value) = text.parse::<i64>() {
		return Value::Int(value);
	}
	text.parse::<f64>().map_or(Value::Null, Value::Float)
}

fn unquote(text: &str) -> String {
	unescape(text).unwrap_or_else(|_| text[1..text.len() - 1].to_string())
}

/// Both sides count as numbers: typed numbers or numeric strings.
fn numbers(left: &Value, right: &Value) -> Option<(f64, f64)> {
	let numeric = |value: &Value| matches!(value, Value::Int(_) | Value::Float(_) | Value::String(_));
	if !(numeric(left) && numeric(right)) {
		return None;
	}
	Some((left.as_f64()?, right.as_f64()?))
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
	match (left, right) {
		(Value::Null, other) | (other, Value::Null) => other.is_null(),
		(Value::Bool(a), Value::Bool(b)) => a == b,
		(Value::Bool(flag), other) | (other, Value::Bool(flag)) => {
			other.to_string().eq_ignore_ascii_case(&flag.to_string())
		}
		_ => {
			match numbers(left, right) {
				Some((a, b)) => approx_eq!(f64, a, b, ulps = 2),
				None => left == right || left.to_string() == right.to_string(),
			}
		}
	}
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
	if left.is_null() || right.is_null() {
		return None;
	}
	match numbers(left, right) {
		Some((a, b)) => a.partial_cmp(&b),
		None => Some(left.to_string().cmp(&right.to_string())),
	}
}

fn add(left: &Value, right: &Value) -> Value {
	match (left, right) {
		(Value::String(_), _) | (_, Value::String(_)) => Value::from(format!("{left}{right}")),
		_ => arithmetic(left, right, i64::checked_add, |a, b| a + b),
	}
}

fn arithmetic(
	left: &Value,
	right: &Value,
	integer: fn(i64, i64) -> Option<i64>,
	float: fn(f64, f64) -> f64,
) -> Value {
	if let (Value::Int(a), Value::Int(b)) = (left, right) {
		if let Some(result) = integer(*a, *b) {
			return Value::Int(result);
		}
	}

	match numbers(left, right) {
		Some((a, b)) => {
			let result = float(a, b);
			if result.is_nan() { Value::Null } else { Value::Float(result) }
		}
		None => Value::Null,
	}
}

fn divide(left: &Value, right: &Value) -> Value {
	match numbers(left, right) {
		Some((_, divisor)) if divisor == 0.0 => Value::Null,
		Some((a, b)) => {
			if let (Value::Int(x), Value::Int(y)) = (left, right) {
				if x.checked_rem(*y) == Some(0) {
					if let Some(quotient) = x.checked_div(*y) {
						return Value::Int(quotient);
					}
				}
			}
			Value::Float(a / b)
		}
		None => Value::Null,
	}
}
