//! Argument polymorphism shared by filter and predicate specs: a tagged
//! dynamic value plus a positional, error-accumulating consumer (`Args`)
//! that specs use to coerce their raw argument vector into typed fields.

use std::fmt;
use std::time::Duration;

use regex::Regex;

use crate::error::ArgError;

/// A single route argument, already lexed and typed by whatever produced the
/// route definition (reading the DSL text itself is out of scope here).
#[derive(Debug, Clone)]
pub enum Value {
    String(String),
    Number(f64),
    Duration(Duration),
    Regexp(Regex),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Duration(a), Value::Duration(b)) => a == b,
            (Value::Regexp(a), Value::Regexp(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Number(n) => write!(f, "{n}"),
            Value::Duration(d) => write!(f, "{d:?}"),
            Value::Regexp(r) => write!(f, "{}", r.as_str()),
        }
    }
}

/// How a duration-valued bare number should be interpreted; a spec chooses
/// one when it calls [`Args::duration`], since a bare `250` is ambiguous
/// between "250ms" and "250s" depending on the argument's convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericDurationUnit {
    Millis,
    Seconds,
}

/// Positional consumer over a spec's raw argument vector. Every coercion
/// failure is pushed onto a shared [`ArgError`] rather than returned eagerly,
/// so a spec can report every offending position in one error.
pub struct Args<'a> {
    spec_name: &'static str,
    values: &'a [Value],
    pos: usize,
    errors: ArgError,
}

impl<'a> Args<'a> {
    pub fn new(spec_name: &'static str, values: &'a [Value]) -> Self {
        Self { spec_name, values, pos: 0, errors: ArgError::new(spec_name) }
    }

    fn next_raw(&mut self) -> Option<&'a Value> {
        let v = self.values.get(self.pos);
        if v.is_some() {
            self.pos += 1;
        }
        v
    }

    /// Consumes one string argument.
    pub fn string(&mut self) -> Option<String> {
        let pos = self.pos;
        match self.next_raw() {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                self.errors.push(pos, format!("expected a string, got {other}"));
                None
            }
            None => {
                self.errors.push(pos, "missing required string argument");
                None
            }
        }
    }

    /// Consumes one integer argument (i64). Accepts a bare number only if it
    /// has no fractional part.
    pub fn integer(&mut self) -> Option<i64> {
        let pos = self.pos;
        match self.next_raw() {
            Some(Value::Number(n)) if n.fract() == 0.0 => Some(*n as i64),
            Some(Value::Number(n)) => {
                self.errors.push(pos, format!("expected an integer, got fractional {n}"));
                None
            }
            Some(other) => {
                self.errors.push(pos, format!("expected an integer, got {other}"));
                None
            }
            None => {
                self.errors.push(pos, "missing required integer argument");
                None
            }
        }
    }

    /// Consumes one wide (64-bit) integer argument; same coercion rules as
    /// [`Args::integer`], kept as a distinct method so call sites can
    /// document the wider intended range even though the representation is
    /// already i64.
    pub fn integer64(&mut self) -> Option<i64> {
        self.integer()
    }

    /// Consumes one duration argument: a literal `Duration` value, a string
    /// parseable as a duration, or a bare number interpreted per `unit`.
    /// Negative durations fail.
    pub fn duration(&mut self, unit: NumericDurationUnit) -> Option<Duration> {
        let pos = self.pos;
        match self.next_raw() {
            Some(Value::Duration(d)) => Some(*d),
            Some(Value::String(s)) => match parse_duration_literal(s) {
                Some(d) => Some(d),
                None => {
                    self.errors.push(pos, format!("'{s}' is not a parseable duration"));
                    None
                }
            },
            Some(Value::Number(n)) if *n < 0.0 => {
                self.errors.push(pos, format!("duration {n} must not be negative"));
                None
            }
            Some(Value::Number(n)) => Some(match unit {
                NumericDurationUnit::Millis => Duration::from_secs_f64(n / 1000.0),
                NumericDurationUnit::Seconds => Duration::from_secs_f64(*n),
            }),
            Some(other) => {
                self.errors.push(pos, format!("expected a duration, got {other}"));
                None
            }
            None => {
                self.errors.push(pos, "missing required duration argument");
                None
            }
        }
    }

    /// Consumes one more string argument if any remain; absence is not an
    /// error (used for a trailing, optional argument such as a queue's
    /// group name), but a present non-string value still fails.
    pub fn optional_string(&mut self) -> Option<String> {
        if self.pos >= self.values.len() {
            return None;
        }
        let pos = self.pos;
        match self.next_raw() {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                self.errors.push(pos, format!("expected a string, got {other}"));
                None
            }
            None => None,
        }
    }

    /// Consumes every remaining argument as a string, failing if any
    /// remaining value is not a string.
    pub fn trailing_strings(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while self.pos < self.values.len() {
            let pos = self.pos;
            match self.next_raw() {
                Some(Value::String(s)) => out.push(s.clone()),
                Some(other) => {
                    self.errors.push(pos, format!("expected a string, got {other}"));
                }
                None => unreachable!(),
            }
        }
        out
    }

    /// Fails if there are more arguments than have been consumed so far.
    pub fn no_more(&mut self) {
        if self.pos < self.values.len() {
            self.errors.push(
                self.pos,
                format!("expects {} arguments, got {}", self.pos, self.values.len()),
            );
        }
    }

    /// Finalizes argument consumption, returning the accumulated error if
    /// any coercion failed along the way.
    pub fn finish(self) -> Result<(), ArgError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }

    pub fn spec_name(&self) -> &'static str {
        self.spec_name
    }
}

/// Parses a literal like `"11ms"`, `"3s"`, `"1m30s"`. Negative values fail.
fn parse_duration_literal(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(stripped) = s.strip_prefix('-') {
        let _ = parse_duration_literal(stripped)?;
        return None;
    }

    let mut total = Duration::ZERO;
    let mut chars = s.char_indices().peekable();
    let mut start = 0;
    let mut saw_any = false;

    while let Some(&(idx, c)) = chars.peek() {
        if c.is_ascii_digit() || c == '.' {
            chars.next();
            continue;
        }
        // unit starts here
        let num_str = &s[start..idx];
        if num_str.is_empty() {
            return None;
        }
        let num: f64 = num_str.parse().ok()?;

        let unit_start = idx;
        while let Some(&(_, c2)) = chars.peek() {
            if c2.is_ascii_digit() || c2 == '.' {
                break;
            }
            chars.next();
        }
        let unit_end = chars.peek().map(|&(i, _)| i).unwrap_or(s.len());
        let unit = &s[unit_start..unit_end];

        let unit_dur = match unit {
            "ns" => Duration::from_secs_f64(num / 1_000_000_000.0),
            "us" | "\u{b5}s" => Duration::from_secs_f64(num / 1_000_000.0),
            "ms" => Duration::from_secs_f64(num / 1_000.0),
            "s" => Duration::from_secs_f64(num),
            "m" => Duration::from_secs_f64(num * 60.0),
            "h" => Duration::from_secs_f64(num * 3600.0),
            _ => return None,
        };
        total += unit_dur;
        saw_any = true;
        start = unit_end;
    }

    if !saw_any || start != s.len() {
        return None;
    }

    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_literals() {
        assert_eq!(parse_duration_literal("11ms"), Some(Duration::from_millis(11)));
        assert_eq!(parse_duration_literal("3s"), Some(Duration::from_secs(3)));
        assert_eq!(parse_duration_literal("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration_literal("-5s"), None);
        assert_eq!(parse_duration_literal("bogus"), None);
    }

    #[test]
    fn string_arg_fails_on_non_string() {
        let values = vec![Value::Number(3.0)];
        let mut args = Args::new("test", &values);
        assert!(args.string().is_none());
        assert!(args.finish().is_err());
    }

    #[test]
    fn integer_arg_rejects_fraction() {
        let values = vec![Value::Number(3.5)];
        let mut args = Args::new("test", &values);
        assert!(args.integer().is_none());
        assert!(args.finish().is_err());
    }

    #[test]
    fn integer_arg_accepts_fraction_free_float() {
        let values = vec![Value::Number(3.0)];
        let mut args = Args::new("test", &values);
        assert_eq!(args.integer(), Some(3));
        assert!(args.finish().is_ok());
    }

    #[test]
    fn duration_arg_interprets_bare_number_by_unit() {
        let values = vec![Value::Number(250.0)];
        let mut args = Args::new("test", &values);
        assert_eq!(args.duration(NumericDurationUnit::Millis), Some(Duration::from_millis(250)));
    }

    #[test]
    fn duration_arg_rejects_negative() {
        let values = vec![Value::Number(-1.0)];
        let mut args = Args::new("test", &values);
        assert!(args.duration(NumericDurationUnit::Seconds).is_none());
        assert!(args.finish().is_err());
    }

    #[test]
    fn variadic_trailing_strings_all_or_nothing() {
        let values = vec![Value::String("a".into()), Value::String("b".into())];
        let mut args = Args::new("test", &values);
        assert_eq!(args.trailing_strings(), vec!["a".to_string(), "b".to_string()]);
        assert!(args.finish().is_ok());
    }

    #[test]
    fn missing_required_argument_reports_expects_n() {
        let values: Vec<Value> = vec![];
        let mut args = Args::new("test", &values);
        assert!(args.string().is_none());
        let err = args.finish().unwrap_err();
        assert!(err.to_string().contains("missing required string argument"));
    }

    #[test]
    fn all_offending_positions_are_accumulated() {
        let values = vec![Value::Number(1.5), Value::Number(2.0)];
        let mut args = Args::new("test", &values);
        let _ = args.string(); // position 0: not a string
        let _ = args.string(); // position 1: not a string
        let err = args.finish().unwrap_err();
        assert_eq!(err.problems.len(), 2);
    }
}
