//! Recursive-descent parser for the literal reply grammar.

use thiserror::Error;

use super::value::Value;

/// Malformed reply text.
///
/// Always fatal to the call that produced it: a parse failure signals either
/// transport corruption or a grammar gap, never an empty result, so the
/// input is never silently coerced to a default value.
#[derive(Debug, Error)]
#[error("parse error at offset {offset}: {message} (near {context:?})")]
pub struct ParseError {
    /// Byte offset of the offending input.
    pub offset: usize,
    pub message: String,
    /// Short window of the input around the offset.
    pub context: String,
}

/// Parse one reply into a [`Value`].
///
/// An empty (or all-whitespace) reply parses to [`Value::Empty`]. Anything
/// left over after a complete value is an error.
pub fn parse(text: &str) -> Result<Value, ParseError> {
    let mut parser = Parser {
        input: text,
        bytes: text.as_bytes(),
        pos: 0,
    };
    parser.skip_ws();
    if parser.at_end() {
        return Ok(Value::Empty);
    }
    let value = parser.parse_value()?;
    parser.skip_ws();
    if !parser.at_end() {
        return Err(parser.error("trailing input after value"));
    }
    Ok(value)
}

fn is_ident_start(b: u8) -> bool {
    b == b'_' || b.is_ascii_alphabetic()
}

fn is_ident_char(b: u8) -> bool {
    b == b'_' || b.is_ascii_alphanumeric()
}

struct Parser<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.bump();
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), ParseError> {
        if self.peek() == Some(byte) {
            self.bump();
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", byte as char)))
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        let mut start = self.pos.saturating_sub(12);
        while start > 0 && !self.input.is_char_boundary(start) {
            start -= 1;
        }
        let mut end = (self.pos + 12).min(self.input.len());
        while end < self.input.len() && !self.input.is_char_boundary(end) {
            end += 1;
        }
        ParseError {
            offset: self.pos,
            message: message.into(),
            context: self.input[start..end].to_string(),
        }
    }

    /// Consume `keyword` if it is present as a whole identifier (not a
    /// prefix of a longer one). Case-insensitive.
    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let rest = &self.bytes[self.pos..];
        if rest.len() >= keyword.len()
            && rest[..keyword.len()].eq_ignore_ascii_case(keyword.as_bytes())
            && !matches!(rest.get(keyword.len()), Some(&b) if is_ident_char(b))
        {
            self.pos += keyword.len();
            return true;
        }
        false
    }

    fn parse_value(&mut self) -> Result<Value, ParseError> {
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some(b'"') => self.parse_string(),
            Some(b'{') => Ok(Value::Sequence(self.parse_delimited(b'{', b'}')?)),
            Some(b'(') => Ok(Value::Tuple(self.parse_delimited(b'(', b')')?)),
            Some(b'-') => self.parse_number(),
            Some(b) if b.is_ascii_digit() => self.parse_number(),
            Some(b'\'') => self.parse_ident_value(),
            Some(b'.') => {
                // Enumeration literals arrive fully qualified with a
                // leading dot, e.g. `.Pkg.Kind.variant`.
                self.bump();
                let ident = self.parse_fq_ident()?;
                Ok(Value::Str(format!(".{ident}")))
            }
            Some(b) if is_ident_start(b) => self.parse_ident_value(),
            Some(_) => Err(self.error("expected a value")),
        }
    }

    fn parse_delimited(&mut self, open: u8, close: u8) -> Result<Vec<Value>, ParseError> {
        self.expect(open)?;
        self.skip_ws();
        let mut items = Vec::new();
        if self.peek() == Some(close) {
            self.bump();
            return Ok(items);
        }
        loop {
            items.push(self.parse_value()?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.bump(),
                Some(b) if b == close => {
                    self.bump();
                    return Ok(items);
                }
                _ => return Err(self.error(format!("expected ',' or '{}'", close as char))),
            }
        }
    }

    fn parse_string(&mut self) -> Result<Value, ParseError> {
        self.expect(b'"')?;
        let mut out: Vec<u8> = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some(b'"') => {
                    self.bump();
                    break;
                }
                Some(b'\\') => {
                    self.bump();
                    match self.peek() {
                        None => return Err(self.error("unterminated escape")),
                        Some(b'"') => out.push(b'"'),
                        Some(b'\\') => out.push(b'\\'),
                        Some(b'n') => out.push(b'\n'),
                        Some(b't') => out.push(b'\t'),
                        Some(b'r') => out.push(b'\r'),
                        // Unknown escape: keep both bytes verbatim rather
                        // than guess at the compiler's intent.
                        Some(other) => {
                            out.push(b'\\');
                            out.push(other);
                        }
                    }
                    self.bump();
                }
                Some(byte) => {
                    out.push(byte);
                    self.bump();
                }
            }
        }
        match String::from_utf8(out) {
            Ok(s) => Ok(Value::Str(s)),
            Err(_) => Err(self.error("string is not valid UTF-8")),
        }
    }

    fn parse_number(&mut self) -> Result<Value, ParseError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.bump();
            if self.eat_keyword("inf") {
                return Ok(Value::Real(f64::NEG_INFINITY));
            }
        }
        if !matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            return Err(self.error("expected digits"));
        }
        let mut is_real = false;
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.bump();
        }
        if self.peek() == Some(b'.') {
            is_real = true;
            self.bump();
            if !matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                return Err(self.error("expected digits after decimal point"));
            }
            while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            is_real = true;
            self.bump();
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.bump();
            }
            if !matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                return Err(self.error("malformed exponent"));
            }
            while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                self.bump();
            }
        }
        let text = &self.input[start..self.pos];
        if is_real {
            match text.parse::<f64>() {
                Ok(real) => Ok(Value::Real(real)),
                Err(_) => Err(self.error(format!("invalid real literal {text:?}"))),
            }
        } else {
            // Integers wider than i64 (the compiler's word size is not
            // ours) fall back to Real rather than failing.
            match text.parse::<i64>() {
                Ok(int) => Ok(Value::Integer(int)),
                Err(_) => match text.parse::<f64>() {
                    Ok(real) => Ok(Value::Real(real)),
                    Err(_) => Err(self.error(format!("invalid integer literal {text:?}"))),
                },
            }
        }
    }

    /// One identifier segment: `[A-Za-z_][A-Za-z0-9_]*` or a
    /// single-quoted segment, which is kept verbatim including its quotes.
    fn parse_ident_segment(&mut self) -> Result<String, ParseError> {
        if self.peek() == Some(b'\'') {
            let start = self.pos;
            self.bump();
            loop {
                match self.peek() {
                    None => return Err(self.error("unterminated quoted identifier")),
                    Some(b'\\') => {
                        self.bump();
                        self.bump();
                    }
                    Some(b'\'') => {
                        self.bump();
                        return Ok(self.input[start..self.pos].to_string());
                    }
                    Some(_) => self.bump(),
                }
            }
        }
        if !matches!(self.peek(), Some(b) if is_ident_start(b)) {
            return Err(self.error("expected an identifier"));
        }
        let start = self.pos;
        while matches!(self.peek(), Some(b) if is_ident_char(b)) {
            self.bump();
        }
        Ok(self.input[start..self.pos].to_string())
    }

    /// Dotted identifier path, e.g. `Modelica.Blocks.Sources`.
    fn parse_fq_ident(&mut self) -> Result<String, ParseError> {
        let mut ident = self.parse_ident_segment()?;
        while self.peek() == Some(b'.')
            && matches!(
                self.bytes.get(self.pos + 1),
                Some(&b) if is_ident_start(b) || b == b'\''
            )
        {
            self.bump();
            ident.push('.');
            ident.push_str(&self.parse_ident_segment()?);
        }
        Ok(ident)
    }

    fn parse_ident_value(&mut self) -> Result<Value, ParseError> {
        // The keyword-shaped values first; none of them can open a record.
        if self.eat_keyword("true") {
            return Ok(Value::Bool(true));
        }
        if self.eat_keyword("false") {
            return Ok(Value::Bool(false));
        }
        if self.eat_keyword("inf") {
            return Ok(Value::Real(f64::INFINITY));
        }
        if self.eat_keyword("nan") {
            return Ok(Value::Real(f64::NAN));
        }

        let ident = self.parse_fq_ident()?;

        if ident == "record" {
            return self.parse_record_longhand();
        }
        if ident == "NONE" && self.next_nonws_is(b'(') {
            self.skip_ws();
            self.expect(b'(')?;
            self.skip_ws();
            self.expect(b')')?;
            return Ok(Value::Empty);
        }
        if ident == "SOME" && self.next_nonws_is(b'(') {
            self.skip_ws();
            self.expect(b'(')?;
            let inner = self.parse_value()?;
            self.skip_ws();
            self.expect(b')')?;
            return Ok(inner);
        }
        if self.next_nonws_is(b'(') {
            return self.parse_record_fields(ident);
        }

        // Bare typename.
        Ok(Value::Str(ident))
    }

    fn next_nonws_is(&self, byte: u8) -> bool {
        let mut pos = self.pos;
        while matches!(self.bytes.get(pos), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            pos += 1;
        }
        self.bytes.get(pos) == Some(&byte)
    }

    /// `Name(field = value, ...)`.
    fn parse_record_fields(&mut self, name: String) -> Result<Value, ParseError> {
        self.skip_ws();
        self.expect(b'(')?;
        self.skip_ws();
        let mut fields = Vec::new();
        if self.peek() == Some(b')') {
            self.bump();
            return Ok(Value::Record { name, fields });
        }
        loop {
            let field = self.parse_ident_segment()?;
            self.skip_ws();
            self.expect(b'=')?;
            let value = self.parse_value()?;
            fields.push((field, value));
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.bump();
                    self.skip_ws();
                }
                Some(b')') => {
                    self.bump();
                    return Ok(Value::Record { name, fields });
                }
                _ => return Err(self.error("expected ',' or ')' in record")),
            }
        }
    }

    /// The longhand form the compiler uses in structured-log replies:
    /// `record Fq.Name field = value, ... end Fq.Name;`.
    fn parse_record_longhand(&mut self) -> Result<Value, ParseError> {
        self.skip_ws();
        let name = self.parse_fq_ident()?;
        let mut fields = Vec::new();
        self.skip_ws();
        while !self.eat_keyword("end") {
            let field = self.parse_ident_segment()?;
            self.skip_ws();
            self.expect(b'=')?;
            let value = self.parse_value()?;
            fields.push((field, value));
            self.skip_ws();
            if self.peek() == Some(b',') {
                self.bump();
                self.skip_ws();
            }
        }
        self.skip_ws();
        self.parse_fq_ident()?;
        self.skip_ws();
        self.expect(b';')?;
        Ok(Value::Record { name, fields })
    }
}
