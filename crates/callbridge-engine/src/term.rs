//! Terms of the directive language and their parser.
//!
//! A directive is a comma-separated conjunction of goals. Terms are integers,
//! floats, double-quoted strings, atoms (`foo`, `demo.Counter`), variables
//! (`X`, `_Tmp`), handles (`@3`), lists (`[a, B]`) and compounds
//! (`name(arg, ...)`). `A = B` parses as the compound `=(A, B)`.

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Var(String),
    Atom(String),
    Int(i64),
    Float(f64),
    Str(String),
    Handle(u32),
    List(Vec<Term>),
    Compound { name: String, args: Vec<Term> },
}

impl Term {
    /// Name and arity when used as a goal.
    pub fn indicator(&self) -> String {
        match self {
            Term::Atom(name) => format!("{}/0", name),
            Term::Compound { name, args } => format!("{}/{}", name, args.len()),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Var(name) | Term::Atom(name) => write!(f, "{}", name),
            Term::Int(i) => write!(f, "{}", i),
            Term::Float(x) => write!(f, "{:?}", x),
            Term::Str(s) => write!(f, "{:?}", s),
            Term::Handle(h) => write!(f, "@{}", h),
            Term::List(items) => {
                write!(f, "[")?;
                write_args(f, items)?;
                write!(f, "]")
            }
            Term::Compound { name, args } if name == "=" && args.len() == 2 => {
                write!(f, "{} = {}", args[0], args[1])
            }
            Term::Compound { name, args } => {
                write!(f, "{}(", name)?;
                write_args(f, args)?;
                write!(f, ")")
            }
        }
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, items: &[Term]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Var(String),
    Atom(String),
    Int(i64),
    Float(f64),
    Str(String),
    Handle(u32),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Equals,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Var(s) | Token::Atom(s) => write!(f, "'{}'", s),
            Token::Int(i) => write!(f, "'{}'", i),
            Token::Float(x) => write!(f, "'{}'", x),
            Token::Str(s) => write!(f, "{:?}", s),
            Token::Handle(h) => write!(f, "'@{}'", h),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::LBracket => write!(f, "'['"),
            Token::RBracket => write!(f, "']'"),
            Token::Comma => write!(f, "','"),
            Token::Equals => write!(f, "'='"),
        }
    }
}

fn syntax(detail: impl Into<String>) -> EngineError {
    EngineError::Syntax(detail.into())
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | '[' | ']' | ',' | '=' => {
                chars.next();
                tokens.push(match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    ',' => Token::Comma,
                    _ => Token::Equals,
                });
            }
            '"' => {
                chars.next();
                tokens.push(Token::Str(string_literal(&mut chars)?));
            }
            '@' => {
                chars.next();
                let digits = take_while(&mut chars, |c| c.is_ascii_digit());
                let handle = digits
                    .parse()
                    .map_err(|_| syntax(format!("bad handle '@{}'", digits)))?;
                tokens.push(Token::Handle(handle));
            }
            '-' | '0'..='9' => tokens.push(number(&mut chars)?),
            c if c.is_alphabetic() || c == '_' => {
                let word = identifier(&mut chars);
                if c.is_uppercase() || c == '_' {
                    tokens.push(Token::Var(word));
                } else {
                    tokens.push(Token::Atom(word));
                }
            }
            other => return Err(syntax(format!("unexpected character '{}'", other))),
        }
    }
    Ok(tokens)
}

fn take_while(chars: &mut Peekable<Chars<'_>>, pred: impl Fn(char) -> bool) -> String {
    let mut out = String::new();
    while let Some(&c) = chars.peek() {
        if !pred(c) {
            break;
        }
        out.push(c);
        chars.next();
    }
    out
}

/// Identifier characters; a `.` is kept only when a letter follows it.
fn identifier(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut out = String::new();
    loop {
        out.push_str(&take_while(chars, |c| c.is_alphanumeric() || c == '_'));
        let mut lookahead = chars.clone();
        if lookahead.next() == Some('.') && lookahead.next().is_some_and(char::is_alphabetic) {
            chars.next();
            out.push('.');
        } else {
            return out;
        }
    }
}

fn number(chars: &mut Peekable<Chars<'_>>) -> Result<Token> {
    let mut text = String::new();
    if chars.peek() == Some(&'-') {
        chars.next();
        text.push('-');
    }
    let int_part = take_while(chars, |c| c.is_ascii_digit());
    if int_part.is_empty() {
        return Err(syntax("'-' must be followed by a number"));
    }
    text.push_str(&int_part);

    let mut lookahead = chars.clone();
    if lookahead.next() == Some('.') && lookahead.next().is_some_and(|c| c.is_ascii_digit()) {
        chars.next();
        text.push('.');
        text.push_str(&take_while(chars, |c| c.is_ascii_digit()));
        return text
            .parse()
            .map(Token::Float)
            .map_err(|_| syntax(format!("bad float '{}'", text)));
    }
    text.parse()
        .map(Token::Int)
        .map_err(|_| syntax(format!("integer out of range '{}'", text)))
}

fn string_literal(chars: &mut Peekable<Chars<'_>>) -> Result<String> {
    let mut out = String::new();
    loop {
        match chars.next() {
            None => return Err(syntax("unterminated string")),
            Some('"') => return Ok(out),
            Some('\\') => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(c @ ('"' | '\\')) => out.push(c),
                Some(c) => return Err(syntax(format!("unknown escape '\\{}'", c))),
                None => return Err(syntax("unterminated string")),
            },
            Some(c) => out.push(c),
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(text: &str) -> Result<Self> {
        Ok(Self {
            tokens: tokenize(text)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, wanted: Token) -> Result<()> {
        match self.advance() {
            Some(token) if token == wanted => Ok(()),
            Some(token) => Err(syntax(format!("expected {}, found {}", wanted, token))),
            None => Err(syntax(format!("expected {}, found end of input", wanted))),
        }
    }

    fn finish(&self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(syntax(format!("unexpected {}", token))),
        }
    }

    /// goal (',' goal)*
    fn conjunction(&mut self) -> Result<Vec<Term>> {
        let mut goals = vec![self.goal()?];
        while self.peek() == Some(&Token::Comma) {
            self.advance();
            goals.push(self.goal()?);
        }
        Ok(goals)
    }

    /// term ['=' term]
    fn goal(&mut self) -> Result<Term> {
        let left = self.term()?;
        if self.peek() == Some(&Token::Equals) {
            self.advance();
            let right = self.term()?;
            return Ok(Term::Compound {
                name: "=".to_string(),
                args: vec![left, right],
            });
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Term> {
        match self.advance() {
            Some(Token::Var(name)) => Ok(Term::Var(name)),
            Some(Token::Int(i)) => Ok(Term::Int(i)),
            Some(Token::Float(x)) => Ok(Term::Float(x)),
            Some(Token::Str(s)) => Ok(Term::Str(s)),
            Some(Token::Handle(h)) => Ok(Term::Handle(h)),
            Some(Token::LBracket) => {
                let items = self.sequence(Token::RBracket)?;
                Ok(Term::List(items))
            }
            Some(Token::Atom(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.advance();
                    let args = self.sequence(Token::RParen)?;
                    if args.is_empty() {
                        return Err(syntax(format!("empty argument list for {}", name)));
                    }
                    Ok(Term::Compound { name, args })
                } else {
                    Ok(Term::Atom(name))
                }
            }
            Some(token) => Err(syntax(format!("unexpected {}", token))),
            None => Err(syntax("unexpected end of input")),
        }
    }

    /// Comma-separated terms up to `close`, which is consumed.
    fn sequence(&mut self, close: Token) -> Result<Vec<Term>> {
        let mut items = Vec::new();
        if self.peek() == Some(&close) {
            self.advance();
            return Ok(items);
        }
        loop {
            items.push(self.term()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(token) if token == close => return Ok(items),
                Some(token) => return Err(syntax(format!("expected ',' or {}, found {}", close, token))),
                None => return Err(syntax(format!("missing {}", close))),
            }
        }
    }
}

/// Parse a directive into its conjuncts.
pub fn parse_directive(text: &str) -> Result<Vec<Term>> {
    let mut parser = Parser::new(text)?;
    if parser.peek().is_none() {
        return Err(syntax("empty directive"));
    }
    let goals = parser.conjunction()?;
    parser.finish()?;
    Ok(goals)
}

/// Parse a single term, such as an output spec.
pub fn parse_term(text: &str) -> Result<Term> {
    let mut parser = Parser::new(text)?;
    let term = parser.term()?;
    parser.finish()?;
    Ok(term)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Term {
        Term::Var(name.to_string())
    }

    #[test]
    fn test_parse_conjunction_of_unifications() {
        let goals = parse_directive("X = 1, Y = 2").unwrap();
        assert_eq!(goals.len(), 2);
        assert_eq!(
            goals[0],
            Term::Compound {
                name: "=".into(),
                args: vec![var("X"), Term::Int(1)]
            }
        );
        assert_eq!(goals[1].to_string(), "Y = 2");
    }

    #[test]
    fn test_parse_call_with_nested_terms() {
        let goals =
            parse_directive(r#"call(type(demo.Counter), "Counter", [-3, 1.5, @2], R)"#).unwrap();
        let Term::Compound { name, args } = &goals[0] else {
            panic!("expected compound, got {:?}", goals[0]);
        };
        assert_eq!(name, "call");
        assert_eq!(args[0].to_string(), "type(demo.Counter)");
        assert_eq!(args[1], Term::Str("Counter".into()));
        assert_eq!(
            args[2],
            Term::List(vec![Term::Int(-3), Term::Float(1.5), Term::Handle(2)])
        );
        assert_eq!(args[3], var("R"));
    }

    #[test]
    fn test_atoms_and_variables() {
        assert_eq!(parse_term("foo").unwrap(), Term::Atom("foo".into()));
        assert_eq!(parse_term("_Tmp").unwrap(), var("_Tmp"));
        assert_eq!(parse_term("_").unwrap(), var("_"));
        assert_eq!(parse_term("[]").unwrap(), Term::List(vec![]));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            parse_term(r#""a\"b\n""#).unwrap(),
            Term::Str("a\"b\n".into())
        );
        assert!(matches!(parse_term(r#""open"#), Err(EngineError::Syntax(_))));
    }

    #[test]
    fn test_syntax_errors() {
        for bad in ["X = ", "foo(", "foo()", "[1, 2", "X == 1", "1 2", "#", "-x", ""] {
            assert!(
                matches!(parse_directive(bad), Err(EngineError::Syntax(_))),
                "{:?} should not parse",
                bad
            );
        }
    }

    #[test]
    fn test_indicator() {
        assert_eq!(parse_term("sleep(10)").unwrap().indicator(), "sleep/1");
        assert_eq!(parse_term("loop").unwrap().indicator(), "loop/0");
    }
}
