//! Lexer and parser for rule predicates and scripts.
//!
//! Predicates are single expressions. Scripts are statement lists separated
//! by newlines or `;`.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
  Ident(String),
  Str(String),
  Int(i64),
  LParen,
  RParen,
  LBracket,
  RBracket,
  LBrace,
  RBrace,
  Dot,
  Comma,
  Semi,
  Newline,
  Assign,
  EqEq,
  NotEq,
  Lt,
  Le,
  Gt,
  Ge,
  AndAnd,
  OrOr,
  Bang,
  Plus,
  Minus,
  Eof,
}

impl fmt::Display for Token {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Token::Ident(s) => write!(f, "`{}`", s),
      Token::Str(s) => write!(f, "{:?}", s),
      Token::Int(i) => write!(f, "{}", i),
      Token::Newline => f.write_str("end of line"),
      Token::Eof => f.write_str("end of input"),
      other => {
        let s = match other {
          Token::LParen => "(",
          Token::RParen => ")",
          Token::LBracket => "[",
          Token::RBracket => "]",
          Token::LBrace => "{",
          Token::RBrace => "}",
          Token::Dot => ".",
          Token::Comma => ",",
          Token::Semi => ";",
          Token::Assign => "=",
          Token::EqEq => "==",
          Token::NotEq => "!=",
          Token::Lt => "<",
          Token::Le => "<=",
          Token::Gt => ">",
          Token::Ge => ">=",
          Token::AndAnd => "&&",
          Token::OrOr => "||",
          Token::Bang => "!",
          Token::Plus => "+",
          Token::Minus => "-",
          _ => "?",
        };
        write!(f, "`{}`", s)
      }
    }
  }
}

#[derive(Debug, Clone)]
struct Lexed {
  token: Token,
  line: usize,
  col: usize,
}

fn lex(src: &str) -> Result<Vec<Lexed>, String> {
  let chars: Vec<char> = src.chars().collect();
  let mut out = Vec::new();
  let (mut i, mut line, mut col) = (0usize, 1usize, 1usize);
  while i < chars.len() {
    let c = chars[i];
    let (start_line, start_col) = (line, col);
    let mut push = |token: Token| {
      out.push(Lexed {
        token,
        line: start_line,
        col: start_col,
      })
    };
    match c {
      '\n' => {
        push(Token::Newline);
        i += 1;
        line += 1;
        col = 1;
        continue;
      }
      ' ' | '\t' | '\r' => {
        i += 1;
        col += 1;
        continue;
      }
      '#' => {
        while i < chars.len() && chars[i] != '\n' {
          i += 1;
        }
        continue;
      }
      '/' if chars.get(i + 1) == Some(&'/') => {
        while i < chars.len() && chars[i] != '\n' {
          i += 1;
        }
        continue;
      }
      '"' | '\'' => {
        let quote = c;
        let mut s = String::new();
        i += 1;
        col += 1;
        loop {
          let Some(&ch) = chars.get(i) else {
            return Err(format!("{}:{}: unterminated string", start_line, start_col));
          };
          i += 1;
          col += 1;
          if ch == quote {
            break;
          }
          if ch == '\n' {
            return Err(format!("{}:{}: unterminated string", start_line, start_col));
          }
          if ch == '\\' {
            let Some(&esc) = chars.get(i) else {
              return Err(format!("{}:{}: unterminated string", start_line, start_col));
            };
            i += 1;
            col += 1;
            s.push(match esc {
              'n' => '\n',
              't' => '\t',
              'r' => '\r',
              '\\' => '\\',
              '"' => '"',
              '\'' => '\'',
              other => {
                return Err(format!(
                  "{}:{}: unknown escape `\\{}`",
                  line,
                  col - 1,
                  other
                ))
              }
            });
          } else {
            s.push(ch);
          }
        }
        push(Token::Str(s));
        continue;
      }
      c if c.is_ascii_digit() => {
        let begin = i;
        while i < chars.len() && chars[i].is_ascii_digit() {
          i += 1;
        }
        let text: String = chars[begin..i].iter().collect();
        col += i - begin;
        let value = text
          .parse::<i64>()
          .map_err(|_| format!("{}:{}: integer literal out of range", start_line, start_col))?;
        push(Token::Int(value));
        continue;
      }
      c if c.is_alphabetic() || c == '_' => {
        let begin = i;
        while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
          i += 1;
        }
        col += i - begin;
        push(Token::Ident(chars[begin..i].iter().collect()));
        continue;
      }
      _ => {}
    }
    let next = chars.get(i + 1).copied();
    let (token, width) = match (c, next) {
      ('=', Some('=')) => (Token::EqEq, 2),
      ('!', Some('=')) => (Token::NotEq, 2),
      ('<', Some('=')) => (Token::Le, 2),
      ('>', Some('=')) => (Token::Ge, 2),
      ('&', Some('&')) => (Token::AndAnd, 2),
      ('|', Some('|')) => (Token::OrOr, 2),
      ('=', _) => (Token::Assign, 1),
      ('!', _) => (Token::Bang, 1),
      ('<', _) => (Token::Lt, 1),
      ('>', _) => (Token::Gt, 1),
      ('(', _) => (Token::LParen, 1),
      (')', _) => (Token::RParen, 1),
      ('[', _) => (Token::LBracket, 1),
      (']', _) => (Token::RBracket, 1),
      ('{', _) => (Token::LBrace, 1),
      ('}', _) => (Token::RBrace, 1),
      ('.', _) => (Token::Dot, 1),
      (',', _) => (Token::Comma, 1),
      (';', _) => (Token::Semi, 1),
      ('+', _) => (Token::Plus, 1),
      ('-', _) => (Token::Minus, 1),
      _ => return Err(format!("{}:{}: unexpected character `{}`", line, col, c)),
    };
    push(token);
    i += width;
    col += width;
  }
  out.push(Lexed {
    token: Token::Eof,
    line,
    col,
  });
  Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
  Not,
  Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
  Or,
  And,
  Eq,
  Ne,
  Lt,
  Le,
  Gt,
  Ge,
  In,
  Add,
  Sub,
}

impl fmt::Display for BinaryOp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      BinaryOp::Or => "||",
      BinaryOp::And => "&&",
      BinaryOp::Eq => "==",
      BinaryOp::Ne => "!=",
      BinaryOp::Lt => "<",
      BinaryOp::Le => "<=",
      BinaryOp::Gt => ">",
      BinaryOp::Ge => ">=",
      BinaryOp::In => "in",
      BinaryOp::Add => "+",
      BinaryOp::Sub => "-",
    })
  }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
  Str(String),
  Int(i64),
  Bool(bool),
  Ident(String),
  Member(Box<Expr>, String),
  Index(Box<Expr>, Box<Expr>),
  Call(Box<Expr>, Vec<Expr>),
  Unary(UnaryOp, Box<Expr>),
  Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stmt {
  Let(String, Expr),
  Expr(Expr),
  If(Expr, Vec<Stmt>, Vec<Stmt>),
}

/// Parse a predicate: one expression, line breaks ignored.
pub(crate) fn parse_expression(src: &str) -> Result<Expr, String> {
  let tokens = lex(src)?
    .into_iter()
    .filter(|t| t.token != Token::Newline)
    .collect();
  let mut parser = Parser { tokens, pos: 0 };
  let expr = parser.expr()?;
  parser.expect(Token::Eof)?;
  Ok(expr)
}

/// Parse a script into statements.
pub(crate) fn parse_script(src: &str) -> Result<Vec<Stmt>, String> {
  let mut parser = Parser {
    tokens: lex(src)?,
    pos: 0,
  };
  let stmts = parser.block_body(false)?;
  parser.expect(Token::Eof)?;
  Ok(stmts)
}

struct Parser {
  tokens: Vec<Lexed>,
  pos: usize,
}

impl Parser {
  fn peek(&self) -> &Token {
    &self.tokens[self.pos.min(self.tokens.len() - 1)].token
  }

  fn advance(&mut self) -> Token {
    let token = self.peek().clone();
    if self.pos < self.tokens.len() - 1 {
      self.pos += 1;
    }
    token
  }

  fn error(&self, msg: impl fmt::Display) -> String {
    let at = &self.tokens[self.pos.min(self.tokens.len() - 1)];
    format!("{}:{}: {}", at.line, at.col, msg)
  }

  fn expect(&mut self, want: Token) -> Result<(), String> {
    if *self.peek() == want {
      self.advance();
      Ok(())
    } else {
      Err(self.error(format!("expected {}, found {}", want, self.peek())))
    }
  }

  fn is_keyword(&self, kw: &str) -> bool {
    matches!(self.peek(), Token::Ident(s) if s.eq_ignore_ascii_case(kw))
  }

  fn skip_newlines(&mut self) {
    while matches!(self.peek(), Token::Newline | Token::Semi) {
      self.advance();
    }
  }

  fn block_body(&mut self, braced: bool) -> Result<Vec<Stmt>, String> {
    let mut stmts = Vec::new();
    loop {
      self.skip_newlines();
      match self.peek() {
        Token::Eof if !braced => break,
        Token::RBrace if braced => break,
        Token::Eof => return Err(self.error("expected `}`, found end of input")),
        _ => {}
      }
      stmts.push(self.statement()?);
      match self.peek() {
        Token::Newline | Token::Semi => {}
        Token::RBrace if braced => {}
        Token::Eof => {}
        other => return Err(self.error(format!("expected end of statement, found {}", other))),
      }
    }
    Ok(stmts)
  }

  fn block(&mut self) -> Result<Vec<Stmt>, String> {
    self.expect(Token::LBrace)?;
    let body = self.block_body(true)?;
    self.expect(Token::RBrace)?;
    Ok(body)
  }

  fn statement(&mut self) -> Result<Stmt, String> {
    if self.is_keyword("let") {
      self.advance();
      let name = match self.advance() {
        Token::Ident(name) => name,
        other => return Err(self.error(format!("expected variable name, found {}", other))),
      };
      self.expect(Token::Assign)?;
      let value = self.expr()?;
      return Ok(Stmt::Let(name, value));
    }
    if self.is_keyword("if") {
      self.advance();
      let cond = self.expr()?;
      let then = self.block()?;
      let mut otherwise = Vec::new();
      // `else` may sit on the line after `}`
      let save = self.pos;
      while matches!(self.peek(), Token::Newline) {
        self.advance();
      }
      if self.is_keyword("else") {
        self.advance();
        if self.is_keyword("if") {
          otherwise.push(self.statement()?);
        } else {
          otherwise = self.block()?;
        }
      } else {
        self.pos = save;
      }
      return Ok(Stmt::If(cond, then, otherwise));
    }
    Ok(Stmt::Expr(self.expr()?))
  }

  fn expr(&mut self) -> Result<Expr, String> {
    self.or()
  }

  fn after_operator(&mut self) {
    while matches!(self.peek(), Token::Newline) {
      self.advance();
    }
  }

  fn or(&mut self) -> Result<Expr, String> {
    let mut lhs = self.and()?;
    while matches!(self.peek(), Token::OrOr) || self.is_keyword("or") {
      self.advance();
      self.after_operator();
      let rhs = self.and()?;
      lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
  }

  fn and(&mut self) -> Result<Expr, String> {
    let mut lhs = self.equality()?;
    while matches!(self.peek(), Token::AndAnd) || self.is_keyword("and") {
      self.advance();
      self.after_operator();
      let rhs = self.equality()?;
      lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
  }

  fn equality(&mut self) -> Result<Expr, String> {
    let mut lhs = self.relational()?;
    loop {
      let op = match self.peek() {
        Token::EqEq => BinaryOp::Eq,
        Token::NotEq => BinaryOp::Ne,
        _ => break,
      };
      self.advance();
      self.after_operator();
      let rhs = self.relational()?;
      lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
  }

  fn relational(&mut self) -> Result<Expr, String> {
    let mut lhs = self.additive()?;
    loop {
      let op = match self.peek() {
        Token::Lt => BinaryOp::Lt,
        Token::Le => BinaryOp::Le,
        Token::Gt => BinaryOp::Gt,
        Token::Ge => BinaryOp::Ge,
        _ if self.is_keyword("in") => BinaryOp::In,
        _ => break,
      };
      self.advance();
      self.after_operator();
      let rhs = self.additive()?;
      lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
  }

  fn additive(&mut self) -> Result<Expr, String> {
    let mut lhs = self.unary()?;
    loop {
      let op = match self.peek() {
        Token::Plus => BinaryOp::Add,
        Token::Minus => BinaryOp::Sub,
        _ => break,
      };
      self.advance();
      self.after_operator();
      let rhs = self.unary()?;
      lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
  }

  fn unary(&mut self) -> Result<Expr, String> {
    if matches!(self.peek(), Token::Bang) || self.is_keyword("not") {
      self.advance();
      let inner = self.unary()?;
      return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
    }
    if matches!(self.peek(), Token::Minus) {
      self.advance();
      let inner = self.unary()?;
      return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
    }
    self.postfix()
  }

  fn postfix(&mut self) -> Result<Expr, String> {
    let mut expr = self.primary()?;
    loop {
      match self.peek() {
        Token::Dot => {
          self.advance();
          match self.advance() {
            Token::Ident(name) => expr = Expr::Member(Box::new(expr), name),
            other => return Err(self.error(format!("expected field name, found {}", other))),
          }
        }
        Token::LBracket => {
          self.advance();
          let index = self.expr()?;
          self.expect(Token::RBracket)?;
          expr = Expr::Index(Box::new(expr), Box::new(index));
        }
        Token::LParen => {
          self.advance();
          let mut args = Vec::new();
          if !matches!(self.peek(), Token::RParen) {
            loop {
              self.after_operator();
              args.push(self.expr()?);
              self.after_operator();
              if matches!(self.peek(), Token::Comma) {
                self.advance();
                continue;
              }
              break;
            }
          }
          self.expect(Token::RParen)?;
          expr = Expr::Call(Box::new(expr), args);
        }
        _ => break,
      }
    }
    Ok(expr)
  }

  fn primary(&mut self) -> Result<Expr, String> {
    match self.advance() {
      Token::Str(s) => Ok(Expr::Str(s)),
      Token::Int(i) => Ok(Expr::Int(i)),
      Token::Ident(name) => match name.as_str() {
        "true" => Ok(Expr::Bool(true)),
        "false" => Ok(Expr::Bool(false)),
        _ => Ok(Expr::Ident(name)),
      },
      Token::LParen => {
        self.after_operator();
        let inner = self.expr()?;
        self.after_operator();
        self.expect(Token::RParen)?;
        Ok(inner)
      }
      other => {
        self.pos = self.pos.saturating_sub(1);
        Err(self.error(format!("unexpected {}", other)))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ident(s: &str) -> Box<Expr> {
    Box::new(Expr::Ident(s.to_string()))
  }

  #[test]
  fn keywords_and_symbols_share_precedence() {
    let a = parse_expression(r#"req.method == "POST" AND req.body.contains("secret")"#).unwrap();
    let b = parse_expression(r#"req.method == "POST" && req.body.contains("secret")"#).unwrap();
    assert_eq!(a, b);
    match a {
      Expr::Binary(BinaryOp::And, lhs, _) => {
        assert!(matches!(*lhs, Expr::Binary(BinaryOp::Eq, _, _)))
      }
      other => panic!("unexpected tree {:?}", other),
    }
  }

  #[test]
  fn predicate_may_span_lines() {
    let e = parse_expression("req.method == \"GET\" ||\n  req.method == \"HEAD\"").unwrap();
    assert!(matches!(e, Expr::Binary(BinaryOp::Or, _, _)));
  }

  #[test]
  fn index_and_in() {
    let e = parse_expression(r#""X-Debug" in req.headers"#).unwrap();
    assert_eq!(
      e,
      Expr::Binary(
        BinaryOp::In,
        Box::new(Expr::Str("X-Debug".into())),
        Box::new(Expr::Member(ident("req"), "headers".into()))
      )
    );
    assert!(parse_expression(r#"req.headers["Host"]"#).is_ok());
  }

  #[test]
  fn script_statements() {
    let src = r#"
      let token = "abc"
      req.set_header("Authorization", "Bearer " + token); req.del_header("Cookie")
      if req.path.startsWith("/admin") {
        reject("admin")
      }
      else {
        req.set_body("ok")
      }
    "#;
    let stmts = parse_script(src).unwrap();
    assert_eq!(stmts.len(), 4);
    assert!(matches!(&stmts[0], Stmt::Let(name, _) if name == "token"));
    assert!(matches!(&stmts[3], Stmt::If(_, then, other) if then.len() == 1 && other.len() == 1));
  }

  #[test]
  fn syntax_errors_carry_position() {
    let err = parse_expression("req.method ==").unwrap_err();
    assert!(err.starts_with("1:"), "{}", err);
    assert!(parse_expression("\"open").is_err());
    assert!(parse_script("req.set_body(\"a\") req.set_body(\"b\")").is_err());
  }
}
