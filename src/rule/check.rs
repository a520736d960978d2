//! Static typing of parsed rules.
//!
//! Field access, header lookups and function calls are resolved here into a
//! typed program, so evaluation never looks anything up by name.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use regex::bytes::Regex;

use super::expr::{BinaryOp, Expr, Stmt, UnaryOp};
use super::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Type {
  Bool,
  Int,
  Str,
}

impl fmt::Display for Type {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Type::Bool => "bool",
      Type::Int => "int",
      Type::Str => "string",
    })
  }
}

/// Strings are raw bytes so bodies pass through rules unaltered.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
  Bool(bool),
  Int(i64),
  Str(Bytes),
}

impl Value {
  pub(crate) fn type_of(&self) -> Type {
    match self {
      Value::Bool(_) => Type::Bool,
      Value::Int(_) => Type::Int,
      Value::Str(_) => Type::Str,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
  Req,
  Resp,
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Target::Req => "req",
      Target::Resp => "resp",
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Field {
  Method,
  Url,
  Host,
  Path,
  Query,
  Body,
  Status,
}

/// Built-in functions. Regex variants hold the compiled pattern when it was
/// a literal.
#[derive(Debug, Clone)]
pub(crate) enum Builtin {
  Contains,
  StartsWith,
  EndsWith,
  Matches(Option<Arc<Regex>>),
  Lower,
  Upper,
  Trim,
  Size,
  ToStr,
  ToInt,
  Replace,
  TrimPrefix,
  TrimSuffix,
  Base64Encode,
  Base64Decode,
  RegexReplace(Option<Arc<Regex>>),
  RegexFind(Option<Arc<Regex>>),
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
  Lit(Value),
  Local(usize),
  Field(Target, Field),
  Header(Target, Box<Node>),
  HasHeader(Target, Box<Node>),
  Not(Box<Node>),
  Neg(Box<Node>),
  And(Box<Node>, Box<Node>),
  Or(Box<Node>, Box<Node>),
  Compare(BinaryOp, Box<Node>, Box<Node>),
  Add(Box<Node>, Box<Node>),
  Sub(Box<Node>, Box<Node>),
  Call(Builtin, Vec<Node>),
}

#[derive(Debug, Clone)]
pub(crate) enum Op {
  Let(usize, Node),
  SetHeader(Target, Node, Node),
  AddHeader(Target, Node, Node),
  DelHeader(Target, Node),
  SetBody(Target, Node),
  SetStatus(Node),
  SetMethod(Node),
  SetUrl(Node),
  Reject(Node),
  If(Node, Vec<Op>, Vec<Op>),
}

/// Which message bodies a compiled program reads or replaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BodyAccess {
  /// touches `req.body`
  pub request: bool,
  /// touches `resp.body`
  pub response: bool,
}

impl BodyAccess {
  /// Union of both.
  pub fn merge(self, other: BodyAccess) -> BodyAccess {
    BodyAccess {
      request: self.request || other.request,
      response: self.response || other.response,
    }
  }
}

/// Namespaces a script may pull in through its `import` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Namespace {
  Strings,
  Base64,
  Regex,
}

impl Namespace {
  fn from_ident(s: &str) -> Option<Namespace> {
    match s {
      "strings" => Some(Namespace::Strings),
      "base64" => Some(Namespace::Base64),
      "regex" => Some(Namespace::Regex),
      _ => None,
    }
  }
}

/// Parse an `import` list such as `"strings", "encoding/base64"`.
pub(crate) fn parse_imports(src: &str) -> Result<HashSet<Namespace>, String> {
  let mut out = HashSet::new();
  for item in src.split(|c: char| c == ',' || c.is_whitespace()) {
    let item = item.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`');
    if item.is_empty() {
      continue;
    }
    let ns = match item {
      "strings" => Namespace::Strings,
      "base64" | "encoding/base64" => Namespace::Base64,
      "regex" | "regexp" => Namespace::Regex,
      other => return Err(format!("unknown import {:?}", other)),
    };
    out.insert(ns);
  }
  Ok(out)
}

pub(crate) struct Checker {
  direction: Direction,
  imports: HashSet<Namespace>,
  scopes: Vec<HashMap<String, (usize, Type)>>,
  locals: usize,
  access: BodyAccess,
}

impl Checker {
  pub(crate) fn new(direction: Direction, imports: HashSet<Namespace>) -> Self {
    Self {
      direction,
      imports,
      scopes: vec![HashMap::new()],
      locals: 0,
      access: BodyAccess::default(),
    }
  }

  pub(crate) fn access(&self) -> BodyAccess {
    self.access
  }

  pub(crate) fn locals(&self) -> usize {
    self.locals
  }

  /// Type a predicate; it must produce a bool.
  pub(crate) fn predicate(&mut self, expr: &Expr) -> Result<Node, String> {
    let (node, ty) = self.expr(expr)?;
    if ty != Type::Bool {
      return Err(format!("expected output type bool, but got {}", ty));
    }
    Ok(node)
  }

  pub(crate) fn script(&mut self, stmts: &[Stmt]) -> Result<Vec<Op>, String> {
    stmts.iter().map(|s| self.stmt(s)).collect()
  }

  fn lookup(&self, name: &str) -> Option<(usize, Type)> {
    self.scopes.iter().rev().find_map(|s| s.get(name).copied())
  }

  fn stmt(&mut self, stmt: &Stmt) -> Result<Op, String> {
    match stmt {
      Stmt::Let(name, value) => {
        if matches!(name.as_str(), "req" | "resp") {
          return Err(format!("cannot rebind `{}`", name));
        }
        let (node, ty) = self.expr(value)?;
        let slot = self.locals;
        self.locals += 1;
        if let Some(scope) = self.scopes.last_mut() {
          scope.insert(name.clone(), (slot, ty));
        }
        Ok(Op::Let(slot, node))
      }
      Stmt::If(cond, then, otherwise) => {
        let cond = self.typed(cond, Type::Bool)?;
        let then = self.scoped(then)?;
        let otherwise = self.scoped(otherwise)?;
        Ok(Op::If(cond, then, otherwise))
      }
      Stmt::Expr(expr) => self.mutation(expr),
    }
  }

  fn scoped(&mut self, stmts: &[Stmt]) -> Result<Vec<Op>, String> {
    self.scopes.push(HashMap::new());
    let out = self.script(stmts);
    self.scopes.pop();
    out
  }

  fn target(&self, name: &str) -> Option<Target> {
    if self.lookup(name).is_some() {
      return None;
    }
    match name {
      "req" => Some(Target::Req),
      "resp" => Some(Target::Resp),
      _ => None,
    }
  }

  fn use_target(&self, target: Target) -> Result<(), String> {
    if target == Target::Resp && self.direction == Direction::Request {
      return Err("`resp` is not available in request rules".to_string());
    }
    Ok(())
  }

  fn mutation(&mut self, expr: &Expr) -> Result<Op, String> {
    let Expr::Call(callee, args) = expr else {
      return Err("a statement must be a call such as req.set_header(...)".to_string());
    };
    if let Expr::Ident(name) = callee.as_ref() {
      if name == "reject" && self.lookup(name).is_none() {
        let reason = match args.as_slice() {
          [] => Node::Lit(Value::Str(Bytes::new())),
          [reason] => self.typed(reason, Type::Str)?,
          _ => return Err("reject takes at most one argument".to_string()),
        };
        return Ok(Op::Reject(reason));
      }
    }
    let Expr::Member(obj, method) = callee.as_ref() else {
      return Err("a statement must be a call such as req.set_header(...)".to_string());
    };
    let target = match obj.as_ref() {
      Expr::Ident(name) => self.target(name),
      _ => None,
    }
    .ok_or_else(|| format!("`{}` has no effect as a statement", method))?;
    self.use_target(target)?;
    let arity = |n: usize| -> Result<(), String> {
      if args.len() != n {
        return Err(format!(
          "{}.{} takes {} argument(s), got {}",
          target,
          method,
          n,
          args.len()
        ));
      }
      Ok(())
    };
    let op = match method.as_str() {
      "set_header" | "setHeader" => {
        arity(2)?;
        Op::SetHeader(
          target,
          self.typed(&args[0], Type::Str)?,
          self.typed(&args[1], Type::Str)?,
        )
      }
      "add_header" | "addHeader" => {
        arity(2)?;
        Op::AddHeader(
          target,
          self.typed(&args[0], Type::Str)?,
          self.typed(&args[1], Type::Str)?,
        )
      }
      "del_header" | "delHeader" => {
        arity(1)?;
        Op::DelHeader(target, self.typed(&args[0], Type::Str)?)
      }
      "set_body" | "setBody" => {
        arity(1)?;
        self.touch_body(target);
        Op::SetBody(target, self.typed(&args[0], Type::Str)?)
      }
      "set_status" | "setStatus" if target == Target::Resp => {
        arity(1)?;
        Op::SetStatus(self.typed(&args[0], Type::Int)?)
      }
      "set_method" | "setMethod" if target == Target::Req => {
        arity(1)?;
        Op::SetMethod(self.typed(&args[0], Type::Str)?)
      }
      "set_url" | "setUrl" if target == Target::Req => {
        arity(1)?;
        Op::SetUrl(self.typed(&args[0], Type::Str)?)
      }
      other => return Err(format!("unknown mutator {}.{}", target, other)),
    };
    Ok(op)
  }

  fn touch_body(&mut self, target: Target) {
    match target {
      Target::Req => self.access.request = true,
      Target::Resp => self.access.response = true,
    }
  }

  fn typed(&mut self, expr: &Expr, want: Type) -> Result<Node, String> {
    let (node, ty) = self.expr(expr)?;
    if ty != want {
      return Err(format!("expected {}, found {}", want, ty));
    }
    Ok(node)
  }

  fn field(&mut self, target: Target, name: &str) -> Result<(Node, Type), String> {
    self.use_target(target)?;
    let (field, ty) = match (target, name) {
      (Target::Req, "method") => (Field::Method, Type::Str),
      (Target::Req, "url") => (Field::Url, Type::Str),
      (Target::Req, "host") => (Field::Host, Type::Str),
      (Target::Req, "path") => (Field::Path, Type::Str),
      (Target::Req, "query") => (Field::Query, Type::Str),
      (Target::Resp, "status") | (Target::Resp, "statusCode") => (Field::Status, Type::Int),
      (_, "body") => (Field::Body, Type::Str),
      (_, "headers") => {
        return Err(format!(
          "{}.headers must be indexed, e.g. {}.headers[\"Host\"]",
          target, target
        ))
      }
      _ => return Err(format!("{} has no field `{}`", target, name)),
    };
    if field == Field::Body {
      self.touch_body(target);
    }
    Ok((Node::Field(target, field), ty))
  }

  fn headers_of(&self, expr: &Expr) -> Option<Target> {
    match expr {
      Expr::Member(obj, field) if field == "headers" => match obj.as_ref() {
        Expr::Ident(name) => self.target(name),
        _ => None,
      },
      _ => None,
    }
  }

  fn expr(&mut self, expr: &Expr) -> Result<(Node, Type), String> {
    match expr {
      Expr::Str(s) => Ok((Node::Lit(Value::Str(Bytes::from(s.clone()))), Type::Str)),
      Expr::Int(i) => Ok((Node::Lit(Value::Int(*i)), Type::Int)),
      Expr::Bool(b) => Ok((Node::Lit(Value::Bool(*b)), Type::Bool)),
      Expr::Ident(name) => match self.lookup(name) {
        Some((slot, ty)) => Ok((Node::Local(slot), ty)),
        None if self.target(name).is_some() => {
          Err(format!("`{}` is not a value; use one of its fields", name))
        }
        None => Err(format!("undeclared reference to `{}`", name)),
      },
      Expr::Member(obj, name) => {
        let target = match obj.as_ref() {
          Expr::Ident(base) => self.target(base),
          _ => None,
        };
        match target {
          Some(target) => self.field(target, name),
          None => Err(format!("unknown field `{}`", name)),
        }
      }
      Expr::Index(obj, key) => {
        let target = self
          .headers_of(obj)
          .ok_or_else(|| "only headers can be indexed".to_string())?;
        self.use_target(target)?;
        let key = self.typed(key, Type::Str)?;
        Ok((Node::Header(target, Box::new(key)), Type::Str))
      }
      Expr::Unary(UnaryOp::Not, inner) => {
        let inner = self.typed(inner, Type::Bool)?;
        Ok((Node::Not(Box::new(inner)), Type::Bool))
      }
      Expr::Unary(UnaryOp::Neg, inner) => {
        let inner = self.typed(inner, Type::Int)?;
        Ok((Node::Neg(Box::new(inner)), Type::Int))
      }
      Expr::Binary(op, lhs, rhs) => self.binary(*op, lhs, rhs),
      Expr::Call(callee, args) => self.call(callee, args),
    }
  }

  fn binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<(Node, Type), String> {
    match op {
      BinaryOp::And | BinaryOp::Or => {
        let l = Box::new(self.typed(lhs, Type::Bool)?);
        let r = Box::new(self.typed(rhs, Type::Bool)?);
        let node = if op == BinaryOp::And {
          Node::And(l, r)
        } else {
          Node::Or(l, r)
        };
        Ok((node, Type::Bool))
      }
      BinaryOp::In => {
        let needle = self.typed(lhs, Type::Str)?;
        if let Some(target) = self.headers_of(rhs) {
          self.use_target(target)?;
          return Ok((Node::HasHeader(target, Box::new(needle)), Type::Bool));
        }
        let haystack = self.typed(rhs, Type::Str)?;
        Ok((
          Node::Call(Builtin::Contains, vec![haystack, needle]),
          Type::Bool,
        ))
      }
      BinaryOp::Eq | BinaryOp::Ne => {
        let (l, lt) = self.expr(lhs)?;
        let (r, rt) = self.expr(rhs)?;
        if lt != rt {
          return Err(format!("no matching overload for {} {} {}", lt, op, rt));
        }
        Ok((Node::Compare(op, Box::new(l), Box::new(r)), Type::Bool))
      }
      BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
        let (l, lt) = self.expr(lhs)?;
        let (r, rt) = self.expr(rhs)?;
        if lt != rt || lt == Type::Bool {
          return Err(format!("no matching overload for {} {} {}", lt, op, rt));
        }
        Ok((Node::Compare(op, Box::new(l), Box::new(r)), Type::Bool))
      }
      BinaryOp::Add => {
        let (l, lt) = self.expr(lhs)?;
        let (r, rt) = self.expr(rhs)?;
        if lt != rt || lt == Type::Bool {
          return Err(format!("no matching overload for {} + {}", lt, rt));
        }
        Ok((Node::Add(Box::new(l), Box::new(r)), lt))
      }
      BinaryOp::Sub => {
        let l = self.typed(lhs, Type::Int)?;
        let r = self.typed(rhs, Type::Int)?;
        Ok((Node::Sub(Box::new(l), Box::new(r)), Type::Int))
      }
    }
  }

  fn call(&mut self, callee: &Expr, args: &[Expr]) -> Result<(Node, Type), String> {
    match callee {
      Expr::Ident(name) => {
        let (builtin, params, ret) = match name.as_str() {
          "size" => (Builtin::Size, vec![Type::Str], Type::Int),
          "string" => (Builtin::ToStr, vec![Type::Int], Type::Str),
          "int" => (Builtin::ToInt, vec![Type::Str], Type::Int),
          "reject" => return Err("reject(...) must be used as a statement".to_string()),
          other => return Err(format!("undeclared function `{}`", other)),
        };
        let args = self.args(name, args, &params)?;
        Ok((Node::Call(builtin, args), ret))
      }
      Expr::Member(obj, method) => {
        if let Expr::Ident(base) = obj.as_ref() {
          if let Some(target) = self.target(base) {
            return self.target_method(target, method, args);
          }
          if self.lookup(base).is_none() {
            if let Some(ns) = Namespace::from_ident(base) {
              return self.namespace_call(ns, base, method, args);
            }
          }
        }
        if let Some(target) = self.headers_of(obj) {
          self.use_target(target)?;
          let key = match args {
            [key] => self.typed(key, Type::Str)?,
            _ => return Err(format!("headers.{} takes one argument", method)),
          };
          return match method.as_str() {
            "get" => Ok((Node::Header(target, Box::new(key)), Type::Str)),
            "has" => Ok((Node::HasHeader(target, Box::new(key)), Type::Bool)),
            other => Err(format!("headers has no method `{}`", other)),
          };
        }
        self.string_method(obj, method, args)
      }
      _ => Err("expression is not callable".to_string()),
    }
  }

  fn target_method(
    &mut self,
    target: Target,
    method: &str,
    args: &[Expr],
  ) -> Result<(Node, Type), String> {
    match method {
      "getBody" | "get_body" if args.is_empty() => self.field(target, "body"),
      "header" => {
        self.use_target(target)?;
        let key = match args {
          [key] => self.typed(key, Type::Str)?,
          _ => return Err(format!("{}.header takes one argument", target)),
        };
        Ok((Node::Header(target, Box::new(key)), Type::Str))
      }
      other if other.starts_with("set") || other.starts_with("add") || other.starts_with("del") => {
        Err(format!(
          "{}.{} mutates and can only be used as a statement",
          target, other
        ))
      }
      other => Err(format!("{} has no method `{}`", target, other)),
    }
  }

  fn string_method(
    &mut self,
    obj: &Expr,
    method: &str,
    args: &[Expr],
  ) -> Result<(Node, Type), String> {
    let recv = self.typed(obj, Type::Str)?;
    let (builtin, params, ret) = match method {
      "contains" => (Builtin::Contains, vec![Type::Str], Type::Bool),
      "startsWith" => (Builtin::StartsWith, vec![Type::Str], Type::Bool),
      "endsWith" => (Builtin::EndsWith, vec![Type::Str], Type::Bool),
      "matches" => (
        Builtin::Matches(literal_regex(args.first())?),
        vec![Type::Str],
        Type::Bool,
      ),
      "lower" | "lowerAscii" => (Builtin::Lower, vec![], Type::Str),
      "upper" | "upperAscii" => (Builtin::Upper, vec![], Type::Str),
      "trim" => (Builtin::Trim, vec![], Type::Str),
      "size" => (Builtin::Size, vec![], Type::Int),
      other => return Err(format!("string has no method `{}`", other)),
    };
    let mut all = vec![recv];
    all.extend(self.args(method, args, &params)?);
    Ok((Node::Call(builtin, all), ret))
  }

  fn namespace_call(
    &mut self,
    ns: Namespace,
    ns_name: &str,
    func: &str,
    args: &[Expr],
  ) -> Result<(Node, Type), String> {
    if !self.imports.contains(&ns) {
      return Err(format!("`{}` is used but not imported", ns_name));
    }
    let (builtin, params, ret) = match (ns, func) {
      (Namespace::Strings, "replace") => (Builtin::Replace, vec![Type::Str; 3], Type::Str),
      (Namespace::Strings, "contains") => (Builtin::Contains, vec![Type::Str; 2], Type::Bool),
      (Namespace::Strings, "trim") => (Builtin::Trim, vec![Type::Str], Type::Str),
      (Namespace::Strings, "lower") => (Builtin::Lower, vec![Type::Str], Type::Str),
      (Namespace::Strings, "upper") => (Builtin::Upper, vec![Type::Str], Type::Str),
      (Namespace::Strings, "trimPrefix") => (Builtin::TrimPrefix, vec![Type::Str; 2], Type::Str),
      (Namespace::Strings, "trimSuffix") => (Builtin::TrimSuffix, vec![Type::Str; 2], Type::Str),
      (Namespace::Base64, "encode") => (Builtin::Base64Encode, vec![Type::Str], Type::Str),
      (Namespace::Base64, "decode") => (Builtin::Base64Decode, vec![Type::Str], Type::Str),
      (Namespace::Regex, "replace") => (
        Builtin::RegexReplace(literal_regex(args.get(1))?),
        vec![Type::Str; 3],
        Type::Str,
      ),
      (Namespace::Regex, "find") => (
        Builtin::RegexFind(literal_regex(args.get(1))?),
        vec![Type::Str; 2],
        Type::Str,
      ),
      (Namespace::Regex, "match") => (
        Builtin::Matches(literal_regex(args.get(1))?),
        vec![Type::Str; 2],
        Type::Bool,
      ),
      _ => return Err(format!("{}.{} is not defined", ns_name, func)),
    };
    let args = self.args(func, args, &params)?;
    Ok((Node::Call(builtin, args), ret))
  }

  fn args(&mut self, name: &str, args: &[Expr], params: &[Type]) -> Result<Vec<Node>, String> {
    if args.len() != params.len() {
      return Err(format!(
        "{} takes {} argument(s), got {}",
        name,
        params.len(),
        args.len()
      ));
    }
    args
      .iter()
      .zip(params)
      .map(|(arg, ty)| self.typed(arg, *ty))
      .collect()
  }
}

fn literal_regex(arg: Option<&Expr>) -> Result<Option<Arc<Regex>>, String> {
  match arg {
    Some(Expr::Str(pattern)) => Regex::new(pattern)
      .map(|re| Some(Arc::new(re)))
      .map_err(|e| format!("invalid regex {:?}: {}", pattern, e)),
    _ => Ok(None),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::rule::expr::{parse_expression, parse_script};

  fn check_predicate(direction: Direction, src: &str) -> Result<(Node, BodyAccess), String> {
    let expr = parse_expression(src)?;
    let mut checker = Checker::new(direction, HashSet::new());
    let node = checker.predicate(&expr)?;
    Ok((node, checker.access()))
  }

  #[test]
  fn predicate_must_be_bool() {
    let err = check_predicate(Direction::Request, "req.method").unwrap_err();
    assert!(err.contains("expected output type bool"), "{}", err);
    assert!(check_predicate(Direction::Request, "req.method == \"GET\"").is_ok());
  }

  #[test]
  fn resp_is_unavailable_to_request_rules() {
    let err = check_predicate(Direction::Request, "resp.status == 200").unwrap_err();
    assert!(err.contains("not available"), "{}", err);
    assert!(check_predicate(Direction::Response, "resp.status == 200").is_ok());
  }

  #[test]
  fn body_access_is_tracked() {
    let (_, access) = check_predicate(Direction::Response, "req.getBody().contains(\"x\")").unwrap();
    assert_eq!(
      access,
      BodyAccess {
        request: true,
        response: false
      }
    );
    let (_, access) = check_predicate(Direction::Response, "resp.status >= 500").unwrap();
    assert_eq!(access, BodyAccess::default());
  }

  #[test]
  fn mismatched_operands_are_rejected() {
    assert!(check_predicate(Direction::Response, "resp.status == \"200\"").is_err());
    assert!(check_predicate(Direction::Request, "req.method < 3").is_err());
    assert!(check_predicate(Direction::Request, "!req.method").is_err());
  }

  #[test]
  fn literal_regex_is_validated() {
    assert!(check_predicate(Direction::Request, "req.path.matches(\"^/api/(v1|v2\")").is_err());
    assert!(check_predicate(Direction::Request, "req.path.matches(\"^/api/(v1|v2)\")").is_ok());
  }

  #[test]
  fn namespaces_need_imports() {
    let stmts = parse_script("req.set_body(base64.encode(req.body))").unwrap();
    let mut bare = Checker::new(Direction::Request, HashSet::new());
    let err = bare.script(&stmts).unwrap_err();
    assert!(err.contains("not imported"), "{}", err);
    let mut with = Checker::new(
      Direction::Request,
      parse_imports("\"encoding/base64\"").unwrap(),
    );
    assert!(with.script(&stmts).is_ok());
    assert!(parse_imports("os/exec").is_err());
  }

  #[test]
  fn script_mutators_are_checked() {
    let check = |src: &str| {
      let stmts = parse_script(src).unwrap();
      Checker::new(Direction::Request, HashSet::new()).script(&stmts)
    };
    assert!(check("req.set_header(\"X-A\", \"1\")").is_ok());
    assert!(check("req.set_header(\"X-A\")").is_err());
    assert!(check("resp.set_status(500)").is_err());
    assert!(check("req.method == \"GET\"").is_err());
    assert!(check("let n = 1\nreq.set_header(\"X-N\", string(n + 1))").is_ok());
    assert!(check("if true { let x = \"a\" }\nreq.set_body(x)").is_err());
  }
}
