//! Evaluation of checked programs against a live exchange.

use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use http::HeaderName;
use memchr::memmem;
use regex::bytes::Regex;

use super::check::{Builtin, Field, Node, Target, Value};
use super::expr::BinaryOp;
use crate::body::Body;
use crate::request::Request;
use crate::response::Response;

/// Why a program stopped early.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Fault {
  Runtime(String),
  Reject(String),
}

fn fault<S: Into<String>>(msg: S) -> Fault {
  Fault::Runtime(msg.into())
}

/// The messages a rule can see: the request, plus the response in the
/// response phase.
pub(crate) struct Exchange<'a> {
  pub(crate) req: &'a mut Request,
  pub(crate) resp: Option<&'a mut Response>,
}

impl Exchange<'_> {
  pub(crate) fn body(&mut self, target: Target) -> Result<&mut Body, Fault> {
    match target {
      Target::Req => Ok(self.req.body_mut()),
      Target::Resp => self
        .resp
        .as_deref_mut()
        .map(|r| r.body_mut())
        .ok_or_else(|| fault("no response in this phase")),
    }
  }

  pub(crate) fn headers(&self, target: Target) -> Result<&http::HeaderMap, Fault> {
    match target {
      Target::Req => Ok(self.req.headers()),
      Target::Resp => self
        .resp
        .as_deref()
        .map(|r| r.headers())
        .ok_or_else(|| fault("no response in this phase")),
    }
  }

  pub(crate) fn headers_mut(&mut self, target: Target) -> Result<&mut http::HeaderMap, Fault> {
    match target {
      Target::Req => Ok(self.req.headers_mut()),
      Target::Resp => self
        .resp
        .as_deref_mut()
        .map(|r| r.headers_mut())
        .ok_or_else(|| fault("no response in this phase")),
    }
  }

  pub(crate) fn response_mut(&mut self) -> Result<&mut Response, Fault> {
    self
      .resp
      .as_deref_mut()
      .ok_or_else(|| fault("no response in this phase"))
  }
}

/// Evaluation state for one program run.
pub(crate) struct Machine<'e, 'a> {
  pub(crate) exchange: &'e mut Exchange<'a>,
  pub(crate) locals: Vec<Option<Value>>,
}

impl<'e, 'a> Machine<'e, 'a> {
  pub(crate) fn new(exchange: &'e mut Exchange<'a>, locals: usize) -> Self {
    Machine {
      exchange,
      locals: vec![None; locals],
    }
  }

  pub(crate) fn eval_bool(&mut self, node: &Node) -> Result<bool, Fault> {
    match self.eval(node)? {
      Value::Bool(b) => Ok(b),
      other => Err(fault(format!("expected bool, got {}", other.type_of()))),
    }
  }

  pub(crate) fn eval_str(&mut self, node: &Node) -> Result<Bytes, Fault> {
    match self.eval(node)? {
      Value::Str(s) => Ok(s),
      other => Err(fault(format!("expected string, got {}", other.type_of()))),
    }
  }

  /// A string that has to be valid UTF-8, such as a URL or a method.
  pub(crate) fn eval_text(&mut self, node: &Node) -> Result<String, Fault> {
    let raw = self.eval_str(node)?;
    String::from_utf8(raw.to_vec())
      .map_err(|_| fault(format!("{:?} is not valid UTF-8", String::from_utf8_lossy(&raw))))
  }

  pub(crate) fn eval_int(&mut self, node: &Node) -> Result<i64, Fault> {
    match self.eval(node)? {
      Value::Int(i) => Ok(i),
      other => Err(fault(format!("expected int, got {}", other.type_of()))),
    }
  }

  pub(crate) fn eval(&mut self, node: &Node) -> Result<Value, Fault> {
    match node {
      Node::Lit(v) => Ok(v.clone()),
      Node::Local(slot) => self
        .locals
        .get(*slot)
        .cloned()
        .flatten()
        .ok_or_else(|| fault("read of unassigned variable")),
      Node::Field(target, field) => self.field(*target, *field),
      Node::Header(target, name) => {
        let name = self.eval_str(name)?;
        let headers = self.exchange.headers(*target)?;
        Ok(Value::Str(
          HeaderName::from_bytes(&name)
            .ok()
            .and_then(|name| headers.get(name))
            .map(|v| Bytes::copy_from_slice(v.as_bytes()))
            .unwrap_or_default(),
        ))
      }
      Node::HasHeader(target, name) => {
        let name = self.eval_str(name)?;
        let headers = self.exchange.headers(*target)?;
        Ok(Value::Bool(
          HeaderName::from_bytes(&name)
            .map(|name| headers.contains_key(name))
            .unwrap_or(false),
        ))
      }
      Node::Not(inner) => Ok(Value::Bool(!self.eval_bool(inner)?)),
      Node::Neg(inner) => self
        .eval_int(inner)?
        .checked_neg()
        .map(Value::Int)
        .ok_or_else(|| fault("integer overflow")),
      Node::And(l, r) => Ok(Value::Bool(self.eval_bool(l)? && self.eval_bool(r)?)),
      Node::Or(l, r) => Ok(Value::Bool(self.eval_bool(l)? || self.eval_bool(r)?)),
      Node::Compare(op, l, r) => {
        let l = self.eval(l)?;
        let r = self.eval(r)?;
        compare(*op, &l, &r).map(Value::Bool).map_err(fault)
      }
      Node::Add(l, r) => match (self.eval(l)?, self.eval(r)?) {
        (Value::Int(a), Value::Int(b)) => a
          .checked_add(b)
          .map(Value::Int)
          .ok_or_else(|| fault("integer overflow")),
        (Value::Str(a), Value::Str(b)) => Ok(Value::Str(Bytes::from([a, b].concat()))),
        (a, b) => Err(fault(format!(
          "no matching overload for {} + {}",
          a.type_of(),
          b.type_of()
        ))),
      },
      Node::Sub(l, r) => {
        let a = self.eval_int(l)?;
        let b = self.eval_int(r)?;
        a.checked_sub(b)
          .map(Value::Int)
          .ok_or_else(|| fault("integer overflow"))
      }
      Node::Call(builtin, args) => {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
          values.push(self.eval(arg)?);
        }
        call(builtin, values)
      }
    }
  }

  fn field(&mut self, target: Target, field: Field) -> Result<Value, Fault> {
    let value = match field {
      Field::Body => {
        let body = self.exchange.body(target)?;
        if body.is_pending() {
          return Err(fault(format!("{} body was not buffered", target)));
        }
        return body
          .raw()
          .map(Value::Str)
          .map_err(|e| fault(e.to_string()));
      }
      Field::Status => {
        let resp = self.exchange.response_mut()?;
        return Ok(Value::Int(i64::from(resp.status_code().as_u16())));
      }
      Field::Method => self.exchange.req.method().as_str().to_string(),
      Field::Url => self.exchange.req.uri().to_string(),
      Field::Host => self.exchange.req.host().unwrap_or_default(),
      Field::Path => self.exchange.req.uri().path().to_string(),
      Field::Query => self
        .exchange
        .req
        .uri()
        .query()
        .unwrap_or_default()
        .to_string(),
    };
    Ok(Value::Str(Bytes::from(value)))
  }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<bool, String> {
  let ordering = match (l, r) {
    (Value::Int(a), Value::Int(b)) => a.cmp(b),
    (Value::Str(a), Value::Str(b)) => a.cmp(b),
    (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
    _ => {
      return Err(format!(
        "no matching overload for {} {} {}",
        l.type_of(),
        op,
        r.type_of()
      ))
    }
  };
  let result = match op {
    BinaryOp::Eq => ordering.is_eq(),
    BinaryOp::Ne => ordering.is_ne(),
    BinaryOp::Lt => ordering.is_lt(),
    BinaryOp::Le => ordering.is_le(),
    BinaryOp::Gt => ordering.is_gt(),
    BinaryOp::Ge => ordering.is_ge(),
    other => return Err(format!("{} is not a comparison", other)),
  };
  Ok(result)
}

fn regex_for(cached: &Option<Arc<Regex>>, pattern: &[u8]) -> Result<Arc<Regex>, Fault> {
  if let Some(re) = cached {
    return Ok(re.clone());
  }
  let pattern = std::str::from_utf8(pattern).map_err(|_| fault("regex pattern is not valid UTF-8"))?;
  Regex::new(pattern)
    .map(Arc::new)
    .map_err(|e| fault(format!("invalid regex {:?}: {}", pattern, e)))
}

fn strings<const N: usize>(values: Vec<Value>) -> Result<[Bytes; N], Fault> {
  let strings: Vec<Bytes> = values
    .into_iter()
    .map(|v| match v {
      Value::Str(s) => Ok(s),
      other => Err(fault(format!("expected string, got {}", other.type_of()))),
    })
    .collect::<Result<_, _>>()?;
  strings
    .try_into()
    .map_err(|v: Vec<Bytes>| fault(format!("expected {} argument(s), got {}", N, v.len())))
}

/// Apply `text` to UTF-8 input and `raw` to anything else.
fn transform(s: &Bytes, text: impl Fn(&str) -> String, raw: impl Fn(&[u8]) -> Vec<u8>) -> Bytes {
  match std::str::from_utf8(s) {
    Ok(s) => Bytes::from(text(s)),
    Err(_) => Bytes::from(raw(s)),
  }
}

fn replace(s: &[u8], from: &[u8], to: &[u8]) -> Bytes {
  if from.is_empty() {
    // an empty pattern matches between characters, which needs text
    return match (std::str::from_utf8(s), std::str::from_utf8(to)) {
      (Ok(s), Ok(to)) => Bytes::from(s.replace("", to)),
      _ => Bytes::copy_from_slice(s),
    };
  }
  let mut out = Vec::with_capacity(s.len());
  let mut last = 0;
  for start in memmem::find_iter(s, from) {
    if start < last {
      continue;
    }
    out.extend_from_slice(&s[last..start]);
    out.extend_from_slice(to);
    last = start + from.len();
  }
  out.extend_from_slice(&s[last..]);
  Bytes::from(out)
}

fn call(builtin: &Builtin, args: Vec<Value>) -> Result<Value, Fault> {
  let value = match builtin {
    Builtin::Contains => {
      let [s, needle] = strings(args)?;
      Value::Bool(memmem::find(&s, &needle).is_some())
    }
    Builtin::StartsWith => {
      let [s, prefix] = strings(args)?;
      Value::Bool(s.starts_with(&prefix))
    }
    Builtin::EndsWith => {
      let [s, suffix] = strings(args)?;
      Value::Bool(s.ends_with(&suffix))
    }
    Builtin::Matches(re) => {
      let [s, pattern] = strings(args)?;
      Value::Bool(regex_for(re, &pattern)?.is_match(&s))
    }
    Builtin::Lower => {
      let [s] = strings(args)?;
      Value::Str(transform(&s, str::to_lowercase, <[u8]>::to_ascii_lowercase))
    }
    Builtin::Upper => {
      let [s] = strings(args)?;
      Value::Str(transform(&s, str::to_uppercase, <[u8]>::to_ascii_uppercase))
    }
    Builtin::Trim => {
      let [s] = strings(args)?;
      Value::Str(transform(&s, |t| t.trim().to_string(), |b| b.trim_ascii().to_vec()))
    }
    Builtin::Size => {
      let [s] = strings(args)?;
      let size = match std::str::from_utf8(&s) {
        Ok(text) => text.chars().count(),
        Err(_) => s.len(),
      };
      Value::Int(size as i64)
    }
    Builtin::ToStr => match args.as_slice() {
      [Value::Int(i)] => Value::Str(Bytes::from(i.to_string())),
      _ => return Err(fault("string() expects an int")),
    },
    Builtin::ToInt => {
      let [s] = strings(args)?;
      let text = String::from_utf8_lossy(&s);
      let i = text
        .trim()
        .parse::<i64>()
        .map_err(|e| fault(format!("int({:?}): {}", text, e)))?;
      Value::Int(i)
    }
    Builtin::Replace => {
      let [s, from, to] = strings(args)?;
      Value::Str(replace(&s, &from, &to))
    }
    Builtin::TrimPrefix => {
      let [s, prefix] = strings(args)?;
      let rest = s.strip_prefix(&prefix[..]).map(|rest| s.slice_ref(rest));
      Value::Str(rest.unwrap_or(s))
    }
    Builtin::TrimSuffix => {
      let [s, suffix] = strings(args)?;
      let rest = s.strip_suffix(&suffix[..]).map(|rest| s.slice_ref(rest));
      Value::Str(rest.unwrap_or(s))
    }
    Builtin::Base64Encode => {
      let [s] = strings(args)?;
      Value::Str(Bytes::from(base64::engine::general_purpose::STANDARD.encode(&s)))
    }
    Builtin::Base64Decode => {
      let [s] = strings(args)?;
      let raw = base64::engine::general_purpose::STANDARD
        .decode(s.trim_ascii())
        .map_err(|e| fault(format!("base64.decode: {}", e)))?;
      Value::Str(Bytes::from(raw))
    }
    Builtin::RegexReplace(re) => {
      let [s, pattern, replacement] = strings(args)?;
      let re = regex_for(re, &pattern)?;
      Value::Str(Bytes::from(re.replace_all(&s, &replacement[..]).into_owned()))
    }
    Builtin::RegexFind(re) => {
      let [s, pattern] = strings(args)?;
      let re = regex_for(re, &pattern)?;
      match re.find(&s) {
        Some(m) => Value::Str(s.slice(m.range())),
        None => Value::Str(Bytes::new()),
      }
    }
  };
  Ok(value)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn replace_works_on_raw_bytes() {
    let s = [0x1f, 0x8b, b'a', 0xff, b'a'];
    assert_eq!(&replace(&s, b"a", b"bc")[..], &[0x1f, 0x8b, b'b', b'c', 0xff, b'b', b'c']);
    assert_eq!(&replace(b"aaa", b"aa", b"x")[..], b"xa");
    assert_eq!(&replace(b"ab", b"", b"-")[..], b"-a-b-");
  }

  #[test]
  fn case_mapping_keeps_invalid_utf8() {
    let s = Bytes::from_static(&[b'A', 0xff, b'b']);
    assert_eq!(
      &transform(&s, str::to_lowercase, <[u8]>::to_ascii_lowercase)[..],
      &[b'a', 0xff, b'b']
    );
    let text = Bytes::from_static("ÀB".as_bytes());
    assert_eq!(&transform(&text, str::to_lowercase, <[u8]>::to_ascii_lowercase)[..], "àb".as_bytes());
  }

  #[test]
  fn base64_decode_yields_binary() {
    let out = call(
      &Builtin::Base64Decode,
      vec![Value::Str(Bytes::from_static(b"H4sI/w=="))],
    )
    .unwrap();
    assert_eq!(out, Value::Str(Bytes::from_static(&[0x1f, 0x8b, 0x08, 0xff])));
  }
}
