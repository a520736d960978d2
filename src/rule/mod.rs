//! Rules: a predicate over the exchange and an action to take when it holds.
//!
//! Rules are compiled once when loaded. A predicate is a boolean expression
//! over `req` and, for response rules, `resp`:
//!
//! ```text
//! req.method == "POST" && req.headers["Content-Type"].contains("json")
//! ```
//!
//! A `script` action is a short list of mutations in the same expression
//! language:
//!
//! ```text
//! let token = "{{ .Envs.API_TOKEN }}"
//! req.set_header("Authorization", "Bearer " + token)
//! if req.path.startsWith("/admin") { reject("admin") }
//! ```
//!
//! A `reject` action aborts the exchange.
mod check;
mod eval;
mod expr;
mod loader;
mod script;

use std::fmt;

use crate::errors::{Error, Result};
use crate::request::Request;
use crate::response::Response;

pub use check::BodyAccess;
use check::{parse_imports, Checker, Node, Op};
use eval::{Exchange, Fault, Machine};
pub use loader::{compile_rules, compile_source, render_env};

/// Which message a rule changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  /// Runs before the request is forwarded; only `req` is visible.
  Request,
  /// Runs before the response is forwarded; sees `req` and `resp`.
  Response,
}

impl fmt::Display for Direction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Direction::Request => "request",
      Direction::Response => "response",
    })
  }
}

#[derive(Debug, Clone)]
pub(crate) enum Action {
  Reject,
  Script { ops: Vec<Op>, locals: usize },
}

/// A compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
  name: String,
  direction: Direction,
  predicate: Node,
  action: Action,
  access: BodyAccess,
}

impl Rule {
  /// Compile a rule whose action rejects the exchange.
  pub fn reject(name: &str, direction: Direction, predicate: &str) -> Result<Rule> {
    compile(name, direction, predicate, None, "").map_err(|message| inline_error(name, message))
  }

  /// Compile a rule whose action runs `script`.
  ///
  /// `imports` names the extra namespaces the script may call, for example
  /// `"strings, base64"`.
  pub fn script(
    name: &str,
    direction: Direction,
    predicate: &str,
    imports: &str,
    script: &str,
  ) -> Result<Rule> {
    compile(name, direction, predicate, Some(script), imports)
      .map_err(|message| inline_error(name, message))
  }

  /// Rule name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Which phase the rule runs in.
  pub fn direction(&self) -> Direction {
    self.direction
  }

  /// Whether the action is `reject`.
  pub fn is_reject(&self) -> bool {
    matches!(self.action, Action::Reject)
  }

  /// Message bodies the predicate or script reads or replaces.
  pub fn body_access(&self) -> BodyAccess {
    self.access
  }

  /// Evaluate the predicate. A fault is an error, never `false`.
  pub fn check(&self, req: &mut Request, resp: Option<&mut Response>) -> Result<bool> {
    let mut exchange = Exchange { req, resp };
    let mut machine = Machine::new(&mut exchange, 0);
    machine
      .eval_bool(&self.predicate)
      .map_err(|fault| self.fault_error("check", fault))
  }

  /// Run the action. Call only after [`Rule::check`] returned `true`.
  pub fn apply(&self, req: &mut Request, resp: Option<&mut Response>) -> Result<()> {
    tracing::debug!(rule = %self.name, "applying rule");
    let (ops, locals) = match &self.action {
      Action::Reject => {
        return Err(Error::Rejected {
          rule: self.name.clone(),
        })
      }
      Action::Script { ops, locals } => (ops, *locals),
    };
    let mut exchange = Exchange { req, resp };
    let mut machine = Machine::new(&mut exchange, locals);
    machine
      .run(ops)
      .map_err(|fault| self.fault_error("apply", fault))
  }

  fn fault_error(&self, stage: &str, fault: Fault) -> Error {
    match fault {
      Fault::Runtime(message) => Error::RuleEvaluation {
        rule: self.name.clone(),
        message: format!("{}: {}", stage, message),
      },
      Fault::Reject(reason) => {
        tracing::info!(rule = %self.name, reason = %reason, "script rejected exchange");
        Error::Rejected {
          rule: self.name.clone(),
        }
      }
    }
  }
}

fn inline_error(name: &str, message: String) -> Error {
  Error::RuleCompile {
    file: "<inline>".to_string(),
    rule: name.to_string(),
    message,
  }
}

pub(crate) fn compile(
  name: &str,
  direction: Direction,
  predicate: &str,
  script: Option<&str>,
  imports: &str,
) -> std::result::Result<Rule, String> {
  let imports = parse_imports(imports)?;
  let mut checker = Checker::new(direction, imports.clone());
  let parsed = expr::parse_expression(predicate).map_err(|e| format!("rule: {}", e))?;
  let predicate = checker
    .predicate(&parsed)
    .map_err(|e| format!("rule: {}", e))?;
  let mut access = checker.access();
  let action = match script {
    None => Action::Reject,
    Some(src) => {
      let stmts = expr::parse_script(src).map_err(|e| format!("script: {}", e))?;
      let mut checker = Checker::new(direction, imports);
      let ops = checker.script(&stmts).map_err(|e| format!("script: {}", e))?;
      access = access.merge(checker.access());
      Action::Script {
        ops,
        locals: checker.locals(),
      }
    }
  };
  Ok(Rule {
    name: name.to_string(),
    direction,
    predicate,
    action,
    access,
  })
}

/// Run `rules` in order against one exchange.
///
/// A rule whose predicate holds is applied before the next rule is checked,
/// so later rules see earlier mutations. The first error stops the phase.
pub fn apply_rules(rules: &[Rule], req: &mut Request, mut resp: Option<&mut Response>) -> Result<()> {
  for rule in rules {
    if !rule.check(req, resp.as_deref_mut())? {
      continue;
    }
    tracing::debug!(rule = %rule.name, "rule matched");
    rule.apply(req, resp.as_deref_mut())?;
  }
  Ok(())
}

/// The request and response rule sets of a proxy.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
  request_rules: Vec<Rule>,
  response_rules: Vec<Rule>,
}

impl RuleEngine {
  /// Build an engine from already compiled rule sets.
  pub fn new(request_rules: Vec<Rule>, response_rules: Vec<Rule>) -> Self {
    RuleEngine {
      request_rules,
      response_rules,
    }
  }

  /// Rules run before a request is forwarded.
  pub fn request_rules(&self) -> &[Rule] {
    &self.request_rules
  }

  /// Rules run before a response is forwarded.
  pub fn response_rules(&self) -> &[Rule] {
    &self.response_rules
  }

  /// Whether the request body must be read into memory before forwarding.
  ///
  /// Response rules see the request body too, so they count.
  pub fn request_body_needed(&self) -> bool {
    self
      .request_rules
      .iter()
      .chain(&self.response_rules)
      .any(|r| r.access.request)
  }

  /// Whether the response body must be read into memory before forwarding.
  pub fn response_body_needed(&self) -> bool {
    self.response_rules.iter().any(|r| r.access.response)
  }

  /// Run the request rules.
  pub fn apply_request(&self, req: &mut Request) -> Result<()> {
    apply_rules(&self.request_rules, req, None)
  }

  /// Run the response rules; `req` is the snapshot taken before request
  /// rules ran.
  pub fn apply_response(&self, req: &mut Request, resp: &mut Response) -> Result<()> {
    apply_rules(&self.response_rules, req, Some(resp))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::body::{Body, Framing};
  use http::{HeaderValue, Method, StatusCode, Uri};

  fn post() -> Request {
    let mut req = Request::new(Method::POST, Uri::from_static("https://example.com/api/v1?x=1"));
    req
      .headers_mut()
      .insert("user-agent", HeaderValue::from_static("curl/7.64.1"));
    req
      .headers_mut()
      .insert("host", HeaderValue::from_static("example.com"));
    *req.body_mut() = Body::from("test body");
    req
  }

  fn html() -> Response {
    let mut resp = Response::new(StatusCode::OK);
    resp
      .headers_mut()
      .insert("content-type", HeaderValue::from_static("text/html; charset=UTF-8"));
    *resp.body_mut() = Body::from("<html>hello</html>");
    resp
  }

  #[test]
  fn predicate_reads_request_fields() {
    let rule = Rule::reject(
      "fields",
      Direction::Request,
      r#"req.method == "POST" && req.host == "example.com" && req.path == "/api/v1"
         && req.query == "x=1" && req.headers["User-Agent"].startsWith("curl/")"#,
    )
    .unwrap();
    assert!(rule.check(&mut post(), None).unwrap());
  }

  #[test]
  fn missing_header_reads_as_empty() {
    let rule = Rule::reject("h", Direction::Request, r#"req.header("X-Nope") == """#).unwrap();
    assert!(rule.check(&mut post(), None).unwrap());
    let rule = Rule::reject("h", Direction::Request, r#"!("X-Nope" in req.headers)"#).unwrap();
    assert!(rule.check(&mut post(), None).unwrap());
  }

  #[test]
  fn body_can_be_read_repeatedly() {
    let rule = Rule::reject("b", Direction::Request, r#"req.body.contains("test")"#).unwrap();
    assert!(rule.body_access().request);
    let mut req = post();
    assert!(rule.check(&mut req, None).unwrap());
    assert!(rule.check(&mut req, None).unwrap());
    assert_eq!(req.body_mut().text().unwrap(), "test body");
  }

  #[test]
  fn unbuffered_body_is_a_fault() {
    let rule = Rule::reject("b", Direction::Request, r#"req.body == """#).unwrap();
    let mut req = post();
    *req.body_mut() = Body::Pending(Framing::Length(4));
    let err = rule.check(&mut req, None).unwrap_err();
    assert!(matches!(err, Error::RuleEvaluation { .. }), "{}", err);
  }

  #[test]
  fn reject_action_is_distinguished() {
    let rule = Rule::reject("deny", Direction::Request, "true").unwrap();
    assert!(rule.is_reject());
    let err = apply_rules(&[rule], &mut post(), None).unwrap_err();
    assert!(err.is_rejected());
    assert_eq!(err.to_string(), "rejected by rule \"deny\"");
  }

  #[test]
  fn false_predicate_skips_action() {
    let rule = Rule::reject("deny", Direction::Request, r#"req.method == "GET""#).unwrap();
    assert!(apply_rules(&[rule], &mut post(), None).is_ok());
  }

  #[test]
  fn later_rules_observe_earlier_mutations() {
    let tag = Rule::script(
      "tag",
      Direction::Request,
      "true",
      "",
      r#"req.set_header("X-Stage", "one")"#,
    )
    .unwrap();
    let follow = Rule::script(
      "follow",
      Direction::Request,
      r#"req.headers["x-stage"] == "one""#,
      "",
      r#"req.set_header("X-Stage", "two"); req.del_header("User-Agent")"#,
    )
    .unwrap();
    let mut req = post();
    apply_rules(&[tag, follow], &mut req, None).unwrap();
    assert_eq!(req.headers()["x-stage"], "two");
    assert!(req.headers().get("user-agent").is_none());
  }

  #[test]
  fn response_script_mutates_status_and_body() {
    let rule = Rule::script(
      "rewrite",
      Direction::Response,
      r#"resp.status == 200 && resp.headers["Content-Type"].contains("text/html")"#,
      "strings",
      r#"
      let body = strings.replace(resp.body, "hello", "bye")
      resp.set_body(body)
      resp.set_status(203)
      "#,
    )
    .unwrap();
    assert_eq!(
      rule.body_access(),
      BodyAccess {
        request: false,
        response: true
      }
    );
    let mut req = post();
    let mut resp = html();
    let engine = RuleEngine::new(vec![], vec![rule]);
    assert!(engine.response_body_needed());
    assert!(!engine.request_body_needed());
    engine.apply_response(&mut req, &mut resp).unwrap();
    assert_eq!(resp.status_code(), StatusCode::NON_AUTHORITATIVE_INFORMATION);
    assert_eq!(resp.body_mut().text().unwrap(), "<html>bye</html>");
  }

  #[test]
  fn binary_body_survives_rewrite() {
    let gzip: &'static [u8] = &[0x1f, 0x8b, 0x08, 0xff, 0x61];
    let echo = Rule::script(
      "echo",
      Direction::Response,
      r#"resp.body.endsWith("a")"#,
      "",
      "resp.set_body(resp.body)",
    )
    .unwrap();
    let mut req = post();
    let mut resp = html();
    *resp.body_mut() = Body::from(gzip.to_vec());
    apply_rules(&[echo], &mut req, Some(&mut resp)).unwrap();
    assert_eq!(&resp.body_mut().raw().unwrap()[..], gzip);

    let patch = Rule::script(
      "patch",
      Direction::Response,
      "true",
      "strings",
      r#"resp.set_body(strings.replace(resp.body, "a", "b"))"#,
    )
    .unwrap();
    apply_rules(&[patch], &mut req, Some(&mut resp)).unwrap();
    assert_eq!(&resp.body_mut().raw().unwrap()[..], &[0x1f, 0x8b, 0x08, 0xff, 0x62]);
  }

  #[test]
  fn script_reject_and_branches() {
    let rule = Rule::script(
      "gate",
      Direction::Request,
      "true",
      "",
      r#"
      if req.path.startsWith("/admin") {
        reject("admin area")
      } else {
        req.set_header("X-Path", req.path)
      }
      "#,
    )
    .unwrap();
    let mut req = post();
    rule.apply(&mut req, None).unwrap();
    assert_eq!(req.headers()["x-path"], "/api/v1");

    let mut admin = Request::new(Method::GET, Uri::from_static("http://example.com/admin/users"));
    assert!(rule.apply(&mut admin, None).unwrap_err().is_rejected());
  }

  #[test]
  fn runtime_faults_are_errors() {
    let rule = Rule::script(
      "bad-int",
      Direction::Request,
      "true",
      "",
      r#"req.set_header("X-N", string(int(req.method)))"#,
    )
    .unwrap();
    let err = rule.apply(&mut post(), None).unwrap_err();
    match err {
      Error::RuleEvaluation { rule, message } => {
        assert_eq!(rule, "bad-int");
        assert!(message.starts_with("apply:"), "{}", message);
      }
      other => panic!("unexpected error {:?}", other),
    }
  }

  #[test]
  fn set_url_moves_host() {
    let rule = Rule::script(
      "redirect",
      Direction::Request,
      "true",
      "",
      r#"req.set_url("http://internal.local:8080/v2" + req.path)"#,
    )
    .unwrap();
    let mut req = post();
    rule.apply(&mut req, None).unwrap();
    assert_eq!(req.uri().to_string(), "http://internal.local:8080/v2/api/v1");
    assert_eq!(req.host().as_deref(), Some("internal.local:8080"));
  }

  #[test]
  fn base64_and_regex_namespaces() {
    let rule = Rule::script(
      "ns",
      Direction::Request,
      r#"regex.match(req.path, "^/api/v[0-9]+$")"#,
      "encoding/base64, regexp",
      r#"
      req.set_header("X-Auth", base64.encode("user:pass"))
      req.set_header("X-Version", regex.find(req.path, "v[0-9]+"))
      req.set_header("X-Plain", base64.decode("aGk="))
      "#,
    )
    .unwrap();
    let mut req = post();
    assert!(rule.check(&mut req, None).unwrap());
    rule.apply(&mut req, None).unwrap();
    assert_eq!(req.headers()["x-auth"], "dXNlcjpwYXNz");
    assert_eq!(req.headers()["x-version"], "v1");
    assert_eq!(req.headers()["x-plain"], "hi");
  }

  #[test]
  fn compile_errors_name_the_rule() {
    let err = Rule::reject("typed", Direction::Request, "req.method").unwrap_err();
    match err {
      Error::RuleCompile { rule, message, .. } => {
        assert_eq!(rule, "typed");
        assert!(message.contains("bool"), "{}", message);
      }
      other => panic!("unexpected error {:?}", other),
    }
    assert!(Rule::script("r", Direction::Request, "true", "", "resp.set_status(500)").is_err());
    assert!(Rule::script("r", Direction::Request, "true", "os", "reject()").is_err());
  }
}
