//! Rule files on disk.
//!
//! A rule file is YAML:
//!
//! ```yaml
//! enabled: true
//! rules:
//!   - name: tag-api
//!     change: request
//!     enabled: true
//!     rule: req.path.startsWith("/api")
//!     action: script
//!     script: req.set_header("X-Api", "{{ .Envs.API_TAG }}")
//! ```
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{compile, Direction, Rule};
use crate::errors::{Error, Result};

#[derive(Debug, Default, Deserialize)]
struct RuleFile {
  #[serde(default)]
  enabled: bool,
  #[serde(default)]
  rules: Vec<RuleDefinition>,
}

#[derive(Debug, Default, Deserialize)]
struct RuleDefinition {
  #[serde(default)]
  name: String,
  #[serde(default)]
  change: String,
  #[serde(default)]
  enabled: bool,
  #[serde(default)]
  rule: String,
  #[serde(default)]
  action: String,
  #[serde(default)]
  import: String,
  #[serde(default)]
  script: String,
}

/// Substitute `{{ .Envs.NAME }}` placeholders with values from `env`.
///
/// An unknown name or any other template action is an error.
pub fn render_env(src: &str, env: &HashMap<String, String>) -> std::result::Result<String, String> {
  let mut out = String::with_capacity(src.len());
  let mut rest = src;
  while let Some(start) = rest.find("{{") {
    out.push_str(&rest[..start]);
    let after = &rest[start + 2..];
    let end = after
      .find("}}")
      .ok_or_else(|| "unclosed template action".to_string())?;
    let action = after[..end].trim();
    let name = action
      .strip_prefix(".Envs.")
      .filter(|n| !n.is_empty())
      .ok_or_else(|| format!("unsupported template action {{{{ {} }}}}", action))?;
    let value = env
      .get(name)
      .ok_or_else(|| format!("environment variable {} is not set", name))?;
    out.push_str(value);
    rest = &after[end + 2..];
  }
  out.push_str(rest);
  Ok(out)
}

/// Compile one rule file's contents.
///
/// `file` only labels errors. Returns the request and response rules in
/// declaration order.
pub fn compile_source(
  file: &str,
  yaml: &str,
  env: &HashMap<String, String>,
) -> Result<(Vec<Rule>, Vec<Rule>)> {
  let compile_error = |rule: &str, message: String| Error::RuleCompile {
    file: file.to_string(),
    rule: rule.to_string(),
    message,
  };
  let rule_file: RuleFile =
    serde_yaml::from_str(yaml).map_err(|e| compile_error("", e.to_string()))?;
  let mut request_rules = Vec::new();
  let mut response_rules = Vec::new();
  if !rule_file.enabled {
    tracing::info!(file, "rule file is disabled");
    return Ok((request_rules, response_rules));
  }
  for def in rule_file.rules {
    if !def.enabled {
      tracing::info!(file, rule = %def.name, "rule is disabled");
      continue;
    }
    let direction = match def.change.as_str() {
      "request" => Direction::Request,
      "response" => Direction::Response,
      other => {
        return Err(compile_error(
          &def.name,
          format!("unknown change type {:?}", other),
        ))
      }
    };
    let predicate = render_env(&def.rule, env).map_err(|e| compile_error(&def.name, e))?;
    let script = match def.action.as_str() {
      "reject" => None,
      "script" => Some(render_env(&def.script, env).map_err(|e| compile_error(&def.name, e))?),
      other => {
        return Err(compile_error(
          &def.name,
          format!("unknown action {:?}", other),
        ))
      }
    };
    let rule = compile(
      &def.name,
      direction,
      &predicate,
      script.as_deref(),
      &def.import,
    )
    .map_err(|e| compile_error(&def.name, e))?;
    tracing::debug!(file, rule = %def.name, %direction, "compiled rule");
    match direction {
      Direction::Request => request_rules.push(rule),
      Direction::Response => response_rules.push(rule),
    }
  }
  Ok((request_rules, response_rules))
}

fn collect_rule_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
  let mut entries = std::fs::read_dir(dir)?
    .map(|entry| entry.map(|e| e.path()))
    .collect::<std::io::Result<Vec<_>>>()?;
  entries.sort();
  for path in entries {
    if path.is_dir() {
      collect_rule_files(&path, out)?;
    } else if matches!(
      path.extension().and_then(|e| e.to_str()),
      Some("yaml") | Some("yml")
    ) {
      out.push(path);
    }
  }
  Ok(())
}

/// Compile every `.yaml`/`.yml` file under `dir`, walked in lexical path
/// order.
///
/// A missing directory yields empty rule sets. The first failing rule aborts
/// the whole load.
pub fn compile_rules<P: AsRef<Path>>(
  dir: P,
  env: &HashMap<String, String>,
) -> Result<(Vec<Rule>, Vec<Rule>)> {
  let dir = dir.as_ref();
  let mut request_rules = Vec::new();
  let mut response_rules = Vec::new();
  if !dir.exists() {
    tracing::info!(dir = %dir.display(), "rules directory does not exist");
    return Ok((request_rules, response_rules));
  }
  let mut files = Vec::new();
  collect_rule_files(dir, &mut files)?;
  for path in files {
    let yaml = std::fs::read_to_string(&path)?;
    let (req, resp) = compile_source(&path.display().to_string(), &yaml, env)?;
    request_rules.extend(req);
    response_rules.extend(resp);
  }
  tracing::info!(
    request = request_rules.len(),
    response = response_rules.len(),
    "rules compiled"
  );
  Ok((request_rules, response_rules))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn env() -> HashMap<String, String> {
    HashMap::from([("TOKEN".to_string(), "s3cret".to_string())])
  }

  #[test]
  fn renders_env_placeholders() {
    assert_eq!(
      render_env(r#"req.header("X") == "{{ .Envs.TOKEN }}""#, &env()).unwrap(),
      r#"req.header("X") == "s3cret""#
    );
    assert!(render_env("{{ .Envs.MISSING }}", &env()).is_err());
    assert!(render_env("{{ range . }}", &env()).is_err());
    assert!(render_env("{{ .Envs.TOKEN", &env()).is_err());
  }

  #[test]
  fn skips_disabled_files_and_rules() {
    let yaml = r#"
enabled: true
rules:
  - name: skipped
    change: request
    rule: "true"
    action: reject
  - name: kept
    change: response
    enabled: true
    rule: resp.status >= 500
    action: reject
"#;
    let (req, resp) = compile_source("a.yaml", yaml, &env()).unwrap();
    assert!(req.is_empty());
    assert_eq!(resp.len(), 1);
    assert_eq!(resp[0].name(), "kept");

    let (req, resp) = compile_source("b.yaml", "enabled: false\nrules: []\n", &env()).unwrap();
    assert!(req.is_empty() && resp.is_empty());
  }

  #[test]
  fn unknown_change_type_is_an_error() {
    let yaml = r#"
enabled: true
rules:
  - name: sideways
    change: sideways
    enabled: true
    rule: "true"
    action: reject
"#;
    let err = compile_source("c.yaml", yaml, &env()).unwrap_err();
    match err {
      Error::RuleCompile { file, rule, message } => {
        assert_eq!(file, "c.yaml");
        assert_eq!(rule, "sideways");
        assert!(message.contains("unknown change type"), "{}", message);
      }
      other => panic!("unexpected error {:?}", other),
    }
  }

  #[test]
  fn missing_directory_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let (req, resp) = compile_rules(dir.path().join("nope"), &env()).unwrap();
    assert!(req.is_empty() && resp.is_empty());
  }

  #[test]
  fn walks_directory_in_lexical_order() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("b");
    std::fs::create_dir(&nested).unwrap();
    let file = |name: &str| {
      format!(
        "enabled: true\nrules:\n  - name: {}\n    change: request\n    enabled: true\n    rule: req.header(\"X\") == \"{{{{ .Envs.TOKEN }}}}\"\n    action: reject\n",
        name
      )
    };
    std::fs::write(dir.path().join("c.yml"), file("third")).unwrap();
    std::fs::write(nested.join("z.yaml"), file("second")).unwrap();
    std::fs::write(dir.path().join("a.yaml"), file("first")).unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
    let (req, resp) = compile_rules(dir.path(), &env()).unwrap();
    let names: Vec<&str> = req.iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["first", "second", "third"]);
    assert!(resp.is_empty());
  }

  #[test]
  fn bad_predicate_aborts_load() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
      dir.path().join("bad.yaml"),
      "enabled: true\nrules:\n  - name: not-bool\n    change: request\n    enabled: true\n    rule: req.method\n    action: reject\n",
    )
    .unwrap();
    let err = compile_rules(dir.path(), &env()).unwrap_err();
    assert!(err.to_string().contains("not-bool"), "{}", err);
  }
}
