use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use mitm_relay::header::{HeaderValue, CONTENT_TYPE, HOST, USER_AGENT};
use mitm_relay::uri::Uri;
use mitm_relay::{Body, Method, ProxyConfig, Request, Response, RuleEngine, StatusCode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Intercepting HTTP/HTTPS proxy with a rule engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// Proxy listen address
  #[arg(long, default_value = mitm_relay::DEFAULT_LISTEN_ADDR)]
  addr: String,

  /// Certificate .pem file of the trusted CA
  #[arg(long, default_value = "")]
  cacertfile: PathBuf,

  /// PKCS#8 key .pem file of the trusted CA
  #[arg(long, default_value = "")]
  cakeyfile: PathBuf,

  /// Enable debug logging
  #[arg(long)]
  debug: bool,

  /// Directory holding rule files
  #[arg(long, default_value = mitm_relay::DEFAULT_RULES_DIR)]
  rulesdir: PathBuf,

  /// Environment file; `.env` when not given
  #[arg(long)]
  env: Option<PathBuf>,

  /// Lifetime of forged leaf certificates, in hours
  #[arg(long, default_value_t = 240)]
  validity_hours: i64,

  /// Run the rules against a sample exchange and exit
  #[arg(long)]
  test: bool,
}

fn load_env(file: Option<&PathBuf>) -> HashMap<String, String> {
  let loaded = match file {
    Some(path) => dotenvy::from_filename(path),
    None => dotenvy::dotenv(),
  };
  if let Err(e) = loaded {
    tracing::debug!("environment file not loaded: {}", e);
  }
  std::env::vars().collect()
}

fn sample_exchange() -> (Request, Response) {
  let mut request = Request::new(Method::POST, Uri::from_static("https://example.com/"));
  request
    .headers_mut()
    .insert(HOST, HeaderValue::from_static("example.com"));
  request
    .headers_mut()
    .insert(USER_AGENT, HeaderValue::from_static("curl/7.64.1"));
  *request.body_mut() = Body::from("test body");

  let mut response = Response::new(StatusCode::OK);
  response.headers_mut().insert(
    CONTENT_TYPE,
    HeaderValue::from_static("text/html; charset=UTF-8"),
  );
  *response.body_mut() = Body::from("test body");
  (request, response)
}

/// Check every rule against a sample exchange, logging the outcome of each.
fn dry_run(rules: &RuleEngine) {
  let (mut request, mut response) = sample_exchange();
  for rule in rules.request_rules() {
    match rule.check(&mut request, None) {
      Ok(true) => match rule.apply(&mut request, None) {
        Ok(()) => tracing::info!(rule = rule.name(), "request rule applied"),
        Err(e) => tracing::error!(rule = rule.name(), "error applying request rule: {}", e),
      },
      Ok(false) => tracing::info!(rule = rule.name(), "request rule did not match"),
      Err(e) => tracing::error!(rule = rule.name(), "error checking request rule: {}", e),
    }
  }
  for rule in rules.response_rules() {
    match rule.check(&mut request, Some(&mut response)) {
      Ok(true) => match rule.apply(&mut request, Some(&mut response)) {
        Ok(()) => tracing::info!(rule = rule.name(), "response rule applied"),
        Err(e) => tracing::error!(rule = rule.name(), "error applying response rule: {}", e),
      },
      Ok(false) => tracing::info!(rule = rule.name(), "response rule did not match"),
      Err(e) => tracing::error!(rule = rule.name(), "error checking response rule: {}", e),
    }
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let args = Args::parse();

  let default_level = if args.debug { "debug" } else { "info" };
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("mitm_relay={}", default_level).into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let config = ProxyConfig {
    listen_addr: args.addr.clone(),
    ca_cert_file: args.cacertfile.clone(),
    ca_key_file: args.cakeyfile.clone(),
    rules_dir: args.rulesdir.clone(),
    validity_hours: args.validity_hours,
    env: load_env(args.env.as_ref()),
  };

  if args.test {
    let rules = match config.load_rules() {
      Ok(rules) => rules,
      Err(e) => {
        tracing::error!("error compiling rules: {}", e);
        return Err(e.into());
      }
    };
    dry_run(&rules);
    return Ok(());
  }

  let server = match config.build_server() {
    Ok(server) => server,
    Err(e) => {
      tracing::error!("error starting proxy: {}", e);
      return Err(e.into());
    }
  };
  tracing::info!(addr = %config.listen_addr, "starting proxy server");
  tokio::select! {
    served = server.run(config.listen_addr.as_str()) => served?,
    _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
  }
  Ok(())
}
