//! Mutation statements run by `script` actions.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri};

use super::check::{Op, Target};
use super::eval::{Fault, Machine};
use crate::body::Body;

fn header_name(name: &[u8]) -> Result<HeaderName, Fault> {
  HeaderName::from_bytes(name).map_err(|_| {
    Fault::Runtime(format!("invalid header name {:?}", String::from_utf8_lossy(name)))
  })
}

fn header_value(value: Bytes) -> Result<HeaderValue, Fault> {
  HeaderValue::from_maybe_shared(value.clone()).map_err(|_| {
    Fault::Runtime(format!("invalid header value {:?}", String::from_utf8_lossy(&value)))
  })
}

impl Machine<'_, '_> {
  /// Run statements in order; the first fault stops the script.
  pub(crate) fn run(&mut self, ops: &[Op]) -> Result<(), Fault> {
    for op in ops {
      self.step(op)?;
    }
    Ok(())
  }

  fn step(&mut self, op: &Op) -> Result<(), Fault> {
    match op {
      Op::Let(slot, node) => {
        let value = self.eval(node)?;
        if let Some(local) = self.locals.get_mut(*slot) {
          *local = Some(value);
        }
      }
      Op::SetHeader(target, name, value) => {
        let name = header_name(&self.eval_str(name)?)?;
        let value = header_value(self.eval_str(value)?)?;
        self.exchange.headers_mut(*target)?.insert(name, value);
      }
      Op::AddHeader(target, name, value) => {
        let name = header_name(&self.eval_str(name)?)?;
        let value = header_value(self.eval_str(value)?)?;
        self.exchange.headers_mut(*target)?.append(name, value);
      }
      Op::DelHeader(target, name) => {
        let name = self.eval_str(name)?;
        if let Ok(name) = HeaderName::from_bytes(&name) {
          self.exchange.headers_mut(*target)?.remove(name);
        }
      }
      Op::SetBody(target, body) => {
        let body = self.eval_str(body)?;
        *self.exchange.body(*target)? = Body::from(body);
      }
      Op::SetStatus(code) => {
        let code = self.eval_int(code)?;
        let status = u16::try_from(code)
          .ok()
          .and_then(|c| StatusCode::from_u16(c).ok())
          .ok_or_else(|| Fault::Runtime(format!("invalid status code {}", code)))?;
        *self.exchange.response_mut()?.status_code_mut() = status;
      }
      Op::SetMethod(method) => {
        let method = self.eval_text(method)?;
        *self.exchange.req.method_mut() = Method::from_bytes(method.as_bytes())
          .map_err(|_| Fault::Runtime(format!("invalid method {:?}", method)))?;
      }
      Op::SetUrl(url) => {
        let url = self.eval_text(url)?;
        let uri = Uri::try_from(url.as_str())
          .map_err(|e| Fault::Runtime(format!("invalid url {:?}: {}", url, e)))?;
        // an absolute url moves the request to another host
        if let Some(authority) = uri.authority() {
          let host = header_value(Bytes::copy_from_slice(authority.as_str().as_bytes()))?;
          self
            .exchange
            .headers_mut(Target::Req)?
            .insert(http::header::HOST, host);
        }
        *self.exchange.req.uri_mut() = uri;
      }
      Op::Reject(reason) => {
        let reason = self.eval_str(reason)?;
        return Err(Fault::Reject(String::from_utf8_lossy(&reason).into_owned()));
      }
      Op::If(cond, then, otherwise) => {
        if self.eval_bool(cond)? {
          self.run(then)?;
        } else {
          self.run(otherwise)?;
        }
      }
    }
    Ok(())
  }
}
