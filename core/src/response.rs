//! Response envelope decoding.
//!
//! # Design
//! Most actions answer with an XML envelope:
//! `<qdbapi><action/><errcode/><errtext/><udata/>...payload</qdbapi>`.
//! A handful of rendering actions (record HTML, results tables, forms, pages)
//! answer with a formatted document instead; those bodies are kept verbatim
//! as a passthrough and never inspected further. Errors are always reported
//! through an envelope, so an embedded `errcode` is the single source of truth
//! for success.

use std::str::FromStr;

use crate::error::{Error, ErrorCode, Result};
use crate::http::HttpResponse;
use crate::xml::Element;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Body {
    Envelope(Element),
    Passthrough(String),
}

/// A decoded reply. Carries the embedded error state whether or not the call
/// succeeded; `into_result` converts it into a `Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    action: Option<String>,
    errcode: ErrorCode,
    errtext: String,
    errdetail: Option<String>,
    udata: Option<String>,
    body: Body,
}

impl Response {
    /// Decode an HTTP reply. Non-2xx statuses are errors. A declared
    /// non-XML content type is a passthrough whatever the body looks like;
    /// without a content type the body is sniffed for a `<qdbapi>` root.
    pub fn from_http(response: HttpResponse) -> Result<Self> {
        if !response.is_success() {
            return Err(Error::Http {
                status: response.status,
                body: response.body,
            });
        }
        let is_xml = match response.content_type() {
            Some(ct) => ct.contains("xml"),
            None => looks_like_envelope(&response.body),
        };
        if !is_xml {
            return Ok(Self::passthrough(response.body));
        }
        Self::from_envelope(Element::parse(&response.body)?)
    }

    /// Decode an already-parsed `<qdbapi>` element.
    pub fn from_envelope(root: Element) -> Result<Self> {
        if root.name != "qdbapi" {
            return Err(Error::Deserialization(format!(
                "expected <qdbapi> envelope, found <{}>",
                root.name
            )));
        }
        let errcode = root
            .child_text("errcode")
            .ok_or_else(|| Error::Deserialization("envelope is missing <errcode>".to_string()))?;
        let errcode = errcode
            .trim()
            .parse::<u32>()
            .map(ErrorCode)
            .map_err(|_| Error::Deserialization(format!("non-numeric <errcode> {errcode:?}")))?;

        Ok(Self {
            action: root.child_text("action").map(str::to_owned),
            errcode,
            errtext: root.child_text("errtext").unwrap_or_default().to_string(),
            errdetail: root.child_text("errdetail").map(str::to_owned),
            udata: root.child_text("udata").map(str::to_owned),
            body: Body::Envelope(root),
        })
    }

    pub fn passthrough(text: String) -> Self {
        Self {
            action: None,
            errcode: ErrorCode::SUCCESS,
            errtext: String::new(),
            errdetail: None,
            udata: None,
            body: Body::Passthrough(text),
        }
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    pub fn errcode(&self) -> ErrorCode {
        self.errcode
    }

    pub fn errtext(&self) -> &str {
        &self.errtext
    }

    pub fn errdetail(&self) -> Option<&str> {
        self.errdetail.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.errcode.is_success()
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self.body, Body::Passthrough(_))
    }

    /// The error this response carries, if any.
    pub fn error(&self) -> Option<Error> {
        (!self.is_success()).then(|| Error::from_api(self.errcode, self.errtext.clone(), self.errdetail.clone()))
    }

    /// Turn an embedded error code into `Err`.
    pub fn into_result(self) -> Result<Self> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    /// Opaque user data echoed by the service.
    pub fn udata(&self) -> Option<&str> {
        self.udata.as_deref()
    }

    /// Check that `expected` came back unchanged.
    pub fn verify_udata(&self, expected: &str) -> Result<()> {
        check_udata(expected, self.udata())
    }

    pub fn root(&self) -> Result<&Element> {
        match &self.body {
            Body::Envelope(root) => Ok(root),
            Body::Passthrough(_) => Err(Error::Deserialization(
                "expected an XML envelope, got a formatted document".to_string(),
            )),
        }
    }

    pub fn into_root(self) -> Result<Element> {
        match self.body {
            Body::Envelope(root) => Ok(root),
            Body::Passthrough(_) => Err(Error::Deserialization(
                "expected an XML envelope, got a formatted document".to_string(),
            )),
        }
    }

    /// The verbatim body of a rendering action.
    pub fn into_passthrough(self) -> Result<String> {
        match self.body {
            Body::Passthrough(text) => Ok(text),
            Body::Envelope(_) => Err(Error::Deserialization(
                "expected a formatted document, got an XML envelope".to_string(),
            )),
        }
    }

    /// Text of a top-level payload element.
    pub fn field(&self, name: &str) -> Option<&str> {
        match &self.body {
            Body::Envelope(root) => root.child_text(name),
            Body::Passthrough(_) => None,
        }
    }

    pub fn required(&self, name: &str) -> Result<&str> {
        self.field(name)
            .ok_or_else(|| Error::Deserialization(format!("response is missing <{name}>")))
    }

    pub fn parse_field<T: FromStr>(&self, name: &str) -> Result<T> {
        let raw = self.required(name)?;
        raw.trim()
            .parse()
            .map_err(|_| Error::Deserialization(format!("<{name}> has unexpected value {raw:?}")))
    }

    /// Children of the element at `path` below the envelope root.
    pub fn children<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        let parent = match &self.body {
            Body::Envelope(root) => root.find(path),
            Body::Passthrough(_) => None,
        };
        parent.into_iter().flat_map(|p| p.children.iter())
    }
}

/// `Integrity` unless `received` is exactly `expected`.
pub(crate) fn check_udata(expected: &str, received: Option<&str>) -> Result<()> {
    match received {
        Some(echoed) if echoed == expected => Ok(()),
        received => Err(Error::Integrity {
            expected: expected.to_string(),
            received: received.map(str::to_owned),
        }),
    }
}

/// Only consulted when the reply has no content type.
fn looks_like_envelope(body: &str) -> bool {
    let mut rest = body.trim_start();
    if rest.starts_with("<?xml") {
        match rest.find("?>") {
            Some(end) => rest = rest[end + 2..].trim_start(),
            None => return false,
        }
    }
    rest.starts_with("<qdbapi")
}
