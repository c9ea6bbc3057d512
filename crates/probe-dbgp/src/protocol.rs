//! Typed views over DBGP payloads.
//!
//! Responses keep their raw XML and build the tree on demand; the
//! fallible constructors surface an embedded `<error>` element before a
//! caller can reach any command-specific accessor.

use std::fmt;
use std::str::FromStr;

use crate::error::DbgpError;

/// The unsolicited announcement an engine pushes on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Init {
    /// Language the engine is debugging (e.g. "PHP", "python").
    pub language: String,
    /// The IDE key the engine was started with.
    pub idekey: String,
    /// Protocol version announced by the engine.
    pub api_version: Option<String>,
    /// URI of the file the engine is paused in.
    pub file_uri: Option<String>,
}

impl Init {
    /// Parse the init announcement.
    ///
    /// A missing `language` attribute marks the message as something
    /// other than a DBGP init and is rejected.
    pub fn parse(raw: &str) -> Result<Self, DbgpError> {
        let doc = roxmltree::Document::parse(raw)
            .map_err(|e| DbgpError::malformed(format!("invalid init XML: {e}"), raw))?;
        let root = doc.root_element();
        let language = root
            .attribute("language")
            .ok_or_else(|| DbgpError::malformed("init announcement has no language", raw))?
            .to_string();
        Ok(Self {
            language,
            idekey: root.attribute("idekey").unwrap_or_default().to_string(),
            api_version: root.attribute("api_version").map(str::to_string),
            file_uri: root.attribute("fileuri").map(str::to_string),
        })
    }
}

/// Execution status token reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Engine is paused before the first instruction.
    Starting,
    /// Engine is shutting down after a stop request.
    Stopping,
    /// The debugged process has ended.
    Stopped,
    /// The engine is executing.
    Running,
    /// The engine is paused at a breakpoint or step boundary.
    Break,
}

impl Status {
    /// Whether this status means the session is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Stopping | Status::Stopped)
    }
}

impl FromStr for Status {
    type Err = DbgpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Status::Starting),
            "stopping" => Ok(Status::Stopping),
            "stopped" => Ok(Status::Stopped),
            "running" => Ok(Status::Running),
            "break" => Ok(Status::Break),
            other => Err(DbgpError::malformed(
                format!("unknown status token '{other}'"),
                other,
            )),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Status::Starting => "starting",
            Status::Stopping => "stopping",
            Status::Stopped => "stopped",
            Status::Running => "running",
            Status::Break => "break",
        };
        f.write_str(token)
    }
}

/// A generic command response.
///
/// Construction is the fallible step: an `<error>` child anywhere in the
/// payload becomes a [`DbgpError::Protocol`] (or a malformed-response
/// error when the element lacks a code or message) and no `Response`
/// value exists afterwards.
#[derive(Debug, Clone)]
pub struct Response {
    raw: String,
    command: String,
    arguments: String,
}

impl Response {
    /// Build a response from a received payload.
    ///
    /// The XML is validated here, so `document()` cannot fail later for
    /// a response that was constructed successfully.
    pub fn parse(
        raw: impl Into<String>,
        command: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Result<Self, DbgpError> {
        let raw = raw.into();
        {
            let doc = roxmltree::Document::parse(&raw)
                .map_err(|e| DbgpError::malformed(format!("invalid response XML: {e}"), &raw))?;
            raise_embedded_error(&doc, &raw)?;
        }
        Ok(Self {
            raw,
            command: command.into(),
            arguments: arguments.into(),
        })
    }

    /// The full payload text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The command that produced this response.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The arguments the command was sent with.
    pub fn arguments(&self) -> &str {
        &self.arguments
    }

    /// The payload as an XML tree, parsed on demand.
    pub fn document(&self) -> Result<roxmltree::Document<'_>, DbgpError> {
        roxmltree::Document::parse(&self.raw)
            .map_err(|e| DbgpError::malformed(format!("invalid response XML: {e}"), &self.raw))
    }

    /// A root-element attribute, if present.
    pub fn attribute(&self, name: &str) -> Result<Option<String>, DbgpError> {
        Ok(self
            .document()?
            .root_element()
            .attribute(name)
            .map(str::to_string))
    }

    /// The `transaction_id` attribute the engine echoed back.
    pub fn transaction_id(&self) -> Result<Option<u32>, DbgpError> {
        match self.attribute("transaction_id")? {
            Some(text) => text
                .parse::<u32>()
                .map(Some)
                .map_err(|_| DbgpError::malformed("non-numeric transaction_id", &self.raw)),
            None => Ok(None),
        }
    }

    /// The text content of the root element, if any.
    pub fn text(&self) -> Result<Option<String>, DbgpError> {
        Ok(self
            .document()?
            .root_element()
            .text()
            .map(str::to_string))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Extract and raise the `<error>` element of a payload, if present.
fn raise_embedded_error(doc: &roxmltree::Document<'_>, raw: &str) -> Result<(), DbgpError> {
    let Some(error_el) = doc
        .descendants()
        .find(|n| n.is_element() && n.has_tag_name("error"))
    else {
        return Ok(());
    };
    let code = error_el
        .attribute("code")
        .ok_or_else(|| DbgpError::malformed("missing error code in response", raw))?
        .parse::<u32>()
        .map_err(|_| DbgpError::malformed("non-numeric error code in response", raw))?;
    let message = error_el
        .children()
        .find(|n| n.is_element() && n.has_tag_name("message"))
        .and_then(|n| n.text())
        .ok_or_else(|| DbgpError::malformed("missing error message in response", raw))?;
    Err(DbgpError::Protocol {
        code,
        message: message.trim().to_string(),
    })
}

/// Response shape shared by status, run, step, stop and detach commands.
#[derive(Debug, Clone)]
pub struct StatusResponse {
    inner: Response,
}

impl StatusResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    /// The engine-reported status token.
    pub fn status(&self) -> Result<Status, DbgpError> {
        let token = self
            .inner
            .attribute("status")?
            .ok_or_else(|| DbgpError::malformed("response has no status", self.inner.as_str()))?;
        token.parse()
    }

    /// The underlying generic response.
    pub fn response(&self) -> &Response {
        &self.inner
    }
}

/// Response shape of the feature_get command.
#[derive(Debug, Clone)]
pub struct FeatureResponse {
    inner: Response,
}

impl FeatureResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    /// Whether the engine supports the queried feature.
    pub fn is_supported(&self) -> Result<bool, DbgpError> {
        let supported = self.inner.attribute("supported")?.ok_or_else(|| {
            DbgpError::malformed("feature response has no supported flag", self.inner.as_str())
        })?;
        Ok(supported == "1")
    }

    /// The feature value, when the feature is supported.
    pub fn value(&self) -> Result<Option<String>, DbgpError> {
        if self.is_supported()? {
            self.inner.text()
        } else {
            Ok(None)
        }
    }

    /// The underlying generic response.
    pub fn response(&self) -> &Response {
        &self.inner
    }
}
