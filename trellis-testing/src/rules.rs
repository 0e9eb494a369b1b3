//! Scripted responses for the virtual cluster.

use bytes::Bytes;
use http::StatusCode;
use std::time::Duration;

/// How many times a rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Times {
    /// Every matching request.
    Always,
    /// The first matching request.
    Once,
    /// The first `n` matching requests.
    Times(usize),
}

impl Times {
    fn budget(self) -> Option<usize> {
        match self {
            Self::Always => None,
            Self::Once => Some(1),
            Self::Times(n) => Some(n),
        }
    }
}

/// What a scripted request produces.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// An HTTP response.
    Respond {
        /// Status code.
        status: StatusCode,
        /// Response body.
        body: Bytes,
    },
    /// The node could not be reached.
    Refused,
}

/// One scripted behavior: which requests it matches, how often, and what
/// they get back.
#[derive(Debug, Clone)]
pub struct Rule {
    port: Option<u16>,
    path: Option<String>,
    remaining: Option<usize>,
    succeeds: bool,
    status: Option<StatusCode>,
    body: Option<Bytes>,
    takes: Option<Duration>,
}

impl Rule {
    fn new(times: Times, succeeds: bool) -> Self {
        Self {
            port: None,
            path: None,
            remaining: times.budget(),
            succeeds,
            status: None,
            body: None,
            takes: None,
        }
    }

    /// A rule that answers successfully.
    pub fn succeeds(times: Times) -> Self {
        Self::new(times, true)
    }

    /// A rule that fails. Without a status it refuses the connection.
    pub fn fails(times: Times) -> Self {
        Self::new(times, false)
    }

    /// Only match requests to `port`.
    pub fn on_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Only match requests whose path starts with `prefix`.
    pub fn on_path(mut self, prefix: impl Into<String>) -> Self {
        self.path = Some(prefix.into().trim_start_matches('/').to_string());
        self
    }

    /// Answer with `status`.
    pub fn returns_status(mut self, status: u16) -> Self {
        self.status = StatusCode::from_u16(status).ok();
        self
    }

    /// Answer with a JSON body.
    pub fn returns_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(Bytes::from(body.to_string()));
        self
    }

    /// Answer with a raw body.
    pub fn returns_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Spend `duration` before answering. A request whose timeout is shorter
    /// times out instead.
    pub fn takes(mut self, duration: Duration) -> Self {
        self.takes = Some(duration);
        self
    }

    pub(crate) fn matches(&self, port: Option<u16>, path: &str) -> bool {
        let exhausted = self.remaining == Some(0);
        let port_matches = self.port.is_none() || self.port == port;
        let path_matches = self
            .path
            .as_deref()
            .is_none_or(|prefix| path.trim_start_matches('/').starts_with(prefix));
        !exhausted && port_matches && path_matches
    }

    /// Use up one application of the rule.
    pub(crate) fn consume(&mut self) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
    }

    pub(crate) fn duration(&self) -> Option<Duration> {
        self.takes
    }

    pub(crate) fn outcome(&self, default_body: impl FnOnce() -> Bytes) -> Outcome {
        match (self.succeeds, self.status) {
            (true, status) => Outcome::Respond {
                status: status.unwrap_or(StatusCode::OK),
                body: self.body.clone().unwrap_or_else(default_body),
            },
            (false, Some(status)) => Outcome::Respond {
                status,
                body: self.body.clone().unwrap_or_default(),
            },
            (false, None) => Outcome::Refused,
        }
    }
}
