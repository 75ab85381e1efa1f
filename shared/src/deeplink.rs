//! The `goconnect://` deep-link scheme.
//!
//! Links select an action through the URL host, carry the primary target in
//! the path, and pass action-specific parameters in the query string:
//!
//! ```text
//! goconnect://join/<invite-code>
//! goconnect://network/<network-id>
//! goconnect://connect/<peer-id>
//! goconnect://login?token=<jwt>&server=<url>
//! ```

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};
use url::Url;

pub const SCHEME: &str = "goconnect";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Login,
    Join,
    Network,
    Connect,
    /// An unrecognized action, with the raw host echoed back.
    Unknown(String),
}

impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "login" => Self::Login,
            "join" => Self::Join,
            "network" => Self::Network,
            "connect" => Self::Connect,
            other => Self::Unknown(other.to_string()),
        })
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Login => f.write_str("login"),
            Self::Join => f.write_str("join"),
            Self::Network => f.write_str("network"),
            Self::Connect => f.write_str("connect"),
            Self::Unknown(other) => f.write_str(other),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvalidDeepLink {
    WrongScheme,
    MissingAction,
    Malformed,
}

impl std::error::Error for InvalidDeepLink {}

impl Display for InvalidDeepLink {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongScheme => write!(f, "URL scheme is not \"{SCHEME}\""),
            Self::MissingAction => f.write_str("URL has no action host"),
            Self::Malformed => f.write_str("URL failed to parse"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeepLink {
    pub action: Action,
    /// The primary target (invite code, network id, peer id). Multi-segment
    /// paths are accepted verbatim.
    pub target: String,
    pub params: Vec<(String, String)>,
}

impl DeepLink {
    pub fn new(action: Action, target: impl Into<String>) -> Self {
        Self {
            action,
            target: target.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn parse(input: &str) -> Result<Self, InvalidDeepLink> {
        let url = Url::parse(input).map_err(|_| InvalidDeepLink::Malformed)?;
        if url.scheme() != SCHEME {
            return Err(InvalidDeepLink::WrongScheme);
        }
        let action = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or(InvalidDeepLink::MissingAction)?
            .parse()
            .expect("action parsing is infallible");

        let target = url.path().trim_start_matches('/').to_string();
        let params = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Ok(Self {
            action,
            target,
            params,
        })
    }

    pub fn to_url(&self) -> String {
        let mut out = format!("{}://{}", SCHEME, self.action);
        if !self.target.is_empty() {
            out.push('/');
            out.push_str(&self.target);
        }
        if !self.params.is_empty() {
            let mut query = url::form_urlencoded::Serializer::new(String::new());
            for (key, value) in &self.params {
                query.append_pair(key, value);
            }
            out.push('?');
            out.push_str(&query.finish());
        }
        out
    }
}

impl FromStr for DeepLink {
    type Err = InvalidDeepLink;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for DeepLink {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_actions() {
        let link = DeepLink::parse("goconnect://join/AbCd1234").unwrap();
        assert_eq!(link.action, Action::Join);
        assert_eq!(link.target, "AbCd1234");
        assert!(link.params.is_empty());

        let link = DeepLink::parse("goconnect://network/42").unwrap();
        assert_eq!(link.action, Action::Network);
        assert_eq!(link.target, "42");

        let link = DeepLink::parse("goconnect://connect/7").unwrap();
        assert_eq!(link.action, Action::Connect);
    }

    #[test]
    fn test_parse_login_params() {
        let link = DeepLink::parse("goconnect://login?token=abc.def.ghi&server=https://gc.example.com").unwrap();
        assert_eq!(link.action, Action::Login);
        assert_eq!(link.target, "");
        assert_eq!(link.param_value("token"), Some("abc.def.ghi"));
        assert_eq!(link.param_value("server"), Some("https://gc.example.com"));
    }

    #[test]
    fn test_unknown_action_echoes_host() {
        let link = DeepLink::parse("goconnect://frobnicate/1").unwrap();
        assert_eq!(link.action, Action::Unknown("frobnicate".to_string()));
    }

    #[test]
    fn test_multi_segment_target_is_kept_verbatim() {
        let link = DeepLink::parse("goconnect://join/a/b/c").unwrap();
        assert_eq!(link.target, "a/b/c");
    }

    #[test]
    fn test_wrong_scheme() {
        assert_eq!(
            DeepLink::parse("https://join/abc"),
            Err(InvalidDeepLink::WrongScheme)
        );
        assert_eq!(DeepLink::parse("not a url"), Err(InvalidDeepLink::Malformed));
    }

    #[test]
    fn test_build_parse_roundtrip() {
        let original = DeepLink::new(Action::Login, "")
            .param("token", "abc.def.ghi")
            .param("server", "https://gc.example.com:8443");
        let reparsed = DeepLink::parse(&original.to_url()).unwrap();
        assert_eq!(reparsed, original);

        let original = DeepLink::new(Action::Join, "a/b/c");
        assert_eq!(original.to_url(), "goconnect://join/a/b/c");
        assert_eq!(DeepLink::parse(&original.to_url()).unwrap(), original);
    }
}
