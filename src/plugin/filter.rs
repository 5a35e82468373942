//! URL filtering plugin
//!
//! Matches `http://host:port/path` for each request against an ordered rule list
//! and rejects the first match with the rule's status code.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use regex::Regex;
use serde::Deserialize;
use tracing::info;

use super::{HttpProxyPlugin, RequestDecision};
use crate::error::{ProxyError, Result};
use crate::http::{HttpParser, Rejection};

/// Rule as written in a rules file
#[derive(Debug, Clone, Deserialize)]
struct RuleSpec {
    regex: String,
    status_code: u16,
    #[serde(default)]
    notes: String,
}

/// A compiled filter rule
#[derive(Debug, Clone)]
pub struct FilterRule {
    pub pattern: Regex,
    pub status: StatusCode,
    pub notes: String,
}

impl FilterRule {
    pub fn new(regex: &str, status_code: u16, notes: impl Into<String>) -> Result<Self> {
        let pattern = Regex::new(regex)
            .map_err(|e| ProxyError::InvalidConfig(format!("invalid filter regex {regex:?}: {e}")))?;
        let status = StatusCode::from_u16(status_code).map_err(|_| {
            ProxyError::InvalidConfig(format!("invalid filter status code {status_code}"))
        })?;
        Ok(Self {
            pattern,
            status,
            notes: notes.into(),
        })
    }
}

/// Ordered rule list, shared by every plugin instance
#[derive(Debug, Clone, Default)]
pub struct FilterRules {
    rules: Vec<FilterRule>,
}

impl FilterRules {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self { rules }
    }

    /// Block Google image ads with 444
    pub fn default_rules() -> Result<Self> {
        Ok(Self::new(vec![FilterRule::new(
            r"https{0,1}://tpc.googlesyndication.com:\d{1,5}/simgad/.*",
            444,
            "Google image ads",
        )?]))
    }

    /// Parse a JSON array of `{ "regex", "status_code", "notes" }` objects
    pub fn from_json(json: &str) -> Result<Self> {
        let specs: Vec<RuleSpec> = serde_json::from_str(json)
            .map_err(|e| ProxyError::InvalidConfig(format!("invalid filter rules: {e}")))?;
        specs
            .into_iter()
            .map(|spec| FilterRule::new(&spec.regex, spec.status_code, spec.notes))
            .collect::<Result<Vec<_>>>()
            .map(Self::new)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::InvalidConfig(format!("cannot read filter rules {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule matching `url`, with its 1-based rule number
    pub fn first_match(&self, url: &str) -> Option<(usize, &FilterRule)> {
        self.rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.pattern.is_match(url))
            .map(|(index, rule)| (index + 1, rule))
    }
}

pub struct FilterByUrlRegexPlugin {
    rules: Arc<FilterRules>,
}

impl FilterByUrlRegexPlugin {
    pub fn new(rules: Arc<FilterRules>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl HttpProxyPlugin for FilterByUrlRegexPlugin {
    fn name(&self) -> &'static str {
        "filter_by_url_regex"
    }

    async fn handle_client_request(&self, request: HttpParser) -> RequestDecision {
        let url = request.url();
        let method = request.method().map(|m| m.as_str()).unwrap_or("-");
        info!(method, url = %url, "Client request");

        if let Some((number, rule)) = self.rules.first_match(&url) {
            info!(
                url = %url,
                status = rule.status.as_u16(),
                rule = number,
                notes = %rule.notes,
                "Blocked by rule number {}",
                number
            );
            return RequestDecision::Reject(
                Rejection::new(rule.status).with_header("Connection", "close"),
            );
        }
        RequestDecision::Forward(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ParserLimits;

    fn request(raw: &[u8]) -> HttpParser {
        let mut parser = HttpParser::request(ParserLimits::default());
        parser.feed(raw).unwrap();
        parser
    }

    fn plugin(rules: FilterRules) -> FilterByUrlRegexPlugin {
        FilterByUrlRegexPlugin::new(Arc::new(rules))
    }

    #[tokio::test]
    async fn test_default_rule_blocks_image_ads() {
        let mut filter = plugin(FilterRules::default_rules().unwrap());
        let req = request(b"GET http://tpc.googlesyndication.com/simgad/12345 HTTP/1.1\r\nHost: tpc.googlesyndication.com\r\n\r\n");

        match filter.handle_client_request(req).await {
            RequestDecision::Reject(rejection) => {
                assert_eq!(rejection.status().as_u16(), 444);
                assert_eq!(
                    rejection.to_bytes(),
                    b"HTTP/1.1 444 \r\nConnection: close\r\n\r\n"
                );
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_matching_request_forwarded() {
        let mut filter = plugin(FilterRules::default_rules().unwrap());
        let req = request(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert!(matches!(
            filter.handle_client_request(req).await,
            RequestDecision::Forward(_)
        ));
    }

    #[tokio::test]
    async fn test_before_upstream_connection_passes_through() {
        let mut filter = plugin(FilterRules::default_rules().unwrap());
        let req = request(b"GET http://tpc.googlesyndication.com/simgad/1 HTTP/1.1\r\n\r\n");
        assert!(matches!(
            filter.before_upstream_connection(req).await,
            RequestDecision::Forward(_)
        ));
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rules = FilterRules::from_json(
            r#"[
                {"regex": "example\\.com:\\d+/ads/", "status_code": 403, "notes": "ads"},
                {"regex": "example\\.com", "status_code": 451}
            ]"#,
        )
        .unwrap();
        assert_eq!(rules.len(), 2);

        let (number, rule) = rules.first_match("http://example.com:80/ads/banner").unwrap();
        assert_eq!(number, 1);
        assert_eq!(rule.status, StatusCode::FORBIDDEN);

        let (number, rule) = rules.first_match("http://example.com:80/").unwrap();
        assert_eq!(number, 2);
        assert_eq!(rule.notes, "");

        assert!(rules.first_match("http://other.org:80/").is_none());
    }

    #[test]
    fn test_invalid_rules_rejected() {
        assert!(matches!(
            FilterRules::from_json(r#"[{"regex": "(", "status_code": 403}]"#),
            Err(ProxyError::InvalidConfig(_))
        ));
        assert!(matches!(
            FilterRules::from_json(r#"[{"regex": "a", "status_code": 42}]"#),
            Err(ProxyError::InvalidConfig(_))
        ));
        assert!(matches!(
            FilterRules::from_json("not json"),
            Err(ProxyError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rules_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, r#"[{"regex": "blocked\\.test", "status_code": 444}]"#).unwrap();

        let rules = FilterRules::from_file(&path).unwrap();
        assert!(rules.first_match("http://blocked.test:80/").is_some());
        assert!(FilterRules::from_file(&dir.path().join("missing.json")).is_err());
    }
}
