//! Rule-driven header injection
//!
//! Rules select traffic by user agent and host, then set, append to, or
//! remove request headers and set response headers. Rules are plain data,
//! loaded from JSON, so the handler carries no hard-coded values.

use std::collections::BTreeMap;
use std::path::Path;

use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{InterposeError, Result};
use crate::proxy::chain::FlowHandler;
use crate::proxy::flow::Flow;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteRule {
    pub name: String,
    /// Case-insensitive substring of the `User-Agent` header
    pub match_user_agent: Option<String>,
    /// Exact host or any subdomain of it
    pub match_host: Option<String>,
    /// Prefix of the upstream response `Content-Type`; gates `set_response_headers`
    pub match_response_content_type: Option<String>,
    pub set_request_headers: BTreeMap<String, String>,
    /// Suffix appended to a header's value only when the header is present
    pub append_request_headers: BTreeMap<String, String>,
    pub remove_request_headers: Vec<String>,
    pub set_response_headers: BTreeMap<String, String>,
}

/// Values substituted for `{device_id}` and `{machine_id}` in header values
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    pub device_id: String,
    pub machine_id: String,
}

impl TemplateVars {
    fn render(&self, value: &str) -> String {
        value
            .replace("{device_id}", &self.device_id)
            .replace("{machine_id}", &self.machine_id)
    }
}

#[derive(Debug)]
struct CompiledRule {
    tag: String,
    user_agent: Option<String>,
    host: Option<String>,
    response_content_type: Option<String>,
    set: Vec<(HeaderName, HeaderValue)>,
    append: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
    set_response: Vec<(HeaderName, HeaderValue)>,
}

impl CompiledRule {
    fn compile(index: usize, rule: &RewriteRule, vars: &TemplateVars) -> Result<Self> {
        let name = if rule.name.is_empty() {
            format!("rule-{}", index)
        } else {
            rule.name.clone()
        };

        let pairs = |map: &BTreeMap<String, String>| -> Result<Vec<(HeaderName, HeaderValue)>> {
            map.iter()
                .map(|(k, v)| Ok((header_name(&name, k)?, header_value(&name, &vars.render(v))?)))
                .collect()
        };

        Ok(Self {
            tag: format!("rewrite:{}", name),
            user_agent: rule.match_user_agent.as_ref().map(|s| s.to_lowercase()),
            host: rule
                .match_host
                .as_ref()
                .map(|s| s.trim_end_matches('.').to_lowercase()),
            response_content_type: rule
                .match_response_content_type
                .as_ref()
                .map(|s| s.to_lowercase()),
            set: pairs(&rule.set_request_headers)?,
            append: pairs(&rule.append_request_headers)?,
            remove: rule
                .remove_request_headers
                .iter()
                .map(|k| header_name(&name, k))
                .collect::<Result<_>>()?,
            set_response: pairs(&rule.set_response_headers)?,
        })
    }

    fn matches_request(&self, flow: &Flow) -> bool {
        if let Some(pattern) = &self.user_agent {
            let ua = flow.user_agent().unwrap_or("").to_lowercase();
            if !ua.contains(pattern.as_str()) {
                return false;
            }
        }

        if let Some(pattern) = &self.host {
            let host = flow.host.trim_end_matches('.').to_lowercase();
            let subdomain = host
                .strip_suffix(pattern.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'));
            if host != *pattern && !subdomain {
                return false;
            }
        }

        true
    }

    fn matches_response(&self, flow: &Flow) -> bool {
        let Some(pattern) = &self.response_content_type else {
            return true;
        };
        flow.response
            .as_ref()
            .and_then(|r| r.headers.get(CONTENT_TYPE))
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.to_lowercase().starts_with(pattern.as_str()))
    }
}

fn header_name(rule: &str, name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
        InterposeError::InvalidConfig(format!("rule '{}': invalid header name '{}'", rule, name))
    })
}

fn header_value(rule: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| {
        InterposeError::InvalidConfig(format!("rule '{}': invalid header value for '{}'", rule, value))
    })
}

pub struct HeaderRewriteHandler {
    rules: Vec<CompiledRule>,
}

impl HeaderRewriteHandler {
    /// Validate and compile `rules`; bad header names or values are config errors
    pub fn new(rules: &[RewriteRule], vars: &TemplateVars) -> Result<Self> {
        let rules = rules
            .iter()
            .enumerate()
            .map(|(i, rule)| CompiledRule::compile(i, rule, vars))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Load rules from a JSON array
    pub fn from_file(path: &Path, vars: &TemplateVars) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let rules: Vec<RewriteRule> = serde_json::from_str(&raw).map_err(|e| {
            InterposeError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;

        info!(path = %path.display(), rules = rules.len(), "Loaded header rewrite rules");
        Self::new(&rules, vars)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl FlowHandler for HeaderRewriteHandler {
    fn name(&self) -> &str {
        "header-rewrite"
    }

    fn on_request(&self, flow: &mut Flow) -> Result<()> {
        for rule in &self.rules {
            if !rule.matches_request(flow) {
                continue;
            }
            for name in &rule.remove {
                flow.headers.remove(name);
            }
            for (name, value) in &rule.set {
                flow.headers.insert(name.clone(), value.clone());
            }
            for (name, suffix) in &rule.append {
                let Some(current) = flow.headers.get(name) else {
                    continue;
                };
                let combined = [current.as_bytes(), suffix.as_bytes()].concat();
                let value = HeaderValue::from_bytes(&combined).map_err(|e| {
                    InterposeError::InvalidRequest(format!("cannot extend {}: {}", name, e))
                })?;
                flow.headers.insert(name.clone(), value);
            }

            debug!(flow_id = %flow.id, tag = %rule.tag, host = %flow.host, "Rewrote request headers");
            flow.tags.push(rule.tag.clone());
        }
        Ok(())
    }

    fn on_response(&self, flow: &mut Flow) -> Result<()> {
        for rule in &self.rules {
            if rule.set_response.is_empty() || !flow.has_tag(&rule.tag) || !rule.matches_response(flow) {
                continue;
            }
            if let Some(response) = flow.response.as_mut() {
                for (name, value) in &rule.set_response {
                    response.headers.insert(name.clone(), value.clone());
                }
            }
        }
        Ok(())
    }
}
