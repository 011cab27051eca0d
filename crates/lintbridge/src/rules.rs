//! Rule metadata resolver.
//!
//! Diagnostics only carry a rule code; the description, category and severity
//! come from a code-action request per rule. Lookups are deduplicated:
//! - a cached rule answers immediately
//! - the first waiter for an uncached rule issues the only request for it
//! - later waiters queue behind it and are all released by that response
//!
//! A single response may describe several rules; every rule in it is cached
//! and its queued waiters released, whether or not it was the one requested.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::bridge::protocol::{Diagnostic, methods};
use crate::rpc::RpcClient;

/// Descriptive detail about one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDetails {
    pub code: String,
    pub description: String,
    /// Formatted (HTML) rule documentation.
    pub html: String,
    #[serde(rename = "type")]
    pub category: String,
    pub severity: String,
}

impl RuleDetails {
    /// Build from the positional argument tuple
    /// `(code, description, html, type, severity)`.
    fn from_arguments(arguments: &Value) -> Option<Self> {
        let [code, description, html, category, severity, ..] = arguments.as_array()?.as_slice()
        else {
            return None;
        };
        let code = text(code);
        if code.is_empty() {
            return None;
        }
        Some(Self {
            code,
            description: text(description),
            html: text(html),
            category: text(category),
            severity: text(severity),
        })
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Extract rule details from a `textDocument/codeAction` result.
///
/// Accepts bare `Command` entries and `CodeAction` entries wrapping one.
/// Entries without a rule-details argument tuple are skipped.
pub fn parse_rule_details(result: &Value) -> Vec<RuleDetails> {
    let Some(entries) = result.as_array() else {
        if !result.is_null() {
            tracing::warn!("Code action result is not a list");
        }
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let arguments = entry
                .get("arguments")
                .or_else(|| entry.get("command").and_then(|c| c.get("arguments")));
            let details = arguments.and_then(RuleDetails::from_arguments);
            if details.is_none() {
                tracing::debug!(%entry, "Skipping code action without rule details");
            }
            details
        })
        .collect()
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RuleError {
    #[error("engine response did not describe rule {0}")]
    Missing(String),
    #[error("rule metadata request for {rule} failed: {reason}")]
    Request { rule: String, reason: String },
}

type Waiter = oneshot::Sender<Result<RuleDetails, RuleError>>;

#[derive(Default)]
struct ResolverState {
    cache: HashMap<String, RuleDetails>,
    waiting: HashMap<String, Vec<Waiter>>,
}

#[derive(Clone)]
pub struct RuleResolver {
    rpc: RpcClient,
    state: Arc<StdMutex<ResolverState>>,
}

impl RuleResolver {
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            rpc,
            state: Arc::new(StdMutex::new(ResolverState::default())),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ResolverState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Rule resolver mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn cached(&self, rule: &str) -> Option<RuleDetails> {
        self.lock_state().cache.get(rule).cloned()
    }

    /// Number of rules with a metadata request in flight.
    pub fn in_flight(&self) -> usize {
        self.lock_state().waiting.len()
    }

    /// Metadata for `rule`, as reported for `diagnostic` in the file at `uri`.
    pub async fn resolve(
        &self,
        rule: &str,
        uri: &str,
        diagnostic: &Diagnostic,
    ) -> Result<RuleDetails, RuleError> {
        let (rx, first) = {
            let mut state = self.lock_state();
            if let Some(details) = state.cache.get(rule) {
                return Ok(details.clone());
            }
            let (tx, rx) = oneshot::channel();
            let waiters = state.waiting.entry(rule.to_string()).or_default();
            waiters.push(tx);
            (rx, waiters.len() == 1)
        };

        if first {
            self.spawn_request(rule.to_string(), uri, diagnostic);
        } else {
            tracing::trace!(rule, "Queued behind in-flight rule request");
        }

        rx.await
            .unwrap_or_else(|_| Err(RuleError::Missing(rule.to_string())))
    }

    fn spawn_request(&self, rule: String, uri: &str, diagnostic: &Diagnostic) {
        let params = json!({
            "textDocument": {"uri": uri},
            "range": diagnostic.range,
            "context": {"diagnostics": [diagnostic]},
        });
        let resolver = self.clone();

        tokio::spawn(async move {
            tracing::debug!(%rule, "Requesting rule metadata");
            match resolver.rpc.request(methods::CODE_ACTION, params).await {
                Ok(result) => resolver.on_rule_details(&rule, &result),
                Err(e) => {
                    tracing::warn!(%rule, error = %e, "Rule metadata request failed");
                    resolver.release(
                        &rule,
                        RuleError::Request {
                            rule: rule.clone(),
                            reason: e.to_string(),
                        },
                    );
                }
            }
        });
    }

    fn on_rule_details(&self, requested: &str, result: &Value) {
        let details = parse_rule_details(result);
        {
            let mut state = self.lock_state();
            for detail in details {
                let detail = state
                    .cache
                    .entry(detail.code.clone())
                    .or_insert(detail)
                    .clone();
                let waiters = state.waiting.remove(&detail.code).unwrap_or_default();
                tracing::debug!(rule = %detail.code, waiters = waiters.len(), "Resolved rule");
                for waiter in waiters {
                    let _ = waiter.send(Ok(detail.clone()));
                }
            }
        }

        if self.lock_state().waiting.contains_key(requested) {
            tracing::warn!(rule = requested, "Engine response did not describe the requested rule");
            self.release(requested, RuleError::Missing(requested.to_string()));
        }
    }

    /// Fail every waiter queued for `rule` and forget the queue entry.
    fn release(&self, rule: &str, error: RuleError) {
        let waiters = self.lock_state().waiting.remove(rule).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Position, Range};
    use crate::testing::{connected, rule_command};
    use std::time::Duration;

    fn diagnostic(code: &str) -> Diagnostic {
        serde_json::from_value(json!({
            "range": {
                "start": {"line": 3, "character": 4},
                "end": {"line": 3, "character": 9}
            },
            "code": code,
            "message": "issue"
        }))
        .unwrap()
    }

    #[test]
    fn parses_command_and_code_action_shapes() {
        let result = json!([
            rule_command("python:S1481"),
            {"title": "Deactivate rule", "command": "SonarLint.DeactivateRule", "arguments": ["python:S1481"]},
            {"title": "Wrapped", "kind": "quickfix", "command": rule_command("python:S117")},
        ]);

        let details = parse_rule_details(&result);

        assert_eq!(details.len(), 2);
        assert_eq!(details[0].code, "python:S1481");
        assert_eq!(details[1].code, "python:S117");
        insta::assert_json_snapshot!(details[0], @r#"
        {
          "code": "python:S1481",
          "description": "Description of python:S1481",
          "html": "<p>Details for python:S1481</p>",
          "type": "CODE_SMELL",
          "severity": "MAJOR"
        }
        "#);
    }

    #[test]
    fn non_list_result_yields_nothing() {
        assert!(parse_rule_details(&Value::Null).is_empty());
        assert!(parse_rule_details(&json!({"unexpected": true})).is_empty());
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_request() {
        let (mut acceptor, client, mut engine) = connected().await;
        let resolver = RuleResolver::new(client);

        let mut lookups = Vec::new();
        for _ in 0..5 {
            let resolver = resolver.clone();
            lookups.push(tokio::spawn(async move {
                resolver
                    .resolve("S001", "file:///a.py", &diagnostic("S001"))
                    .await
            }));
        }

        let req = engine.expect_request(methods::CODE_ACTION).await;
        assert_eq!(req["params"]["textDocument"]["uri"], "file:///a.py");
        assert_eq!(req["params"]["range"]["start"]["line"], 3);
        assert_eq!(req["params"]["context"]["diagnostics"][0]["code"], "S001");

        // Let every lookup queue up before answering.
        while resolver.lock_state().waiting.get("S001").map_or(0, Vec::len) < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        engine
            .respond(&req["id"], json!([rule_command("S001")]))
            .await;

        for lookup in lookups {
            let details = lookup.await.unwrap().unwrap();
            assert_eq!(details.code, "S001");
            assert_eq!(details.severity, "MAJOR");
        }
        assert!(
            engine
                .recv_within(Duration::from_millis(50))
                .await
                .is_none()
        );
        assert_eq!(resolver.in_flight(), 0);
        acceptor.stop().await;
    }

    #[tokio::test]
    async fn cached_rule_resolves_without_request() {
        let (mut acceptor, client, mut engine) = connected().await;
        let resolver = RuleResolver::new(client);

        let first = tokio::spawn({
            let resolver = resolver.clone();
            async move { resolver.resolve("S002", "file:///a.py", &diagnostic("S002")).await }
        });
        let req = engine.expect_request(methods::CODE_ACTION).await;
        engine.respond(&req["id"], json!([rule_command("S002")])).await;
        first.await.unwrap().unwrap();

        let again = resolver
            .resolve("S002", "file:///b.py", &diagnostic("S002"))
            .await
            .unwrap();

        assert_eq!(again.code, "S002");
        assert!(
            engine
                .recv_within(Duration::from_millis(50))
                .await
                .is_none()
        );
        acceptor.stop().await;
    }

    #[tokio::test]
    async fn batched_response_releases_other_rules() {
        let (mut acceptor, client, mut engine) = connected().await;
        let resolver = RuleResolver::new(client);

        let a = tokio::spawn({
            let resolver = resolver.clone();
            async move { resolver.resolve("S100", "file:///a.py", &diagnostic("S100")).await }
        });
        let req_a = engine.expect_request(methods::CODE_ACTION).await;
        let b = tokio::spawn({
            let resolver = resolver.clone();
            async move { resolver.resolve("S200", "file:///a.py", &diagnostic("S200")).await }
        });
        let req_b = engine.expect_request(methods::CODE_ACTION).await;

        // First response describes both rules plus one nobody asked for.
        engine
            .respond(
                &req_a["id"],
                json!([rule_command("S100"), rule_command("S200"), rule_command("S300")]),
            )
            .await;

        assert_eq!(a.await.unwrap().unwrap().code, "S100");
        assert_eq!(b.await.unwrap().unwrap().code, "S200");
        assert!(resolver.cached("S300").is_some());

        // The late answer for S200 finds no waiters and is simply cached.
        engine.respond(&req_b["id"], json!([rule_command("S200")])).await;
        acceptor.stop().await;
    }

    #[tokio::test]
    async fn response_without_requested_rule_fails_waiters() {
        let (mut acceptor, client, mut engine) = connected().await;
        let resolver = RuleResolver::new(client);

        let lookup = tokio::spawn({
            let resolver = resolver.clone();
            async move { resolver.resolve("S404", "file:///a.py", &diagnostic("S404")).await }
        });
        let req = engine.expect_request(methods::CODE_ACTION).await;
        engine.respond(&req["id"], json!([])).await;

        let err = lookup.await.unwrap().unwrap_err();
        assert!(matches!(err, RuleError::Missing(rule) if rule == "S404"));
        assert_eq!(resolver.in_flight(), 0);
        assert!(resolver.cached("S404").is_none());
        acceptor.stop().await;
    }

    #[test]
    fn range_is_forwarded_verbatim() {
        let d = diagnostic("S1");
        assert_eq!(
            d.range,
            Range {
                start: Position {
                    line: 3,
                    character: 4
                },
                end: Position {
                    line: 3,
                    character: 9
                },
            }
        );
    }
}
