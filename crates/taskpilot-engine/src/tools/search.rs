//! Web search handler for contact research.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use taskpilot_core::types::ActionKind;

use crate::error::ToolError;
use crate::tools::{
    contact_update, extract_phone_numbers, parse_args, require_non_empty, RiskClass,
    ToolContext, ToolDescriptor, ToolHandler, ToolOutput,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WebSearchArgs {
    query: String,
}

pub struct WebSearchHandler {
    timeout: Duration,
}

impl WebSearchHandler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ToolHandler for WebSearchHandler {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            action: ActionKind::WebSearch,
            risk: RiskClass::Informational,
            idempotent: true,
            timeout: self.timeout,
        }
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        let args: WebSearchArgs = parse_args(args)?;
        require_non_empty("query", &args.query)
    }

    fn describe(&self, args: &Value) -> String {
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("?");
        format!("Search the web for \"{}\"", query)
    }

    async fn invoke(&self, args: &Value, ctx: &ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        let args: WebSearchArgs = parse_args(args)?;
        let mut results = ctx.collaborators.search.search(&args.query).await?;
        results.sort_by_key(|r| r.rank);

        let invalid = ctx.working.var_list("invalid_contacts");
        let mut candidates: Vec<String> = Vec::new();
        for result in &results {
            for number in extract_phone_numbers(&result.snippet, &invalid) {
                if !candidates.contains(&number) {
                    candidates.push(number);
                }
            }
        }

        let mut context = json!({"contact_candidates": candidates});
        if let Some(number) = contact_update(ctx.working, &candidates) {
            context["contact_number"] = json!(number);
            context["contact_source"] = json!("web_search");
        }

        let top: Vec<Value> = results
            .iter()
            .take(5)
            .map(|r| json!({"url": r.url, "rank": r.rank}))
            .collect();
        Ok(ToolOutput::new(
            json!({
                "query": args.query,
                "results": top,
                "phone_numbers": candidates,
            }),
            context,
        )
        .with_units(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{CollaboratorError, SearchResult};
    use crate::testing::{tool_fixture, ToolFixture};

    #[tokio::test]
    async fn test_search_extracts_ranked_candidates() {
        let ToolFixture {
            memory,
            task,
            user,
            working,
            fakes,
        } = tool_fixture();
        fakes.search.set_results(vec![
            SearchResult {
                url: "https://example.com/b".into(),
                snippet: "Billing: 888-555-1234".into(),
                rank: 2,
            },
            SearchResult {
                url: "https://example.com/a".into(),
                snippet: "Customer service 1-800-934-6489, open 24/7".into(),
                rank: 1,
            },
        ]);
        let collaborators = fakes.collaborators();
        let ctx = ToolContext {
            task: &task,
            user: &user,
            working: &working,
            memory: &memory,
            collaborators: &collaborators,
        };

        let handler = WebSearchHandler::new(Duration::from_secs(5));
        let out = handler
            .invoke(&json!({"query": "Comcast customer service phone number"}), &ctx)
            .await
            .unwrap();
        assert_eq!(
            out.result["phone_numbers"],
            json!(["1-800-934-6489", "888-555-1234"])
        );
        assert_eq!(out.context["contact_number"], "1-800-934-6489");
        assert_eq!(out.usage.units, 1.0);
        assert_eq!(
            fakes.search.queries(),
            vec!["Comcast customer service phone number".to_string()]
        );
    }

    #[tokio::test]
    async fn test_search_without_numbers_sets_no_contact() {
        let ToolFixture {
            memory,
            task,
            user,
            working,
            fakes,
        } = tool_fixture();
        fakes.search.set_results(vec![SearchResult {
            url: "https://example.com".into(),
            snippet: "Visit our help center".into(),
            rank: 1,
        }]);
        let collaborators = fakes.collaborators();
        let ctx = ToolContext {
            task: &task,
            user: &user,
            working: &working,
            memory: &memory,
            collaborators: &collaborators,
        };

        let out = WebSearchHandler::new(Duration::from_secs(5))
            .invoke(&json!({"query": "acme phone"}), &ctx)
            .await
            .unwrap();
        assert!(out.context.get("contact_number").is_none());
        assert_eq!(out.context["contact_candidates"], json!([]));
    }

    #[tokio::test]
    async fn test_search_error_maps_to_external_service() {
        let ToolFixture {
            memory,
            task,
            user,
            working,
            fakes,
        } = tool_fixture();
        fakes
            .search
            .fail_with(CollaboratorError::Transient("upstream 503".into()));
        let collaborators = fakes.collaborators();
        let ctx = ToolContext {
            task: &task,
            user: &user,
            working: &working,
            memory: &memory,
            collaborators: &collaborators,
        };

        let err = WebSearchHandler::new(Duration::from_secs(5))
            .invoke(&json!({"query": "acme phone"}), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
