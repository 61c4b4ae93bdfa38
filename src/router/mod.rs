// src/router/mod.rs
// Turn routing: pick the route/model/domain that should handle a request

pub mod fastpath;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::providers::ProviderMap;

/// A routing decision for one user turn. Persisted as JSON on both the
/// user and assistant messages so reloads can show how the turn ran.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterDecision {
    pub route: String,
    pub available_routes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_needed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fastpath_params: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RouterDecision {
    pub fn direct(route: &str) -> Self {
        Self {
            route: route.to_string(),
            available_routes: available_route_names(),
            execution_type: Some("async".to_string()),
            ..Default::default()
        }
    }

    /// Domain routes (everything that is not `direct` with a domain id)
    /// are dispatched through the domain executor.
    pub fn is_domain_execution(&self) -> bool {
        self.domain_id.is_some() && self.route != "direct"
    }
}

/// Route catalog: capability routes answered natively, the `direct`
/// fastpath, single-domain routes, and orchestration routes.
pub const AVAILABLE_ROUTES: [(&str, &str); 10] = [
    ("general_conversation", "Q&A, advice, explanations, discussions"),
    ("creative_writing", "Stories, poems, marketing copy"),
    ("math_reasoning", "Math problems, proofs, calculations"),
    ("code_reasoning", "Code review and analysis without execution"),
    ("direct", "Single tool call with immediate execution"),
    ("web_researcher", "Web search and information gathering"),
    ("coder", "Multi-step software development in a workspace"),
    ("data_processor", "Data transformation and API operations"),
    ("multi_domain", "Multi-domain orchestration with planning"),
    ("iterative", "Generate-evaluate-refine loops"),
];

pub fn available_route_names() -> Vec<String> {
    AVAILABLE_ROUTES
        .iter()
        .map(|(name, _)| name.to_string())
        .collect()
}

/// Which model serves each route when the router does not defer to the
/// caller's choice.
pub fn route_model(route: &str) -> Option<&'static str> {
    match route {
        "creative_writing" => Some("moonshotai/kimi-k2"),
        "math_reasoning" | "code_reasoning" | "iterative" => Some("google/gemini-2.5-pro"),
        "general_conversation" | "direct" | "web_researcher" | "coder" | "data_processor"
        | "multi_domain" => Some("google/gemini-2.5-flash"),
        _ => None,
    }
}

fn route_domain(route: &str) -> Option<&'static str> {
    match route {
        "coder" => Some("coder"),
        "web_researcher" => Some("web"),
        "data_processor" => Some("data"),
        _ => None,
    }
}

/// Lightweight request classifier. The upstream system uses a small model
/// call here; the classifier keeps the same output contract so a model
///-backed implementation can drop in behind it.
pub struct ModelRouter {
    providers: ProviderMap,
}

impl ModelRouter {
    pub fn new(providers: ProviderMap) -> Self {
        Self { providers }
    }

    pub fn route_request(&self, message: &str, _history_len: usize) -> RouterDecision {
        let route = classify(message);
        let model = route_model(route).map(|m| m.to_string());
        let provider = model
            .as_deref()
            .and_then(|m| self.providers.infer_provider_for_model(m));
        let domain_id = route_domain(route).map(|d| d.to_string());

        let decision = RouterDecision {
            route: route.to_string(),
            available_routes: available_route_names(),
            provider,
            model,
            domain_id: domain_id.clone(),
            execution_type: Some(if domain_id.is_some() { "domain" } else { "async" }.to_string()),
            tools_needed: Some(domain_id.is_some() || route == "direct"),
            fastpath_params: None,
            error: None,
        };

        info!(
            route = %decision.route,
            model = decision.model.as_deref().unwrap_or("-"),
            domain = decision.domain_id.as_deref().unwrap_or("-"),
            "Router decision"
        );
        decision
    }
}

fn classify(message: &str) -> &'static str {
    let lower = message.to_lowercase();

    let coder_markers = [
        "refactor", "debug", "fix the bug", "write a test", "implement", "run the tests",
        "compile", "edit the file", "create a file",
    ];
    if coder_markers.iter().any(|m| lower.contains(m)) {
        return "coder";
    }

    let research_markers = ["search the web", "latest news", "look up", "research", "find sources"];
    if research_markers.iter().any(|m| lower.contains(m)) {
        return "web_researcher";
    }

    let data_markers = ["convert this csv", "parse this json", "transform the data"];
    if data_markers.iter().any(|m| lower.contains(m)) {
        return "data_processor";
    }

    if lower.contains("write a story") || lower.contains("write a poem") {
        return "creative_writing";
    }

    let math_markers = ["solve", "prove", "calculate", "integral", "derivative"];
    if math_markers.iter().any(|m| lower.contains(m)) {
        return "math_reasoning";
    }

    "general_conversation"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coder_requests_route_to_the_coder_domain() {
        let router = ModelRouter::new(ProviderMap::default());
        let decision = router.route_request("please refactor the parser module", 0);
        assert_eq!(decision.route, "coder");
        assert_eq!(decision.domain_id.as_deref(), Some("coder"));
        assert!(decision.is_domain_execution());
    }

    #[test]
    fn plain_questions_stay_direct() {
        let router = ModelRouter::new(ProviderMap::default());
        let decision = router.route_request("what is the capital of France?", 0);
        assert_eq!(decision.route, "general_conversation");
        assert!(!decision.is_domain_execution());
    }

    #[test]
    fn every_route_has_catalog_coverage() {
        for (route, _) in AVAILABLE_ROUTES {
            assert!(
                route_model(route).is_some(),
                "route {route} is missing a model mapping"
            );
        }
    }
}
