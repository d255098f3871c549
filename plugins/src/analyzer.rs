use std::collections::BTreeSet;

use async_trait::async_trait;
use harvest_core::api::{
    AnalysisContext, AnalysisResult, AnalysisServiceConfig, AnalyzerPlugin, ClassifiedError,
};
use regex::Regex;
use serde::Serialize;

use crate::http::{build_client, from_reqwest, parse_json_response};

const POSITIVE: &[&str] = &[
    "good", "great", "love", "happy", "thanks", "excellent", "safe", "win", "helpful", "nice",
];
const NEGATIVE: &[&str] = &[
    "bad", "terrible", "hate", "angry", "broken", "fire", "accident", "delay", "unsafe", "worst",
];
const DEFAULT_EVENT_TYPE: &str = "general";

/// Local heuristic: hashtags become keywords, a small lexicon scores
/// sentiment and the first category named in the text is the event type.
pub struct KeywordAnalyzerPlugin {
    hashtag: Regex,
    word: Regex,
}

impl KeywordAnalyzerPlugin {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            hashtag: Regex::new(r"#(\w+)")?,
            word: Regex::new(r"\w+")?,
        })
    }
}

#[async_trait]
impl AnalyzerPlugin for KeywordAnalyzerPlugin {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn analyze(
        &self,
        context: &AnalysisContext,
        categories: &[String],
        tags: &[String],
        _recent_events: &[String],
    ) -> anyhow::Result<AnalysisResult> {
        let text = context.text.trim();
        if text.is_empty() {
            return Err(ClassifiedError::application(format!(
                "nothing to analyze in {}",
                context.source_id
            ))
            .into_propagated());
        }
        let lower = text.to_lowercase();

        let words: BTreeSet<&str> = self.word.find_iter(&lower).map(|m| m.as_str()).collect();
        let pos = POSITIVE.iter().filter(|w| words.contains(*w)).count() as f64;
        let neg = NEGATIVE.iter().filter(|w| words.contains(*w)).count() as f64;
        let sentiment = if pos + neg == 0.0 {
            0.0
        } else {
            (pos - neg) / (pos + neg)
        };

        let hashtags: Vec<String> = self
            .hashtag
            .captures_iter(&lower)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect();

        let mut keywords: Vec<String> = Vec::new();
        for h in &hashtags {
            if !keywords.contains(h) {
                keywords.push(h.clone());
            }
        }

        let event_type = categories
            .iter()
            .find(|c| lower.contains(&c.to_lowercase()))
            .cloned()
            .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string());

        let matched_tags = tags
            .iter()
            .filter(|t| {
                let t = t.to_lowercase();
                hashtags.contains(&t) || words.contains(t.as_str())
            })
            .cloned()
            .collect();

        Ok(AnalysisResult {
            sentiment,
            keywords,
            event_type,
            tags: matched_tags,
        })
    }
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    context: &'a AnalysisContext,
    categories: &'a [String],
    tags: &'a [String],
    recent_events: &'a [String],
}

/// Remote analysis service: `POST {base}/v1/analyze`.
pub struct HttpAnalyzerPlugin {
    api_key: String,
    http: reqwest::Client,
    url_analyze: String,
}

impl HttpAnalyzerPlugin {
    pub fn new(cfg: &AnalysisServiceConfig) -> anyhow::Result<Self> {
        let http = build_client(cfg.timeout_ms)?;
        let normalized = cfg.base_url.trim_end_matches('/');
        Ok(Self {
            api_key: cfg.api_key.clone(),
            http,
            url_analyze: format!("{normalized}/v1/analyze"),
        })
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.trim().is_empty() {
            req
        } else {
            req.bearer_auth(&self.api_key)
        }
    }
}

#[async_trait]
impl AnalyzerPlugin for HttpAnalyzerPlugin {
    fn name(&self) -> &str {
        "analysis_service"
    }

    async fn analyze(
        &self,
        context: &AnalysisContext,
        categories: &[String],
        tags: &[String],
        recent_events: &[String],
    ) -> anyhow::Result<AnalysisResult> {
        let url = &self.url_analyze;
        tracing::debug!(
            target: "harvest.analyzer",
            stage = "analyze.in",
            url = %url,
            source_id = %context.source_id,
            text_len = context.text.len()
        );
        let payload = AnalyzeRequest {
            context,
            categories,
            tags,
            recent_events,
        };
        let req = self.http.post(url).json(&payload);
        let resp = self
            .auth(req)
            .send()
            .await
            .map_err(|err| from_reqwest(err, url).into_propagated())?;
        let result: AnalysisResult = parse_json_response(resp)
            .await
            .map_err(ClassifiedError::into_propagated)?;
        tracing::debug!(
            target: "harvest.analyzer",
            stage = "analyze.out",
            event_type = %result.event_type,
            keywords = result.keywords.len()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::api::{classify, is_no_retry, ErrorKind};
    use mockito::{Matcher, Server};
    use pretty_assertions::assert_eq;

    fn ctx(text: &str) -> AnalysisContext {
        AnalysisContext {
            post_id: "p1".into(),
            source_id: "c1".into(),
            text: text.into(),
            author: "u".into(),
        }
    }

    #[tokio::test]
    async fn keyword_analyzer_scores_and_tags() {
        let analyzer = KeywordAnalyzerPlugin::new().unwrap();
        let result = analyzer
            .analyze(
                &ctx("Terrible traffic accident on Main St #Traffic #roads, stay safe"),
                &["Traffic".to_string(), "Weather".to_string()],
                &["roads".to_string(), "rain".to_string()],
                &[],
            )
            .await
            .unwrap();
        assert_eq!(result.event_type, "Traffic");
        assert_eq!(result.keywords, vec!["traffic", "roads"]);
        assert_eq!(result.tags, vec!["roads"]);
        // two negative words, one positive
        assert!((result.sentiment - (-1.0 / 3.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn keyword_analyzer_rejects_empty_text() {
        let analyzer = KeywordAnalyzerPlugin::new().unwrap();
        let err = analyzer.analyze(&ctx("   "), &[], &[], &[]).await.unwrap_err();
        assert!(is_no_retry(&err));
        assert_eq!(classify(&err).kind, ErrorKind::Application);
    }

    #[tokio::test]
    async fn http_analyzer_posts_context() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/analyze")
            .match_header("authorization", "Bearer k")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "context": {"source_id": "c1"},
                "categories": ["Traffic"]
            })))
            .with_status(200)
            .with_body(r#"{"sentiment":0.5,"keywords":["bus"],"event_type":"Traffic","tags":[]}"#)
            .create_async()
            .await;

        let analyzer = HttpAnalyzerPlugin::new(&AnalysisServiceConfig {
            base_url: server.url(),
            api_key: "k".into(),
            timeout_ms: 1_000,
        })
        .unwrap();
        let result = analyzer
            .analyze(&ctx("bus late"), &["Traffic".to_string()], &[], &[])
            .await
            .unwrap();
        assert_eq!(result.event_type, "Traffic");
        assert_eq!(result.keywords, vec!["bus"]);
    }

    #[tokio::test]
    async fn http_analyzer_server_error_is_retryable() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/analyze")
            .with_status(502)
            .create_async()
            .await;

        let analyzer = HttpAnalyzerPlugin::new(&AnalysisServiceConfig {
            base_url: server.url(),
            ..AnalysisServiceConfig::default()
        })
        .unwrap();
        let err = analyzer.analyze(&ctx("x"), &[], &[], &[]).await.unwrap_err();
        assert!(!is_no_retry(&err));
    }
}
