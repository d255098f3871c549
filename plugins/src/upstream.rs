use std::collections::HashMap;

use async_trait::async_trait;
use harvest_core::api::{
    AccountConfig, ClassifiedError, Comment, Page, Post, UpstreamConfig, UpstreamPlugin,
};

use crate::http::{build_client, from_reqwest, parse_json_response};

/// REST client for the social upstream. Each call is made on behalf of one
/// configured account and carries that account's bearer token.
pub struct HttpUpstreamClient {
    http: reqwest::Client,
    base: reqwest::Url,
    url_feed: String,
    feed_query: String,
    tokens: HashMap<String, String>,
}

impl HttpUpstreamClient {
    pub fn new(cfg: &UpstreamConfig, accounts: &[AccountConfig]) -> anyhow::Result<Self> {
        let http = build_client(cfg.timeout_ms)?;
        let normalized = cfg.base_url.trim_end_matches('/');
        let base = reqwest::Url::parse(&format!("{normalized}/"))
            .map_err(|e| anyhow::anyhow!("invalid upstream base_url {normalized}: {e}"))?;
        let tokens = accounts
            .iter()
            .filter(|a| !a.token.trim().is_empty())
            .map(|a| (a.id.clone(), a.token.clone()))
            .collect();
        Ok(Self {
            http,
            url_feed: format!("{normalized}/feed"),
            base,
            feed_query: cfg.feed_query.clone(),
            tokens,
        })
    }

    /// Attach the account's bearer token. An account without one never
    /// reaches the upstream: a 401 there would expire a healthy account.
    fn auth(
        &self,
        req: reqwest::RequestBuilder,
        account: &str,
    ) -> Result<reqwest::RequestBuilder, ClassifiedError> {
        match self.tokens.get(account) {
            Some(token) => Ok(req.bearer_auth(token)),
            None => {
                tracing::warn!(target: "harvest.upstream", account, "account has no token configured");
                Err(ClassifiedError::configuration(format!(
                    "account '{account}' has no upstream token"
                )))
            }
        }
    }

    fn comments_url(&self, post_id: &str) -> Result<reqwest::Url, ClassifiedError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClassifiedError::configuration("upstream base_url cannot be a base"))?
            .pop_if_empty()
            .extend(["posts", post_id, "comments"]);
        Ok(url)
    }
}

#[async_trait]
impl UpstreamPlugin for HttpUpstreamClient {
    fn name(&self) -> &str {
        "http_upstream"
    }

    async fn fetch_feed(
        &self,
        cursor: Option<&str>,
        account: &str,
    ) -> Result<Page<Post>, ClassifiedError> {
        let url = &self.url_feed;
        tracing::debug!(
            target: "harvest.upstream",
            stage = "feed.in",
            url = %url,
            account,
            cursor = cursor.unwrap_or("")
        );
        let mut req = self.http.get(url).query(&[("q", self.feed_query.as_str())]);
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor)]);
        }
        let resp = self
            .auth(req, account)?
            .send()
            .await
            .map_err(|err| from_reqwest(err, url))?;
        let page: Page<Post> = parse_json_response(resp).await?;
        tracing::debug!(
            target: "harvest.upstream",
            stage = "feed.out",
            items = page.items.len(),
            has_next = page.next_cursor.is_some()
        );
        Ok(page)
    }

    async fn fetch_comments(
        &self,
        post_id: &str,
        cursor: Option<&str>,
        account: &str,
    ) -> Result<Page<Comment>, ClassifiedError> {
        let url = self.comments_url(post_id)?;
        let url_str = url.to_string();
        tracing::debug!(
            target: "harvest.upstream",
            stage = "comments.in",
            url = %url_str,
            account,
            cursor = cursor.unwrap_or("")
        );
        let mut req = self.http.get(url);
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor)]);
        }
        let resp = self
            .auth(req, account)?
            .send()
            .await
            .map_err(|err| from_reqwest(err, &url_str))?;
        let mut page: Page<Comment> = parse_json_response(resp).await?;
        // Some upstream builds omit the parent id on nested listings.
        for comment in &mut page.items {
            if comment.post_id.is_empty() {
                comment.post_id = post_id.to_string();
            }
        }
        tracing::debug!(
            target: "harvest.upstream",
            stage = "comments.out",
            post_id,
            items = page.items.len(),
            has_next = page.next_cursor.is_some()
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::api::{ErrorKind, HttpClass};
    use mockito::{Matcher, Server};

    fn client(url: String) -> HttpUpstreamClient {
        let cfg = UpstreamConfig {
            base_url: url,
            feed_query: "city news".into(),
            ..UpstreamConfig::default()
        };
        let accounts = vec![
            AccountConfig {
                id: "a1".into(),
                token: "secret".into(),
                expires_at: None,
            },
            AccountConfig {
                id: "anon".into(),
                token: "  ".into(),
                expires_at: None,
            },
        ];
        HttpUpstreamClient::new(&cfg, &accounts).unwrap()
    }

    #[tokio::test]
    async fn fetch_feed_sends_query_cursor_and_token() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/feed")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("q".into(), "city news".into()),
                Matcher::UrlEncoded("cursor".into(), "c2".into()),
            ]))
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"items":[{"id":"p1","author":"u","text":"hi","created_at":"2024-05-01T10:00:00Z"}],"next_cursor":"c3"}"#,
            )
            .create_async()
            .await;

        let page = client(server.url())
            .fetch_feed(Some("c2"), "a1")
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, "p1");
        assert_eq!(page.next_cursor.as_deref(), Some("c3"));
    }

    #[tokio::test]
    async fn fetch_comments_fills_parent_id() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("GET", "/posts/p1/comments")
            .with_status(200)
            .with_body(
                r#"{"items":[{"id":"c1","post_id":"","author":"u","text":"yes","created_at":"2024-05-01T10:00:00Z"}]}"#,
            )
            .create_async()
            .await;

        let page = client(server.url())
            .fetch_comments("p1", None, "a1")
            .await
            .unwrap();
        assert_eq!(page.items[0].post_id, "p1");
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn status_codes_map_onto_taxonomy() {
        let mut server = Server::new_async().await;
        let _a = server
            .mock("GET", "/feed")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;
        let _b = server
            .mock("GET", "/posts/p9/comments")
            .with_status(403)
            .with_body("forbidden")
            .create_async()
            .await;

        let c = client(server.url());
        let err = c.fetch_feed(None, "a1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthExpired);

        let err = c.fetch_comments("p9", None, "a1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Http(HttpClass::ClientError));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn account_without_token_is_refused_before_sending() {
        let mut server = Server::new_async().await;
        let feed = server
            .mock("GET", "/feed")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let c = client(server.url());
        let err = c.fetch_feed(None, "anon").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert!(!err.is_retryable());
        let err = c.fetch_comments("p1", None, "anon").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        feed.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_network_error() {
        let c = client("http://127.0.0.1:9".into());
        let err = c.fetch_feed(None, "a1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
        assert!(err.is_retryable());
    }
}
