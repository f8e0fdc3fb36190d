use crate::models::{Candidate, ContentType};
use crate::utils::error::ApiError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct WebResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub engine: String,
    pub rank: usize,
}

#[derive(Debug, Deserialize)]
struct SearchApiResponse {
    results: Vec<SearchApiResult>,
}

#[derive(Debug, Deserialize)]
struct SearchApiResult {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    engine: String,
}

#[derive(Debug)]
pub struct WebSearchOutcome {
    pub results: Vec<WebResult>,
    /// True when the JSON API failed and results came from HTML parsing.
    pub html_fallback: bool,
}

/// Privacy-preserving web search client (SearXNG-compatible API).
/// JSON endpoint first; one HTML-parsing attempt on failure.
pub struct WebSearchClient {
    client: Client,
    url: Option<String>,
    timeout: Duration,
}

impl WebSearchClient {
    pub fn new(url: Option<String>, timeout_s: u64) -> Self {
        let timeout = Duration::from_secs(timeout_s);
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            url,
            timeout,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    pub async fn search(&self, query: &str) -> Result<WebSearchOutcome, ApiError> {
        let Some(url) = &self.url else {
            return Err(ApiError::WebSearchUnavailable(
                "web search is not configured".to_string(),
            ));
        };

        match self.search_json(url, query).await {
            Ok(results) if !results.is_empty() => {
                debug!(count = results.len(), "web search (json) ok");
                return Ok(WebSearchOutcome {
                    results,
                    html_fallback: false,
                });
            }
            Ok(_) => warn!("web search json endpoint returned no results"),
            Err(e) => warn!("web search json endpoint failed: {}", e),
        }

        // HTML fallback is a degraded success, tried exactly once
        match self.search_html(url, query).await {
            Ok(results) if !results.is_empty() => {
                debug!(count = results.len(), "web search (html fallback) ok");
                Ok(WebSearchOutcome {
                    results,
                    html_fallback: true,
                })
            }
            Ok(_) => Err(ApiError::WebSearchUnavailable(
                "no results from either endpoint".to_string(),
            )),
            Err(e) => Err(ApiError::WebSearchUnavailable(e.to_string())),
        }
    }

    async fn search_json(&self, base_url: &str, query: &str) -> anyhow::Result<Vec<WebResult>> {
        let endpoint = format!("{}/search", base_url.trim_end_matches('/'));

        let response = tokio::time::timeout(
            self.timeout,
            self.client
                .get(&endpoint)
                .query(&[("q", query), ("format", "json")])
                .send(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("web search timed out"))??;

        if !response.status().is_success() {
            anyhow::bail!("search API returned {}", response.status());
        }

        let body: SearchApiResponse = response.json().await?;

        Ok(body
            .results
            .into_iter()
            .enumerate()
            .map(|(rank, r)| WebResult {
                title: r.title,
                url: r.url,
                snippet: r.content,
                engine: if r.engine.is_empty() {
                    "unknown".to_string()
                } else {
                    r.engine
                },
                rank,
            })
            .collect())
    }

    async fn search_html(&self, base_url: &str, query: &str) -> anyhow::Result<Vec<WebResult>> {
        let endpoint = format!("{}/search", base_url.trim_end_matches('/'));

        let response = tokio::time::timeout(
            self.timeout,
            self.client.get(&endpoint).query(&[("q", query)]).send(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("web search timed out"))??;

        if !response.status().is_success() {
            anyhow::bail!("search HTML endpoint returned {}", response.status());
        }

        let html = response.text().await?;
        Ok(parse_result_page(&html))
    }
}

/// Extract (title, url, snippet) triples from a SearXNG result page.
pub fn parse_result_page(html: &str) -> Vec<WebResult> {
    let document = scraper::Html::parse_document(html);

    let result_selector = scraper::Selector::parse("article.result, div.result").unwrap();
    let link_selector = scraper::Selector::parse("h3 a, a.url_header").unwrap();
    let snippet_selector = scraper::Selector::parse("p.content, .content").unwrap();

    let mut results = Vec::new();

    for (rank, element) in document.select(&result_selector).enumerate() {
        let Some(link) = element.select(&link_selector).next() else {
            continue;
        };
        let Some(href) = link.value().attr("href") else {
            continue;
        };

        let title = link.text().collect::<String>().trim().to_string();
        let snippet = element
            .select(&snippet_selector)
            .next()
            .map(|s| s.text().collect::<String>().trim().to_string())
            .unwrap_or_default();

        if title.is_empty() {
            continue;
        }

        results.push(WebResult {
            title,
            url: href.to_string(),
            snippet,
            engine: "html".to_string(),
            rank,
        });
    }

    results
}

/// Map web results onto synthetic chunks so the synthesizer can treat
/// both paths uniformly. Negative chunk ids mark transient chunks;
/// scores decay with rank.
pub fn results_to_candidates(results: &[WebResult]) -> Vec<Candidate> {
    results
        .iter()
        .map(|r| Candidate {
            chunk_id: -(r.rank as i64 + 1),
            document_id: -1,
            source: r.url.clone(),
            content: if r.snippet.is_empty() {
                r.title.clone()
            } else {
                r.snippet.clone()
            },
            section: Some(r.title.clone()),
            page: None,
            category: None,
            privacy_level: None,
            content_type: ContentType::Text,
            vector_score: None,
            bm25_score: None,
            rerank_score: None,
            final_score: 1.0 / (r.rank as f32 + 1.0),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_response_parsing() {
        let body: SearchApiResponse = serde_json::from_str(
            r#"{"results":[{"title":"Go 1.23","url":"https://go.dev/blog","content":"Go 1.23 released August 2024","engine":"ddg"}]}"#,
        )
        .unwrap();
        assert_eq!(body.results.len(), 1);
        assert_eq!(body.results[0].engine, "ddg");
    }

    #[test]
    fn test_parse_result_page() {
        let html = r#"
            <html><body>
            <article class="result">
                <h3><a href="https://go.dev/blog/go1.23">Go 1.23 is released</a></h3>
                <p class="content">Go 1.23 released August 2024 with new features.</p>
            </article>
            <article class="result">
                <h3><a href="https://example.com/other">Other page</a></h3>
                <p class="content">Something else.</p>
            </article>
            </body></html>
        "#;

        let results = parse_result_page(html);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "https://go.dev/blog/go1.23");
        assert!(results[0].snippet.contains("August 2024"));
        assert_eq!(results[1].rank, 1);
    }

    #[test]
    fn test_parse_result_page_empty() {
        assert!(parse_result_page("<html><body>nothing here</body></html>").is_empty());
    }

    #[test]
    fn test_results_to_candidates() {
        let results = vec![
            WebResult {
                title: "Go 1.23".to_string(),
                url: "https://go.dev/blog".to_string(),
                snippet: "Go 1.23 released August 2024".to_string(),
                engine: "ddg".to_string(),
                rank: 0,
            },
            WebResult {
                title: "Other".to_string(),
                url: "https://example.com".to_string(),
                snippet: String::new(),
                engine: "ddg".to_string(),
                rank: 1,
            },
        ];

        let candidates = results_to_candidates(&results);
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].chunk_id < 0);
        assert!(candidates[0].source.starts_with("http"));
        assert!(candidates[0].final_score > candidates[1].final_score);
        // Empty snippet falls back to the title
        assert_eq!(candidates[1].content, "Other");
    }

    #[tokio::test]
    async fn test_disabled_client_errors() {
        let client = WebSearchClient::new(None, 8);
        assert!(!client.is_enabled());
        let err = client.search("query").await.unwrap_err();
        assert!(matches!(err, ApiError::WebSearchUnavailable(_)));
    }
}
