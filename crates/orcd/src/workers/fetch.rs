//! FETCH worker (Section 4.3.1).
//!
//! HTTP failures are partial: a feed that fails to fetch or parse is
//! recorded in `failedSources` rather than failing the whole step. Only
//! all-sources-failed is a worker error.

use async_trait::async_trait;
use orc_core::WorkerKind;
use quick_xml::events::Event as XmlEvent;
use quick_xml::reader::Reader;
use serde::Deserialize;
use serde_json::json;

use crate::workers::{Worker, WorkerContext, WorkerError, WorkerSuccess};

const MAX_DESCRIPTION_LEN: usize = 500;

pub struct FetchWorker {
    client: reqwest::Client,
}

impl FetchWorker {
    pub fn new(user_agent: &str, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .timeout(timeout)
            .build()
            .expect("reqwest client builds");
        Self { client }
    }
}

#[derive(Deserialize)]
struct FetchConfig {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    format: Option<String>,
}

#[derive(serde::Serialize)]
struct FeedItem {
    title: String,
    link: String,
    description: String,
    #[serde(rename = "pubDate", skip_serializing_if = "Option::is_none")]
    pub_date: Option<String>,
}

#[async_trait]
impl Worker for FetchWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Fetch
    }

    async fn execute(&self, ctx: &WorkerContext) -> Result<WorkerSuccess, WorkerError> {
        let config: FetchConfig = serde_json::from_value(ctx.config.clone())
            .map_err(|e| WorkerError::permanent(format!("invalid fetch config: {e}")))?;

        let mut urls = config.urls.clone();
        if let Some(url) = &config.url {
            urls.push(url.clone());
        }
        if urls.is_empty() {
            return Err(WorkerError::permanent("fetch requires `url` or `urls`"));
        }

        let mut sources = Vec::new();
        let mut failed_sources = Vec::new();
        let mut items = Vec::new();

        for url in &urls {
            match self.fetch_one(url, config.format.as_deref()).await {
                Ok(mut fetched) => {
                    sources.push(url.clone());
                    items.append(&mut fetched);
                }
                Err(e) => failed_sources.push(json!({"url": url, "error": e.to_string()})),
            }
        }

        if sources.is_empty() {
            return Err(WorkerError::transient(format!(
                "all {} source(s) failed",
                urls.len()
            )));
        }

        let body = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "sources": sources,
            "failedSources": failed_sources,
            "itemCount": items.len(),
            "items": items,
        });
        Ok(WorkerSuccess::json(body))
    }
}

impl FetchWorker {
    async fn fetch_one(
        &self,
        url: &str,
        format: Option<&str>,
    ) -> Result<Vec<serde_json::Value>, WorkerError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| WorkerError::transient(e.to_string()))?;
        if !response.status().is_success() {
            return Err(WorkerError::transient(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| WorkerError::transient(e.to_string()))?;

        match format {
            Some("rss") => Ok(parse_feed_items(&body)
                .into_iter()
                .map(|i| serde_json::to_value(i).expect("feed item serializable"))
                .collect()),
            Some("json") => {
                let value: serde_json::Value = serde_json::from_str(&body)
                    .unwrap_or_else(|_| serde_json::Value::String(body.clone()));
                Ok(vec![value])
            }
            _ => {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
                    Ok(vec![value])
                } else if looks_like_feed(&body) {
                    Ok(parse_feed_items(&body)
                        .into_iter()
                        .map(|i| serde_json::to_value(i).expect("feed item serializable"))
                        .collect())
                } else {
                    Ok(vec![serde_json::Value::String(body)])
                }
            }
        }
    }
}

fn looks_like_feed(body: &str) -> bool {
    body.contains("<rss") || body.contains("<feed") || body.contains("<item>") || body.contains("<entry>")
}

/// Parses RSS `<item>` or Atom `<entry>` elements into feed items. Tags
/// outside of a recognized element/field are ignored rather than erroring
/// — feeds in the wild carry plenty of extension namespaces we don't need.
fn parse_feed_items(xml: &str) -> Vec<FeedItem> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut in_item = false;
    let mut current_tag = String::new();
    let mut title = String::new();
    let mut link = String::new();
    let mut description = String::new();
    let mut pub_date: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "item" || name == "entry" {
                    in_item = true;
                    title.clear();
                    link.clear();
                    description.clear();
                    pub_date = None;
                }
                if in_item {
                    current_tag = name;
                }
            }
            Ok(XmlEvent::Empty(e)) => {
                // Atom <link href="..."/> carries its target as an attribute.
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if in_item && name == "link" {
                    if let Some(href) = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.as_ref() == b"href")
                    {
                        link = String::from_utf8_lossy(&href.value).to_string();
                    }
                }
            }
            Ok(XmlEvent::Text(t)) => {
                if in_item {
                    let text = t.unescape().unwrap_or_default().to_string();
                    match current_tag.as_str() {
                        "title" => title.push_str(&text),
                        "link" => link.push_str(&text),
                        "description" | "summary" | "content" => description.push_str(&text),
                        "pubDate" | "published" | "updated" => {
                            pub_date = Some(pub_date.unwrap_or_default() + &text)
                        }
                        _ => {}
                    }
                }
            }
            Ok(XmlEvent::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "item" || name == "entry" {
                    in_item = false;
                    description.truncate(
                        description
                            .char_indices()
                            .nth(MAX_DESCRIPTION_LEN)
                            .map(|(i, _)| i)
                            .unwrap_or(description.len()),
                    );
                    items.push(FeedItem {
                        title: title.clone(),
                        link: link.clone(),
                        description: description.clone(),
                        pub_date: pub_date.clone(),
                    });
                }
                current_tag.clear();
            }
            Ok(XmlEvent::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rss_items() {
        let xml = r#"<rss><channel>
            <item><title>Hello</title><link>https://a.example/1</link><description>World</description><pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate></item>
        </channel></rss>"#;
        let items = parse_feed_items(xml);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Hello");
        assert_eq!(items[0].link, "https://a.example/1");
    }

    #[test]
    fn parses_atom_entries_with_link_href() {
        let xml = r#"<feed>
            <entry><title>Atom</title><link href="https://a.example/2"/><summary>Body</summary></entry>
        </feed>"#;
        let items = parse_feed_items(xml);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].link, "https://a.example/2");
    }

    #[test]
    fn description_is_truncated_to_500_chars() {
        let long = "x".repeat(800);
        let xml = format!(
            "<rss><channel><item><title>t</title><link>l</link><description>{long}</description></item></channel></rss>"
        );
        let items = parse_feed_items(&xml);
        assert_eq!(items[0].description.chars().count(), MAX_DESCRIPTION_LEN);
    }
}
