use crate::error::ManagerError;
use crate::events::{topic, Event, EventBus};
use crate::store::{NodeCandidate, Store, TrafficInfo};
use async_trait::async_trait;
use base64::Engine;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Fetches raw subscription content. The default implementation speaks HTTP;
/// tests substitute canned bytes.
#[async_trait]
pub trait SubscriptionFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, Option<TrafficInfo>), ManagerError>;
}

/// Turns raw subscription bytes into node candidates. URL-scheme wire formats
/// plug in behind this seam; the default accepts kernel-style outbound lists.
pub trait NodeParser: Send + Sync {
    fn parse(&self, raw: &[u8]) -> Result<Vec<NodeCandidate>, ManagerError>;
}

/// HTTP fetcher with provider traffic metadata parsing.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("argus-manager/0.1 (clash-compatible)")
            .build()
            .expect("failed to build subscription HTTP client");
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, Option<TrafficInfo>), ManagerError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ManagerError::Unavailable(format!("fetch {}: {}", url, e)))?;

        if !resp.status().is_success() {
            return Err(ManagerError::Unavailable(format!(
                "fetch {}: status {}",
                url,
                resp.status()
            )));
        }

        let traffic = resp
            .headers()
            .get("subscription-userinfo")
            .and_then(|v| v.to_str().ok())
            .map(parse_userinfo);

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ManagerError::Unavailable(format!("read {}: {}", url, e)))?;
        Ok((bytes.to_vec(), traffic))
    }
}

/// `upload=455727941; download=6174315083; total=1073741824000; expire=1862111999`
fn parse_userinfo(raw: &str) -> TrafficInfo {
    let mut info = TrafficInfo::default();
    for part in raw.split(';') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "upload" => info.upload = value.parse().unwrap_or(0),
            "download" => info.download = value.parse().unwrap_or(0),
            "total" => info.total = value.parse().unwrap_or(0),
            "expire" => info.expire = value.parse().ok(),
            _ => {}
        }
    }
    info
}

/// Parses kernel-native outbound lists: a JSON array, a `{"outbounds": []}`
/// document, or either of those base64-wrapped.
pub struct OutboundListParser;

impl NodeParser for OutboundListParser {
    fn parse(&self, raw: &[u8]) -> Result<Vec<NodeCandidate>, ManagerError> {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();

        if let Some(candidates) = parse_outbound_json(text) {
            return Ok(candidates);
        }

        // Providers commonly base64-wrap the payload.
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(&compact) {
            if let Some(candidates) = parse_outbound_json(String::from_utf8_lossy(&decoded).trim())
            {
                return Ok(candidates);
            }
        }

        Err(ManagerError::Broken(
            "subscription payload is not an outbound list".to_string(),
        ))
    }
}

fn parse_outbound_json(text: &str) -> Option<Vec<NodeCandidate>> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let outbounds = match &value {
        serde_json::Value::Array(items) => items.clone(),
        serde_json::Value::Object(map) => map.get("outbounds")?.as_array()?.clone(),
        _ => return None,
    };

    let mut candidates = Vec::new();
    for outbound in outbounds {
        let serde_json::Value::Object(mut map) = outbound else {
            continue;
        };
        let node_type = map
            .remove("type")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        // Group/builtin outbounds carry no server; skip them.
        let server = map
            .remove("server")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let port = map
            .remove("server_port")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u16;
        if node_type.is_empty() || server.is_empty() || port == 0 {
            continue;
        }
        let tag = map
            .remove("tag")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{}-{}", server, port));

        candidates.push(NodeCandidate {
            tag: tag.clone(),
            name: tag,
            source_tag: String::new(),
            node_type,
            server,
            port,
            settings: serde_json::Value::Object(map),
            country_code: String::new(),
            country_flag: String::new(),
        });
    }
    Some(candidates)
}

/// What one refresh did.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RefreshSummary {
    pub subscription: String,
    pub parsed: usize,
    pub inserted: usize,
    pub removed: usize,
}

/// Fetch → parse → bulk-upsert pipeline for one or all subscriptions.
pub struct Refresher {
    store: Arc<Store>,
    events: Arc<EventBus>,
    fetcher: Arc<dyn SubscriptionFetcher>,
    parser: Arc<dyn NodeParser>,
}

impl Refresher {
    pub fn new(
        store: Arc<Store>,
        events: Arc<EventBus>,
        fetcher: Arc<dyn SubscriptionFetcher>,
        parser: Arc<dyn NodeParser>,
    ) -> Self {
        Self {
            store,
            events,
            fetcher,
            parser,
        }
    }

    pub async fn refresh(&self, id: i64) -> Result<RefreshSummary, ManagerError> {
        let sub = self.store.get_subscription(id)?;
        if !sub.enabled {
            return Err(ManagerError::Conflict(format!(
                "subscription {} is disabled",
                sub.name
            )));
        }

        self.events
            .publish(Event::new(topic::SUB_REFRESH_STARTED).with("name", sub.name.as_str()));

        let fetched = self.fetcher.fetch(&sub.url).await;
        let (bytes, traffic) = match fetched {
            Ok(v) => v,
            Err(e) => {
                self.events.publish(
                    Event::new(topic::SUB_REFRESH_COMPLETED)
                        .with("name", sub.name.as_str())
                        .with("error", e.to_string()),
                );
                metrics::counter!("manager_sub_refresh_total", "result" => "error").increment(1);
                return Err(e);
            }
        };

        let mut candidates = self.parser.parse(&bytes)?;
        for c in &mut candidates {
            c.source_tag = sub.name.clone();
        }

        let inserted = self.store.add_nodes_bulk(&candidates)?;

        // Sync diff: drop rows this subscription no longer serves.
        let mut removed = 0;
        if sub.pipeline.remove_dead {
            let fresh: HashSet<(String, u16)> = candidates
                .iter()
                .map(|c| (c.server.clone(), c.port))
                .collect();
            for node in self.store.get_nodes_by_source(&sub.name)? {
                if !fresh.contains(&(node.server.clone(), node.port)) {
                    self.store.delete_node(node.id)?;
                    removed += 1;
                }
            }
        }

        self.store.touch_subscription(id, traffic.as_ref())?;

        info!(
            "subscription: refreshed, name={}, parsed={}, inserted={}, removed={}",
            sub.name,
            candidates.len(),
            inserted,
            removed
        );
        self.events.publish(
            Event::new(topic::SUB_REFRESH_COMPLETED)
                .with("name", sub.name.as_str())
                .with("parsed", candidates.len() as i64)
                .with("inserted", inserted as i64)
                .with("removed", removed as i64),
        );
        metrics::counter!("manager_sub_refresh_total", "result" => "success").increment(1);

        Ok(RefreshSummary {
            subscription: sub.name,
            parsed: candidates.len(),
            inserted,
            removed,
        })
    }

    /// Refresh every enabled subscription; per-subscription failures are
    /// logged and do not stop the sweep.
    pub async fn refresh_all(&self) -> Result<Vec<RefreshSummary>, ManagerError> {
        let subs = self.store.list_subscriptions()?;
        let mut summaries = Vec::new();
        for sub in subs.into_iter().filter(|s| s.enabled) {
            match self.refresh(sub.id).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    warn!(
                        "subscription: refresh failed, name={}, error={}",
                        sub.name, e
                    );
                }
            }
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_userinfo() {
        let info = parse_userinfo("upload=100; download=200; total=1000; expire=1862111999");
        assert_eq!(info.upload, 100);
        assert_eq!(info.download, 200);
        assert_eq!(info.total, 1000);
        assert_eq!(info.expire, Some(1862111999));
    }

    #[test]
    fn test_parse_outbound_array() {
        let raw = br#"[
            {"type": "shadowsocks", "tag": "hk", "server": "1.2.3.4", "server_port": 443,
             "method": "aes-256-gcm", "password": "x"},
            {"type": "selector", "tag": "group", "outbounds": ["hk"]}
        ]"#;
        let candidates = OutboundListParser.parse(raw).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].tag, "hk");
        assert_eq!(candidates[0].settings["method"], "aes-256-gcm");
        // Identity fields are lifted out of the blob.
        assert!(candidates[0].settings.get("server").is_none());
    }

    #[test]
    fn test_parse_outbounds_document_base64() {
        let doc = r#"{"outbounds": [{"type": "trojan", "tag": "t1", "server": "5.6.7.8",
            "server_port": 8443, "password": "pw"}]}"#;
        let encoded = base64::engine::general_purpose::STANDARD.encode(doc);
        let candidates = OutboundListParser.parse(encoded.as_bytes()).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].node_type, "trojan");
    }

    #[test]
    fn test_parse_garbage_is_broken() {
        let err = OutboundListParser.parse(b"ss://not-supported-here").unwrap_err();
        assert!(matches!(err, ManagerError::Broken(_)));
    }
}
