use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Node lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Verified,
    Archived,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Verified => "verified",
            NodeStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(NodeStatus::Pending),
            "verified" => Some(NodeStatus::Verified),
            "archived" => Some(NodeStatus::Archived),
            _ => None,
        }
    }
}

/// A proxy endpoint the manager knows about. Identity is `(server, port)`;
/// `tag` is the canonical unique identifier used in kernel configs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub tag: String,
    pub name: String,
    /// Origin subscription name, or `manual`.
    pub source_tag: String,
    /// Protocol family, e.g. `shadowsocks`, `vmess`, `trojan`.
    pub node_type: String,
    pub server: String,
    pub port: u16,
    /// Opaque protocol-specific settings blob; interpreted only by the
    /// config builder.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub country_flag: String,
    pub status: NodeStatus,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub favorite: bool,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub last_checked_at: Option<i64>,
    #[serde(default)]
    pub archived_at: Option<i64>,
}

impl Node {
    /// Dedup key used across the whole pipeline.
    pub fn endpoint(&self) -> (String, u16) {
        (self.server.clone(), self.port)
    }
}

/// Insert/update payload for `add_nodes_bulk`. Status and failure accounting
/// are owned by the store, not the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCandidate {
    pub tag: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub source_tag: String,
    pub node_type: String,
    pub server: String,
    pub port: u16,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub country_flag: String,
}

/// Traffic/expiry metadata reported by a subscription provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficInfo {
    pub upload: u64,
    pub download: u64,
    pub total: u64,
    #[serde(default)]
    pub expire: Option<i64>,
}

/// Per-subscription pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub target_group: String,
    /// Minimum stability percentage a node must reach to stay in the group.
    #[serde(default)]
    pub min_stability: u8,
    #[serde(default)]
    pub remove_dead: bool,
    #[serde(default)]
    pub auto_pipeline: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            target_group: String::new(),
            min_stability: 0,
            remove_dead: false,
            auto_pipeline: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    #[serde(default)]
    pub last_updated_at: Option<i64>,
    #[serde(default)]
    pub traffic: Option<TrafficInfo>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub pipeline: PipelineSettings,
}

/// Declarative node selector used by the config builder to assemble outbound
/// groups. Opaque to the verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub id: i64,
    pub name: String,
    /// Tag of the outbound group this filter feeds.
    pub target_group: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub include: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub exclude: Vec<String>,
}

impl Filter {
    /// A node matches when any include keyword is found in its tag or name
    /// (empty include = match all) and no exclude keyword is.
    pub fn matches(&self, node: &Node) -> bool {
        let hay = format!("{} {}", node.tag, node.name);
        let included = self.include.is_empty() || self.include.iter().any(|k| hay.contains(k));
        let excluded = self.exclude.iter().any(|k| hay.contains(k));
        included && !excluded
    }
}

/// Routing rule set attached to a named outbound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleGroup {
    pub id: i64,
    pub name: String,
    pub outbound_tag: String,
    /// Domain suffix / keyword entries, in the kernel's rule syntax.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub rules: Vec<String>,
}

/// How a health measurement was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureMode {
    Tcp,
    ClashApi,
    ClashApiTemp,
    Probe,
}

impl MeasureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasureMode::Tcp => "tcp",
            MeasureMode::ClashApi => "clash_api",
            MeasureMode::ClashApiTemp => "clash_api_temp",
            MeasureMode::Probe => "probe",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tcp" => Some(MeasureMode::Tcp),
            "clash_api" => Some(MeasureMode::ClashApi),
            "clash_api_temp" => Some(MeasureMode::ClashApiTemp),
            "probe" => Some(MeasureMode::Probe),
            _ => None,
        }
    }
}

/// Append-only health check result for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMeasurement {
    pub server: String,
    pub port: u16,
    pub tag: String,
    /// Zero = defaulted to now on insert.
    #[serde(default)]
    pub timestamp: i64,
    pub alive: bool,
    pub latency_ms: u32,
    pub mode: MeasureMode,
}

/// Append-only site reachability result. `delay_ms <= 0` denotes failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteMeasurement {
    pub server: String,
    pub port: u16,
    pub tag: String,
    #[serde(default)]
    pub timestamp: i64,
    pub site: String,
    pub delay_ms: i64,
    pub mode: MeasureMode,
}

/// Counters for one verification cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationRun {
    #[serde(default)]
    pub started_at: i64,
    pub pending_checked: u32,
    pub pending_promoted: u32,
    pub pending_archived: u32,
    pub verified_checked: u32,
    pub verified_demoted: u32,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

/// A typed, persisted record of a state transition or phase boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: i64,
    pub event_type: String,
    pub message: String,
    pub timestamp: i64,
}

/// A node rejected by the config builder (unsupported transport, malformed
/// settings blob). Recorded so the verifier can archive it with a reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsupportedNode {
    pub tag: String,
    pub server: String,
    pub port: u16,
    pub reason: String,
}

/// Hosts probed during the site-reachability phase when settings carry no
/// override.
pub const DEFAULT_SITE_TARGETS: &[&str] =
    &["chatgpt.com", "youtube.com", "instagram.com", "2ip.ru"];

const DEFAULT_ARCHIVE_THRESHOLD: u32 = 10;

/// Process-wide configuration, persisted as a single row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Minutes between subscription refreshes; 0 disables the ticker.
    #[serde(default)]
    pub subscription_interval_min: u64,

    /// Minutes between verification cycles; 0 disables the ticker.
    #[serde(default)]
    pub verification_interval_min: u64,

    /// Consecutive failing cycles after which a pending node is archived.
    #[serde(default = "default_archive_threshold")]
    pub archive_threshold: u32,

    /// Rebuild + restart the kernel on any mutation that changes the
    /// effective config.
    #[serde(default)]
    pub auto_apply: bool,

    #[serde(default)]
    pub allow_lan: bool,

    #[serde(default)]
    pub clash_api_secret: String,

    #[serde(default = "default_mixed_port")]
    pub mixed_port: u16,

    #[serde(default = "default_clash_api_port")]
    pub clash_api_port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Empty = use `DEFAULT_SITE_TARGETS`.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub site_targets: Vec<String>,

    #[serde(default = "default_kernel_binary")]
    pub kernel_binary: String,

    #[serde(default)]
    pub debug_api_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            subscription_interval_min: 0,
            verification_interval_min: 0,
            archive_threshold: default_archive_threshold(),
            auto_apply: false,
            allow_lan: false,
            clash_api_secret: String::new(),
            mixed_port: default_mixed_port(),
            clash_api_port: default_clash_api_port(),
            log_level: default_log_level(),
            site_targets: Vec::new(),
            kernel_binary: default_kernel_binary(),
            debug_api_enabled: false,
        }
    }
}

fn default_archive_threshold() -> u32 {
    DEFAULT_ARCHIVE_THRESHOLD
}

fn default_mixed_port() -> u16 {
    7890
}

fn default_clash_api_port() -> u16 {
    9095
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_kernel_binary() -> String {
    "sing-box".to_string()
}

impl Settings {
    /// Apply the coercion and secret-lifecycle rules relative to the
    /// previously effective settings.
    ///
    /// - `archive_threshold <= 0` (absent/zero after deserialization) → 10.
    /// - LAN flipped on with an empty secret → generate a 16-hex-char secret.
    /// - LAN off → secret cleared.
    pub fn normalize(mut self, previous: &Settings) -> Settings {
        if self.archive_threshold == 0 {
            self.archive_threshold = DEFAULT_ARCHIVE_THRESHOLD;
        }

        if self.allow_lan {
            if self.clash_api_secret.is_empty() {
                if previous.allow_lan && !previous.clash_api_secret.is_empty() {
                    self.clash_api_secret = previous.clash_api_secret.clone();
                } else {
                    self.clash_api_secret = generate_secret();
                }
            }
        } else {
            self.clash_api_secret.clear();
        }

        self
    }

    /// Effective site targets for the verifier.
    pub fn effective_site_targets(&self) -> Vec<String> {
        if self.site_targets.is_empty() {
            DEFAULT_SITE_TARGETS.iter().map(|s| s.to_string()).collect()
        } else {
            self.site_targets.clone()
        }
    }
}

/// 16 lowercase hex chars.
fn generate_secret() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            char::from_digit(n as u32, 16).unwrap_or('0')
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_threshold_coerced() {
        let s = Settings {
            archive_threshold: 0,
            ..Settings::default()
        };
        let s = s.normalize(&Settings::default());
        assert_eq!(s.archive_threshold, 10);
    }

    #[test]
    fn test_lan_on_generates_secret() {
        let s = Settings {
            allow_lan: true,
            ..Settings::default()
        };
        let s = s.normalize(&Settings::default());
        assert_eq!(s.clash_api_secret.len(), 16);
        assert!(s.clash_api_secret.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_lan_on_keeps_existing_secret() {
        let prev = Settings {
            allow_lan: true,
            clash_api_secret: "deadbeefdeadbeef".to_string(),
            ..Settings::default()
        };
        let s = Settings {
            allow_lan: true,
            ..Settings::default()
        };
        let s = s.normalize(&prev);
        assert_eq!(s.clash_api_secret, "deadbeefdeadbeef");
    }

    #[test]
    fn test_lan_off_clears_secret() {
        let s = Settings {
            allow_lan: false,
            clash_api_secret: "deadbeefdeadbeef".to_string(),
            ..Settings::default()
        };
        let s = s.normalize(&Settings::default());
        assert!(s.clash_api_secret.is_empty());
    }

    #[test]
    fn test_default_site_targets() {
        let s = Settings::default();
        assert_eq!(s.effective_site_targets().len(), 4);
        let s = Settings {
            site_targets: vec!["example.com".to_string()],
            ..Settings::default()
        };
        assert_eq!(s.effective_site_targets(), vec!["example.com".to_string()]);
    }

    #[test]
    fn test_filter_matching() {
        let node = Node {
            id: 1,
            tag: "hk-01".to_string(),
            name: "Hong Kong 01".to_string(),
            source_tag: "manual".to_string(),
            node_type: "shadowsocks".to_string(),
            server: "1.2.3.4".to_string(),
            port: 443,
            settings: serde_json::Value::Null,
            country_code: "HK".to_string(),
            country_flag: String::new(),
            status: NodeStatus::Pending,
            consecutive_failures: 0,
            favorite: false,
            created_at: 0,
            updated_at: 0,
            last_checked_at: None,
            archived_at: None,
        };

        let f = Filter {
            id: 1,
            name: "hk".to_string(),
            target_group: "HK".to_string(),
            include: vec!["hk".to_string()],
            exclude: vec![],
        };
        assert!(f.matches(&node));

        let f = Filter {
            id: 2,
            name: "no-hk".to_string(),
            target_group: "US".to_string(),
            include: vec![],
            exclude: vec!["hk-".to_string()],
        };
        assert!(!f.matches(&node));
    }
}
