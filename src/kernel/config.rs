use crate::store::{Filter, Node, RuleGroup, Settings, UnsupportedNode};
use serde::Deserialize;
use serde_json::{json, Value};

/// Outbound tag of the always-present direct connection.
pub const DIRECT_TAG: &str = "direct";
/// Tag of the auto-selecting url-test group over all nodes.
pub const AUTO_GROUP_TAG: &str = "auto";
/// Tag of the user-facing selector group.
pub const SELECTOR_TAG: &str = "PROXY";
/// Url-test group used in probe documents.
pub const PROBE_GROUP_TAG: &str = "probe-auto";

const URLTEST_URL: &str = "https://www.gstatic.com/generate_204";

/// Result of a config build: the kernel's native JSON document plus the
/// nodes that could not be represented in it.
pub struct BuildOutput {
    pub document: Value,
    pub broken: Vec<UnsupportedNode>,
}

/// Protocol families the builder knows how to emit. Unknown transports with a
/// well-formed settings blob fall through to `Opaque`; everything else is
/// reported as broken.
#[derive(Debug)]
pub enum Protocol {
    Shadowsocks(ShadowsocksSettings),
    Vmess(VmessSettings),
    Vless(VlessSettings),
    Trojan(TrojanSettings),
    Hysteria2(Hysteria2Settings),
    Tuic(TuicSettings),
    Opaque(serde_json::Map<String, Value>),
}

#[derive(Debug, Deserialize)]
pub struct ShadowsocksSettings {
    pub method: String,
    pub password: String,
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub plugin_opts: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VmessSettings {
    pub uuid: String,
    #[serde(default)]
    pub alter_id: u32,
    #[serde(default = "default_vmess_security")]
    pub security: String,
    #[serde(default)]
    pub tls: Option<Value>,
    #[serde(default)]
    pub transport: Option<Value>,
}

fn default_vmess_security() -> String {
    "auto".to_string()
}

#[derive(Debug, Deserialize)]
pub struct VlessSettings {
    pub uuid: String,
    #[serde(default)]
    pub flow: String,
    #[serde(default)]
    pub tls: Option<Value>,
    #[serde(default)]
    pub transport: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct TrojanSettings {
    pub password: String,
    #[serde(default)]
    pub tls: Option<Value>,
    #[serde(default)]
    pub transport: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct Hysteria2Settings {
    pub password: String,
    #[serde(default)]
    pub obfs: Option<Value>,
    #[serde(default)]
    pub up_mbps: Option<u32>,
    #[serde(default)]
    pub down_mbps: Option<u32>,
    #[serde(default)]
    pub tls: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct TuicSettings {
    pub uuid: String,
    pub password: String,
    #[serde(default = "default_congestion_control")]
    pub congestion_control: String,
    #[serde(default)]
    pub tls: Option<Value>,
}

fn default_congestion_control() -> String {
    "cubic".to_string()
}

/// Transports without a dedicated variant that the kernel still accepts;
/// their blobs pass through untouched.
const PASSTHROUGH_TYPES: &[&str] = &["socks", "http", "wireguard", "shadowtls"];

impl Protocol {
    /// Interpret a node's type + opaque settings blob. `Err` carries the
    /// reason used in the broken-node descriptor.
    pub fn parse(node_type: &str, blob: &Value) -> Result<Protocol, String> {
        let parse_err = |e: serde_json::Error| format!("malformed {} settings: {}", node_type, e);
        match node_type {
            "shadowsocks" | "ss" => Ok(Protocol::Shadowsocks(
                ShadowsocksSettings::deserialize(blob).map_err(parse_err)?,
            )),
            "vmess" => Ok(Protocol::Vmess(
                VmessSettings::deserialize(blob).map_err(parse_err)?,
            )),
            "vless" => Ok(Protocol::Vless(
                VlessSettings::deserialize(blob).map_err(parse_err)?,
            )),
            "trojan" => Ok(Protocol::Trojan(
                TrojanSettings::deserialize(blob).map_err(parse_err)?,
            )),
            "hysteria2" | "hy2" => Ok(Protocol::Hysteria2(
                Hysteria2Settings::deserialize(blob).map_err(parse_err)?,
            )),
            "tuic" => Ok(Protocol::Tuic(
                TuicSettings::deserialize(blob).map_err(parse_err)?,
            )),
            other if PASSTHROUGH_TYPES.contains(&other) => match blob {
                Value::Object(map) => Ok(Protocol::Opaque(map.clone())),
                Value::Null => Ok(Protocol::Opaque(serde_json::Map::new())),
                _ => Err(format!("malformed {} settings: not an object", other)),
            },
            other => Err(format!("unsupported transport: {}", other)),
        }
    }
}

/// Canonical kernel type string for a parsed protocol.
fn protocol_type(node_type: &str) -> &str {
    match node_type {
        "ss" => "shadowsocks",
        "hy2" => "hysteria2",
        other => other,
    }
}

/// Tags are restricted to `[A-Za-z0-9._-]`; anything else becomes `-`.
pub fn sanitize_tag(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

/// Render one node as a kernel outbound object, or describe why it can't be.
fn node_outbound(node: &Node) -> Result<(String, Value), String> {
    let tag = sanitize_tag(&node.tag);
    if tag.is_empty() {
        return Err("tag sanitized to empty".to_string());
    }
    if node.server.is_empty() || node.port == 0 {
        return Err("missing server or port".to_string());
    }

    let proto = Protocol::parse(&node.node_type, &node.settings)?;
    let mut out = serde_json::Map::new();
    out.insert("type".into(), json!(protocol_type(&node.node_type)));
    out.insert("tag".into(), json!(tag));
    out.insert("server".into(), json!(node.server));
    out.insert("server_port".into(), json!(node.port));

    match proto {
        Protocol::Shadowsocks(s) => {
            out.insert("method".into(), json!(s.method));
            out.insert("password".into(), json!(s.password));
            if let Some(plugin) = s.plugin {
                out.insert("plugin".into(), json!(plugin));
            }
            if let Some(opts) = s.plugin_opts {
                out.insert("plugin_opts".into(), json!(opts));
            }
        }
        Protocol::Vmess(s) => {
            out.insert("uuid".into(), json!(s.uuid));
            out.insert("alter_id".into(), json!(s.alter_id));
            out.insert("security".into(), json!(s.security));
            if let Some(tls) = s.tls {
                out.insert("tls".into(), tls);
            }
            if let Some(transport) = s.transport {
                out.insert("transport".into(), transport);
            }
        }
        Protocol::Vless(s) => {
            out.insert("uuid".into(), json!(s.uuid));
            if !s.flow.is_empty() {
                out.insert("flow".into(), json!(s.flow));
            }
            if let Some(tls) = s.tls {
                out.insert("tls".into(), tls);
            }
            if let Some(transport) = s.transport {
                out.insert("transport".into(), transport);
            }
        }
        Protocol::Trojan(s) => {
            out.insert("password".into(), json!(s.password));
            if let Some(tls) = s.tls {
                out.insert("tls".into(), tls);
            }
            if let Some(transport) = s.transport {
                out.insert("transport".into(), transport);
            }
        }
        Protocol::Hysteria2(s) => {
            out.insert("password".into(), json!(s.password));
            if let Some(obfs) = s.obfs {
                out.insert("obfs".into(), obfs);
            }
            if let Some(up) = s.up_mbps {
                out.insert("up_mbps".into(), json!(up));
            }
            if let Some(down) = s.down_mbps {
                out.insert("down_mbps".into(), json!(down));
            }
            if let Some(tls) = s.tls {
                out.insert("tls".into(), tls);
            }
        }
        Protocol::Tuic(s) => {
            out.insert("uuid".into(), json!(s.uuid));
            out.insert("password".into(), json!(s.password));
            out.insert("congestion_control".into(), json!(s.congestion_control));
            if let Some(tls) = s.tls {
                out.insert("tls".into(), tls);
            }
        }
        Protocol::Opaque(extra) => {
            // Passthrough transports keep their blob, minus fields we own.
            for (k, v) in extra {
                if !matches!(k.as_str(), "type" | "tag" | "server" | "server_port") {
                    out.insert(k, v);
                }
            }
        }
    }

    Ok((tag, Value::Object(out)))
}

fn broken_entry(node: &Node, reason: String) -> UnsupportedNode {
    UnsupportedNode {
        tag: node.tag.clone(),
        server: node.server.clone(),
        port: node.port,
        reason,
    }
}

/// Build the full kernel configuration.
///
/// Pure and deterministic: identical inputs yield a byte-identical document.
/// Outbound group ordering is stable — filter groups alphabetical by group
/// tag, node outbounds alphabetical by tag. Unrepresentable nodes come back
/// in `broken` instead of aborting the build.
pub fn build_config(
    settings: &Settings,
    nodes: &[Node],
    filters: &[Filter],
    rule_groups: &[RuleGroup],
) -> BuildOutput {
    let mut broken = Vec::new();
    let mut outbounds: Vec<(String, Value)> = Vec::new();

    for node in nodes {
        match node_outbound(node) {
            Ok(entry) => outbounds.push(entry),
            Err(reason) => broken.push(broken_entry(node, reason)),
        }
    }
    outbounds.sort_by(|a, b| a.0.cmp(&b.0));
    outbounds.dedup_by(|a, b| a.0 == b.0);
    let tags: Vec<String> = outbounds.iter().map(|(tag, _)| tag.clone()).collect();

    let listen = if settings.allow_lan { "0.0.0.0" } else { "127.0.0.1" };

    let mut document = serde_json::Map::new();
    document.insert(
        "log".into(),
        json!({"level": settings.log_level, "timestamp": true}),
    );
    document.insert(
        "inbounds".into(),
        json!([{
            "type": "mixed",
            "tag": "mixed-in",
            "listen": listen,
            "listen_port": settings.mixed_port,
        }]),
    );

    let mut all_outbounds: Vec<Value> = Vec::new();

    // Selector exposed to clients: auto group, every node, direct fallback.
    let mut selector_members = Vec::new();
    if !tags.is_empty() {
        selector_members.push(AUTO_GROUP_TAG.to_string());
    }
    selector_members.extend(tags.iter().cloned());
    selector_members.push(DIRECT_TAG.to_string());
    let selector_default = selector_members[0].clone();
    all_outbounds.push(json!({
        "type": "selector",
        "tag": SELECTOR_TAG,
        "outbounds": selector_members,
        "default": selector_default,
    }));

    if !tags.is_empty() {
        all_outbounds.push(json!({
            "type": "urltest",
            "tag": AUTO_GROUP_TAG,
            "outbounds": tags,
            "url": URLTEST_URL,
            "interval": "5m",
        }));
    }

    // One selector per filter, alphabetical by target group tag; members
    // alphabetical (node list is already sorted).
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for filter in filters {
        let group_tag = sanitize_tag(&filter.target_group);
        if group_tag.is_empty() {
            continue;
        }
        let members: Vec<String> = nodes
            .iter()
            .filter(|n| filter.matches(n))
            .filter_map(|n| {
                let t = sanitize_tag(&n.tag);
                tags.contains(&t).then_some(t)
            })
            .collect();
        if !members.is_empty() {
            groups.push((group_tag, members));
        }
    }
    groups.sort_by(|a, b| a.0.cmp(&b.0));
    groups.dedup_by(|a, b| a.0 == b.0);
    for (group_tag, mut members) in groups {
        members.sort();
        members.dedup();
        members.push(DIRECT_TAG.to_string());
        let group_default = members[0].clone();
        all_outbounds.push(json!({
            "type": "selector",
            "tag": group_tag,
            "outbounds": members,
            "default": group_default,
        }));
    }

    for (_, outbound) in &outbounds {
        all_outbounds.push(outbound.clone());
    }
    all_outbounds.push(json!({"type": "direct", "tag": DIRECT_TAG}));

    document.insert("outbounds".into(), Value::Array(all_outbounds));

    // Route rules from rule groups, then the default.
    let mut rules: Vec<Value> = Vec::new();
    for group in rule_groups {
        if let Some(rule) = rule_group_to_rule(group) {
            rules.push(rule);
        }
    }
    document.insert(
        "route".into(),
        json!({"rules": rules, "final": SELECTOR_TAG, "auto_detect_interface": true}),
    );

    let controller = format!("{}:{}", listen, settings.clash_api_port);
    document.insert(
        "experimental".into(),
        json!({"clash_api": {
            "external_controller": controller,
            "secret": settings.clash_api_secret,
        }}),
    );

    BuildOutput {
        document: Value::Object(document),
        broken,
    }
}

/// `domain_suffix:x` / `domain_keyword:x` / `domain:x` entries grouped into
/// one routing rule pointing at the group's outbound.
fn rule_group_to_rule(group: &RuleGroup) -> Option<Value> {
    let outbound = sanitize_tag(&group.outbound_tag);
    if outbound.is_empty() {
        return None;
    }
    let mut suffixes = Vec::new();
    let mut keywords = Vec::new();
    let mut domains = Vec::new();
    for entry in &group.rules {
        match entry.split_once(':') {
            Some(("domain_suffix", v)) => suffixes.push(v.to_string()),
            Some(("domain_keyword", v)) => keywords.push(v.to_string()),
            Some(("domain", v)) => domains.push(v.to_string()),
            _ => {}
        }
    }
    if suffixes.is_empty() && keywords.is_empty() && domains.is_empty() {
        return None;
    }
    let mut rule = serde_json::Map::new();
    if !domains.is_empty() {
        rule.insert("domain".into(), json!(domains));
    }
    if !suffixes.is_empty() {
        rule.insert("domain_suffix".into(), json!(suffixes));
    }
    if !keywords.is_empty() {
        rule.insert("domain_keyword".into(), json!(keywords));
    }
    rule.insert("outbound".into(), json!(outbound));
    Some(Value::Object(rule))
}

/// Minimal document for the disposable probe kernel: direct outbound, one
/// outbound per candidate, a single url-test group over all candidate tags,
/// control plane on the supplied loopback port.
pub fn build_probe_config(candidates: &[Node], control_port: u16) -> (BuildOutput, Vec<String>) {
    let mut broken = Vec::new();
    let mut outbounds: Vec<(String, Value)> = Vec::new();

    for node in candidates {
        match node_outbound(node) {
            Ok(entry) => outbounds.push(entry),
            Err(reason) => broken.push(broken_entry(node, reason)),
        }
    }
    outbounds.sort_by(|a, b| a.0.cmp(&b.0));
    outbounds.dedup_by(|a, b| a.0 == b.0);
    let tags: Vec<String> = outbounds.iter().map(|(tag, _)| tag.clone()).collect();

    let mut all_outbounds: Vec<Value> = vec![json!({"type": "direct", "tag": DIRECT_TAG})];
    for (_, outbound) in &outbounds {
        all_outbounds.push(outbound.clone());
    }
    if !tags.is_empty() {
        all_outbounds.push(json!({
            "type": "urltest",
            "tag": PROBE_GROUP_TAG,
            "outbounds": tags,
            "url": URLTEST_URL,
            "interval": "5m",
        }));
    }

    let document = json!({
        "log": {"level": "warn", "timestamp": true},
        "inbounds": [],
        "outbounds": all_outbounds,
        "experimental": {"clash_api": {
            "external_controller": format!("127.0.0.1:{}", control_port),
            "secret": "",
        }},
    });

    (
        BuildOutput { document, broken },
        tags,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NodeStatus, Settings};

    fn node(tag: &str, node_type: &str, settings: Value) -> Node {
        Node {
            id: 0,
            tag: tag.to_string(),
            name: tag.to_string(),
            source_tag: "manual".to_string(),
            node_type: node_type.to_string(),
            server: "1.2.3.4".to_string(),
            port: 443,
            settings,
            country_code: String::new(),
            country_flag: String::new(),
            status: NodeStatus::Verified,
            consecutive_failures: 0,
            favorite: false,
            created_at: 0,
            updated_at: 0,
            last_checked_at: None,
            archived_at: None,
        }
    }

    fn ss_node(tag: &str) -> Node {
        node(
            tag,
            "shadowsocks",
            json!({"method": "aes-256-gcm", "password": "secret"}),
        )
    }

    #[test]
    fn test_build_is_deterministic() {
        let settings = Settings::default();
        let nodes = vec![ss_node("b-node"), ss_node("a-node")];
        let a = build_config(&settings, &nodes, &[], &[]);
        let b = build_config(&settings, &nodes, &[], &[]);
        assert_eq!(a.document.to_string(), b.document.to_string());
    }

    #[test]
    fn test_outbounds_sorted_alphabetically() {
        let out = build_config(
            &Settings::default(),
            &[ss_node("zeta"), ss_node("alpha")],
            &[],
            &[],
        );
        let outbounds = out.document["outbounds"].as_array().unwrap();
        let node_tags: Vec<&str> = outbounds
            .iter()
            .filter(|o| o["type"] == "shadowsocks")
            .map(|o| o["tag"].as_str().unwrap())
            .collect();
        assert_eq!(node_tags, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_empty_nodes_still_has_direct() {
        let out = build_config(&Settings::default(), &[], &[], &[]);
        assert!(out.broken.is_empty());
        let outbounds = out.document["outbounds"].as_array().unwrap();
        assert!(outbounds.iter().any(|o| o["tag"] == DIRECT_TAG));
        // No url-test group without members.
        assert!(!outbounds.iter().any(|o| o["tag"] == AUTO_GROUP_TAG));
        // Selector falls back to direct alone.
        let selector = outbounds.iter().find(|o| o["tag"] == SELECTOR_TAG).unwrap();
        assert_eq!(selector["outbounds"], json!([DIRECT_TAG]));
    }

    #[test]
    fn test_unsupported_transport_reported_broken() {
        let bad = node("legacy", "ssr", json!({"password": "x"}));
        let out = build_config(&Settings::default(), &[ss_node("ok"), bad], &[], &[]);
        assert_eq!(out.broken.len(), 1);
        assert!(out.broken[0].reason.contains("unsupported transport"));
        let outbounds = out.document["outbounds"].as_array().unwrap();
        assert!(!outbounds.iter().any(|o| o["tag"] == "legacy"));
    }

    #[test]
    fn test_malformed_blob_reported_broken() {
        let bad = node("half", "shadowsocks", json!({"method": "aes-256-gcm"}));
        let out = build_config(&Settings::default(), &[bad], &[], &[]);
        assert_eq!(out.broken.len(), 1);
        assert!(out.broken[0].reason.contains("malformed"));
    }

    #[test]
    fn test_tag_sanitization() {
        assert_eq!(sanitize_tag("🇭🇰 HK | 01"), "HK---01");
        assert_eq!(sanitize_tag("plain-tag_1.x"), "plain-tag_1.x");
        assert_eq!(sanitize_tag("⚡⚡"), "");
    }

    #[test]
    fn test_allow_lan_binds_wildcard_and_secret() {
        let settings = Settings {
            allow_lan: true,
            clash_api_secret: "deadbeefdeadbeef".to_string(),
            ..Settings::default()
        };
        let out = build_config(&settings, &[ss_node("n1")], &[], &[]);
        assert_eq!(out.document["inbounds"][0]["listen"], "0.0.0.0");
        let api = &out.document["experimental"]["clash_api"];
        assert!(api["external_controller"]
            .as_str()
            .unwrap()
            .starts_with("0.0.0.0:"));
        assert_eq!(api["secret"], "deadbeefdeadbeef");
    }

    #[test]
    fn test_filter_groups_alphabetical() {
        let filters = vec![
            Filter {
                id: 1,
                name: "z".to_string(),
                target_group: "ZGroup".to_string(),
                include: vec!["n".to_string()],
                exclude: vec![],
            },
            Filter {
                id: 2,
                name: "a".to_string(),
                target_group: "AGroup".to_string(),
                include: vec!["n".to_string()],
                exclude: vec![],
            },
        ];
        let out = build_config(
            &Settings::default(),
            &[ss_node("n1"), ss_node("n2")],
            &filters,
            &[],
        );
        let outbounds = out.document["outbounds"].as_array().unwrap();
        let group_tags: Vec<&str> = outbounds
            .iter()
            .filter(|o| o["type"] == "selector" && o["tag"] != SELECTOR_TAG)
            .map(|o| o["tag"].as_str().unwrap())
            .collect();
        assert_eq!(group_tags, vec!["AGroup", "ZGroup"]);
    }

    #[test]
    fn test_rule_groups_render_route_rules() {
        let groups = vec![RuleGroup {
            id: 1,
            name: "media".to_string(),
            outbound_tag: "PROXY".to_string(),
            rules: vec![
                "domain_suffix:youtube.com".to_string(),
                "domain_keyword:google".to_string(),
                "bogus-entry".to_string(),
            ],
        }];
        let out = build_config(&Settings::default(), &[ss_node("n1")], &[], &groups);
        let rules = out.document["route"]["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0]["domain_suffix"], json!(["youtube.com"]));
        assert_eq!(rules[0]["domain_keyword"], json!(["google"]));
        assert_eq!(rules[0]["outbound"], "PROXY");
    }

    #[test]
    fn test_probe_config_shape() {
        let (out, tags) = build_probe_config(&[ss_node("n1"), ss_node("n2")], 19095);
        assert!(out.broken.is_empty());
        assert_eq!(tags, vec!["n1", "n2"]);
        let outbounds = out.document["outbounds"].as_array().unwrap();
        assert_eq!(outbounds[0]["tag"], DIRECT_TAG);
        let urltest = outbounds.iter().find(|o| o["type"] == "urltest").unwrap();
        assert_eq!(urltest["tag"], PROBE_GROUP_TAG);
        assert_eq!(urltest["outbounds"], json!(["n1", "n2"]));
        assert_eq!(
            out.document["experimental"]["clash_api"]["external_controller"],
            "127.0.0.1:19095"
        );
        assert!(out.document["inbounds"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_probe_config_all_broken() {
        let bad = node("legacy", "ssr", json!({}));
        let (out, tags) = build_probe_config(&[bad], 19095);
        assert!(tags.is_empty());
        assert_eq!(out.broken.len(), 1);
    }

    #[test]
    fn test_vmess_and_trojan_outbounds() {
        let vmess = node(
            "vm",
            "vmess",
            json!({"uuid": "11111111-2222-3333-4444-555555555555", "alter_id": 0}),
        );
        let trojan = node(
            "tj",
            "trojan",
            json!({"password": "pw", "tls": {"enabled": true, "server_name": "x.com"}}),
        );
        let out = build_config(&Settings::default(), &[vmess, trojan], &[], &[]);
        assert!(out.broken.is_empty());
        let outbounds = out.document["outbounds"].as_array().unwrap();
        let vm = outbounds.iter().find(|o| o["tag"] == "vm").unwrap();
        assert_eq!(vm["security"], "auto");
        let tj = outbounds.iter().find(|o| o["tag"] == "tj").unwrap();
        assert_eq!(tj["tls"]["server_name"], "x.com");
    }
}
