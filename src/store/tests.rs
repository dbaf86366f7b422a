use super::types::*;
use super::Store;
use crate::error::ManagerError;

fn candidate(tag: &str, server: &str, port: u16) -> NodeCandidate {
    NodeCandidate {
        tag: tag.to_string(),
        name: String::new(),
        source_tag: "manual".to_string(),
        node_type: "shadowsocks".to_string(),
        server: server.to_string(),
        port,
        settings: serde_json::json!({"method": "aes-256-gcm", "password": "x"}),
        country_code: String::new(),
        country_flag: String::new(),
    }
}

#[test]
fn test_bulk_add_inserts_pending() {
    let store = Store::open_in_memory().unwrap();
    let inserted = store
        .add_nodes_bulk(&[candidate("n1", "1.2.3.4", 443), candidate("n2", "5.6.7.8", 8443)])
        .unwrap();
    assert_eq!(inserted, 2);

    let pending = store.get_nodes(NodeStatus::Pending).unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|n| n.consecutive_failures == 0));
}

#[test]
fn test_bulk_add_is_idempotent_on_endpoint() {
    let store = Store::open_in_memory().unwrap();
    store.add_nodes_bulk(&[candidate("n1", "1.2.3.4", 443)]).unwrap();
    store.promote_node(store.find_node("1.2.3.4", 443).unwrap().unwrap().id).unwrap();

    // Same endpoint again, different source — updates in place.
    let mut again = candidate("renamed", "1.2.3.4", 443);
    again.source_tag = "sub-a".to_string();
    let inserted = store.add_nodes_bulk(&[again]).unwrap();
    assert_eq!(inserted, 0);

    let node = store.find_node("1.2.3.4", 443).unwrap().unwrap();
    // Status and counter are untouched by the upsert.
    assert_eq!(node.status, NodeStatus::Verified);
    assert_eq!(node.source_tag, "sub-a");
    assert_eq!(store.get_all_nodes().unwrap().len(), 1);
}

#[test]
fn test_tag_collision_gets_suffixed() {
    let store = Store::open_in_memory().unwrap();
    store.add_nodes_bulk(&[candidate("n1", "1.2.3.4", 443)]).unwrap();
    store.add_nodes_bulk(&[candidate("n1", "9.9.9.9", 443)]).unwrap();

    let nodes = store.get_all_nodes().unwrap();
    assert_eq!(nodes.len(), 2);
    let tags: Vec<&str> = nodes.iter().map(|n| n.tag.as_str()).collect();
    assert!(tags.contains(&"n1"));
    assert!(tags.contains(&"n1-2"));
}

#[test]
fn test_promote_requires_pending() {
    let store = Store::open_in_memory().unwrap();
    store.add_nodes_bulk(&[candidate("n1", "1.2.3.4", 443)]).unwrap();
    let id = store.find_node("1.2.3.4", 443).unwrap().unwrap().id;

    store.promote_node(id).unwrap();
    let node = store.get_node(id).unwrap();
    assert_eq!(node.status, NodeStatus::Verified);
    assert!(node.last_checked_at.is_some());

    // Promoting again conflicts.
    match store.promote_node(id) {
        Err(ManagerError::Conflict(_)) => {}
        other => panic!("expected Conflict, got {:?}", other),
    }
}

#[test]
fn test_demote_keeps_failure_counter() {
    let store = Store::open_in_memory().unwrap();
    store.add_nodes_bulk(&[candidate("n1", "1.2.3.4", 443)]).unwrap();
    let id = store.find_node("1.2.3.4", 443).unwrap().unwrap().id;

    store.increment_consecutive_failures(id).unwrap();
    store.increment_consecutive_failures(id).unwrap();
    store.promote_node(id).unwrap();
    // promote resets
    assert_eq!(store.get_node(id).unwrap().consecutive_failures, 0);

    store.increment_consecutive_failures(id).unwrap();
    store.demote_node(id).unwrap();
    let node = store.get_node(id).unwrap();
    assert_eq!(node.status, NodeStatus::Pending);
    assert_eq!(node.consecutive_failures, 1);
}

#[test]
fn test_archive_stamps_archived_at() {
    let store = Store::open_in_memory().unwrap();
    store.add_nodes_bulk(&[candidate("n1", "1.2.3.4", 443)]).unwrap();
    let id = store.find_node("1.2.3.4", 443).unwrap().unwrap().id;

    store.archive_node(id).unwrap();
    let node = store.get_node(id).unwrap();
    assert_eq!(node.status, NodeStatus::Archived);
    assert!(node.archived_at.is_some());

    // archived ⇔ archived_at: unarchive clears both.
    store.unarchive_node(id).unwrap();
    let node = store.get_node(id).unwrap();
    assert_eq!(node.status, NodeStatus::Pending);
    assert!(node.archived_at.is_none());
    assert_eq!(node.consecutive_failures, 0);
}

#[test]
fn test_unarchive_requires_archived() {
    let store = Store::open_in_memory().unwrap();
    store.add_nodes_bulk(&[candidate("n1", "1.2.3.4", 443)]).unwrap();
    let id = store.find_node("1.2.3.4", 443).unwrap().unwrap().id;
    assert!(matches!(
        store.unarchive_node(id),
        Err(ManagerError::Conflict(_))
    ));
}

#[test]
fn test_increment_returns_new_count() {
    let store = Store::open_in_memory().unwrap();
    store.add_nodes_bulk(&[candidate("n1", "1.2.3.4", 443)]).unwrap();
    let id = store.find_node("1.2.3.4", 443).unwrap().unwrap().id;

    assert_eq!(store.increment_consecutive_failures(id).unwrap(), 1);
    assert_eq!(store.increment_consecutive_failures(id).unwrap(), 2);
    store.reset_consecutive_failures(id).unwrap();
    assert_eq!(store.get_node(id).unwrap().consecutive_failures, 0);
}

#[test]
fn test_missing_node_is_not_found() {
    let store = Store::open_in_memory().unwrap();
    assert!(matches!(store.get_node(99), Err(ManagerError::NotFound(_))));
    assert!(matches!(store.promote_node(99), Err(ManagerError::NotFound(_))));
    assert!(matches!(
        store.increment_consecutive_failures(99),
        Err(ManagerError::NotFound(_))
    ));
}

#[test]
fn test_latest_measurements_newest_per_endpoint() {
    let store = Store::open_in_memory().unwrap();
    let m = |tag: &str, alive: bool, latency: u32| HealthMeasurement {
        server: "1.2.3.4".to_string(),
        port: 443,
        tag: tag.to_string(),
        timestamp: 0,
        alive,
        latency_ms: latency,
        mode: MeasureMode::Probe,
    };
    store.add_health_measurements(&[m("n1", false, 0), m("n1", true, 120)]).unwrap();
    store
        .add_health_measurements(&[HealthMeasurement {
            server: "5.6.7.8".to_string(),
            port: 8443,
            tag: "n2".to_string(),
            timestamp: 0,
            alive: true,
            latency_ms: 80,
            mode: MeasureMode::Tcp,
        }])
        .unwrap();

    let latest = store.get_latest_measurements(10).unwrap();
    assert_eq!(latest.len(), 2);
    let n1 = latest.iter().find(|m| m.tag == "n1").unwrap();
    assert!(n1.alive);
    assert_eq!(n1.latency_ms, 120);
}

#[test]
fn test_activity_log_is_bounded_fifo() {
    let store = Store::open_in_memory().unwrap();
    for i in 0..super::ACTIVITY_LOG_CAP + 25 {
        store
            .add_activity_event("verify:progress", &format!("event {}", i))
            .unwrap();
    }
    let events = store.get_activity_events(2000).unwrap();
    assert_eq!(events.len(), super::ACTIVITY_LOG_CAP);
    // Newest first; the oldest 25 were evicted.
    assert_eq!(events[0].message, format!("event {}", super::ACTIVITY_LOG_CAP + 24));
    assert_eq!(events.last().unwrap().message, "event 25");
}

#[test]
fn test_subscription_crud() {
    let store = Store::open_in_memory().unwrap();
    let sub = store
        .add_subscription("prov", "https://example.com/sub", &PipelineSettings::default())
        .unwrap();
    assert!(sub.enabled);
    assert!(sub.last_updated_at.is_none());

    // Duplicate name conflicts.
    assert!(matches!(
        store.add_subscription("prov", "https://other", &PipelineSettings::default()),
        Err(ManagerError::Conflict(_))
    ));

    store
        .touch_subscription(
            sub.id,
            Some(&TrafficInfo { upload: 1, download: 2, total: 100, expire: None }),
        )
        .unwrap();
    let sub = store.get_subscription(sub.id).unwrap();
    assert!(sub.last_updated_at.is_some());
    assert_eq!(sub.traffic.as_ref().unwrap().total, 100);

    store.delete_subscription(sub.id).unwrap();
    assert!(store.list_subscriptions().unwrap().is_empty());
}

#[test]
fn test_settings_roundtrip_applies_rules() {
    let store = Store::open_in_memory().unwrap();
    // Defaults when nothing stored yet.
    assert_eq!(store.get_settings().unwrap().archive_threshold, 10);

    let effective = store
        .update_settings(Settings {
            allow_lan: true,
            archive_threshold: 0,
            ..Settings::default()
        })
        .unwrap();
    assert_eq!(effective.archive_threshold, 10);
    assert_eq!(effective.clash_api_secret.len(), 16);

    // Secret survives a second LAN-on update.
    let secret = effective.clash_api_secret.clone();
    let effective = store
        .update_settings(Settings {
            allow_lan: true,
            archive_threshold: 5,
            ..Settings::default()
        })
        .unwrap();
    assert_eq!(effective.clash_api_secret, secret);
    assert_eq!(effective.archive_threshold, 5);

    // LAN off clears it.
    let effective = store.update_settings(Settings::default()).unwrap();
    assert!(effective.clash_api_secret.is_empty());
    assert_eq!(store.get_settings().unwrap().clash_api_secret, "");
}

#[test]
fn test_verification_log_roundtrip() {
    let store = Store::open_in_memory().unwrap();
    store
        .add_verification_log(&VerificationRun {
            started_at: 0,
            pending_checked: 3,
            pending_promoted: 1,
            pending_archived: 1,
            verified_checked: 2,
            verified_demoted: 1,
            duration_ms: 1500,
            error: None,
        })
        .unwrap();
    let logs = store.get_verification_logs(5).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].pending_promoted, 1);
    assert!(logs[0].started_at > 0);
}

#[test]
fn test_filters_and_rule_groups_sorted_by_name() {
    let store = Store::open_in_memory().unwrap();
    store
        .add_filter(&Filter {
            id: 0,
            name: "zz".to_string(),
            target_group: "Z".to_string(),
            include: vec!["z".to_string()],
            exclude: vec![],
        })
        .unwrap();
    store
        .add_filter(&Filter {
            id: 0,
            name: "aa".to_string(),
            target_group: "A".to_string(),
            include: vec![],
            exclude: vec![],
        })
        .unwrap();
    let filters = store.list_filters().unwrap();
    assert_eq!(filters[0].name, "aa");
    assert_eq!(filters[1].name, "zz");

    store
        .add_rule_group(&RuleGroup {
            id: 0,
            name: "media".to_string(),
            outbound_tag: "PROXY".to_string(),
            rules: vec!["domain_suffix:youtube.com".to_string()],
        })
        .unwrap();
    let groups = store.list_rule_groups().unwrap();
    assert_eq!(groups[0].rules.len(), 1);
}
