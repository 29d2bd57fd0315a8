//! Selection-order and circuit-breaker properties over registry snapshots.

use mirrorgate::error::ProxyError;
use mirrorgate::mirror::{
    selector, HealthState, Mirror, MirrorAuth, MirrorRegistry, ProbeOutcome,
};

fn mirror(id: i64, prefix: &str, latency: Option<u64>, health: HealthState, enabled: bool) -> Mirror {
    Mirror {
        id,
        prefix: prefix.to_string(),
        upstream_url: format!("https://m{}.example", id),
        upstream_host: format!("m{}.example", id),
        auth: MirrorAuth::None,
        enabled,
        health,
        latency_ms: latency,
        consecutive_failures: 0,
        last_probe_at: None,
    }
}

/// For a pile of synthetic snapshots: the selected mirror's latency never
/// exceeds that of any other enabled, healthy mirror with the prefix.
#[tokio::test]
async fn test_selection_is_minimal_over_snapshots() {
    let snapshots: Vec<Vec<Mirror>> = vec![
        vec![
            mirror(1, "dockerhub", Some(50), HealthState::Healthy, true),
            mirror(2, "dockerhub", Some(20), HealthState::Healthy, true),
            mirror(3, "dockerhub", Some(20), HealthState::Healthy, true),
            mirror(4, "dockerhub", None, HealthState::Unknown, true),
        ],
        vec![
            mirror(1, "dockerhub", Some(5), HealthState::Unhealthy, true),
            mirror(2, "dockerhub", Some(900), HealthState::Healthy, true),
        ],
        vec![
            mirror(1, "dockerhub", Some(5), HealthState::Healthy, false),
            mirror(2, "dockerhub", Some(300), HealthState::Healthy, true),
            mirror(3, "ghcr", Some(1), HealthState::Healthy, true),
        ],
        vec![
            mirror(9, "dockerhub", None, HealthState::Unknown, true),
            mirror(10, "dockerhub", None, HealthState::Unknown, true),
        ],
    ];

    for mirrors in snapshots {
        let registry = MirrorRegistry::new();
        registry.replace_all(mirrors).await;

        let selected = selector::select(&registry, "dockerhub").await.unwrap();
        assert!(selected.enabled);
        assert_ne!(selected.health, HealthState::Unhealthy);
        assert_eq!(selected.prefix, "dockerhub");

        for other in registry.list_by_prefix("dockerhub", true).await {
            assert!(
                selected.latency_ms.unwrap_or(u64::MAX) <= other.latency_ms.unwrap_or(u64::MAX),
                "selected {:?} beaten by {:?}",
                selected,
                other
            );
        }
    }
}

#[tokio::test]
async fn test_single_failure_opens_the_circuit() {
    let registry = MirrorRegistry::new();
    registry
        .replace_all(vec![
            mirror(1, "dockerhub", Some(10), HealthState::Healthy, true),
            mirror(2, "dockerhub", Some(40), HealthState::Healthy, true),
        ])
        .await;

    // One failed probe excludes the mirror.
    registry.update_health(1, ProbeOutcome::Failure).await;
    let selected = selector::select(&registry, "dockerhub").await.unwrap();
    assert_eq!(selected.id, 2);

    // It stays excluded across further failures.
    registry.update_health(1, ProbeOutcome::Failure).await;
    assert_eq!(
        selector::select(&registry, "dockerhub").await.unwrap().id,
        2
    );

    // A successful probe closes the circuit and it wins again on latency.
    registry
        .update_health(1, ProbeOutcome::Success { latency_ms: 10 })
        .await;
    let recovered = selector::select(&registry, "dockerhub").await.unwrap();
    assert_eq!(recovered.id, 1);
    assert_eq!(recovered.consecutive_failures, 0);
}

#[tokio::test]
async fn test_all_unhealthy_is_no_upstream() {
    let registry = MirrorRegistry::new();
    registry
        .replace_all(vec![mirror(1, "quay", Some(10), HealthState::Healthy, true)])
        .await;
    registry.update_health(1, ProbeOutcome::Failure).await;

    let err = selector::select(&registry, "quay").await.unwrap_err();
    assert!(matches!(err, ProxyError::NoUpstream { .. }));
}

#[tokio::test]
async fn test_prefixes_are_isolated() {
    let registry = MirrorRegistry::new();
    registry
        .replace_all(vec![
            mirror(1, "dockerhub", Some(500), HealthState::Healthy, true),
            mirror(2, "ghcr", Some(1), HealthState::Healthy, true),
        ])
        .await;

    // The faster ghcr mirror must never answer for dockerhub.
    assert_eq!(
        selector::select(&registry, "dockerhub").await.unwrap().id,
        1
    );
    assert_eq!(selector::select(&registry, "ghcr").await.unwrap().id, 2);
}

#[tokio::test]
async fn test_failure_counter_accumulates_and_resets() {
    let registry = MirrorRegistry::new();
    registry
        .replace_all(vec![mirror(1, "dockerhub", Some(10), HealthState::Healthy, true)])
        .await;

    for expected in 1..=3u32 {
        registry.update_health(1, ProbeOutcome::Failure).await;
        let m = registry.get_by_id(1).await.unwrap();
        assert_eq!(m.consecutive_failures, expected);
        assert_eq!(m.health, HealthState::Unhealthy);
    }

    registry
        .update_health(1, ProbeOutcome::Success { latency_ms: 7 })
        .await;
    let m = registry.get_by_id(1).await.unwrap();
    assert_eq!(m.consecutive_failures, 0);
    assert_eq!(m.health, HealthState::Healthy);
    assert_eq!(m.latency_ms, Some(7));
    assert!(m.last_probe_at.is_some());
}
