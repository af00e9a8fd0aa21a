//! End-to-end fabric tests.
//!
//! The kernel-mutating scenarios require root and live `ip`/`iptables`
//! binaries; they are ignored by default and run explicitly on a privileged
//! host.

use netfab_worker::nat::{PortForwardSelector, PortForwardSpec};
use netfab_worker::tuntap::TunTapSpec;
use netfab_worker::types::{BridgeBackend, Protocol, TunTapKind};
use netfab_worker::{ErrorKind, Fabric, FabricConfig};

#[tokio::test]
async fn test_tun_with_bridge_rejected_without_side_effects() {
    let fabric = Fabric::ephemeral().unwrap();

    let mut spec = TunTapSpec::new("tun0", TunTapKind::Tun);
    spec.bridge = Some("br-test".to_string());
    let err = fabric.tuntaps.create(spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    // Nothing was recorded: the request never touched a backend.
    assert!(fabric.registry().tuntaps().await.is_empty());
}

#[tokio::test]
async fn test_registry_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = FabricConfig {
        state_db: dir.path().join("state.db"),
        ..FabricConfig::default()
    };

    {
        let fabric = Fabric::open(config.clone()).unwrap();
        let mut rule = netfab_worker::types::NatRuleRecord::new(
            "ab12cd34",
            netfab_worker::types::NatRuleKind::Dnat,
            Protocol::Tcp,
        );
        rule.port = Some(8080);
        rule.state = netfab_worker::types::RuleState::Active;
        fabric.registry().upsert_nat_rule(rule).await;
    }

    let fabric = Fabric::open(config).unwrap();
    let rule = fabric.registry().nat_rule("ab12cd34").await.unwrap();
    assert_eq!(rule.port, Some(8080));
}

#[tokio::test]
#[ignore] // Requires root privileges, ip(8), and iptables
async fn test_bridge_and_port_forward_scenario() {
    let fabric = Fabric::ephemeral().unwrap();

    // Create a kernel bridge.
    fabric
        .bridges
        .create("br-test", BridgeBackend::Kernel, false)
        .await
        .expect("create bridge");

    // Forward 8080/tcp to an internal address.
    let rule_id = fabric
        .nat
        .add_port_forward(PortForwardSpec {
            external_port: 8080,
            internal_ip: "10.0.0.5".parse().unwrap(),
            internal_port: 80,
            protocol: Protocol::Tcp,
            interface: None,
            description: Some("test forward".to_string()),
        })
        .await
        .expect("add port forward");

    // The live listing shows exactly that mapping.
    let rules = fabric.nat.list_nat_rules().await.expect("list rules");
    let forward = rules
        .port_forwards
        .iter()
        .find(|r| r.id == rule_id)
        .expect("forward listed");
    assert_eq!(forward.port, Some(8080));
    assert_eq!(forward.target_ip.unwrap().to_string(), "10.0.0.5");
    assert_eq!(forward.target_port, Some(80));

    // A second claim on the same (port, protocol) conflicts.
    let err = fabric
        .nat
        .add_port_forward(PortForwardSpec {
            external_port: 8080,
            internal_ip: "10.0.0.9".parse().unwrap(),
            internal_port: 90,
            protocol: Protocol::Tcp,
            interface: None,
            description: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // Delete by rule id; both companion rules come out.
    let report = fabric
        .nat
        .remove_port_forward(PortForwardSelector {
            rule_id: Some(rule_id.clone()),
            ..Default::default()
        })
        .await
        .expect("remove port forward");
    assert_eq!(report.removed.len(), 2);
    assert!(report.failed.is_empty());

    let rules = fabric.nat.list_nat_rules().await.expect("list rules");
    assert!(!rules.port_forwards.iter().any(|r| r.id == rule_id));

    // With the forward gone, the same key is claimable again.
    let second = fabric
        .nat
        .add_port_forward(PortForwardSpec {
            external_port: 8080,
            internal_ip: "10.0.0.9".parse().unwrap(),
            internal_port: 90,
            protocol: Protocol::Tcp,
            interface: None,
            description: None,
        })
        .await
        .expect("re-add after removal");
    fabric
        .nat
        .remove_port_forward(PortForwardSelector {
            rule_id: Some(second),
            ..Default::default()
        })
        .await
        .expect("cleanup second forward");

    // The bridge has no ports, so a plain delete succeeds.
    fabric
        .bridges
        .delete("br-test", false)
        .await
        .expect("delete bridge");
}

#[tokio::test]
#[ignore] // Requires root privileges and ip(8)
async fn test_bridge_port_round_trip() {
    let fabric = Fabric::ephemeral().unwrap();

    fabric
        .bridges
        .create("br-rt", BridgeBackend::Kernel, false)
        .await
        .expect("create bridge");
    fabric
        .tuntaps
        .create(TunTapSpec::new("tap-rt", TunTapKind::Tap))
        .await
        .expect("create tap");

    fabric
        .bridges
        .add_port("br-rt", "tap-rt", None)
        .await
        .expect("add port");
    let bridge = fabric.bridges.get("br-rt").await.expect("get bridge");
    assert!(bridge.ports.contains("tap-rt"));

    fabric
        .bridges
        .remove_port("br-rt", "tap-rt")
        .await
        .expect("remove port");
    let bridges = fabric.bridges.list().await.expect("list bridges");
    let bridge = bridges.iter().find(|b| b.name == "br-rt").expect("bridge listed");
    assert!(!bridge.ports.contains("tap-rt"));

    fabric.tuntaps.delete("tap-rt").await.expect("delete tap");
    fabric.bridges.delete("br-rt", false).await.expect("delete bridge");
}
