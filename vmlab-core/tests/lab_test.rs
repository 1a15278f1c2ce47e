//! Integration tests for the lab.
//!
//! A full `Lab` runs over the in-memory directory with a scripted host shell,
//! fake sessions and a probe that follows domain states.

use std::sync::Arc;
use std::time::Duration;
use vmlab_core::config::Config;
use vmlab_core::mock::{MockConnector, MockProbe, ScriptedShell};
use vmlab_core::{Lab, LabError, RunOptions, VmStatus};
use vmlab_hypervisor::{DomainDescriptor, DomainDirectory, DomainState, MockDirectory};

struct Fixture {
    directory: Arc<MockDirectory>,
    shell: Arc<ScriptedShell>,
    connector: Arc<MockConnector>,
    lab: Lab,
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.timeouts.poll_interval_secs = 1;
    config.timeouts.stop_secs = 1;
    config.timeouts.start_secs = Some(1);
    config.timeouts.start_settle_secs = 0;
    config.timeouts.power_off_settle_secs = 0;
    config.timeouts.pre_shutdown_settle_secs = 0;
    config
}

async fn fixture_with(config: Config) -> Fixture {
    let directory = Arc::new(MockDirectory::new());
    directory
        .define(
            &DomainDescriptor::new("web1")
                .with_description("Fedora 39")
                .with_network_mac("aa:bb:cc:dd:ee:01"),
        )
        .unwrap();
    directory
        .define(
            &DomainDescriptor::new("web2")
                .with_description("Red Hat Enterprise Linux 9")
                .with_network_mac("AA:BB:CC:DD:EE:2"),
        )
        .unwrap();

    let shell = Arc::new(ScriptedShell::new());
    shell.respond(
        "arp-scan",
        true,
        "Interface: virbr0, type: EN10MB\n10.0.0.5\taa:bb:cc:dd:ee:02\tQEMU\n",
    );

    let probe = Arc::new(MockProbe::new(directory.clone()));
    probe.bind("10.0.0.5", "web2");

    let connector = Arc::new(MockConnector::new());
    let lab = Lab::builder(config, directory.clone())
        .shell(shell.clone())
        .connector(connector.clone())
        .probe(probe)
        .build();
    lab.reload().await.unwrap();

    Fixture {
        directory,
        shell,
        connector,
        lab,
    }
}

async fn fixture() -> Fixture {
    fixture_with(fast_config()).await
}

/// Two domains, one answering the scan.
#[tokio::test]
async fn test_inventory_end_to_end() {
    let f = fixture().await;

    let attrs = f.lab.inventory().attributes();
    assert_eq!(attrs.len(), 2);
    assert_eq!(attrs["web1"].ip, "");
    assert_eq!(attrs["web1"].mac, "aa:bb:cc:dd:ee:01");
    assert_eq!(attrs["web2"].ip, "10.0.0.5");
    assert_eq!(attrs["web2"].mac, "aa:bb:cc:dd:ee:02");

    let web1 = f.lab.vm("web1").unwrap();
    let web2 = f.lab.vm("web2").unwrap();
    assert!(web1.is_fedora());
    assert!(!web1.is_rhel());
    assert!(web2.is_rhel());
    assert_eq!(
        web2.to_string(),
        r#"#<VM web2 ip:"10.0.0.5" mac:"aa:bb:cc:dd:ee:02">"#
    );

    assert_eq!(f.lab.vms().len(), 2);
    assert!(matches!(f.lab.vm("web3"), Err(LabError::VmNotFound(_))));

    let table = f.lab.table().await.unwrap();
    assert!(table.contains("web1"));
    assert!(table.contains("10.0.0.5"));
    assert!(table.contains("stopped"));
}

/// Starting waits for running and sets the hostname.
#[tokio::test]
async fn test_run_and_wait_sets_hostname() {
    let f = fixture().await;
    let web2 = f.lab.vm("web2").unwrap();

    web2.run_and_wait().await.unwrap();
    assert_eq!(web2.status().await.unwrap(), VmStatus::Running);
    assert!(web2.is_running().await.unwrap());
    assert_eq!(
        f.connector.commands_for("web2"),
        vec![
            "hostname web2.mydomain",
            "echo 127.0.0.1 web2 web2.mydomain >> /etc/hosts",
        ]
    );

    // Already running: no second start
    web2.run_and_wait().await.unwrap();
}

/// Hostname failures are logged, not fatal, and the hosts entry is still
/// written.
#[tokio::test]
async fn test_hostname_failure_is_swallowed() {
    let f = fixture().await;
    f.connector.respond("hostname", Some(1), "", "permission denied\n");

    let web2 = f.lab.vm("web2").unwrap();
    web2.run_and_wait().await.unwrap();
    assert_eq!(
        f.connector.commands_for("web2"),
        vec![
            "hostname web2.mydomain",
            "echo 127.0.0.1 web2 web2.mydomain >> /etc/hosts",
        ]
    );

    f.directory.set_state("web2", DomainState::Shutoff).unwrap();
    assert!(matches!(
        web2.set_hostname().await,
        Err(LabError::InvalidState(_))
    ));
}

/// A VM that never answers the scan cannot become running.
#[tokio::test]
async fn test_run_and_wait_times_out_without_address() {
    let f = fixture().await;
    let web1 = f.lab.vm("web1").unwrap();

    assert!(matches!(
        web1.run_and_wait().await,
        Err(LabError::InvalidState(_))
    ));
    assert_eq!(web1.status().await.unwrap(), VmStatus::NoConnection);
}

#[tokio::test]
async fn test_run_and_run_strict() {
    let f = fixture().await;
    f.directory.start_domain("web2").await.unwrap();
    f.connector.respond("false", Some(1), "", "");
    f.connector.respond("uname", Some(0), "Linux\n", "");

    let web2 = f.lab.vm("web2").unwrap();

    let result = web2.run("root", "uname", &RunOptions::default()).await.unwrap();
    assert!(result.success);
    assert_eq!(result.stdout, "Linux\n");

    let result = web2.run("root", "false", &RunOptions::default()).await.unwrap();
    assert!(!result.success);

    match web2.run_strict("root", "false", &RunOptions::default()).await {
        Err(LabError::CommandFailed { command }) => assert_eq!(command, "false"),
        other => panic!("expected CommandFailed, got {:?}", other),
    }

    let web1 = f.lab.vm("web1").unwrap();
    assert!(matches!(
        web1.run("root", "true", &RunOptions::default()).await,
        Err(LabError::NoIpAddress(_))
    ));
}

/// Restoring prunes every later snapshot; the target and its ancestors stay.
#[tokio::test]
async fn test_snapshot_restore_prunes_chain() {
    let f = fixture().await;
    let web2 = f.lab.vm("web2").unwrap();
    let snapshots = web2.snapshots();

    snapshots.take("s1").await.unwrap();
    snapshots.take("s2").await.unwrap();
    assert_eq!(snapshots.current_name().await.as_deref(), Some("s2"));
    assert_eq!(snapshots.current_parent_name().await.as_deref(), Some("s1"));
    snapshots.take("s3").await.unwrap();
    assert_eq!(snapshots.list().await.unwrap(), vec!["s1", "s2", "s3"]);

    snapshots.restore("s1").await.unwrap();
    assert_eq!(snapshots.list().await.unwrap(), vec!["s1"]);
    assert_eq!(snapshots.current_name().await.as_deref(), Some("s1"));
    assert_eq!(snapshots.current_parent_name().await, None);
}

/// Restoring an unknown snapshot changes nothing.
#[tokio::test]
async fn test_snapshot_restore_unknown() {
    let f = fixture().await;
    let web2 = f.lab.vm("web2").unwrap();
    let snapshots = web2.snapshots();

    assert!(matches!(
        snapshots.restore_last().await,
        Err(LabError::ArgumentError(_))
    ));

    snapshots.take("s1").await.unwrap();
    snapshots.take("s2").await.unwrap();

    assert!(matches!(
        snapshots.restore("nope").await,
        Err(LabError::ArgumentError(_))
    ));
    assert_eq!(snapshots.list().await.unwrap(), vec!["s1", "s2"]);
    assert_eq!(snapshots.current_name().await.as_deref(), Some("s2"));

    snapshots.restore_last().await.unwrap();
    assert_eq!(snapshots.list().await.unwrap(), vec!["s1", "s2"]);

    snapshots.delete("s1").await.unwrap();
    assert_eq!(snapshots.list().await.unwrap(), vec!["s2"]);
}

/// A take on a running VM stops it first; restore brings the saved state back.
#[tokio::test]
async fn test_snapshot_take_stops_vm() {
    let f = fixture().await;
    f.directory.start_domain("web2").await.unwrap();

    let web2 = f.lab.vm("web2").unwrap();
    web2.snapshots().take("clean").await.unwrap();
    assert_eq!(
        f.directory.domain_state("web2").await.unwrap(),
        DomainState::Shutoff
    );

    f.directory.start_domain("web2").await.unwrap();
    web2.snapshots().restore("clean").await.unwrap();
    assert_eq!(
        f.directory.domain_state("web2").await.unwrap(),
        DomainState::Shutoff
    );
}

#[tokio::test]
async fn test_current_snapshot_failure_is_none() {
    let f = fixture().await;
    let web2 = f.lab.vm("web2").unwrap();
    web2.snapshots().take("s1").await.unwrap();

    f.directory.set_current_snapshot_broken("web2", true).unwrap();
    assert_eq!(web2.snapshots().current_name().await, None);

    // The next snapshot simply has no parent
    web2.snapshots().take("s2").await.unwrap();
    f.directory.set_current_snapshot_broken("web2", false).unwrap();
    assert_eq!(web2.snapshots().current_parent_name().await, None);
}

/// A guest ignoring shutdown is powered off after the stop timeout.
#[tokio::test]
async fn test_stop_escalates_to_power_off() {
    let mut config = fast_config();
    config.guest.pre_shutdown_command = Some("systemctl stop app".to_string());
    let f = fixture_with(config).await;

    f.directory.start_domain("web2").await.unwrap();
    f.directory.set_ignores_shutdown("web2", true).unwrap();

    let web2 = f.lab.vm("web2").unwrap();
    web2.run("root", "true", &RunOptions::default()).await.unwrap();

    web2.stop_and_wait().await.unwrap();
    assert_eq!(
        f.directory.domain_state("web2").await.unwrap(),
        DomainState::Shutoff
    );
    assert_eq!(web2.status().await.unwrap(), VmStatus::Stopped);
    assert!(f
        .connector
        .commands_for("web2")
        .contains(&"systemctl stop app".to_string()));
    assert_eq!(f.lab.executor().sessions().open_count().await, 0);
}

#[tokio::test]
async fn test_graceful_stop() {
    let f = fixture().await;
    f.directory.start_domain("web2").await.unwrap();

    let web2 = f.lab.vm("web2").unwrap();
    web2.stop_and_wait().await.unwrap();
    assert_eq!(web2.status().await.unwrap(), VmStatus::Stopped);

    // Stopping a stopped VM is a no-op
    web2.stop_and_wait().await.unwrap();
}

#[tokio::test]
async fn test_power_off_closes_sessions() {
    let f = fixture().await;
    f.directory.start_domain("web2").await.unwrap();

    let web2 = f.lab.vm("web2").unwrap();
    web2.run("root", "true", &RunOptions::default()).await.unwrap();
    web2.run("admin", "true", &RunOptions::default()).await.unwrap();

    web2.power_off().await.unwrap();
    assert_eq!(f.connector.closed(), 2);
    assert!(!f.directory.domain_state("web2").await.unwrap().is_active());

    // Powering off a stopped VM is harmless
    web2.power_off().await.unwrap();
}

#[tokio::test]
async fn test_clone_takes_initial_snapshot() {
    let f = fixture().await;
    f.shell.respond("virt-clone", true, "");
    // Stand-in for the domain the clone tool defines
    f.directory
        .define(&DomainDescriptor::new("web3").with_network_mac("aa:bb:cc:dd:ee:03"))
        .unwrap();

    let web2 = f.lab.vm("web2").unwrap();
    let web3 = web2.clone_vm("web3", "base").await.unwrap();

    assert_eq!(web3.name(), "web3");
    assert_eq!(web3.snapshots().list().await.unwrap(), vec!["base"]);
    assert!(f.shell.commands().contains(
        &"virt-clone --connect=test:///default --original=web2 --name=web3 --auto-clone"
            .to_string()
    ));
}

#[tokio::test]
async fn test_clone_failures() {
    let f = fixture().await;
    let web2 = f.lab.vm("web2").unwrap();

    f.shell.respond("virt-clone", false, "");
    assert!(matches!(
        web2.clone_vm("web3", "base").await,
        Err(LabError::CommandFailed { .. })
    ));

    // Tool succeeded but no domain appeared
    f.shell.respond("virt-clone", true, "");
    assert!(matches!(
        web2.clone_vm("web3", "base").await,
        Err(LabError::VmNotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_running_vm() {
    let f = fixture().await;
    f.directory.start_domain("web2").await.unwrap();

    let web2 = f.lab.vm("web2").unwrap();
    web2.delete().await.unwrap();

    assert!(!f.directory.contains("web2"));
    assert!(matches!(f.lab.vm("web2"), Err(LabError::VmNotFound(_))));
    assert_eq!(f.lab.vms().len(), 1);
}

#[tokio::test]
async fn test_delete_vm_with_snapshots() {
    let f = fixture().await;
    let web2 = f.lab.vm("web2").unwrap();
    web2.snapshots().take("base").await.unwrap();

    web2.delete().await.unwrap();
    assert!(!f.directory.contains("web2"));
    assert!(f.directory.list_snapshots("web2").await.is_err());
}

#[tokio::test]
async fn test_setup_resources() {
    let f = fixture().await;
    f.shell.respond("virt-xml", true, "");
    let web1 = f.lab.vm("web1").unwrap();

    web1.setup_resources(2048, 2).await.unwrap();
    assert!(f.shell.commands().contains(
        &"virt-xml web1 --connect test:///default --edit --vcpus 2 --memory 2048".to_string()
    ));

    f.directory.start_domain("web1").await.unwrap();
    assert!(matches!(
        web1.setup_resources(4096, 4).await,
        Err(LabError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_connect_command() {
    let f = fixture().await;
    let web2 = f.lab.vm("web2").unwrap();

    assert_eq!(
        web2.connect_command("root", false).unwrap().join(" "),
        "ssh root@10.0.0.5 -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no"
    );
    assert_eq!(
        web2.connect_command("admin", true).unwrap().join(" "),
        "sudo ssh admin@10.0.0.5 -L 443:localhost:443 \
         -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no"
    );

    let web1 = f.lab.vm("web1").unwrap();
    assert!(matches!(
        web1.connect_command("root", false),
        Err(LabError::NoIpAddress(_))
    ));
}

#[tokio::test]
async fn test_safe_name() {
    let f = fixture().await;
    f.directory
        .define(&DomainDescriptor::new("Very_Long Name-With+Chars-and-more-stuff"))
        .unwrap();
    f.directory
        .define(&DomainDescriptor::new("abcdefghijklmnopqrstuvwxyz0_x"))
        .unwrap();
    f.lab.reload().await.unwrap();

    let long = f.lab.vm("Very_Long Name-With+Chars-and-more-stuff").unwrap();
    assert_eq!(long.safe_name(), "Very-Long-Name-With-Chars-an");

    let trailing = f.lab.vm("abcdefghijklmnopqrstuvwxyz0_x").unwrap();
    assert_eq!(trailing.safe_name(), "abcdefghijklmnopqrstuvwxyz0");

    assert_eq!(f.lab.vm("web1").unwrap().safe_name(), "web1");
}

#[tokio::test]
async fn test_wait_for_status() {
    let f = fixture().await;
    let web2 = f.lab.vm("web2").unwrap();

    assert!(!web2
        .wait_for(VmStatus::Running, Some(Duration::from_millis(10)))
        .await
        .unwrap());

    f.directory.start_domain("web2").await.unwrap();
    assert!(web2
        .wait_for(VmStatus::Running, Some(Duration::from_secs(1)))
        .await
        .unwrap());
}
