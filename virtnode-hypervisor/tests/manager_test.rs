//! Integration tests for the VM manager.
//!
//! These run the full manager against simulated nodes and scripted host
//! commands.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use virtnode_hypervisor::{
    ConsoleDescriptor, FaultCode, FaultDomain, FixedHost, HostResources, HypervisorFault, ManagerOptions,
    MemoryCounterStore, ScriptedRunner, SimulatedHypervisor, TemplateSettings, VirtError, VirtManager, VmState,
};
use virtnode_hypervisor::xml::XmlElement;

const CONTAINER_UUID: &str = "0f9c6d3e-5b1a-4c2e-9a7d-3e8f1b2c4d5e";

const FIXTURE: &str = r#"<node>
  <domain type="test" state="inactive">
    <name>vm1</name>
    <uuid>11111111-2222-3333-4444-555555555555</uuid>
    <memory>524288</memory>
    <vcpu>1</vcpu>
  </domain>
  <domain type="test">
    <name>vm2</name>
    <uuid>66666666-7777-8888-9999-000000000000</uuid>
    <memory>524288</memory>
    <vcpu>1</vcpu>
  </domain>
</node>"#;

const OPENVZ_OVF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1"
          xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1"
          xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData"
          xmlns:vssd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_VirtualSystemSettingData">
  <References>
    <File ovf:id="diskfile1" ovf:href="debian-7.tar.gz"/>
  </References>
  <DiskSection>
    <Disk ovf:diskId="vmdisk1" ovf:fileRef="diskfile1" ovf:capacity="10" ovf:capacityAllocUnits="byte * 2^30"/>
  </DiskSection>
  <VirtualSystem ovf:id="debian-7">
    <VirtualHardwareSection>
      <System>
        <vssd:VirtualSystemType>openvz</vssd:VirtualSystemType>
      </System>
      <Item>
        <rasd:ResourceType>3</rasd:ResourceType>
        <rasd:VirtualQuantity>1</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:AllocationUnits>MegaBytes</rasd:AllocationUnits>
        <rasd:ResourceType>4</rasd:ResourceType>
        <rasd:VirtualQuantity>512</rasd:VirtualQuantity>
      </Item>
    </VirtualHardwareSection>
  </VirtualSystem>
</Envelope>"#;

fn options(tmp: &Path) -> ManagerOptions {
    ManagerOptions {
        storage_endpoint: tmp.join("storage"),
        default_pool: Some("local".to_string()),
        snapshot_path: tmp.join("state.xml"),
        counter_dir: tmp.join("counters"),
        template_cache: tmp.join("cache"),
        ..ManagerOptions::default()
    }
}

fn openvz_node() -> SimulatedHypervisor {
    let sim = SimulatedHypervisor::new("openvz:///system", "OpenVZ");
    sim.add_domain(
        &format!(
            "<domain type='openvz'><name>101</name><uuid>{}</uuid><memory>524288</memory><vcpu>1</vcpu></domain>",
            CONTAINER_UUID
        ),
        true,
    )
    .unwrap();
    sim
}

fn snapshot_states(path: &Path) -> Vec<(String, String)> {
    let root = XmlElement::parse(&std::fs::read_to_string(path).unwrap()).unwrap();
    let mut states: Vec<(String, String)> = root
        .children_named("domain")
        .map(|d| {
            (
                d.child_text("name").unwrap_or_default().to_string(),
                d.attr("state").unwrap_or_default().to_string(),
            )
        })
        .collect();
    states.sort();
    states
}

/// Fixture sessions honour `state="inactive"` and leave a snapshot behind.
#[tokio::test]
async fn test_fixture_session_snapshot() {
    let tmp = TempDir::new().unwrap();
    let fixture = tmp.path().join("node.xml");
    std::fs::write(&fixture, FIXTURE).unwrap();
    let uri = format!("test://{}", fixture.display());

    let manager = VirtManager::builder(options(tmp.path()))
        .runner(Arc::new(ScriptedRunner::new()))
        .build();

    let vms = manager.list(&uri).await.unwrap();
    let names: Vec<(&str, VmState)> = vms.iter().map(|v| (v.name.as_str(), v.state)).collect();
    assert_eq!(names, vec![("vm2", VmState::Active), ("vm1", VmState::Inactive)]);

    manager
        .destroy(&uri, "66666666-7777-8888-9999-000000000000")
        .await
        .unwrap();
    assert_eq!(
        snapshot_states(&tmp.path().join("state.xml")),
        vec![
            ("vm1".to_string(), "inactive".to_string()),
            ("vm2".to_string(), "inactive".to_string()),
        ]
    );
}

/// A failed operation still records the node state.
#[tokio::test]
async fn test_snapshot_written_on_failure() {
    let tmp = TempDir::new().unwrap();
    let fixture = tmp.path().join("node.xml");
    std::fs::write(&fixture, FIXTURE).unwrap();
    let uri = format!("test://{}", fixture.display());

    let manager = VirtManager::builder(options(tmp.path()))
        .runner(Arc::new(ScriptedRunner::new()))
        .build();

    let result = manager.info(&uri, "00000000-0000-0000-0000-000000000000").await;
    assert!(result.is_err());
    assert!(tmp.path().join("state.xml").exists());
}

/// The default simulation node never writes snapshots.
#[tokio::test]
async fn test_default_node_has_no_snapshot() {
    let tmp = TempDir::new().unwrap();
    let manager = VirtManager::builder(options(tmp.path()))
        .runner(Arc::new(ScriptedRunner::new()))
        .build();

    assert_eq!(manager.list("test:///default").await.unwrap().len(), 1);
    assert!(!tmp.path().join("state.xml").exists());
}

#[tokio::test]
async fn test_allow_list_rejects_other_backends() {
    let tmp = TempDir::new().unwrap();
    let mut opts = options(tmp.path());
    opts.backends = vec!["openvz:///system".to_string()];
    let manager = VirtManager::builder(opts)
        .connector(Arc::new(openvz_node()))
        .runner(Arc::new(ScriptedRunner::new()))
        .build();

    let err = manager.list("qemu:///system").await.unwrap_err();
    assert!(matches!(err, VirtError::UnsupportedBackend(ref uri) if uri == "qemu:///system"));
}

/// Container records are filled in from `vzlist` and the guest probe.
#[tokio::test]
async fn test_openvz_records() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(
        ScriptedRunner::new()
            .respond("/dev/null", "")
            .respond("-o hostname", "web01")
            .respond("-o ostemplate", "debian-7")
            .respond("-o physpages.l", "131072")
            .respond("-o swappages.l", "unlimited")
            .respond("-o diskspace.h", "10485760")
            .respond("/proc/uptime", "3600.50 7000.10"),
    );
    let manager = VirtManager::builder(options(tmp.path()))
        .connector(Arc::new(openvz_node()))
        .runner(runner)
        .build();

    let vms = manager.list("openvz:///system").await.unwrap();
    assert_eq!(vms.len(), 1);

    let vm = &vms[0];
    assert_eq!(vm.uuid, CONTAINER_UUID);
    assert_eq!(vm.name, "web01");
    assert_eq!(vm.vm_type, "openvz");
    assert_eq!(vm.state, VmState::Active);
    assert_eq!(vm.memory, 512.0);
    assert_eq!(vm.swap, 0.0);
    assert_eq!(vm.uptime, Some(3600.5));
    assert_eq!(vm.diskspace.get("/"), Some(&10240.0));
    assert_eq!(vm.template.as_deref(), Some("debian-7"));
    assert_eq!(
        vm.consoles,
        vec![ConsoleDescriptor::OpenVz {
            cid: "101".to_string()
        }]
    );
    assert!(vm.interfaces.is_empty());
}

/// Missing container tooling reads as no running containers.
#[tokio::test]
async fn test_openvz_without_tooling() {
    let tmp = TempDir::new().unwrap();
    let manager = VirtManager::builder(options(tmp.path()))
        .connector(Arc::new(openvz_node()))
        .runner(Arc::new(ScriptedRunner::new().respond("/dev/null", "missing")))
        .build();

    assert!(manager.list("openvz:///system").await.unwrap().is_empty());
    assert!(manager.metrics("openvz:///system").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_openvz_metrics() {
    let tmp = TempDir::new().unwrap();
    let runner = Arc::new(
        ScriptedRunner::new()
            .respond("/dev/null", "")
            .respond("/proc/stat", "cpu  4705 150 1120 16250856 2009 12 95 0")
            .respond("/proc/loadavg", "0.42 0.30 0.12 1/85 2212")
            .respond("free -k", "Mem: 524288 102400 300000 1024 121888 400000")
            .respond("/proc/net/dev", "venet0: 5234112 4120 0 0 0 0 0 0 812004 3011 0 0 0 0 0 0")
            .respond(
                "df -P",
                "Filesystem 1024-blocks Used Available Capacity Mounted on\n/dev/simfs 10485760 2097152 8388608 20% /",
            ),
    );
    let manager = VirtManager::builder(options(tmp.path()))
        .connector(Arc::new(openvz_node()))
        .runner(runner)
        .counter_store(Arc::new(MemoryCounterStore::new()))
        .build();

    let metrics = manager.metrics("openvz:///system").await.unwrap();
    let sample = metrics.get(CONTAINER_UUID).unwrap();
    assert_eq!(sample.cpu_usage, 0.0);
    assert_eq!(sample.network_usage, 0.0);
    assert_eq!(sample.load, 0.42);
    assert_eq!(sample.memory_usage, 100.0);
    assert_eq!(sample.diskspace_usage, 2048.0);
}

fn enumeration_fault(domain: FaultDomain) -> HypervisorFault {
    HypervisorFault::new(FaultCode::OperationFailed, domain, "cannot enumerate domains")
}

/// An OpenVZ driver that cannot enumerate reports no containers.
#[tokio::test]
async fn test_openvz_enumeration_fault_is_empty() {
    let tmp = TempDir::new().unwrap();
    let node = openvz_node();
    node.inject_list_fault(Some(enumeration_fault(FaultDomain::OpenVz)));

    let manager = VirtManager::builder(options(tmp.path()))
        .connector(Arc::new(node))
        .runner(Arc::new(ScriptedRunner::new().respond("/dev/null", "")))
        .counter_store(Arc::new(MemoryCounterStore::new()))
        .build();

    assert!(manager.list("openvz:///system").await.unwrap().is_empty());
    assert!(manager.metrics("openvz:///system").await.unwrap().is_empty());
}

/// Outside OpenVZ an enumeration fault reaches the caller.
#[tokio::test]
async fn test_kvm_enumeration_fault_propagates() {
    let tmp = TempDir::new().unwrap();
    let node = SimulatedHypervisor::new("qemu:///system", "QEMU");
    node.add_domain("<domain type='kvm'><name>a</name><vcpu>1</vcpu></domain>", true)
        .unwrap();
    let fault = enumeration_fault(FaultDomain::Qemu);
    node.inject_list_fault(Some(fault.clone()));

    let manager = VirtManager::builder(options(tmp.path()))
        .connector(Arc::new(node.clone()))
        .runner(Arc::new(ScriptedRunner::new()))
        .build();

    match manager.list("qemu:///system").await.unwrap_err() {
        VirtError::Backend(raised) => assert_eq!(raised, fault),
        other => panic!("unexpected error: {other}"),
    }

    node.inject_list_fault(None);
    assert_eq!(manager.list("qemu:///system").await.unwrap().len(), 1);
}

/// Running VMs come first, each group in driver order.
#[tokio::test]
async fn test_list_orders_running_then_stopped() {
    let tmp = TempDir::new().unwrap();
    let node = SimulatedHypervisor::new("qemu:///system", "QEMU");
    for (name, running) in [("a", true), ("b", false), ("c", true), ("d", false)] {
        node.add_domain(
            &format!("<domain type='kvm'><name>{}</name><vcpu>1</vcpu></domain>", name),
            running,
        )
        .unwrap();
    }

    let manager = VirtManager::builder(options(tmp.path()))
        .connector(Arc::new(node))
        .runner(Arc::new(ScriptedRunner::new()))
        .build();

    let vms = manager.list("qemu:///system").await.unwrap();
    let order: Vec<(&str, VmState)> = vms.iter().map(|v| (v.name.as_str(), v.state)).collect();
    assert_eq!(
        order,
        vec![
            ("a", VmState::Active),
            ("c", VmState::Active),
            ("b", VmState::Inactive),
            ("d", VmState::Inactive),
        ]
    );
}

/// Deploy a container from a local template, end to end.
#[tokio::test]
async fn test_openvz_deploy() {
    let tmp = TempDir::new().unwrap();
    let opts = options(tmp.path());
    let unpacked = opts.storage_endpoint.join("local").join("openvz").join("unpacked");
    std::fs::create_dir_all(&unpacked).unwrap();
    std::fs::write(unpacked.join("debian-7.ovf"), OPENVZ_OVF).unwrap();
    std::fs::write(unpacked.join("debian-7.tar.gz"), b"archive").unwrap();

    let runner = Arc::new(
        ScriptedRunner::new()
            .respond("vzlist -H -a -o ctid", "101")
            .respond("vzctl create", "")
            .respond("vzctl set", ""),
    );
    let manager = VirtManager::builder(opts)
        .connector(Arc::new(openvz_node()))
        .runner(runner.clone())
        .host(Arc::new(FixedHost(HostResources {
            ram_gb: 8.0,
            cpu_count: 4,
            free_disk_gb: 100.0,
        })))
        .build();

    let templates = manager.local_templates("openvz:///system").await.unwrap();
    assert_eq!(templates.len(), 1);
    assert_eq!(templates[0].get_str("template_name").as_deref(), Some("debian-7"));
    assert_eq!(templates[0].get_f64("memory"), Some(0.5));

    let params = TemplateSettings::from_pairs([
        ("template_name", "debian-7"),
        ("vm_type", "openvz"),
        ("hostname", "web02"),
        ("memory", "1"),
    ]);
    manager.deploy("openvz:///system", params).await.unwrap();

    assert!(tmp.path().join("cache").join("debian-7.tar.gz").exists());
    assert_eq!(
        runner.executed(),
        vec![
            "vzlist -H -a -o ctid".to_string(),
            "vzctl create 102 --ostemplate 'debian-7'".to_string(),
            "vzctl set 102 --hostname 'web02' --ram 1G --swap 0.5G --cpus 1 --diskspace 10G \
             --nameserver '8.8.8.8' --save"
                .to_string(),
        ]
    );
}

/// A template that does not fit the host is refused before provisioning.
#[tokio::test]
async fn test_deploy_refuses_oversized_template() {
    let tmp = TempDir::new().unwrap();
    let opts = options(tmp.path());
    let unpacked = opts.storage_endpoint.join("local").join("openvz").join("unpacked");
    std::fs::create_dir_all(&unpacked).unwrap();
    std::fs::write(unpacked.join("debian-7.ovf"), OPENVZ_OVF).unwrap();

    let runner = Arc::new(ScriptedRunner::new());
    let manager = VirtManager::builder(opts)
        .connector(Arc::new(openvz_node()))
        .runner(runner.clone())
        .host(Arc::new(FixedHost(HostResources {
            ram_gb: 0.25,
            cpu_count: 1,
            free_disk_gb: 5.0,
        })))
        .build();

    let params = TemplateSettings::from_pairs([
        ("template_name", "debian-7"),
        ("vm_type", "openvz"),
        ("memory_min", "0.5"),
        ("disk_min", "8"),
    ]);
    let err = manager.deploy("openvz:///system", params).await.unwrap_err();
    match err {
        VirtError::ResourceAdjustment(errors) => assert_eq!(
            errors,
            vec![
                "Minimum required memory 0.5GB exceeds total available memory 0.25GB".to_string(),
                "Minimum required disk space 8GB exceeds available disk space 5GB".to_string(),
            ]
        ),
        other => panic!("unexpected error: {other}"),
    }
    assert!(runner.executed().is_empty());
}
