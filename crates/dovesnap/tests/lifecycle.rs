//! Network and endpoint lifecycle against in-memory adapters.
mod common;

use std::error::Error;
use std::sync::Arc;

use common::{FaucetCall, Fakes, container, options, settings, start};
use dovesnap::docker::{LABEL_MIRROR, LABEL_PORT_ACL};
use dovesnap::driver::options::{OPT_ADD_PORTS, OPT_DHCP, OPT_DPID, OPT_MODE, OPT_NAT_ACL};
use dovesnap::driver::{Gateway, NetworkOptions, PublishedPort};
use dovesnap::stack::{StackIdentity, setup_host_bridges};
use dovesnap::ResourceManager;
use dovesnap_common::{DovesnapError, truncate_id};
use dovesnap_network::switch::{MIRROR_BRIDGE, OFPP_LOCAL};
use dovesnap_network::{Protocol, VethPair};

type TestResult = Result<(), Box<dyn Error>>;

const NET: &str = "4f1e0b9c2a7d";
const EP: &str = "9a8b7c6d5e4f";
const CID: &str = "c0ffee123456";

#[test_log::test(tokio::test)]
async fn create_then_delete_leaves_nothing() -> TestResult {
    let fakes = Fakes::default();
    fakes.runtime.add_network(NET, "net1", &[]);
    let handle = start(&fakes, settings());

    handle
        .create_network(options(NET, &[(OPT_DPID, "0x10"), (OPT_ADD_PORTS, "enp1s0")])?)
        .await?;
    let snapshot = handle.query().await?;
    let network = snapshot.network(NET).ok_or("network missing")?;
    let bridge = network.state.bridge_name.clone();
    assert_eq!(network.state.network_name, "net1");
    assert_eq!(network.state.dp_id, 16);
    assert_eq!(network.state.external_ports["enp1s0"].ofport, 1);

    // One document for the new datapath, naming the physical port
    let doc = fakes.faucet.merged();
    let port = &doc.dps["net1"].interfaces[&1];
    assert_eq!(port.description.as_deref(), Some("Physical interface enp1s0"));
    assert_eq!(port.native_vlan, Some(100));

    handle.delete_network(NET).await?;
    assert!(handle.query().await?.networks.is_empty());
    assert!(!fakes.switch.has_bridge(&bridge));
    assert!(fakes.faucet.calls().contains(&FaucetCall::DeleteDp("net1".into())));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn join_assigns_one_port_and_leave_removes_it() -> TestResult {
    let fakes = Fakes::default();
    fakes.runtime.add_network(NET, "net1", &[]);
    fakes.runtime.add_container(
        NET,
        EP,
        container(CID, "web", &[(LABEL_PORT_ACL, "allowall")]),
        Some("10.0.0.2/24"),
    );
    let handle = start(&fakes, settings());
    handle
        .create_network(options(NET, &[(OPT_DPID, "0x10"), (OPT_ADD_PORTS, "enp1s0")])?)
        .await?;
    let bridge = format!("ovsbr-{}", truncate_id(NET));

    let info = handle.join(NET, EP, Vec::new()).await?;
    let veth = VethPair::for_endpoint(EP);
    assert_eq!(info.src_name, veth.peer);
    assert_eq!(info.dst_prefix, "eth");

    // The container port takes the lowest free number after enp1s0
    let snapshot = handle.query().await?;
    let network = snapshot.network(NET).ok_or("network missing")?;
    assert_eq!(network.state.containers.len(), 1);
    let recorded = &network.state.containers[EP];
    assert_eq!(recorded.ofport, 2);
    assert_eq!(recorded.name, "web");
    assert_eq!(recorded.host_ip.as_deref(), Some("10.0.0.2"));
    assert_eq!(fakes.switch.table(&bridge).ok_or("bridge missing")?[&2], veth.host);

    let doc = fakes.faucet.merged();
    let port = &doc.dps["net1"].interfaces[&2];
    assert_eq!(
        port.description.as_deref(),
        Some(format!("web {}", truncate_id(CID)).as_str())
    );
    assert_eq!(port.native_vlan, Some(100));
    assert_eq!(port.acls_in, Some(vec!["allowall".to_string()]));
    assert!(fakes.host.called(&format!("link_netns {CID}")));

    handle.leave(NET, EP).await?;
    let snapshot = handle.query().await?;
    assert!(snapshot.network(NET).ok_or("network missing")?.state.containers.is_empty());
    assert!(!fakes.switch.table(&bridge).ok_or("bridge missing")?.contains_key(&2));
    assert!(fakes
        .faucet
        .calls()
        .contains(&FaucetCall::DeleteDpInterfaces("net1".into(), vec![2])));
    assert!(fakes.host.called(&format!("delete_veth {}", veth.host)));
    assert!(fakes.host.called("unlink_netns"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn operations_in_rapid_succession_run_in_order() -> TestResult {
    let fakes = Fakes::default();
    fakes.runtime.add_network(NET, "net1", &[]);
    fakes
        .runtime
        .add_container(NET, EP, container(CID, "web", &[]), Some("10.0.0.2/24"));
    let handle = start(&fakes, settings());
    let opts = options(NET, &[(OPT_DPID, "0x10")])?;

    let (created, joined, left, deleted) = tokio::join!(
        handle.create_network(opts),
        handle.join(NET, EP, Vec::new()),
        handle.leave(NET, EP),
        handle.delete_network(NET),
    );
    created?;
    joined?;
    left?;
    deleted?;

    assert!(handle.query().await?.networks.is_empty());
    assert!(fakes.switch.bridges.lock().unwrap().is_empty());
    let host = fakes.host.calls();
    let created_at = host.iter().position(|c| c.starts_with("create_veth"));
    let deleted_at = host.iter().position(|c| c.starts_with("delete_veth"));
    assert!(created_at < deleted_at);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn duplicate_and_invalid_networks_never_reach_the_switch() -> TestResult {
    let fakes = Fakes::default();
    fakes.runtime.add_network(NET, "net1", &[]);
    let handle = start(&fakes, settings());

    assert!(matches!(
        options(NET, &[(OPT_MODE, "routed"), (OPT_DPID, "0x10")]),
        Err(DovesnapError::InvalidOption { .. })
    ));
    assert!(options(NET, &[]).is_err());

    handle.create_network(options(NET, &[(OPT_DPID, "0x10")])?).await?;
    let again = handle.create_network(options(NET, &[(OPT_DPID, "0x10")])?).await;
    assert!(again.is_err());
    assert_eq!(*fakes.switch.creates.lock().unwrap(), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn switch_failure_is_reported_and_leaves_no_state() -> TestResult {
    let fakes = Fakes::default();
    *fakes.switch.fail_create.lock().unwrap() = true;
    let handle = start(&fakes, settings());

    let result = handle.create_network(options(NET, &[(OPT_DPID, "0x10")])?).await;
    assert!(result.is_err());
    assert!(handle.query().await?.networks.is_empty());

    // The queue keeps serving after a failure
    let joined = handle.join(NET, EP, Vec::new()).await;
    assert!(matches!(joined, Err(DovesnapError::NetworkNotFound { .. })));
    assert!(fakes.host.calls().is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn unknown_network_name_drops_the_network() -> TestResult {
    let fakes = Fakes::default();
    let handle = start(&fakes, settings());

    // Bridge creation succeeds, but the runtime never learns the network
    let opts = options(NET, &[(OPT_DPID, "0x10")])?;
    let bridge = opts.bridge_name.clone();
    handle.create_network(opts).await?;
    assert!(handle.query().await?.networks.is_empty());
    assert!(fakes.faucet.calls().is_empty());
    assert!(!fakes.switch.has_bridge(&bridge));

    // Docker still deletes the network it was told was created
    handle.delete_network(NET).await?;
    assert!(fakes.faucet.calls().is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn failed_nat_network_is_unwound() -> TestResult {
    let fakes = Fakes::default();
    let handle = start(&fakes, settings());

    let map = [(OPT_DPID, "0x20"), (OPT_MODE, "nat")]
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    let gateway = Gateway::parse_cidr("172.30.0.1/24")?;
    let opts = NetworkOptions::parse(NET, &map, false, Some(gateway))?;
    let bridge = opts.bridge_name.clone();
    handle.create_network(opts).await?;
    handle.query().await?;

    assert!(!fakes.switch.has_bridge(&bridge));
    assert!(fakes.host.called("teardown_nat 172.30.0.1/24"));
    handle.delete_network(NET).await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn leave_after_unresolved_container_removes_the_port() -> TestResult {
    let fakes = Fakes::default();
    fakes.runtime.add_network(NET, "net1", &[]);
    let handle = start(&fakes, settings());
    handle.create_network(options(NET, &[(OPT_DPID, "0x10")])?).await?;
    let bridge = format!("ovsbr-{}", truncate_id(NET));

    // The runtime never reports a container behind the endpoint
    handle.join(NET, EP, Vec::new()).await?;
    let snapshot = handle.query().await?;
    assert!(snapshot.network(NET).ok_or("network missing")?.state.containers.is_empty());
    let veth = VethPair::for_endpoint(EP);
    assert_eq!(fakes.switch.table(&bridge).ok_or("bridge missing")?[&1], veth.host);

    handle.leave(NET, EP).await?;
    assert!(fakes.switch.table(&bridge).ok_or("bridge missing")?.is_empty());
    assert!(fakes.host.called(&format!("delete_veth {}", veth.host)));
    assert!(!fakes.host.called("unlink_netns"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn leave_after_refused_port_config_releases_host_state() -> TestResult {
    let fakes = Fakes::default();
    fakes.runtime.add_network(NET, "natnet", &[]);
    fakes
        .runtime
        .add_container(NET, EP, container(CID, "web", &[]), Some("172.30.0.2/24"));
    let handle = start(&fakes, settings());

    let map = [(OPT_DPID, "0x20"), (OPT_MODE, "nat")]
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    let gateway = Gateway::parse_cidr("172.30.0.1/24")?;
    handle
        .create_network(NetworkOptions::parse(NET, &map, false, Some(gateway))?)
        .await?;
    handle.query().await?;

    *fakes.faucet.refuse_config.lock().unwrap() = true;
    let published = vec![PublishedPort {
        protocol: Protocol::Tcp,
        container_port: 80,
        host_port: 8080,
        host_ip: None,
    }];
    handle.join(NET, EP, published).await?;
    let snapshot = handle.query().await?;
    assert!(snapshot.network(NET).ok_or("network missing")?.state.containers.is_empty());
    assert!(fakes.host.called(&format!("link_netns {CID}")));
    assert!(fakes.host.called("add_port_mapping 8080->172.30.0.2:80"));

    handle.leave(NET, EP).await?;
    let veth = VethPair::for_endpoint(EP);
    assert!(fakes.host.called("remove_port_mapping 8080->172.30.0.2:80"));
    assert!(fakes.host.called(&format!("unlink_netns /run/netns/{CID}")));
    assert!(fakes.host.called(&format!("delete_veth {}", veth.host)));
    assert!(handle
        .query()
        .await?
        .network(NET)
        .ok_or("network missing")?
        .state
        .containers
        .is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn nat_network_programs_gateway_and_published_ports() -> TestResult {
    let fakes = Fakes::default();
    fakes.runtime.add_network(NET, "natnet", &[]);
    fakes
        .runtime
        .add_container(NET, EP, container(CID, "web", &[]), Some("172.30.0.2/24"));
    let handle = start(&fakes, settings());

    let map = [(OPT_DPID, "0x20"), (OPT_MODE, "nat"), (OPT_NAT_ACL, "natacl")]
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    let gateway = Gateway::parse_cidr("172.30.0.1/24")?;
    let opts = NetworkOptions::parse(NET, &map, false, Some(gateway))?;
    let bridge = opts.bridge_name.clone();
    handle.create_network(opts).await?;
    assert!(fakes.host.called(&format!("setup_nat {bridge} 172.30.0.1/24")));

    let nat = &fakes.faucet.merged().dps["natnet"].interfaces[&OFPP_LOCAL];
    assert_eq!(nat.description.as_deref(), Some("OVS Port for NAT"));
    assert_eq!(nat.acls_in, Some(vec!["natacl".to_string()]));

    let published = vec![PublishedPort {
        protocol: Protocol::Tcp,
        container_port: 80,
        host_port: 8080,
        host_ip: None,
    }];
    let info = handle.join(NET, EP, published).await?;
    assert_eq!(info.gateway.as_deref(), Some("172.30.0.1"));
    // Queue barrier: the join's second phase has finished
    handle.query().await?;
    assert!(fakes.host.called("add_port_mapping 8080->172.30.0.2:80"));

    handle.leave(NET, EP).await?;
    assert!(fakes.host.called("remove_port_mapping 8080->172.30.0.2:80"));
    handle.delete_network(NET).await?;
    assert!(fakes.host.called("teardown_nat 172.30.0.1/24"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn mirror_bridge_collects_labelled_ports() -> TestResult {
    let fakes = Fakes::default();
    fakes.runtime.add_network(NET, "net1", &[]);
    fakes.runtime.add_container(
        NET,
        EP,
        container(CID, "web", &[(LABEL_MIRROR, "true")]),
        Some("10.0.0.2/24"),
    );
    let settings = settings().with_mirror_bridge(None, Some("mirrorout".into()));
    setup_host_bridges(&settings, None, fakes.switch.as_ref(), fakes.faucet.as_ref()).await?;
    assert_eq!(
        fakes.switch.table(MIRROR_BRIDGE).ok_or("mirror bridge missing")?[&1],
        "mirrorout"
    );

    let handle = start(&fakes, settings);
    handle.create_network(options(NET, &[(OPT_DPID, "0x10")])?).await?;

    // The patch lands on the loopback port and on the next free mirror port
    let mirror_port = &fakes.faucet.merged().dps["net1"].interfaces[&99];
    assert_eq!(mirror_port.output_only, Some(true));
    let flows = fakes.switch.flows.lock().unwrap().clone();
    assert!(flows.contains(&(
        MIRROR_BRIDGE.to_string(),
        "priority=2,in_port=2,actions=mod_vlan_vid:100,output:1".to_string()
    )));

    handle.join(NET, EP, Vec::new()).await?;
    handle.query().await?;
    assert!(fakes
        .faucet
        .calls()
        .contains(&FaucetCall::AddPortMirror("net1".into(), 1, 99)));

    handle.leave(NET, EP).await?;
    assert!(fakes
        .faucet
        .calls()
        .contains(&FaucetCall::RemovePortMirror("net1".into(), 1, 99)));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn stacked_network_links_both_datapaths() -> TestResult {
    let fakes = Fakes::default();
    fakes.runtime.add_network(NET, "net1", &[]);
    let settings = settings()
        .with_stacking_interfaces("sw1:7:enp1s0")?
        .with_default_controllers("tcp:127.0.0.1:6653");
    settings.validate()?;
    let identity = StackIdentity::new("ABCD:EFGH", "host1");
    let stack_dp = identity.dp_name();

    setup_host_bridges(
        &settings,
        Some(&identity),
        fakes.switch.as_ref(),
        fakes.faucet.as_ref(),
    )
    .await?;
    assert_eq!(fakes.switch.table(&stack_dp).ok_or("stack bridge missing")?[&1], "enp1s0");

    let (manager, handle) =
        ResourceManager::new(fakes.adapters(), Arc::new(settings), Some(identity));
    tokio::spawn(manager.run());
    handle.create_network(options(NET, &[(OPT_DPID, "0x10")])?).await?;

    let snapshot = handle.query().await?;
    let network = snapshot.network(NET).ok_or("network missing")?;
    assert_eq!(network.state.controllers, vec!["tcp:127.0.0.1:6653".to_string()]);

    // Uplink holds port 1 on the stacking bridge, so the patch gets port 2
    let doc = fakes.faucet.merged();
    let local = doc.dps["net1"].interfaces[&1].stack.clone().ok_or("no stack link")?;
    assert_eq!((local.dp.as_str(), local.port), (stack_dp.as_str(), 2));
    let remote = doc.dps[&stack_dp].interfaces[&2].stack.clone().ok_or("no stack link")?;
    assert_eq!((remote.dp.as_str(), remote.port), ("net1", 1));

    handle.delete_network(NET).await?;
    let stack_ports = fakes.switch.table(&stack_dp).ok_or("stack bridge missing")?;
    assert_eq!(stack_ports.len(), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rehydrate_restores_networks_and_containers() -> TestResult {
    let fakes = Fakes::default();
    fakes
        .runtime
        .add_network(NET, "net1", &[(OPT_DPID, "0x10"), (OPT_ADD_PORTS, "enp1s0")]);
    fakes
        .runtime
        .add_container(NET, EP, container(CID, "web", &[]), Some("10.0.0.2/24"));
    fakes.runtime.add_network("badnet000000", "bad", &[(OPT_MODE, "routed")]);

    // What the switch kept across the restart
    let bridge = format!("ovsbr-{}", truncate_id(NET));
    let veth = VethPair::for_endpoint(EP);
    fakes.switch.plug(&bridge, 1, "enp1s0");
    fakes.switch.plug(&bridge, 2, &veth.host);

    let (mut manager, handle) =
        ResourceManager::new(fakes.adapters(), Arc::new(settings()), None);
    assert_eq!(manager.rehydrate().await?, 1);
    tokio::spawn(manager.run());

    let snapshot = handle.query().await?;
    assert_eq!(snapshot.networks.len(), 1);
    let network = snapshot.network(NET).ok_or("network missing")?;
    assert_eq!(network.state.network_name, "net1");
    assert_eq!(network.state.external_ports["enp1s0"].ofport, 1);
    assert_eq!(network.state.containers[EP].ofport, 2);
    assert_eq!(network.state.containers[EP].name, "web");

    // Leave works without the in-memory handle of the old process
    handle.leave(NET, EP).await?;
    assert!(fakes
        .faucet
        .calls()
        .contains(&FaucetCall::DeleteDpInterfaces("net1".into(), vec![2])));
    assert!(!fakes.switch.table(&bridge).ok_or("bridge missing")?.contains_key(&2));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn dhcp_network_starts_client_in_container_namespace() -> TestResult {
    let fakes = Fakes::default();
    fakes.runtime.add_network(NET, "dhcpnet", &[]);
    fakes.runtime.add_container(NET, EP, container(CID, "web", &[]), None);
    let handle = start(&fakes, settings());

    let map = [(OPT_DPID, "0x30"), (OPT_DHCP, "true")]
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    let opts = NetworkOptions::parse(NET, &map, true, None)?;
    handle.create_network(opts).await?;
    handle.join(NET, EP, Vec::new()).await?;
    handle.query().await?;
    assert!(fakes.host.called(&format!("start_dhcp {CID}")));
    handle.leave(NET, EP).await?;
    Ok(())
}
