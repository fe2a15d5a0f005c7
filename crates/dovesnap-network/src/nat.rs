//! Gateway address and source NAT for `nat` mode networks.

use dovesnap_common::DovesnapResult;

use crate::command::run_host;

fn masquerade_rule(op: &str, cidr: &str) -> [String; 8] {
    [
        op.to_string(),
        "POSTROUTING".into(),
        "-t".into(),
        "nat".into(),
        "-s".into(),
        cidr.to_string(),
        "-j".into(),
        "MASQUERADE".into(),
    ]
}

/// Assign `gateway/mask` to the bridge and masquerade traffic leaving the subnet.
pub async fn setup_nat(bridge: &str, gateway: &str, mask: &str) -> DovesnapResult<()> {
    let cidr = format!("{gateway}/{mask}");
    if let Err(e) = run_host("ip", &["addr", "add", cidr.as_str(), "dev", bridge]).await {
        // The address survives a driver restart.
        tracing::debug!(bridge, %cidr, error = %e, "Failed to set IP (may already exist)");
    }

    let present = run_host("iptables", &masquerade_rule("-C", &cidr)).await.is_ok();
    if !present {
        run_host("iptables", &masquerade_rule("-I", &cidr)).await?;
    }
    run_host("iptables", &["-P", "FORWARD", "ACCEPT"]).await?;
    tracing::info!(bridge, %cidr, "NAT configured");
    Ok(())
}

/// Remove the masquerade rule installed by [`setup_nat`].
pub async fn teardown_nat(gateway: &str, mask: &str) -> DovesnapResult<()> {
    let cidr = format!("{gateway}/{mask}");
    if run_host("iptables", &masquerade_rule("-C", &cidr)).await.is_ok() {
        run_host("iptables", &masquerade_rule("-D", &cidr)).await?;
    }
    Ok(())
}
