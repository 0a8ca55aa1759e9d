//! Applies an update payload served by an Omaha server and checks that the
//! machine flips between its two `/usr` partitions.

use std::net::SocketAddr;

use camino::Utf8Path;

use super::{split_newline_env, split_space_env};
use crate::harness::{Test, TestCluster, TestFailure};
use crate::machine::MachineId;
use crate::provider::Platform;
use crate::retry::{Poll, wait_until_ready};
use crate::userdata::UserData;

const OMAHA_PORT: u16 = 34567;
const UPDATED_NEED_REBOOT: &str = "UPDATE_STATUS_UPDATED_NEED_REBOOT";
const REMOTE_PAYLOAD: &str = "/updates/update.gz";

/// Partition GUIDs of the two `/usr` slots.
const USR_A_UUID: &str = "7130c94a-213a-4e5a-8e26-6cce9662f132";
const USR_B_UUID: &str = "e03dd35c-7c2d-4a47-b3fe-27f15780a57c";

#[derive(Clone, Copy, Debug)]
pub(super) enum UsrSlot {
    A,
    B,
}

impl UsrSlot {
    pub(super) fn accepted(self) -> [String; 2] {
        let (uuid, label) = match self {
            Self::A => (USR_A_UUID, "USR-A"),
            Self::B => (USR_B_UUID, "USR-B"),
        };
        [format!("PARTUUID={uuid}"), format!("PARTLABEL={label}")]
    }
}

pub(super) fn tests() -> Vec<Test> {
    vec![Test {
        name: String::from("coreos.update.updatepayload"),
        cluster_size: 1,
        platforms: vec![Platform::Aws],
        exclude_platforms: Vec::new(),
        user_data: UserData::empty(),
        run: |cluster| Box::pin(update_payload(cluster)),
    }]
}

/// Returns `true` when the kernel command line mounts `/usr` from `slot`.
pub(super) fn boots_from(cmdline: &str, slot: UsrSlot) -> bool {
    let vars = split_space_env(cmdline);
    let accepted = slot.accepted();
    ["mount.usr", "verity.usr", "usr"]
        .iter()
        .filter_map(|key| vars.get(*key))
        .any(|value| accepted.contains(value))
}

async fn update_payload(cluster: TestCluster) -> Result<(), TestFailure> {
    let Some(payload) = cluster.options().update_payload.clone() else {
        return Err(TestFailure::skipped("no update payload configured"));
    };
    let target = cluster
        .new_machine(&UserData::ignition(r#"{"ignition":{"version":"2.1.0"}}"#))
        .await?;

    let server = configure_omaha_server(&cluster, &payload).await?;
    configure_machine(&cluster, &target, &server).await?;
    check_usr(&cluster, &target, UsrSlot::A).await?;

    update_machine(&cluster, &target).await?;
    check_usr(&cluster, &target, UsrSlot::B).await?;

    cluster
        .ssh(
            &target,
            "sudo coreos-setgoodroot && sudo wipefs /dev/disk/by-partlabel/USR-A",
        )
        .await
        .map_err(|err| TestFailure::failed(format!("invalidating USR-A failed: {err}")))?;

    update_machine(&cluster, &target).await?;
    check_usr(&cluster, &target, UsrSlot::A).await
}

async fn configure_omaha_server(
    cluster: &TestCluster,
    payload: &Utf8Path,
) -> Result<String, TestFailure> {
    let kolet = cluster
        .options()
        .kolet
        .clone()
        .ok_or_else(|| TestFailure::skipped("no kolet binary configured"))?;
    let server = cluster
        .machines()
        .await
        .into_iter()
        .next()
        .ok_or_else(|| TestFailure::failed("no machine to host the update server"))?;

    cluster.copy_to(&server, payload, "update.gz").await?;
    cluster
        .must_ssh(
            &server,
            &format!("sudo mkdir -p /updates && sudo mv update.gz {REMOTE_PAYLOAD}"),
        )
        .await?;
    cluster.copy_to(&server, &kolet, "kolet").await?;
    cluster
        .must_ssh(
            &server,
            &format!("sudo systemd-run --quiet ./kolet run {} Omaha", cluster.name()),
        )
        .await?;

    let address = cluster
        .private_ip(&server)
        .await
        .ok_or_else(|| TestFailure::failed("update server has no address"))?;
    Ok(SocketAddr::new(address, OMAHA_PORT).to_string())
}

async fn configure_machine(
    cluster: &TestCluster,
    target: &MachineId,
    server: &str,
) -> Result<(), TestFailure> {
    // Written to a temporary file and renamed so readers never see half a file.
    let update_conf = format!(
        "sudo bash -c \"cat >/etc/coreos/update.conf.new <<EOF\n\
         GROUP=developer\n\
         SERVER=http://{server}/v1/update\n\
         EOF\""
    );
    cluster.must_ssh(target, &update_conf).await?;
    for command in [
        "sudo mv /etc/coreos/update.conf{.new,}",
        "sudo systemctl mask locksmithd.service",
        "sudo systemctl stop locksmithd.service",
        "sudo systemctl reset-failed locksmithd.service",
        "sudo systemctl restart update-engine.service",
    ] {
        cluster.must_ssh(target, command).await?;
    }
    Ok(())
}

async fn update_done(cluster: &TestCluster, target: &MachineId) -> Result<bool, TestFailure> {
    let envs = cluster
        .ssh(target, "update_engine_client -status 2>/dev/null")
        .await
        .map_err(|err| TestFailure::failed(format!("checking status failed: {err}")))?;
    Ok(split_newline_env(&envs)
        .get("CURRENT_OP")
        .is_some_and(|op| op == UPDATED_NEED_REBOOT))
}

async fn update_machine(cluster: &TestCluster, target: &MachineId) -> Result<(), TestFailure> {
    cluster.log("Triggering update_engine");
    cluster
        .ssh(target, "update_engine_client -check_for_update")
        .await
        .map_err(|err| {
            TestFailure::failed(format!("Executing update_engine_client failed: {err}"))
        })?;

    wait_until_ready(Poll::SERVICE, cluster.cancel(), || update_done(cluster, target))
        .await
        .map_err(|err| TestFailure::failed(format!("Updating machine: {err}")))?;

    cluster.log("Rebooting test machine");
    cluster.reboot(target).await
}

async fn check_usr(
    cluster: &TestCluster,
    target: &MachineId,
    slot: UsrSlot,
) -> Result<(), TestFailure> {
    cluster.log(&format!("Checking for boot from USR-{slot:?} partition"));
    let cmdline = cluster.must_ssh(target, "cat /proc/cmdline").await?;
    cluster.log(&format!("Kernel cmdline: {cmdline}"));
    if boots_from(&cmdline, slot) {
        Ok(())
    } else {
        Err(TestFailure::failed(format!(
            "mount.usr not one of {:?}",
            slot.accepted().join(" ")
        )))
    }
}
