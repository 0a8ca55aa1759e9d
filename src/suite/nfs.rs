//! Kernel NFS server and client.

use std::net::IpAddr;
use std::time::Duration;

use camino::Utf8Path;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::json;
use shell_escape::unix::escape;

use crate::harness::{Test, TestCluster, TestFailure};
use crate::machine::MachineId;
use crate::retry::retry;
use crate::userdata::UserData;

const EXPORTS: &str = "/tmp  *(ro,insecure,all_squash,no_subtree_check,fsid=0)";
const MOUNT_ATTEMPTS: u32 = 10;
const MOUNT_DELAY: Duration = Duration::from_secs(3);

const DATA_URL: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

pub(super) fn tests() -> Vec<Test> {
    vec![
        Test {
            name: String::from("linux.nfs.v3"),
            cluster_size: 0,
            platforms: Vec::new(),
            exclude_platforms: Vec::new(),
            user_data: UserData::empty(),
            run: |cluster| Box::pin(check_nfs(cluster, 3)),
        },
        Test {
            name: String::from("linux.nfs.v4"),
            cluster_size: 0,
            platforms: Vec::new(),
            exclude_platforms: Vec::new(),
            user_data: UserData::empty(),
            run: |cluster| Box::pin(check_nfs(cluster, 4)),
        },
    ]
}

fn data_url(contents: &str) -> String {
    format!("data:,{}", utf8_percent_encode(contents, DATA_URL))
}

pub(super) fn server_config() -> UserData {
    let start_unit = "[Unit]\nAfter=rpc-statd.service\nRequires=rpc-statd.service\n\
        After=rpc-mountd.service\nRequires=rpc-mountd.service\n\
        After=nfsd.service\nRequires=nfsd.service\n\n\
        [Service]\nExecStart=/usr/bin/echo start\n\n\
        [Install]\nWantedBy=multi-user.target";
    UserData::ignition(
        json!({
            "ignition": { "version": "2.1.0" },
            "storage": {
                "files": [{
                    "filesystem": "root",
                    "path": "/etc/exports",
                    "contents": { "source": data_url(EXPORTS) },
                    "user": { "name": "core" },
                    "group": { "name": "core" }
                }, {
                    "filesystem": "root",
                    "path": "/etc/hostname",
                    "contents": { "source": data_url("nfs1") },
                    "mode": 511
                }]
            },
            "systemd": {
                "units": [
                    { "name": "rpc-statd.service", "enabled": true },
                    { "name": "rpc-mountd.service", "enabled": true },
                    { "name": "nfsd.service", "enabled": true },
                    {
                        "name": "start-the-services.service",
                        "enabled": true,
                        "contents": start_unit
                    }
                ]
            }
        })
        .to_string(),
    )
}

pub(super) fn client_config(server: IpAddr, version: u8) -> UserData {
    let mount_unit = format!(
        "[Unit]\nDescription=NFS Client\nAfter=network-online.target\n\
         Requires=network-online.target\nAfter=rpc-statd.service\n\
         Requires=rpc-statd.service\n\n\
         [Mount]\nWhat={server}:/tmp\nWhere=/mnt\nType=nfs\n\
         Options=defaults,noexec,nfsvers={version}\n\n\
         [Install]\nWantedBy=multi-user.target"
    );
    UserData::ignition(
        json!({
            "ignition": { "version": "2.1.0" },
            "storage": {
                "files": [{
                    "filesystem": "root",
                    "path": "/etc/hostname",
                    "contents": { "source": data_url("nfs2") },
                    "mode": 511
                }]
            },
            "systemd": {
                "units": [{
                    "name": "mnt.mount",
                    "enabled": true,
                    "contents": mount_unit
                }]
            }
        })
        .to_string(),
    )
}

async fn check_mount(cluster: &TestCluster, client: &MachineId) -> Result<(), TestFailure> {
    match cluster.ssh(client, "systemctl is-active mnt.mount").await {
        Ok(status) if status == "active" => {
            cluster.log("Got NFS mount.");
            Ok(())
        }
        Ok(status) => Err(TestFailure::failed(format!("mnt.mount status is {status:?}"))),
        Err(err) => Err(TestFailure::failed(format!("mnt.mount status unknown: {err}"))),
    }
}

async fn check_nfs(cluster: TestCluster, version: u8) -> Result<(), TestFailure> {
    let server = cluster.new_machine(&server_config()).await?;
    cluster.log("NFS server booted.");

    let file = cluster.must_ssh(&server, "mktemp").await?;
    cluster.log(&format!("Test file {file:?} created on server."));

    let address = cluster
        .private_ip(&server)
        .await
        .ok_or_else(|| TestFailure::failed("NFS server has no address"))?;
    let client = cluster.new_machine(&client_config(address, version)).await?;
    cluster.log("NFS client booted.");

    retry(MOUNT_ATTEMPTS, MOUNT_DELAY, cluster.cancel(), || {
        check_mount(&cluster, &client)
    })
    .await
    .map_err(|err| TestFailure::failed(err.to_string()))?;

    let name = Utf8Path::new(&file).file_name().unwrap_or(file.as_str());
    let mounted = format!("/mnt/{name}");
    cluster
        .ssh(&client, &format!("stat {}", escape(mounted.as_str().into())))
        .await
        .map_err(|_| TestFailure::failed(format!("file {file:?} does not exist")))?;
    Ok(())
}
