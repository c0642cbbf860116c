//! Rendered node configuration.
//!
//! Everything a node needs to join its cluster: consensus-store env file,
//! failover-controller config (tuned by node size), backup tool config,
//! connection pooler config with its credential file, and the
//! process-supervisor unit definitions.

use harbor_common::model::{Cluster, Node};

/// Peer URL list for the consensus store initial cluster.
fn initial_cluster(nodes: &[Node]) -> String {
    nodes
        .iter()
        .map(|n| format!("{}=http://{}:2380", n.name, n.private_ip))
        .collect::<Vec<_>>()
        .join(",")
}

/// Client endpoint list the failover controller connects to.
fn client_endpoints(nodes: &[Node]) -> String {
    nodes
        .iter()
        .map(|n| format!("{}:2379", n.private_ip))
        .collect::<Vec<_>>()
        .join(",")
}

/// Consensus-store environment file for one node.
pub fn etcd_env(cluster: &Cluster, node: &Node, peers: &[Node]) -> String {
    format!(
        r#"ETCD_NAME={name}
ETCD_DATA_DIR=/var/lib/etcd
ETCD_LISTEN_PEER_URLS=http://{ip}:2380
ETCD_LISTEN_CLIENT_URLS=http://{ip}:2379,http://127.0.0.1:2379
ETCD_INITIAL_ADVERTISE_PEER_URLS=http://{ip}:2380
ETCD_ADVERTISE_CLIENT_URLS=http://{ip}:2379
ETCD_INITIAL_CLUSTER={initial}
ETCD_INITIAL_CLUSTER_STATE=new
ETCD_INITIAL_CLUSTER_TOKEN={token}
"#,
        name = node.name,
        ip = node.private_ip,
        initial = initial_cluster(peers),
        token = cluster.slug,
    )
}

/// Failover-controller configuration for one node. Replication and
/// connection parameters scale with the cluster's node size. When
/// `restore_stanza` is set the bootstrap section restores from that
/// stanza instead of running a blank initdb.
pub fn patroni_config(
    cluster: &Cluster,
    node: &Node,
    peers: &[Node],
    restore_stanza: Option<&str>,
) -> String {
    let bootstrap_method = match restore_stanza {
        Some(stanza) => format!(
            r#"  method: pgbackrest
  pgbackrest:
    command: pgbackrest --stanza={} --delta restore
    keep_existing_recovery_conf: false
    no_params: true
"#,
            stanza
        ),
        None => String::new(),
    };

    format!(
        r#"scope: {scope}
name: {name}
restapi:
  listen: 0.0.0.0:8008
  connect_address: {ip}:8008
etcd3:
  hosts: {endpoints}
bootstrap:
{bootstrap_method}  dcs:
    ttl: 30
    loop_wait: 10
    retry_timeout: 10
    maximum_lag_on_failover: 1048576
    postgresql:
      use_pg_rewind: true
      parameters:
        shared_buffers: {shared_buffers}
        max_connections: {max_connections}
        wal_level: replica
        hot_standby: "on"
        archive_mode: "on"
        archive_command: pgbackrest --stanza={stanza} archive-push %p
postgresql:
  listen: 0.0.0.0:{port}
  connect_address: {ip}:{port}
  data_dir: /var/lib/postgresql/{pg_version}/main
  bin_dir: /usr/lib/postgresql/{pg_version}/bin
  authentication:
    superuser:
      username: postgres
      password: {password}
    replication:
      username: replicator
      password: {password}
"#,
        scope = cluster.slug,
        name = node.name,
        ip = node.private_ip,
        endpoints = client_endpoints(peers),
        bootstrap_method = bootstrap_method,
        shared_buffers = cluster.node_size.shared_buffers(),
        max_connections = cluster.node_size.max_connections(),
        stanza = cluster.stanza(),
        port = cluster.port,
        pg_version = cluster.postgres_version.as_str(),
        password = cluster.admin_password,
    )
}

/// Backup tool repository configuration. Repository credentials come from
/// the node image's instance profile; only the stanza layout is rendered.
pub fn pgbackrest_config(cluster: &Cluster) -> String {
    format!(
        r#"[global]
repo1-type=s3
repo1-path=/{stanza}
repo1-retention-full-type=count
process-max=2
log-level-console=info

[{stanza}]
pg1-path=/var/lib/postgresql/{pg_version}/main
pg1-port={port}
"#,
        stanza = cluster.stanza(),
        pg_version = cluster.postgres_version.as_str(),
        port = cluster.port,
    )
}

/// Environment/secrets file, uploaded with restrictive permissions.
pub fn env_secrets(cluster: &Cluster) -> String {
    format!(
        r#"PGHARBOR_CLUSTER={slug}
PGPASSWORD={password}
PATRONI_SUPERUSER_PASSWORD={password}
PATRONI_REPLICATION_PASSWORD={password}
"#,
        slug = cluster.slug,
        password = cluster.admin_password,
    )
}

/// Connection pooler configuration.
pub fn pgbouncer_config(cluster: &Cluster) -> String {
    format!(
        r#"[databases]
* = host=127.0.0.1 port={port}

[pgbouncer]
listen_addr = 0.0.0.0
listen_port = 6432
auth_type = scram-sha-256
auth_file = /etc/pgbouncer/userlist.txt
pool_mode = transaction
max_client_conn = {max_clients}
default_pool_size = {pool_size}
"#,
        port = cluster.port,
        max_clients = cluster.node_size.max_connections() * 4,
        pool_size = cluster.node_size.max_connections() / 4,
    )
}

/// Pooler credential file, uploaded with restrictive permissions.
pub fn pgbouncer_userlist(cluster: &Cluster) -> String {
    format!("\"postgres\" \"{}\"\n", cluster.admin_password)
}

/// Process-supervisor unit definitions, one per managed service.
pub fn supervisor_units() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "/etc/systemd/system/etcd.service",
            r#"[Unit]
Description=etcd consensus store
After=network-online.target

[Service]
EnvironmentFile=/etc/etcd/etcd.env
ExecStart=/usr/bin/etcd
Restart=always

[Install]
WantedBy=multi-user.target
"#,
        ),
        (
            "/etc/systemd/system/patroni.service",
            r#"[Unit]
Description=Patroni failover controller
After=etcd.service

[Service]
EnvironmentFile=/etc/pgharbor/cluster.env
ExecStart=/usr/bin/patroni /etc/patroni/patroni.yml
Restart=always

[Install]
WantedBy=multi-user.target
"#,
        ),
        (
            "/etc/systemd/system/pgbouncer.service",
            r#"[Unit]
Description=PgBouncer connection pooler
After=patroni.service

[Service]
ExecStart=/usr/sbin/pgbouncer /etc/pgbouncer/pgbouncer.ini
Restart=always

[Install]
WantedBy=multi-user.target
"#,
        ),
        (
            "/etc/systemd/system/postgres_exporter.service",
            r#"[Unit]
Description=Postgres metrics exporter
After=patroni.service

[Service]
EnvironmentFile=/etc/pgharbor/cluster.env
ExecStart=/usr/bin/postgres_exporter
Restart=always

[Install]
WantedBy=multi-user.target
"#,
        ),
    ]
}
