use super::*;
use crate::changelog::NoopChangeLog;
use mayu_common::HostState;
use std::fs::File;
use std::time::Duration;

fn new_cluster() -> (tempfile::TempDir, Cluster) {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Cluster::create(dir.path().join("cluster"), Arc::new(NoopChangeLog)).unwrap();
    (dir, cluster)
}

/// Push a file's modification time forward so the change is visible
/// regardless of filesystem timestamp granularity.
fn touch_later(path: &Path) {
    let later = SystemTime::now() + Duration::from_secs(5);
    File::open(path).unwrap().set_modified(later).unwrap();
}

#[test]
fn test_create_writes_cluster_config() {
    let (_dir, cluster) = new_cluster();
    let path = cluster.base_dir().join(CLUSTER_CONF_FILE);
    assert!(path.exists());

    let text = std::fs::read_to_string(path).unwrap();
    assert!(text.contains("DefaultEtcdClusterToken"));
    assert!(!text.contains("EtcdDiscoveryURL"));
}

#[test]
fn test_create_host() {
    let (_dir, cluster) = new_cluster();
    let host = cluster.create_host("ABC123").unwrap();
    assert_eq!(host.serial, "abc123");
    assert!(host.enabled);

    let conf = cluster.base_dir().join("abc123").join(HOST_CONF_FILE);
    let stored: Host = serde_json::from_str(&std::fs::read_to_string(conf).unwrap()).unwrap();
    assert_eq!(stored, host);

    // creating again returns the existing host
    let again = cluster.create_host("abc123").unwrap();
    assert_eq!(again.machine_id, host.machine_id);
}

#[test]
fn test_lookup_is_case_insensitive() {
    let (_dir, cluster) = new_cluster();
    cluster.create_host("abc123").unwrap();
    assert!(cluster.host_by_serial("ABC123").is_some());
    assert!(cluster.host_by_serial("other").is_none());
}

#[test]
fn test_lookup_by_mac_and_addr() {
    let (_dir, cluster) = new_cluster();
    cluster.create_host("abc123").unwrap();
    cluster
        .update_host("abc123", "facts", |h| {
            h.mac_addresses = vec!["aa:bb:cc:dd:ee:ff".to_string()];
            h.assign_internal_addr(Ipv4Addr::new(10, 0, 0, 7));
        })
        .unwrap();

    let by_mac = cluster.host_by_mac("AA:BB:CC:DD:EE:FF").unwrap();
    assert_eq!(by_mac.serial, "abc123");
    let by_addr = cluster.host_by_internal_addr(Ipv4Addr::new(10, 0, 0, 7)).unwrap();
    assert_eq!(by_addr.serial, "abc123");
    assert!(cluster.host_by_internal_addr(Ipv4Addr::new(10, 0, 0, 8)).is_none());
}

#[test]
fn test_create_host_with_failing_init_writes_nothing() {
    let (_dir, cluster) = new_cluster();
    let result = cluster.create_host_with("abc123", |_, _| {
        Err::<(), ClusterError>(ClusterError::NotFound("no address".to_string()))
    });
    assert!(result.is_err());
    assert!(!cluster.base_dir().join("abc123").exists());
    assert!(cluster.host_by_serial("abc123").is_none());
}

#[test]
fn test_create_host_with_sees_existing_hosts() {
    let (_dir, cluster) = new_cluster();
    cluster.create_host("first").unwrap();

    let (host, created) = cluster
        .create_host_with("second", |host, others| {
            host.name = format!("after-{}", others.len());
            Ok::<(), ClusterError>(())
        })
        .unwrap();
    assert!(created);
    assert_eq!(host.name, "after-1");
}

#[test]
fn test_corrupt_record_is_skipped() {
    let (_dir, cluster) = new_cluster();
    cluster.create_host("good").unwrap();

    let bad = cluster.base_dir().join("bad");
    std::fs::create_dir(&bad).unwrap();
    std::fs::write(bad.join(HOST_CONF_FILE), "{ broken").unwrap();

    let hosts = cluster.all_hosts();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].serial, "good");
}

#[test]
fn test_hidden_dirs_are_ignored() {
    let (_dir, cluster) = new_cluster();
    let hidden = cluster.base_dir().join(".git");
    std::fs::create_dir(&hidden).unwrap();
    std::fs::write(hidden.join(HOST_CONF_FILE), "{\"Serial\": \"hidden\"}").unwrap();
    assert!(cluster.all_hosts().is_empty());
}

#[test]
fn test_external_edit_is_reloaded() {
    let (_dir, cluster) = new_cluster();
    cluster.create_host("abc123").unwrap();
    assert_eq!(cluster.host_by_serial("abc123").unwrap().state, HostState::Unknown);

    let conf = cluster.base_dir().join("abc123").join(HOST_CONF_FILE);
    let mut host: Host = serde_json::from_str(&std::fs::read_to_string(&conf).unwrap()).unwrap();
    host.state = HostState::Running;
    std::fs::write(&conf, serde_json::to_vec_pretty(&host).unwrap()).unwrap();
    touch_later(&conf);

    assert_eq!(cluster.host_by_serial("abc123").unwrap().state, HostState::Running);
}

#[test]
fn test_host_added_externally_is_found() {
    let (_dir, cluster) = new_cluster();
    assert!(cluster.all_hosts().is_empty());

    let host_dir = cluster.base_dir().join("external");
    std::fs::create_dir(&host_dir).unwrap();
    std::fs::write(host_dir.join(HOST_CONF_FILE), "{\"Serial\": \"external\"}").unwrap();
    touch_later(cluster.base_dir());

    assert!(cluster.host_by_serial("external").is_some());
}

#[test]
fn test_listing_error_keeps_cache() {
    let (dir, cluster) = new_cluster();
    cluster.create_host("abc123").unwrap();
    assert_eq!(cluster.all_hosts().len(), 1);

    std::fs::rename(cluster.base_dir(), dir.path().join("moved")).unwrap();
    assert!(cluster.refresh().is_err());
    assert_eq!(cluster.all_hosts().len(), 1);
    // lookups report registry errors as not found
    assert!(cluster.host_by_serial("abc123").is_none());
}

#[test]
fn test_update_missing_host() {
    let (_dir, cluster) = new_cluster();
    let err = cluster.update_host("nope", "msg", |_| {}).unwrap_err();
    assert!(matches!(err, ClusterError::NotFound(_)));
}

#[test]
fn test_profile_count() {
    let (_dir, cluster) = new_cluster();
    for (serial, profile) in [("a", "core"), ("b", "core"), ("c", "worker")] {
        cluster.create_host(serial).unwrap();
        cluster
            .update_host(serial, "profile", |h| h.profile = profile.to_string())
            .unwrap();
    }
    let count = cluster.profile_count();
    assert_eq!(count.get("core"), Some(&2));
    assert_eq!(count.get("worker"), Some(&1));
}

#[test]
fn test_update_config_persists() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("cluster");
    {
        let cluster = Cluster::create(&base, Arc::new(NoopChangeLog)).unwrap();
        cluster
            .update_config("set token", |c| c.default_etcd_cluster_token = "tok".to_string())
            .unwrap();
        cluster.create_host("abc123").unwrap();
    }

    let cluster = Cluster::open_or_create(&base, Arc::new(NoopChangeLog)).unwrap();
    assert_eq!(cluster.config().default_etcd_cluster_token, "tok");
    assert_eq!(cluster.all_hosts().len(), 1);
}

#[test]
fn test_generation_advances() {
    let (_dir, cluster) = new_cluster();
    cluster.refresh().unwrap();
    let (before, _) = cluster.generation_and_len();
    cluster.create_host("abc123").unwrap();
    let (after, len) = cluster.generation_and_len();
    assert!(after > before);
    assert_eq!(len, 1);
}

#[test]
fn test_update_all_hosts_in_order() {
    let (_dir, cluster) = new_cluster();
    for (serial, last) in [("a", 3), ("b", 1), ("c", 2)] {
        cluster.create_host(serial).unwrap();
        cluster
            .update_host(serial, "addr", |h| {
                h.assign_internal_addr(Ipv4Addr::new(10, 0, 0, last))
            })
            .unwrap();
    }

    let mut visited = Vec::new();
    let updated = cluster
        .update_all_hosts("noop", |h| h.internal_addr, |host, _| {
            visited.push(host.serial.clone());
            if host.serial == "c" {
                host.name = "changed".to_string();
            }
            Ok::<(), ClusterError>(())
        })
        .unwrap();
    assert_eq!(visited, vec!["b", "c", "a"]);
    assert_eq!(updated, 1);
    assert_eq!(cluster.host_by_serial("c").unwrap().name, "changed");
}
