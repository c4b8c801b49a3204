//! Integration tests for telemetry collection
//!
//! These tests use a mock sysfs and cgroup tree together with scripted
//! hypervisor and register backends.

#[cfg(test)]
mod mock_host_tests {
    use crate::collector::testing::FakeHypervisor;
    use crate::collector::{GuestRegistry, HostTopology, QUOTA_UNSET};
    use crate::error::{ErrorClass, QosError};
    use crate::models::Priority;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tokio::fs;

    /// Helper to create a mock cpu topology, one entry per core
    async fn create_mock_sysfs(temp_dir: &TempDir, core_packages: &[u32]) -> PathBuf {
        let sysfs_root = temp_dir.path().join("sys");
        let cpu_dir = sysfs_root.join("devices/system/cpu");
        fs::create_dir_all(&cpu_dir).await.unwrap();

        fs::write(
            cpu_dir.join("present"),
            format!("0-{}\n", core_packages.len() - 1),
        )
        .await
        .unwrap();

        for (core, package) in core_packages.iter().enumerate() {
            let topo = cpu_dir.join(format!("cpu{}/topology", core));
            fs::create_dir_all(&topo).await.unwrap();
            fs::write(topo.join("physical_package_id"), format!("{}\n", package))
                .await
                .unwrap();

            let siblings: Vec<String> = core_packages
                .iter()
                .enumerate()
                .filter(|(_, p)| *p == package)
                .map(|(c, _)| c.to_string())
                .collect();
            fs::write(
                topo.join("core_siblings_list"),
                format!("{}\n", siblings.join(",")),
            )
            .await
            .unwrap();
        }

        sysfs_root
    }

    /// Helper to create the pids cgroup directories of running VMs
    async fn create_mock_pids_tree(temp_dir: &TempDir, vms: &[(u32, &str)]) -> PathBuf {
        let cgroup_root = temp_dir.path().join("cgroup");
        for partition in ["machine", "high_prio_machine", "low_prio_machine"] {
            fs::create_dir_all(cgroup_root.join(format!("pids/{}.slice", partition)))
                .await
                .unwrap();
        }
        for (id, partition) in vms {
            let dir = cgroup_root.join(format!(
                "pids/{}.slice/machine-qemu\\x2d{}\\x2dvm{}.scope",
                partition, id, id
            ));
            fs::create_dir_all(&dir).await.unwrap();
            fs::write(dir.join("tasks"), format!("{}\n{}\n", 1000 + id, 2000 + id))
                .await
                .unwrap();
        }
        cgroup_root
    }

    #[tokio::test]
    async fn test_discover_topology() {
        let temp_dir = TempDir::new().unwrap();
        let sysfs_root = create_mock_sysfs(&temp_dir, &[0, 0, 1, 1]).await;

        let topology = HostTopology::discover(&sysfs_root).await.unwrap();
        assert_eq!(topology.core_count(), 4);
        assert_eq!(topology.package_count(), 2);
        assert_eq!(topology.package_of(3), Some(1));
        assert!(topology.is_first_core(0));
        assert!(topology.is_first_core(2));
        assert!(!topology.is_first_core(3));
        assert_eq!(topology, HostTopology::from_core_packages(vec![0, 0, 1, 1]));
    }

    #[tokio::test]
    async fn test_discover_interleaved_topology() {
        let temp_dir = TempDir::new().unwrap();
        let sysfs_root = create_mock_sysfs(&temp_dir, &[0, 1, 0, 1]).await;

        let topology = HostTopology::discover(&sysfs_root).await.unwrap();
        assert_eq!(topology.first_cores().collect::<Vec<_>>(), vec![(0, 0), (1, 1)]);
    }

    #[tokio::test]
    async fn test_discover_sparse_present_list() {
        let temp_dir = TempDir::new().unwrap();
        let sysfs_root = create_mock_sysfs(&temp_dir, &[0, 0, 1, 1]).await;
        let cpu_dir = sysfs_root.join("devices/system/cpu");
        fs::write(cpu_dir.join("present"), "0,2-3\n").await.unwrap();
        fs::remove_dir_all(cpu_dir.join("cpu1")).await.unwrap();

        let topology = HostTopology::discover(&sysfs_root).await.unwrap();
        assert_eq!(topology.core_count(), 4);
        assert_eq!(topology.package_of(1), None);
        assert_eq!(
            topology.cores().collect::<Vec<_>>(),
            vec![(0, 0), (2, 1), (3, 1)]
        );
        assert_eq!(topology.first_cores().collect::<Vec<_>>(), vec![(0, 0), (1, 2)]);
    }

    #[tokio::test]
    async fn test_unreadable_topology_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let sysfs_root = create_mock_sysfs(&temp_dir, &[0, 0]).await;
        fs::remove_file(sysfs_root.join("devices/system/cpu/cpu1/topology/physical_package_id"))
            .await
            .unwrap();

        let err = HostTopology::discover(&sysfs_root).await.unwrap_err();
        assert!(matches!(err, QosError::Unsupported(_)));
        assert_eq!(err.class(), ErrorClass::FatalStartup);

        let err = HostTopology::discover(&temp_dir.path().join("missing"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::FatalStartup);
    }

    #[tokio::test]
    async fn test_guest_refresh_attributes_and_measures() {
        let temp_dir = TempDir::new().unwrap();
        let cgroup_root =
            create_mock_pids_tree(&temp_dir, &[(1, "high_prio_machine"), (2, "low_prio_machine")])
                .await;
        let topology = HostTopology::from_core_packages(vec![0, 0, 1, 1]);

        let hypervisor = FakeHypervisor::new();
        hypervisor.add_domain(1, "high_prio_machine", Some(200_000), vec![0, 0, 0, 0]);
        hypervisor.add_domain(2, "low_prio_machine", None, vec![0, 0, 0, 0]);

        let mut registry = GuestRegistry::new(&cgroup_root);
        registry
            .refresh_at(&hypervisor, &topology, 1_000_000_000)
            .await
            .unwrap();

        assert_eq!(registry.len(), 2);
        let high = registry.get(1).unwrap();
        assert_eq!(high.priority, Priority::High);
        assert_eq!(high.quota_config, 200_000);
        assert_eq!(high.cgroup_name, "machine-qemu\\x2d1\\x2dvm1.scope");
        assert_eq!(high.usage, 0.0);

        let low = registry.get(2).unwrap();
        assert_eq!(low.priority, Priority::Low);
        assert_eq!(low.quota_config, QUOTA_UNSET);
        assert_eq!(low.partition, "low_prio_machine");
        assert_eq!(registry.low_priority_ids().collect::<Vec<_>>(), vec![2]);

        // Half a second later vm2 has run 0.25s on core 1 and 0.5s on core 2
        hypervisor.set_cpu_time(2, vec![0, 250_000_000, 500_000_000, 0]);
        registry
            .refresh_at(&hypervisor, &topology, 1_500_000_000)
            .await
            .unwrap();

        let low = registry.get(2).unwrap();
        assert_eq!(low.cpu_usage, vec![0.0, 0.5, 1.0, 0.0]);
        assert_eq!(low.usage, 1.5);
        assert_eq!(low.usage_in(0), 0.5);
        assert_eq!(low.usage_in(1), 1.0);

        let top = &registry.occupants(2)[0];
        assert_eq!((top.id, top.usage, top.priority), (2, 1.0, Priority::Low));
    }

    #[tokio::test]
    async fn test_domain_stopping_mid_probe_is_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let cgroup_root =
            create_mock_pids_tree(&temp_dir, &[(1, "low_prio_machine"), (2, "low_prio_machine")])
                .await;
        let topology = HostTopology::from_core_packages(vec![0, 0]);

        let hypervisor = FakeHypervisor::new();
        hypervisor.add_domain(1, "low_prio_machine", None, vec![0, 0]);
        hypervisor.add_domain(2, "low_prio_machine", None, vec![0, 0]);

        let mut registry = GuestRegistry::new(&cgroup_root);
        registry.refresh_at(&hypervisor, &topology, 1).await.unwrap();
        assert!(registry.contains(2));

        // Listed as active, but gone by the time its statistics are queried
        hypervisor.stop_after_listing(2);
        registry.refresh_at(&hypervisor, &topology, 2).await.unwrap();
        assert!(registry.contains(1));
        assert!(!registry.contains(2));
        assert!(!registry.is_low_priority(2));
        assert!(registry.occupants(0).iter().all(|o| o.id != 2));

        // A new domain stopping before attribution is never added
        hypervisor.add_domain(3, "low_prio_machine", None, vec![0, 0]);
        hypervisor.stop_after_listing(3);
        registry.refresh_at(&hypervisor, &topology, 3).await.unwrap();
        assert!(!registry.contains(3));
    }

    #[tokio::test]
    async fn test_unlisted_domains_are_removed() {
        let temp_dir = TempDir::new().unwrap();
        let cgroup_root = create_mock_pids_tree(&temp_dir, &[(4, "machine")]).await;
        let topology = HostTopology::from_core_packages(vec![0]);

        let hypervisor = FakeHypervisor::new();
        hypervisor.add_domain(4, "machine", None, vec![10]);

        let mut registry = GuestRegistry::new(&cgroup_root);
        registry.refresh_at(&hypervisor, &topology, 1).await.unwrap();
        assert_eq!(registry.get(4).unwrap().priority, Priority::High);

        hypervisor.remove_domain(4);
        registry.refresh_at(&hypervisor, &topology, 2).await.unwrap();
        assert!(registry.is_empty());
        assert!(registry.occupants(0).is_empty());
    }

    #[tokio::test]
    async fn test_bad_attributes_drop_only_that_domain() {
        let temp_dir = TempDir::new().unwrap();
        // vm 6 has no cgroup directory
        let cgroup_root =
            create_mock_pids_tree(&temp_dir, &[(5, "low_prio_machine"), (7, "machine")]).await;
        let topology = HostTopology::from_core_packages(vec![0]);

        let hypervisor = FakeHypervisor::new();
        hypervisor.add_domain(5, "batch_machine", None, vec![0]);
        hypervisor.add_domain(6, "low_prio_machine", None, vec![0]);
        hypervisor.add_domain(7, "machine", None, vec![0]);

        let mut registry = GuestRegistry::new(&cgroup_root);
        registry.refresh_at(&hypervisor, &topology, 1).await.unwrap();

        assert!(!registry.contains(5));
        assert!(!registry.contains(6));
        assert!(registry.contains(7));
    }

    #[tokio::test]
    async fn test_unexpected_hypervisor_error_propagates() {
        let temp_dir = TempDir::new().unwrap();
        let cgroup_root = create_mock_pids_tree(&temp_dir, &[(1, "machine")]).await;
        let topology = HostTopology::from_core_packages(vec![0]);

        let hypervisor = FakeHypervisor::new();
        hypervisor.add_domain(1, "machine", None, vec![0]);
        hypervisor.break_connection();

        let mut registry = GuestRegistry::new(&cgroup_root);
        let err = registry
            .refresh_at(&hypervisor, &topology, 1)
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::FatalRuntime);
    }
}
