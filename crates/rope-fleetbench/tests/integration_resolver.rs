//! Integration tests for target, subnet and driver machine resolution

mod common;

use common::{driver_registry, target_registry, FakeRegistry};
use proptest::prelude::*;
use rope_fleetbench::cache::{JsonFileCache, MemoryCache, ResolutionCache};
use rope_fleetbench::config::ExperimentConfig;
use rope_fleetbench::error::ExperimentError;
use rope_fleetbench::resolver::{subnet_cache_key, TargetResolver};
use rope_fleetbench::types::{RequestKind, SubnetId};
use std::sync::Arc;

fn resolver(config: ExperimentConfig, registry: Arc<FakeRegistry>) -> TargetResolver {
    TargetResolver::new(Arc::new(config), registry, Arc::new(MemoryCache::new()))
}

mod target_tests {
    use super::*;

    #[tokio::test]
    async fn test_query_targets_single_node() {
        let config = ExperimentConfig {
            query_node_index: 1,
            ..Default::default()
        };
        let targets = resolver(config, Arc::new(target_registry()))
            .resolve_targets()
            .await
            .unwrap();

        assert_eq!(targets, vec!["10.0.0.2".to_string()]);
    }

    #[tokio::test]
    async fn test_call_targets_every_node() {
        let config = ExperimentConfig {
            request_kind: RequestKind::Call,
            ..Default::default()
        };
        let targets = resolver(config, Arc::new(target_registry()))
            .resolve_targets()
            .await
            .unwrap();

        assert_eq!(targets, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[tokio::test]
    async fn test_target_all_nodes_for_queries() {
        let config = ExperimentConfig {
            target_all_nodes: true,
            ..Default::default()
        };
        let targets = resolver(config, Arc::new(target_registry()))
            .resolve_targets()
            .await
            .unwrap();

        assert_eq!(targets.len(), 3);
    }

    #[tokio::test]
    async fn test_explicit_targets_skip_registry() {
        let registry = Arc::new(target_registry());
        let config = ExperimentConfig {
            explicit_targets: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
            ..Default::default()
        };
        let targets = resolver(config, registry.clone())
            .resolve_targets()
            .await
            .unwrap();

        assert_eq!(targets, vec!["10.0.0.1".to_string()]);
        assert_eq!(registry.calls(), 0);
    }

    #[tokio::test]
    async fn test_mainnet_partition() {
        let config = ExperimentConfig {
            mainnet_mode: true,
            mainnet_target_partition_id: Some(SubnetId::new("subnet-root")),
            request_kind: RequestKind::Call,
            ..Default::default()
        };
        let targets = resolver(config, Arc::new(target_registry()))
            .resolve_targets()
            .await
            .unwrap();

        assert_eq!(targets, vec!["10.0.0.10", "10.0.0.11"]);
    }

    #[tokio::test]
    async fn test_query_index_out_of_range() {
        let config = ExperimentConfig {
            query_node_index: 7,
            ..Default::default()
        };
        let result = resolver(config, Arc::new(target_registry()))
            .resolve_targets()
            .await;

        assert!(matches!(result, Err(ExperimentError::Resolution(_))));
    }

    #[tokio::test]
    async fn test_empty_subnet_fails() {
        let registry = FakeRegistry::new()
            .with_subnet("subnet-root", &["10.0.0.10"])
            .with_subnet("subnet-empty", &[]);
        let result = resolver(ExperimentConfig::default(), Arc::new(registry))
            .resolve_targets()
            .await;

        assert!(matches!(result, Err(ExperimentError::Resolution(_))));
    }

    proptest! {
        #[test]
        fn prop_query_selects_indexed_node(index in 0usize..3) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let config = ExperimentConfig {
                query_node_index: index,
                ..Default::default()
            };
            let targets = runtime
                .block_on(resolver(config, Arc::new(target_registry())).resolve_targets())
                .unwrap();

            let expected = ["10.0.0.1", "10.0.0.2", "10.0.0.3"][index];
            prop_assert_eq!(targets, vec![expected.to_string()]);
        }
    }
}

mod subnet_tests {
    use super::*;

    #[tokio::test]
    async fn test_subnet_lookup_is_cached() {
        let registry = Arc::new(target_registry());
        let cache = Arc::new(MemoryCache::new());
        let resolver = TargetResolver::new(
            Arc::new(ExperimentConfig::default()),
            registry.clone(),
            cache.clone(),
        );

        let first = resolver.resolve_subnet_id("10.0.0.2").await.unwrap();
        assert_eq!(first, SubnetId::new("subnet-app"));
        assert_eq!(
            cache.get(&subnet_cache_key("10.0.0.2")).as_deref(),
            Some("subnet-app")
        );

        let calls = registry.calls();
        let second = resolver.resolve_subnet_id("10.0.0.2").await.unwrap();
        assert_eq!(second, first);
        assert_eq!(registry.calls(), calls);
    }

    #[tokio::test]
    async fn test_subnet_cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        {
            let resolver = TargetResolver::new(
                Arc::new(ExperimentConfig::default()),
                Arc::new(target_registry()),
                Arc::new(JsonFileCache::open(&path).unwrap()),
            );
            resolver.resolve_subnet_id("10.0.0.11").await.unwrap();
        }

        let registry = Arc::new(target_registry());
        let resolver = TargetResolver::new(
            Arc::new(ExperimentConfig::default()),
            registry.clone(),
            Arc::new(JsonFileCache::open(&path).unwrap()),
        );
        let subnet = resolver.resolve_subnet_id("10.0.0.11").await.unwrap();

        assert_eq!(subnet, SubnetId::new("subnet-root"));
        assert_eq!(registry.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_target_fails() {
        let result = resolver(ExperimentConfig::default(), Arc::new(target_registry()))
            .resolve_subnet_id("192.168.1.1")
            .await;

        assert!(matches!(result, Err(ExperimentError::Resolution(_))));
    }
}

mod driver_tests {
    use super::*;

    #[tokio::test]
    async fn test_explicit_driver_machines() {
        let config = ExperimentConfig {
            explicit_driver_machines: vec![
                "10.1.0.9".to_string(),
                "10.1.0.8".to_string(),
                "10.1.0.9".to_string(),
            ],
            ..Default::default()
        };
        let drivers = driver_registry();
        let machines = resolver(config, Arc::new(target_registry()))
            .resolve_driver_machines(&drivers)
            .await
            .unwrap();

        let addresses: Vec<&str> = machines.iter().map(|m| m.address()).collect();
        assert_eq!(addresses, vec!["10.1.0.9", "10.1.0.8"]);
        assert_eq!(drivers.calls(), 0);
    }

    #[tokio::test]
    async fn test_separate_driver_testnet_uses_application_subnets() {
        let config = ExperimentConfig {
            testnet: "small01".to_string(),
            driver_testnet: "small02".to_string(),
            ..Default::default()
        };
        let machines = resolver(config, Arc::new(target_registry()))
            .resolve_driver_machines(&driver_registry())
            .await
            .unwrap();

        let addresses: Vec<&str> = machines.iter().map(|m| m.address()).collect();
        assert_eq!(addresses, vec!["10.1.0.1", "10.1.0.2", "10.1.0.3"]);
    }

    #[tokio::test]
    async fn test_driver_partition_override() {
        let config = ExperimentConfig {
            testnet: "small01".to_string(),
            driver_testnet: "small02".to_string(),
            driver_partition_override: Some(SubnetId::new("drivers-b")),
            ..Default::default()
        };
        let machines = resolver(config, Arc::new(target_registry()))
            .resolve_driver_machines(&driver_registry())
            .await
            .unwrap();

        assert_eq!(machines.len(), 1);
        assert_eq!(machines.as_slice()[0].address(), "10.1.0.3");
    }

    #[tokio::test]
    async fn test_shared_testnet_uses_driver_subnet_index() {
        let registry = target_registry();
        let machines = resolver(ExperimentConfig::default(), Arc::new(target_registry()))
            .resolve_driver_machines(&registry)
            .await
            .unwrap();

        let addresses: Vec<&str> = machines.iter().map(|m| m.address()).collect();
        assert_eq!(addresses, vec!["10.0.0.10", "10.0.0.11"]);
    }
}
