//! Container to partition to bucket mapping

use crate::config::TopologyConfig;
use crate::error::{Error, Result};
use std::collections::{BTreeSet, HashMap};

/// Side-effect free lookup of where a container's archives go
pub trait TopologyResolver: Send + Sync {
    /// Partition (file bucket) holding the container
    fn partition_of(&self, container: &str) -> Result<String>;

    /// Tape bucket of a partition
    fn bucket_of(&self, partition_id: &str) -> Result<String>;

    /// Whether archives of this partition must stay in the disk cache
    fn is_pinned_forever(&self, partition_id: &str) -> bool;

    /// Containers mapped to a partition
    fn containers_of(&self, partition_id: &str) -> BTreeSet<String>;

    /// All known partitions
    fn partitions(&self) -> BTreeSet<String>;
}

#[derive(Debug)]
struct PartitionInfo {
    bucket_id: String,
    pinned: bool,
    containers: BTreeSet<String>,
}

/// Topology read once from configuration
#[derive(Debug, Default)]
pub struct StaticTopology {
    partitions: HashMap<String, PartitionInfo>,
    container_to_partition: HashMap<String, String>,
}

impl StaticTopology {
    #[must_use]
    pub fn from_config(config: &TopologyConfig) -> Self {
        let mut topology = Self::default();
        for bucket in &config.buckets {
            for partition in &bucket.partitions {
                for container in &partition.containers {
                    topology
                        .container_to_partition
                        .insert(container.clone(), partition.id.clone());
                }
                topology.partitions.insert(
                    partition.id.clone(),
                    PartitionInfo {
                        bucket_id: bucket.id.clone(),
                        pinned: bucket.keep_forever_in_cache,
                        containers: partition.containers.iter().cloned().collect(),
                    },
                );
            }
        }
        topology
    }
}

impl TopologyResolver for StaticTopology {
    fn partition_of(&self, container: &str) -> Result<String> {
        self.container_to_partition
            .get(container)
            .cloned()
            .ok_or_else(|| Error::bad_request(format!("unknown container: {container}")))
    }

    fn bucket_of(&self, partition_id: &str) -> Result<String> {
        self.partitions
            .get(partition_id)
            .map(|p| p.bucket_id.clone())
            .ok_or_else(|| Error::illegal_state(format!("unknown partition: {partition_id}")))
    }

    fn is_pinned_forever(&self, partition_id: &str) -> bool {
        self.partitions.get(partition_id).is_some_and(|p| p.pinned)
    }

    fn containers_of(&self, partition_id: &str) -> BTreeSet<String> {
        self.partitions
            .get(partition_id)
            .map(|p| p.containers.clone())
            .unwrap_or_default()
    }

    fn partitions(&self) -> BTreeSet<String> {
        self.partitions.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BucketConfig, PartitionConfig};

    fn config() -> TopologyConfig {
        TopologyConfig {
            buckets: vec![
                BucketConfig {
                    id: "objects".into(),
                    keep_forever_in_cache: false,
                    partitions: vec![
                        PartitionConfig {
                            id: "objects-a".into(),
                            containers: vec!["0_object".into()],
                        },
                        PartitionConfig {
                            id: "objects-b".into(),
                            containers: vec!["1_object".into(), "2_object".into()],
                        },
                    ],
                },
                BucketConfig {
                    id: "metadata".into(),
                    keep_forever_in_cache: true,
                    partitions: vec![PartitionConfig {
                        id: "meta".into(),
                        containers: vec!["0_unit".into()],
                    }],
                },
            ],
        }
    }

    #[test]
    fn test_lookups() {
        let topology = StaticTopology::from_config(&config());
        assert_eq!(topology.partition_of("2_object").unwrap(), "objects-b");
        assert_eq!(topology.bucket_of("objects-b").unwrap(), "objects");
        assert_eq!(topology.bucket_of("meta").unwrap(), "metadata");
        assert!(topology.is_pinned_forever("meta"));
        assert!(!topology.is_pinned_forever("objects-a"));
        assert_eq!(topology.containers_of("objects-b").len(), 2);
        assert_eq!(topology.partitions().len(), 3);
    }

    #[test]
    fn test_unknown_names() {
        let topology = StaticTopology::from_config(&config());
        assert!(matches!(
            topology.partition_of("nope"),
            Err(Error::BadRequest(_))
        ));
        assert!(topology.bucket_of("nope").is_err());
        assert!(!topology.is_pinned_forever("nope"));
        assert!(topology.containers_of("nope").is_empty());
    }
}
