pub mod metrics;

pub use metrics::{collect_cluster_usage, ClusterUsage, NodeUsage, UsageTotals};
