//! framegrid.toml configuration parser.
//!
//! Every section is optional; missing values fall back to the defaults
//! of the corresponding state types. Durations are written as `"500ms"`,
//! `"30s"`, `"5m"` or `"1h"`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use framegrid_state::{
    AlertThresholds, AutoScalingConfig, Cluster, LoadBalancerConfig, LoadBalancingAlgorithm,
    MAX_HEALTH_CHECK_INTERVAL_SECS, MonitoringConfig, Node, NodeCapabilities, NodePerformance, NodeStatus, NodeUsage,
    Resolution, Specialization,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    pub scheduler: Option<SchedulerSection>,
    pub cost: Option<CostSection>,
    pub autoscale: Option<AutoscaleSection>,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerSection {
    pub tick_interval: Option<String>,
    pub missed_heartbeats: Option<u32>,
    pub default_max_retries: Option<u32>,
    pub chunk_frames: Option<u64>,
    pub ms_per_frame: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSection {
    pub compute_per_hour: Option<f64>,
    pub storage_per_gb: Option<f64>,
    pub bandwidth_per_gb: Option<f64>,
    pub urgent_premium_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoscaleSection {
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub id: Option<String>,
    pub name: String,
    pub region: String,
    pub load_balancer: Option<LoadBalancerSection>,
    pub autoscaling: Option<AutoscalingSection>,
    pub monitoring: Option<MonitoringSection>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerSection {
    pub algorithm: Option<LoadBalancingAlgorithm>,
    pub health_check_interval: Option<String>,
    pub failover_threshold: Option<u32>,
    /// Weighted round-robin weights keyed by node name.
    pub weights: Option<HashMap<String, u32>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoscalingSection {
    pub enabled: Option<bool>,
    pub min_nodes: Option<u32>,
    pub max_nodes: Option<u32>,
    pub scale_up_threshold: Option<f64>,
    pub scale_down_threshold: Option<f64>,
    pub cooldown: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringSection {
    pub enabled: Option<bool>,
    pub interval: Option<String>,
    pub cpu_alert: Option<f64>,
    pub memory_alert: Option<f64>,
    pub gpu_alert: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: Option<String>,
    pub name: String,
    /// Defaults to the cluster region.
    pub location: Option<String>,
    pub cpu_cores: u32,
    pub gpu_count: Option<u32>,
    pub gpu_memory_gb: Option<u32>,
    pub ram_gb: u32,
    pub storage_gb: Option<u32>,
    pub max_load: u32,
    #[serde(default)]
    pub codecs: Vec<String>,
    /// `"{width}x{height}"`, defaults to 1920x1080.
    pub max_resolution: Option<String>,
    #[serde(default)]
    pub specializations: Vec<Specialization>,
    pub average_render_speed: Option<f64>,
}

/// Resolved `[scheduler]` values.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub missed_heartbeats: u32,
    pub default_max_retries: u32,
    pub chunk_frames: u64,
    pub ms_per_frame: u64,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: FleetConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(cost) = &self.cost {
            let rates = [
                ("compute_per_hour", cost.compute_per_hour),
                ("storage_per_gb", cost.storage_per_gb),
                ("bandwidth_per_gb", cost.bandwidth_per_gb),
            ];
            for (name, rate) in rates {
                if let Some(rate) = rate
                    && (!rate.is_finite() || rate < 0.0)
                {
                    bail!("cost.{name} must be a non-negative number");
                }
            }
            if let Some(multiplier) = cost.urgent_premium_multiplier
                && (!multiplier.is_finite() || multiplier < 1.0)
            {
                bail!("cost.urgent_premium_multiplier must be at least 1");
            }
        }

        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if !names.insert(cluster.cluster_id()) {
                bail!("duplicate cluster id `{}`", cluster.cluster_id());
            }
            if let Some(scaling) = &cluster.autoscaling {
                let defaults = AutoScalingConfig::default();
                let up = scaling.scale_up_threshold.unwrap_or(defaults.scale_up_threshold);
                let down = scaling
                    .scale_down_threshold
                    .unwrap_or(defaults.scale_down_threshold);
                if !(0.0..=1.0).contains(&up) || !(0.0..=1.0).contains(&down) {
                    bail!("cluster `{}`: scale thresholds must be within 0..=1", cluster.name);
                }
                if down >= up {
                    bail!(
                        "cluster `{}`: scale_down_threshold must be below scale_up_threshold",
                        cluster.name
                    );
                }
                let min = scaling.min_nodes.unwrap_or(defaults.min_nodes);
                let max = scaling.max_nodes.unwrap_or(defaults.max_nodes);
                if min > max {
                    bail!("cluster `{}`: min_nodes exceeds max_nodes", cluster.name);
                }
            }
            if let Some(interval) = cluster
                .load_balancer
                .as_ref()
                .and_then(|lb| lb.health_check_interval.as_deref())
            {
                let secs = parse_duration(interval)?.as_secs();
                if !(1..=MAX_HEALTH_CHECK_INTERVAL_SECS).contains(&secs) {
                    bail!(
                        "cluster `{}`: health_check_interval must be between 1s and {}s",
                        cluster.name,
                        MAX_HEALTH_CHECK_INTERVAL_SECS
                    );
                }
            }
            let mut node_names = HashSet::new();
            for node in &cluster.nodes {
                if !node_names.insert(node.name.as_str()) {
                    bail!("cluster `{}`: duplicate node `{}`", cluster.name, node.name);
                }
                if node.max_load == 0 {
                    bail!("node `{}`: max_load must be positive", node.name);
                }
                if let Some(res) = &node.max_resolution {
                    parse_resolution(res)?;
                }
            }
        }
        Ok(())
    }

    /// Scheduler settings with defaults applied.
    pub fn scheduler_settings(&self) -> anyhow::Result<SchedulerSettings> {
        let section = self.scheduler.clone().unwrap_or_default();
        Ok(SchedulerSettings {
            tick_interval: parse_duration_or(section.tick_interval.as_deref(), Duration::from_secs(1))?,
            missed_heartbeats: section.missed_heartbeats.unwrap_or(3),
            default_max_retries: section.default_max_retries.unwrap_or(3),
            chunk_frames: section.chunk_frames.unwrap_or(300),
            ms_per_frame: section.ms_per_frame.unwrap_or(100),
        })
    }

    /// Autoscaler evaluation interval.
    pub fn autoscale_interval(&self) -> anyhow::Result<Duration> {
        let interval = self.autoscale.as_ref().and_then(|a| a.interval.as_deref());
        parse_duration_or(interval, Duration::from_secs(30))
    }

    /// Materialize the configured clusters and their nodes.
    ///
    /// Nodes start `Online` with a heartbeat at `now`; cluster and node ids
    /// are derived from names so that restarts produce the same ids.
    pub fn build_clusters(&self, now: u64) -> anyhow::Result<Vec<Cluster>> {
        self.clusters.iter().map(|c| c.build(now)).collect()
    }

    /// Scaffold a minimal framegrid.toml with one GPU cluster.
    pub fn scaffold() -> Self {
        FleetConfig {
            scheduler: Some(SchedulerSection {
                tick_interval: Some("1s".to_string()),
                missed_heartbeats: Some(3),
                default_max_retries: Some(3),
                chunk_frames: Some(300),
                ms_per_frame: Some(100),
            }),
            cost: Some(CostSection {
                compute_per_hour: Some(2.5),
                storage_per_gb: Some(0.023),
                bandwidth_per_gb: Some(0.09),
                urgent_premium_multiplier: Some(1.5),
            }),
            autoscale: Some(AutoscaleSection {
                interval: Some("30s".to_string()),
            }),
            clusters: vec![ClusterConfig {
                id: None,
                name: "render-eu".to_string(),
                region: "eu-west-1".to_string(),
                load_balancer: Some(LoadBalancerSection {
                    algorithm: Some(LoadBalancingAlgorithm::PerformanceBased),
                    health_check_interval: Some("10s".to_string()),
                    failover_threshold: Some(3),
                    weights: None,
                }),
                autoscaling: None,
                monitoring: None,
                nodes: vec![NodeConfig {
                    id: None,
                    name: "gpu-01".to_string(),
                    location: None,
                    cpu_cores: 16,
                    gpu_count: Some(1),
                    gpu_memory_gb: Some(24),
                    ram_gb: 64,
                    storage_gb: Some(500),
                    max_load: 4,
                    codecs: vec!["h264".to_string(), "h265".to_string()],
                    max_resolution: Some("3840x2160".to_string()),
                    specializations: vec![Specialization::GpuAcceleration],
                    average_render_speed: None,
                }],
            }],
        }
    }
}

impl ClusterConfig {
    pub fn cluster_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| self.name.clone())
    }

    fn build(&self, now: u64) -> anyhow::Result<Cluster> {
        let id = self.cluster_id();
        let mut cluster = Cluster::new(id.clone(), self.name.clone(), self.region.clone());
        cluster.created_at = now;

        let mut weights_by_name = HashMap::new();
        if let Some(lb) = &self.load_balancer {
            let defaults = LoadBalancerConfig::default();
            cluster.load_balancer = LoadBalancerConfig {
                algorithm: lb.algorithm.unwrap_or(defaults.algorithm),
                health_check_interval_secs: parse_duration_or(
                    lb.health_check_interval.as_deref(),
                    Duration::from_secs(defaults.health_check_interval_secs),
                )?
                .as_secs()
                .max(1),
                failover_threshold: lb.failover_threshold.unwrap_or(defaults.failover_threshold),
                weights: HashMap::new(),
            };
            weights_by_name = lb.weights.clone().unwrap_or_default();
        }

        if let Some(scaling) = &self.autoscaling {
            let defaults = AutoScalingConfig::default();
            cluster.autoscaling = AutoScalingConfig {
                enabled: scaling.enabled.unwrap_or(defaults.enabled),
                min_nodes: scaling.min_nodes.unwrap_or(defaults.min_nodes),
                max_nodes: scaling.max_nodes.unwrap_or(defaults.max_nodes),
                scale_up_threshold: scaling.scale_up_threshold.unwrap_or(defaults.scale_up_threshold),
                scale_down_threshold: scaling
                    .scale_down_threshold
                    .unwrap_or(defaults.scale_down_threshold),
                cooldown_secs: parse_duration_or(
                    scaling.cooldown.as_deref(),
                    Duration::from_secs(defaults.cooldown_secs),
                )?
                .as_secs(),
            };
        }

        if let Some(monitoring) = &self.monitoring {
            let defaults = MonitoringConfig::default();
            cluster.monitoring = MonitoringConfig {
                enabled: monitoring.enabled.unwrap_or(defaults.enabled),
                interval_secs: parse_duration_or(
                    monitoring.interval.as_deref(),
                    Duration::from_secs(defaults.interval_secs),
                )?
                .as_secs()
                .max(1),
                alert_thresholds: AlertThresholds {
                    cpu_percent: monitoring
                        .cpu_alert
                        .unwrap_or(defaults.alert_thresholds.cpu_percent),
                    memory_percent: monitoring
                        .memory_alert
                        .unwrap_or(defaults.alert_thresholds.memory_percent),
                    gpu_percent: monitoring
                        .gpu_alert
                        .unwrap_or(defaults.alert_thresholds.gpu_percent),
                },
            };
        }

        for node_cfg in &self.nodes {
            let node = node_cfg.build(&id, &self.region, now)?;
            if let Some(weight) = weights_by_name.get(&node_cfg.name) {
                cluster.load_balancer.weights.insert(node.id.clone(), *weight);
            }
            cluster.nodes.push(node);
        }

        Ok(cluster)
    }
}

impl NodeConfig {
    fn build(&self, cluster_id: &str, region: &str, now: u64) -> anyhow::Result<Node> {
        let max_resolution = match &self.max_resolution {
            Some(r) => parse_resolution(r)?,
            None => Resolution::FULL_HD,
        };
        let mut performance = NodePerformance::default();
        if let Some(speed) = self.average_render_speed {
            performance.average_render_speed = speed;
        }
        Ok(Node {
            id: self
                .id
                .clone()
                .unwrap_or_else(|| format!("{cluster_id}/{}", self.name)),
            name: self.name.clone(),
            location: self.location.clone().unwrap_or_else(|| region.to_string()),
            status: NodeStatus::Online,
            capabilities: NodeCapabilities {
                cpu_cores: self.cpu_cores,
                gpu_count: self.gpu_count.unwrap_or(0),
                gpu_memory_gb: self.gpu_memory_gb.unwrap_or(0),
                ram_gb: self.ram_gb,
                storage_gb: self.storage_gb.unwrap_or(0),
                supported_codecs: self.codecs.clone(),
                max_resolution,
                specializations: self.specializations.clone(),
            },
            current_load: 0,
            max_load: self.max_load,
            performance,
            usage: NodeUsage::default(),
            last_heartbeat: now,
            task_queue: Vec::new(),
        })
    }
}

/// Parse a duration string like "500ms", "30s", "5m", "1h" or bare seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return Ok(Duration::from_millis(parse_count(ms, s)?));
    }
    let (value, unit_secs) = if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else {
        (s, 1)
    };
    let secs = parse_count(value, s)?
        .checked_mul(unit_secs)
        .with_context(|| format!("duration `{s}` is too large"))?;
    Ok(Duration::from_secs(secs))
}

fn parse_count(value: &str, original: &str) -> anyhow::Result<u64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid duration `{original}`"))
}

fn parse_duration_or(value: Option<&str>, default: Duration) -> anyhow::Result<Duration> {
    match value {
        Some(v) => parse_duration(v),
        None => Ok(default),
    }
}

fn parse_resolution(s: &str) -> anyhow::Result<Resolution> {
    let (w, h) = s
        .split_once('x')
        .with_context(|| format!("invalid resolution `{s}`, expected WIDTHxHEIGHT"))?;
    Ok(Resolution {
        width: w.trim().parse().with_context(|| format!("invalid width in `{s}`"))?,
        height: h.trim().parse().with_context(|| format!("invalid height in `{s}`"))?,
    })
}
