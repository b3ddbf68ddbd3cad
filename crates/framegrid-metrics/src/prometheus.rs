//! Prometheus text exposition format.
//!
//! Renders the persisted fleet (clusters, nodes, jobs, tasks) into the
//! Prometheus text exposition format for scraping by a Prometheus server
//! or compatible agent.

use std::collections::BTreeMap;
use std::fmt::Write;

use framegrid_state::{Cluster, Node, NodeStatus, RenderJob, RenderTask};

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn node_gauge(out: &mut String, clusters: &[Cluster], name: &str, help: &str, value: impl Fn(&Node) -> String) {
    header(out, name, help, "gauge");
    for cluster in clusters {
        for node in &cluster.nodes {
            let _ = writeln!(
                out,
                "{name}{{cluster=\"{}\",node=\"{}\"}} {}",
                cluster.id,
                node.id,
                value(node)
            );
        }
    }
}

/// Render fleet, job and task gauges.
///
/// Task and job counts are labelled by status; statuses with no members
/// are omitted.
pub fn render_prometheus(clusters: &[Cluster], jobs: &[RenderJob], tasks: &[RenderTask]) -> String {
    let mut out = String::new();

    header(&mut out, "framegrid_cluster_nodes", "Registered nodes per cluster.", "gauge");
    for c in clusters {
        let _ = writeln!(out, "framegrid_cluster_nodes{{cluster=\"{}\"}} {}", c.id, c.nodes.len());
    }

    header(
        &mut out,
        "framegrid_cluster_system_load",
        "Claimed over total task slots (0.0-1.0).",
        "gauge",
    );
    for c in clusters {
        let load: u64 = c.nodes.iter().map(|n| u64::from(n.current_load)).sum();
        let capacity: u64 = c.nodes.iter().map(|n| u64::from(n.max_load)).sum();
        let ratio = if capacity == 0 { 0.0 } else { load as f64 / capacity as f64 };
        let _ = writeln!(out, "framegrid_cluster_system_load{{cluster=\"{}\"}} {ratio:.4}", c.id);
    }

    node_gauge(&mut out, clusters, "framegrid_node_load", "Tasks running on the node.", |n| {
        n.current_load.to_string()
    });
    node_gauge(&mut out, clusters, "framegrid_node_max_load", "Task slots of the node.", |n| {
        n.max_load.to_string()
    });
    node_gauge(&mut out, clusters, "framegrid_node_online", "1 when the stored node status is online.", |n| {
        u8::from(n.status == NodeStatus::Online).to_string()
    });
    node_gauge(&mut out, clusters, "framegrid_node_reliability", "Share of successful tasks (0.0-1.0).", |n| {
        format!("{:.4}", n.performance.reliability)
    });
    node_gauge(&mut out, clusters, "framegrid_node_cpu_percent", "Last sampled cpu usage.", |n| {
        format!("{:.2}", n.usage.cpu_percent)
    });
    node_gauge(&mut out, clusters, "framegrid_node_memory_percent", "Last sampled memory usage.", |n| {
        format!("{:.2}", n.usage.memory_percent)
    });
    node_gauge(&mut out, clusters, "framegrid_node_gpu_percent", "Last sampled gpu usage.", |n| {
        format!("{:.2}", n.usage.gpu_percent)
    });

    let mut task_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for t in tasks {
        *task_counts.entry(t.status.as_str()).or_default() += 1;
    }
    header(&mut out, "framegrid_tasks", "Render tasks by status.", "gauge");
    for (status, count) in &task_counts {
        let _ = writeln!(out, "framegrid_tasks{{status=\"{status}\"}} {count}");
    }

    let mut job_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for j in jobs {
        *job_counts.entry(j.status.as_str()).or_default() += 1;
    }
    header(&mut out, "framegrid_jobs", "Render jobs by status.", "gauge");
    for (status, count) in &job_counts {
        let _ = writeln!(out, "framegrid_jobs{{status=\"{status}\"}} {count}");
    }

    header(&mut out, "framegrid_cost_actual_total", "Accrued cost of all jobs.", "counter");
    let actual: f64 = jobs.iter().map(|j| j.cost.actual).sum();
    let _ = writeln!(out, "framegrid_cost_actual_total {actual:.4}");

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use framegrid_state::{
        JobCost, JobStatus, NodeCapabilities, NodePerformance, NodeUsage, Resolution,
        TaskPriority, TaskStatus,
    };

    fn test_node(id: &str, load: u32, max: u32) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            location: "eu-west-1".to_string(),
            status: NodeStatus::Online,
            capabilities: NodeCapabilities {
                cpu_cores: 8,
                gpu_count: 0,
                gpu_memory_gb: 0,
                ram_gb: 16,
                storage_gb: 100,
                supported_codecs: vec![],
                max_resolution: Resolution::FULL_HD,
                specializations: vec![],
            },
            current_load: load,
            max_load: max,
            performance: NodePerformance::default(),
            usage: NodeUsage {
                cpu_percent: 42.5,
                ..NodeUsage::default()
            },
            last_heartbeat: 0,
            task_queue: vec![],
        }
    }

    fn test_job(id: &str, status: JobStatus, actual: f64) -> RenderJob {
        RenderJob {
            id: id.to_string(),
            name: id.to_string(),
            project_id: "deck".to_string(),
            status,
            task_ids: vec![],
            total_frames: 0,
            completed_frames: 0,
            progress: 0.0,
            estimated_completion: None,
            cost: JobCost {
                actual,
                ..JobCost::default()
            },
            priority: TaskPriority::Normal,
            created_at: 0,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&[], &[], &[]);
        assert!(output.contains("# HELP framegrid_cluster_nodes"));
        assert!(output.contains("# TYPE framegrid_node_load gauge"));
        assert!(output.contains("framegrid_cost_actual_total 0.0000"));
    }

    #[test]
    fn render_cluster_and_nodes() {
        let mut cluster = Cluster::new("c1", "render", "eu-west-1");
        cluster.nodes = vec![test_node("n1", 1, 4), test_node("n2", 2, 4)];
        let output = render_prometheus(&[cluster], &[], &[]);

        assert!(output.contains("framegrid_cluster_nodes{cluster=\"c1\"} 2"));
        assert!(output.contains("framegrid_cluster_system_load{cluster=\"c1\"} 0.3750"));
        assert!(output.contains("framegrid_node_load{cluster=\"c1\",node=\"n2\"} 2"));
        assert!(output.contains("framegrid_node_online{cluster=\"c1\",node=\"n1\"} 1"));
        assert!(output.contains("framegrid_node_cpu_percent{cluster=\"c1\",node=\"n1\"} 42.50"));
    }

    #[test]
    fn render_job_counts_and_cost() {
        let jobs = vec![
            test_job("a", JobStatus::Completed, 1.25),
            test_job("b", JobStatus::Completed, 0.75),
            test_job("c", JobStatus::Processing, 0.0),
        ];
        let output = render_prometheus(&[], &jobs, &[]);

        assert!(output.contains("framegrid_jobs{status=\"completed\"} 2"));
        assert!(output.contains("framegrid_jobs{status=\"processing\"} 1"));
        assert!(!output.contains("framegrid_jobs{status=\"failed\"}"));
        assert!(output.contains("framegrid_cost_actual_total 2.0000"));
        assert_eq!(TaskStatus::Running.as_str(), "running");
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let mut cluster = Cluster::new("c1", "render", "eu-west-1");
        cluster.nodes = vec![test_node("n1", 0, 2)];
        let output = render_prometheus(&[cluster], &[test_job("a", JobStatus::Queued, 0.0)], &[]);

        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (series, value) = line.rsplit_once(' ').expect("series and value");
            assert!(series.starts_with("framegrid_"), "unexpected series: {line}");
            assert!(value.parse::<f64>().is_ok(), "value should be numeric: {line}");
        }
    }
}
