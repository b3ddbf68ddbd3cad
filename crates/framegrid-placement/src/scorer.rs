//! Node scoring for placement decisions.
//!
//! Evaluates eligible nodes using a weighted combination of:
//! - **Headroom**: `1 - current_load / max_load`
//! - **Throughput**: `performance.average_render_speed`
//! - **Reliability**: `performance.reliability` (0..1)
//!
//! Ranking is deterministic: descending score, ties broken by node id.

use std::cmp::Ordering;

use framegrid_state::{ClusterId, Node, NodeId};

/// Scored placement candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeScore {
    pub node_id: NodeId,
    pub cluster_id: ClusterId,
    /// Total composite score (higher = better).
    pub score: f64,
    /// Breakdown of score components.
    pub breakdown: ScoreBreakdown,
}

/// Individual (unweighted) score components for debugging.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBreakdown {
    pub headroom: f64,
    pub throughput: f64,
    pub reliability: f64,
}

/// Weights for the scoring components.
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub headroom: f64,
    pub throughput: f64,
    pub reliability: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            headroom: 0.3,
            throughput: 0.3,
            reliability: 0.4,
        }
    }
}

/// Score a single node. Pure: identical node state gives an identical score.
pub fn score_node(node: &Node, weights: &ScoringWeights) -> (f64, ScoreBreakdown) {
    let breakdown = ScoreBreakdown {
        headroom: 1.0 - node.load_ratio(),
        throughput: node.performance.average_render_speed,
        reliability: node.performance.reliability,
    };
    let score = weights.headroom * breakdown.headroom
        + weights.throughput * breakdown.throughput
        + weights.reliability * breakdown.reliability;
    (score, breakdown)
}

/// Ordering used everywhere candidates are ranked: best score first, then
/// lowest node id.
pub fn compare_scores(a: &NodeScore, b: &NodeScore) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.node_id.cmp(&b.node_id))
}

/// Score candidate nodes and return them sorted (best first).
///
/// Callers pass only nodes that already passed the matcher.
pub fn rank_nodes<'a, I>(candidates: I, weights: &ScoringWeights) -> Vec<NodeScore>
where
    I: IntoIterator<Item = (&'a ClusterId, &'a Node)>,
{
    let mut scores: Vec<NodeScore> = candidates
        .into_iter()
        .map(|(cluster_id, node)| {
            let (score, breakdown) = score_node(node, weights);
            NodeScore {
                node_id: node.id.clone(),
                cluster_id: cluster_id.clone(),
                score,
                breakdown,
            }
        })
        .collect();

    scores.sort_by(compare_scores);
    scores
}
