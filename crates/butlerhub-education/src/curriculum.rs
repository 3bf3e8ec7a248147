use std::collections::{HashMap, HashSet};

pub const MAX_NODE_DEPTH: u32 = 5;
pub const MAX_NODES_PER_MAP: usize = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct CurriculumNode {
    pub id: String,
    pub depth: u32,
    pub effort_minutes: Option<u32>,
    pub mastery_status: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrerequisiteEdge {
    pub parent_node_id: String,
    pub child_node_id: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CurriculumError {
    #[error("node count limit exceeded: {0} nodes (max {MAX_NODES_PER_MAP})")]
    TooManyNodes(usize),
    #[error("node depth limit exceeded for node {node_id} (label={label:?}): depth={depth} (max {MAX_NODE_DEPTH})")]
    DepthExceeded {
        node_id: String,
        label: String,
        depth: u32,
    },
    #[error("self-loop detected on node {0}")]
    SelfLoop(String),
    #[error("edge references unknown node label {0:?}")]
    UnknownLabel(String),
    #[error("cycle detected: traversal reached {to:?} from {from:?}")]
    Cycle { from: String, to: String },
    #[error("cycle detected during topological sort: processed {processed} of {total} nodes")]
    UnsortableCycle { processed: usize, total: usize },
}

fn mastery_rank(status: &str) -> u8 {
    if status == "diagnosed" || status == "learning" {
        0
    } else {
        1
    }
}

fn sort_key(node: &CurriculumNode) -> (u32, u32, u8, String) {
    let effort_key = node.effort_minutes.unwrap_or(999_999);
    (
        node.depth,
        effort_key,
        mastery_rank(&node.mastery_status),
        node.label.clone(),
    )
}

pub fn validate_constraints(nodes: &[CurriculumNode]) -> Result<(), CurriculumError> {
    if nodes.len() > MAX_NODES_PER_MAP {
        return Err(CurriculumError::TooManyNodes(nodes.len()));
    }
    for node in nodes {
        if node.depth > MAX_NODE_DEPTH {
            return Err(CurriculumError::DepthExceeded {
                node_id: node.id.clone(),
                label: node.label.clone(),
                depth: node.depth,
            });
        }
    }
    Ok(())
}

/// DFS with WHITE/GRAY/BLACK coloring over the prerequisite graph.
pub fn check_dag_acyclicity(
    nodes: &[CurriculumNode],
    edges: &[PrerequisiteEdge],
) -> Result<(), CurriculumError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut adj: HashMap<&str, Vec<&str>> = nodes.iter().map(|n| (n.id.as_str(), Vec::new())).collect();
    for edge in edges {
        if edge.parent_node_id == edge.child_node_id {
            return Err(CurriculumError::SelfLoop(edge.parent_node_id.clone()));
        }
        adj.entry(edge.parent_node_id.as_str())
            .or_default()
            .push(edge.child_node_id.as_str());
    }

    let mut color: HashMap<&str, Color> = nodes.iter().map(|n| (n.id.as_str(), Color::White)).collect();

    fn dfs<'a>(
        node_id: &'a str,
        adj: &HashMap<&'a str, Vec<&'a str>>,
        color: &mut HashMap<&'a str, Color>,
    ) -> Result<(), CurriculumError> {
        color.insert(node_id, Color::Gray);
        if let Some(neighbors) = adj.get(node_id) {
            for &neighbor in neighbors {
                match color.get(neighbor) {
                    Some(Color::Gray) => {
                        return Err(CurriculumError::Cycle {
                            from: node_id.to_string(),
                            to: neighbor.to_string(),
                        })
                    }
                    Some(Color::White) => dfs(neighbor, adj, color)?,
                    _ => {}
                }
            }
        }
        color.insert(node_id, Color::Black);
        Ok(())
    }

    let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    for id in ids {
        if color[id] == Color::White {
            dfs(id, &adj, &mut color)?;
        }
    }
    Ok(())
}

/// Kahn's algorithm with a tie-broken, fully re-sorted frontier every
/// iteration — deterministic order, not just *a* topological order.
pub fn topological_sort_with_tiebreak(
    nodes: &[CurriculumNode],
    edges: &[PrerequisiteEdge],
) -> Result<Vec<String>, CurriculumError> {
    let node_map: HashMap<&str, &CurriculumNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();

    let mut in_degree: HashMap<&str, u32> = nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut out_edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        out_edges
            .entry(edge.parent_node_id.as_str())
            .or_default()
            .push(edge.child_node_id.as_str());
        *in_degree.entry(edge.child_node_id.as_str()).or_insert(0) += 1;
    }

    let mut frontier: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut ordered: Vec<String> = Vec::with_capacity(nodes.len());

    while !frontier.is_empty() {
        frontier.sort_by_key(|id| sort_key(node_map[id]));
        let current = frontier.remove(0);
        ordered.push(current.to_string());

        if let Some(neighbors) = out_edges.get(current) {
            for &neighbor in neighbors {
                let deg = in_degree.get_mut(neighbor).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    frontier.push(neighbor);
                }
            }
        }
    }

    if ordered.len() != nodes.len() {
        return Err(CurriculumError::UnsortableCycle {
            processed: ordered.len(),
            total: nodes.len(),
        });
    }
    Ok(ordered)
}

/// Quality≥3 diagnostic results seed matching-labeled nodes as `diagnosed`
/// with `mastery_score = min(0.9, quality/5.0*0.9)`, rounded to 4 decimals.
/// Unmatched labels are silently discarded.
pub fn apply_diagnostic_seeding(
    nodes: &mut [CurriculumNode],
    diagnostic_results: &HashMap<String, u8>,
) -> Vec<(String, f64)> {
    let mut seeded = Vec::new();
    for node in nodes.iter_mut() {
        if let Some(&quality) = diagnostic_results.get(&node.label) {
            if quality >= 3 {
                let mastery_score = ((quality as f64 / 5.0) * 0.9).min(0.9);
                let mastery_score = (mastery_score * 10_000.0).round() / 10_000.0;
                node.mastery_status = "diagnosed".to_string();
                seeded.push((node.id.clone(), mastery_score));
            }
        }
    }
    seeded
}

/// Frontier for `curriculum_next_node`: unseen/diagnosed/learning nodes with
/// no unmastered prerequisite parent, ordered by ascending `sequence`
/// (`None` sorts last). The caller supplies `sequence` separately since it's
/// storage-assigned, not part of the pure node shape used for sorting.
pub fn frontier_nodes<'a>(
    nodes: &'a [CurriculumNode],
    edges: &[PrerequisiteEdge],
    sequence: &HashMap<String, u32>,
) -> Vec<&'a CurriculumNode> {
    let mastered: HashSet<&str> = nodes
        .iter()
        .filter(|n| n.mastery_status == "mastered")
        .map(|n| n.id.as_str())
        .collect();

    let blocked: HashSet<&str> = edges
        .iter()
        .filter(|e| !mastered.contains(e.parent_node_id.as_str()))
        .map(|e| e.child_node_id.as_str())
        .collect();

    let mut frontier: Vec<&CurriculumNode> = nodes
        .iter()
        .filter(|n| {
            matches!(n.mastery_status.as_str(), "unseen" | "diagnosed" | "learning")
                && !blocked.contains(n.id.as_str())
        })
        .collect();

    frontier.sort_by_key(|n| sequence.get(&n.id).copied().unwrap_or(u32::MAX));
    frontier
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, depth: u32, label: &str) -> CurriculumNode {
        CurriculumNode {
            id: id.to_string(),
            depth,
            effort_minutes: None,
            mastery_status: "unseen".to_string(),
            label: label.to_string(),
        }
    }

    fn edge(parent: &str, child: &str) -> PrerequisiteEdge {
        PrerequisiteEdge {
            parent_node_id: parent.to_string(),
            child_node_id: child.to_string(),
        }
    }

    #[test]
    fn topo_sort_respects_depth_then_label() {
        let nodes = vec![node("b", 0, "beta"), node("a", 0, "alpha"), node("c", 1, "gamma")];
        let edges = vec![edge("a", "c")];
        let order = topological_sort_with_tiebreak(&nodes, &edges).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn topo_sort_detects_cycle() {
        let nodes = vec![node("a", 0, "a"), node("b", 0, "b")];
        let edges = vec![edge("a", "b"), edge("b", "a")];
        assert!(matches!(
            topological_sort_with_tiebreak(&nodes, &edges),
            Err(CurriculumError::UnsortableCycle { .. })
        ));
    }

    #[test]
    fn dag_check_flags_self_loop() {
        let nodes = vec![node("a", 0, "a")];
        let edges = vec![edge("a", "a")];
        assert_eq!(
            check_dag_acyclicity(&nodes, &edges),
            Err(CurriculumError::SelfLoop("a".to_string()))
        );
    }

    #[test]
    fn depth_limit_is_enforced() {
        let nodes = vec![node("a", 6, "a")];
        assert!(matches!(
            validate_constraints(&nodes),
            Err(CurriculumError::DepthExceeded { .. })
        ));
    }

    #[test]
    fn diagnostic_seeding_caps_score_at_point_nine() {
        let mut nodes = vec![node("a", 0, "alpha")];
        let mut results = HashMap::new();
        results.insert("alpha".to_string(), 5u8);
        let seeded = apply_diagnostic_seeding(&mut nodes, &results);
        assert_eq!(seeded, vec![("a".to_string(), 0.9)]);
        assert_eq!(nodes[0].mastery_status, "diagnosed");
    }

    #[test]
    fn diagnostic_seeding_ignores_low_quality_and_unmatched_labels() {
        let mut nodes = vec![node("a", 0, "alpha")];
        let mut results = HashMap::new();
        results.insert("alpha".to_string(), 2u8);
        results.insert("nonexistent".to_string(), 5u8);
        let seeded = apply_diagnostic_seeding(&mut nodes, &results);
        assert!(seeded.is_empty());
        assert_eq!(nodes[0].mastery_status, "unseen");
    }

    #[test]
    fn frontier_excludes_nodes_with_unmastered_prerequisite() {
        let mut a = node("a", 0, "a");
        a.mastery_status = "learning".to_string();
        let mut b = node("b", 1, "b");
        b.mastery_status = "unseen".to_string();
        let nodes = vec![a, b];
        let edges = vec![edge("a", "b")];
        let sequence = HashMap::new();
        let frontier = frontier_nodes(&nodes, &edges, &sequence);
        assert_eq!(frontier.len(), 1);
        assert_eq!(frontier[0].id, "a");
    }
}
