use std::collections::HashMap;

use crate::graph::BlockGraph;

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Result of ordering a graph: block ids in dependency order, plus the
/// connections found to close a cycle.
#[derive(Debug, Default)]
pub struct TopoResult {
    pub order: Vec<String>,
    /// Connection ids of back edges. A feedback edge never reorders the
    /// graph; readers of a feedback value rely on output registers being
    /// allocated before any code is emitted.
    pub feedback: Vec<String>,
}

/// Depth-first topological sort with three-color marking. A connection
/// into a block still on the visit stack is tagged as feedback and the
/// sort carries on; everything else comes out in dependency order.
/// Deterministic for a given document: roots and edges are walked in
/// document order.
pub fn sort(graph: &BlockGraph) -> TopoResult {
    let mut marks: HashMap<&str, Mark> = graph
        .blocks
        .iter()
        .map(|b| (b.id.as_str(), Mark::White))
        .collect();
    let mut result = TopoResult::default();
    for block in &graph.blocks {
        visit(graph, &block.id, &mut marks, &mut result);
    }
    // The DFS finishes sinks first; flip to dependency order.
    result.order.reverse();
    result
}

fn visit<'g>(
    graph: &'g BlockGraph,
    id: &'g str,
    marks: &mut HashMap<&'g str, Mark>,
    result: &mut TopoResult,
) {
    match marks.get(id) {
        Some(Mark::White) => {}
        // Gray is handled at the edge below; a direct revisit is done.
        _ => return,
    }
    marks.insert(id, Mark::Gray);
    for connection in graph.connections_from(id) {
        let next = connection.to.block_id.as_str();
        match marks.get(next) {
            Some(Mark::Gray) => result.feedback.push(connection.id.clone()),
            Some(Mark::White) => visit(graph, next, marks, result),
            _ => {}
        }
    }
    if let Some(mark) = marks.get_mut(id) {
        *mark = Mark::Black;
    }
    result.order.push(id.to_owned());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Block, Connection, PortRef};

    fn block(id: &str) -> Block {
        Block {
            id: id.into(),
            kind: "test".into(),
            position: serde_json::Value::Null,
            parameters: Default::default(),
        }
    }

    fn edge(id: &str, from: &str, to: &str) -> Connection {
        Connection {
            id: id.into(),
            from: PortRef {
                block_id: from.into(),
                port_id: "out".into(),
            },
            to: PortRef {
                block_id: to.into(),
                port_id: "in".into(),
            },
        }
    }

    fn graph(blocks: &[&str], edges: &[(&str, &str, &str)]) -> BlockGraph {
        BlockGraph {
            metadata: Default::default(),
            blocks: blocks.iter().map(|id| block(id)).collect(),
            connections: edges.iter().map(|(id, f, t)| edge(id, f, t)).collect(),
        }
    }

    #[test]
    fn chain_is_ordered_source_first() {
        // Blocks deliberately declared out of order.
        let g = graph(
            &["sink", "mid", "source"],
            &[("c1", "source", "mid"), ("c2", "mid", "sink")],
        );
        let result = sort(&g);
        assert!(result.feedback.is_empty());
        assert_eq!(result.order, ["source", "mid", "sink"]);
    }

    #[test]
    fn diamond_respects_dependencies() {
        let g = graph(
            &["in", "l", "r", "out"],
            &[
                ("c1", "in", "l"),
                ("c2", "in", "r"),
                ("c3", "l", "out"),
                ("c4", "r", "out"),
            ],
        );
        let result = sort(&g);
        assert!(result.feedback.is_empty());
        let position = |id: &str| result.order.iter().position(|b| b == id).unwrap();
        assert!(position("in") < position("l"));
        assert!(position("in") < position("r"));
        assert!(position("out") > position("l"));
        assert!(position("out") > position("r"));
    }

    #[test]
    fn cycle_is_tagged_not_fatal() {
        let g = graph(
            &["delay", "filter"],
            &[("c1", "delay", "filter"), ("c2", "filter", "delay")],
        );
        let result = sort(&g);
        assert_eq!(2, result.order.len());
        assert_eq!(vec!["c2".to_owned()], result.feedback);
    }

    #[test]
    fn self_loops_never_reach_the_sort() {
        // Validation rejects them, but the sort must not spin either.
        let g = graph(&["a"], &[("c1", "a", "a")]);
        let result = sort(&g);
        assert_eq!(vec!["c1".to_owned()], result.feedback);
        assert_eq!(1, result.order.len());
    }
}
