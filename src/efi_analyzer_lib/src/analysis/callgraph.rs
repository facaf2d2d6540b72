//! Generate call graphs out of the decoded function bodies.

use std::collections::{BTreeSet, HashMap, VecDeque};

use super::FunctionBody;
use petgraph::graph::{DiGraph, NodeIndex};

/// The call graph of a module.
///
/// The nodes are the start addresses of functions, the edge weights the addresses of the call instructions.
#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    graph: DiGraph<u64, u64>,
    nodes: HashMap<u64, NodeIndex>,
}

impl CallGraph {
    /// Generate the call graph for the given functions.
    ///
    /// Edges are direct calls and direct jumps to the start of another function (tail calls).
    /// There are no edges for indirect calls.
    pub fn new(bodies: &[FunctionBody]) -> CallGraph {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        for body in bodies {
            nodes.insert(body.start(), graph.add_node(body.start()));
        }
        for body in bodies {
            let source = nodes[&body.start()];
            for instruction in &body.instructions {
                let is_call = instruction.mnemonic.is_call();
                let is_jump = instruction.mnemonic.is_unconditional_jump();
                if !(is_call || is_jump) {
                    continue;
                }
                if let Some(target) = instruction.branch_target() {
                    if is_jump && target == body.start() {
                        continue;
                    }
                    if let Some(target_index) = nodes.get(&target) {
                        graph.add_edge(source, *target_index, instruction.address);
                    }
                }
            }
        }
        CallGraph { graph, nodes }
    }

    pub fn graph(&self) -> &DiGraph<u64, u64> {
        &self.graph
    }

    /// The functions called by the given function.
    pub fn callees(&self, function: u64) -> BTreeSet<u64> {
        self.nodes
            .get(&function)
            .map(|node| {
                self.graph
                    .neighbors(*node)
                    .map(|callee| self.graph[callee])
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All functions reachable from the roots within `max_depth` calls, including the roots themselves.
    pub fn reachable_within(&self, roots: impl IntoIterator<Item = u64>, max_depth: usize) -> BTreeSet<u64> {
        let mut reached = BTreeSet::new();
        let mut queue = VecDeque::new();
        for root in roots {
            if let Some(node) = self.nodes.get(&root) {
                if reached.insert(root) {
                    queue.push_back((*node, 0));
                }
            }
        }
        while let Some((node, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for callee in self.graph.neighbors(node) {
                if reached.insert(self.graph[callee]) {
                    queue.push_back((callee, depth + 1));
                }
            }
        }
        reached
    }
}
