//! GraphViz rendering of the recovered call graph, for debugging.

use crate::address::MetaAddress;
use crate::results::FunctionsSummary;
use crate::summary::{BranchType, FunctionType};

type Node = MetaAddress;
/// (caller entry, callee entry, edge label)
type Edge = (Node, Node, String);

struct Graph<'a> {
    summary: &'a FunctionsSummary,
}

fn get_nodes_and_edges(summary: &FunctionsSummary) -> (Vec<Node>, Vec<Edge>) {
    let nodes: Vec<Node> = summary.functions.keys().cloned().collect();

    let mut edges: Vec<Edge> = vec![];
    for function in summary.functions.values() {
        for site in &function.call_sites {
            if !site.callee.is_valid() || !summary.functions.contains_key(&site.callee) {
                continue;
            }
            let label = match function.blocks.get(&site.block) {
                Some(BranchType::FakeFunctionCall) => "fake_call",
                _ => "call",
            };
            edges.push((function.entry, site.callee, label.to_owned()));
        }
    }

    (nodes, edges)
}

impl<'a> dot::Labeller<'a, Node, Edge> for Graph<'a> {
    fn graph_id(&'a self) -> dot::Id<'a> {
        dot::Id::new("CallGraph").unwrap()
    }
    fn node_id(&'a self, n: &Node) -> dot::Id<'a> {
        dot::Id::new(format!("fn_{:#x}", n.address).replace("0x", "")).unwrap()
    }
    fn node_label<'b>(&'b self, n: &Node) -> dot::LabelText<'b> {
        let function = &self.summary.functions[n];
        dot::LabelText::label(format!("{}\n{}", function.name, function.ty.name()))
    }
    fn node_shape(&'a self, n: &Node) -> Option<dot::LabelText<'a>> {
        match self.summary.functions[n].ty {
            FunctionType::Fake => Some(dot::LabelText::label("octagon")),
            FunctionType::NoReturn => Some(dot::LabelText::label("doubleoctagon")),
            FunctionType::Regular | FunctionType::Invalid => None,
        }
    }
    fn edge_label<'b>(&'b self, e: &Edge) -> dot::LabelText<'b> {
        dot::LabelText::label(e.2.clone())
    }
}

impl<'a> dot::GraphWalk<'a, Node, Edge> for Graph<'a> {
    fn nodes(&self) -> dot::Nodes<'a, Node> {
        get_nodes_and_edges(self.summary).0.into()
    }
    fn edges(&'a self) -> dot::Edges<'a, Edge> {
        get_nodes_and_edges(self.summary).1.into()
    }
    fn source(&self, e: &Edge) -> Node {
        e.0
    }
    fn target(&self, e: &Edge) -> Node {
        e.1
    }
}

/// Generate a `.dot` file representing the recovered call graph
pub fn generate_dot(summary: &FunctionsSummary) -> String {
    let g = Graph { summary };
    let mut s: Vec<u8> = vec![];
    dot::render(&g, &mut s).unwrap();
    String::from_utf8(s).unwrap()
}
