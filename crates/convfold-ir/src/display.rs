//! Display implementations and text dump for debugging.

use std::fmt;

use crate::graph::{AttributeValue, Dimension, Graph, Node, ValueId};
use crate::tensor::{DataType, Tensor};

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float => write!(f, "f32"),
            Self::Uint8 => write!(f, "u8"),
            Self::Int8 => write!(f, "i8"),
            Self::Uint16 => write!(f, "u16"),
            Self::Int16 => write!(f, "i16"),
            Self::Int32 => write!(f, "i32"),
            Self::Int64 => write!(f, "i64"),
            Self::String => write!(f, "string"),
            Self::Bool => write!(f, "bool"),
            Self::Float16 => write!(f, "f16"),
            Self::Double => write!(f, "f64"),
            Self::Uint32 => write!(f, "u32"),
            Self::Uint64 => write!(f, "u64"),
            Self::BFloat16 => write!(f, "bf16"),
            Self::Other(code) => write!(f, "dtype#{code}"),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(d) => write!(f, "{d}"),
            Self::Dynamic(Some(name)) => write!(f, "{name}"),
            Self::Dynamic(None) => write!(f, "?"),
        }
    }
}

fn format_dims(dims: &[i64]) -> String {
    let parts: Vec<_> = dims.iter().map(i64::to_string).collect();
    format!("[{}]", parts.join(", "))
}

fn format_tensor(tensor: &Tensor) -> String {
    format!("{}{}", tensor.dtype, format_dims(&tensor.dims))
}

fn value_name(graph: &Graph, id: ValueId) -> String {
    graph
        .value(id)
        .map(|v| v.name.clone())
        .unwrap_or_else(|| format!("%{}", id.0))
}

fn format_attribute(value: &AttributeValue) -> String {
    match value {
        AttributeValue::Float(v) => format!("{v}"),
        AttributeValue::Int(v) => format!("{v}"),
        AttributeValue::String(s) => format!("{:?}", String::from_utf8_lossy(s)),
        AttributeValue::Tensor(t) => format_tensor(t),
        AttributeValue::Graph(g) => format!("graph '{}'", g.name),
        AttributeValue::Floats(v) => format!("{v:?}"),
        AttributeValue::Ints(v) => format!("{v:?}"),
        AttributeValue::Strings(v) => {
            let parts: Vec<_> = v.iter().map(|s| String::from_utf8_lossy(s)).collect();
            format!("{parts:?}")
        }
        AttributeValue::Tensors(ts) => {
            let parts: Vec<_> = ts.iter().map(format_tensor).collect();
            format!("[{}]", parts.join(", "))
        }
        AttributeValue::Graphs(gs) => format!("{} graphs", gs.len()),
    }
}

fn write_node(out: &mut String, graph: &Graph, node: &Node, indent: usize) {
    let pad = " ".repeat(indent);
    let inputs: Vec<_> = node
        .inputs
        .iter()
        .map(|slot| match slot {
            Some(v) => value_name(graph, *v),
            None => "_".to_string(),
        })
        .collect();
    let outputs: Vec<_> = node.outputs.iter().map(|&v| value_name(graph, v)).collect();
    let target = if node.execution_target.is_empty() {
        String::new()
    } else {
        format!(" @{}", node.execution_target)
    };
    out.push_str(&format!(
        "{pad}{:?} {} = {}({}){target}  // {}\n",
        node.id,
        outputs.join(", "),
        node.op,
        inputs.join(", "),
        node.name,
    ));

    for attr in &node.attributes {
        out.push_str(&format!(
            "{pad}    .{} = {}\n",
            attr.name,
            format_attribute(&attr.value)
        ));
        let nested: &[Graph] = match &attr.value {
            AttributeValue::Graph(g) => std::slice::from_ref(g),
            AttributeValue::Graphs(gs) => gs,
            _ => &[],
        };
        for sub in nested {
            write_graph(out, sub, indent + 8);
        }
    }
}

fn write_graph(out: &mut String, graph: &Graph, indent: usize) {
    let pad = " ".repeat(indent);
    out.push_str(&format!("{pad}graph {} {{\n", graph.name));

    if !graph.inputs.is_empty() {
        let names: Vec<_> = graph.inputs.iter().map(|&v| value_name(graph, v)).collect();
        out.push_str(&format!("{pad}  Inputs: {}\n", names.join(", ")));
    }

    if graph.initializer_count() > 0 {
        out.push_str(&format!("{pad}  Initializers:\n"));
        for tensor in graph.initializers() {
            out.push_str(&format!(
                "{pad}    {}: {}\n",
                tensor.name,
                format_tensor(tensor)
            ));
        }
    }

    if graph.node_count() > 0 {
        out.push_str(&format!("{pad}  Nodes:\n"));
        for node in graph.nodes() {
            write_node(out, graph, node, indent + 4);
        }
    }

    if !graph.outputs.is_empty() {
        let names: Vec<_> = graph.outputs.iter().map(|&v| value_name(graph, v)).collect();
        out.push_str(&format!("{pad}  Outputs: {}\n", names.join(", ")));
    }

    out.push_str(&format!("{pad}}}\n"));
}

/// Produces a human-readable text dump of a [`Graph`] for debugging.
pub fn dump_graph(graph: &Graph) -> String {
    let mut out = String::new();
    write_graph(&mut out, graph, 0);
    out
}
