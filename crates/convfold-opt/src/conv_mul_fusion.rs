//! Conv + Mul folding pass.
//!
//! Folds a `Mul` by a constant into the `Conv` that feeds it:
//!
//! ```text
//! X ─ Conv(W, B) ─ Mul(S) ─ Y    =>    X ─ Conv(W·S, B·S) ─ Y
//! ```
//!
//! `S` is a scalar or holds one factor per output channel, shaped
//! `[C, 1, .., 1]` with one dimension less than `W`. The weight and bias
//! initializers are rewritten in place under their original names, the
//! readers of the `Mul` output are pointed at the `Conv` output, and the `Mul`
//! is removed once the whole graph has been scanned.

use std::collections::BTreeSet;

use convfold_ir::{Graph, Node, NodeId, OpKind, OpType, Tensor, ValueId};

use crate::graph_utils::{
    has_other_readers, is_supported_execution_target, replace_consumer_inputs, unique_consumer,
};
use crate::initializer::{self, AlgebraError};
use crate::{GraphPass, PassError};

const PASS_NAME: &str = "conv-mul-fusion";

/// Folds a per-channel constant `Mul` into the preceding `Conv`.
#[derive(Debug, Default)]
pub struct ConvMulFusion {
    compatible_targets: BTreeSet<String>,
}

impl ConvMulFusion {
    /// Creates the pass for nodes assigned to one of `compatible_targets`.
    /// An empty set makes every execution target eligible.
    pub fn new(compatible_targets: BTreeSet<String>) -> Self {
        Self { compatible_targets }
    }

    pub fn compatible_targets(&self) -> &BTreeSet<String> {
        &self.compatible_targets
    }

    /// Folds the pair rooted at `id`, if there is one. Returns the `Mul` to
    /// remove once the scan is over.
    fn try_fold(
        &self,
        graph: &mut Graph,
        id: NodeId,
        graph_level: usize,
    ) -> Result<Option<NodeId>, PassError> {
        let Some(node) = graph.node(id) else {
            return Ok(None);
        };
        if !matches!(role(&node.op), Some(Role::Producer)) {
            return Ok(None);
        }

        let pair = match match_pair(graph, node, &self.compatible_targets) {
            Ok(pair) => pair,
            Err(reason) => {
                log::trace!("{PASS_NAME}: skipping Conv '{}': {reason}", node.name);
                return Ok(None);
            }
        };
        let candidate = match validate(graph, &pair, graph_level)? {
            Verdict::Fuse(candidate) => candidate,
            Verdict::Skip(reason) => {
                log::trace!("{PASS_NAME}: skipping Conv '{}': {reason}", node.name);
                return Ok(None);
            }
        };

        let (weight, bias) = fold_initializers(&candidate)
            .map_err(|e| PassError::internal(PASS_NAME, e.to_string()))?;
        log::debug!(
            "{PASS_NAME}: folding Mul '{}' into Conv '{}' (graph '{}', level {})",
            candidate.mul.name,
            candidate.conv.name,
            graph.name,
            graph_level
        );

        graph
            .replace_initializer(weight)
            .map_err(|e| PassError::from_ir(PASS_NAME, e))?;
        if let Some(bias) = bias {
            graph
                .replace_initializer(bias)
                .map_err(|e| PassError::from_ir(PASS_NAME, e))?;
        }
        replace_consumer_inputs(graph, pair.mul_out, pair.conv_out)
            .map_err(|e| PassError::from_ir(PASS_NAME, e))?;

        Ok(Some(pair.mul))
    }
}

impl GraphPass for ConvMulFusion {
    fn name(&self) -> &str {
        PASS_NAME
    }

    fn apply(&self, graph: &mut Graph, graph_level: usize) -> Result<bool, PassError> {
        let mut modified = false;
        let mut removed = Vec::new();

        for id in graph.node_ids() {
            if let Some(node) = graph.node_mut(id) {
                for subgraph in node.subgraphs_mut() {
                    modified |= self.apply(subgraph, graph_level + 1)?;
                }
            }
            if let Some(mul) = self.try_fold(graph, id, graph_level)? {
                removed.push(mul);
            }
        }

        for &id in &removed {
            graph
                .remove_node(id)
                .map_err(|e| PassError::from_ir(PASS_NAME, e))?;
        }

        Ok(modified || !removed.is_empty())
    }
}

/// Part a node may play in the pattern.
enum Role {
    Producer,
    Scale,
}

fn role(op: &OpType) -> Option<Role> {
    if !op.is_onnx_domain() {
        return None;
    }
    match (&op.kind, op.since_version) {
        (OpKind::Conv, 1 | 11) => Some(Role::Producer),
        (OpKind::Mul, 7 | 13 | 14) => Some(Role::Scale),
        _ => None,
    }
}

/// A structurally eligible `Conv` → `Mul` edge.
#[derive(Debug)]
struct MatchedPair {
    conv: NodeId,
    mul: NodeId,
    conv_out: ValueId,
    mul_out: ValueId,
    /// The `Mul` operand that is not the `Conv` output.
    scale: ValueId,
}

fn match_pair(
    graph: &Graph,
    conv: &Node,
    targets: &BTreeSet<String>,
) -> Result<MatchedPair, &'static str> {
    if !is_supported_execution_target(conv, targets) {
        return Err("execution target is not compatible");
    }
    let &[conv_out] = conv.outputs.as_slice() else {
        return Err("Conv does not have exactly one output");
    };
    if graph.produces_graph_output(conv.id) {
        return Err("Conv output is a graph output");
    }
    let mul = unique_consumer(graph, conv.id)
        .and_then(|id| graph.node(id))
        .ok_or("Conv output does not have exactly one reader")?;

    if !matches!(role(&mul.op), Some(Role::Scale)) {
        return Err("consumer is not a supported Mul");
    }
    if graph.input_edge_count(mul.id) != 1 {
        return Err("Mul has more than one computed input");
    }
    if graph.produces_graph_output(mul.id) {
        return Err("Mul output is a graph output");
    }
    if mul.execution_target != conv.execution_target {
        return Err("Mul runs on a different execution target");
    }

    let scale = match mul.inputs.as_slice() {
        &[Some(lhs), Some(rhs)] if lhs == conv_out => rhs,
        &[Some(lhs), Some(rhs)] if rhs == conv_out => lhs,
        _ => return Err("Mul operands do not include the Conv output"),
    };
    let &[mul_out] = mul.outputs.as_slice() else {
        return Err("Mul does not have exactly one output");
    };
    if !graph.implicit_consumers(mul_out).is_empty() {
        return Err("Mul output is captured by a nested graph");
    }

    Ok(MatchedPair {
        conv: conv.id,
        mul: mul.id,
        conv_out,
        mul_out,
        scale,
    })
}

/// A pair whose constants have been checked and may be folded.
#[derive(Debug)]
struct FusionCandidate<'g> {
    conv: &'g Node,
    mul: &'g Node,
    weight: &'g Tensor,
    bias: Option<&'g Tensor>,
    scale: &'g Tensor,
}

enum Verdict<'g> {
    Fuse(FusionCandidate<'g>),
    Skip(&'static str),
}

/// Checks that the constants of `pair` can be folded without changing the
/// result of the graph.
///
/// A bias slot that names a value nothing in the main graph defines is an
/// error. Inside a nested graph such a value may come from an enclosing
/// scope, so the pair is skipped instead.
fn validate<'g>(
    graph: &'g Graph,
    pair: &MatchedPair,
    graph_level: usize,
) -> Result<Verdict<'g>, PassError> {
    let lookup = move |id: NodeId| {
        graph.node(id).ok_or_else(|| PassError::UnknownNode {
            pass: PASS_NAME.to_string(),
            node: id,
        })
    };
    // Initializers that are also graph inputs can be fed at run time.
    let constant = move |id: ValueId| {
        graph
            .initializer_for(id)
            .filter(|_| !graph.is_graph_input(id))
    };
    let conv = lookup(pair.conv)?;
    let mul = lookup(pair.mul)?;

    let Some(weight_id) = conv.input(1) else {
        return Ok(Verdict::Skip("Conv has no weight"));
    };
    let Some(weight) = constant(weight_id) else {
        return Ok(Verdict::Skip("weight is not a constant of this graph"));
    };
    let Some(scale) = constant(pair.scale) else {
        return Ok(Verdict::Skip("scale is not a constant of this graph"));
    };
    if has_other_readers(graph, weight_id, conv.id) {
        return Ok(Verdict::Skip("weight is shared with another node"));
    }

    if !is_foldable(weight) || !is_foldable(scale) || weight.dtype != scale.dtype {
        return Ok(Verdict::Skip("weight and scale data types differ or are unsupported"));
    }
    if weight.rank() < 4 {
        return Ok(Verdict::Skip("weight rank is below 4"));
    }
    if scale.rank() != 0
        && (scale.rank() != weight.rank() - 1 || scale.dims[0] != weight.dims[0])
    {
        return Ok(Verdict::Skip("scale does not match the output channels"));
    }
    if scale.dims.iter().skip(1).any(|&d| d != 1) {
        return Ok(Verdict::Skip("scale varies along a non-channel axis"));
    }
    if weight.validate().is_err() || scale.validate().is_err() {
        return Ok(Verdict::Skip("constant data does not match its shape"));
    }

    let bias = match conv.input(2) {
        None => None,
        Some(bias_id) if bias_id == weight_id => {
            return Ok(Verdict::Skip("bias and weight are the same value"));
        }
        Some(bias_id) => match constant(bias_id) {
            Some(bias) => {
                if has_other_readers(graph, bias_id, conv.id) {
                    return Ok(Verdict::Skip("bias is shared with another node"));
                }
                if !is_foldable(bias)
                    || bias.dtype != scale.dtype
                    || bias.rank() != 1
                    || (scale.rank() != 0 && bias.dims[0] != scale.dims[0])
                    || bias.validate().is_err()
                {
                    return Ok(Verdict::Skip("bias does not match the scale"));
                }
                Some(bias)
            }
            None if graph.producer(bias_id).is_some() || graph.is_graph_input(bias_id) => {
                return Ok(Verdict::Skip("bias is computed at run time"));
            }
            None if graph_level > 0 => {
                return Ok(Verdict::Skip("bias comes from an enclosing graph"));
            }
            None => {
                let name = graph.value(bias_id).map_or("<unknown>", |v| v.name.as_str());
                return Err(PassError::internal(
                    PASS_NAME,
                    format!("bias '{name}' of Conv '{}' is not defined in the graph", conv.name),
                ));
            }
        },
    };

    Ok(Verdict::Fuse(FusionCandidate {
        conv,
        mul,
        weight,
        bias,
        scale,
    }))
}

/// Computes the scaled weight and bias without touching the graph.
/// Float element type stored in its typed buffer, not as raw bytes.
fn is_foldable(tensor: &Tensor) -> bool {
    initializer::is_supported_data_type(tensor.dtype)
        && tensor.data.data_type() == Some(tensor.dtype)
}

fn fold_initializers(
    candidate: &FusionCandidate<'_>,
) -> Result<(Tensor, Option<Tensor>), AlgebraError> {
    let scale = candidate.scale;
    let weight = initializer::scale_along_axis(candidate.weight, scale, 0)?;
    let bias = candidate
        .bias
        .map(|bias| {
            if scale.rank() == 0 {
                initializer::multiply(bias, scale)
            } else {
                initializer::scale_along_axis(bias, scale, 0)
            }
        })
        .transpose()?;
    Ok((weight, bias))
}
