//! Graph optimization passes for convfold.
//!
//! Provides a [`GraphPass`] trait, a [`PassManager`] with fixed-point
//! iteration, the tensor arithmetic passes rely on ([`initializer`]), and the
//! built-in passes: [`ConvMulFusion`], which folds a per-channel `Mul` into the
//! preceding `Conv`, and the read-only [`GraphValidation`].

mod conv_mul_fusion;
pub mod graph_utils;
pub mod initializer;
mod validation;

pub use conv_mul_fusion::ConvMulFusion;
pub use validation::GraphValidation;

use std::collections::BTreeSet;
use std::fmt::Debug;

use convfold_ir::{Graph, IrError, NodeId};

/// Execution target most importers assign by default.
pub const CPU_EXECUTION_TARGET: &str = "CPUExecutionProvider";

/// Errors that abort a pass invocation.
///
/// Structural mismatches are never errors; a pass skips what it cannot
/// transform. These variants report states that prior checks should have
/// made impossible.
#[derive(Debug, thiserror::Error)]
pub enum PassError {
    /// An invariant the pass relies on does not hold.
    #[error("internal error in {pass}: {message}")]
    Internal { pass: String, message: String },

    /// A node id stopped resolving while the pass was rewiring edges.
    #[error("{pass}: node {node:?} is not in the graph")]
    UnknownNode { pass: String, node: NodeId },
}

impl PassError {
    pub(crate) fn internal(pass: &str, message: impl Into<String>) -> Self {
        Self::Internal {
            pass: pass.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn from_ir(pass: &str, err: IrError) -> Self {
        match err {
            IrError::UnknownNode(node) => Self::UnknownNode {
                pass: pass.to_string(),
                node,
            },
            other => Self::internal(pass, other.to_string()),
        }
    }
}

/// An optimization pass that rewrites a graph.
pub trait GraphPass: Debug + Send + Sync {
    /// Human-readable name of the pass.
    fn name(&self) -> &str;

    /// Runs the pass on `graph`, nested `graph_level` deep (0 = main graph).
    ///
    /// Returns `true` if anything was modified.
    fn apply(&self, graph: &mut Graph, graph_level: usize) -> Result<bool, PassError>;
}

/// Optimization level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptLevel {
    /// No optimizations.
    O0,
    /// Basic optimizations (Conv→Mul folding).
    O1,
    /// Aggressive optimizations (same as O1 for now).
    O2,
}

/// Maximum number of fixed-point iterations before giving up.
const MAX_ITERATIONS: usize = 10;

/// Runs passes in sequence with fixed-point iteration.
#[derive(Debug)]
pub struct PassManager {
    passes: Vec<Box<dyn GraphPass>>,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PassManager {
    /// Creates an empty pass manager with no passes.
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Creates a pass manager with passes appropriate for the given level.
    ///
    /// `targets` is the set of execution targets the passes may rewrite;
    /// an empty set accepts every target.
    pub fn for_level(level: OptLevel, targets: BTreeSet<String>) -> Self {
        let mut pm = Self::new();
        match level {
            OptLevel::O0 => {}
            OptLevel::O1 | OptLevel::O2 => {
                pm.add_pass(Box::new(ConvMulFusion::new(targets)));
            }
        }
        pm
    }

    /// Adds a pass to the pipeline.
    pub fn add_pass(&mut self, pass: Box<dyn GraphPass>) {
        self.passes.push(pass);
    }

    /// Names of the registered passes, in run order.
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Runs all passes until a fixed point is reached or the iteration limit.
    ///
    /// Returns `true` if any pass modified the graph. The first error aborts
    /// the run; changes applied before it are kept.
    pub fn run(&self, graph: &mut Graph) -> Result<bool, PassError> {
        let mut modified = false;
        for iteration in 0..MAX_ITERATIONS {
            let mut changed = false;
            for pass in &self.passes {
                let pass_changed = pass.apply(graph, 0)?;
                if pass_changed {
                    log::debug!(
                        "{} modified graph '{}' (round {})",
                        pass.name(),
                        graph.name,
                        iteration
                    );
                }
                changed |= pass_changed;
            }
            modified |= changed;
            if !changed {
                break;
            }
        }
        Ok(modified)
    }
}

/// Convenience function: runs O1 passes on a graph for every execution target.
pub fn optimize(graph: &mut Graph) -> Result<bool, PassError> {
    PassManager::for_level(OptLevel::O1, BTreeSet::new()).run(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct CountDown(std::sync::atomic::AtomicUsize);

    impl GraphPass for CountDown {
        fn name(&self) -> &str {
            "count-down"
        }

        fn apply(&self, _graph: &mut Graph, _graph_level: usize) -> Result<bool, PassError> {
            use std::sync::atomic::Ordering;
            let left = self.0.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(false);
            }
            self.0.store(left - 1, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[derive(Debug)]
    struct Failing;

    impl GraphPass for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn apply(&self, _graph: &mut Graph, _graph_level: usize) -> Result<bool, PassError> {
            Err(PassError::internal(self.name(), "boom"))
        }
    }

    #[test]
    fn optimize_empty_graph() {
        let mut graph = Graph::new("empty");
        assert!(!optimize(&mut graph).unwrap());
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn pass_manager_o0_is_noop() {
        let pm = PassManager::for_level(OptLevel::O0, BTreeSet::new());
        assert!(pm.pass_names().is_empty());
        let mut graph = Graph::new("g");
        assert!(!pm.run(&mut graph).unwrap());
    }

    #[test]
    fn pass_manager_o1_has_fusion() {
        let pm = PassManager::for_level(OptLevel::O1, BTreeSet::new());
        assert_eq!(pm.pass_names(), vec!["conv-mul-fusion"]);
    }

    #[test]
    fn pass_manager_iterates_to_fixed_point() {
        let mut pm = PassManager::new();
        pm.add_pass(Box::new(CountDown(3.into())));
        let mut graph = Graph::new("g");
        assert!(pm.run(&mut graph).unwrap());
        // A second run starts from the fixed point.
        assert!(!pm.run(&mut graph).unwrap());
    }

    #[test]
    fn pass_manager_stops_at_iteration_limit() {
        let mut pm = PassManager::new();
        let pass = CountDown((MAX_ITERATIONS + 5).into());
        pm.add_pass(Box::new(pass));
        let mut graph = Graph::new("g");
        assert!(pm.run(&mut graph).unwrap());
    }

    #[test]
    fn pass_manager_propagates_errors() {
        let mut pm = PassManager::new();
        pm.add_pass(Box::new(Failing));
        let mut graph = Graph::new("g");
        let err = pm.run(&mut graph).unwrap_err();
        assert_eq!(err.to_string(), "internal error in failing: boom");
    }

    #[test]
    fn unknown_node_maps_to_dedicated_variant() {
        let err = PassError::from_ir("p", IrError::UnknownNode(NodeId(4)));
        assert!(matches!(err, PassError::UnknownNode { node: NodeId(4), .. }));
        let err = PassError::from_ir("p", IrError::UnknownInitializer("w".into()));
        assert!(matches!(err, PassError::Internal { .. }));
    }
}
