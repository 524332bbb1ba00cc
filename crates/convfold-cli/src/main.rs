use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use miette::{Context, IntoDiagnostic};

use convfold_ir::Graph;
use convfold_onnx::ImportOptions;
use convfold_opt::{GraphPass, GraphValidation, OptLevel, PassManager};

/// convfold: folds constant per-channel Mul nodes into the preceding Conv
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Input ONNX model
    input: PathBuf,

    /// Output path for the optimized model
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Optimization level: 0, 1, or 2
    #[arg(long, default_value = "1", value_parser = parse_opt_level)]
    opt_level: OptLevel,

    /// Execution target the passes may rewrite (repeatable; default: all)
    #[arg(long = "target", value_name = "TARGET")]
    targets: Vec<String>,

    /// Execution target assigned to every imported node
    #[arg(long, default_value = "CPUExecutionProvider")]
    execution_target: String,

    /// Dump the optimized graph to stderr
    #[arg(long)]
    emit_graph: bool,

    /// Validate and optimize without producing output
    #[arg(long)]
    dry_run: bool,
}

fn parse_opt_level(s: &str) -> Result<OptLevel, String> {
    match s {
        "0" => Ok(OptLevel::O0),
        "1" => Ok(OptLevel::O1),
        "2" => Ok(OptLevel::O2),
        _ => Err(format!(
            "invalid optimization level '{s}', expected 0, 1, or 2"
        )),
    }
}

/// Live nodes in `graph` and every graph nested in it.
fn count_nodes(graph: &Graph) -> usize {
    graph
        .nodes()
        .map(|n| 1 + n.subgraphs().map(count_nodes).sum::<usize>())
        .sum()
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    // 1. Read and import the model.
    let bytes = std::fs::read(&cli.input)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", cli.input.display()))?;
    let options = ImportOptions {
        execution_target: cli.execution_target.clone(),
    };
    let mut model = convfold_onnx::load_model(&bytes, &options)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to import {}", cli.input.display()))?;

    // 2. Report structural problems; they do not stop the run.
    GraphValidation
        .apply(&mut model.graph, 0)
        .into_diagnostic()
        .wrap_err("graph validation failed")?;

    // 3. Optimize.
    let before = count_nodes(&model.graph);
    let targets: BTreeSet<String> = cli.targets.iter().cloned().collect();
    let modified = PassManager::for_level(cli.opt_level, targets)
        .run(&mut model.graph)
        .into_diagnostic()
        .wrap_err("optimization failed")?;
    if modified {
        let dropped = model.graph.remove_unreferenced_initializers();
        log::info!("dropped {dropped} unreferenced initializer(s)");
    }
    let after = count_nodes(&model.graph);
    eprintln!("{}: {before} nodes -> {after} nodes", cli.input.display());

    // 4. Optionally dump the graph to stderr.
    if cli.emit_graph {
        eprintln!("{}", convfold_ir::dump_graph(&model.graph));
    }

    // 5. Dry-run: stop here.
    if cli.dry_run {
        return Ok(());
    }

    // 6. Write the model.
    let path = cli.output.as_ref().ok_or_else(|| {
        miette::miette!("no --output path was specified (use --dry-run to skip writing)")
    })?;
    std::fs::write(path, convfold_onnx::save_model(&model))
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to write {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use convfold_ir::{DataType, OpKind, OpType, ValueInfo};

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::try_parse_from([
            "convfold",
            "model.onnx",
            "-o",
            "out.onnx",
            "--opt-level",
            "2",
            "--target",
            "CPUExecutionProvider",
            "--target",
            "CUDAExecutionProvider",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.opt_level, OptLevel::O2);
        assert_eq!(cli.targets.len(), 2);
        assert_eq!(cli.execution_target, "CPUExecutionProvider");
        assert!(cli.dry_run);
        assert!(!cli.emit_graph);
    }

    #[test]
    fn rejects_bad_opt_level() {
        assert!(parse_opt_level("3").is_err());
        assert!(Cli::try_parse_from(["convfold", "m.onnx", "--opt-level", "x"]).is_err());
    }

    #[test]
    fn counts_nested_nodes() {
        let mut graph = Graph::new("main");
        let cond = graph.add_value(ValueInfo::tensor("cond", DataType::Bool, &[]));
        let out = graph.add_value(ValueInfo::named("out"));
        let mut branch = Graph::new("then");
        let a = branch.add_value(ValueInfo::named("a"));
        let b = branch.add_value(ValueInfo::named("b"));
        branch.add_node(OpType::onnx(OpKind::Relu, 14), [a], vec![b], "inner");
        let id = graph.add_node(OpType::onnx(OpKind::If, 16), [cond], vec![out], "if");
        graph.node_mut(id).unwrap().attributes.push(convfold_ir::Attribute {
            name: "then_branch".into(),
            value: convfold_ir::AttributeValue::Graph(branch),
        });
        assert_eq!(count_nodes(&graph), 2);
    }
}
