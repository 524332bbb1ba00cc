//! Structural end-to-end tests: ONNX bytes → import → optimize → export.

mod common;

use std::collections::BTreeSet;

use common::{ConvMul, fold_model, initializer_values, node, op_types, tensor};
use half::f16;
use convfold_onnx::ImportOptions;
use convfold_onnx::proto::{
    AttributeProto, GraphProto, ModelProto, TensorProto, ValueInfoProto, attribute_type,
    data_type,
};
use prost::Message;

fn graph(model: &ModelProto) -> &GraphProto {
    model.graph.as_ref().expect("model has a graph")
}

#[test]
fn per_channel_mul_folds_into_conv() {
    common::init_logger();
    let params = ConvMul::default();
    let original = params.build();
    let (folded, modified) = fold_model(&original);

    assert!(modified);
    assert_eq!(op_types(&folded), vec!["Conv", "Relu"]);
    let g = graph(&folded);
    assert_eq!(g.node[1].input, vec!["conv_out"]);
    assert!(g.initializer.iter().all(|t| t.name != "S"));

    let src = graph(&original);
    let scale = initializer_values(src, "S").unwrap();
    let weight = initializer_values(src, "W").unwrap();
    let per_channel = weight.len() / scale.len();
    let expected: Vec<f32> = weight
        .iter()
        .enumerate()
        .map(|(i, w)| w * scale[i / per_channel])
        .collect();
    assert_eq!(initializer_values(g, "W").unwrap(), expected);

    let bias = initializer_values(src, "B").unwrap();
    let expected: Vec<f32> = bias.iter().zip(&scale).map(|(b, s)| b * s).collect();
    assert_eq!(initializer_values(g, "B").unwrap(), expected);
}

#[test]
fn scalar_scale_in_first_operand_without_bias() {
    let params = ConvMul {
        with_bias: false,
        scale_dims: vec![],
        scale_first: true,
        ..Default::default()
    };
    let original = params.build();
    let (folded, modified) = fold_model(&original);

    assert!(modified);
    assert_eq!(op_types(&folded), vec!["Conv", "Relu"]);
    let g = graph(&folded);
    assert_eq!(g.node[0].input, vec!["X", "W"]);

    let s = initializer_values(graph(&original), "S").unwrap()[0];
    let expected: Vec<f32> = initializer_values(graph(&original), "W")
        .unwrap()
        .iter()
        .map(|w| w * s)
        .collect();
    assert_eq!(initializer_values(g, "W").unwrap(), expected);
}

#[test]
fn mul_producing_graph_output_is_kept() {
    let mut original = ConvMul::default().build();
    let g = original.graph.as_mut().unwrap();
    g.node.pop();
    g.output = vec![ValueInfoProto::untyped("scaled")];

    let (folded, modified) = fold_model(&original);
    assert!(!modified);
    assert_eq!(op_types(&folded), vec!["Conv", "Mul"]);
    assert_eq!(
        initializer_values(graph(&folded), "W"),
        initializer_values(graph(&original), "W")
    );
}

#[test]
fn trailing_scale_dims_must_be_one() {
    // The scale varies along the width, which a Conv weight cannot absorb.
    let original = ConvMul {
        scale_dims: vec![4, 1, 2],
        input_dims: vec![1, 3, 2, 2],
        ..Default::default()
    }
    .build();
    let (folded, modified) = fold_model(&original);
    assert!(!modified);
    assert_eq!(op_types(&folded), vec!["Conv", "Mul", "Relu"]);
}

#[test]
fn old_mul_definition_is_not_folded() {
    // Opset 6 resolves Mul to its since-version 6, which carries legacy
    // broadcast semantics.
    let original = ConvMul {
        opset: 6,
        ..Default::default()
    }
    .build();
    let (folded, modified) = fold_model(&original);
    assert!(!modified);
    assert_eq!(op_types(&folded), vec!["Conv", "Mul", "Relu"]);
}

#[test]
fn execution_target_filter() {
    let bytes = ConvMul::default().build().encode_to_vec();
    let options = ImportOptions {
        execution_target: "CUDAExecutionProvider".into(),
    };

    let cpu_only = BTreeSet::from(["CPUExecutionProvider".to_string()]);
    let (_, modified) = common::fold_bytes_with(&bytes, &options, cpu_only);
    assert!(!modified);

    let cuda = BTreeSet::from(["CUDAExecutionProvider".to_string()]);
    let (out, modified) = common::fold_bytes_with(&bytes, &options, cuda);
    assert!(modified);
    let folded = ModelProto::decode(out.as_slice()).unwrap();
    assert_eq!(op_types(&folded), vec!["Conv", "Relu"]);
}

#[test]
fn shared_weight_blocks_the_fold() {
    let mut original = ConvMul::default().build();
    let g = original.graph.as_mut().unwrap();
    g.node.push(node("Conv", &["X", "W"], &["other"]));
    g.output.push(ValueInfoProto::untyped("other"));

    let (folded, modified) = fold_model(&original);
    assert!(!modified);
    assert_eq!(op_types(&folded), vec!["Conv", "Mul", "Relu", "Conv"]);
}

#[test]
fn folding_twice_is_a_no_op() {
    let (once, modified) = fold_model(&ConvMul::default().build());
    assert!(modified);
    let (twice, modified) = fold_model(&once);
    assert!(!modified);
    assert_eq!(graph(&once).node, graph(&twice).node);
    assert_eq!(
        initializer_values(graph(&once), "W"),
        initializer_values(graph(&twice), "W")
    );
}

/// `If(cond)` whose then-branch holds `Conv → Mul → Relu` over the outer `X`.
fn if_model() -> ModelProto {
    let branch = |name: &str, body: bool| {
        let out = format!("{name}_out");
        let mut g = GraphProto {
            name: name.into(),
            output: vec![ValueInfoProto::untyped(out.clone())],
            ..Default::default()
        };
        if body {
            g.node = vec![
                node("Conv", &["X", "W"], &["c"]),
                node("Mul", &["c", "S"], &["m"]),
                node("Relu", &["m"], &[out.as_str()]),
            ];
            g.initializer = vec![
                tensor("W", &[2, 1, 1, 1], vec![1.0, -2.0]),
                tensor("S", &[2, 1, 1], vec![3.0, 0.5]),
            ];
        } else {
            g.node = vec![node("Identity", &["X"], &[out.as_str()])];
        }
        g
    };
    let graph_attr = |name: &str, g: GraphProto| AttributeProto {
        name: name.into(),
        g: Some(Box::new(g)),
        r#type: attribute_type::GRAPH,
        ..Default::default()
    };

    let mut if_node = node("If", &["cond"], &["Y"]);
    if_node.attribute = vec![
        graph_attr("then_branch", branch("then", true)),
        graph_attr("else_branch", branch("else", false)),
    ];
    common::model(
        GraphProto {
            name: "main".into(),
            node: vec![if_node],
            input: vec![
                common::f32_input("X", &[1, 1, 2, 2]),
                ValueInfoProto::tensor("cond", data_type::BOOL, vec![]),
            ],
            output: vec![ValueInfoProto::untyped("Y")],
            ..Default::default()
        },
        13,
    )
}

#[test]
fn folds_inside_if_branch() {
    let (folded, modified) = fold_model(&if_model());
    assert!(modified);
    assert_eq!(op_types(&folded), vec!["If"]);

    let attrs = &graph(&folded).node[0].attribute;
    let then = attrs
        .iter()
        .find(|a| a.name == "then_branch")
        .and_then(|a| a.g.as_deref())
        .unwrap();
    let ops: Vec<_> = then.node.iter().map(|n| n.op_type.as_str()).collect();
    assert_eq!(ops, vec!["Conv", "Relu"]);
    assert_eq!(initializer_values(then, "W").unwrap(), vec![3.0, -1.0]);
    assert!(then.initializer.iter().all(|t: &TensorProto| t.name != "S"));
}

fn f16_tensor(name: &str, dims: &[i64], values: &[f32]) -> TensorProto {
    TensorProto {
        name: name.into(),
        dims: dims.to_vec(),
        data_type: data_type::FLOAT16,
        raw_data: values
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_bits().to_le_bytes())
            .collect(),
        ..Default::default()
    }
}

#[test]
fn half_precision_initializers_fold() {
    let original = common::model(
        GraphProto {
            name: "half".into(),
            node: vec![
                node("Conv", &["X", "W", "B"], &["c"]),
                node("Mul", &["c", "S"], &["m"]),
                node("Relu", &["m"], &["Y"]),
            ],
            initializer: vec![
                f16_tensor("W", &[2, 1, 1, 1], &[1.5, -2.0]),
                f16_tensor("B", &[2], &[0.25, 1.0]),
                f16_tensor("S", &[2, 1, 1], &[2.0, 0.5]),
            ],
            input: vec![ValueInfoProto::untyped("X")],
            output: vec![ValueInfoProto::untyped("Y")],
            ..Default::default()
        },
        14,
    );
    let (folded, modified) = fold_model(&original);
    assert!(modified);
    assert_eq!(op_types(&folded), vec!["Conv", "Relu"]);

    let decode = |name: &str| -> Vec<f32> {
        let t = graph(&folded).initializer.iter().find(|t| t.name == name).unwrap();
        assert_eq!(t.data_type, data_type::FLOAT16);
        t.raw_data
            .chunks_exact(2)
            .map(|b| f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
            .collect()
    };
    assert_eq!(decode("W"), vec![3.0, -1.0]);
    assert_eq!(decode("B"), vec![0.5, 0.5]);
}
