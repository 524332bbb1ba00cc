use convfold_onnx::ImportOptions;
use convfold_onnx::proto::{
    AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto,
    TensorShapeDimension, ValueInfoProto, attribute_type, data_type,
};
use prost::Message;

/// Route `log` output through the test harness.
#[allow(dead_code)]
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An f32 initializer stored in `float_data`.
#[allow(dead_code)]
pub fn tensor(name: &str, dims: &[i64], values: Vec<f32>) -> TensorProto {
    TensorProto {
        name: name.into(),
        dims: dims.to_vec(),
        data_type: data_type::FLOAT,
        float_data: values,
        ..Default::default()
    }
}

/// A default-domain node named after its first output.
#[allow(dead_code)]
pub fn node(op_type: &str, inputs: &[&str], outputs: &[&str]) -> NodeProto {
    NodeProto {
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: outputs.iter().map(|s| s.to_string()).collect(),
        name: format!("{}_{}", op_type.to_lowercase(), outputs.first().unwrap_or(&"")),
        op_type: op_type.into(),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn ints_attribute(name: &str, values: &[i64]) -> AttributeProto {
    AttributeProto {
        name: name.into(),
        ints: values.to_vec(),
        r#type: attribute_type::INTS,
        ..Default::default()
    }
}

/// A typed f32 graph input with fixed dimensions.
#[allow(dead_code)]
pub fn f32_input(name: &str, dims: &[i64]) -> ValueInfoProto {
    ValueInfoProto::tensor(
        name,
        data_type::FLOAT,
        dims.iter().map(|&d| TensorShapeDimension::fixed(d)).collect(),
    )
}

/// Wraps a graph into a model importing the default opset at `opset`.
#[allow(dead_code)]
pub fn model(graph: GraphProto, opset: i64) -> ModelProto {
    ModelProto {
        ir_version: 8,
        producer_name: "convfold-e2e".into(),
        graph: Some(graph),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: opset,
        }],
        ..Default::default()
    }
}

/// Deterministic, sign-alternating sample data.
#[allow(dead_code)]
pub fn sample(len: usize, seed: f32) -> Vec<f32> {
    (0..len)
        .map(|i| ((i as f32 + 1.0) * seed).sin() * 2.0)
        .collect()
}

/// Parameters of the `Conv → Mul → Relu` test model.
#[allow(dead_code)]
#[derive(Clone, Debug)]
pub struct ConvMul {
    /// `[N, C, H, W]` of the graph input.
    pub input_dims: Vec<i64>,
    /// `[M, C, kH, kW]` of the Conv weight.
    pub weight_dims: Vec<i64>,
    pub with_bias: bool,
    pub scale_dims: Vec<i64>,
    /// Put the scale in the Mul's first operand slot.
    pub scale_first: bool,
    pub opset: i64,
}

impl Default for ConvMul {
    fn default() -> Self {
        Self {
            input_dims: vec![1, 3, 5, 5],
            weight_dims: vec![4, 3, 3, 3],
            with_bias: true,
            scale_dims: vec![4, 1, 1],
            scale_first: false,
            opset: 13,
        }
    }
}

impl ConvMul {
    /// `X ─ Conv(W, B) ─ conv_out ─ Mul(S) ─ scaled ─ Relu ─ Y`.
    #[allow(dead_code)]
    pub fn build(&self) -> ModelProto {
        let count = |dims: &[i64]| dims.iter().product::<i64>() as usize;
        let channels = self.weight_dims[0];

        let mut conv_inputs = vec!["X", "W"];
        let mut initializer = vec![tensor(
            "W",
            &self.weight_dims,
            sample(count(&self.weight_dims), 0.7),
        )];
        if self.with_bias {
            conv_inputs.push("B");
            initializer.push(tensor("B", &[channels], sample(channels as usize, 1.3)));
        }
        initializer.push(tensor("S", &self.scale_dims, sample(count(&self.scale_dims), 0.45)));

        let spatial = self.weight_dims.len().saturating_sub(2);
        let mut conv = node("Conv", &conv_inputs, &["conv_out"]);
        conv.attribute = vec![
            ints_attribute("pads", &vec![1; 2 * spatial]),
            ints_attribute("strides", &vec![1; spatial]),
        ];
        let mul_inputs = if self.scale_first {
            ["S", "conv_out"]
        } else {
            ["conv_out", "S"]
        };

        model(
            GraphProto {
                name: "conv_mul".into(),
                node: vec![
                    conv,
                    node("Mul", &mul_inputs, &["scaled"]),
                    node("Relu", &["scaled"], &["Y"]),
                ],
                initializer,
                input: vec![f32_input("X", &self.input_dims)],
                output: vec![ValueInfoProto::untyped("Y")],
                ..Default::default()
            },
            self.opset,
        )
    }

    #[allow(dead_code)]
    pub fn input_len(&self) -> usize {
        self.input_dims.iter().product::<i64>() as usize
    }
}

/// Imports `bytes`, runs the O1 pipeline for every target and serializes the
/// result. Unreferenced initializers are dropped when something changed.
#[allow(dead_code)]
pub fn fold_bytes(bytes: &[u8]) -> (Vec<u8>, bool) {
    fold_bytes_with(bytes, &ImportOptions::default(), Default::default())
}

#[allow(dead_code)]
pub fn fold_bytes_with(
    bytes: &[u8],
    options: &ImportOptions,
    targets: std::collections::BTreeSet<String>,
) -> (Vec<u8>, bool) {
    let mut model = convfold_onnx::load_model(bytes, options).expect("import failed");
    let modified = convfold_opt::PassManager::for_level(convfold_opt::OptLevel::O1, targets)
        .run(&mut model.graph)
        .expect("optimization failed");
    if modified {
        model.graph.remove_unreferenced_initializers();
    }
    (convfold_onnx::save_model(&model), modified)
}

/// Round-trips `model` through convfold and decodes the output.
#[allow(dead_code)]
pub fn fold_model(model: &ModelProto) -> (ModelProto, bool) {
    let (bytes, modified) = fold_bytes(&model.encode_to_vec());
    let decoded = ModelProto::decode(bytes.as_slice()).expect("output is not valid protobuf");
    (decoded, modified)
}

/// Op types of the main graph, in order.
#[allow(dead_code)]
pub fn op_types(model: &ModelProto) -> Vec<String> {
    model
        .graph
        .as_ref()
        .map(|g| g.node.iter().map(|n| n.op_type.clone()).collect())
        .unwrap_or_default()
}

/// Decodes the f32 payload of the named initializer.
#[allow(dead_code)]
pub fn initializer_values(graph: &GraphProto, name: &str) -> Option<Vec<f32>> {
    let t = graph.initializer.iter().find(|t| t.name == name)?;
    if !t.float_data.is_empty() {
        return Some(t.float_data.clone());
    }
    Some(
        t.raw_data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

#[allow(dead_code)]
pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol * e.abs().max(1.0),
            "mismatch at index {i}: got {a}, expected {e}"
        );
    }
}
