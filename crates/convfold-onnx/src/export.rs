//! [`Model`] → `ModelProto` conversion.

use std::collections::HashSet;

use convfold_ir::{
    AttributeValue, Dimension, Graph, Model, Tensor, TensorData, ValueId, ValueInfo,
};
use prost::Message;

use crate::DEFAULT_IR_VERSION;
use crate::proto::{
    AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto,
    TensorShapeDimension, TensorShapeProto, TensorTypeProto, TypeProto, ValueInfoProto,
    attribute_type, type_proto,
};

/// Builds the protobuf form of `model`.
pub fn export_model(model: &Model) -> ModelProto {
    let producer_name = if model.producer_name.is_empty() {
        "convfold".to_string()
    } else {
        model.producer_name.clone()
    };
    ModelProto {
        ir_version: if model.ir_version > 0 {
            model.ir_version
        } else {
            DEFAULT_IR_VERSION
        },
        producer_name,
        producer_version: env!("CARGO_PKG_VERSION").into(),
        graph: Some(export_graph(&model.graph)),
        opset_import: model
            .opset_imports
            .iter()
            .map(|(domain, version)| OperatorSetIdProto {
                domain: domain.clone(),
                version: *version,
            })
            .collect(),
        ..Default::default()
    }
}

/// Serializes `model` to ONNX protobuf bytes.
pub fn save_model(model: &Model) -> Vec<u8> {
    export_model(model).encode_to_vec()
}

/// Builds the protobuf form of one graph and the graphs nested in it.
///
/// Nodes are written in insertion order.
pub fn export_graph(graph: &Graph) -> GraphProto {
    let name_of = |id: ValueId| graph.value(id).map(|v| v.name.clone()).unwrap_or_default();

    let node = graph
        .nodes()
        .map(|n| NodeProto {
            input: n
                .inputs
                .iter()
                .map(|slot| slot.map(name_of).unwrap_or_default())
                .collect(),
            output: n.outputs.iter().copied().map(name_of).collect(),
            name: n.name.clone(),
            op_type: n.op.kind.onnx_op_type().to_string(),
            attribute: n
                .attributes
                .iter()
                .map(|a| attribute_to_proto(&a.name, &a.value))
                .collect(),
            domain: n.op.domain.clone(),
            ..Default::default()
        })
        .collect();

    let mut listed: HashSet<ValueId> = graph.inputs.iter().chain(&graph.outputs).copied().collect();
    let mut value_info = Vec::new();
    for index in 0..graph.value_count() {
        let id = ValueId(index as u32);
        let Some(info) = graph.value(id) else {
            continue;
        };
        if info.dtype.is_none() || graph.initializer(&info.name).is_some() || !listed.insert(id) {
            continue;
        }
        value_info.push(value_info_to_proto(info));
    }

    GraphProto {
        node,
        name: graph.name.clone(),
        initializer: graph.initializers().map(tensor_to_proto).collect(),
        input: graph
            .inputs
            .iter()
            .filter_map(|&id| graph.value(id))
            .map(value_info_to_proto)
            .collect(),
        output: graph
            .outputs
            .iter()
            .filter_map(|&id| graph.value(id))
            .map(value_info_to_proto)
            .collect(),
        value_info,
        ..Default::default()
    }
}

fn value_info_to_proto(info: &ValueInfo) -> ValueInfoProto {
    let Some(dtype) = info.dtype else {
        return ValueInfoProto::untyped(info.name.clone());
    };
    let shape = info.shape.as_ref().map(|dims| TensorShapeProto {
        dim: dims
            .iter()
            .map(|d| match d {
                Dimension::Fixed(size) => TensorShapeDimension::fixed(*size),
                Dimension::Dynamic(Some(name)) => TensorShapeDimension::symbolic(name.clone()),
                Dimension::Dynamic(None) => TensorShapeDimension::unknown(),
            })
            .collect(),
    });
    ValueInfoProto {
        name: info.name.clone(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(TensorTypeProto {
                elem_type: dtype.onnx_code(),
                shape,
            })),
        }),
    }
}

fn attribute_to_proto(name: &str, value: &AttributeValue) -> AttributeProto {
    let mut attr = AttributeProto {
        name: name.to_string(),
        ..Default::default()
    };
    match value {
        AttributeValue::Float(f) => {
            attr.f = *f;
            attr.r#type = attribute_type::FLOAT;
        }
        AttributeValue::Int(i) => {
            attr.i = *i;
            attr.r#type = attribute_type::INT;
        }
        AttributeValue::String(s) => {
            attr.s = s.clone();
            attr.r#type = attribute_type::STRING;
        }
        AttributeValue::Tensor(t) => {
            attr.t = Some(tensor_to_proto(t));
            attr.r#type = attribute_type::TENSOR;
        }
        AttributeValue::Graph(g) => {
            attr.g = Some(Box::new(export_graph(g)));
            attr.r#type = attribute_type::GRAPH;
        }
        AttributeValue::Floats(v) => {
            attr.floats = v.clone();
            attr.r#type = attribute_type::FLOATS;
        }
        AttributeValue::Ints(v) => {
            attr.ints = v.clone();
            attr.r#type = attribute_type::INTS;
        }
        AttributeValue::Strings(v) => {
            attr.strings = v.clone();
            attr.r#type = attribute_type::STRINGS;
        }
        AttributeValue::Tensors(v) => {
            attr.tensors = v.iter().map(tensor_to_proto).collect();
            attr.r#type = attribute_type::TENSORS;
        }
        AttributeValue::Graphs(v) => {
            attr.graphs = v.iter().map(export_graph).collect();
            attr.r#type = attribute_type::GRAPHS;
        }
    }
    attr
}

/// Converts a tensor, always writing the payload as `raw_data`.
fn tensor_to_proto(tensor: &Tensor) -> TensorProto {
    let raw_data = match &tensor.data {
        TensorData::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        TensorData::F64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        TensorData::F16(v) => v.iter().flat_map(|x| x.to_bits().to_le_bytes()).collect(),
        TensorData::BF16(v) => v.iter().flat_map(|x| x.to_bits().to_le_bytes()).collect(),
        TensorData::I32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        TensorData::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        TensorData::Raw(bytes) => bytes.clone(),
    };
    TensorProto {
        dims: tensor.dims.clone(),
        data_type: tensor.dtype.onnx_code(),
        name: tensor.name.clone(),
        raw_data,
        ..Default::default()
    }
}
