//! `ModelProto` → [`Model`] conversion.

use convfold_ir::{
    Attribute, AttributeValue, DataType, Dimension, Graph, Model, Tensor, TensorData, ValueId,
    ValueInfo, bf16, f16,
};
use prost::Message;

use crate::OnnxError;
use crate::proto::{
    AttributeProto, GraphProto, ModelProto, TensorProto, ValueInfoProto, attribute_type,
    tensor_shape_dimension, type_proto,
};
use crate::schema::OpsetVersions;

/// `TensorProto.DataLocation.EXTERNAL`.
const EXTERNAL_DATA: i32 = 1;

/// Settings applied while importing a model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportOptions {
    /// Execution target assigned to every imported node.
    pub execution_target: String,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            execution_target: "CPUExecutionProvider".into(),
        }
    }
}

/// Decodes a serialized ONNX model and imports it.
pub fn load_model(bytes: &[u8], options: &ImportOptions) -> Result<Model, OnnxError> {
    let proto = ModelProto::decode(bytes)?;
    import_model(&proto, options)
}

/// Imports a decoded ONNX model.
pub fn import_model(proto: &ModelProto, options: &ImportOptions) -> Result<Model, OnnxError> {
    let graph = proto.graph.as_ref().ok_or(OnnxError::MissingGraph)?;
    let opset_imports: Vec<(String, i64)> = proto
        .opset_import
        .iter()
        .map(|o| (o.domain.clone(), o.version))
        .collect();
    let opsets = OpsetVersions::from_imports(
        opset_imports.iter().map(|(domain, v)| (domain.as_str(), *v)),
    );

    Ok(Model {
        graph: import_graph(graph, &opsets, options)?,
        opset_imports,
        producer_name: proto.producer_name.clone(),
        ir_version: proto.ir_version,
    })
}

/// Imports one graph, including the graphs nested in its node attributes.
///
/// Names a graph reads without defining them stay registered as plain values;
/// inside a nested graph they refer to the enclosing scope.
pub fn import_graph(
    proto: &GraphProto,
    opsets: &OpsetVersions,
    options: &ImportOptions,
) -> Result<Graph, OnnxError> {
    let mut graph = Graph::new(proto.name.clone());

    for tensor in &proto.initializer {
        if graph.initializer(&tensor.name).is_some() {
            return Err(OnnxError::Redefined(tensor.name.clone()));
        }
        graph.add_initializer(tensor_from_proto(tensor)?);
    }

    for input in proto.input.iter().filter(|vi| !vi.name.is_empty()) {
        let id = declare(&mut graph, input);
        if graph.is_graph_input(id) {
            return Err(OnnxError::Redefined(input.name.clone()));
        }
        graph.inputs.push(id);
    }

    for info in &proto.value_info {
        declare(&mut graph, info);
    }

    for (index, node) in proto.node.iter().enumerate() {
        let node_name = if node.name.is_empty() {
            format!("{}_{index}", node.op_type)
        } else {
            node.name.clone()
        };
        let op = opsets.resolve(&node.op_type, &node.domain)?;

        let inputs: Vec<Option<ValueId>> = node
            .input
            .iter()
            .map(|name| (!name.is_empty()).then(|| graph.intern_value(name)))
            .collect();

        // Trailing omitted outputs are the same as absent ones.
        let declared = node
            .output
            .iter()
            .rposition(|name| !name.is_empty())
            .map_or(0, |last| last + 1);
        let mut outputs: Vec<ValueId> = Vec::with_capacity(declared);
        for name in &node.output[..declared] {
            if name.is_empty() {
                return Err(OnnxError::InvalidNode {
                    node: node_name,
                    message: "omitted outputs before the last output are not supported".into(),
                });
            }
            let id = graph.intern_value(name);
            if graph.producer(id).is_some()
                || outputs.contains(&id)
                || graph.is_graph_input(id)
                || graph.initializer(name).is_some()
            {
                return Err(OnnxError::Redefined(name.clone()));
            }
            outputs.push(id);
        }

        let attributes = node
            .attribute
            .iter()
            .map(|attr| {
                Ok(Attribute {
                    name: attr.name.clone(),
                    value: attribute_from_proto(attr, opsets, options)?,
                })
            })
            .collect::<Result<Vec<_>, OnnxError>>()
            .map_err(|e| match e {
                OnnxError::Unsupported(message) => OnnxError::InvalidNode {
                    node: node_name.clone(),
                    message,
                },
                other => other,
            })?;

        let id = graph.add_node(op, inputs, outputs, node_name);
        if let Some(added) = graph.node_mut(id) {
            added.attributes = attributes;
            added.execution_target = options.execution_target.clone();
        }
    }

    for output in proto.output.iter().filter(|vi| !vi.name.is_empty()) {
        let id = declare(&mut graph, output);
        graph.outputs.push(id);
    }

    Ok(graph)
}

/// Registers the value `proto` describes, filling in type information the
/// graph does not know yet.
fn declare(graph: &mut Graph, proto: &ValueInfoProto) -> ValueId {
    let id = graph.intern_value(&proto.name);
    let declared = value_info_from_proto(proto);
    if let Some(info) = graph.value_mut(id) {
        if info.dtype.is_none() {
            info.dtype = declared.dtype;
        }
        if info.shape.is_none() {
            info.shape = declared.shape;
        }
    }
    id
}

fn value_info_from_proto(proto: &ValueInfoProto) -> ValueInfo {
    let mut info = ValueInfo::named(proto.name.clone());
    let Some(type_proto::Value::TensorType(tensor)) =
        proto.r#type.as_ref().and_then(|t| t.value.as_ref())
    else {
        return info;
    };

    info.dtype = (tensor.elem_type != 0).then(|| DataType::from_onnx(tensor.elem_type));
    info.shape = tensor.shape.as_ref().map(|shape| {
        shape
            .dim
            .iter()
            .map(|d| match &d.value {
                Some(tensor_shape_dimension::Value::DimValue(v)) => Dimension::Fixed(*v),
                Some(tensor_shape_dimension::Value::DimParam(p)) => {
                    Dimension::Dynamic(Some(p.clone()))
                }
                None => Dimension::Dynamic(None),
            })
            .collect()
    });
    info
}

fn attribute_from_proto(
    attr: &AttributeProto,
    opsets: &OpsetVersions,
    options: &ImportOptions,
) -> Result<AttributeValue, OnnxError> {
    let kind = if attr.r#type != 0 {
        attr.r#type
    } else {
        infer_attribute_type(attr)
    };

    let value = match kind {
        attribute_type::FLOAT => AttributeValue::Float(attr.f),
        attribute_type::INT => AttributeValue::Int(attr.i),
        attribute_type::STRING => AttributeValue::String(attr.s.clone()),
        attribute_type::TENSOR => {
            let tensor = attr.t.as_ref().ok_or_else(|| {
                OnnxError::Unsupported(format!("tensor attribute '{}' is empty", attr.name))
            })?;
            AttributeValue::Tensor(tensor_from_proto(tensor)?)
        }
        attribute_type::GRAPH => {
            let body = attr.g.as_deref().ok_or_else(|| {
                OnnxError::Unsupported(format!("graph attribute '{}' is empty", attr.name))
            })?;
            AttributeValue::Graph(import_graph(body, opsets, options)?)
        }
        attribute_type::FLOATS => AttributeValue::Floats(attr.floats.clone()),
        attribute_type::INTS => AttributeValue::Ints(attr.ints.clone()),
        attribute_type::STRINGS => AttributeValue::Strings(attr.strings.clone()),
        attribute_type::TENSORS => AttributeValue::Tensors(
            attr.tensors
                .iter()
                .map(tensor_from_proto)
                .collect::<Result<_, _>>()?,
        ),
        attribute_type::GRAPHS => AttributeValue::Graphs(
            attr.graphs
                .iter()
                .map(|g| import_graph(g, opsets, options))
                .collect::<Result<_, _>>()?,
        ),
        other => {
            return Err(OnnxError::Unsupported(format!(
                "attribute '{}' has type {other}",
                attr.name
            )));
        }
    };
    Ok(value)
}

/// Picks the payload of an attribute written without a `type` field.
fn infer_attribute_type(attr: &AttributeProto) -> i32 {
    if attr.g.is_some() {
        attribute_type::GRAPH
    } else if attr.t.is_some() {
        attribute_type::TENSOR
    } else if !attr.graphs.is_empty() {
        attribute_type::GRAPHS
    } else if !attr.tensors.is_empty() {
        attribute_type::TENSORS
    } else if !attr.strings.is_empty() {
        attribute_type::STRINGS
    } else if !attr.ints.is_empty() {
        attribute_type::INTS
    } else if !attr.floats.is_empty() {
        attribute_type::FLOATS
    } else if !attr.s.is_empty() {
        attribute_type::STRING
    } else if attr.f != 0.0 {
        attribute_type::FLOAT
    } else {
        attribute_type::INT
    }
}

/// Converts a `TensorProto`.
///
/// A buffer that does not fit the declared element type is kept as raw bytes
/// so that [`Tensor::validate`] reports it.
pub(crate) fn tensor_from_proto(proto: &TensorProto) -> Result<Tensor, OnnxError> {
    if proto.data_location == EXTERNAL_DATA {
        return Err(OnnxError::Unsupported(format!(
            "tensor '{}' stores its data externally",
            proto.name
        )));
    }

    let dtype = DataType::from_onnx(proto.data_type);
    let raw = &proto.raw_data;
    if let Some(width) = dtype.byte_width()
        && raw.len() % width != 0
    {
        log::warn!("tensor '{}': {} raw bytes do not fit {dtype}", proto.name, raw.len());
        return Ok(Tensor::from_raw(proto.name.clone(), dtype, proto.dims.clone(), raw.clone()));
    }

    let data = match dtype {
        DataType::Float if !raw.is_empty() => TensorData::F32(decode_le(raw, f32::from_le_bytes)),
        DataType::Float => TensorData::F32(proto.float_data.clone()),
        DataType::Double if !raw.is_empty() => {
            TensorData::F64(decode_le(raw, f64::from_le_bytes))
        }
        DataType::Double => TensorData::F64(proto.double_data.clone()),
        DataType::Float16 if !raw.is_empty() => {
            TensorData::F16(decode_le(raw, |b: [u8; 2]| f16::from_bits(u16::from_le_bytes(b))))
        }
        DataType::Float16 => TensorData::F16(
            proto.int32_data.iter().map(|&v| f16::from_bits(v as u16)).collect(),
        ),
        DataType::BFloat16 if !raw.is_empty() => {
            TensorData::BF16(decode_le(raw, |b: [u8; 2]| bf16::from_bits(u16::from_le_bytes(b))))
        }
        DataType::BFloat16 => TensorData::BF16(
            proto.int32_data.iter().map(|&v| bf16::from_bits(v as u16)).collect(),
        ),
        DataType::Int32 if !raw.is_empty() => TensorData::I32(decode_le(raw, i32::from_le_bytes)),
        DataType::Int32 => TensorData::I32(proto.int32_data.clone()),
        DataType::Int64 if !raw.is_empty() => TensorData::I64(decode_le(raw, i64::from_le_bytes)),
        DataType::Int64 => TensorData::I64(proto.int64_data.clone()),
        DataType::String => {
            return Err(OnnxError::Unsupported(format!(
                "string tensor '{}'",
                proto.name
            )));
        }
        _ if !raw.is_empty() => TensorData::Raw(raw.clone()),
        other => TensorData::Raw(pack_integers(proto, other)),
    };

    Ok(Tensor {
        name: proto.name.clone(),
        dtype,
        dims: proto.dims.clone(),
        data,
    })
}

fn decode_le<const N: usize, T>(raw: &[u8], from: impl Fn([u8; N]) -> T) -> Vec<T> {
    raw.chunks_exact(N)
        .filter_map(|chunk| <[u8; N]>::try_from(chunk).ok())
        .map(from)
        .collect()
}

/// Packs integer and bool elements stored in the typed repeated fields into
/// little-endian bytes: one `int32_data` entry per element up to 16 bits,
/// `uint64_data` for the unsigned 32 and 64 bit types.
fn pack_integers(proto: &TensorProto, dtype: DataType) -> Vec<u8> {
    match dtype.byte_width() {
        Some(width @ (1 | 2)) => proto
            .int32_data
            .iter()
            .flat_map(|v| v.to_le_bytes().into_iter().take(width))
            .collect(),
        Some(width @ (4 | 8)) => proto
            .uint64_data
            .iter()
            .flat_map(|v| v.to_le_bytes().into_iter().take(width))
            .collect(),
        _ => Vec::new(),
    }
}
