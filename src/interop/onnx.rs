//! ONNX protobuf import into a [`Session`] graph.
//!
//! The importer re-lays out the channels-first ONNX graph to NHWC as it goes:
//! rank-4 graph inputs `[N, C, H, W]` become placeholders `[1, H, W, C]`, conv
//! weights `[O, I, kh, kw]` become `[kh, kw, I, O]` and every activation stays
//! channels-last. Initializers become variables whose initializer is the
//! stored value.

use std::collections::HashMap;

use prost::Message;
use tract_onnx::pb;
use tracing::debug;

use crate::interop::InteropError;
use crate::ir::{Conv2DSpec, Op, Padding, PoolSpec, Tensor, ValueId};
use crate::session::{Initializer, Session, VariableOrigin};

const ONNX_FLOAT: i32 = pb::tensor_proto::DataType::Float as i32;

#[derive(Debug, Clone, Default)]
pub struct OnnxImport {
    pub graph_name: String,
    /// ONNX value name to session value, for every imported value.
    pub values: HashMap<String, ValueId>,
    pub variable_count: usize,
}

impl OnnxImport {
    #[must_use]
    pub fn value(&self, name: &str) -> Option<ValueId> {
        self.values.get(name).copied()
    }
}

pub fn import_onnx_bytes(
    session: &mut Session,
    bytes: &[u8],
    origin: VariableOrigin,
) -> Result<OnnxImport, InteropError> {
    let model = pb::ModelProto::decode(bytes)?;
    import_onnx_model(session, &model, origin)
}

pub fn import_onnx_model(
    session: &mut Session,
    model: &pb::ModelProto,
    origin: VariableOrigin,
) -> Result<OnnxImport, InteropError> {
    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| InteropError::malformed("ONNX model has no graph"))?;

    let mut importer = Importer {
        session,
        origin,
        initializers: graph
            .initializer
            .iter()
            .map(|tensor| (tensor.name.as_str(), tensor))
            .collect(),
        values: HashMap::new(),
        conv_weights: Vec::new(),
        variable_count: 0,
    };

    for input in &graph.input {
        if importer.initializers.contains_key(input.name.as_str()) {
            continue;
        }
        importer.declare_input(input)?;
    }
    for node in &graph.node {
        importer.import_node(node)?;
    }
    for output in &graph.output {
        if !importer.values.contains_key(&output.name) {
            return Err(InteropError::malformed(format!(
                "graph output '{}' is not produced by any node",
                output.name
            )));
        }
    }

    debug!(
        graph = %graph.name,
        nodes = graph.node.len(),
        variables = importer.variable_count,
        "imported ONNX graph"
    );
    Ok(OnnxImport {
        graph_name: graph.name.clone(),
        values: importer.values,
        variable_count: importer.variable_count,
    })
}

struct Importer<'a> {
    session: &'a mut Session,
    origin: VariableOrigin,
    initializers: HashMap<&'a str, &'a pb::TensorProto>,
    values: HashMap<String, ValueId>,
    /// Initializers already materialized in conv-weight layout.
    conv_weights: Vec<String>,
    variable_count: usize,
}

impl Importer<'_> {
    fn declare_input(&mut self, input: &pb::ValueInfoProto) -> Result<(), InteropError> {
        let Some(pb::type_proto::Value::TensorType(tensor_type)) =
            input.r#type.as_ref().and_then(|ty| ty.value.as_ref())
        else {
            return Err(InteropError::unsupported(format!(
                "graph input '{}' is not a tensor",
                input.name
            )));
        };
        if tensor_type.elem_type != ONNX_FLOAT {
            return Err(InteropError::unsupported(format!(
                "graph input '{}' has element type {}, only float32 is supported",
                input.name, tensor_type.elem_type
            )));
        }
        let dims = tensor_type
            .shape
            .as_ref()
            .map(|shape| shape.dim.as_slice())
            .unwrap_or_default();

        let shape = match dims {
            [] => Vec::new(),
            [single] if matches!(dim_value(single), None | Some(1)) => Vec::new(),
            [_, c, h, w] => {
                let fixed = |dim: &pb::tensor_shape_proto::Dimension, axis: &str| {
                    dim_value(dim).filter(|v| *v > 0).ok_or_else(|| {
                        InteropError::unsupported(format!(
                            "graph input '{}' needs a fixed {axis} dimension",
                            input.name
                        ))
                    })
                };
                vec![1, fixed(h, "height")?, fixed(w, "width")?, fixed(c, "channel")?]
            }
            other => {
                return Err(InteropError::unsupported(format!(
                    "graph input '{}' has rank {}, expected a scalar or an NCHW image",
                    input.name,
                    other.len()
                )));
            }
        };

        let value = self.session.placeholder(&input.name, shape)?;
        self.values.insert(input.name.clone(), value);
        Ok(())
    }

    fn import_node(&mut self, node: &pb::NodeProto) -> Result<(), InteropError> {
        let label = if node.name.is_empty() {
            node.op_type.clone()
        } else {
            format!("{} '{}'", node.op_type, node.name)
        };

        let output = match node.op_type.as_str() {
            "Conv" => Some(self.import_conv(node, &label)?),
            "Relu" => {
                let x = self.operand(node, 0, &label)?;
                Some(self.session.add(Op::Relu(x))?)
            }
            "MaxPool" => Some(self.import_max_pool(node, &label)?),
            "Dropout" => {
                let x = self.operand(node, 0, &label)?;
                match node.input.get(1).filter(|name| !name.is_empty()) {
                    None => {
                        self.alias(node, x, &label)?;
                        None
                    }
                    Some(ratio) => Some(self.import_dropout(node, x, ratio, &label)?),
                }
            }
            "Identity" => {
                let x = self.operand(node, 0, &label)?;
                self.alias(node, x, &label)?;
                None
            }
            "Add" => {
                let a = self.operand(node, 0, &label)?;
                let b = self.operand(node, 1, &label)?;
                Some(self.session.add(Op::Add(a, b))?)
            }
            other => {
                return Err(InteropError::unsupported(format!(
                    "ONNX op '{other}' is not supported ({label})"
                )));
            }
        };

        if let Some(value) = output {
            let name = primary_output(node, &label)?;
            self.session.set_name(name, value)?;
            self.values.insert(name.to_string(), value);
        }
        Ok(())
    }

    fn import_conv(&mut self, node: &pb::NodeProto, label: &str) -> Result<ValueId, InteropError> {
        if int_attr(node, "group").unwrap_or(1) != 1 {
            return Err(InteropError::unsupported(format!(
                "{label}: grouped convolution is not supported"
            )));
        }
        ensure_unit_dilations(node, label)?;

        let x = self.operand(node, 0, label)?;
        let weight_name = node
            .input
            .get(1)
            .ok_or_else(|| InteropError::malformed(format!("{label}: missing weight operand")))?;
        let kernel = self.conv_weight(weight_name, label)?;
        let kernel_hw = match self.session.shape(kernel) {
            Some([kh, kw, _, _]) => [*kh, *kw],
            other => {
                return Err(InteropError::malformed(format!(
                    "{label}: weight has shape {other:?}, expected rank 4"
                )));
            }
        };
        if let Some(declared) = ints_attr(node, "kernel_shape") {
            let declared = to_pair(&declared, "kernel_shape", label)?;
            if declared != kernel_hw {
                return Err(InteropError::malformed(format!(
                    "{label}: kernel_shape {declared:?} disagrees with weight {kernel_hw:?}"
                )));
            }
        }
        let spec = Conv2DSpec {
            strides: strides(node, label)?,
            padding: padding(node, label)?,
        };

        let mut y = self.session.add(Op::Conv2D {
            input: x,
            kernel,
            spec,
        })?;
        if node.input.get(2).is_some_and(|name| !name.is_empty()) {
            let bias = self.operand(node, 2, label)?;
            y = self.session.add(Op::BiasAdd { input: y, bias })?;
        }
        Ok(y)
    }

    fn import_max_pool(
        &mut self,
        node: &pb::NodeProto,
        label: &str,
    ) -> Result<ValueId, InteropError> {
        if int_attr(node, "ceil_mode").unwrap_or(0) != 0
            || int_attr(node, "storage_order").unwrap_or(0) != 0
        {
            return Err(InteropError::unsupported(format!(
                "{label}: ceil_mode and storage_order must be 0"
            )));
        }
        ensure_unit_dilations(node, label)?;
        let window = ints_attr(node, "kernel_shape")
            .ok_or_else(|| InteropError::malformed(format!("{label}: missing kernel_shape")))?;
        let spec = PoolSpec {
            window: to_pair(&window, "kernel_shape", label)?,
            strides: strides(node, label)?,
            padding: padding(node, label)?,
        };
        let x = self.operand(node, 0, label)?;
        Ok(self.session.add(Op::MaxPool { input: x, spec })?)
    }

    /// The ratio operand must be a scalar placeholder; its fed value is read
    /// as the probability of keeping an element. ONNX defines `ratio` as the
    /// drop probability; this importer inverts that reading because
    /// exported VGG graphs route their `keep_prob` input into that slot and
    /// feeding `1.0` disables dropout.
    fn import_dropout(
        &mut self,
        node: &pb::NodeProto,
        x: ValueId,
        ratio: &str,
        label: &str,
    ) -> Result<ValueId, InteropError> {
        if node.input.get(2).is_some_and(|name| !name.is_empty()) {
            return Err(InteropError::unsupported(format!(
                "{label}: training_mode operand is not supported"
            )));
        }
        let keep_prob = self.operand(node, 1, label)?;
        let is_placeholder = matches!(
            self.session.graph().producer(keep_prob).map(|n| &n.op),
            Some(Op::Input(_))
        );
        if !is_placeholder || self.session.shape(keep_prob) != Some(&[][..]) {
            return Err(InteropError::unsupported(format!(
                "{label}: ratio operand '{ratio}' must be a scalar graph input"
            )));
        }
        let mask_key = self.session.graph().value_count();
        Ok(self.session.add(Op::Dropout {
            input: x,
            keep_prob,
            mask_key,
        })?)
    }

    fn alias(
        &mut self,
        node: &pb::NodeProto,
        value: ValueId,
        label: &str,
    ) -> Result<(), InteropError> {
        let name = primary_output(node, label)?;
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    fn operand(
        &mut self,
        node: &pb::NodeProto,
        index: usize,
        label: &str,
    ) -> Result<ValueId, InteropError> {
        let name = node
            .input
            .get(index)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| InteropError::malformed(format!("{label}: missing operand {index}")))?;
        if let Some(value) = self.values.get(name) {
            return Ok(*value);
        }
        let Some(tensor) = self.initializers.get(name.as_str()).copied() else {
            return Err(InteropError::malformed(format!(
                "{label}: operand '{name}' is not defined before use"
            )));
        };
        let value = self.restore(name, tensor_from_proto(tensor)?)?;
        self.values.insert(name.clone(), value);
        Ok(value)
    }

    fn conv_weight(&mut self, name: &str, label: &str) -> Result<ValueId, InteropError> {
        if self.conv_weights.iter().any(|known| known == name) {
            return self
                .values
                .get(name)
                .copied()
                .ok_or_else(|| InteropError::malformed(format!("{label}: lost weight '{name}'")));
        }
        if self.values.contains_key(name) {
            return Err(InteropError::unsupported(format!(
                "{label}: weight '{name}' is also used as a plain tensor"
            )));
        }
        let tensor = self
            .initializers
            .get(name)
            .copied()
            .ok_or_else(|| {
                InteropError::unsupported(format!(
                    "{label}: weight '{name}' must be an initializer"
                ))
            })?;
        let value = self.restore(name, oihw_to_hwio(tensor_from_proto(tensor)?, label)?)?;
        self.values.insert(name.to_string(), value);
        self.conv_weights.push(name.to_string());
        Ok(value)
    }

    fn restore(&mut self, name: &str, tensor: Tensor) -> Result<ValueId, InteropError> {
        let shape = tensor.shape.clone();
        let value = self
            .session
            .variable(name, shape, Initializer::Value(tensor), self.origin)?;
        self.variable_count += 1;
        Ok(value)
    }
}

fn primary_output<'n>(node: &'n pb::NodeProto, label: &str) -> Result<&'n str, InteropError> {
    node.output
        .first()
        .map(String::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| InteropError::malformed(format!("{label}: node has no output")))
}

fn dim_value(dim: &pb::tensor_shape_proto::Dimension) -> Option<usize> {
    match dim.value {
        Some(pb::tensor_shape_proto::dimension::Value::DimValue(v)) => usize::try_from(v).ok(),
        _ => None,
    }
}

fn attribute<'n>(node: &'n pb::NodeProto, name: &str) -> Option<&'n pb::AttributeProto> {
    node.attribute.iter().find(|attr| attr.name == name)
}

fn int_attr(node: &pb::NodeProto, name: &str) -> Option<i64> {
    attribute(node, name).map(|attr| attr.i)
}

fn ints_attr(node: &pb::NodeProto, name: &str) -> Option<Vec<i64>> {
    attribute(node, name).map(|attr| attr.ints.clone())
}

fn string_attr(node: &pb::NodeProto, name: &str) -> Option<String> {
    attribute(node, name).map(|attr| String::from_utf8_lossy(&attr.s).into_owned())
}

fn to_usize(value: i64, what: &str, label: &str) -> Result<usize, InteropError> {
    usize::try_from(value)
        .map_err(|_| InteropError::malformed(format!("{label}: negative {what} {value}")))
}

fn to_pair(values: &[i64], what: &str, label: &str) -> Result<[usize; 2], InteropError> {
    match values {
        [a, b] => Ok([to_usize(*a, what, label)?, to_usize(*b, what, label)?]),
        other => Err(InteropError::unsupported(format!(
            "{label}: {what} must have two entries, got {other:?}"
        ))),
    }
}

fn strides(node: &pb::NodeProto, label: &str) -> Result<[usize; 2], InteropError> {
    match ints_attr(node, "strides") {
        Some(values) => to_pair(&values, "strides", label),
        None => Ok([1, 1]),
    }
}

fn ensure_unit_dilations(node: &pb::NodeProto, label: &str) -> Result<(), InteropError> {
    if ints_attr(node, "dilations").is_some_and(|d| d.iter().any(|v| *v != 1)) {
        return Err(InteropError::unsupported(format!(
            "{label}: dilated windows are not supported"
        )));
    }
    Ok(())
}

fn padding(node: &pb::NodeProto, label: &str) -> Result<Padding, InteropError> {
    match string_attr(node, "auto_pad").as_deref() {
        None | Some("" | "NOTSET") => match ints_attr(node, "pads") {
            None => Ok(Padding::Valid),
            Some(pads) if pads.iter().all(|p| *p == 0) => Ok(Padding::Valid),
            Some(pads) => match pads.as_slice() {
                [top, left, bottom, right] => Ok(Padding::Explicit {
                    top: to_usize(*top, "pad", label)?,
                    left: to_usize(*left, "pad", label)?,
                    bottom: to_usize(*bottom, "pad", label)?,
                    right: to_usize(*right, "pad", label)?,
                }),
                other => Err(InteropError::unsupported(format!(
                    "{label}: pads must have four entries, got {other:?}"
                ))),
            },
        },
        Some("VALID") => Ok(Padding::Valid),
        Some("SAME_UPPER") => Ok(Padding::Same),
        Some(other) => Err(InteropError::unsupported(format!(
            "{label}: auto_pad '{other}' is not supported"
        ))),
    }
}

fn tensor_from_proto(proto: &pb::TensorProto) -> Result<Tensor, InteropError> {
    if proto.data_type != ONNX_FLOAT {
        return Err(InteropError::unsupported(format!(
            "initializer '{}' has element type {}, only float32 is supported",
            proto.name, proto.data_type
        )));
    }
    if !proto.external_data.is_empty() {
        return Err(InteropError::unsupported(format!(
            "initializer '{}' uses external data",
            proto.name
        )));
    }
    let shape = proto
        .dims
        .iter()
        .map(|dim| to_usize(*dim, "dimension", &proto.name))
        .collect::<Result<Vec<_>, _>>()?;
    let data = if proto.float_data.is_empty() {
        if proto.raw_data.len() % 4 != 0 {
            return Err(InteropError::malformed(format!(
                "initializer '{}' raw data is not a whole number of floats",
                proto.name
            )));
        }
        proto
            .raw_data
            .chunks_exact(4)
            .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .collect()
    } else {
        proto.float_data.clone()
    };
    Tensor::new(shape, data).map_err(|err| {
        InteropError::malformed(format!("initializer '{}': {}", proto.name, err.message))
    })
}

/// `[O, I, kh, kw]` to `[kh, kw, I, O]`.
fn oihw_to_hwio(tensor: Tensor, label: &str) -> Result<Tensor, InteropError> {
    let [o, i, kh, kw] = match tensor.shape.as_slice() {
        [o, i, kh, kw] => [*o, *i, *kh, *kw],
        other => {
            return Err(InteropError::malformed(format!(
                "{label}: conv weight must be rank 4, got {other:?}"
            )));
        }
    };
    let mut data = vec![0.0_f32; tensor.data.len()];
    for co in 0..o {
        for ci in 0..i {
            for y in 0..kh {
                for x in 0..kw {
                    data[((y * kw + x) * i + ci) * o + co] =
                        tensor.data[((co * i + ci) * kh + y) * kw + x];
                }
            }
        }
    }
    Tensor::new(vec![kh, kw, i, o], data)
        .map_err(|err| InteropError::malformed(format!("{label}: {}", err.message)))
}
