use crate::ir::conv::Padding;
use crate::ir::{Graph, Op, ValueId};

/// Renders the graph one SSA assignment per line, appending `: name` to named values.
pub fn print_graph(graph: &Graph) -> String {
    let mut lines = Vec::new();
    for node in &graph.nodes {
        let mut line = format!("%{} = {}", node.output.0, format_op(&node.op));
        if let Some(name) = &node.name {
            line.push_str(" : ");
            line.push_str(name);
        }
        lines.push(line);
    }
    lines.join("\n")
}

fn format_op(op: &Op) -> String {
    let mnemonic = op.mnemonic();
    let operands = op
        .input_values()
        .into_iter()
        .map(fmt_value)
        .collect::<Vec<_>>()
        .join(" ");
    let attrs = match op {
        Op::ConstTensor { shape, .. } => format!("{shape:?}"),
        Op::Scale { factor, .. } => format!("x{factor}"),
        Op::Conv2D { spec, .. }
        | Op::Conv2DTranspose { spec, .. }
        | Op::Conv2DTransposeBackpropInput { spec, .. } => {
            format!("s{:?} {}", spec.strides, fmt_padding(spec.padding))
        }
        Op::Conv2DBackpropInput { spec, input_hw, .. } => format!(
            "s{:?} {} in{input_hw:?}",
            spec.strides,
            fmt_padding(spec.padding)
        ),
        Op::Conv2DBackpropFilter {
            spec, kernel_hw, ..
        }
        | Op::Conv2DTransposeBackpropFilter {
            spec, kernel_hw, ..
        } => format!(
            "s{:?} {} k{kernel_hw:?}",
            spec.strides,
            fmt_padding(spec.padding)
        ),
        Op::MaxPool { spec, .. } | Op::MaxPoolBackward { spec, .. } => format!(
            "w{:?} s{:?} {}",
            spec.window,
            spec.strides,
            fmt_padding(spec.padding)
        ),
        Op::Dropout { mask_key, .. } | Op::DropoutBackward { mask_key, .. } => {
            format!("mask{mask_key}")
        }
        Op::Reshape { shape, .. } => format!("{shape:?}"),
        Op::Parameter(name) | Op::Input(name) => name.clone(),
        _ => String::new(),
    };

    [mnemonic.to_string(), operands, attrs]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn fmt_padding(padding: Padding) -> String {
    match padding {
        Padding::Valid => "valid".to_string(),
        Padding::Same => "same".to_string(),
        Padding::Explicit {
            top,
            left,
            bottom,
            right,
        } => format!("pad[{top},{left},{bottom},{right}]"),
    }
}

fn fmt_value(value: ValueId) -> String {
    format!("%{}", value.0)
}
