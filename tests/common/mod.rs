// Shared fixtures for integration tests.
// Included with `mod common;`.
#![allow(dead_code)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use fcnseg::data::{Example, InMemoryDataset};
use fcnseg::ir::Tensor;
use image::{Rgb, RgbImage};
use prost::Message;
use tract_onnx::pb;

pub const IMAGE_SHAPE: (usize, usize) = (160, 576);
/// Channels of layer3_out, layer4_out and layer7_out in the synthetic backbone.
pub const BACKBONE_CHANNELS: [usize; 3] = [4, 6, 8];

/// Which of the five backbone names the fixture exports.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackboneOptions {
    /// Skip the `layer4_out` node name.
    pub drop_layer4: bool,
    /// Export names with a `:0` suffix.
    pub tensor_suffix: bool,
}

/// A tiny VGG-shaped backbone: stride 8, 16 and 32 feature maps with
/// `BACKBONE_CHANNELS` channels and dropout on the deepest one.
pub fn backbone_model(image_shape: (usize, usize), options: BackboneOptions) -> pb::ModelProto {
    let suffix = if options.tensor_suffix { ":0" } else { "" };
    let name = |base: &str| format!("{base}{suffix}");
    let (h, w) = image_shape;
    let [c3, c4, c7] = BACKBONE_CHANNELS;

    let inputs = vec![
        value_info(&name("image_input"), &[None, Some(3), Some(h), Some(w)]),
        value_info(&name("keep_prob"), &[]),
    ];
    let initializer = vec![
        weight("conv3_w", &[c3, 3, 8, 8], 0.02),
        weight("conv3_b", &[c3], 0.01),
        weight("conv4_w", &[c4, c3, 1, 1], 0.3),
        weight("conv4_b", &[c4], 0.01),
        weight("fc7_w", &[c7, c4, 1, 1], 0.3),
        weight("fc7_b", &[c7], 0.01),
    ];
    let layer4 = if options.drop_layer4 {
        "relu4".to_string()
    } else {
        name("layer4_out")
    };

    let nodes = vec![
        node(
            "Conv",
            &[&name("image_input"), "conv3_w", "conv3_b"],
            "conv3",
            vec![ints("strides", &[8, 8]), ints("pads", &[0, 0, 0, 0])],
        ),
        node("Relu", &["conv3"], &name("layer3_out"), Vec::new()),
        node(
            "MaxPool",
            &[&name("layer3_out")],
            "pool4",
            vec![ints("kernel_shape", &[2, 2]), ints("strides", &[2, 2])],
        ),
        node(
            "Conv",
            &["pool4", "conv4_w", "conv4_b"],
            "conv4",
            vec![string("auto_pad", "SAME_UPPER")],
        ),
        node("Relu", &["conv4"], &layer4, Vec::new()),
        node(
            "MaxPool",
            &[&layer4],
            "pool5",
            vec![ints("kernel_shape", &[2, 2]), ints("strides", &[2, 2])],
        ),
        node("Conv", &["pool5", "fc7_w", "fc7_b"], "fc7", Vec::new()),
        node("Relu", &["fc7"], "relu7", Vec::new()),
        node("Dropout", &["relu7", &name("keep_prob")], "dropout7", Vec::new()),
        node("Identity", &["dropout7"], &name("layer7_out"), Vec::new()),
    ];

    pb::ModelProto {
        ir_version: 7,
        producer_name: "fcnseg-tests".to_string(),
        opset_import: vec![pb::OperatorSetIdProto {
            domain: String::new(),
            version: 13,
        }],
        graph: Some(pb::GraphProto {
            name: "vgg16_fixture".to_string(),
            node: nodes,
            initializer,
            input: inputs,
            output: vec![value_info(
                &name("layer7_out"),
                &[None, Some(c7), Some(h / 32), Some(w / 32)],
            )],
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn backbone_bytes(image_shape: (usize, usize)) -> Vec<u8> {
    backbone_model(image_shape, BackboneOptions::default()).encode_to_vec()
}

/// Writes `saved_model.onnx` into `dir` and returns `dir`.
pub fn write_backbone(dir: &Path, model: &pb::ModelProto) -> PathBuf {
    fs::create_dir_all(dir).expect("backbone dir should be creatable");
    fs::write(dir.join("saved_model.onnx"), model.encode_to_vec())
        .expect("backbone artifact should be writable");
    dir.to_path_buf()
}

pub fn unique_temp_dir(label: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be valid")
        .as_nanos();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = env::temp_dir().join(format!(
        "fcnseg_{label}_{}_{nanos}_{n}",
        std::process::id()
    ));
    fs::create_dir_all(&path).expect("temp dir should be creatable");
    path
}

/// Synthetic road scene: the lower half is road, the rest background.
pub fn synthetic_example(image_shape: (usize, usize), variant: usize) -> Example {
    let (h, w) = image_shape;
    let mut image = Vec::with_capacity(h * w * 3);
    let mut label = Vec::with_capacity(h * w * 2);
    for y in 0..h {
        for x in 0..w {
            let road = y >= h / 2;
            let shade = ((x + y + variant * 7) % 17) as f32 / 17.0;
            let base = if road { 0.2 } else { 0.8 };
            image.extend_from_slice(&[base, shade, 1.0 - base]);
            label.extend_from_slice(if road { &[0.0, 1.0] } else { &[1.0, 0.0] });
        }
    }
    Example {
        image: Tensor::new(vec![h, w, 3], image).expect("image tensor"),
        label: Tensor::new(vec![h, w, 2], label).expect("label tensor"),
    }
}

pub fn synthetic_dataset(image_shape: (usize, usize), len: usize) -> InMemoryDataset {
    InMemoryDataset::new((0..len).map(|i| synthetic_example(image_shape, i)).collect())
}

/// Writes a KITTI-style `data_road` tree with `count` training pairs and
/// `count` testing images.
pub fn write_kitti_tree(data_dir: &Path, image_shape: (usize, usize), count: usize) {
    let (h, w) = image_shape;
    let training = data_dir.join("data_road").join("training");
    let testing = data_dir.join("data_road").join("testing").join("image_2");
    for dir in [training.join("image_2"), training.join("gt_image_2"), testing.clone()] {
        fs::create_dir_all(&dir).expect("dataset dir should be creatable");
    }

    for i in 0..count {
        let mut image = RgbImage::new(w as u32, h as u32);
        let mut gt = RgbImage::new(w as u32, h as u32);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            *pixel = Rgb([(x % 256) as u8, (y % 256) as u8, (i * 40) as u8]);
            let road = y as usize >= h / 2;
            gt.put_pixel(x, y, Rgb(if road { [255, 0, 255] } else { [255, 0, 0] }));
        }
        let stem = format!("um_{i:06}.png");
        image
            .save(training.join("image_2").join(&stem))
            .expect("training image should be writable");
        gt.save(training.join("gt_image_2").join(format!("um_road_{i:06}.png")))
            .expect("ground truth should be writable");
        // Lane annotations share the directory and must be skipped.
        gt.save(training.join("gt_image_2").join(format!("um_lane_{i:06}.png")))
            .expect("lane ground truth should be writable");
        image
            .save(testing.join(&stem))
            .expect("testing image should be writable");
    }
}

fn value_info(name: &str, dims: &[Option<usize>]) -> pb::ValueInfoProto {
    let dim = dims
        .iter()
        .map(|dim| pb::tensor_shape_proto::Dimension {
            value: Some(match dim {
                Some(v) => pb::tensor_shape_proto::dimension::Value::DimValue(*v as i64),
                None => pb::tensor_shape_proto::dimension::Value::DimParam("batch".to_string()),
            }),
            ..Default::default()
        })
        .collect();
    pb::ValueInfoProto {
        name: name.to_string(),
        r#type: Some(pb::TypeProto {
            value: Some(pb::type_proto::Value::TensorType(pb::type_proto::Tensor {
                elem_type: pb::tensor_proto::DataType::Float as i32,
                shape: Some(pb::TensorShapeProto { dim }),
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Deterministic weights in `±scale`.
fn weight(name: &str, dims: &[usize], scale: f32) -> pb::TensorProto {
    let count = dims.iter().product::<usize>();
    pb::TensorProto {
        name: name.to_string(),
        dims: dims.iter().map(|d| *d as i64).collect(),
        data_type: pb::tensor_proto::DataType::Float as i32,
        float_data: (0..count)
            .map(|i| scale * ((i as f32) * 0.7 + name.len() as f32).sin())
            .collect(),
        ..Default::default()
    }
}

fn node(
    op_type: &str,
    inputs: &[&str],
    output: &str,
    attribute: Vec<pb::AttributeProto>,
) -> pb::NodeProto {
    pb::NodeProto {
        name: output.to_string(),
        op_type: op_type.to_string(),
        input: inputs.iter().map(ToString::to_string).collect(),
        output: vec![output.to_string()],
        attribute,
        ..Default::default()
    }
}

fn ints(name: &str, values: &[i64]) -> pb::AttributeProto {
    pb::AttributeProto {
        name: name.to_string(),
        r#type: pb::attribute_proto::AttributeType::Ints as i32,
        ints: values.to_vec(),
        ..Default::default()
    }
}

fn string(name: &str, value: &str) -> pb::AttributeProto {
    pb::AttributeProto {
        name: name.to_string(),
        r#type: pb::attribute_proto::AttributeType::String as i32,
        s: value.as_bytes().to_vec(),
        ..Default::default()
    }
}
