mod common;

use common::{
    BACKBONE_CHANNELS, BackboneOptions, IMAGE_SHAPE, backbone_model, unique_temp_dir,
    write_backbone,
};
use fcnseg::backbone::{BackboneError, load_backbone, load_backbone_bytes};
use fcnseg::ir::Tensor;
use fcnseg::session::{Session, VariableOrigin};
use prost::Message;

#[test]
fn loads_all_five_tensors_from_a_model_directory() {
    let dir = unique_temp_dir("backbone_dir");
    write_backbone(&dir, &backbone_model(IMAGE_SHAPE, BackboneOptions::default()));

    let mut session = Session::new(0);
    let tensors = load_backbone(&mut session, &dir).expect("fixture backbone should load");

    let (h, w) = IMAGE_SHAPE;
    let [c3, c4, c7] = BACKBONE_CHANNELS;
    assert_eq!(session.shape(tensors.image_input), Some(&[1, h, w, 3][..]));
    assert_eq!(session.shape(tensors.keep_prob), Some(&[][..]));
    assert_eq!(session.shape(tensors.layer3_out), Some(&[1, h / 8, w / 8, c3][..]));
    assert_eq!(session.shape(tensors.layer4_out), Some(&[1, h / 16, w / 16, c4][..]));
    assert_eq!(session.shape(tensors.layer7_out), Some(&[1, h / 32, w / 32, c7][..]));

    let restored = session.variables().collect::<Vec<_>>();
    assert_eq!(restored.len(), 6);
    assert!(restored.iter().all(|var| var.origin == VariableOrigin::Backbone));
}

#[test]
fn accepts_a_direct_file_path_and_suffixed_names() {
    let dir = unique_temp_dir("backbone_file");
    let model = backbone_model(
        IMAGE_SHAPE,
        BackboneOptions {
            tensor_suffix: true,
            ..BackboneOptions::default()
        },
    );
    write_backbone(&dir, &model);

    let mut session = Session::new(0);
    let tensors = load_backbone(&mut session, &dir.join("saved_model.onnx"))
        .expect("suffixed names should resolve");
    assert_eq!(session.value_by_name("layer3_out:0"), Some(tensors.layer3_out));
}

#[test]
fn missing_tensor_name_is_not_found() {
    let model = backbone_model(
        IMAGE_SHAPE,
        BackboneOptions {
            drop_layer4: true,
            ..BackboneOptions::default()
        },
    );
    let mut session = Session::new(0);
    let err = load_backbone_bytes(&mut session, &model.encode_to_vec())
        .expect_err("layer4_out is missing");
    assert!(matches!(err, BackboneError::NotFound(name) if name == "layer4_out"));
}

#[test]
fn missing_artifact_is_an_io_error() {
    let dir = unique_temp_dir("backbone_missing");
    let mut session = Session::new(0);
    let err = load_backbone(&mut session, &dir).expect_err("no saved_model.onnx");
    assert!(matches!(err, BackboneError::Io { .. }));
    assert!(err.to_string().contains("saved_model.onnx"));
}

#[test]
fn corrupt_artifact_is_a_decode_error() {
    let mut session = Session::new(0);
    let err = load_backbone_bytes(&mut session, &[0xff, 0xff, 0xff, 0x01])
        .expect_err("garbage must not decode");
    assert!(matches!(err, BackboneError::Decode(_)));
}

#[test]
fn unsupported_op_is_reported() {
    let mut model = backbone_model(IMAGE_SHAPE, BackboneOptions::default());
    if let Some(graph) = model.graph.as_mut() {
        graph.node[1].op_type = "Sigmoid".to_string();
    }
    let mut session = Session::new(0);
    let err = load_backbone_bytes(&mut session, &model.encode_to_vec())
        .expect_err("Sigmoid is not supported");
    assert!(matches!(err, BackboneError::Unsupported(message) if message.contains("Sigmoid")));
}

#[test]
fn restored_backbone_runs_with_any_batch_size() {
    let model = backbone_model((32, 64), BackboneOptions::default());
    let mut session = Session::new(0);
    let tensors =
        load_backbone_bytes(&mut session, &model.encode_to_vec()).expect("backbone should load");
    session.initialize_variables().expect("init");

    let images = Tensor::filled(vec![3, 32, 64, 3], 0.5).expect("images");
    let out = session
        .run(
            &[tensors.layer7_out],
            vec![
                (tensors.image_input, images),
                (tensors.keep_prob, Tensor::scalar(1.0)),
            ],
        )
        .expect("forward pass");
    assert_eq!(out[0].shape, vec![3, 1, 2, BACKBONE_CHANNELS[2]]);
    assert!(out[0].all_finite());
}
