mod common;

use common::{BackboneOptions, backbone_model};
use fcnseg::backbone::load_backbone_bytes;
use fcnseg::ir::{Op, ValueId, print_graph, verify_graph};
use fcnseg::model::{BACKBONE_STRIDE, DecoderConfig, DecoderError, UPSAMPLE_FACTORS, layers};
use fcnseg::session::{Session, SessionError};
use prost::Message;
use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;

fn feature_maps(
    session: &mut Session,
    grid: (usize, usize),
    channels: [usize; 3],
) -> [ValueId; 3] {
    let (gh, gw) = grid;
    [
        session
            .placeholder("shallow", vec![1, gh * 4, gw * 4, channels[0]])
            .expect("shallow"),
        session
            .placeholder("mid", vec![1, gh * 2, gw * 2, channels[1]])
            .expect("mid"),
        session
            .placeholder("deep", vec![1, gh, gw, channels[2]])
            .expect("deep"),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn logits_match_the_image_for_every_class_count(
        num_classes in 1usize..8,
        gh in 1usize..6,
        gw in 1usize..6,
        c3 in 1usize..12,
        c4 in 1usize..12,
        c7 in 1usize..12,
    ) {
        let mut session = Session::new(0);
        let [shallow, mid, deep] = feature_maps(&mut session, (gh, gw), [c3, c4, c7]);
        let image_shape = (gh * BACKBONE_STRIDE, gw * BACKBONE_STRIDE);
        let out = layers(
            &mut session,
            shallow,
            mid,
            deep,
            num_classes,
            &DecoderConfig { image_shape, ..DecoderConfig::default() },
        )
        .expect("decoder should build");

        let shape = session.static_shape(out.logits).expect("logits shape");
        prop_assert_eq!(shape, vec![1, image_shape.0, image_shape.1, num_classes]);
        prop_assert_eq!(out.regularizers.len(), 4);
    }
}

#[test]
fn upsample_factors_cover_the_backbone_stride() {
    assert_eq!(UPSAMPLE_FACTORS, [2, 2, 8]);
    assert_eq!(UPSAMPLE_FACTORS.iter().product::<usize>(), BACKBONE_STRIDE);
    assert_eq!(BACKBONE_STRIDE, 32);
}

#[test]
fn decoder_on_the_fixture_backbone_yields_full_resolution_logits() {
    let model = backbone_model((160, 576), BackboneOptions::default());
    let mut session = Session::new(0);
    let backbone =
        load_backbone_bytes(&mut session, &model.encode_to_vec()).expect("backbone should load");
    let out = layers(
        &mut session,
        backbone.layer3_out,
        backbone.layer4_out,
        backbone.layer7_out,
        2,
        &DecoderConfig::default(),
    )
    .expect("decoder should build");

    assert_eq!(session.shape(out.logits), Some(&[1, 160, 576, 2][..]));
    verify_graph(session.graph()).expect("built graph should verify");

    let listing = print_graph(session.graph());
    let upsampling = listing
        .lines()
        .filter(|line| line.contains("= conv2d_transpose "))
        .map(|line| line.split_once(" s[").map_or("", |(_, attrs)| attrs))
        .collect::<Vec<_>>();
    assert_eq!(upsampling, vec!["2, 2] same", "2, 2] same", "8, 8] same"]);
    assert!(listing.lines().any(|line| line.ends_with(": decoder/logits")));

    let penalized = out
        .regularizers
        .iter()
        .map(|term| term.variable.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        penalized,
        vec![
            "decoder/score_deep/kernel",
            "decoder/upsample_deep/kernel",
            "decoder/upsample_mid/kernel",
            "decoder/upsample_final/kernel",
        ]
    );
}

#[test]
fn misaligned_skip_connection_fails_before_training() {
    let mut session = Session::new(0);
    let shallow = session
        .placeholder("shallow", vec![1, 20, 72, 4])
        .expect("shallow");
    // One row short of twice the deep map.
    let mid = session.placeholder("mid", vec![1, 9, 36, 6]).expect("mid");
    let deep = session.placeholder("deep", vec![1, 5, 18, 8]).expect("deep");

    let err = layers(&mut session, shallow, mid, deep, 2, &DecoderConfig::default())
        .expect_err("fusion must reject mismatched maps");
    assert!(matches!(err, DecoderError::Shape(message) if message.contains("decoder/fuse_mid")));
    assert!(session.variables().count() < 8);
}

#[test]
fn fusing_maps_with_different_channel_counts_is_a_shape_error() {
    let mut session = Session::new(0);
    let upsampled = session
        .placeholder("upsampled", vec![1, 10, 36, 6])
        .expect("upsampled");
    let skip = session.placeholder("skip", vec![1, 10, 36, 5]).expect("skip");
    let err = session
        .add(Op::Add(upsampled, skip))
        .expect_err("channel mismatch must fail");
    assert!(matches!(err, SessionError::Shape(_)));
}

#[test]
fn non_image_feature_map_is_rejected() {
    let mut session = Session::new(0);
    let shallow = session.placeholder("shallow", vec![1, 20, 72]).expect("shallow");
    let mid = session.placeholder("mid", vec![1, 10, 36, 6]).expect("mid");
    let deep = session.placeholder("deep", vec![1, 5, 18, 8]).expect("deep");
    assert!(matches!(
        layers(&mut session, shallow, mid, deep, 2, &DecoderConfig::default()),
        Err(DecoderError::Shape(_))
    ));
}
