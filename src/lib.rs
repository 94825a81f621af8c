//! # fcnseg
//!
//! Road segmentation training with an FCN-8s decoder grafted onto a
//! pretrained VGG16 backbone.
//!
//! ## Pipeline
//!
//! ```text
//! saved_model.onnx
//!    │
//!    ▼  backbone::load_backbone
//! image_input, keep_prob, layer3/4/7 feature maps
//!    │
//!    ▼  model::layers
//! logits [N, H, W, classes] + L2 penalties
//!    │
//!    ▼  model::optimize
//! loss + train step
//!    │
//!    ▼  model::train_nn
//! trained session ──▶ data::save_inference_samples
//! ```
//!
//! Everything runs on a small graph engine in [`ir`]: tensors, static shape
//! inference, reverse-mode autograd, an interpreter and Adam/SGD. A
//! [`session::Session`] owns one graph and its variables.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use fcnseg::config::RunConfig;
//! use fcnseg::pipeline;
//!
//! let outcome = pipeline::run(&RunConfig::from_env()).unwrap();
//! println!("samples in {}", outcome.samples_dir.display());
//! ```

#![allow(
    clippy::missing_errors_doc,
    clippy::must_use_candidate,
    clippy::uninlined_format_args,
    clippy::too_many_lines,
    clippy::too_many_arguments,
    clippy::match_same_arms,
    clippy::needless_pass_by_value,
    clippy::implicit_hasher,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::missing_panics_doc,
    clippy::similar_names,
    clippy::doc_markdown,
    clippy::items_after_statements
)]

pub mod backbone;
pub mod config;
pub mod data;
pub mod interop;
pub mod ir;
pub mod model;
pub mod pipeline;
pub mod session;
