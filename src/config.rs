//! Run configuration: built-in defaults overlaid by `FCNSEG_*` environment
//! variables. The binary applies command-line flags on top.

use std::path::PathBuf;

use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub num_classes: usize,
    /// `(height, width)`.
    pub image_shape: (usize, usize),
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub keep_prob: f32,
    pub freeze_backbone: bool,
    pub seed: u64,
    pub data_dir: PathBuf,
    pub runs_dir: PathBuf,
    /// Backbone artifact; `<data_dir>/vgg` when unset.
    pub vgg_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            num_classes: 2,
            image_shape: (160, 576),
            epochs: 20,
            batch_size: 32,
            learning_rate: 0.0005,
            keep_prob: 0.6,
            freeze_backbone: false,
            seed: 0,
            data_dir: PathBuf::from("./data"),
            runs_dir: PathBuf::from("./runs"),
            vgg_dir: None,
        }
    }
}

impl RunConfig {
    /// Defaults overlaid by the process environment.
    pub fn from_env() -> Self {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Overlays values looked up through `lookup`. Unparsable values are
    /// ignored with a warning.
    #[must_use]
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = &lookup;
        read_parsed(lookup, "FCNSEG_NUM_CLASSES", &mut self.num_classes);
        read_parsed(lookup, "FCNSEG_IMAGE_HEIGHT", &mut self.image_shape.0);
        read_parsed(lookup, "FCNSEG_IMAGE_WIDTH", &mut self.image_shape.1);
        read_parsed(lookup, "FCNSEG_EPOCHS", &mut self.epochs);
        read_parsed(lookup, "FCNSEG_BATCH_SIZE", &mut self.batch_size);
        read_parsed(lookup, "FCNSEG_LEARNING_RATE", &mut self.learning_rate);
        read_parsed(lookup, "FCNSEG_KEEP_PROB", &mut self.keep_prob);
        read_parsed(lookup, "FCNSEG_SEED", &mut self.seed);
        self.freeze_backbone = read_bool(lookup, "FCNSEG_FREEZE_BACKBONE", self.freeze_backbone);
        if let Some(dir) = lookup("FCNSEG_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("FCNSEG_RUNS_DIR") {
            self.runs_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("FCNSEG_VGG_DIR") {
            self.vgg_dir = Some(PathBuf::from(dir));
        }
        self
    }

    #[must_use]
    pub fn vgg_path(&self) -> PathBuf {
        self.vgg_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("vgg"))
    }

    #[must_use]
    pub fn training_dir(&self) -> PathBuf {
        self.data_dir.join("data_road").join("training")
    }
}

fn read_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = %raw, "ignoring unparsable setting"),
    }
}

fn read_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default_value: bool) -> bool {
    lookup(key)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(default_value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn environment_overrides_defaults() {
        let env: HashMap<&str, &str> = [
            ("FCNSEG_EPOCHS", "3"),
            ("FCNSEG_FREEZE_BACKBONE", "true"),
            ("FCNSEG_LEARNING_RATE", "0.01"),
            ("FCNSEG_BATCH_SIZE", "many"),
            ("FCNSEG_DATA_DIR", "/tmp/kitti"),
        ]
        .into_iter()
        .collect();
        let config = RunConfig::default().with_env(|key| env.get(key).map(ToString::to_string));
        assert_eq!(config.epochs, 3);
        assert!(config.freeze_backbone);
        assert!((config.learning_rate - 0.01).abs() < f32::EPSILON);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.vgg_path(), PathBuf::from("/tmp/kitti/vgg"));
    }
}
