//! Detector configuration format.

use crate::{
    anchors::AnchorsInit,
    boxes::NmsKind,
    coder::{BoxCoderInit, Variances},
    common::*,
    loss::{self, SsdLossInit},
    rnn::CellConfig,
};

pub use anchors::*;
pub use inference::*;
pub use matching::*;

/// The main detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub anchors: AnchorConfig,
    pub matching: MatchingConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub loss: loss::Config,
    /// Optional recurrent stage over the feature maps.
    pub rnn: Option<CellConfig>,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config: Self = json5::from_str(&text)
            .with_context(|| format!("unable to parse config file {}", path.display()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        ensure!(
            self.inference.use_sigmoid == self.loss.use_sigmoid,
            DetectError::InvalidConfig(
                "inference.use_sigmoid and loss.use_sigmoid must agree".into()
            )
        );
        if !self.loss.use_sigmoid && self.matching.label_offset != 1 {
            warn!(
                "softmax scoring usually reserves column 0 for background with label_offset = 1, but get {}",
                self.matching.label_offset
            );
        }
        Ok(())
    }

    pub fn box_coder_init(&self) -> BoxCoderInit {
        let MatchingConfig {
            fg_iou_threshold,
            bg_iou_threshold,
            label_offset,
            num_classes,
            variances,
        } = self.matching;
        let InferenceConfig {
            nms,
            nms_threshold,
            use_sigmoid,
            ..
        } = self.inference;

        BoxCoderInit {
            anchors: self.anchors.anchors_init(),
            fg_iou_threshold: fg_iou_threshold.raw(),
            bg_iou_threshold: bg_iou_threshold.raw(),
            label_offset,
            num_classes,
            variances,
            nms,
            nms_threshold: nms_threshold.raw(),
            use_sigmoid,
        }
    }

    pub fn ssd_loss_init(&self) -> SsdLossInit {
        self.loss
            .ssd_loss_init(self.matching.num_classes, self.matching.variances)
    }
}

mod anchors {
    use super::*;

    /// Anchor pyramid options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AnchorConfig {
        #[serde(default = "default_pyramid_levels")]
        pub pyramid_levels: Vec<u32>,
        /// Per-level strides, `2^level` if unset.
        pub strides: Option<Vec<R64>>,
        #[serde(default = "default_base_size")]
        pub base_size: R64,
        /// Per-level base box sizes, `base_size * 2^i` if unset.
        pub sizes: Option<Vec<R64>>,
        #[serde(default = "default_ratios")]
        pub ratios: Vec<R64>,
        #[serde(default = "default_scales")]
        pub scales: Vec<R64>,
    }

    impl Default for AnchorConfig {
        fn default() -> Self {
            Self {
                pyramid_levels: default_pyramid_levels(),
                strides: None,
                base_size: default_base_size(),
                sizes: None,
                ratios: default_ratios(),
                scales: default_scales(),
            }
        }
    }

    impl AnchorConfig {
        pub fn anchors_init(&self) -> AnchorsInit {
            let raw = |values: &[R64]| -> Vec<f64> { values.iter().map(|value| value.raw()).collect() };

            AnchorsInit {
                pyramid_levels: self.pyramid_levels.clone(),
                strides: self.strides.as_deref().map(raw),
                base_size: self.base_size.raw(),
                sizes: self.sizes.as_deref().map(raw),
                ratios: raw(&self.ratios),
                scales: raw(&self.scales),
            }
        }
    }

    fn default_pyramid_levels() -> Vec<u32> {
        AnchorsInit::default().pyramid_levels
    }

    fn default_base_size() -> R64 {
        r64(AnchorsInit::default().base_size)
    }

    fn default_ratios() -> Vec<R64> {
        AnchorsInit::default().ratios.into_iter().map(r64).collect()
    }

    fn default_scales() -> Vec<R64> {
        AnchorsInit::default().scales.into_iter().map(r64).collect()
    }
}

mod matching {
    use super::*;

    /// Ground truth to anchor matching options.
    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    pub struct MatchingConfig {
        #[serde(default = "default_fg_iou_threshold")]
        pub fg_iou_threshold: R64,
        #[serde(default = "default_bg_iou_threshold")]
        pub bg_iou_threshold: R64,
        /// Added to dataset labels to obtain encoded classes.
        #[serde(default)]
        pub label_offset: i64,
        /// Classifier width, including the background column.
        pub num_classes: usize,
        #[serde(default)]
        pub variances: Variances,
    }

    fn default_fg_iou_threshold() -> R64 {
        r64(0.5)
    }

    fn default_bg_iou_threshold() -> R64 {
        r64(0.4)
    }
}

mod inference {
    use super::*;

    /// Decoding options.
    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    pub struct InferenceConfig {
        #[serde(default)]
        pub nms: NmsKind,
        #[serde(default = "default_nms_threshold")]
        pub nms_threshold: R64,
        #[serde(default = "default_score_threshold")]
        pub score_threshold: R64,
        #[serde(default = "default_use_sigmoid")]
        pub use_sigmoid: bool,
    }

    impl Default for InferenceConfig {
        fn default() -> Self {
            Self {
                nms: NmsKind::default(),
                nms_threshold: default_nms_threshold(),
                score_threshold: default_score_threshold(),
                use_sigmoid: default_use_sigmoid(),
            }
        }
    }

    fn default_nms_threshold() -> R64 {
        r64(0.45)
    }

    fn default_score_threshold() -> R64 {
        r64(0.5)
    }

    fn default_use_sigmoid() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        boxes::{SoftNmsDecay, SoftNmsParams},
        loss::{ClassificationLossKind, LocalizationLossKind},
        rnn::CellKind,
    };

    #[test]
    fn parse_minimal_config() -> Result<()> {
        let config: Config = json5::from_str("{ matching: { num_classes: 3 } }")?;
        config.check()?;

        let coder = config.box_coder_init().build()?;
        assert_eq!(coder.anchors().num_levels(), 4);
        assert_eq!(coder.anchors().num_anchors(), 9);
        assert_eq!(coder.nms(), NmsKind::default());
        assert_eq!(coder.variances(), Variances::default());

        let loss = config.ssd_loss_init();
        assert_eq!(loss.classification, ClassificationLossKind::Focal);
        assert!(!loss.hard_negative_mining);
        loss.build()?;
        assert!(config.rnn.is_none());
        Ok(())
    }

    #[test]
    fn parse_full_config() -> Result<()> {
        let text = r#"{
            anchors: {
                pyramid_levels: [3, 4],
                base_size: 24.0,
                ratios: [1.0],
                scales: [1.0, 1.5],
            },
            matching: {
                fg_iou_threshold: 0.6,
                bg_iou_threshold: 0.3,
                label_offset: 1,
                num_classes: 4,
                variances: { xy: 0.1, wh: 0.2 },
            },
            inference: {
                nms: { type: "soft", decay: { kind: "linear" }, min_score: 0.1 },
                nms_threshold: 0.5,
                score_threshold: 0.3,
                use_sigmoid: false,
            },
            loss: {
                mode: "hard-negative-mined",
                use_sigmoid: false,
                use_iou: true,
            },
            rnn: { kind: "conv_gru", in_channels: 8, hidden_channels: 8 },
        }"#;
        let config: Config = json5::from_str(text)?;
        config.check()?;

        assert_eq!(
            config.inference.nms,
            NmsKind::Soft(SoftNmsParams {
                decay: SoftNmsDecay::Linear,
                min_score: r64(0.1),
            })
        );
        let init = config.ssd_loss_init();
        assert_eq!(init.classification, ClassificationLossKind::CrossEntropy);
        assert!(init.hard_negative_mining);
        assert_eq!(init.localization, LocalizationLossKind::BoundedIou);
        assert_eq!(init.neg_pos_ratio, 3);

        let coder = config.box_coder_init().build()?;
        assert_eq!(coder.label_offset(), 1);
        assert_eq!(coder.anchors().layers()[1].box_size(), 48.0);

        let rnn = config.rnn.as_ref().expect("rnn section");
        assert_eq!(rnn.kind, CellKind::ConvGru);
        assert_eq!(rnn.kernel_size, 3);
        Ok(())
    }

    #[test]
    fn disagreeing_activations_are_rejected() -> Result<()> {
        let config: Config = json5::from_str(
            "{ matching: { num_classes: 3 }, inference: { use_sigmoid: false } }",
        )?;
        assert!(config.check().is_err());
        Ok(())
    }

    #[test]
    fn inverted_thresholds_fail_at_build() -> Result<()> {
        let config: Config = json5::from_str(
            "{ matching: { num_classes: 3, fg_iou_threshold: 0.3, bg_iou_threshold: 0.5 } }",
        )?;
        let err = config.box_coder_init().build().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DetectError>(),
            Some(DetectError::InvalidThreshold { .. })
        ));
        Ok(())
    }
}
