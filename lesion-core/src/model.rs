use crate::error::{LesionError, Result};
use crate::weights;
use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::ElementConversion;
use nn::conv::{Conv2d, Conv2dConfig};
use nn::loss::CrossEntropyLossConfig;
use nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use nn::{Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu};
use std::fmt;
use std::path::Path;

/// Output classes, in the order of the model's output units.
pub const LABELS: [&str; 3] = ["No Cancer", "Benign", "Malignant"];

const VGG16_WIDTHS: [usize; 5] = [64, 128, 256, 512, 512];
const VGG16_CONVS: [usize; 5] = [2, 2, 3, 3, 3];

#[derive(Module, Debug)]
pub struct VggBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
}

/// The convolutional part of VGG, without its classifier.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    blocks: Vec<VggBlock<B>>,
    activation: Relu,
}

impl<B: Backend> Backbone<B> {
    /// # Shapes
    ///   - Images [batch_size, 3, height, width]
    ///   - Output [batch_size, channels, height / 32, width / 32]
    fn forward(&self, mut x: Tensor<B, 4>) -> Tensor<B, 4> {
        for block in &self.blocks {
            for conv in &block.convs {
                x = self.activation.forward(conv.forward(x));
            }
            x = block.pool.forward(x);
        }
        x
    }
}

#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    backbone: Backbone<B>,
    pool: AdaptiveAvgPool2d,
    dense: Linear<B>,
    activation: Relu,
    dropout: Dropout,
    output: Linear<B>,
    l2: f64,
    frozen_layers: usize,
}

pub(crate) struct StepOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub output: Tensor<B, 2>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> StepOutput<B> {
    pub(crate) fn correct(&self) -> usize {
        self.output
            .clone()
            .argmax(1)
            .squeeze::<1>(1)
            .equal(self.targets.clone())
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>() as usize
    }
}

impl<B: Backend> Model<B> {
    /// # Shapes
    ///   - Images [batch_size, height, width, 3], values in [0, 1]
    ///   - Output [batch_size, num_classes], unnormalized
    pub fn forward_logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.backbone.forward(images.permute([0, 3, 1, 2]));
        let x = self.pool.forward(x).flatten::<2>(1, 3); // [batch_size, channels]
        let x = self.activation.forward(self.dense.forward(x));
        let x = self.dropout.forward(x);
        self.output.forward(x)
    }

    /// Class probabilities, each row sums to 1.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward_logits(images), 1)
    }

    /// Categorical cross-entropy plus the L2 penalty on the hidden dense kernel.
    pub(crate) fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> StepOutput<B> {
        let logits = self.forward_logits(images);
        let cross_entropy = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits.clone(), targets.clone());
        let penalty = self.dense.weight.val().powf_scalar(2.0).sum().mul_scalar(self.l2);
        StepOutput {
            loss: cross_entropy + penalty,
            output: softmax(logits, 1),
            targets,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.output.weight.dims()[1]
    }

    /// Replaces the backbone weights with a torchvision VGG16 checkpoint.
    pub fn load_pretrained(mut self, path: &Path, device: &B::Device) -> Result<Self> {
        let layout = self
            .backbone
            .blocks
            .iter()
            .map(|block| {
                let width = block.convs.first().map_or(0, |conv| conv.weight.dims()[0]);
                (block.convs.len(), width)
            })
            .collect::<Vec<_>>();
        let expected = VGG16_CONVS.into_iter().zip(VGG16_WIDTHS).collect::<Vec<_>>();
        if layout != expected {
            return Err(LesionError::ShapeMismatch {
                expected: VGG16_WIDTHS.to_vec(),
                found: layout.into_iter().map(|(_, width)| width).collect(),
            });
        }
        let record = weights::load_vgg16::<B>(path, &VGG16_CONVS, device)?;
        self.backbone = self.backbone.load_record(record);
        Ok(self.freeze())
    }

    /// Stops gradient flow into the first `frozen_layers` entries of the layer table.
    fn freeze(mut self) -> Self {
        let mut index = 1; // 0 is the input layer
        let mut blocks = Vec::with_capacity(self.backbone.blocks.len());
        for mut block in self.backbone.blocks {
            let mut convs = Vec::with_capacity(block.convs.len());
            for conv in block.convs {
                convs.push(match index < self.frozen_layers {
                    true => conv.no_grad(),
                    false => conv,
                });
                index += 1;
            }
            block.convs = convs;
            blocks.push(block);
            index += 1;
        }
        self.backbone.blocks = blocks;
        self
    }

    /// Layers in Keras order: input, backbone convs and pools, then the head.
    pub fn layers(&self) -> Vec<LayerInfo> {
        let mut layers = vec![LayerInfo::new("input", LayerKind::Input, 0)];
        for (b, block) in self.backbone.blocks.iter().enumerate() {
            for (c, conv) in block.convs.iter().enumerate() {
                layers.push(LayerInfo::new(
                    format!("block{}_conv{}", b + 1, c + 1),
                    LayerKind::Conv2d,
                    conv.num_params(),
                ));
            }
            layers.push(LayerInfo::new(
                format!("block{}_pool", b + 1),
                LayerKind::MaxPool2d,
                0,
            ));
        }
        for (index, layer) in layers.iter_mut().enumerate() {
            layer.trainable = index >= self.frozen_layers;
        }
        layers.extend([
            LayerInfo::new("global_average_pooling", LayerKind::GlobalAveragePooling, 0),
            LayerInfo::new("dense", LayerKind::Dense, self.dense.num_params()),
            LayerInfo::new("dropout", LayerKind::Dropout, 0),
            LayerInfo::new("predictions", LayerKind::Dense, self.output.num_params()),
        ]);
        layers
    }

    pub fn summary(&self) -> Summary {
        Summary {
            layers: self.layers(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Input,
    Conv2d,
    MaxPool2d,
    GlobalAveragePooling,
    Dense,
    Dropout,
}

#[derive(Debug, Clone)]
pub struct LayerInfo {
    pub name: String,
    pub kind: LayerKind,
    pub params: usize,
    pub trainable: bool,
}

impl LayerInfo {
    fn new(name: impl Into<String>, kind: LayerKind, params: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            params,
            trainable: true,
        }
    }
}

pub struct Summary {
    layers: Vec<LayerInfo>,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<26}{:<24}{:>12}  trainable", "Layer", "Kind", "Params")?;
        for layer in &self.layers {
            writeln!(
                f,
                "{:<26}{:<24}{:>12}  {}",
                layer.name,
                format!("{:?}", layer.kind),
                layer.params,
                layer.trainable
            )?;
        }
        let total = self.layers.iter().map(|l| l.params).sum::<usize>();
        let trainable = self
            .layers
            .iter()
            .filter(|l| l.trainable)
            .map(|l| l.params)
            .sum::<usize>();
        writeln!(f, "Total params: {total}")?;
        writeln!(f, "Trainable params: {trainable}")?;
        write!(f, "Non-trainable params: {}", total - trainable)
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 3)]
    num_classes: usize,
    /// Output channels of each backbone block
    #[config(default = "vec![64, 128, 256, 512, 512]")]
    widths: Vec<usize>,
    /// Number of 3x3 convolutions in each backbone block
    #[config(default = "vec![2, 2, 3, 3, 3]")]
    convs: Vec<usize>,
    #[config(default = 512)]
    hidden_size: usize,
    #[config(default = 0.5)]
    dropout: f64,
    /// L2 penalty factor on the hidden dense kernel
    #[config(default = 0.001)]
    l2: f64,
    /// Leading layers (input included) excluded from training
    #[config(default = 15)]
    frozen_layers: usize,
}

impl ModelConfig {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        let mut channels = 3;
        let blocks = self
            .widths
            .iter()
            .zip(&self.convs)
            .map(|(&width, &n)| {
                let convs = (0..n)
                    .map(|i| {
                        let input = if i == 0 { channels } else { width };
                        Conv2dConfig::new([input, width], [3, 3])
                            .with_padding(PaddingConfig2d::Explicit(1, 1))
                            .init(device)
                    })
                    .collect();
                channels = width;
                VggBlock {
                    convs,
                    pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
                }
            })
            .collect();

        Model {
            backbone: Backbone {
                blocks,
                activation: Relu::new(),
            },
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dense: LinearConfig::new(channels, self.hidden_size).init(device),
            activation: Relu::new(),
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            l2: self.l2,
            frozen_layers: self.frozen_layers,
        }
        .freeze()
    }
}
