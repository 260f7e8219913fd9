use crate::model::ModelConfig;
use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::loss::BinaryCrossEntropyLossConfig;
use burn::nn::pool::{MaxPool1d, MaxPool1dConfig};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig1d, Relu};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;

/// 1-D convolutional flare classifier
///
/// `conv -> pool -> dropout -> conv -> pool -> dropout -> flatten -> dense ->
/// dropout -> dense`. The output is one logit per window.
#[derive(Module, Debug)]
pub struct FlareCnn<B: Backend> {
    conv1: Conv1d<B>,
    pool1: MaxPool1d,
    conv2: Conv1d<B>,
    pool2: MaxPool1d,
    dense: Linear<B>,
    output: Linear<B>,
    dropout: Dropout,
    activation: Relu,
}

/// Forward pass output with loss, for training and validation
#[derive(Debug)]
pub struct ClassificationOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    /// Logits, shape [batch]
    pub logits: Tensor<B, 1>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> FlareCnn<B> {
    /// Forward pass, input shape [batch, 1, cadences], logits [batch, 1]
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 2> {
        let x = self.activation.forward(self.conv1.forward(input));
        let x = self.dropout.forward(self.pool1.forward(x));

        let x = self.activation.forward(self.conv2.forward(x));
        let x = self.dropout.forward(self.pool2.forward(x));

        let x: Tensor<B, 2> = x.flatten(1, 2);
        let x = self.activation.forward(self.dense.forward(x));
        let x = self.dropout.forward(x);

        self.output.forward(x)
    }

    /// Forward pass with binary cross entropy against `targets`
    pub fn forward_classification(
        &self,
        input: Tensor<B, 3>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let logits: Tensor<B, 1> = self.forward(input).squeeze(1);

        let loss = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&logits.device())
            .forward(logits.clone(), targets.clone());

        ClassificationOutput { loss, logits, targets }
    }

    /// Flare probability per window, shape [batch]
    pub fn predict_proba(&self, input: Tensor<B, 3>) -> Tensor<B, 1> {
        sigmoid(self.forward(input)).squeeze(1)
    }
}

/// Initialize the flare CNN from configuration
pub fn init_model<B: Backend>(config: &ModelConfig, device: &B::Device) -> FlareCnn<B> {
    let conv1 = Conv1dConfig::new(1, config.conv1_filters, config.conv1_kernel)
        .with_padding(PaddingConfig1d::Same)
        .init(device);

    let conv2 = Conv1dConfig::new(config.conv1_filters, config.conv2_filters, config.conv2_kernel)
        .with_padding(PaddingConfig1d::Same)
        .init(device);

    let pool1 = MaxPool1dConfig::new(config.pool_size)
        .with_stride(config.pool_size)
        .init();
    let pool2 = MaxPool1dConfig::new(config.pool_size)
        .with_stride(config.pool_size)
        .init();

    let dense = LinearConfig::new(config.flatten_size(), config.dense_units)
        .with_bias(true)
        .init(device);

    let output = LinearConfig::new(config.dense_units, 1)
        .with_bias(true)
        .init(device);

    FlareCnn {
        conv1,
        pool1,
        conv2,
        pool2,
        dense,
        output,
        dropout: DropoutConfig::new(config.dropout).init(),
        activation: Relu::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_model_forward() {
        let device = <TestBackend as Backend>::Device::default();
        let config = ModelConfig::flare_default();
        let model = init_model::<TestBackend>(&config, &device);

        let input = Tensor::<TestBackend, 3>::zeros([2, 1, 200], &device);
        let output = model.forward(input);

        assert_eq!(output.dims(), [2, 1]);
    }

    #[test]
    fn test_model_predict_proba() {
        let device = <TestBackend as Backend>::Device::default();
        let config = ModelConfig::flare_default().with_cadences(64);
        let model = init_model::<TestBackend>(&config, &device);

        let input = Tensor::<TestBackend, 3>::ones([3, 1, 64], &device);
        let probabilities = model.predict_proba(input);
        assert_eq!(probabilities.dims(), [3]);

        let values: Vec<f32> = probabilities.into_data().to_vec().unwrap();
        assert!(values.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_forward_classification_loss() {
        let device = <TestBackend as Backend>::Device::default();
        let config = ModelConfig::flare_default().with_cadences(32);
        let model = init_model::<TestBackend>(&config, &device);

        let input = Tensor::<TestBackend, 3>::ones([4, 1, 32], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_data(
            TensorData::new(vec![1i64, 0, 1, 0], [4]),
            &device,
        );
        let output = model.forward_classification(input, targets);

        assert_eq!(output.logits.dims(), [4]);
        assert!(output.loss.into_scalar() > 0.0);
    }
}
