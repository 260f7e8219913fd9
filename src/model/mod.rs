pub mod architecture;
pub mod batcher;
pub mod checkpoint;

use burn::prelude::*;

use crate::data::DEFAULT_CADENCES;

/// Flare CNN configuration
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Input window length in cadences
    #[config(default = "200")]
    pub cadences: usize,

    /// Filters in the first convolution
    #[config(default = "16")]
    pub conv1_filters: usize,

    /// Kernel width of the first convolution
    #[config(default = "7")]
    pub conv1_kernel: usize,

    /// Filters in the second convolution
    #[config(default = "64")]
    pub conv2_filters: usize,

    /// Kernel width of the second convolution
    #[config(default = "3")]
    pub conv2_kernel: usize,

    /// Max-pooling window (and stride)
    #[config(default = "2")]
    pub pool_size: usize,

    /// Units in the hidden dense layer
    #[config(default = "32")]
    pub dense_units: usize,

    /// Dropout rate after each pooling and the hidden dense layer
    #[config(default = "0.1")]
    pub dropout: f64,
}

impl ModelConfig {
    /// Architecture used for TESS two-minute cadence flares
    pub fn flare_default() -> Self {
        Self::new()
            .with_cadences(DEFAULT_CADENCES)
            .with_conv1_filters(16)
            .with_conv1_kernel(7)
            .with_conv2_filters(64)
            .with_conv2_kernel(3)
            .with_pool_size(2)
            .with_dense_units(32)
            .with_dropout(0.1)
    }

    /// Length of the flattened feature vector feeding the dense layers
    pub fn flatten_size(&self) -> usize {
        let pooled = self.cadences / self.pool_size / self.pool_size;
        pooled * self.conv2_filters
    }

    /// Check the configuration describes a buildable network
    pub fn validate(&self) -> anyhow::Result<()> {
        use crate::utils::validation::{in_range, positive};

        positive(self.pool_size, "pool_size")?;
        positive(self.conv1_filters, "conv1_filters")?;
        positive(self.conv2_filters, "conv2_filters")?;
        positive(self.dense_units, "dense_units")?;
        in_range(self.dropout, 0.0, 0.99, "dropout")?;
        if self.conv1_kernel % 2 == 0 || self.conv2_kernel % 2 == 0 {
            anyhow::bail!("Convolution kernels must have odd width for same padding");
        }
        if self.flatten_size() == 0 {
            anyhow::bail!(
                "{} cadences are too short for two pooling layers of size {}",
                self.cadences,
                self.pool_size
            );
        }
        Ok(())
    }
}
