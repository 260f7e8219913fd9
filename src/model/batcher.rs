use crate::data::ExampleSet;
use burn::prelude::*;
use burn::tensor::TensorData;
use ndarray::Axis;

/// Model-ready tensors for a batch of example windows
#[derive(Debug, Clone)]
pub struct FlareBatch<B: Backend> {
    /// Shape [batch, 1, cadences]
    pub windows: Tensor<B, 3>,
    /// Shape [batch]
    pub targets: Tensor<B, 1, Int>,
}

/// Turns example rows into tensors on a device
#[derive(Debug, Clone)]
pub struct FlareBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> FlareBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    /// Batch of the examples at `indices`
    pub fn batch(&self, examples: &ExampleSet, indices: &[usize]) -> FlareBatch<B> {
        let cadences = examples.cadences();
        let selected = examples.data.select(Axis(0), indices);
        let flux: Vec<f32> = selected.iter().copied().collect();
        let targets: Vec<i64> = indices.iter().map(|&i| examples.labels[i] as i64).collect();

        FlareBatch {
            windows: windows_tensor(flux, indices.len(), cadences, &self.device),
            targets: Tensor::from_data(TensorData::new(targets, [indices.len()]), &self.device),
        }
    }
}

/// Pack flat windows of length `cadences` into a [n, 1, cadences] tensor
pub fn windows_tensor<B: Backend>(
    flux: Vec<f32>,
    n: usize,
    cadences: usize,
    device: &B::Device,
) -> Tensor<B, 3> {
    Tensor::from_data(TensorData::new(flux, [n, 1, cadences]), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_batch_shapes_and_order() {
        let set = ExampleSet::from_windows(
            3,
            vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0], vec![7.0, 8.0, 9.0]],
            vec![0, 1, 0],
            vec![1, 2, 3],
            vec![0.0, 1.0, 2.0],
        )
        .unwrap();

        let batcher = FlareBatcher::<TestBackend>::new(Default::default());
        let batch = batcher.batch(&set, &[1, 2]);

        assert_eq!(batch.windows.dims(), [2, 1, 3]);
        let flux: Vec<f32> = batch.windows.into_data().to_vec().unwrap();
        assert_eq!(flux, vec![4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);

        let targets: Vec<i64> = batch.targets.into_data().to_vec().unwrap();
        assert_eq!(targets, vec![1, 0]);
    }
}
