use ndarray::{Array3, Axis};

/// Indices of examples whose window contains no NaN
///
/// Returned indices are ascending. Apply the same list to data and labels.
pub fn nan_free_indices(data: &Array3<f32>) -> Vec<usize> {
    data.axis_iter(Axis(0))
        .enumerate()
        .filter(|(_, example)| !example.iter().any(|v| v.is_nan()))
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::random::seeded_rng;
    use rand::Rng;

    #[test]
    fn test_empty_input() {
        let data = Array3::<f32>::zeros((0, 200, 1));
        assert!(nan_free_indices(&data).is_empty());
    }

    #[test]
    fn test_all_clean() {
        let data = Array3::<f32>::ones((4, 10, 1));
        assert_eq!(nan_free_indices(&data), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_single_nan_excludes_example() {
        let mut data = Array3::<f32>::ones((3, 10, 1));
        data[[1, 9, 0]] = f32::NAN;
        assert_eq!(nan_free_indices(&data), vec![0, 2]);
    }

    #[test]
    fn test_sound_and_complete_on_random_arrays() {
        let mut rng = seeded_rng(7);

        for _ in 0..20 {
            let n = rng.gen_range(0..30);
            let mut data = Array3::<f32>::ones((n, 16, 1));
            for v in data.iter_mut() {
                if rng.gen_bool(0.01) {
                    *v = f32::NAN;
                }
            }

            let keep = nan_free_indices(&data);
            for i in 0..n {
                let has_nan = data.index_axis(Axis(0), i).iter().any(|v| v.is_nan());
                assert_eq!(keep.contains(&i), !has_nan, "index {} misclassified", i);
            }
            assert!(keep.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
