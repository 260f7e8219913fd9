use crate::evaluate::{predict_windows, ConfusionMatrix, DEFAULT_THRESHOLD};
use crate::model::architecture::FlareCnn;
use anyhow::{anyhow, Context, Result};
use burn::prelude::*;
use ndarray::{Array1, Array3};
use plotters::prelude::*;
use std::path::Path;
use tracing::info;

const CLASS_NAMES: [&str; 2] = ["No Flare", "Flare"];

/// Predict on `data`, threshold at 0.5 and draw the row-normalized confusion
/// matrix to `path`
pub fn plot_confusion_matrix<B: Backend>(
    model: &FlareCnn<B>,
    data: &Array3<f32>,
    labels: &Array1<u8>,
    path: &Path,
    device: &B::Device,
) -> Result<ConfusionMatrix> {
    let probabilities = predict_windows(model, data, 256, device)?;
    let labels = labels.as_slice().ok_or_else(|| anyhow!("Labels are not contiguous"))?;
    let matrix = ConfusionMatrix::from_predictions(&probabilities, labels, DEFAULT_THRESHOLD)?;

    render_confusion_matrix(&matrix, path)?;
    Ok(matrix)
}

/// Draw an annotated heatmap of the normalized matrix
pub fn render_confusion_matrix(matrix: &ConfusionMatrix, path: &Path) -> Result<()> {
    let normalized = matrix.normalized();

    let root = SVGBackend::new(path, (520, 480)).into_drawing_area();
    root.fill(&WHITE).context("Failed to draw figure background")?;

    // Integer ranges are inclusive as discrete coordinates: 0..1 is two cells
    let mut chart = ChartBuilder::on(&root)
        .caption("Confusion matrix", ("sans-serif", 22))
        .margin(20)
        .x_label_area_size(50)
        .y_label_area_size(90)
        .build_cartesian_2d((0..1).into_segmented(), (0..1).into_segmented())?;

    // Row 0 (true "No Flare") is drawn at the top.
    let class_at = |v: &SegmentValue<i32>| match v {
        SegmentValue::CenterOf(idx) => CLASS_NAMES.get(*idx as usize).copied().unwrap_or(""),
        _ => "",
    };
    chart
        .configure_mesh()
        .disable_mesh()
        .x_labels(2)
        .y_labels(2)
        .x_desc("Predicted label")
        .y_desc("True label")
        .x_label_formatter(&|x| class_at(x).to_string())
        .y_label_formatter(&|y| match y {
            SegmentValue::CenterOf(idx) => class_at(&SegmentValue::CenterOf(1 - idx)).to_string(),
            _ => String::new(),
        })
        .draw()?;

    for (actual, row) in normalized.iter().enumerate() {
        let y = 1 - actual as i32;
        for (predicted, &value) in row.iter().enumerate() {
            let x = predicted as i32;
            chart.draw_series(std::iter::once(Rectangle::new(
                [
                    (SegmentValue::Exact(x), SegmentValue::Exact(y)),
                    (SegmentValue::Exact(x + 1), SegmentValue::Exact(y + 1)),
                ],
                cell_color(value).filled(),
            )))?;

            let text_color = if value > 0.5 { WHITE } else { BLACK };
            chart.draw_series(std::iter::once(
                EmptyElement::at((SegmentValue::CenterOf(x), SegmentValue::CenterOf(y)))
                    + Text::new(
                        format!("{:.2}", value),
                        (-22, -12),
                        ("sans-serif", 24).into_font().color(&text_color),
                    ),
            ))?;
        }
    }

    root.present()
        .with_context(|| format!("Failed to write confusion matrix {:?}", path))?;
    info!("Saved confusion matrix to {:?}", path);
    Ok(())
}

/// White (0) to dark blue (1)
fn cell_color(value: f64) -> RGBColor {
    let v = value.clamp(0.0, 1.0);
    RGBColor(
        (247.0 - 239.0 * v) as u8,
        (251.0 - 203.0 * v) as u8,
        (255.0 - 148.0 * v) as u8,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::architecture::init_model;
    use crate::model::ModelConfig;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_cell_color_ramp() {
        assert_eq!(cell_color(0.0), RGBColor(247, 251, 255));
        assert_eq!(cell_color(1.0), RGBColor(8, 48, 107));
        assert_eq!(cell_color(2.0), cell_color(1.0));
    }

    /// Contents of every `<text>` node
    fn svg_texts(svg: &str) -> Vec<String> {
        svg.split("<text")
            .skip(1)
            .filter_map(|node| {
                let body = &node[node.find('>')? + 1..];
                Some(body[..body.find("</text>")?].trim().to_string())
            })
            .collect()
    }

    #[test]
    fn test_render_confusion_matrix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("confusion.svg");
        let matrix = ConfusionMatrix {
            counts: [[8, 2], [0, 0]],
        };

        render_confusion_matrix(&matrix, &path).unwrap();
        let svg = std::fs::read_to_string(&path).unwrap();
        assert!(svg.contains("0.80"));
        assert!(svg.contains("0.20"));
    }

    #[test]
    fn test_every_class_is_labelled_on_both_axes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("confusion.svg");
        let matrix = ConfusionMatrix {
            counts: [[9, 1], [2, 8]],
        };

        render_confusion_matrix(&matrix, &path).unwrap();
        let texts = svg_texts(&std::fs::read_to_string(&path).unwrap());

        let count = |label: &str| texts.iter().filter(|t| t.as_str() == label).count();
        assert_eq!(count("No Flare"), 2);
        assert_eq!(count("Flare"), 2);
        for value in ["0.90", "0.10", "0.20", "0.80"] {
            assert_eq!(count(value), 1, "missing cell {}", value);
        }
    }

    #[test]
    fn test_plot_confusion_matrix_from_model() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cm.svg");
        let device = <TestBackend as Backend>::Device::default();
        let model = init_model::<TestBackend>(&ModelConfig::flare_default().with_cadences(16), &device);

        let data = Array3::<f32>::ones((4, 16, 1));
        let labels = Array1::from(vec![0u8, 1, 0, 1]);
        let matrix = plot_confusion_matrix(&model, &data, &labels, &path, &device).unwrap();

        assert_eq!(matrix.total(), 4);
        assert!(path.exists());
    }
}
