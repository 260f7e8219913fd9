//! Sample window figures (SVG output)

use crate::data::{ExampleSet, FLARE};
use anyhow::{Context, Result};
use plotters::prelude::*;
use std::path::Path;

/// Plot up to `per_class` flare and non-flare windows as a grid of line charts
///
/// Flares are drawn in red on the top row, quiet windows in blue below.
pub fn plot_examples(path: &Path, examples: &ExampleSet, per_class: usize) -> Result<()> {
    let per_class = per_class.max(1);
    let root = SVGBackend::new(path, (300 * per_class as u32, 500)).into_drawing_area();
    root.fill(&WHITE).context("Failed to draw figure background")?;

    if examples.is_empty() {
        root.draw(&Text::new(
            "No examples",
            (150 * per_class as i32, 250),
            ("sans-serif", 20).into_font().color(&BLACK),
        ))?;
        root.present()?;
        return Ok(());
    }

    let flares: Vec<usize> = (0..examples.len())
        .filter(|&i| examples.labels[i] == FLARE)
        .take(per_class)
        .collect();
    let quiet: Vec<usize> = (0..examples.len())
        .filter(|&i| examples.labels[i] != FLARE)
        .take(per_class)
        .collect();

    let panels = root.split_evenly((2, per_class));
    for (row, (indices, color)) in [(&flares, RED), (&quiet, BLUE)].into_iter().enumerate() {
        for (col, &idx) in indices.iter().enumerate() {
            let area = &panels[row * per_class + col];
            draw_window(area, examples, idx, color)?;
        }
    }

    root.present()
        .with_context(|| format!("Failed to write figure {:?}", path))?;
    Ok(())
}

fn draw_window(
    area: &DrawingArea<SVGBackend<'_>, plotters::coord::Shift>,
    examples: &ExampleSet,
    idx: usize,
    color: RGBColor,
) -> Result<()> {
    let window = examples.window(idx);
    let finite = || window.iter().copied().filter(|v| v.is_finite());
    let lo = finite().fold(f32::INFINITY, f32::min);
    let hi = finite().fold(f32::NEG_INFINITY, f32::max);
    let (lo, hi) = if lo.is_finite() && hi > lo { (lo, hi) } else { (0.0, 2.0) };
    let pad = (hi - lo) * 0.05;

    let mut chart = ChartBuilder::on(area)
        .caption(
            format!("TIC {} @ {:.3}", examples.tic[idx], examples.center_time[idx]),
            ("sans-serif", 12),
        )
        .margin(8)
        .x_label_area_size(20)
        .y_label_area_size(35)
        .build_cartesian_2d(0..window.len(), (lo - pad)..(hi + pad))?;

    chart.configure_mesh().disable_mesh().draw()?;
    chart.draw_series(LineSeries::new(
        window
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .map(|(i, &v)| (i, v)),
        &color,
    ))?;
    Ok(())
}
