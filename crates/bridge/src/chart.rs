//! Line charts of one day's readings, rendered to SVG for mail attachments.

use anyhow::{anyhow, bail, Result};
use plotters::prelude::*;
use time::OffsetDateTime;

const WIDTH: u32 = 800;
const HEIGHT: u32 = 400;

pub struct Chart {
    pub filename: String,
    pub content_type: &'static str,
    pub data: Vec<u8>,
}

pub trait ChartRenderer: Send + Sync {
    /// Render `series` (timestamp, value) as a value-over-time chart.
    fn render(&self, title: &str, y_label: &str, series: &[(OffsetDateTime, i64)]) -> Result<Chart>;
}

pub struct SvgChartRenderer;

/// Hours since local midnight of the sample's own offset.
fn hour_of_day(ts: OffsetDateTime) -> f64 {
    let (h, m, s) = ts.to_hms();
    f64::from(h) + f64::from(m) / 60.0 + f64::from(s) / 3600.0
}

fn value_range(series: &[(OffsetDateTime, i64)]) -> (f64, f64) {
    let min = series.iter().map(|(_, v)| *v).min().unwrap_or(0) as f64;
    let max = series.iter().map(|(_, v)| *v).max().unwrap_or(0) as f64;
    let pad = ((max - min) * 0.1).max(1.0);
    (min - pad, max + pad)
}

fn draw_error<E: std::fmt::Display>(e: E) -> anyhow::Error {
    anyhow!("chart drawing failed: {e}")
}

impl ChartRenderer for SvgChartRenderer {
    fn render(&self, title: &str, y_label: &str, series: &[(OffsetDateTime, i64)]) -> Result<Chart> {
        if series.is_empty() {
            bail!("no samples to chart for {y_label}");
        }

        let (y_min, y_max) = value_range(series);
        let mut svg = String::new();
        {
            let root = SVGBackend::with_string(&mut svg, (WIDTH, HEIGHT)).into_drawing_area();
            root.fill(&WHITE).map_err(draw_error)?;

            let mut chart = ChartBuilder::on(&root)
                .caption(title, ("sans-serif", 20))
                .margin(10)
                .x_label_area_size(35)
                .y_label_area_size(50)
                .build_cartesian_2d(0f64..24f64, y_min..y_max)
                .map_err(draw_error)?;

            chart
                .configure_mesh()
                .x_desc("Time")
                .y_desc(y_label)
                .x_labels(13)
                .x_label_formatter(&|h| format!("{:02}:00", *h as u32))
                .draw()
                .map_err(draw_error)?;

            chart
                .draw_series(LineSeries::new(
                    series.iter().map(|(ts, v)| (hour_of_day(*ts), *v as f64)),
                    &BLUE,
                ))
                .map_err(draw_error)?;

            root.present().map_err(draw_error)?;
        }

        Ok(Chart {
            filename: format!("{}.svg", y_label.to_lowercase()),
            content_type: "image/svg+xml",
            data: svg.into_bytes(),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
