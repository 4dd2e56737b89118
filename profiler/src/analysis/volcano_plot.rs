use std::cmp::Ordering;
use std::error::Error;
use std::path::Path;

use plotters::coord::Shift;
use plotters::prelude::*;
use polars::prelude::*;
use tracing::{info, warn};

use crate::helper_functions::ensure_parent_dir;
use crate::models::{polars_err, require_columns};

/// Which columns to draw: a scatter of `x` against `y` with one panel per
/// (`row_facet`, `col_facet`) value pair, axes shared by all panels.
pub struct FacetScatter<'a> {
    pub x: &'a str,
    pub y: &'a str,
    pub row_facet: &'a str,
    pub col_facet: &'a str,
}

struct Point {
    row: usize,
    col: usize,
    x: f64,
    y: f64,
}

/// Numbers sort numerically (`3` before `14`), anything else lexically after.
fn facet_order(a: &String, b: &String) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn facet_levels(df: &DataFrame, column: &str) -> PolarsResult<Vec<String>> {
    let values = df.column(column)?.cast(&DataType::String)?;
    let mut levels: Vec<String> = values
        .str()?
        .into_iter()
        .flatten()
        .map(|v| v.to_string())
        .collect();
    levels.sort_by(facet_order);
    levels.dedup();
    Ok(levels)
}

fn padded(min: f64, max: f64) -> (f64, f64) {
    if (max - min).abs() < 1e-9 {
        return (min - 1.0, max + 1.0);
    }
    let pad = (max - min) * 0.05;
    (min - pad, max + pad)
}

/// Draw the faceted scatter to `output_path`; `.svg` gives a vector file,
/// anything else a bitmap.
pub fn plot_facet_scatter(df: &DataFrame, layout: &FacetScatter, output_path: &Path) -> PolarsResult<()> {
    require_columns(df, &[layout.x, layout.y, layout.row_facet, layout.col_facet])?;

    let rows = facet_levels(df, layout.row_facet)?;
    let cols = facet_levels(df, layout.col_facet)?;
    if rows.is_empty() || cols.is_empty() {
        return Err(PolarsError::NoData("nothing to plot: facet columns are empty".into()));
    }

    let xs = df.column(layout.x)?.cast(&DataType::Float64)?;
    let ys = df.column(layout.y)?.cast(&DataType::Float64)?;
    let row_vals = df.column(layout.row_facet)?.cast(&DataType::String)?;
    let col_vals = df.column(layout.col_facet)?.cast(&DataType::String)?;
    let (xs, ys) = (xs.f64()?, ys.f64()?);
    let (row_vals, col_vals) = (row_vals.str()?, col_vals.str()?);

    let mut points = Vec::with_capacity(df.height());
    let mut skipped = 0usize;
    for i in 0..df.height() {
        match (xs.get(i), ys.get(i), row_vals.get(i), col_vals.get(i)) {
            (Some(x), Some(y), Some(r), Some(c)) if x.is_finite() && y.is_finite() => {
                let row = rows.iter().position(|v| v == r).unwrap_or(0);
                let col = cols.iter().position(|v| v == c).unwrap_or(0);
                points.push(Point { row, col, x, y });
            }
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!("Skipped {} rows with missing `{}`/`{}` values", skipped, layout.x, layout.y);
    }

    ensure_parent_dir(output_path)?;
    let size = (320 * cols.len() as u32 + 80, 280 * rows.len() as u32 + 60);
    let is_svg = output_path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("svg"))
        .unwrap_or(false);

    let result = if is_svg {
        let root = SVGBackend::new(output_path, size).into_drawing_area();
        draw_panels(root, layout, &rows, &cols, &points)
    } else {
        let root = BitMapBackend::new(output_path, size).into_drawing_area();
        draw_panels(root, layout, &rows, &cols, &points)
    };
    result.map_err(polars_err)?;

    info!("Saved {} points to {}", points.len(), output_path.display());
    Ok(())
}

fn draw_panels<DB: DrawingBackend>(
    root: DrawingArea<DB, Shift>,
    layout: &FacetScatter,
    rows: &[String],
    cols: &[String],
    points: &[Point],
) -> Result<(), Box<dyn Error>>
where
    DB::ErrorType: 'static,
{
    root.fill(&WHITE)?;

    let (x_lo, x_hi) = padded(
        points.iter().map(|p| p.x).fold(f64::INFINITY, f64::min),
        points.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max),
    );
    let (y_lo, y_hi) = padded(
        points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min).min(0.0),
        points.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max),
    );
    // An empty point set leaves infinite bounds behind.
    let (x_lo, x_hi) = if x_lo.is_finite() && x_hi.is_finite() { (x_lo, x_hi) } else { (-1.0, 1.0) };
    let (y_lo, y_hi) = if y_lo.is_finite() && y_hi.is_finite() { (y_lo, y_hi) } else { (0.0, 1.0) };

    let panels = root.split_evenly((rows.len(), cols.len()));
    for (r, row_level) in rows.iter().enumerate() {
        for (c, col_level) in cols.iter().enumerate() {
            let panel = &panels[r * cols.len() + c];
            let caption = format!(
                "{}={} | {}={}",
                layout.row_facet, row_level, layout.col_facet, col_level
            );

            let mut chart = ChartBuilder::on(panel)
                .caption(caption, ("sans-serif", 14))
                .margin(8)
                .x_label_area_size(30)
                .y_label_area_size(40)
                .build_cartesian_2d(x_lo..x_hi, y_lo..y_hi)?;

            chart
                .configure_mesh()
                .x_desc(layout.x)
                .y_desc(layout.y)
                .label_style(("sans-serif", 11))
                .draw()?;

            chart.draw_series(
                points
                    .iter()
                    .filter(|p| p.row == r && p.col == c)
                    .map(|p| Circle::new((p.x, p.y), 2, BLACK.mix(0.6).filled())),
            )?;
        }
    }

    root.present()?;
    Ok(())
}
