//! Grid lookups: interpolation for DEMs, membership for masks.
//!
//! Grids are georeferenced by the centre of their first cell (`x_min`,
//! `y_max`) and a square `resolution`; rows run north to south. Points are
//! given in the grid's own projection.

use super::GridMeta;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Point sets at least this large are sampled in parallel
const PARALLEL_THRESHOLD: usize = 4096;

/// A location in the dataset's projection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Zip parallel x and y arrays into points
    pub fn zip(xs: &[f64], ys: &[f64]) -> Vec<Point> {
        xs.iter().zip(ys).map(|(x, y)| Point::new(*x, *y)).collect()
    }
}

/// Interpolation method for elevation grids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    #[default]
    Linear,
    Nearest,
}

/// Sample the grid at every point. Points outside the grid, or touching a
/// void cell, yield NaN.
pub(crate) fn interpolate(
    meta: &GridMeta,
    values: &[f32],
    points: &[Point],
    method: Interpolation,
) -> Vec<f64> {
    let sample = |p: &Point| match method {
        Interpolation::Linear => bilinear(meta, values, p),
        Interpolation::Nearest => nearest(meta, values, p),
    };
    if points.len() >= PARALLEL_THRESHOLD {
        points.par_iter().map(sample).collect()
    } else {
        points.iter().map(sample).collect()
    }
}

/// Membership of each point in the mask. A cell belongs to the mask when its
/// category is one of `basins`, or is positive when no basins are given.
pub(crate) fn membership(
    meta: &GridMeta,
    values: &[f32],
    points: &[Point],
    basins: Option<&[i32]>,
) -> Vec<bool> {
    let test = |p: &Point| {
        let Some((row, col)) = fractional_index(meta, p) else {
            return false;
        };
        let Some(value) = cell(meta, values, row.round() as usize, col.round() as usize) else {
            return false;
        };
        let category = value.round() as i32;
        match basins {
            Some(basins) => basins.contains(&category),
            None => category > 0,
        }
    };
    if points.len() >= PARALLEL_THRESHOLD {
        points.par_iter().map(test).collect()
    } else {
        points.iter().map(test).collect()
    }
}

fn fractional_index(meta: &GridMeta, p: &Point) -> Option<(f64, f64)> {
    if meta.rows == 0 || meta.cols == 0 || meta.resolution <= 0.0 {
        return None;
    }
    let col = (p.x - meta.x_min) / meta.resolution;
    let row = (meta.y_max - p.y) / meta.resolution;
    if !col.is_finite() || !row.is_finite() {
        return None;
    }
    if col < 0.0 || row < 0.0 || col > (meta.cols - 1) as f64 || row > (meta.rows - 1) as f64 {
        return None;
    }
    Some((row, col))
}

fn cell(meta: &GridMeta, values: &[f32], row: usize, col: usize) -> Option<f64> {
    let value = *values.get(row * meta.cols + col)?;
    if value.is_nan() || meta.nodata == Some(value) {
        None
    } else {
        Some(value as f64)
    }
}

fn nearest(meta: &GridMeta, values: &[f32], p: &Point) -> f64 {
    fractional_index(meta, p)
        .and_then(|(row, col)| cell(meta, values, row.round() as usize, col.round() as usize))
        .unwrap_or(f64::NAN)
}

fn bilinear(meta: &GridMeta, values: &[f32], p: &Point) -> f64 {
    let Some((row, col)) = fractional_index(meta, p) else {
        return f64::NAN;
    };
    let r0 = row.floor() as usize;
    let c0 = col.floor() as usize;
    let r1 = (r0 + 1).min(meta.rows - 1);
    let c1 = (c0 + 1).min(meta.cols - 1);
    let fr = row - r0 as f64;
    let fc = col - c0 as f64;

    let corners = (
        cell(meta, values, r0, c0),
        cell(meta, values, r0, c1),
        cell(meta, values, r1, c0),
        cell(meta, values, r1, c1),
    );
    match corners {
        (Some(v00), Some(v01), Some(v10), Some(v11)) => {
            v00 * (1.0 - fr) * (1.0 - fc)
                + v01 * (1.0 - fr) * fc
                + v10 * fr * (1.0 - fc)
                + v11 * fr * fc
        }
        _ => f64::NAN,
    }
}
