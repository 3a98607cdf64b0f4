//! Synthetic ATL11-like input stores for trying the pipeline end to end.
//!
//! Points are scattered around the Kamb Ice Stream. Each gets a base
//! height, a linear trend and some noise; samples go missing or get a
//! rejected quality flag at random, and a few points have no data at all.
use std::path::Path;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use atlxi_core::dataset::vars;
use atlxi_core::{Block, ChunkStore, DenseArray, StoreWriter};

const FIRST_CYCLE: u32 = 3;
const CYCLE_DAYS: f64 = 91.0;
const FIRST_CYCLE_OFFSET_DAYS: f64 = 270.0;
const DAY_S: f64 = 86_400.0;
const YEAR_S: f64 = 365.25 * DAY_S;

pub struct SynthParams {
    pub points: usize,
    pub cycles: usize,
    pub chunk_points: usize,
    pub seed: u64,
}

/// Per-variable blocks being assembled chunk by chunk.
#[derive(Default)]
struct Columns {
    ref_pt: Vec<Block>,
    longitude: Vec<Block>,
    latitude: Vec<Block>,
    h_corr: Vec<Block>,
    delta_time: Vec<Block>,
    quality: Vec<Block>,
}

pub fn write_store(output: &Path, p: &SynthParams) -> Result<ChunkStore> {
    anyhow::ensure!(p.chunk_points > 0, "--chunk-points must be positive");
    anyhow::ensure!(p.cycles > 0, "--cycles must be positive");

    let mut rng = StdRng::seed_from_u64(p.seed);
    let mut chunks = Vec::new();
    let mut left = p.points;
    while left > 0 {
        let n = left.min(p.chunk_points);
        chunks.push(n);
        left -= n;
    }

    let mut cols = Columns::default();
    let mut next_ref = 1u64;
    for &rows in &chunks {
        let mut ref_pt = Vec::with_capacity(rows);
        let mut lon = Vec::with_capacity(rows);
        let mut lat = Vec::with_capacity(rows);
        let mut h = Vec::with_capacity(rows * p.cycles);
        let mut t = Vec::with_capacity(rows * p.cycles);
        let mut q = Vec::with_capacity(rows * p.cycles);

        for _ in 0..rows {
            ref_pt.push(next_ref as f64);
            next_ref += rng.gen_range(1..4);
            lon.push(rng.gen_range(-153.0..-150.0));
            lat.push(rng.gen_range(-83.0..-82.0));

            let empty = rng.gen_bool(0.05);
            let base = rng.gen_range(200.0..900.0);
            // A third of the points barely move.
            let rate = if rng.gen_bool(1.0 / 3.0) {
                0.0
            } else {
                rng.gen_range(-2.0..1.0)
            };
            let noise = rng.gen_range(0.01..0.08);
            for c in 0..p.cycles {
                let dt = (FIRST_CYCLE_OFFSET_DAYS + c as f64 * CYCLE_DAYS + rng.gen_range(-1.0..1.0)) * DAY_S;
                let missing = empty || rng.gen_bool(0.1);
                t.push(dt);
                h.push(if missing {
                    f64::NAN
                } else {
                    base + rate * dt / YEAR_S + rng.gen_range(-noise..noise)
                });
                q.push(if rng.gen_bool(0.1) { 1.0 } else { 0.0 });
            }
        }

        cols.ref_pt.push(Block::new(rows, 1, ref_pt));
        cols.longitude.push(Block::new(rows, 1, lon));
        cols.latitude.push(Block::new(rows, 1, lat));
        cols.h_corr.push(Block::new(rows, p.cycles, h));
        cols.delta_time.push(Block::new(rows, p.cycles, t));
        cols.quality.push(Block::new(rows, p.cycles, q));
    }

    let cycles: Vec<u32> = (0..p.cycles as u32).map(|c| FIRST_CYCLE + c).collect();
    let mut w = StoreWriter::create(output, cycles, chunks)
        .with_context(|| format!("cannot create store at {}", output.display()))?;
    for (name, width, blocks) in [
        (vars::REF_PT, 1, &cols.ref_pt),
        (vars::LONGITUDE, 1, &cols.longitude),
        (vars::LATITUDE, 1, &cols.latitude),
        (vars::H_CORR, p.cycles, &cols.h_corr),
        (vars::DELTA_TIME, p.cycles, &cols.delta_time),
        (vars::QUALITY, p.cycles, &cols.quality),
    ] {
        w.write_dense(name, &DenseArray::from_blocks(width, blocks.iter()))
            .with_context(|| format!("writing {name}"))?;
    }
    w.set_attr("source", "synthetic");
    w.set_attr("seed", p.seed.to_string());
    w.finish().context("writing manifest")
}
