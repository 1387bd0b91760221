//! 3-axis Rotary Position Embedding (RoPE) for Lumina
//!
//! Every token carries a position id on three axes: caption position, patch
//! row and patch column. Each axis owns a slice of the head dimension, and the
//! rotation for a token is the concatenation of the per-axis rotations.
//!
//! The angle tables are pure functions of the configuration, so they are built
//! once on the host and shared by every forward pass. Lookups gather rows into
//! flat host buffers ([`RotaryRows`]) which the packer slices by per-sample
//! offsets before a single upload to the device ([`RotaryFreqs`]).

use burn::prelude::*;

use crate::error::{LuminaError, Result};

/// Number of position axes: caption position, row, column
pub const NUM_AXES: usize = 3;

/// Precomputed per-axis cos/sin tables
///
/// Axis `i` holds `[axes_lens[i], axes_dims[i] / 2]` entries. Entry `(p, k)`
/// is the unit complex number at angle `p * theta^(-2k / axes_dims[i])`,
/// stored as its real (cos) and imaginary (sin) parts.
///
/// Note: This is not a Module as it has no learnable parameters.
#[derive(Debug, Clone)]
pub struct RotaryPositionTable {
    axes_dims: [usize; NUM_AXES],
    axes_lens: [usize; NUM_AXES],
    /// Row-major `[len, dim / 2]` per axis
    cos: [Vec<f32>; NUM_AXES],
    sin: [Vec<f32>; NUM_AXES],
}

impl RotaryPositionTable {
    /// Build the tables for every axis
    ///
    /// # Arguments
    /// * `axes_dims` - Rotary dimension per axis (each must be even)
    /// * `axes_lens` - Number of positions per axis
    /// * `theta` - Base frequency (default: 10000.0)
    pub fn new(
        axes_dims: [usize; NUM_AXES],
        axes_lens: [usize; NUM_AXES],
        theta: f64,
    ) -> Result<Self> {
        if let Some(axis) = axes_dims.iter().position(|d| d % 2 != 0) {
            return Err(LuminaError::InvalidConfig(format!(
                "rotary axis {} has odd dimension {}",
                axis, axes_dims[axis]
            )));
        }

        let mut cos: [Vec<f32>; NUM_AXES] = Default::default();
        let mut sin: [Vec<f32>; NUM_AXES] = Default::default();

        for axis in 0..NUM_AXES {
            let dim = axes_dims[axis];
            let half = dim / 2;
            // Frequencies and angles in f64, rounded once to f32
            let freqs: Vec<f64> = (0..half)
                .map(|k| 1.0 / theta.powf((2 * k) as f64 / dim as f64))
                .collect();

            let mut axis_cos = Vec::with_capacity(axes_lens[axis] * half);
            let mut axis_sin = Vec::with_capacity(axes_lens[axis] * half);
            for p in 0..axes_lens[axis] {
                for freq in &freqs {
                    let angle = (p as f64 * freq) as f32;
                    axis_cos.push(angle.cos());
                    axis_sin.push(angle.sin());
                }
            }
            cos[axis] = axis_cos;
            sin[axis] = axis_sin;
        }

        Ok(Self {
            axes_dims,
            axes_lens,
            cos,
            sin,
        })
    }

    /// Per-axis rotary dimensions
    pub fn axes_dims(&self) -> [usize; NUM_AXES] {
        self.axes_dims
    }

    /// Per-axis table lengths
    pub fn axes_lens(&self) -> [usize; NUM_AXES] {
        self.axes_lens
    }

    /// Shape of the table for one axis: `[len, dim / 2]`
    pub fn axis_shape(&self, axis: usize) -> [usize; 2] {
        [self.axes_lens[axis], self.axes_dims[axis] / 2]
    }

    /// Width of a combined rotation: `sum(axes_dims) / 2`
    pub fn rotation_dim(&self) -> usize {
        self.axes_dims.iter().map(|d| d / 2).sum()
    }
}

/// Integer position ids for a padded batch, `[batch, seq_len, 3]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionIds {
    batch: usize,
    seq_len: usize,
    ids: Vec<[usize; NUM_AXES]>,
}

impl PositionIds {
    /// All-zero ids (the value padding tokens keep)
    pub fn zeros(batch: usize, seq_len: usize) -> Self {
        Self {
            batch,
            seq_len,
            ids: vec![[0; NUM_AXES]; batch * seq_len],
        }
    }

    /// Batch size and padded sequence length
    pub fn dims(&self) -> [usize; 2] {
        [self.batch, self.seq_len]
    }

    /// Position id of token `pos` in sample `sample`
    pub fn get(&self, sample: usize, pos: usize) -> [usize; NUM_AXES] {
        self.ids[sample * self.seq_len + pos]
    }

    /// Overwrite the position id of one token
    pub fn set(&mut self, sample: usize, pos: usize, id: [usize; NUM_AXES]) {
        self.ids[sample * self.seq_len + pos] = id;
    }
}

/// Gathers rotations for position ids from a shared table
#[derive(Debug, Clone)]
pub struct RotaryEmbedder {
    table: RotaryPositionTable,
}

impl RotaryEmbedder {
    pub fn new(table: RotaryPositionTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &RotaryPositionTable {
        &self.table
    }

    /// Gather and concatenate per-axis rotations for every token
    ///
    /// Returns host rows of shape `[batch, seq_len, sum(axes_dims) / 2]`.
    /// Positions outside an axis table are rejected before any gather.
    pub fn gather(&self, ids: &PositionIds) -> Result<RotaryRows> {
        let [batch, seq_len] = ids.dims();
        let width = self.table.rotation_dim();
        let mut rows = RotaryRows::zeros(batch, seq_len, width);

        for (token, id) in ids.ids.iter().enumerate() {
            let mut offset = token * width;
            for axis in 0..NUM_AXES {
                let [len, half] = self.table.axis_shape(axis);
                let position = id[axis];
                if position >= len {
                    return Err(LuminaError::PositionOutOfRange {
                        axis,
                        position,
                        limit: len,
                    });
                }
                let src = position * half..(position + 1) * half;
                rows.cos[offset..offset + half].copy_from_slice(&self.table.cos[axis][src.clone()]);
                rows.sin[offset..offset + half].copy_from_slice(&self.table.sin[axis][src]);
                offset += half;
            }
        }

        Ok(rows)
    }
}

/// Host-side rotations for a padded batch, `[batch, seq_len, width]`
#[derive(Debug, Clone, PartialEq)]
pub struct RotaryRows {
    batch: usize,
    seq_len: usize,
    width: usize,
    cos: Vec<f32>,
    sin: Vec<f32>,
}

impl RotaryRows {
    /// Zero rows (the value of padded slots)
    pub fn zeros(batch: usize, seq_len: usize, width: usize) -> Self {
        Self {
            batch,
            seq_len,
            width,
            cos: vec![0.0; batch * seq_len * width],
            sin: vec![0.0; batch * seq_len * width],
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.batch, self.seq_len, self.width]
    }

    /// `(cos, sin)` of one token
    pub fn row(&self, sample: usize, pos: usize) -> (&[f32], &[f32]) {
        let start = (sample * self.seq_len + pos) * self.width;
        let range = start..start + self.width;
        (&self.cos[range.clone()], &self.sin[range])
    }

    /// Copy `len` consecutive rows of every sample into a new buffer of length
    /// `seq_len`, reading sample `i` from `src_start[i]` and writing at 0.
    /// Slots past each sample's `len[i]` stay zero.
    pub fn split(&self, seq_len: usize, src_start: &[usize], len: &[usize]) -> Self {
        let mut out = Self::zeros(self.batch, seq_len, self.width);
        for sample in 0..self.batch {
            let n = len[sample] * self.width;
            let src = (sample * self.seq_len + src_start[sample]) * self.width;
            let dst = sample * seq_len * self.width;
            out.cos[dst..dst + n].copy_from_slice(&self.cos[src..src + n]);
            out.sin[dst..dst + n].copy_from_slice(&self.sin[src..src + n]);
        }
        out
    }

    /// Upload to the device
    pub fn to_freqs<B: Backend>(&self, device: &B::Device) -> RotaryFreqs<B> {
        let shape = [self.batch, self.seq_len, self.width];
        RotaryFreqs {
            cos: Tensor::from_data(TensorData::new(self.cos.clone(), shape), device),
            sin: Tensor::from_data(TensorData::new(self.sin.clone(), shape), device),
        }
    }
}

/// Device-side rotations for a padded batch
#[derive(Debug, Clone)]
pub struct RotaryFreqs<B: Backend> {
    /// Real part [batch, seq_len, head_dim / 2]
    pub cos: Tensor<B, 3>,
    /// Imaginary part [batch, seq_len, head_dim / 2]
    pub sin: Tensor<B, 3>,
}

impl<B: Backend> RotaryFreqs<B> {
    /// Rotate consecutive feature pairs of `x` by the per-token angles
    ///
    /// Features `(2k, 2k + 1)` are treated as one complex number and
    /// multiplied by `cos_k + i sin_k`.
    ///
    /// # Arguments
    /// * `x` - Queries or keys [batch, seq_len, heads, head_dim]
    pub fn apply(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, seq, heads, dim] = x.dims();
        let half = dim / 2;

        let x = x.reshape([batch, seq, heads, half, 2]);
        let re = x
            .clone()
            .slice([0..batch, 0..seq, 0..heads, 0..half, 0..1])
            .reshape([batch, seq, heads, half]);
        let im = x
            .slice([0..batch, 0..seq, 0..heads, 0..half, 1..2])
            .reshape([batch, seq, heads, half]);

        // Broadcast over heads
        let cos = self.cos.clone().unsqueeze_dim::<4>(2);
        let sin = self.sin.clone().unsqueeze_dim::<4>(2);

        let re_rot = re.clone() * cos.clone() - im.clone() * sin.clone();
        let im_rot = re * sin + im * cos;

        Tensor::cat(
            vec![re_rot.unsqueeze_dim::<5>(4), im_rot.unsqueeze_dim::<5>(4)],
            4,
        )
        .reshape([batch, seq, heads, dim])
    }
}
