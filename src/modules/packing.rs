//! Variable-length packing of captions and images into one joint sequence
//!
//! Samples in a batch may carry captions of different valid lengths and images
//! of different sizes. The packer lays them out on the host first
//! ([`PackLayout`]): per-sample lengths, offsets, position ids and masks are
//! computed once into flat buffers. Device work is then a handful of `select`
//! gathers driven by those offsets, with no per-sample tensor resizing.
//!
//! Sequence layout per sample (left-aligned, zero tail):
//!
//! ```text
//! [ caption tokens (cap_len) | image tokens (img_len) | padding ]
//! ```

use burn::prelude::*;
use tracing::debug;

use super::embeddings::{patchify, unpatchify};
use super::rope::{PositionIds, RotaryEmbedder, RotaryFreqs, RotaryRows};
use crate::error::{LuminaError, Result};

/// Images entering or leaving the model
#[derive(Debug, Clone)]
pub enum ImageBatch<B: Backend> {
    /// Same-size images [batch, channels, height, width]
    Stacked(Tensor<B, 4>),
    /// Per-sample images [channels, height, width], sizes may differ
    List(Vec<Tensor<B, 3>>),
}

/// Shape convention of an [`ImageBatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Stacked,
    List,
}

impl<B: Backend> ImageBatch<B> {
    pub fn len(&self) -> usize {
        match self {
            Self::Stacked(x) => x.dims()[0],
            Self::List(images) => images.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mode(&self) -> OutputMode {
        match self {
            Self::Stacked(_) => OutputMode::Stacked,
            Self::List(_) => OutputMode::List,
        }
    }

    /// `[channels, height, width]` of every sample
    pub fn shapes(&self) -> Vec<[usize; 3]> {
        match self {
            Self::Stacked(x) => {
                let [batch, c, h, w] = x.dims();
                vec![[c, h, w]; batch]
            }
            Self::List(images) => images.iter().map(|x| x.dims()).collect(),
        }
    }

    /// Split into per-sample tensors
    pub fn into_images(self) -> Vec<Tensor<B, 3>> {
        match self {
            Self::Stacked(x) => {
                let [batch, c, h, w] = x.dims();
                (0..batch)
                    .map(|i| x.clone().slice([i..i + 1, 0..c, 0..h, 0..w]).reshape([c, h, w]))
                    .collect()
            }
            Self::List(images) => images,
        }
    }

    /// Stacked tensor; fails for an empty or heterogeneous list
    pub fn into_stacked(self) -> Result<Tensor<B, 4>> {
        match self {
            Self::Stacked(x) => Ok(x),
            Self::List(images) => {
                let first = images.first().ok_or(LuminaError::EmptyBatch)?.dims();
                if images.iter().any(|x| x.dims() != first) {
                    return Err(LuminaError::HeterogeneousBatch);
                }
                let [c, h, w] = first;
                if c * h * w == 0 {
                    // Nothing to concatenate
                    let device = images[0].device();
                    return Ok(Tensor::zeros([images.len(), c, h, w], &device));
                }
                let images = images.into_iter().map(|x| x.unsqueeze_dim::<4>(0)).collect();
                Ok(Tensor::cat(images, 0))
            }
        }
    }
}

/// Host-side bookkeeping for one packed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackLayout {
    patch_size: usize,
    /// Padded caption length shared by the batch
    cap_seq_len: usize,
    cap_lens: Vec<usize>,
    /// Pixel (height, width) per sample
    image_sizes: Vec<(usize, usize)>,
    /// Patch grid (rows, cols) per sample
    grids: Vec<(usize, usize)>,
    img_lens: Vec<usize>,
    /// Start of each sample's patches in the concatenated patch arena
    img_offsets: Vec<usize>,
    max_img_len: usize,
    max_seq_len: usize,
    mode: OutputMode,
}

impl PackLayout {
    /// Compute lengths and offsets for a batch
    ///
    /// # Arguments
    /// * `image_sizes` - Pixel (height, width) per sample
    /// * `cap_lens` - Number of valid caption tokens per sample
    /// * `cap_seq_len` - Padded caption length (every `cap_lens[i]` must fit)
    /// * `patch_size` - Side of a square patch
    /// * `mode` - Shape convention of the output
    pub fn new(
        image_sizes: Vec<(usize, usize)>,
        cap_lens: Vec<usize>,
        cap_seq_len: usize,
        patch_size: usize,
        mode: OutputMode,
    ) -> Result<Self> {
        if image_sizes.is_empty() {
            return Err(LuminaError::EmptyBatch);
        }
        if cap_lens.len() != image_sizes.len() || cap_lens.iter().any(|&len| len > cap_seq_len) {
            return Err(LuminaError::CaptionShapeMismatch {
                feat_batch: cap_lens.len(),
                feat_len: cap_seq_len,
                mask_batch: cap_lens.len(),
                mask_len: cap_lens.iter().copied().max().unwrap_or(0),
                images: image_sizes.len(),
            });
        }

        let mut grids = Vec::with_capacity(image_sizes.len());
        for (index, &(height, width)) in image_sizes.iter().enumerate() {
            if patch_size == 0 || height % patch_size != 0 || width % patch_size != 0 {
                return Err(LuminaError::PatchMisaligned {
                    index,
                    height,
                    width,
                    patch_size,
                });
            }
            grids.push((height / patch_size, width / patch_size));
        }

        let img_lens: Vec<usize> = grids.iter().map(|(rows, cols)| rows * cols).collect();
        let img_offsets = img_lens
            .iter()
            .scan(0, |offset, &len| {
                let start = *offset;
                *offset += len;
                Some(start)
            })
            .collect();
        let max_img_len = img_lens.iter().copied().max().unwrap_or(0);
        let max_seq_len = cap_lens
            .iter()
            .zip(&img_lens)
            .map(|(cap, img)| cap + img)
            .max()
            .unwrap_or(0);

        Ok(Self {
            patch_size,
            cap_seq_len,
            cap_lens,
            image_sizes,
            grids,
            img_lens,
            img_offsets,
            max_img_len,
            max_seq_len,
            mode,
        })
    }

    pub fn batch(&self) -> usize {
        self.cap_lens.len()
    }

    pub fn patch_size(&self) -> usize {
        self.patch_size
    }

    pub fn cap_seq_len(&self) -> usize {
        self.cap_seq_len
    }

    pub fn cap_lens(&self) -> &[usize] {
        &self.cap_lens
    }

    pub fn image_sizes(&self) -> &[(usize, usize)] {
        &self.image_sizes
    }

    pub fn grids(&self) -> &[(usize, usize)] {
        &self.grids
    }

    pub fn img_lens(&self) -> &[usize] {
        &self.img_lens
    }

    pub fn max_img_len(&self) -> usize {
        self.max_img_len
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Valid tokens of sample `i` in the joint sequence
    pub fn seq_len(&self, i: usize) -> usize {
        self.cap_lens[i] + self.img_lens[i]
    }

    /// Joint position ids `[batch, max_seq_len, 3]`
    ///
    /// Caption token j is `(j, 0, 0)`, image patch (r, c) is `(cap_len, r, c)`
    /// and padding stays `(0, 0, 0)`.
    pub fn position_ids(&self) -> PositionIds {
        let mut ids = PositionIds::zeros(self.batch(), self.max_seq_len);
        for (i, (&cap_len, &(_, cols))) in self.cap_lens.iter().zip(&self.grids).enumerate() {
            for j in 0..cap_len {
                ids.set(i, j, [j, 0, 0]);
            }
            for patch in 0..self.img_lens[i] {
                ids.set(i, cap_len + patch, [cap_len, patch / cols, patch % cols]);
            }
        }
        ids
    }

    /// Split the joint rotary rows into the caption slice (length
    /// `cap_seq_len`) and the image slice (length `max_img_len`)
    pub fn split_rotary(&self, joint: &RotaryRows) -> (RotaryRows, RotaryRows) {
        let zeros = vec![0; self.batch()];
        let caption = joint.split(self.cap_seq_len, &zeros, &self.cap_lens);
        let image = joint.split(self.max_img_len, &self.cap_lens, &self.img_lens);
        (caption, image)
    }

    /// Validity flags `[batch, max_img_len]` of the padded image tokens
    pub fn image_mask(&self) -> Vec<bool> {
        prefix_mask(&self.img_lens, self.max_img_len)
    }

    /// Validity flags `[batch, max_seq_len]` of the joint sequence
    pub fn joint_mask(&self) -> Vec<bool> {
        let lens: Vec<usize> = (0..self.batch()).map(|i| self.seq_len(i)).collect();
        prefix_mask(&lens, self.max_seq_len)
    }

    /// Rows of the patch arena forming the padded image batch
    ///
    /// Sample `i`, slot `j` reads arena row `img_offsets[i] + j`; padded slots
    /// read `pad_row`.
    pub fn image_gather_indices(&self, pad_row: usize) -> Vec<i64> {
        let mut indices = Vec::with_capacity(self.batch() * self.max_img_len);
        for (&offset, &len) in self.img_offsets.iter().zip(&self.img_lens) {
            indices.extend((0..self.max_img_len).map(|j| {
                if j < len {
                    (offset + j) as i64
                } else {
                    pad_row as i64
                }
            }));
        }
        indices
    }

    /// Rows of `[captions (batch * cap_seq_len) | images (batch * max_img_len) | pad]`
    /// forming the joint sequence
    ///
    /// # Arguments
    /// * `img_base` - First image row in the source
    /// * `pad_row` - A zero row in the source
    pub fn joint_gather_indices(&self, img_base: usize, pad_row: usize) -> Vec<i64> {
        let mut indices = Vec::with_capacity(self.batch() * self.max_seq_len);
        for i in 0..self.batch() {
            let cap_len = self.cap_lens[i];
            let seq_len = self.seq_len(i);
            indices.extend((0..self.max_seq_len).map(|pos| {
                let row = if pos < cap_len {
                    i * self.cap_seq_len + pos
                } else if pos < seq_len {
                    img_base + i * self.max_img_len + (pos - cap_len)
                } else {
                    pad_row
                };
                row as i64
            }));
        }
        indices
    }
}

fn prefix_mask(lens: &[usize], seq_len: usize) -> Vec<bool> {
    lens.iter()
        .flat_map(|&len| (0..seq_len).map(move |pos| pos < len))
        .collect()
}

fn bool_tensor<B: Backend>(flags: Vec<bool>, shape: [usize; 2], device: &B::Device) -> Tensor<B, 2, Bool> {
    Tensor::from_data(TensorData::new(flags, shape), device)
}

fn index_tensor<B: Backend>(indices: Vec<i64>, device: &B::Device) -> Tensor<B, 1, Int> {
    let len = indices.len();
    Tensor::from_data(TensorData::new(indices, [len]), device)
}

/// Count true entries per row of a `[batch, len]` mask
pub fn mask_lengths<B: Backend>(mask: Tensor<B, 2, Bool>) -> Result<Vec<usize>> {
    let [batch, len] = mask.dims();
    if len == 0 {
        return Ok(vec![0; batch]);
    }
    let counts = mask
        .int()
        .sum_dim(1)
        .reshape([batch])
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| LuminaError::TensorData(format!("{err:?}")))?;
    Ok(counts.into_iter().map(|n| n.max(0) as usize).collect())
}

/// Model stages the packer drives between its gathers
pub trait PackStages<B: Backend> {
    /// Project patch tokens [batch, n, p * p * C] to [batch, n, dim]
    fn embed_patches(&self, patches: Tensor<B, 3>) -> Tensor<B, 3>;

    /// Timestep-conditioned refinement of image tokens
    fn refine_image(
        &self,
        x: Tensor<B, 3>,
        mask: Tensor<B, 2, Bool>,
        freqs: &RotaryFreqs<B>,
        cond: Tensor<B, 2>,
    ) -> Tensor<B, 3>;

    /// Unconditioned refinement of caption tokens
    fn refine_caption(
        &self,
        x: Tensor<B, 3>,
        mask: Tensor<B, 2, Bool>,
        freqs: &RotaryFreqs<B>,
    ) -> Tensor<B, 3>;
}

/// A packed joint sequence ready for the main transformer stack
#[derive(Debug, Clone)]
pub struct PackedSequence<B: Backend> {
    /// Tokens [batch, max_seq_len, dim]
    pub tokens: Tensor<B, 3>,
    /// True for real tokens [batch, max_seq_len]
    pub mask: Tensor<B, 2, Bool>,
    /// Joint rotations [batch, max_seq_len, head_dim / 2]
    pub freqs: RotaryFreqs<B>,
    pub layout: PackLayout,
}

/// Packs captions and images into one sequence and unpacks model output
#[derive(Debug, Clone)]
pub struct SequencePacker {
    rope: RotaryEmbedder,
    patch_size: usize,
    in_channels: usize,
}

impl SequencePacker {
    pub fn new(rope: RotaryEmbedder, patch_size: usize, in_channels: usize) -> Self {
        Self {
            rope,
            patch_size,
            in_channels,
        }
    }

    pub fn rope(&self) -> &RotaryEmbedder {
        &self.rope
    }

    /// Check shapes and compute the layout of a batch
    pub fn layout<B: Backend>(
        &self,
        images: &ImageBatch<B>,
        cap_mask: Tensor<B, 2, Bool>,
    ) -> Result<PackLayout> {
        let shapes = images.shapes();
        if shapes.is_empty() {
            return Err(LuminaError::EmptyBatch);
        }
        for (index, &[channels, _, _]) in shapes.iter().enumerate() {
            if channels != self.in_channels {
                return Err(LuminaError::ChannelMismatch {
                    index,
                    expected: self.in_channels,
                    found: channels,
                });
            }
        }

        let [mask_batch, mask_len] = cap_mask.dims();
        if mask_batch != shapes.len() {
            return Err(LuminaError::CaptionShapeMismatch {
                feat_batch: mask_batch,
                feat_len: mask_len,
                mask_batch,
                mask_len,
                images: shapes.len(),
            });
        }

        let cap_lens = mask_lengths(cap_mask)?;
        let sizes = shapes.iter().map(|&[_, h, w]| (h, w)).collect();
        PackLayout::new(sizes, cap_lens, mask_len, self.patch_size, images.mode())
    }

    /// Pack a batch into one joint sequence
    ///
    /// # Arguments
    /// * `images` - Latent images, `in_channels` each
    /// * `cap_feats` - Embedded captions [batch, cap_seq_len, dim]
    /// * `cap_mask` - Caption validity [batch, cap_seq_len]
    /// * `cond` - Timestep conditioning [batch, adaln_dim]
    /// * `stages` - Patch embedding and refiners
    pub fn pack<B: Backend, S: PackStages<B>>(
        &self,
        images: ImageBatch<B>,
        cap_feats: Tensor<B, 3>,
        cap_mask: Tensor<B, 2, Bool>,
        cond: Tensor<B, 2>,
        stages: &S,
    ) -> Result<PackedSequence<B>> {
        let device = cap_feats.device();
        let [feat_batch, feat_len, dim] = cap_feats.dims();
        let [mask_batch, mask_len] = cap_mask.dims();
        if feat_batch != mask_batch || feat_len != mask_len || feat_batch != images.len() {
            return Err(LuminaError::CaptionShapeMismatch {
                feat_batch,
                feat_len,
                mask_batch,
                mask_len,
                images: images.len(),
            });
        }

        let layout = self.layout(&images, cap_mask.clone())?;
        if layout.max_seq_len() == 0 {
            return Err(LuminaError::EmptySequence);
        }
        let batch = layout.batch();
        debug!(
            batch,
            cap_seq_len = layout.cap_seq_len(),
            max_img_len = layout.max_img_len(),
            max_seq_len = layout.max_seq_len(),
            "packing batch"
        );

        let joint_rows = self.rope.gather(&layout.position_ids())?;
        let (cap_rows, img_rows) = layout.split_rotary(&joint_rows);

        // Sources for the joint gather, in row order: captions, images, pad
        let mut sources: Vec<Tensor<B, 2>> = Vec::with_capacity(3);
        let mut img_base = 0;

        if layout.cap_lens().iter().any(|&len| len > 0) {
            let captions = stages.refine_caption(cap_feats, cap_mask, &cap_rows.to_freqs(&device));
            sources.push(captions.reshape([batch * feat_len, dim]));
            img_base = batch * feat_len;
        }

        let max_img_len = layout.max_img_len();
        if max_img_len > 0 {
            let tokens = self.embed_images(images, &layout, stages, &device);
            let mask = bool_tensor(layout.image_mask(), [batch, max_img_len], &device);
            let refined = stages.refine_image(tokens, mask, &img_rows.to_freqs(&device), cond);
            sources.push(refined.reshape([batch * max_img_len, dim]));
        }

        let pad_row = sources.iter().map(|x| x.dims()[0]).sum();
        sources.push(Tensor::zeros([1, dim], &device));

        let indices = layout.joint_gather_indices(img_base, pad_row);
        let tokens = Tensor::cat(sources, 0)
            .select(0, index_tensor(indices, &device))
            .reshape([batch, layout.max_seq_len(), dim]);
        let mask = bool_tensor(layout.joint_mask(), [batch, layout.max_seq_len()], &device);

        Ok(PackedSequence {
            tokens,
            mask,
            freqs: joint_rows.to_freqs(&device),
            layout,
        })
    }

    /// Patchify every image into one arena, gather the padded batch and embed it
    fn embed_images<B: Backend, S: PackStages<B>>(
        &self,
        images: ImageBatch<B>,
        layout: &PackLayout,
        stages: &S,
        device: &B::Device,
    ) -> Tensor<B, 3> {
        let patch_dim = self.patch_size * self.patch_size * self.in_channels;
        let mut arena: Vec<Tensor<B, 2>> = images
            .into_images()
            .into_iter()
            .zip(layout.img_lens())
            .filter(|(_, &len)| len > 0)
            .map(|(image, _)| patchify(image, self.patch_size))
            .collect();

        let pad_row = layout.img_lens().iter().sum();
        arena.push(Tensor::zeros([1, patch_dim], device));

        let indices = layout.image_gather_indices(pad_row);
        let patches = Tensor::cat(arena, 0)
            .select(0, index_tensor(indices, device))
            .reshape([layout.batch(), layout.max_img_len(), patch_dim]);

        stages.embed_patches(patches)
    }

    /// Recover per-sample images from the joint output
    ///
    /// # Arguments
    /// * `output` - Patch features [batch, max_seq_len, p * p * out_channels]
    /// * `layout` - Layout returned by [`pack`](Self::pack)
    pub fn unpack<B: Backend>(&self, output: Tensor<B, 3>, layout: &PackLayout) -> Result<ImageBatch<B>> {
        let device = output.device();
        let [batch, seq_len, width] = output.dims();
        let p = layout.patch_size();
        let channels = width / (p * p);

        let mut images = Vec::with_capacity(batch);
        for i in 0..batch {
            let cap_len = layout.cap_lens()[i];
            let img_len = layout.img_lens()[i];
            let (height, image_width) = layout.image_sizes()[i];

            let image = if img_len == 0 {
                Tensor::zeros([channels, height, image_width], &device)
            } else {
                let tokens = output
                    .clone()
                    .slice([i..i + 1, cap_len..cap_len + img_len, 0..width])
                    .reshape([img_len, width]);
                unpatchify(tokens, layout.grids()[i], p, channels)
            };
            images.push(image);
        }
        debug!(batch, seq_len, channels, "unpacked batch");

        let images = ImageBatch::List(images);
        match layout.mode() {
            OutputMode::List => Ok(images),
            OutputMode::Stacked => images.into_stacked().map(ImageBatch::Stacked),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::rope::RotaryPositionTable;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    /// Patch features pass through untouched (requires dim == p * p * C)
    struct Identity;

    impl<B: Backend> PackStages<B> for Identity {
        fn embed_patches(&self, patches: Tensor<B, 3>) -> Tensor<B, 3> {
            patches
        }

        fn refine_image(
            &self,
            x: Tensor<B, 3>,
            _mask: Tensor<B, 2, Bool>,
            _freqs: &RotaryFreqs<B>,
            _cond: Tensor<B, 2>,
        ) -> Tensor<B, 3> {
            x
        }

        fn refine_caption(
            &self,
            x: Tensor<B, 3>,
            _mask: Tensor<B, 2, Bool>,
            _freqs: &RotaryFreqs<B>,
        ) -> Tensor<B, 3> {
            x
        }
    }

    fn packer(channels: usize) -> SequencePacker {
        let table = RotaryPositionTable::new([4, 6, 6], [32, 32, 32], 10000.0).unwrap();
        SequencePacker::new(RotaryEmbedder::new(table), 2, channels)
    }

    fn cap_mask(rows: &[&[bool]]) -> Tensor<TestBackend, 2, Bool> {
        let len = rows[0].len();
        let flags: Vec<bool> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_data(TensorData::new(flags, [rows.len(), len]), &Default::default())
    }

    fn mask_vec(mask: Tensor<TestBackend, 2, Bool>) -> Vec<bool> {
        mask.into_data().to_vec::<bool>().unwrap()
    }

    #[test]
    fn test_layout_single_sample() {
        let layout = PackLayout::new(vec![(4, 4)], vec![2], 4, 2, OutputMode::List).unwrap();

        assert_eq!(layout.img_lens(), &[4]);
        assert_eq!(layout.max_seq_len(), 6);
        assert_eq!(layout.joint_mask(), vec![true; 6]);

        let ids = layout.position_ids();
        assert_eq!(ids.get(0, 0), [0, 0, 0]);
        assert_eq!(ids.get(0, 1), [1, 0, 0]);
        assert_eq!(ids.get(0, 2), [2, 0, 0]);
        assert_eq!(ids.get(0, 3), [2, 0, 1]);
        assert_eq!(ids.get(0, 4), [2, 1, 0]);
        assert_eq!(ids.get(0, 5), [2, 1, 1]);
    }

    #[test]
    fn test_position_ids_deterministic() {
        let a = PackLayout::new(vec![(4, 6), (2, 2)], vec![3, 1], 5, 2, OutputMode::List).unwrap();
        let b = PackLayout::new(vec![(4, 6), (2, 2)], vec![3, 1], 5, 2, OutputMode::List).unwrap();
        assert_eq!(a.position_ids(), b.position_ids());
    }

    #[test]
    fn test_heterogeneous_layout() {
        let layout =
            PackLayout::new(vec![(4, 4), (2, 6)], vec![1, 3], 3, 2, OutputMode::List).unwrap();

        assert_eq!(layout.img_lens(), &[4, 3]);
        assert_eq!(layout.max_img_len(), 4);
        assert_eq!(layout.max_seq_len(), 6);

        let mask = layout.joint_mask();
        assert_eq!(&mask[0..6], &[true, true, true, true, true, false]);
        assert_eq!(&mask[6..12], &[true; 6]);

        assert_eq!(
            layout.image_mask(),
            vec![true, true, true, true, true, true, true, false]
        );
        // Second image is 1x3 patches: columns advance, row stays 0
        let ids = layout.position_ids();
        assert_eq!(ids.get(1, 3), [3, 0, 0]);
        assert_eq!(ids.get(1, 5), [3, 0, 2]);
        // Padding keeps zero ids
        assert_eq!(ids.get(0, 5), [0, 0, 0]);
    }

    #[test]
    fn test_gather_indices() {
        let layout =
            PackLayout::new(vec![(2, 4), (2, 2)], vec![1, 2], 2, 2, OutputMode::List).unwrap();
        // Arena: sample 0 rows 0..2, sample 1 row 2, pad row 3
        assert_eq!(layout.image_gather_indices(3), vec![0, 1, 2, 3]);
        // Captions rows 0..4, images rows 4..8, pad row 8
        assert_eq!(layout.joint_gather_indices(4, 8), vec![0, 4, 5, 2, 3, 6]);
    }

    #[test]
    fn test_misaligned_image_rejected() {
        let err = PackLayout::new(vec![(4, 4), (4, 5)], vec![1, 1], 1, 2, OutputMode::List).unwrap_err();
        assert_eq!(
            err,
            LuminaError::PatchMisaligned {
                index: 1,
                height: 4,
                width: 5,
                patch_size: 2
            }
        );
    }

    #[test]
    fn test_empty_batch_rejected() {
        let err = PackLayout::new(vec![], vec![], 0, 2, OutputMode::List).unwrap_err();
        assert_eq!(err, LuminaError::EmptyBatch);
    }

    #[test]
    fn test_zero_length_ranges() {
        let layout =
            PackLayout::new(vec![(0, 4), (2, 2)], vec![0, 0], 3, 2, OutputMode::List).unwrap();
        assert_eq!(layout.img_lens(), &[0, 1]);
        assert_eq!(layout.max_seq_len(), 1);
        assert_eq!(layout.joint_mask(), vec![false, true]);
        assert_eq!(layout.image_gather_indices(1), vec![1, 0]);
    }

    #[test]
    fn test_mask_lengths_counts_true_entries() {
        let mask = cap_mask(&[&[true, true, false, false], &[true, true, true, false]]);
        assert_eq!(mask_lengths(mask).unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_pack_example_mask() {
        let device = Default::default();
        let packer = packer(4);
        let image = Tensor::<TestBackend, 3>::random([4, 4, 4], Distribution::Normal(0.0, 1.0), &device);
        let mask = cap_mask(&[&[true, true, false, false]]);
        let caps = Tensor::<TestBackend, 3>::ones([1, 4, 16], &device);
        let cond = Tensor::<TestBackend, 2>::zeros([1, 8], &device);

        let packed = packer
            .pack(ImageBatch::List(vec![image]), caps, mask, cond, &Identity)
            .unwrap();

        assert!(packed.tokens.dims()[1] >= 6);
        let flags = mask_vec(packed.mask);
        assert_eq!(flags.iter().filter(|&&f| f).count(), 6);
        assert!(flags[0..6].iter().all(|&f| f));
        assert_eq!(packed.freqs.cos.dims(), [1, 6, 8]);
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        let device = Default::default();
        let packer = packer(3);
        // dim == p * p * C so identity stages keep patch features
        let a = Tensor::<TestBackend, 3>::random([3, 4, 4], Distribution::Normal(0.0, 1.0), &device);
        let b = Tensor::<TestBackend, 3>::random([3, 2, 6], Distribution::Normal(0.0, 1.0), &device);
        let mask = cap_mask(&[&[true, false, false], &[true, true, true]]);
        let caps = Tensor::<TestBackend, 3>::random([2, 3, 12], Distribution::Normal(0.0, 1.0), &device);
        let cond = Tensor::<TestBackend, 2>::zeros([2, 8], &device);

        let images = ImageBatch::List(vec![a.clone(), b.clone()]);
        let packed = packer.pack(images, caps.clone(), mask, cond, &Identity).unwrap();

        // Caption tokens sit at the front of each sample
        let first_cap = packed.tokens.clone().slice([1..2, 0..3, 0..12]).reshape([3, 12]);
        let want_cap = caps.slice([1..2, 0..3, 0..12]).reshape([3, 12]);
        let diff: f32 = (first_cap - want_cap).abs().max().into_scalar();
        assert_eq!(diff, 0.0);

        // Tail of the shorter sample is zero
        let pad: f32 = packed.tokens.clone().slice([0..1, 5..6, 0..12]).abs().sum().into_scalar();
        assert_eq!(pad, 0.0);

        let restored = packer.unpack(packed.tokens, &packed.layout).unwrap();
        let ImageBatch::List(restored) = restored else {
            panic!("list input should unpack to a list");
        };
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].dims(), [3, 4, 4]);
        assert_eq!(restored[1].dims(), [3, 2, 6]);
        let diff_a: f32 = (restored[0].clone() - a).abs().max().into_scalar();
        let diff_b: f32 = (restored[1].clone() - b).abs().max().into_scalar();
        assert_eq!(diff_a, 0.0);
        assert_eq!(diff_b, 0.0);
    }

    #[test]
    fn test_stacked_round_trip() {
        let device = Default::default();
        let packer = packer(1);
        let x = Tensor::<TestBackend, 4>::random([2, 1, 4, 2], Distribution::Normal(0.0, 1.0), &device);
        let mask = cap_mask(&[&[true, true], &[false, false]]);
        let caps = Tensor::<TestBackend, 3>::zeros([2, 2, 4], &device);
        let cond = Tensor::<TestBackend, 2>::zeros([2, 8], &device);

        let packed = packer
            .pack(ImageBatch::Stacked(x.clone()), caps, mask, cond, &Identity)
            .unwrap();
        assert_eq!(packed.layout.mode(), OutputMode::Stacked);

        let ImageBatch::Stacked(restored) = packer.unpack(packed.tokens, &packed.layout).unwrap() else {
            panic!("stacked input should unpack stacked");
        };
        let diff: f32 = (restored - x).abs().max().into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let device = Default::default();
        let packer = packer(4);
        let image = Tensor::<TestBackend, 3>::zeros([3, 2, 2], &device);
        let err = packer
            .layout(&ImageBatch::List(vec![image]), cap_mask(&[&[true]]))
            .unwrap_err();
        assert_eq!(
            err,
            LuminaError::ChannelMismatch {
                index: 0,
                expected: 4,
                found: 3
            }
        );
    }

    #[test]
    fn test_caption_shape_mismatch_rejected() {
        let device = Default::default();
        let packer = packer(4);
        let image = Tensor::<TestBackend, 3>::zeros([4, 2, 2], &device);
        let caps = Tensor::<TestBackend, 3>::zeros([1, 3, 16], &device);
        let cond = Tensor::<TestBackend, 2>::zeros([1, 8], &device);

        let result = packer.pack(
            ImageBatch::List(vec![image]),
            caps,
            cap_mask(&[&[true, true]]),
            cond,
            &Identity,
        );
        assert!(matches!(result, Err(LuminaError::CaptionShapeMismatch { .. })));
    }

    #[test]
    fn test_heterogeneous_stack_rejected() {
        let device = Default::default();
        let images = ImageBatch::<TestBackend>::List(vec![
            Tensor::zeros([1, 2, 2], &device),
            Tensor::zeros([1, 2, 4], &device),
        ]);
        assert_eq!(images.into_stacked().unwrap_err(), LuminaError::HeterogeneousBatch);
    }

    #[test]
    fn test_stacked_zero_size_images_unpack_to_zeros() {
        let device = Default::default();
        let packer = packer(4);
        let images = Tensor::<TestBackend, 4>::zeros([2, 4, 0, 0], &device);
        let mask = cap_mask(&[&[true, true], &[true, false]]);
        let caps = Tensor::<TestBackend, 3>::ones([2, 2, 16], &device);
        let cond = Tensor::<TestBackend, 2>::zeros([2, 8], &device);

        let packed = packer
            .pack(ImageBatch::Stacked(images), caps, mask, cond, &Identity)
            .unwrap();
        assert_eq!(packed.layout.img_lens(), &[0, 0]);
        assert_eq!(packed.tokens.dims(), [2, 2, 16]);

        let ImageBatch::Stacked(restored) = packer.unpack(packed.tokens, &packed.layout).unwrap() else {
            panic!("stacked input should unpack stacked");
        };
        assert_eq!(restored.dims(), [2, 4, 0, 0]);
    }

    #[test]
    fn test_empty_caption_axis() {
        let device = Default::default();
        let packer = packer(4);
        let image = Tensor::<TestBackend, 3>::random([4, 4, 2], Distribution::Normal(0.0, 1.0), &device);
        let mask = Tensor::<TestBackend, 2, Bool>::from_data(
            TensorData::new(Vec::<bool>::new(), [1, 0]),
            &device,
        );
        let caps = Tensor::<TestBackend, 3>::zeros([1, 0, 16], &device);
        let cond = Tensor::<TestBackend, 2>::zeros([1, 8], &device);

        let packed = packer
            .pack(ImageBatch::List(vec![image.clone()]), caps, mask, cond, &Identity)
            .unwrap();
        assert_eq!(packed.layout.cap_lens(), &[0]);
        assert_eq!(mask_vec(packed.mask.clone()), vec![true; 2]);

        let ImageBatch::List(restored) = packer.unpack(packed.tokens, &packed.layout).unwrap() else {
            panic!("list input should unpack to a list");
        };
        let diff: f32 = (restored[0].clone() - image).abs().max().into_scalar();
        assert_eq!(diff, 0.0);
    }
}
