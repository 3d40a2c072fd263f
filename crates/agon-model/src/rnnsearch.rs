//! Attentional encoder-decoder.
//!
//! Architecture: Embedding → BiGRU → annotations; decoder step is
//! GRU(y_{t-1}) → attention → GRU(context), followed by
//! `ls(s) + ly(y) + lc(c)` and maxout (or tanh).

use agon_core::{AgonError, TranslationModel};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder, VarMap};

use crate::attention::Attention;
use crate::classifier::Classifier;
use crate::config::RnnSearchConfig;
use crate::gru::GruCell;

/// Encoder outputs reused by every decoder step.
#[derive(Debug, Clone)]
pub struct EncoderState {
    /// Bidirectional annotations `(Ls, B, 2 * enc_hidden)`.
    pub annotations: Tensor,
    /// Attention projection of the annotations `(Ls, B, align)`.
    pub uh: Tensor,
    /// Source mask `(Ls, B)`.
    pub src_mask: Tensor,
    /// Initial decoder state `(B, dec_hidden)`.
    pub init_state: Tensor,
}

/// RNNsearch-style translation network plus its classifier.
///
/// # Example
///
/// ```
/// use agon_core::{Batch, TranslationModel};
/// use agon_model::{RnnSearch, RnnSearchConfig};
/// use candle_core::Device;
/// use candle_nn::VarMap;
///
/// let device = Device::Cpu;
/// let var_map = VarMap::new();
/// let model = RnnSearch::new(&var_map, &RnnSearchConfig::tiny(16, 16), &device).unwrap();
/// let batch = Batch::from_pairs(&[(vec![5, 6], vec![7, 8])], &device).unwrap();
/// let features = model
///     .forward(
///         batch.src(),
///         &batch.gold_feed().unwrap(),
///         batch.src_mask(),
///         &batch.gold_feed_mask().unwrap(),
///     )
///     .unwrap();
/// assert_eq!(features.dims(), &[3, 1, 8]);
/// ```
pub struct RnnSearch {
    src_emb: Embedding,
    enc_fwd: GruCell,
    enc_bwd: GruCell,
    init: Linear,
    ua: Linear,
    trg_emb: Embedding,
    gru1: GruCell,
    attention: Attention,
    gru2: GruCell,
    ls: Linear,
    ly: Linear,
    lc: Linear,
    classifier: Classifier,
    config: RnnSearchConfig,
    device: Device,
}

impl std::fmt::Debug for RnnSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RnnSearch({}→{}, enc={}x2, dec={}, out={}{}, device={:?})",
            self.config.src_vocab,
            self.config.trg_vocab,
            self.config.enc_hidden,
            self.config.dec_hidden,
            self.config.out_size,
            if self.config.max_out { " maxout" } else { "" },
            self.device
        )
    }
}

impl RnnSearch {
    /// Creates a trainable network whose parameters live in `var_map`.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::InvalidConfig`] for bad dimensions and
    /// [`AgonError::Internal`] if parameter creation fails.
    pub fn new(var_map: &VarMap, config: &RnnSearchConfig, device: &Device) -> Result<Self, AgonError> {
        config.validate()?;
        let map_err = |e: candle_core::Error| AgonError::internal("RnnSearch::new", e);

        let root = VarBuilder::from_varmap(var_map, DType::F32, device);
        let vb = root.pp("model");
        let c = config;
        let ann = 2 * c.enc_hidden;
        let out = if c.max_out { 2 * c.out_size } else { c.out_size };

        Ok(Self {
            src_emb: embedding(c.src_vocab, c.src_emb, vb.pp("src_emb")).map_err(map_err)?,
            enc_fwd: GruCell::new(c.src_emb, c.enc_hidden, vb.pp("enc_fwd")).map_err(map_err)?,
            enc_bwd: GruCell::new(c.src_emb, c.enc_hidden, vb.pp("enc_bwd")).map_err(map_err)?,
            init: linear(ann, c.dec_hidden, vb.pp("init")).map_err(map_err)?,
            ua: linear(ann, c.align, vb.pp("ua")).map_err(map_err)?,
            trg_emb: embedding(c.trg_vocab, c.trg_emb, vb.pp("trg_emb")).map_err(map_err)?,
            gru1: GruCell::new(c.trg_emb, c.dec_hidden, vb.pp("gru1")).map_err(map_err)?,
            attention: Attention::new(c.dec_hidden, c.align, vb.pp("attention")).map_err(map_err)?,
            gru2: GruCell::new(ann, c.dec_hidden, vb.pp("gru2")).map_err(map_err)?,
            ls: linear(c.dec_hidden, out, vb.pp("ls")).map_err(map_err)?,
            ly: linear(c.trg_emb, out, vb.pp("ly")).map_err(map_err)?,
            lc: linear(ann, out, vb.pp("lc")).map_err(map_err)?,
            classifier: Classifier::new(c.out_size, c.trg_vocab, root.pp("classifier"))?,
            config: config.clone(),
            device: device.clone(),
        })
    }

    /// Layer sizes.
    pub fn config(&self) -> &RnnSearchConfig {
        &self.config
    }

    /// Device holding the parameters.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Runs the bidirectional encoder over `src` `(Ls, B)`.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Internal`] on tensor failures.
    pub fn encode(&self, src: &Tensor, src_mask: &Tensor) -> Result<EncoderState, AgonError> {
        let map_err = |e: candle_core::Error| AgonError::internal("RnnSearch::encode", e);
        let (len, batch) = src.dims2().map_err(map_err)?;
        let emb = self.src_emb.forward(src).map_err(map_err)?;
        let zeros = Tensor::zeros((batch, self.config.enc_hidden), DType::F32, &self.device)
            .map_err(map_err)?;

        let mut fwd = Vec::with_capacity(len);
        let mut h = zeros.clone();
        for t in 0..len {
            let x = emb.get(t).map_err(map_err)?;
            let m = src_mask.get(t).map_err(map_err)?;
            h = self.enc_fwd.step(&x, &h, Some(&m)).map_err(map_err)?;
            fwd.push(h.clone());
        }

        let mut bwd = vec![zeros.clone(); len];
        let mut h = zeros;
        for t in (0..len).rev() {
            let x = emb.get(t).map_err(map_err)?;
            let m = src_mask.get(t).map_err(map_err)?;
            h = self.enc_bwd.step(&x, &h, Some(&m)).map_err(map_err)?;
            bwd[t] = h.clone();
        }

        let fwd = Tensor::stack(&fwd, 0).map_err(map_err)?;
        let bwd = Tensor::stack(&bwd, 0).map_err(map_err)?;
        let annotations = Tensor::cat(&[&fwd, &bwd], D::Minus1).map_err(map_err)?;

        let mask3 = src_mask.unsqueeze(D::Minus1).map_err(map_err)?;
        let summed = annotations
            .broadcast_mul(&mask3)
            .and_then(|a| a.sum(0))
            .map_err(map_err)?;
        let counts = src_mask
            .sum(0)
            .and_then(|c| c.clamp(1.0, f64::MAX))
            .and_then(|c| c.unsqueeze(D::Minus1))
            .map_err(map_err)?;
        let mean = summed.broadcast_div(&counts).map_err(map_err)?;
        let init_state = self
            .init
            .forward(&mean)
            .and_then(|s| s.tanh())
            .map_err(map_err)?;
        let uh = self.ua.forward(&annotations).map_err(map_err)?;

        Ok(EncoderState {
            annotations,
            uh,
            src_mask: src_mask.clone(),
            init_state,
        })
    }

    /// One decoder step from previous tokens `y_prev` `(B,)` u32.
    ///
    /// Returns the output features `(B, out_size)` and the new state.
    ///
    /// # Errors
    ///
    /// Returns [`AgonError::Internal`] on tensor failures.
    pub fn decode_step(
        &self,
        enc: &EncoderState,
        y_prev: &Tensor,
        state: &Tensor,
        y_mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor), AgonError> {
        let map_err = |e: candle_core::Error| AgonError::internal("RnnSearch::decode_step", e);
        let y_emb = self.trg_emb.forward(y_prev).map_err(map_err)?;
        let s_above = self.gru1.step(&y_emb, state, y_mask).map_err(map_err)?;
        let (_, context) = self
            .attention
            .forward(&s_above, &enc.annotations, &enc.uh, &enc.src_mask)
            .map_err(map_err)?;
        let s_t = self.gru2.step(&context, &s_above, y_mask).map_err(map_err)?;
        let features = self.output(&s_t, &y_emb, &context).map_err(map_err)?;
        Ok((features, s_t))
    }

    fn output(&self, s: &Tensor, y: &Tensor, c: &Tensor) -> candle_core::Result<Tensor> {
        let logit = ((self.ls.forward(s)? + self.ly.forward(y)?)? + self.lc.forward(c)?)?;
        if self.config.max_out {
            let batch = logit.dim(0)?;
            logit.reshape((batch, self.config.out_size, 2))?.max(D::Minus1)
        } else {
            logit.tanh()
        }
    }
}

impl TranslationModel for RnnSearch {
    type Head = Classifier;

    fn forward(
        &self,
        src: &Tensor,
        trg_prefix: &Tensor,
        src_mask: &Tensor,
        trg_mask: &Tensor,
    ) -> Result<Tensor, AgonError> {
        let map_err = |e: candle_core::Error| AgonError::internal("RnnSearch::forward", e);
        let (_, src_batch) = src.dims2().map_err(map_err)?;
        let (len, batch) = trg_prefix.dims2().map_err(map_err)?;
        if src_batch != batch {
            return Err(AgonError::ShapeMismatch {
                what: "target batch dimension".to_string(),
                expected: src_batch,
                actual: batch,
            });
        }
        if trg_mask.dims() != trg_prefix.dims() {
            return Err(AgonError::ShapeMismatch {
                what: "target mask length".to_string(),
                expected: len,
                actual: trg_mask.dims().first().copied().unwrap_or(0),
            });
        }

        let enc = self.encode(src, src_mask)?;
        let mut state = enc.init_state.clone();
        let mut steps = Vec::with_capacity(len);
        for t in 0..len {
            let y = trg_prefix.get(t).map_err(map_err)?;
            let m = trg_mask.get(t).map_err(map_err)?;
            let (features, next) = self.decode_step(&enc, &y, &state, Some(&m))?;
            steps.push(features);
            state = next;
        }
        let features = Tensor::stack(&steps, 0).map_err(map_err)?;
        let mask3 = trg_mask.unsqueeze(D::Minus1).map_err(map_err)?;
        features.broadcast_mul(&mask3).map_err(map_err)
    }

    fn classifier(&self) -> &Classifier {
        &self.classifier
    }
}
