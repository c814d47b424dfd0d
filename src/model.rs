use std::{fmt, str::FromStr};

use candle_core::{DType, Device, Error, Result, Tensor, D};
use candle_nn::{
    embedding, layer_norm, linear, ops, Embedding, LayerNorm, Linear, Module, VarBuilder,
};
use serde::{Deserialize, Serialize};

/// Architecture tag selecting the pretrained family. The differences that
/// matter to this crate are small: token-type embeddings, the position-id
/// offset of the RoBERTa lineage, and Electra's narrow embedding width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Bert,
    Roberta,
    DistilBert,
    Camembert,
    Electra,
}

impl Default for ModelType {
    fn default() -> Self {
        ModelType::Bert
    }
}

impl ModelType {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelType::Bert => "bert",
            ModelType::Roberta => "roberta",
            ModelType::DistilBert => "distilbert",
            ModelType::Camembert => "camembert",
            ModelType::Electra => "electra",
        }
    }

    pub fn uses_token_type(self) -> bool {
        !matches!(self, ModelType::DistilBert)
    }

    /// RoBERTa-lineage checkpoints reserve the first two position slots.
    pub fn position_offset(self) -> usize {
        match self {
            ModelType::Roberta | ModelType::Camembert => 2,
            _ => 0,
        }
    }

    /// Conventional (cls, sep, mask, pad) token strings for the family.
    pub fn special_token_names(self) -> (&'static str, &'static str, &'static str, &'static str) {
        match self {
            ModelType::Roberta | ModelType::Camembert => ("<s>", "</s>", "<mask>", "<pad>"),
            _ => ("[CLS]", "[SEP]", "[MASK]", "[PAD]"),
        }
    }
}

impl FromStr for ModelType {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "bert" => Ok(ModelType::Bert),
            "roberta" => Ok(ModelType::Roberta),
            "distilbert" => Ok(ModelType::DistilBert),
            "camembert" | "camembert-base" => Ok(ModelType::Camembert),
            "electra" => Ok(ModelType::Electra),
            other => Err(Error::Msg(format!("unknown model type tag '{}'", other))),
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checkpoint configuration, compatible with the `config.json` layout used
/// by BERT-family checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub model_type: ModelType,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_hidden_dropout_prob")]
    pub hidden_dropout_prob: f32,
    #[serde(default = "default_attention_dropout_prob")]
    pub attention_probs_dropout_prob: f32,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub pad_token_id: u32,
    /// Electra checkpoints embed narrower than the hidden width and project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_size: Option<usize>,
}

fn default_max_position_embeddings() -> usize {
    512
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_hidden_dropout_prob() -> f32 {
    0.1
}

fn default_attention_dropout_prob() -> f32 {
    0.1
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.hidden_size == 0 {
            return Err(Error::Msg("hidden_size must be greater than zero".into()));
        }
        if self.num_hidden_layers == 0 {
            return Err(Error::Msg(
                "num_hidden_layers must be greater than zero".into(),
            ));
        }
        if self.num_attention_heads == 0 {
            return Err(Error::Msg(
                "num_attention_heads must be greater than zero".into(),
            ));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::Msg(format!(
                "hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.intermediate_size == 0 {
            return Err(Error::Msg(
                "intermediate_size must be greater than zero".into(),
            ));
        }
        if self.max_position_embeddings == 0 {
            return Err(Error::Msg(
                "max_position_embeddings must be greater than zero".into(),
            ));
        }
        if let Some(width) = self.embedding_size {
            if width == 0 {
                return Err(Error::Msg("embedding_size must be greater than zero".into()));
            }
        }
        if !(0.0..1.0).contains(&self.hidden_dropout_prob) {
            return Err(Error::Msg("hidden_dropout_prob must be in [0, 1)".into()));
        }
        if !(0.0..1.0).contains(&self.attention_probs_dropout_prob) {
            return Err(Error::Msg(
                "attention_probs_dropout_prob must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }

    fn embedding_width(&self) -> usize {
        self.embedding_size.unwrap_or(self.hidden_size)
    }
}

/// Bidirectional encoder with a masked-LM head, assembled over a
/// `VarBuilder` so pretrained weights can be loaded into the backing
/// `VarMap` and fine-tuned in place.
pub struct MaskedLmModel {
    config: ModelConfig,
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Option<Embedding>,
    embed_norm: LayerNorm,
    embed_projection: Option<Linear>,
    layers: Vec<EncoderLayer>,
    head: MlmHead,
    device: Device,
}

impl MaskedLmModel {
    pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let embed_width = config.embedding_width();

        let vb_embed = vb.pp("embeddings");
        let word_embeddings = embedding(config.vocab_size, embed_width, vb_embed.pp("word"))?;
        let position_embeddings = embedding(
            config.max_position_embeddings,
            embed_width,
            vb_embed.pp("position"),
        )?;
        let token_type_embeddings =
            if config.model_type.uses_token_type() && config.type_vocab_size > 0 {
                Some(embedding(
                    config.type_vocab_size,
                    embed_width,
                    vb_embed.pp("token_type"),
                )?)
            } else {
                None
            };
        let embed_norm = layer_norm(embed_width, config.layer_norm_eps, vb_embed.pp("layer_norm"))?;
        let embed_projection = if embed_width != config.hidden_size {
            Some(linear(
                embed_width,
                config.hidden_size,
                vb_embed.pp("projection"),
            )?)
        } else {
            None
        };

        let vb_encoder = vb.pp("encoder");
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for index in 0..config.num_hidden_layers {
            layers.push(EncoderLayer::new(
                &config,
                vb_encoder.pp(format!("layer_{index}")),
            )?);
        }

        let head = MlmHead::new(&config, vb.pp("mlm_head"))?;
        let device = vb.device().clone();

        Ok(Self {
            config,
            word_embeddings,
            position_embeddings,
            token_type_embeddings,
            embed_norm,
            embed_projection,
            layers,
            head,
            device,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Produces logits shaped `(batch, seq, vocab_size)`. Dropout is active
    /// only when `training` is set; evaluation passes are deterministic.
    pub fn forward(&self, input_ids: &Tensor, training: bool) -> Result<Tensor> {
        let (batch, seq) = input_ids.dims2()?;
        let offset = self.config.model_type.position_offset();
        if seq + offset > self.config.max_position_embeddings {
            return Err(Error::Msg(format!(
                "sequence length {} exceeds the {} position slots of this checkpoint",
                seq,
                self.config.max_position_embeddings - offset
            )));
        }

        let mut hidden = self.word_embeddings.forward(input_ids)?;

        let positions = Tensor::arange(offset as u32, (offset + seq) as u32, &self.device)?;
        let position_embed = self.position_embeddings.forward(&positions)?;
        hidden = hidden.broadcast_add(&position_embed)?;

        if let Some(token_type) = &self.token_type_embeddings {
            let segment_ids = Tensor::zeros((batch, seq), DType::U32, &self.device)?;
            hidden = hidden.add(&token_type.forward(&segment_ids)?)?;
        }

        hidden = self.embed_norm.forward(&hidden)?;
        hidden = apply_dropout(&hidden, self.config.hidden_dropout_prob, training)?;
        if let Some(projection) = &self.embed_projection {
            hidden = projection.forward(&hidden)?;
        }

        for layer in &self.layers {
            hidden = layer.forward(&hidden, training)?;
        }

        self.head.forward(&hidden)
    }
}

struct EncoderLayer {
    query: Linear,
    key: Linear,
    value: Linear,
    attn_output: Linear,
    attn_norm: LayerNorm,
    intermediate: Linear,
    output: Linear,
    ffn_norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
    attn_dropout: f32,
    hidden_dropout: f32,
}

impl EncoderLayer {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let vb_attn = vb.pp("attention");
        Ok(Self {
            query: linear(hidden, hidden, vb_attn.pp("query"))?,
            key: linear(hidden, hidden, vb_attn.pp("key"))?,
            value: linear(hidden, hidden, vb_attn.pp("value"))?,
            attn_output: linear(hidden, hidden, vb_attn.pp("output"))?,
            attn_norm: layer_norm(hidden, config.layer_norm_eps, vb_attn.pp("layer_norm"))?,
            intermediate: linear(hidden, config.intermediate_size, vb.pp("intermediate"))?,
            output: linear(config.intermediate_size, hidden, vb.pp("output"))?,
            ffn_norm: layer_norm(hidden, config.layer_norm_eps, vb.pp("layer_norm"))?,
            num_heads: config.num_attention_heads,
            head_dim: hidden / config.num_attention_heads,
            attn_dropout: config.attention_probs_dropout_prob,
            hidden_dropout: config.hidden_dropout_prob,
        })
    }

    fn split_heads(&self, tensor: &Tensor, batch: usize, seq: usize) -> Result<Tensor> {
        tensor
            .reshape((batch, seq, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, hidden: &Tensor, training: bool) -> Result<Tensor> {
        let (batch, seq, width) = hidden.dims3()?;

        let q = self.split_heads(&self.query.forward(hidden)?, batch, seq)?;
        let k = self.split_heads(&self.key.forward(hidden)?, batch, seq)?;
        let v = self.split_heads(&self.value.forward(hidden)?, batch, seq)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q.matmul(&k.t()?)?.affine(scale, 0.0)?;
        let probs = ops::softmax(&scores, D::Minus1)?;
        let probs = apply_dropout(&probs, self.attn_dropout, training)?;

        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, width))?;

        let attn = self.attn_output.forward(&context)?;
        let attn = apply_dropout(&attn, self.hidden_dropout, training)?;
        let hidden = self.attn_norm.forward(&attn.add(hidden)?)?;

        let ffn = self.intermediate.forward(&hidden)?.gelu_erf()?;
        let ffn = self.output.forward(&ffn)?;
        let ffn = apply_dropout(&ffn, self.hidden_dropout, training)?;
        self.ffn_norm.forward(&ffn.add(&hidden)?)
    }
}

struct MlmHead {
    transform: Linear,
    norm: LayerNorm,
    decoder: Linear,
}

impl MlmHead {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let width = config.embedding_width();
        Ok(Self {
            transform: linear(config.hidden_size, width, vb.pp("transform"))?,
            norm: layer_norm(width, config.layer_norm_eps, vb.pp("layer_norm"))?,
            decoder: linear(width, config.vocab_size, vb.pp("decoder"))?,
        })
    }

    fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let transformed = self.transform.forward(hidden)?.gelu_erf()?;
        self.decoder.forward(&self.norm.forward(&transformed)?)
    }
}

fn apply_dropout(tensor: &Tensor, p: f32, training: bool) -> Result<Tensor> {
    if training && p > 0.0 {
        ops::dropout(tensor, p)
    } else {
        Ok(tensor.clone())
    }
}

/// Placement of the model across accelerator replicas. `Replicated` shards
/// each batch and averages the per-replica losses; both variants expose the
/// same underlying model so checkpointing never depends on the wrapping.
pub enum DataParallel {
    Single(MaskedLmModel),
    Replicated { model: MaskedLmModel, replicas: usize },
}

impl DataParallel {
    pub fn wrap(model: MaskedLmModel, replicas: usize) -> Self {
        if replicas > 1 {
            DataParallel::Replicated { model, replicas }
        } else {
            DataParallel::Single(model)
        }
    }

    pub fn underlying_model(&self) -> &MaskedLmModel {
        match self {
            DataParallel::Single(model) => model,
            DataParallel::Replicated { model, .. } => model,
        }
    }

    pub fn replicas(&self) -> usize {
        match self {
            DataParallel::Single(_) => 1,
            DataParallel::Replicated { replicas, .. } => (*replicas).max(1),
        }
    }
}

const MAX_PROBED_REPLICAS: usize = 16;

/// Counts visible accelerator ordinals. CPU and Metal runtimes expose a
/// single replica.
pub fn detect_replicas(device: &Device) -> usize {
    if !device.is_cuda() {
        return 1;
    }
    let mut count = 1;
    while count < MAX_PROBED_REPLICAS {
        if Device::new_cuda(count).is_err() {
            break;
        }
        count += 1;
    }
    count
}
