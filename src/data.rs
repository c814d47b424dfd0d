use std::{collections::HashSet, fs, path::PathBuf, sync::Arc};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use tokenizers::Tokenizer;

use crate::{
    config::LearnerError,
    loss::IGNORE_INDEX,
    model::ModelType,
};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, LearnerError>;

/// A batch after the masking transform: corrupted inputs plus recovery
/// labels carrying [`IGNORE_INDEX`] at unselected positions.
#[derive(Debug)]
pub struct MaskedBatch {
    pub inputs: Tensor,
    pub labels: Tensor,
}

/// Training and validation token blocks plus the tokenizer and masking
/// transform that belong to them. Blocks are fixed-length, so batches are
/// always dense `[batch, seq]` tensors and the per-epoch batch count is
/// known ahead of the loop.
pub struct LmDataBunch {
    tokenizer: Arc<Tokenizer>,
    model_type: ModelType,
    masker: MlmMasker,
    train: Vec<Vec<u32>>,
    valid: Vec<Vec<u32>>,
    sequence_length: usize,
    train_batch_size: usize,
    val_batch_size: usize,
}

impl LmDataBunch {
    /// Reads raw text, tokenizes line by line, and packs the token stream
    /// into `sequence_length` blocks (wrapped in the family's cls/sep
    /// tokens when the tokenizer defines them). Trailing tokens that do not
    /// fill a block are dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn from_text_files(
        train_files: &[PathBuf],
        validation_files: &[PathBuf],
        tokenizer: Tokenizer,
        model_type: ModelType,
        sequence_length: usize,
        train_batch_size: usize,
        val_batch_size: usize,
        mask_probability: f32,
    ) -> Result<Self> {
        if sequence_length < 2 {
            return Err(LearnerError::initialization(
                "sequence_length must be at least 2",
            ));
        }
        let tokenizer = Arc::new(tokenizer);
        let specials = SpecialTokens::resolve(&tokenizer, model_type);

        let train = pack_files(train_files, &tokenizer, &specials, sequence_length)?;
        let valid = pack_files(validation_files, &tokenizer, &specials, sequence_length)?;
        if train.is_empty() {
            return Err(LearnerError::initialization(
                "training corpus produced no full-length blocks",
            ));
        }

        let masker = MlmMasker::new(&tokenizer, &specials, mask_probability)?;
        Self::build(
            tokenizer,
            model_type,
            masker,
            train,
            valid,
            sequence_length,
            train_batch_size,
            val_batch_size,
        )
    }

    /// Accepts pre-tokenized fixed-length blocks. Every block must have the
    /// same length.
    #[allow(clippy::too_many_arguments)]
    pub fn from_sequences(
        train: Vec<Vec<u32>>,
        valid: Vec<Vec<u32>>,
        tokenizer: Tokenizer,
        model_type: ModelType,
        train_batch_size: usize,
        val_batch_size: usize,
        mask_probability: f32,
    ) -> Result<Self> {
        let sequence_length = train
            .first()
            .map(|block| block.len())
            .ok_or_else(|| LearnerError::initialization("training set must not be empty"))?;
        if sequence_length == 0 {
            return Err(LearnerError::initialization(
                "training blocks must not be empty",
            ));
        }
        if train
            .iter()
            .chain(valid.iter())
            .any(|block| block.len() != sequence_length)
        {
            return Err(LearnerError::initialization(
                "all token blocks must share one fixed length",
            ));
        }

        let tokenizer = Arc::new(tokenizer);
        let specials = SpecialTokens::resolve(&tokenizer, model_type);
        let masker = MlmMasker::new(&tokenizer, &specials, mask_probability)?;
        Self::build(
            tokenizer,
            model_type,
            masker,
            train,
            valid,
            sequence_length,
            train_batch_size,
            val_batch_size,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        tokenizer: Arc<Tokenizer>,
        model_type: ModelType,
        masker: MlmMasker,
        train: Vec<Vec<u32>>,
        valid: Vec<Vec<u32>>,
        sequence_length: usize,
        train_batch_size: usize,
        val_batch_size: usize,
    ) -> Result<Self> {
        if train_batch_size == 0 || val_batch_size == 0 {
            return Err(LearnerError::initialization(
                "batch sizes must be greater than zero",
            ));
        }
        Ok(Self {
            tokenizer,
            model_type,
            masker,
            train,
            valid,
            sequence_length,
            train_batch_size,
            val_batch_size,
        })
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    pub fn train_batch_size(&self) -> usize {
        self.train_batch_size
    }

    pub fn val_batch_size(&self) -> usize {
        self.val_batch_size
    }

    pub fn train_examples(&self) -> usize {
        self.train.len()
    }

    /// Full batches per training epoch; the trailing partial batch is
    /// dropped so this count is exact.
    pub fn train_batches(&self) -> usize {
        self.train.len() / self.train_batch_size
    }

    pub fn val_batches(&self) -> usize {
        self.valid.len() / self.val_batch_size
    }

    /// Shuffled visit order for one epoch, deterministic in the seed.
    pub fn train_order(&self, seed: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.train.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
        order
    }

    pub fn train_batch(&self, order: &[usize], index: usize) -> Result<Tensor> {
        let start = index * self.train_batch_size;
        let end = start + self.train_batch_size;
        if end > order.len() {
            return Err(LearnerError::runtime(format!(
                "training batch index {} out of range",
                index
            )));
        }
        let rows = order[start..end].iter().map(|&row| &self.train[row]);
        materialize_batch(rows, self.train_batch_size, self.sequence_length)
    }

    pub fn val_batch(&self, index: usize) -> Result<Tensor> {
        let start = index * self.val_batch_size;
        let end = start + self.val_batch_size;
        if end > self.valid.len() {
            return Err(LearnerError::runtime(format!(
                "validation batch index {} out of range",
                index
            )));
        }
        let rows = self.valid[start..end].iter();
        materialize_batch(rows, self.val_batch_size, self.sequence_length)
    }

    /// Applies the masking transform to a raw batch, producing `(inputs,
    /// labels)` on the batch's device.
    pub fn mask_tokens(&self, batch: &Tensor, rng: &mut StdRng) -> Result<MaskedBatch> {
        self.masker.mask(batch, rng)
    }
}

fn materialize_batch<'a>(
    rows: impl Iterator<Item = &'a Vec<u32>>,
    batch_size: usize,
    sequence_length: usize,
) -> Result<Tensor> {
    let mut tokens = Vec::with_capacity(batch_size * sequence_length);
    for row in rows {
        tokens.extend_from_slice(row);
    }
    Tensor::from_vec(tokens, (batch_size, sequence_length), &Device::Cpu)
        .map_err(|err| LearnerError::runtime(format!("failed to materialize batch tensor: {err}")))
}

struct SpecialTokens {
    cls: Option<u32>,
    sep: Option<u32>,
    mask: Option<u32>,
    pad: Option<u32>,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer, model_type: ModelType) -> Self {
        let (cls, sep, mask, pad) = model_type.special_token_names();
        Self {
            cls: tokenizer.token_to_id(cls),
            sep: tokenizer.token_to_id(sep),
            mask: tokenizer.token_to_id(mask),
            pad: tokenizer.token_to_id(pad),
        }
    }

    fn protected_ids(&self) -> HashSet<u32> {
        [self.cls, self.sep, self.mask, self.pad]
            .into_iter()
            .flatten()
            .collect()
    }
}

fn pack_files(
    files: &[PathBuf],
    tokenizer: &Tokenizer,
    specials: &SpecialTokens,
    sequence_length: usize,
) -> Result<Vec<Vec<u32>>> {
    // With both wrapper tokens available, blocks reserve two slots for them.
    let wrap = match (specials.cls, specials.sep) {
        (Some(cls), Some(sep)) if sequence_length > 2 => Some((cls, sep)),
        _ => None,
    };
    let content_len = if wrap.is_some() {
        sequence_length - 2
    } else {
        sequence_length
    };

    let mut blocks = Vec::new();
    let mut buffer: Vec<u32> = Vec::with_capacity(content_len);

    for path in files {
        let contents = fs::read_to_string(path)?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let encoding = tokenizer
                .encode(line, false)
                .map_err(|err| LearnerError::runtime(format!("tokenization failed: {err}")))?;
            buffer.extend_from_slice(encoding.get_ids());
            while buffer.len() >= content_len {
                let content: Vec<u32> = buffer.drain(..content_len).collect();
                blocks.push(wrap_block(content, wrap));
            }
        }
    }

    Ok(blocks)
}

fn wrap_block(content: Vec<u32>, wrap: Option<(u32, u32)>) -> Vec<u32> {
    match wrap {
        Some((cls, sep)) => {
            let mut block = Vec::with_capacity(content.len() + 2);
            block.push(cls);
            block.extend(content);
            block.push(sep);
            block
        }
        None => content,
    }
}

/// The masking transform: selects positions with probability `p`; of the
/// selected, 80% become the mask token, 10% a random vocabulary id, 10%
/// stay unchanged. Special tokens and padding are never selected. Labels
/// carry the original id at selected positions and [`IGNORE_INDEX`]
/// everywhere else.
pub struct MlmMasker {
    mask_probability: f32,
    mask_token_id: u32,
    vocab_size: u32,
    protected: HashSet<u32>,
}

impl MlmMasker {
    fn new(
        tokenizer: &Tokenizer,
        specials: &SpecialTokens,
        mask_probability: f32,
    ) -> Result<Self> {
        if !(0.0..1.0).contains(&mask_probability) {
            return Err(LearnerError::initialization(
                "mask_probability must be in [0, 1)",
            ));
        }
        let mask_token_id = specials.mask.ok_or_else(|| {
            LearnerError::initialization(
                "tokenizer does not define a mask token for this model family",
            )
        })?;
        let vocab_size = tokenizer.get_vocab_size(true) as u32;
        if vocab_size == 0 {
            return Err(LearnerError::initialization("tokenizer vocabulary is empty"));
        }
        Ok(Self {
            mask_probability,
            mask_token_id,
            vocab_size,
            protected: specials.protected_ids(),
        })
    }

    pub fn mask(&self, batch: &Tensor, rng: &mut StdRng) -> Result<MaskedBatch> {
        let rows = batch
            .to_vec2::<u32>()
            .map_err(|err| LearnerError::runtime(format!("failed to read batch tokens: {err}")))?;
        let (batch_size, seq_len) = match rows.first() {
            Some(first) => (rows.len(), first.len()),
            None => {
                return Err(LearnerError::runtime("cannot mask an empty batch"));
            }
        };

        let mut inputs = Vec::with_capacity(batch_size * seq_len);
        let mut labels = Vec::with_capacity(batch_size * seq_len);

        for row in &rows {
            for &token in row {
                if self.protected.contains(&token) || rng.gen::<f32>() >= self.mask_probability {
                    inputs.push(token);
                    labels.push(IGNORE_INDEX);
                    continue;
                }

                labels.push(token as i64);
                let roll = rng.gen::<f32>();
                if roll < 0.8 {
                    inputs.push(self.mask_token_id);
                } else if roll < 0.9 {
                    inputs.push(rng.gen_range(0..self.vocab_size));
                } else {
                    inputs.push(token);
                }
            }
        }

        let device = batch.device();
        let inputs = Tensor::from_vec(inputs, (batch_size, seq_len), device)
            .map_err(|err| LearnerError::runtime(format!("failed to build input tensor: {err}")))?;
        let labels = Tensor::from_vec(labels, (batch_size, seq_len), device)
            .map_err(|err| LearnerError::runtime(format!("failed to build label tensor: {err}")))?;

        Ok(MaskedBatch { inputs, labels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokenizers::models::wordlevel::WordLevel;

    fn fixture_tokenizer() -> Tokenizer {
        let mut vocab: HashMap<String, u32> = HashMap::new();
        for (id, token) in ["[PAD]", "[CLS]", "[SEP]", "[MASK]", "[UNK]"]
            .iter()
            .enumerate()
        {
            vocab.insert((*token).to_string(), id as u32);
        }
        for id in 5..32 {
            vocab.insert(format!("word{id}"), id as u32);
        }
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();
        Tokenizer::new(model)
    }

    fn fixture_bunch(train_blocks: usize, block_len: usize) -> LmDataBunch {
        let train: Vec<Vec<u32>> = (0..train_blocks)
            .map(|i| (0..block_len).map(|j| 5 + ((i + j) % 20) as u32).collect())
            .collect();
        let valid: Vec<Vec<u32>> = (0..4)
            .map(|i| (0..block_len).map(|j| 5 + ((i * j) % 20) as u32).collect())
            .collect();
        LmDataBunch::from_sequences(
            train,
            valid,
            fixture_tokenizer(),
            ModelType::Bert,
            2,
            2,
            0.15,
        )
        .unwrap()
    }

    #[test]
    fn batch_counts_drop_partial_batches() {
        let bunch = fixture_bunch(7, 8);
        assert_eq!(bunch.train_batches(), 3);
        assert_eq!(bunch.val_batches(), 2);
    }

    #[test]
    fn train_order_is_deterministic_per_seed() {
        let bunch = fixture_bunch(10, 8);
        assert_eq!(bunch.train_order(7), bunch.train_order(7));
        assert_ne!(bunch.train_order(7), bunch.train_order(8));
    }

    #[test]
    fn batches_are_fixed_shape() {
        let bunch = fixture_bunch(6, 8);
        let order = bunch.train_order(0);
        let batch = bunch.train_batch(&order, 2).unwrap();
        assert_eq!(batch.dims(), &[2, 8]);
        assert!(bunch.train_batch(&order, 3).is_err());
    }

    #[test]
    fn full_masking_touches_every_unprotected_position() {
        let train = vec![vec![1, 10, 11, 12, 13, 2]; 2];
        let bunch = LmDataBunch::from_sequences(
            train,
            vec![],
            fixture_tokenizer(),
            ModelType::Bert,
            2,
            2,
            0.99,
        )
        .unwrap();
        let order = bunch.train_order(0);
        let batch = bunch.train_batch(&order, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let masked = bunch.mask_tokens(&batch, &mut rng).unwrap();

        let labels = masked.labels.to_vec2::<i64>().unwrap();
        for row in &labels {
            // CLS and SEP stay ignored; interior positions are nearly all live.
            assert_eq!(row[0], IGNORE_INDEX);
            assert_eq!(row[5], IGNORE_INDEX);
            let live = row[1..5].iter().filter(|&&l| l >= 0).count();
            assert!(live >= 3, "expected most interior positions selected");
        }

        let inputs = masked.inputs.to_vec2::<u32>().unwrap();
        for (input_row, label_row) in inputs.iter().zip(&labels) {
            assert_eq!(input_row[0], 1);
            assert_eq!(input_row[5], 2);
            for (&input, &label) in input_row.iter().zip(label_row) {
                if label >= 0 {
                    // Selected positions recover the original token.
                    assert!(label >= 5 && label < 32, "label {label} out of range");
                    let _ = input;
                }
            }
        }
    }

    #[test]
    fn zero_probability_masks_nothing() {
        let bunch = fixture_bunch(4, 8);
        let order = bunch.train_order(1);
        let batch = bunch.train_batch(&order, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let bunch_zero = LmDataBunch::from_sequences(
            vec![vec![10u32; 8]; 4],
            vec![],
            fixture_tokenizer(),
            ModelType::Bert,
            2,
            2,
            0.0,
        )
        .unwrap();
        let masked = bunch_zero.mask_tokens(&batch, &mut rng).unwrap();
        let labels = masked.labels.to_vec2::<i64>().unwrap();
        assert!(labels.iter().flatten().all(|&l| l == IGNORE_INDEX));
        let inputs = masked.inputs.to_vec2::<u32>().unwrap();
        assert_eq!(inputs, batch.to_vec2::<u32>().unwrap());
    }

    #[test]
    fn missing_mask_token_is_rejected() {
        let mut vocab: HashMap<String, u32> = HashMap::new();
        vocab.insert("[UNK]".to_string(), 0);
        vocab.insert("word".to_string(), 1);
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();
        let tokenizer = Tokenizer::new(model);
        let result = LmDataBunch::from_sequences(
            vec![vec![1, 1]],
            vec![],
            tokenizer,
            ModelType::Bert,
            1,
            1,
            0.15,
        );
        assert!(result.is_err());
    }
}
