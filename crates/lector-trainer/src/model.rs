//! Bag-of-embeddings reader models on candle.
//!
//! Token sequences are embedded, mean-pooled over their non-pad positions
//! and passed through one tanh layer. The result is either classified over
//! the answer vocabulary or scored against the instance's candidates.

use anyhow::{Result, bail};
use candle_core::{D, DType, Device, Tensor};
use candle_nn::init::Init;
use candle_nn::{AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use lector_core::{Batch, EmbeddingLookup, PAD_ID, Vocabularies, Vocabulary};
use tracing::{debug, info};

use crate::graph::{EmbeddingStats, GraphConfig, TargetField, TrainableGraph};

const EMBEDDINGS: &str = "embeddings";
const INIT: Init = Init::Randn {
    mean: 0.0,
    stdev: 0.1,
};

/// Which batch fields a reader looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderInputs {
    Question,
    QuestionSupport,
    QuestionSupportCandidates,
}

impl ReaderInputs {
    fn uses_support(self) -> bool {
        !matches!(self, Self::Question)
    }
}

enum Scorer {
    /// Projects the hidden state onto the answer vocabulary.
    Answers(Linear),
    /// Dot product with a candidate embedding table.
    Candidates(Tensor),
}

/// Bag-of-embeddings reader.
pub struct BoeReader {
    inputs: ReaderInputs,
    device: Device,
    varmap: VarMap,
    embeddings: Tensor,
    embeddings_trainable: bool,
    pretrained_rows: usize,
    hidden: Linear,
    scorer: Scorer,
    optimizer: AdamW,
    drop_prob: f32,
    clip: Option<f64>,
}

impl BoeReader {
    pub fn new(
        inputs: ReaderInputs,
        config: &GraphConfig,
        vocabs: &Vocabularies,
        pretrained: Option<&dyn EmbeddingLookup>,
    ) -> Result<Self> {
        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let rows = vocabs.text.len();
        let dim = config.repr_dim_input;
        let random = vb.get_with_hints((rows, dim), EMBEDDINGS, INIT)?;

        let (embeddings, embeddings_trainable, pretrained_rows) = match pretrained {
            None => (random, true, 0),
            Some(lookup) => {
                let mut values = random.flatten_all()?.to_vec1::<f32>()?;
                let count = overlay_pretrained(
                    &mut values,
                    &vocabs.text,
                    lookup,
                    dim,
                    config.normalize_pretrain,
                );
                let table = Tensor::from_vec(values, (rows, dim), &device)?;
                if config.train_pretrain {
                    varmap.set_one(EMBEDDINGS, &table)?;
                    (random, true, count)
                } else {
                    (table, false, count)
                }
            }
        };

        let features = if inputs.uses_support() { 2 * dim } else { dim };
        let hidden = candle_nn::linear(features, config.repr_dim_output, vb.pp("hidden"))?;

        let scorer = match inputs {
            ReaderInputs::QuestionSupportCandidates => {
                if vocabs.candidates.is_empty() {
                    bail!("candidate scoring needs a non-empty candidate vocabulary");
                }
                Scorer::Candidates(vb.get_with_hints(
                    (vocabs.candidates.len(), config.repr_dim_output),
                    "candidates",
                    INIT,
                )?)
            }
            _ => Scorer::Answers(candle_nn::linear(
                config.repr_dim_output,
                vocabs.answers.len(),
                vb.pp("output"),
            )?),
        };

        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.l2,
            ..ParamsAdamW::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;

        info!(
            ?inputs,
            rows,
            dim,
            pretrained_rows,
            embeddings_trainable,
            "built bag-of-embeddings reader"
        );

        Ok(Self {
            inputs,
            device,
            varmap,
            embeddings,
            embeddings_trainable,
            pretrained_rows,
            hidden,
            scorer,
            optimizer,
            drop_prob: (1.0 - config.drop_keep_prob) as f32,
            clip: config.clip,
        })
    }

    /// Mean of the embeddings of the non-pad ids of each row.
    fn pool(&self, ids: &[u32], rows: usize, width: usize) -> Result<Tensor> {
        let dim = self.embeddings.dim(1)?;
        if width == 0 {
            return Ok(Tensor::zeros((rows, dim), DType::F32, &self.device)?);
        }
        let index = Tensor::from_slice(ids, rows * width, &self.device)?;
        let embedded = self
            .embeddings
            .index_select(&index, 0)?
            .reshape((rows, width, dim))?;

        let mask: Vec<f32> = ids
            .iter()
            .map(|&id| if id == PAD_ID { 0.0 } else { 1.0 })
            .collect();
        let counts: Vec<f32> = mask
            .chunks(width)
            .map(|row| row.iter().sum::<f32>().max(1.0))
            .collect();
        let mask = Tensor::from_vec(mask, (rows, width, 1), &self.device)?;
        let counts = Tensor::from_vec(counts, (rows, 1), &self.device)?;

        Ok(embedded.broadcast_mul(&mask)?.sum(1)?.broadcast_div(&counts)?)
    }

    fn encode(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let rows = batch.len();
        let question = self.pool(batch.question.data(), rows, batch.question.shape()[1])?;
        let features = if self.inputs.uses_support() {
            let shape = batch.support.shape();
            let support = self.pool(batch.support.data(), rows, shape[1] * shape[2])?;
            Tensor::cat(&[&question, &support], 1)?
        } else {
            question
        };

        let hidden = self.hidden.forward(&features)?.tanh()?;
        if train && self.drop_prob > 0.0 {
            Ok(candle_nn::ops::dropout(&hidden, self.drop_prob)?)
        } else {
            Ok(hidden)
        }
    }

    fn logits(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let hidden = self.encode(batch, train)?;
        match &self.scorer {
            Scorer::Answers(output) => Ok(output.forward(&hidden)?),
            Scorer::Candidates(table) => {
                let rows = batch.len();
                let width = batch.candidates.shape()[1];
                if width == 0 {
                    bail!("batch has no candidates to score");
                }
                let dim = table.dim(1)?;
                let index =
                    Tensor::from_slice(batch.candidates.data(), rows * width, &self.device)?;
                let candidates = table.index_select(&index, 0)?.reshape((rows, width, dim))?;
                let scores = candidates.broadcast_mul(&hidden.unsqueeze(1)?)?.sum(2)?;

                let mut penalty = vec![0f32; rows * width];
                for row in 0..rows {
                    let length = batch.candidate_lengths[row] as usize;
                    for slot in &mut penalty[row * width + length..(row + 1) * width] {
                        *slot = -1e9;
                    }
                }
                let penalty = Tensor::from_vec(penalty, (rows, width), &self.device)?;
                Ok((scores + penalty)?)
            }
        }
    }

    /// Class index per row: answer id, or position of the gold candidate.
    fn labels(&self, batch: &Batch) -> Vec<u32> {
        match self.scorer {
            Scorer::Answers(_) => TargetField::Answers.gold(batch),
            Scorer::Candidates(_) => (0..batch.len())
                .map(|row| batch.first_target(row).unwrap_or(0) as u32)
                .collect(),
        }
    }
}

/// Copies pretrained vectors into `values`, truncating or zero-extending
/// them to `dim`. Returns the number of rows written.
fn overlay_pretrained(
    values: &mut [f32],
    vocab: &Vocabulary,
    lookup: &dyn EmbeddingLookup,
    dim: usize,
    normalize: bool,
) -> usize {
    let mut count = 0;
    for (id, token) in vocab.tokens() {
        let Some(vector) = lookup.lookup(token) else {
            continue;
        };
        let row = &mut values[id as usize * dim..(id as usize + 1) * dim];
        row.fill(0.0);
        let n = vector.len().min(dim);
        row[..n].copy_from_slice(&vector[..n]);
        if normalize {
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                row.iter_mut().for_each(|v| *v /= norm);
            }
        }
        count += 1;
    }
    count
}

impl TrainableGraph for BoeReader {
    fn train_step(&mut self, batch: &Batch) -> Result<f32> {
        let logits = self.logits(batch, true)?;
        let labels = Tensor::from_vec(self.labels(batch), batch.len(), &self.device)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &labels)?;

        match self.clip {
            None => self.optimizer.backward_step(&loss)?,
            Some(bound) => {
                let mut grads = loss.backward()?;
                for var in self.varmap.all_vars() {
                    let clipped = match grads.get(var.as_tensor()) {
                        Some(grad) => grad.clamp(-bound, bound)?,
                        None => continue,
                    };
                    grads.insert(var.as_tensor(), clipped);
                }
                self.optimizer.step(&grads)?;
            }
        }

        let loss = loss.to_scalar::<f32>()?;
        debug!(loss, rows = batch.len(), "train step");
        Ok(loss)
    }

    fn predict(&self, batch: &Batch) -> Result<Vec<u32>> {
        let best = self.logits(batch, false)?.argmax(D::Minus1)?.to_vec1::<u32>()?;
        Ok(match self.scorer {
            Scorer::Answers(_) => best,
            Scorer::Candidates(_) => best
                .iter()
                .enumerate()
                .map(|(row, &position)| {
                    batch
                        .candidates
                        .row(row)
                        .get(position as usize)
                        .copied()
                        .unwrap_or(PAD_ID)
                })
                .collect(),
        })
    }

    fn target_field(&self) -> TargetField {
        match self.scorer {
            Scorer::Answers(_) => TargetField::Answers,
            Scorer::Candidates(_) => TargetField::Candidates,
        }
    }

    fn embedding_stats(&self) -> Result<EmbeddingStats> {
        let (rows, dim) = self.embeddings.dims2()?;
        let flat = self.embeddings.flatten_all()?;
        Ok(EmbeddingStats {
            rows,
            dim,
            pretrained: self.pretrained_rows,
            trainable: self.embeddings_trainable,
            min: flat.min(0)?.to_scalar::<f32>()?,
            max: flat.max(0)?.to_scalar::<f32>()?,
            mean_abs: flat.abs()?.mean_all()?.to_scalar::<f32>()?,
        })
    }
}
