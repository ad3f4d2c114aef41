//! Data preparation and the epoch loop.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use lector_core::{
    Batch, BucketedBatches, EmbeddingLookup, EncodeMode, EncodedDataset, Pipeline,
    PipelineOptions, Placeholders, PretrainedEmbeddings, RawInstance, Vocabularies,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::TrainConfig;
use crate::context::RunContext;
use crate::graph::{GraphConfig, ReaderModel, TrainableGraph, build_graph};
use crate::hooks::{
    EmbeddingStatsHook, EvalHook, ExamplesPerSecHook, Hook, IterationInfo, LossHook, Metric,
};

/// Encoded train/dev/test splits and the frozen vocabularies they share.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub vocabs: Vocabularies,
    pub train: EncodedDataset,
    pub dev: EncodedDataset,
    pub test: EncodedDataset,
}

/// Outcome of [`train`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrainSummary {
    pub epochs: usize,
    pub iterations: usize,
    /// Mean loss of the last epoch.
    pub final_loss: Option<f32>,
}

/// Reads the pretrained vectors named in the configuration, if pretraining is on.
pub fn load_embeddings(config: &TrainConfig) -> Result<Option<Arc<dyn EmbeddingLookup>>> {
    let Some(path) = config.embeddings.as_deref().filter(|_| config.pretrain) else {
        return Ok(None);
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read embeddings {}", path.display()))?;
    let embeddings = PretrainedEmbeddings::from_json_str(&json)
        .with_context(|| format!("failed to parse embeddings {}", path.display()))?;
    info!(
        path = %path.display(),
        tokens = embeddings.len(),
        dim = embeddings.dim(),
        "loaded pre-trained embeddings"
    );
    Ok(Some(Arc::new(embeddings)))
}

fn load_split(config: &TrainConfig, path: &Path) -> Result<Vec<RawInstance>> {
    config
        .load_options()
        .load(path)
        .with_context(|| format!("failed to load dataset {}", path.display()))
}

/// Loads the configured files and encodes them.
///
/// In debug mode the first `debug_examples` training instances serve as
/// train, dev and test data.
pub fn prepare_data(
    config: &TrainConfig,
    embeddings: Option<Arc<dyn EmbeddingLookup>>,
    ctx: &mut RunContext,
) -> Result<PreparedData> {
    let (train, dev, test) = if config.debug {
        let train = load_split(config, &config.train)?;
        info!(
            instances = train.len(),
            "loaded debug samples as train/dev/test dataset"
        );
        (train.clone(), train.clone(), train)
    } else {
        let train = load_split(config, &config.train)?;
        let dev = load_split(config, &config.dev)?;
        let test = load_split(config, &config.test)?;
        info!(
            train = train.len(),
            dev = dev.len(),
            test = test.len(),
            "loaded train/dev/test data"
        );
        (train, dev, test)
    };
    ctx.checkpoint("load");
    prepare_instances(config, &train, &dev, &test, embeddings, ctx)
}

/// Builds vocabularies on `train` and encodes all three splits.
///
/// The vocabulary is built in two passes (build, optional prune, frozen
/// encode) unless both pruning thresholds are disabled, in which case the
/// build pass output is used directly.
pub fn prepare_instances(
    config: &TrainConfig,
    train: &[RawInstance],
    dev: &[RawInstance],
    test: &[RawInstance],
    embeddings: Option<Arc<dyn EmbeddingLookup>>,
    ctx: &mut RunContext,
) -> Result<PreparedData> {
    let pipeline = Pipeline::new(config.pipeline_options())?;
    let mut vocabs = Vocabularies::new();
    if let Some(embeddings) = embeddings {
        vocabs = vocabs.with_embeddings(embeddings);
    }

    let (train, vocabs) = if config.two_pass_vocab() {
        info!("build vocab based on train data");
        let (_, built) = pipeline.build(train, vocabs)?;
        let mut built = if config.prune {
            let pruned = built.prune(config.vocab_minfreq as u64, config.max_vocab_size());
            debug!(
                before = built.text.len(),
                after = pruned.text.len(),
                "pruned text vocabulary"
            );
            pruned
        } else {
            built
        };
        built.freeze();
        info!("encode train data");
        (pipeline.encode(train, &built)?, built)
    } else {
        let (encoded, mut built) = pipeline.build(train, vocabs)?;
        built.freeze();
        (encoded, built)
    };
    info!(
        pretrained = vocabs.text.count_pretrained(),
        oov = vocabs.text.count_oov(),
        vocab_size = vocabs.text.len(),
        answer_size = vocabs.answers.len(),
        "training data vocabulary"
    );
    ctx.checkpoint("vocabulary");

    // Held-out splits never get sampled negatives.
    let held_out = Pipeline::new(PipelineOptions {
        negsamples: 0,
        ..config.pipeline_options()
    })?;
    let dev = encode_held_out(&held_out, "dev", dev, &vocabs)?;
    ctx.checkpoint("encode dev");
    let test = encode_held_out(&held_out, "test", test, &vocabs)?;
    ctx.checkpoint("encode test");

    Ok(PreparedData {
        vocabs,
        train,
        dev,
        test,
    })
}

fn encode_held_out(
    pipeline: &Pipeline,
    split: &str,
    instances: &[RawInstance],
    vocabs: &Vocabularies,
) -> Result<EncodedDataset> {
    let output = pipeline
        .run(instances, EncodeMode::Frozen(vocabs))
        .with_context(|| format!("failed to encode {split} data"))?;
    info!(
        split,
        instances = output.dataset.len(),
        unseen_tokens = output.unseen_tokens,
        "encoded held-out data"
    );
    Ok(output.dataset)
}

/// Runs `epochs` passes over `batches`, one optimization step per batch.
pub fn train(
    graph: &mut dyn TrainableGraph,
    batches: &BucketedBatches<'_>,
    epochs: usize,
    hooks: &mut [Box<dyn Hook>],
    ctx: &mut RunContext,
) -> Result<TrainSummary> {
    let mut iteration = 0;
    let mut final_loss = None;

    for epoch in 1..=epochs {
        let mut loss_sum = 0.0f64;
        let mut steps = 0usize;
        for batch in batches.epoch((epoch - 1) as u64) {
            let loss = graph.train_step(&batch)?;
            iteration += 1;
            loss_sum += f64::from(loss);
            steps += 1;

            let info = IterationInfo {
                epoch,
                iteration,
                loss,
                batch_size: batch.len(),
                graph: &*graph,
            };
            for hook in hooks.iter_mut() {
                hook.at_iteration_end(&info)?;
            }
        }

        for hook in hooks.iter_mut() {
            hook.at_epoch_end(epoch, &*graph)?;
        }
        if steps > 0 {
            let mean = (loss_sum / steps as f64) as f32;
            final_loss = Some(mean);
            info!(epoch, steps, loss = mean, "epoch finished");
        }
        ctx.checkpoint(&format!("epoch {epoch}"));
    }

    Ok(TrainSummary {
        epochs,
        iterations: iteration,
        final_loss,
    })
}

fn eval_batches(
    dataset: &EncodedDataset,
    config: &TrainConfig,
    batch_size: usize,
) -> Result<Vec<Batch>> {
    let batches = BucketedBatches::new(dataset, config.batch_config(batch_size))?;
    Ok(batches.epoch(0).collect())
}

/// Full run: prepare data, build the configured model, train and evaluate.
pub fn run_training(config: TrainConfig) -> Result<TrainSummary> {
    let mut ctx = RunContext::new();
    config.validate()?;
    info!(config = %serde_json::to_string(&config)?, "configuration");

    info!(
        folder = %config.tensorboard_folder.display(),
        "tensorboard_folder is accepted but unused"
    );
    let model: ReaderModel = config.model.parse()?;
    let embeddings = load_embeddings(&config)?;
    let data = prepare_data(&config, embeddings, &mut ctx)?;

    let placeholders = Placeholders::from_dataset(&data.train);
    debug!(fields = ?placeholders.iter().map(|(name, _)| name).collect::<Vec<_>>(), "placeholders");

    let graph_config = GraphConfig {
        repr_dim_input: config.repr_dim_input,
        repr_dim_output: config.repr_dim_output,
        drop_keep_prob: config.drop_keep_prob,
        learning_rate: config.learning_rate,
        l2: config.l2,
        clip: config.clip(),
        pretrain: config.pretrain,
        train_pretrain: config.train_pretrain,
        normalize_pretrain: config.normalize_pretrain,
    };
    info!(%model, "build model");
    let mut graph = build_graph(model, &graph_config, &data.vocabs)?;
    ctx.checkpoint("model");

    let train_batches = BucketedBatches::new(&data.train, config.batch_config(config.batch_size))?;
    if let Some(first) = train_batches.epoch(0).next() {
        placeholders.check(&first)?;
    }
    info!(
        batches = train_batches.num_batches(),
        buckets = train_batches.num_buckets(),
        "bucketed training data"
    );

    let mut hooks: Vec<Box<dyn Hook>> = vec![
        Box::new(EmbeddingStatsHook::new(20)),
        Box::new(LossHook::new(100)),
        Box::new(ExamplesPerSecHook::new(100)),
        Box::new(
            EvalHook::new(
                "training",
                train_batches.epoch(0).collect(),
                1,
                vec![Metric::Acc, Metric::MacroF1],
            )
            .write_metrics_to(config.write_metrics_to.clone()),
        ),
        Box::new(
            EvalHook::new(
                "development",
                eval_batches(&data.dev, &config, config.dev_batch_size)?,
                1,
                vec![Metric::Acc, Metric::MacroF1],
            )
            .write_metrics_to(config.write_metrics_to.clone()),
        ),
        Box::new(
            EvalHook::new(
                "test",
                eval_batches(&data.test, &config, 1)?,
                config.epochs,
                vec![Metric::Acc, Metric::MacroP, Metric::MacroR, Metric::MacroF1],
            )
            .write_metrics_to(config.write_metrics_to.clone()),
        ),
    ];

    let summary = train(graph.as_mut(), &train_batches, config.epochs, &mut hooks, &mut ctx)?;
    info!(
        hours = format_args!("{:.3}", ctx.elapsed_hours()),
        iterations = summary.iterations,
        "finished"
    );
    Ok(summary)
}
