//! Training hooks: loss and throughput reporting, embedding statistics and
//! periodic evaluation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use lector_core::Batch;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::graph::TrainableGraph;

/// State passed to hooks after every optimization step.
pub struct IterationInfo<'a> {
    /// 1-based epoch.
    pub epoch: usize,
    /// 1-based step count over the whole run.
    pub iteration: usize,
    pub loss: f32,
    /// Instances in the batch just processed.
    pub batch_size: usize,
    pub graph: &'a dyn TrainableGraph,
}

/// Callbacks fired by the training loop.
pub trait Hook {
    fn at_iteration_end(&mut self, _info: &IterationInfo<'_>) -> Result<()> {
        Ok(())
    }

    fn at_epoch_end(&mut self, _epoch: usize, _graph: &dyn TrainableGraph) -> Result<()> {
        Ok(())
    }
}

/// Logs the mean loss every `every` iterations.
pub struct LossHook {
    every: usize,
    sum: f64,
    count: usize,
    last: Option<f32>,
}

impl LossHook {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            sum: 0.0,
            count: 0,
            last: None,
        }
    }

    /// Mean loss of the last reported interval.
    pub fn last_mean(&self) -> Option<f32> {
        self.last
    }
}

impl Hook for LossHook {
    fn at_iteration_end(&mut self, info: &IterationInfo<'_>) -> Result<()> {
        self.sum += f64::from(info.loss);
        self.count += 1;
        if info.iteration % self.every == 0 {
            let mean = (self.sum / self.count as f64) as f32;
            info!(epoch = info.epoch, iteration = info.iteration, loss = mean, "loss");
            self.last = Some(mean);
            self.sum = 0.0;
            self.count = 0;
        }
        Ok(())
    }
}

/// Logs training throughput every `every` iterations.
pub struct ExamplesPerSecHook {
    every: usize,
    examples: usize,
    since: Instant,
    last: Option<f64>,
}

impl ExamplesPerSecHook {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            examples: 0,
            since: Instant::now(),
            last: None,
        }
    }

    pub fn last_rate(&self) -> Option<f64> {
        self.last
    }
}

impl Hook for ExamplesPerSecHook {
    fn at_iteration_end(&mut self, info: &IterationInfo<'_>) -> Result<()> {
        self.examples += info.batch_size;
        if info.iteration % self.every == 0 {
            let seconds = self.since.elapsed().as_secs_f64().max(f64::EPSILON);
            let rate = self.examples as f64 / seconds;
            info!(
                epoch = info.epoch,
                iteration = info.iteration,
                examples_per_sec = format_args!("{rate:.1}"),
                "throughput"
            );
            self.last = Some(rate);
            self.examples = 0;
            self.since = Instant::now();
        }
        Ok(())
    }
}

/// Logs min, max and mean absolute value of the embedding table every
/// `every` iterations.
pub struct EmbeddingStatsHook {
    every: usize,
}

impl EmbeddingStatsHook {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
        }
    }
}

impl Hook for EmbeddingStatsHook {
    fn at_iteration_end(&mut self, info: &IterationInfo<'_>) -> Result<()> {
        if info.iteration % self.every == 0 {
            let stats = info.graph.embedding_stats()?;
            info!(
                iteration = info.iteration,
                min = stats.min,
                max = stats.max,
                mean_abs = stats.mean_abs,
                "embedding table"
            );
        }
        Ok(())
    }
}

/// Evaluation metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    #[serde(rename = "Acc")]
    Acc,
    #[serde(rename = "macroP")]
    MacroP,
    #[serde(rename = "macroR")]
    MacroR,
    #[serde(rename = "macroF1")]
    MacroF1,
}

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Self::Acc => "Acc",
            Self::MacroP => "macroP",
            Self::MacroR => "macroR",
            Self::MacroF1 => "macroF1",
        }
    }
}

impl FromStr for Metric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Acc" => Ok(Self::Acc),
            "macroP" => Ok(Self::MacroP),
            "macroR" => Ok(Self::MacroR),
            "macroF1" => Ok(Self::MacroF1),
            other => bail!("unknown metric {other:?}"),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Computes `metrics` for predicted against gold labels.
///
/// Macro averages run over every label seen in either sequence; a class
/// without predictions (or without gold instances) scores zero precision
/// (or recall).
pub fn evaluate(predicted: &[u32], gold: &[u32], metrics: &[Metric]) -> BTreeMap<String, f64> {
    let total = gold.len().min(predicted.len());
    let correct = predicted.iter().zip(gold).filter(|(p, g)| p == g).count();

    let labels: BTreeSet<u32> = predicted.iter().chain(gold).copied().collect();
    let mut precision = 0.0;
    let mut recall = 0.0;
    let mut f1 = 0.0;
    for &label in &labels {
        let tp = predicted
            .iter()
            .zip(gold)
            .filter(|&(&p, &g)| p == label && g == label)
            .count() as f64;
        let predicted_n = predicted.iter().filter(|&&p| p == label).count() as f64;
        let gold_n = gold.iter().filter(|&&g| g == label).count() as f64;
        let p = if predicted_n > 0.0 { tp / predicted_n } else { 0.0 };
        let r = if gold_n > 0.0 { tp / gold_n } else { 0.0 };
        precision += p;
        recall += r;
        f1 += if p + r > 0.0 { 2.0 * p * r / (p + r) } else { 0.0 };
    }
    let classes = labels.len().max(1) as f64;

    metrics
        .iter()
        .map(|&metric| {
            let value = match metric {
                Metric::Acc if total == 0 => 0.0,
                Metric::Acc => correct as f64 / total as f64,
                Metric::MacroP => precision / classes,
                Metric::MacroR => recall / classes,
                Metric::MacroF1 => f1 / classes,
            };
            (metric.name().to_string(), value)
        })
        .collect()
}

/// Evaluates the graph on a fixed set of batches every `every` epochs.
pub struct EvalHook {
    info: String,
    batches: Vec<Batch>,
    every: usize,
    metrics: Vec<Metric>,
    write_metrics_to: Option<PathBuf>,
    last: Option<BTreeMap<String, f64>>,
}

impl EvalHook {
    pub fn new(
        info: impl Into<String>,
        batches: Vec<Batch>,
        every: usize,
        metrics: Vec<Metric>,
    ) -> Self {
        Self {
            info: info.into(),
            batches,
            every: every.max(1),
            metrics,
            write_metrics_to: None,
            last: None,
        }
    }

    /// Appends one JSON line per report to `path`.
    #[must_use]
    pub fn write_metrics_to(mut self, path: Option<PathBuf>) -> Self {
        self.write_metrics_to = path;
        self
    }

    /// Metrics of the most recent report.
    pub fn last_metrics(&self) -> Option<&BTreeMap<String, f64>> {
        self.last.as_ref()
    }

    /// Runs the evaluation regardless of the schedule.
    pub fn evaluate(
        &mut self,
        epoch: usize,
        graph: &dyn TrainableGraph,
    ) -> Result<BTreeMap<String, f64>> {
        let target = graph.target_field();
        let mut predicted = Vec::new();
        let mut gold = Vec::new();
        for batch in &self.batches {
            predicted.extend(graph.predict(batch)?);
            gold.extend(target.gold(batch));
        }

        let scores = evaluate(&predicted, &gold, &self.metrics);
        for (name, value) in &scores {
            info!(
                info = %self.info,
                epoch,
                metric = %name,
                value = format_args!("{value:.4}"),
                "evaluation"
            );
        }
        if let Some(path) = &self.write_metrics_to {
            append_metrics(path, &self.info, epoch, &scores)?;
        }
        self.last = Some(scores.clone());
        Ok(scores)
    }
}

impl Hook for EvalHook {
    fn at_epoch_end(&mut self, epoch: usize, graph: &dyn TrainableGraph) -> Result<()> {
        if epoch % self.every == 0 {
            self.evaluate(epoch, graph)?;
        }
        Ok(())
    }
}

fn append_metrics(
    path: &Path,
    info: &str,
    epoch: usize,
    scores: &BTreeMap<String, f64>,
) -> Result<()> {
    let line = serde_json::json!({ "info": info, "epoch": epoch, "metrics": scores });
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open metrics file {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EmbeddingStats, TargetField};
    use lector_core::EncodedInstance;

    /// Predicts a fixed label for every row.
    struct ConstantGraph(u32);

    impl TrainableGraph for ConstantGraph {
        fn train_step(&mut self, _batch: &Batch) -> Result<f32> {
            Ok(1.0)
        }

        fn predict(&self, batch: &Batch) -> Result<Vec<u32>> {
            Ok(vec![self.0; batch.len()])
        }

        fn target_field(&self) -> TargetField {
            TargetField::Answers
        }

        fn embedding_stats(&self) -> Result<EmbeddingStats> {
            Ok(EmbeddingStats {
                rows: 2,
                dim: 1,
                pretrained: 0,
                trainable: true,
                min: -1.0,
                max: 1.0,
                mean_abs: 1.0,
            })
        }
    }

    fn batch(answers: &[u32]) -> Batch {
        let instances: Vec<EncodedInstance> = answers
            .iter()
            .map(|&a| EncodedInstance {
                question: vec![2],
                answers: vec![a],
                ..Default::default()
            })
            .collect();
        let refs: Vec<&EncodedInstance> = instances.iter().collect();
        Batch::collate((0..answers.len()).collect(), vec![0], &refs)
    }

    fn info(iteration: usize, loss: f32, graph: &dyn TrainableGraph) -> IterationInfo<'_> {
        IterationInfo {
            epoch: 1,
            iteration,
            loss,
            batch_size: 4,
            graph,
        }
    }

    #[test]
    fn test_metrics() {
        let gold = [2, 2, 3, 3];
        let predicted = [2, 2, 2, 3];
        let all = [Metric::Acc, Metric::MacroP, Metric::MacroR, Metric::MacroF1];
        let scores = evaluate(&predicted, &gold, &all);

        assert!((scores["Acc"] - 0.75).abs() < 1e-9);
        // class 2: p = 2/3, r = 1; class 3: p = 1, r = 1/2
        assert!((scores["macroP"] - (2.0 / 3.0 + 1.0) / 2.0).abs() < 1e-9);
        assert!((scores["macroR"] - 0.75).abs() < 1e-9);
        assert!((scores["macroF1"] - (0.8 + 2.0 / 3.0) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_empty() {
        let scores = evaluate(&[], &[], &[Metric::Acc, Metric::MacroF1]);
        assert_eq!(scores["Acc"], 0.0);
        assert_eq!(scores["macroF1"], 0.0);
    }

    #[test]
    fn test_metric_names() {
        assert_eq!("macroF1".parse::<Metric>().unwrap(), Metric::MacroF1);
        assert_eq!(Metric::Acc.to_string(), "Acc");
        assert!("F1".parse::<Metric>().is_err());
    }

    #[test]
    fn test_loss_hook_reports_interval_mean() {
        let graph = ConstantGraph(2);
        let mut hook = LossHook::new(2);
        hook.at_iteration_end(&info(1, 1.0, &graph)).unwrap();
        assert!(hook.last_mean().is_none());
        hook.at_iteration_end(&info(2, 3.0, &graph)).unwrap();
        assert_eq!(hook.last_mean(), Some(2.0));
        hook.at_iteration_end(&info(3, 5.0, &graph)).unwrap();
        hook.at_iteration_end(&info(4, 7.0, &graph)).unwrap();
        assert_eq!(hook.last_mean(), Some(6.0));
    }

    #[test]
    fn test_examples_per_sec_hook() {
        let graph = ConstantGraph(2);
        let mut hook = ExamplesPerSecHook::new(1);
        hook.at_iteration_end(&info(1, 1.0, &graph)).unwrap();
        assert!(hook.last_rate().is_some_and(|r| r > 0.0));
    }

    #[test]
    fn test_embedding_stats_hook() {
        let graph = ConstantGraph(2);
        let mut hook = EmbeddingStatsHook::new(1);
        hook.at_iteration_end(&info(1, 1.0, &graph)).unwrap();
    }

    #[test]
    fn test_eval_hook_schedule_and_metrics_file() {
        let path =
            std::env::temp_dir().join(format!("lector-metrics-{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let graph = ConstantGraph(2);
        let batches = vec![batch(&[2, 3]), batch(&[2, 2])];
        let mut hook = EvalHook::new("dev", batches, 2, vec![Metric::Acc])
            .write_metrics_to(Some(path.clone()));

        hook.at_epoch_end(1, &graph).unwrap();
        assert!(hook.last_metrics().is_none());
        hook.at_epoch_end(2, &graph).unwrap();
        assert!((hook.last_metrics().unwrap()["Acc"] - 0.75).abs() < 1e-9);

        let written = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(line["info"], "dev");
        assert_eq!(line["epoch"], 2);
        std::fs::remove_file(&path).unwrap();
    }
}
