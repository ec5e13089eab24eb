//! Process topology, gradient sync and metric sink used by the training loop

use anyhow::{bail, Context, Result};
use candle_core::Tensor;
use log::{debug, info};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Data-parallel collaborator of the training loop
pub trait Accelerator {
    fn num_processes(&self) -> usize;

    fn process_index(&self) -> usize;

    fn is_main_process(&self) -> bool {
        self.process_index() == 0
    }

    /// Average a gradient over all replicas
    fn reduce_gradient(&self, grad: &Tensor) -> Result<Tensor>;

    /// Barrier across replicas
    fn wait_for_everyone(&self) -> Result<()>;

    /// Record scalar metrics for a step
    fn log(&mut self, step: usize, metrics: &[(&str, f64)]) -> Result<()>;

    /// Flush sinks and release resources
    fn end_training(&mut self) -> Result<()>;
}

/// Single process: reduction and barrier are no-ops, metrics go to a JSONL
/// file when a logging dir is configured
pub struct LocalAccelerator {
    metrics: Option<BufWriter<File>>,
    metrics_path: Option<PathBuf>,
}

impl LocalAccelerator {
    pub fn new() -> Self {
        Self {
            metrics: None,
            metrics_path: None,
        }
    }

    /// Metrics are written to `<logging_dir>/<prefix><timestamp>/metrics.jsonl`
    pub fn with_logging_dir(logging_dir: &Path, log_prefix: Option<&str>) -> Result<Self> {
        let run_name = format!(
            "{}{}",
            log_prefix.unwrap_or(""),
            chrono::Local::now().format("%Y%m%d%H%M%S")
        );
        let run_dir = logging_dir.join(run_name);
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create logging dir {}", run_dir.display()))?;

        let path = run_dir.join("metrics.jsonl");
        let file = File::create(&path)
            .with_context(|| format!("Failed to create metrics file {}", path.display()))?;
        info!("Logging metrics to {}", path.display());

        Ok(Self {
            metrics: Some(BufWriter::new(file)),
            metrics_path: Some(path),
        })
    }

    pub fn metrics_path(&self) -> Option<&Path> {
        self.metrics_path.as_deref()
    }
}

impl Default for LocalAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accelerator for LocalAccelerator {
    fn num_processes(&self) -> usize {
        1
    }

    fn process_index(&self) -> usize {
        0
    }

    fn reduce_gradient(&self, grad: &Tensor) -> Result<Tensor> {
        Ok(grad.clone())
    }

    fn wait_for_everyone(&self) -> Result<()> {
        Ok(())
    }

    fn log(&mut self, step: usize, metrics: &[(&str, f64)]) -> Result<()> {
        let Some(writer) = self.metrics.as_mut() else {
            return Ok(());
        };

        let mut record = serde_json::Map::new();
        record.insert("step".to_string(), serde_json::json!(step));
        for (name, value) in metrics {
            record.insert(name.to_string(), serde_json::json!(value));
        }
        serde_json::to_writer(&mut *writer, &serde_json::Value::Object(record))?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn end_training(&mut self) -> Result<()> {
        if let Some(writer) = self.metrics.as_mut() {
            writer.flush()?;
        }
        debug!("Accelerator released");
        Ok(())
    }
}

/// Epoch and step counters shared with data loading workers.
/// The training loop is the only writer.
#[derive(Debug, Clone, Default)]
pub struct TrainingProgress {
    epoch: Arc<AtomicUsize>,
    step: Arc<AtomicUsize>,
}

impl TrainingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn step(&self) -> usize {
        self.step.load(Ordering::Acquire)
    }

    pub fn set_epoch(&self, epoch: usize) {
        self.epoch.store(epoch, Ordering::Release);
    }

    pub fn set_step(&self, step: usize) {
        self.step.store(step, Ordering::Release);
    }
}

/// Gradient accumulation helper
pub struct GradientAccumulator {
    steps: usize,
    accumulated: Option<Tensor>,
}

impl GradientAccumulator {
    pub fn new(steps: usize) -> Result<Self> {
        if steps == 0 {
            bail!("gradient_accumulation_steps must be at least 1");
        }
        Ok(Self {
            steps,
            accumulated: None,
        })
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn accumulate(&mut self, grad: &Tensor) -> Result<()> {
        self.accumulated = Some(match self.accumulated.take() {
            Some(acc) => (acc + grad)?,
            None => grad.clone(),
        });
        Ok(())
    }

    /// True on the last micro-step of a window and on the epoch's last batch
    pub fn is_sync_step(&self, batch_index: usize, num_batches: usize) -> bool {
        (batch_index + 1) % self.steps == 0 || batch_index + 1 == num_batches
    }

    pub fn get_and_reset(&mut self) -> Option<Tensor> {
        self.accumulated.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use tempfile::tempdir;

    #[test]
    fn test_sync_steps() {
        let acc = GradientAccumulator::new(3).unwrap();
        let syncs: Vec<usize> = (0..7).filter(|&i| acc.is_sync_step(i, 7)).collect();
        assert_eq!(syncs, vec![2, 5, 6]);
        assert!(GradientAccumulator::new(0).is_err());
    }

    #[test]
    fn test_accumulate_sums_and_resets() {
        let mut acc = GradientAccumulator::new(2).unwrap();
        let g = Tensor::new(&[1.0f32, 2.0], &Device::Cpu).unwrap();
        acc.accumulate(&g).unwrap();
        acc.accumulate(&g).unwrap();

        let sum = acc.get_and_reset().unwrap();
        assert_eq!(sum.to_vec1::<f32>().unwrap(), vec![2.0, 4.0]);
        assert!(acc.get_and_reset().is_none());
    }

    #[test]
    fn test_progress_is_shared_between_clones() {
        let progress = TrainingProgress::new();
        let reader = progress.clone();
        let handle = std::thread::spawn(move || {
            progress.set_epoch(3);
            progress.set_step(42);
        });
        handle.join().unwrap();

        assert_eq!(reader.epoch(), 3);
        assert_eq!(reader.step(), 42);
    }

    #[test]
    fn test_metrics_jsonl() {
        let dir = tempdir().unwrap();
        let mut acc = LocalAccelerator::with_logging_dir(dir.path(), Some("ti-")).unwrap();
        acc.log(1, &[("loss", 0.5), ("lr", 0.001)]).unwrap();
        acc.log(2, &[("loss/epoch", 0.25)]).unwrap();
        acc.end_training().unwrap();

        let path = acc.metrics_path().unwrap().to_path_buf();
        assert!(path
            .parent()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("ti-"));
        let lines: Vec<serde_json::Value> = fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["step"], 1);
        assert_eq!(lines[0]["loss"], 0.5);
        assert_eq!(lines[1]["loss/epoch"], 0.25);
    }
}
