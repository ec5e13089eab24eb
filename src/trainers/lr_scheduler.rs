//! Learning rate schedules, indexed by optimizer step

use anyhow::{bail, Result};
use std::f64::consts::PI;

/// Learning rate scheduler trait
pub trait LRScheduler: Send {
    fn get_lr(&self, step: usize) -> f64;
}

/// Names accepted by [`create_scheduler`]
pub const SCHEDULER_NAMES: &[&str] = &[
    "constant",
    "constant_with_warmup",
    "linear",
    "cosine",
    "cosine_with_restarts",
    "polynomial",
];

/// Create a learning rate scheduler
pub fn create_scheduler(
    scheduler_type: &str,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    num_cycles: Option<usize>,
    power: Option<f64>,
) -> Result<Box<dyn LRScheduler>> {
    let warmup = Warmup {
        base_lr,
        warmup_steps,
        total_steps,
    };
    match scheduler_type {
        "constant" => Ok(Box::new(ConstantScheduler { lr: base_lr })),
        "constant_with_warmup" => Ok(Box::new(ConstantWarmupScheduler { warmup })),
        "linear" => Ok(Box::new(LinearScheduler { warmup })),
        "cosine" => Ok(Box::new(CosineScheduler { warmup })),
        "cosine_with_restarts" => Ok(Box::new(CosineRestartsScheduler {
            warmup,
            num_cycles: num_cycles.unwrap_or(1).max(1),
        })),
        "polynomial" => Ok(Box::new(PolynomialScheduler {
            warmup,
            power: power.unwrap_or(1.0),
            lr_end: 1e-7,
        })),
        other => bail!(
            "Unknown lr_scheduler {:?}, expected one of {:?}",
            other,
            SCHEDULER_NAMES
        ),
    }
}

/// Shared linear warmup, then a decay over the remaining steps
#[derive(Clone, Copy)]
struct Warmup {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl Warmup {
    /// Some(lr) while still warming up
    fn warming(&self, step: usize) -> Option<f64> {
        (step < self.warmup_steps)
            .then(|| self.base_lr * step as f64 / self.warmup_steps.max(1) as f64)
    }

    /// Fraction of the post-warmup steps already taken, in [0, 1]
    fn progress(&self, step: usize) -> f64 {
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        (step.saturating_sub(self.warmup_steps) as f64 / decay_steps as f64).min(1.0)
    }
}

struct ConstantScheduler {
    lr: f64,
}

impl LRScheduler for ConstantScheduler {
    fn get_lr(&self, _step: usize) -> f64 {
        self.lr
    }
}

struct ConstantWarmupScheduler {
    warmup: Warmup,
}

impl LRScheduler for ConstantWarmupScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        self.warmup.warming(step).unwrap_or(self.warmup.base_lr)
    }
}

struct LinearScheduler {
    warmup: Warmup,
}

impl LRScheduler for LinearScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        self.warmup
            .warming(step)
            .unwrap_or_else(|| self.warmup.base_lr * (1.0 - self.warmup.progress(step)))
    }
}

/// Half a cosine wave from base_lr to zero
struct CosineScheduler {
    warmup: Warmup,
}

impl LRScheduler for CosineScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        self.warmup.warming(step).unwrap_or_else(|| {
            let progress = self.warmup.progress(step);
            self.warmup.base_lr * 0.5 * (1.0 + (PI * progress).cos())
        })
    }
}

/// Hard restarts: `num_cycles` half-cosines back to back
struct CosineRestartsScheduler {
    warmup: Warmup,
    num_cycles: usize,
}

impl LRScheduler for CosineRestartsScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        self.warmup.warming(step).unwrap_or_else(|| {
            let progress = self.warmup.progress(step);
            if progress >= 1.0 {
                return 0.0;
            }
            let cycle_progress = (self.num_cycles as f64 * progress) % 1.0;
            self.warmup.base_lr * 0.5 * (1.0 + (PI * cycle_progress).cos())
        })
    }
}

struct PolynomialScheduler {
    warmup: Warmup,
    power: f64,
    lr_end: f64,
}

impl LRScheduler for PolynomialScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        self.warmup.warming(step).unwrap_or_else(|| {
            let base = self.warmup.base_lr;
            if base <= self.lr_end {
                return base;
            }
            let remaining = 1.0 - self.warmup.progress(step);
            (base - self.lr_end) * remaining.powf(self.power) + self.lr_end
        })
    }
}
