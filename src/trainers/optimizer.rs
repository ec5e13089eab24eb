//! AdamW for the token embedding table
//! Moments are kept in F32 for the whole table so the state can be saved
//! and restored as two plain tensors

use anyhow::{bail, Result};
use candle_core::{DType, Tensor, Var};

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// State for checkpoint saving/loading
#[derive(Debug, Clone)]
pub struct AdamWState {
    pub step: usize,
    pub exp_avg: Tensor,
    pub exp_avg_sq: Tensor,
}

pub struct EmbeddingAdamW {
    config: AdamWConfig,
    exp_avg: Option<Tensor>,
    exp_avg_sq: Option<Tensor>,
    step: usize,
}

impl EmbeddingAdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            exp_avg: None,
            exp_avg_sq: None,
            step: 0,
        }
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    /// Get current step count
    pub fn get_step(&self) -> usize {
        self.step
    }

    /// One update of `param` at learning rate `lr`. Weight decay is
    /// decoupled and touches every row of the table.
    pub fn step(&mut self, param: &Var, grad: &Tensor, lr: f64) -> Result<()> {
        if grad.dims() != param.dims() {
            bail!(
                "gradient shape {:?} does not match parameter shape {:?}",
                grad.dims(),
                param.dims()
            );
        }
        self.step += 1;
        let AdamWConfig {
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;

        let grad = grad.to_dtype(DType::F32)?;
        let value = param.as_detached_tensor().to_dtype(DType::F32)?;

        let (m, v) = match (&self.exp_avg, &self.exp_avg_sq) {
            (Some(m), Some(v)) => (m.clone(), v.clone()),
            _ => (grad.zeros_like()?, grad.zeros_like()?),
        };
        let m = ((m * beta1)? + (&grad * (1.0 - beta1))?)?;
        let v = ((v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

        let bias_correction1 = 1.0 - beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.step as i32);
        let m_hat = (&m / bias_correction1)?;
        let denom = ((&v / bias_correction2)?.sqrt()? + eps)?;

        let decayed = (value * (1.0 - lr * weight_decay))?;
        let updated = (decayed - (m_hat / denom)? * lr)?;

        param.set(&updated.to_dtype(param.dtype())?)?;
        self.exp_avg = Some(m);
        self.exp_avg_sq = Some(v);
        Ok(())
    }

    /// Get optimizer state for checkpoint saving, None before the first step
    pub fn get_state(&self) -> Option<AdamWState> {
        match (&self.exp_avg, &self.exp_avg_sq) {
            (Some(m), Some(v)) => Some(AdamWState {
                step: self.step,
                exp_avg: m.clone(),
                exp_avg_sq: v.clone(),
            }),
            _ => None,
        }
    }

    /// Load optimizer state from checkpoint
    pub fn load_state(&mut self, state: AdamWState) -> Result<()> {
        if state.exp_avg.dims() != state.exp_avg_sq.dims() {
            bail!(
                "optimizer moments disagree: {:?} vs {:?}",
                state.exp_avg.dims(),
                state.exp_avg_sq.dims()
            );
        }
        self.step = state.step;
        self.exp_avg = Some(state.exp_avg.to_dtype(DType::F32)?);
        self.exp_avg_sq = Some(state.exp_avg_sq.to_dtype(DType::F32)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_first_step_moves_by_lr() {
        // With bias correction the first Adam step is lr * sign(grad)
        let param = Var::new(&[[1.0f32, -1.0]], &Device::Cpu).unwrap();
        let grad = Tensor::new(&[[0.5f32, -2.0]], &Device::Cpu).unwrap();
        let mut opt = EmbeddingAdamW::new(AdamWConfig {
            weight_decay: 0.0,
            ..Default::default()
        });

        opt.step(&param, &grad, 0.1).unwrap();

        let value = param.as_tensor().to_vec2::<f32>().unwrap();
        assert!((value[0][0] - 0.9).abs() < 1e-5);
        assert!((value[0][1] + 0.9).abs() < 1e-5);
        assert_eq!(opt.get_step(), 1);
    }

    #[test]
    fn test_weight_decay_touches_zero_grad_rows() {
        let param = Var::new(&[[2.0f32], [2.0]], &Device::Cpu).unwrap();
        let grad = Tensor::new(&[[0.0f32], [1.0]], &Device::Cpu).unwrap();
        let mut opt = EmbeddingAdamW::new(AdamWConfig::default());

        opt.step(&param, &grad, 0.1).unwrap();

        let value = param.as_tensor().to_vec2::<f32>().unwrap();
        // 2 * (1 - 0.1 * 0.01)
        assert!((value[0][0] - 1.998).abs() < 1e-6);
        assert!(value[1][0] < 1.9);
    }

    #[test]
    fn test_state_round_trip_continues_identically() {
        let grads = [
            Tensor::new(&[[0.3f32, -0.1]], &Device::Cpu).unwrap(),
            Tensor::new(&[[-0.2f32, 0.4]], &Device::Cpu).unwrap(),
        ];

        let a = Var::new(&[[0.5f32, 0.5]], &Device::Cpu).unwrap();
        let mut opt_a = EmbeddingAdamW::new(AdamWConfig::default());
        opt_a.step(&a, &grads[0], 0.01).unwrap();

        let b = Var::from_tensor(&a.as_tensor().copy().unwrap()).unwrap();
        let mut opt_b = EmbeddingAdamW::new(AdamWConfig::default());
        opt_b.load_state(opt_a.get_state().unwrap()).unwrap();

        opt_a.step(&a, &grads[1], 0.01).unwrap();
        opt_b.step(&b, &grads[1], 0.01).unwrap();

        assert_eq!(
            a.as_tensor().to_vec2::<f32>().unwrap(),
            b.as_tensor().to_vec2::<f32>().unwrap()
        );
        assert_eq!(opt_b.get_step(), 2);
    }

    #[test]
    fn test_shape_mismatch() {
        let param = Var::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap();
        let grad = Tensor::new(&[1.0f32, 2.0], &Device::Cpu).unwrap();
        assert!(EmbeddingAdamW::new(AdamWConfig::default())
            .step(&param, &grad, 0.1)
            .is_err());
    }
}
