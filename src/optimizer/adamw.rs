//! AdamW over raw f32 spans
//!
//! Decoupled weight decay (Loshchilov & Hutter, 2019) applied to the
//! locally owned shard of each parameter. The sharded optimizer holds the
//! per-shard state (master copy, m, v); this type holds only the shared
//! hyperparameters and the timestep.

/// AdamW configuration
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// AdamW update rule with bias correction.
///
/// The timestep advances once per *applied* optimizer step; overflow-skipped
/// steps leave it untouched.
pub struct AdamW {
    config: AdamWConfig,
    timestep: u64,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            timestep: 0,
        }
    }

    /// Advance to the next timestep. Call once per applied step, before any
    /// `update_span` for that step.
    pub fn advance(&mut self) -> u64 {
        self.timestep += 1;
        self.timestep
    }

    /// Update one owned span in place.
    ///
    /// `master`, `grad`, `m` and `v` must all have the span's length.
    pub fn update_span(&self, master: &mut [f32], grad: &[f32], m: &mut [f32], v: &mut [f32]) {
        debug_assert!(self.timestep > 0, "advance() before update_span()");
        debug_assert_eq!(master.len(), grad.len());
        debug_assert_eq!(master.len(), m.len());
        debug_assert_eq!(master.len(), v.len());

        let t = self.timestep as i32;
        let beta1 = self.config.beta1;
        let beta2 = self.config.beta2;
        let lr = self.config.lr;
        let eps = self.config.eps;
        let wd = self.config.weight_decay;

        let bc1 = 1.0 - beta1.powi(t);
        let bc2 = 1.0 - beta2.powi(t);
        let step_size = lr * bc2.sqrt() / bc1;

        for i in 0..master.len() {
            let g = grad[i] as f64;
            let m_new = beta1 * m[i] as f64 + (1.0 - beta1) * g;
            let v_new = beta2 * v[i] as f64 + (1.0 - beta2) * g * g;
            m[i] = m_new as f32;
            v[i] = v_new as f32;

            let mut p = master[i] as f64;
            p -= lr * wd * p;
            p -= step_size * m_new / (v_new.sqrt() + eps);
            master[i] = p as f32;
        }
    }

    pub fn timestep(&self) -> u64 {
        self.timestep
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    pub fn reset(&mut self) {
        self.timestep = 0;
    }

    /// Adopt a timestep restored from a checkpoint shard.
    pub fn restore_timestep(&mut self, timestep: u64) {
        self.timestep = timestep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adamw_default_config() {
        let config = AdamWConfig::default();
        assert_eq!(config.lr, 1e-3);
        assert_eq!(config.beta1, 0.9);
        assert_eq!(config.beta2, 0.999);
        assert_eq!(config.eps, 1e-8);
        assert_eq!(config.weight_decay, 0.01);
    }

    #[test]
    fn test_update_moves_against_gradient() {
        let mut opt = AdamW::new(AdamWConfig {
            lr: 0.1,
            weight_decay: 0.0,
            ..Default::default()
        });
        opt.advance();

        let mut master = vec![5.0f32, -5.0];
        let grad = vec![1.0f32, -1.0];
        let mut m = vec![0.0f32; 2];
        let mut v = vec![0.0f32; 2];
        opt.update_span(&mut master, &grad, &mut m, &mut v);

        assert!(master[0] < 5.0, "positive grad should decrease param");
        assert!(master[1] > -5.0, "negative grad should increase param");
        assert!(m[0] > 0.0 && v[0] > 0.0, "moments should accumulate");
    }

    #[test]
    fn test_weight_decay_shrinks_params() {
        let mut opt = AdamW::new(AdamWConfig {
            lr: 0.1,
            weight_decay: 0.1,
            ..Default::default()
        });
        opt.advance();

        let mut master = vec![5.0f32];
        let grad = vec![0.0f32];
        let mut m = vec![0.0f32];
        let mut v = vec![0.0f32];
        opt.update_span(&mut master, &grad, &mut m, &mut v);

        assert!(master[0] < 5.0, "weight decay should shrink params, got {}", master[0]);
    }

    #[test]
    fn test_repeated_steps_converge_toward_minimum() {
        // Minimize (x - 1)^2 by feeding grad = 2(x - 1).
        let mut opt = AdamW::new(AdamWConfig {
            lr: 0.1,
            weight_decay: 0.0,
            ..Default::default()
        });
        let mut master = vec![0.0f32];
        let mut m = vec![0.0f32];
        let mut v = vec![0.0f32];
        for _ in 0..100 {
            opt.advance();
            let grad = vec![2.0 * (master[0] - 1.0)];
            opt.update_span(&mut master, &grad, &mut m, &mut v);
        }
        assert!(
            (master[0] - 1.0).abs() < 0.1,
            "x should approach 1.0, got {}",
            master[0]
        );
    }

    #[test]
    fn test_timestep_and_reset() {
        let mut opt = AdamW::new(AdamWConfig::default());
        assert_eq!(opt.timestep(), 0);
        opt.advance();
        opt.advance();
        assert_eq!(opt.timestep(), 2);
        opt.reset();
        assert_eq!(opt.timestep(), 0);
    }

    #[test]
    fn test_set_lr() {
        let mut opt = AdamW::new(AdamWConfig::default());
        opt.set_lr(0.01);
        assert_eq!(opt.config().lr, 0.01);
    }
}
