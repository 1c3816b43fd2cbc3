//! Dynamic loss scaling
//!
//! FP16 gradients underflow without scaling; the scaler multiplies the loss
//! by a large factor before backward and unscales gradients afterwards. On
//! overflow the step is skipped and the scale backs off; after enough clean
//! steps it grows again. Bounded by `min_scale`/`max_scale`, and growth is
//! additionally held back for `hysteresis` steps after any overflow.

use crate::error::{Error, Result};

/// Dynamic loss scaler with bounded growth/backoff and overflow hysteresis.
#[derive(Debug, Clone)]
pub struct DynamicGradScaler {
    scale: f64,
    min_scale: f64,
    max_scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: u64,
    hysteresis: u64,
    consecutive_good: u64,
    steps_since_overflow: Option<u64>,
}

impl DynamicGradScaler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        initial_scale: f64,
        min_scale: f64,
        max_scale: f64,
        growth_factor: f64,
        backoff_factor: f64,
        growth_interval: u64,
        hysteresis: u64,
    ) -> Result<Self> {
        if initial_scale <= 0.0 {
            return Err(Error::config(format!(
                "initial_scale must be positive, got {initial_scale}"
            )));
        }
        if min_scale <= 0.0 || min_scale > initial_scale || initial_scale > max_scale {
            return Err(Error::config(format!(
                "scale bounds must satisfy 0 < min_scale <= initial_scale <= max_scale, \
                 got min={min_scale} initial={initial_scale} max={max_scale}"
            )));
        }
        if growth_factor <= 1.0 {
            return Err(Error::config(format!(
                "growth_factor must be > 1.0, got {growth_factor}"
            )));
        }
        if backoff_factor <= 0.0 || backoff_factor >= 1.0 {
            return Err(Error::config(format!(
                "backoff_factor must be in (0, 1), got {backoff_factor}"
            )));
        }
        if growth_interval == 0 {
            return Err(Error::config("growth_interval must be > 0"));
        }
        Ok(Self {
            scale: initial_scale,
            min_scale,
            max_scale,
            growth_factor,
            backoff_factor,
            growth_interval,
            hysteresis,
            consecutive_good: 0,
            steps_since_overflow: None,
        })
    }

    /// Current loss scale. Multiply the loss by this before backward.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// `1 / scale`, applied to gradients before the overflow check.
    pub fn inv_scale(&self) -> f64 {
        1.0 / self.scale
    }

    /// Record a step outcome and adjust the scale.
    ///
    /// Overflow halves (times `backoff_factor`) the scale, clamped at
    /// `min_scale`, and resets the clean-step counter. The scale grows by
    /// `growth_factor`, clamped at `max_scale`, only after `growth_interval`
    /// consecutive clean steps, and never within `hysteresis` steps of the
    /// last overflow.
    pub fn update(&mut self, overflow: bool) {
        if overflow {
            self.scale = (self.scale * self.backoff_factor).max(self.min_scale);
            self.consecutive_good = 0;
            self.steps_since_overflow = Some(0);
            return;
        }

        self.consecutive_good += 1;
        if let Some(steps) = &mut self.steps_since_overflow {
            *steps += 1;
        }
        let held_back = matches!(self.steps_since_overflow, Some(s) if s < self.hysteresis);
        if self.consecutive_good >= self.growth_interval && !held_back {
            self.scale = (self.scale * self.growth_factor).min(self.max_scale);
            self.consecutive_good = 0;
        }
    }
}

/// Whether any value in the spans is NaN or infinite.
pub fn spans_have_overflow<'a>(spans: impl IntoIterator<Item = &'a [f32]>) -> bool {
    spans
        .into_iter()
        .any(|span| span.iter().any(|v| !v.is_finite()))
}
