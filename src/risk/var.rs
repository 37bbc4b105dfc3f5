use log::warn;
use serde::Serialize;
use std::collections::VecDeque;

use crate::config::VarConfig;

/// Below this many observations VaR and CVaR report 0.0
pub const MIN_HISTORY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VarEstimate {
    pub var: f64,
    pub cvar: f64,
}

impl VarEstimate {
    pub const ZERO: VarEstimate = VarEstimate { var: 0.0, cvar: 0.0 };
}

/// Historical-simulation VaR and CVaR of `returns` at `confidence`.
///
/// Losses are reported as positive fractions and floored at zero.
pub fn historical_var_cvar(returns: &[f64], confidence: f64) -> VarEstimate {
    let n = returns.len();
    if n == 0 {
        return VarEstimate::ZERO;
    }

    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let tail = ((1.0 - confidence) * n as f64).floor() as usize;
    let cutoff = tail.max(1).min(n);

    let var = -sorted[cutoff - 1];
    let cvar = -(sorted[..cutoff].iter().sum::<f64>() / cutoff as f64);

    VarEstimate {
        var: var.max(0.0),
        cvar: cvar.max(0.0),
    }
}

/// Rolling window of realised daily returns used as a pre-trade risk gate
#[derive(Debug, Clone)]
pub struct PortfolioVaR {
    window: usize,
    confidence: f64,
    returns: VecDeque<f64>,
}

impl PortfolioVaR {
    pub fn new(window: usize) -> Self {
        Self::with_confidence(window, 0.95)
    }

    pub fn with_confidence(window: usize, confidence: f64) -> Self {
        let window = window.max(1);
        Self {
            window,
            confidence,
            returns: VecDeque::with_capacity(window),
        }
    }

    pub fn from_config(config: &VarConfig) -> Self {
        Self::with_confidence(config.window, config.confidence)
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Append one daily return, evicting the oldest once the window is full.
    /// NaN and infinite returns are rejected and leave the window untouched;
    /// the return value says whether the observation was recorded.
    pub fn update(&mut self, daily_return: f64) -> bool {
        if !daily_return.is_finite() {
            warn!("Rejecting non-finite daily return {}", daily_return);
            return false;
        }
        if self.returns.len() == self.window {
            self.returns.pop_front();
        }
        self.returns.push_back(daily_return);
        true
    }

    pub fn history_length(&self) -> usize {
        self.returns.len()
    }

    pub fn reset(&mut self) {
        self.returns.clear();
    }

    fn estimate(&self) -> VarEstimate {
        if self.returns.len() < MIN_HISTORY {
            return VarEstimate::ZERO;
        }
        let (front, back) = self.returns.as_slices();
        if back.is_empty() {
            historical_var_cvar(front, self.confidence)
        } else {
            let joined: Vec<f64> = self.returns.iter().copied().collect();
            historical_var_cvar(&joined, self.confidence)
        }
    }

    /// VaR and CVaR at the configured confidence
    pub fn estimate_at_confidence(&self) -> VarEstimate {
        self.estimate()
    }

    /// VaR at the configured confidence (0.95 unless built `with_confidence`)
    pub fn var95(&self) -> f64 {
        self.estimate().var
    }

    /// CVaR at the configured confidence (0.95 unless built `with_confidence`)
    pub fn cvar95(&self) -> f64 {
        self.estimate().cvar
    }

    /// Fails open: disabled gate or short history always passes
    pub fn is_within_limit(&self, max_var_pct: f64) -> bool {
        if max_var_pct <= 0.0 {
            return true;
        }
        if self.returns.len() < MIN_HISTORY {
            return true;
        }
        self.var95() <= max_var_pct
    }
}

impl Default for PortfolioVaR {
    fn default() -> Self {
        Self::from_config(&VarConfig::default())
    }
}
