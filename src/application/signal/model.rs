//! Optional probability backend: a logistic model over the indicator
//! features with Platt calibration, loaded from a JSON weights file. When no
//! model is configured the engine falls back to a heuristic mapping of
//! confidence.

use crate::domain::types::{SignalFeatures, SignalSide};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Feature vector order used by the model, fixed across training and
/// inference: [trend, rsi, volatility, adx].
fn feature_vector(features: &SignalFeatures) -> [f64; 4] {
    let trend = if features.ema_slow.abs() > f64::EPSILON {
        features.ema_fast / features.ema_slow - 1.0
    } else {
        0.0
    };
    let volatility = if features.last_close.abs() > f64::EPSILON {
        features.atr / features.last_close
    } else {
        0.0
    };
    [trend, features.rsi / 100.0, volatility, features.adx / 100.0]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbModelSpec {
    pub weights: [f64; 4],
    pub bias: f64,
    /// Platt scaling coefficients applied to the raw logit.
    pub platt_a: f64,
    pub platt_b: f64,
}

pub struct ProbabilityModel {
    spec: ProbModelSpec,
}

impl ProbabilityModel {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model file {}", path.display()))?;
        let spec: ProbModelSpec = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse model file {}", path.display()))?;
        info!("ProbabilityModel: Loaded weights from {}", path.display());
        Ok(Self { spec })
    }

    pub fn from_spec(spec: ProbModelSpec) -> Self {
        Self { spec }
    }

    /// Calibrated probability that the given side is the right one.
    /// The model scores the buy direction; sell probabilities mirror it.
    pub fn probability(&self, features: &SignalFeatures, side: SignalSide) -> f64 {
        let x = feature_vector(features);
        let logit: f64 = self.spec.bias
            + self
                .spec
                .weights
                .iter()
                .zip(x.iter())
                .map(|(w, v)| w * v)
                .sum::<f64>();
        let calibrated = sigmoid(self.spec.platt_a * logit + self.spec.platt_b);
        match side {
            SignalSide::Buy => calibrated,
            SignalSide::Sell => 1.0 - calibrated,
            SignalSide::Hold => 0.5,
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Default mapping when no model is loaded: confidence linearly widens the
/// probability away from coin-flip, capped below certainty.
pub fn heuristic_probability(confidence: f64) -> f64 {
    (0.5 + 0.4 * confidence.clamp(0.0, 1.0)).clamp(0.0, 0.95)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(ema_fast: f64, ema_slow: f64, rsi: f64, adx: f64) -> SignalFeatures {
        SignalFeatures {
            ema_fast,
            ema_slow,
            rsi,
            atr: 50.0,
            adx,
            last_close: 30_000.0,
        }
    }

    fn trend_model() -> ProbabilityModel {
        ProbabilityModel::from_spec(ProbModelSpec {
            weights: [50.0, 1.0, 0.0, 0.5],
            bias: -0.8,
            platt_a: 1.0,
            platt_b: 0.0,
        })
    }

    #[test]
    fn test_uptrend_scores_above_half_for_buy() {
        let model = trend_model();
        let p = model.probability(&features(30_500.0, 30_000.0, 65.0, 30.0), SignalSide::Buy);
        assert!(p > 0.5, "uptrend buy probability should exceed 0.5, got {}", p);
    }

    #[test]
    fn test_sell_mirrors_buy() {
        let model = trend_model();
        let f = features(30_500.0, 30_000.0, 65.0, 30.0);
        let buy = model.probability(&f, SignalSide::Buy);
        let sell = model.probability(&f, SignalSide::Sell);
        assert!((buy + sell - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_probability_bounded() {
        let model = trend_model();
        for (fast, slow) in [(40_000.0, 30_000.0), (20_000.0, 30_000.0)] {
            let p = model.probability(&features(fast, slow, 50.0, 20.0), SignalSide::Buy);
            assert!((0.0..=1.0).contains(&p));
        }
    }

    #[test]
    fn test_heuristic_probability_shape() {
        assert!((heuristic_probability(0.0) - 0.5).abs() < 1e-12);
        assert!((heuristic_probability(1.0) - 0.9).abs() < 1e-12);
        assert!(heuristic_probability(2.0) <= 0.95);
        assert!(heuristic_probability(-1.0) >= 0.5);
    }

    #[test]
    fn test_model_file_roundtrip() {
        let path = std::env::temp_dir().join(format!(
            "bfxtrader-model-{}.json",
            std::process::id()
        ));
        let spec = ProbModelSpec {
            weights: [1.0, 2.0, 3.0, 4.0],
            bias: 0.1,
            platt_a: 0.9,
            platt_b: -0.05,
        };
        std::fs::write(&path, serde_json::to_string(&spec).unwrap()).unwrap();
        let model = ProbabilityModel::load(&path).unwrap();
        assert!((model.spec.platt_a - 0.9).abs() < 1e-12);
    }
}
