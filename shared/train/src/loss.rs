use covalent_data_provider::{AssembledBatch, TargetColumn, TargetMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// How a term's per-structure residual is scaled before averaging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Normalization {
    /// Residual used as-is.
    #[default]
    PerStructure,
    /// Residual divided by the structure's atom count.
    PerAtom,
}

#[derive(Debug, Error)]
pub enum LossError {
    #[error("batch is missing required target '{0}'")]
    MissingTarget(String),

    #[error("model produced no prediction for target '{0}'")]
    MissingPrediction(String),

    #[error("target '{name}': prediction has {predicted} values, label has {expected}")]
    ShapeMismatch {
        name: String,
        predicted: usize,
        expected: usize,
    },

    #[error("target '{name}': prediction and label disagree on per-structure vs per-atom layout")]
    KindMismatch { name: String },
}

#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("unknown loss component '{0}' (known: mse, mae, huber)")]
    Unknown(String),

    #[error("invalid kwargs for loss component '{name}': {message}")]
    Kwargs { name: String, message: String },
}

/// Elementwise residual of one structure's values; the aggregator handles
/// normalization and batch averaging.
pub trait LossComponent: Send + Sync + std::fmt::Debug {
    fn residual(&self, predicted: &[f64], expected: &[f64]) -> f64;
}

#[derive(Debug, Clone, Copy)]
pub struct Mse;

impl LossComponent for Mse {
    fn residual(&self, predicted: &[f64], expected: &[f64]) -> f64 {
        predicted
            .iter()
            .zip(expected)
            .map(|(p, e)| (p - e) * (p - e))
            .sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Mae;

impl LossComponent for Mae {
    fn residual(&self, predicted: &[f64], expected: &[f64]) -> f64 {
        predicted.iter().zip(expected).map(|(p, e)| (p - e).abs()).sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Huber {
    pub delta: f64,
}

impl LossComponent for Huber {
    fn residual(&self, predicted: &[f64], expected: &[f64]) -> f64 {
        predicted
            .iter()
            .zip(expected)
            .map(|(p, e)| {
                let d = (p - e).abs();
                if d <= self.delta {
                    0.5 * d * d
                } else {
                    self.delta * (d - 0.5 * self.delta)
                }
            })
            .sum()
    }
}

/// Resolves a configured component tag. Called eagerly at startup so an
/// unknown tag or bad kwargs never survives into the first epoch.
pub fn component_from_name(
    name: &str,
    kwargs: &serde_json::Value,
) -> Result<Box<dyn LossComponent>, ComponentError> {
    let kwargs = match kwargs {
        serde_json::Value::Null => serde_json::Value::Object(Default::default()),
        other => other.clone(),
    };
    match name {
        "mse" => Ok(Box::new(Mse)),
        "mae" => Ok(Box::new(Mae)),
        "huber" => {
            #[derive(Deserialize)]
            #[serde(deny_unknown_fields)]
            struct HuberKwargs {
                #[serde(default = "default_delta")]
                delta: f64,
            }
            fn default_delta() -> f64 {
                1.0
            }
            let kw: HuberKwargs =
                serde_json::from_value(kwargs).map_err(|e| ComponentError::Kwargs {
                    name: name.to_string(),
                    message: e.to_string(),
                })?;
            Ok(Box::new(Huber { delta: kw.delta }))
        }
        other => Err(ComponentError::Unknown(other.to_string())),
    }
}

/// One weighted, normalized component of the training objective. Static
/// after construction.
#[derive(Debug)]
pub struct LossTerm {
    pub name: String,
    /// Key into the batch's target map (usually equal to `name`).
    pub target: String,
    pub weight: f64,
    pub normalization: Normalization,
    pub component: Box<dyn LossComponent>,
}

/// Per-term pre-reduction partials: the sum of normalized residuals and the
/// number of structures it covers. Distributed validation all-reduces these
/// before dividing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TermPartial {
    pub sum: f64,
    pub count: u64,
}

#[derive(Debug, Clone)]
pub struct TermValue {
    /// Unweighted normalized mean over the batch, for observability.
    pub mean: f64,
    pub weight: f64,
    pub partial: TermPartial,
}

#[derive(Debug, Clone)]
pub struct LossBreakdown {
    /// Weighted sum of per-term means.
    pub total: f64,
    pub terms: BTreeMap<String, TermValue>,
}

/// Accumulated partials over many batches (and, after reduction, ranks).
#[derive(Debug, Clone, Default)]
pub struct LossPartials {
    terms: BTreeMap<String, (f64, TermPartial)>,
}

impl LossPartials {
    pub fn accumulate(&mut self, breakdown: &LossBreakdown) {
        for (name, value) in &breakdown.terms {
            let entry = self
                .terms
                .entry(name.clone())
                .or_insert((value.weight, TermPartial::default()));
            entry.1.sum += value.partial.sum;
            entry.1.count += value.partial.count;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Raw (weight, sum, count) rows, mutable for in-place reduction.
    pub fn partials_mut(&mut self) -> impl Iterator<Item = (&str, &mut TermPartial)> {
        self.terms.iter_mut().map(|(k, v)| (k.as_str(), &mut v.1))
    }

    pub fn term_means(&self) -> BTreeMap<String, f64> {
        self.terms
            .iter()
            .filter(|(_, (_, p))| p.count > 0)
            .map(|(k, (_, p))| (k.clone(), p.sum / p.count as f64))
            .collect()
    }

    /// Weighted objective over everything accumulated so far.
    pub fn total(&self) -> f64 {
        self.terms
            .values()
            .filter(|(_, p)| p.count > 0)
            .map(|(weight, p)| weight * p.sum / p.count as f64)
            .sum()
    }
}

/// Sums per-rank loss partials across the distributed group. The collective
/// itself is an external concern; single-process runs use [`LocalReducer`].
pub trait MetricReducer: Send + Sync {
    fn all_reduce(&self, partials: &mut LossPartials) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalReducer;

impl MetricReducer for LocalReducer {
    fn all_reduce(&self, _partials: &mut LossPartials) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Combines independently configured loss terms into one scalar objective.
#[derive(Debug)]
pub struct LossAggregator {
    terms: Vec<LossTerm>,
}

impl LossAggregator {
    pub fn new(terms: Vec<LossTerm>) -> Self {
        Self { terms }
    }

    pub fn terms(&self) -> &[LossTerm] {
        &self.terms
    }

    /// Evaluates every term against one batch. The returned total is the
    /// weighted sum of the per-term means also present in the breakdown.
    pub fn evaluate(
        &self,
        batch: &AssembledBatch,
        predictions: &TargetMap,
    ) -> Result<LossBreakdown, LossError> {
        let mut terms = BTreeMap::new();
        let mut total = 0.0;

        for term in &self.terms {
            let expected = batch
                .targets
                .get(&term.target)
                .ok_or_else(|| LossError::MissingTarget(term.target.clone()))?;
            let predicted = predictions
                .get(&term.target)
                .ok_or_else(|| LossError::MissingPrediction(term.target.clone()))?;

            let sum = self.term_sum(term, batch, predicted, expected)?;
            let count = batch.num_structures() as u64;
            let mean = sum / count as f64;
            total += term.weight * mean;
            terms.insert(
                term.name.clone(),
                TermValue {
                    mean,
                    weight: term.weight,
                    partial: TermPartial { sum, count },
                },
            );
        }

        Ok(LossBreakdown { total, terms })
    }

    fn term_sum(
        &self,
        term: &LossTerm,
        batch: &AssembledBatch,
        predicted: &TargetColumn,
        expected: &TargetColumn,
    ) -> Result<f64, LossError> {
        if predicted.len() != expected.len() {
            return Err(LossError::ShapeMismatch {
                name: term.target.clone(),
                predicted: predicted.len(),
                expected: expected.len(),
            });
        }

        let mut sum = 0.0;
        match (predicted, expected) {
            (TargetColumn::PerStructure(pred), TargetColumn::PerStructure(exp)) => {
                if exp.len() != batch.num_structures() {
                    return Err(LossError::ShapeMismatch {
                        name: term.target.clone(),
                        predicted: pred.len(),
                        expected: batch.num_structures(),
                    });
                }
                for (i, n) in batch.atom_counts.iter().enumerate() {
                    let residual = term.component.residual(&pred[i..=i], &exp[i..=i]);
                    sum += normalize(residual, term.normalization, *n);
                }
            }
            (TargetColumn::PerAtom(pred), TargetColumn::PerAtom(exp)) => {
                let total_atoms = batch.total_atoms() as usize;
                let components = if total_atoms > 0 {
                    exp.len() / total_atoms
                } else {
                    0
                };
                if components == 0 || exp.len() != total_atoms * components {
                    return Err(LossError::ShapeMismatch {
                        name: term.target.clone(),
                        predicted: pred.len(),
                        expected: total_atoms,
                    });
                }
                let mut offset = 0;
                for n in &batch.atom_counts {
                    let len = *n as usize * components;
                    let residual = term
                        .component
                        .residual(&pred[offset..offset + len], &exp[offset..offset + len]);
                    sum += normalize(residual, term.normalization, *n);
                    offset += len;
                }
            }
            _ => {
                return Err(LossError::KindMismatch {
                    name: term.target.clone(),
                });
            }
        }
        Ok(sum)
    }
}

fn normalize(residual: f64, normalization: Normalization, num_atoms: u32) -> f64 {
    match normalization {
        Normalization::PerStructure => residual,
        Normalization::PerAtom => residual / f64::from(num_atoms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalent_data_provider::{AssembledBatch, TargetColumn, TargetMap};

    fn term(
        target: &str,
        weight: f64,
        normalization: Normalization,
        component: Box<dyn LossComponent>,
    ) -> LossTerm {
        LossTerm {
            name: target.to_string(),
            target: target.to_string(),
            weight,
            normalization,
            component,
        }
    }

    fn batch() -> AssembledBatch {
        AssembledBatch {
            ids: vec![0, 1],
            atom_counts: vec![2, 4],
            coords: vec![0.0; 18],
            atomic_numbers: vec![1; 6],
            total_charges: vec![0.0, 0.0],
            targets: TargetMap::from([
                (
                    "energy".to_string(),
                    TargetColumn::PerStructure(vec![1.0, 2.0]),
                ),
                (
                    "charges".to_string(),
                    TargetColumn::PerAtom(vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
                ),
            ]),
        }
    }

    fn predictions(energy: [f64; 2], charges: [f64; 6]) -> TargetMap {
        TargetMap::from([
            (
                "energy".to_string(),
                TargetColumn::PerStructure(energy.to_vec()),
            ),
            (
                "charges".to_string(),
                TargetColumn::PerAtom(charges.to_vec()),
            ),
        ])
    }

    #[test]
    fn total_is_weighted_sum_of_term_means() {
        let aggregator = LossAggregator::new(vec![
            term("energy", 2.0, Normalization::PerStructure, Box::new(Mse)),
            term("charges", 0.5, Normalization::PerAtom, Box::new(Mse)),
        ]);
        let breakdown = aggregator
            .evaluate(
                &batch(),
                &predictions([2.0, 4.0], [0.5, 0.5, 0.0, 0.0, 0.0, 0.0]),
            )
            .unwrap();

        let reconstructed: f64 = breakdown
            .terms
            .values()
            .map(|t| t.weight * t.mean)
            .sum();
        assert!((breakdown.total - reconstructed).abs() < 1e-12);

        // energy: residuals (2-1)^2=1 and (4-2)^2=4, mean 2.5
        assert!((breakdown.terms["energy"].mean - 2.5).abs() < 1e-12);
        // charges: structure 0 sum 0.5, / 2 atoms = 0.25; structure 1 is 0
        assert!((breakdown.terms["charges"].mean - 0.125).abs() < 1e-12);
        assert!((breakdown.total - (2.0 * 2.5 + 0.5 * 0.125)).abs() < 1e-12);
    }

    #[test]
    fn per_atom_normalization_divides_by_atom_count() {
        let aggregator = LossAggregator::new(vec![term(
            "energy",
            1.0,
            Normalization::PerAtom,
            Box::new(Mse),
        )]);
        let breakdown = aggregator
            .evaluate(&batch(), &predictions([2.0, 2.0], [0.0; 6]))
            .unwrap();
        // (1.0 / 2 atoms + 0.0 / 4 atoms) / 2 structures
        assert!((breakdown.terms["energy"].mean - 0.25).abs() < 1e-12);
    }

    #[test]
    fn missing_target_is_fatal() {
        let aggregator = LossAggregator::new(vec![term(
            "dipole",
            1.0,
            Normalization::PerStructure,
            Box::new(Mse),
        )]);
        assert!(matches!(
            aggregator.evaluate(&batch(), &predictions([0.0; 2], [0.0; 6])),
            Err(LossError::MissingTarget(name)) if name == "dipole"
        ));
    }

    #[test]
    fn missing_prediction_is_fatal() {
        let aggregator = LossAggregator::new(vec![term(
            "energy",
            1.0,
            Normalization::PerStructure,
            Box::new(Mse),
        )]);
        let mut preds = predictions([0.0; 2], [0.0; 6]);
        preds.remove("energy");
        assert!(matches!(
            aggregator.evaluate(&batch(), &preds),
            Err(LossError::MissingPrediction(name)) if name == "energy"
        ));
    }

    #[test]
    fn layout_disagreement_is_rejected() {
        let aggregator = LossAggregator::new(vec![term(
            "energy",
            1.0,
            Normalization::PerStructure,
            Box::new(Mse),
        )]);
        let preds = TargetMap::from([(
            "energy".to_string(),
            TargetColumn::PerAtom(vec![0.0, 0.0]),
        )]);
        assert!(matches!(
            aggregator.evaluate(&batch(), &preds),
            Err(LossError::KindMismatch { .. })
        ));
    }

    #[test]
    fn partials_recover_the_global_mean() {
        let aggregator = LossAggregator::new(vec![term(
            "energy",
            3.0,
            Normalization::PerStructure,
            Box::new(Mae),
        )]);
        let mut partials = LossPartials::default();
        for shift in [1.0f64, 2.0] {
            let breakdown = aggregator
                .evaluate(
                    &batch(),
                    &predictions([1.0 + shift, 2.0 + shift], [0.0; 6]),
                )
                .unwrap();
            partials.accumulate(&breakdown);
        }
        // batch means are 1.0 and 2.0 over two structures each
        assert!((partials.term_means()["energy"] - 1.5).abs() < 1e-12);
        assert!((partials.total() - 4.5).abs() < 1e-12);
    }

    #[test]
    fn registry_resolves_known_components() {
        assert!(component_from_name("mse", &serde_json::Value::Null).is_ok());
        assert!(component_from_name("mae", &serde_json::Value::Null).is_ok());
        let huber =
            component_from_name("huber", &serde_json::json!({ "delta": 0.25 })).unwrap();
        // below delta: quadratic
        assert!((huber.residual(&[0.1], &[0.0]) - 0.005).abs() < 1e-12);
        // above delta: linear
        assert!((huber.residual(&[1.0], &[0.0]) - 0.25 * (1.0 - 0.125)).abs() < 1e-12);
    }

    #[test]
    fn registry_rejects_unknown_tags_and_bad_kwargs() {
        assert!(matches!(
            component_from_name("rmsle", &serde_json::Value::Null),
            Err(ComponentError::Unknown(name)) if name == "rmsle"
        ));
        assert!(matches!(
            component_from_name("huber", &serde_json::json!({ "slope": 1.0 })),
            Err(ComponentError::Kwargs { .. })
        ));
    }
}
