//! Mixture of Experts (MoE) Layer
//!
//! Sparse MoE layer built on the fast dispatcher.
//!
//! # Architecture
//!
//! ```text
//! Input → Router (softmax) → extract_critical → encode → Experts → decode → + Input
//! ```
//!
//! Each expert sees one contiguous `capacity`-row slice of the dispatch
//! buffer. Tokens beyond an expert's capacity skip the expert entirely and
//! only flow through the residual connection.
//!
//! # References
//!
//! - Lepikhin et al., "GShard", 2020
//! - Fedus et al., "Switch Transformers", 2021
//! - Hwang et al., "Tutel: Adaptive Mixture-of-Experts at Scale", 2022

use std::fmt;

use ndarray::{Array1, Array2, Axis, s};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::RoutingConfig;
use crate::dispatch::FastDispatcher;
use crate::errors::{DispatchError, Result};
use crate::gating::{GatingDecoder, GatingEncoder};
use crate::routing::{CriticalData, extract_critical_with, load_balance_grad, one_hot, softmax};

fn normal(std_dev: f32) -> Result<Normal<f32>> {
    Normal::new(0.0, std_dev)
        .map_err(|e| DispatchError::invalid(format!("bad init std_dev {std_dev}: {e}")))
}

/// Expert sub-network applied to one capacity slice of the dispatch buffer.
///
/// Experts own their parameters and update them inside `backward`.
pub trait Expert: Send + Sync + fmt::Debug {
    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32>;

    /// Returns the gradient w.r.t. the last forward input.
    fn backward(&mut self, output_grads: &Array2<f32>, lr: f32) -> Array2<f32>;

    fn parameters(&self) -> usize;
}

/// Single linear map expert.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LinearExpert {
    w: Array2<f32>,
    cached_input: Option<Array2<f32>>,
}

impl LinearExpert {
    pub fn new(model_dim: usize) -> Result<Self> {
        let mut rng = rand::rng();
        let normal = normal((1.0 / model_dim as f32).sqrt())?;
        let w = Array2::from_shape_fn((model_dim, model_dim), |_| normal.sample(&mut rng));
        Ok(LinearExpert {
            w,
            cached_input: None,
        })
    }

    /// Expert with a given `(model_dim, model_dim)` weight matrix.
    pub fn from_weights(w: Array2<f32>) -> Result<Self> {
        if !w.is_square() {
            return Err(DispatchError::shape(format!(
                "expert weights must be square, got {:?}",
                w.dim()
            )));
        }
        Ok(LinearExpert {
            w,
            cached_input: None,
        })
    }

    /// Pass-through expert.
    pub fn identity(model_dim: usize) -> Self {
        LinearExpert {
            w: Array2::eye(model_dim),
            cached_input: None,
        }
    }
}

impl Expert for LinearExpert {
    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32> {
        self.cached_input = Some(input.clone());
        input.dot(&self.w)
    }

    fn backward(&mut self, output_grads: &Array2<f32>, lr: f32) -> Array2<f32> {
        let grad_input = output_grads.dot(&self.w.t());
        if let Some(input) = self.cached_input.take() {
            let grad_w = input.t().dot(output_grads);
            self.w.scaled_add(-lr, &grad_w);
        }
        grad_input
    }

    fn parameters(&self) -> usize {
        self.w.len()
    }
}

/// Router network producing per-expert gate scores.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Router {
    /// Gating weights: (model_dim, num_experts)
    w_gate: Array2<f32>,
    cached_input: Option<Array2<f32>>,
    cached_scores: Option<Array2<f32>>,
}

impl Router {
    pub fn new(model_dim: usize, num_experts: usize) -> Result<Self> {
        let mut rng = rand::rng();
        // Xavier initialization for gating weights
        let normal = normal((2.0 / (model_dim + num_experts) as f32).sqrt())?;
        let w_gate = Array2::from_shape_fn((model_dim, num_experts), |_| normal.sample(&mut rng));
        Ok(Router {
            w_gate,
            cached_input: None,
            cached_scores: None,
        })
    }

    pub fn from_weights(w_gate: Array2<f32>) -> Self {
        Router {
            w_gate,
            cached_input: None,
            cached_scores: None,
        }
    }

    /// Softmax gate scores, shape (num_tokens, num_experts).
    pub fn scores(&mut self, input: &Array2<f32>) -> Array2<f32> {
        let scores = softmax(&input.dot(&self.w_gate));
        self.cached_input = Some(input.clone());
        self.cached_scores = Some(scores.clone());
        scores
    }

    /// Back-propagates score gradients through the softmax, updates `w_gate`,
    /// and returns the gradient w.r.t. the router input.
    pub fn backward(&mut self, grad_scores: &Array2<f32>, lr: f32) -> Result<Array2<f32>> {
        let (input, scores) = match (self.cached_input.take(), self.cached_scores.take()) {
            (Some(input), Some(scores)) => (input, scores),
            _ => return Err(DispatchError::invalid("router backward before forward")),
        };

        // dL/dlogit_j = s_j (g_j - Σ_i g_i s_i)
        let weighted = (grad_scores * &scores).sum_axis(Axis(1)).insert_axis(Axis(1));
        let grad_logits = &scores * &(grad_scores - &weighted);

        let grad_input = grad_logits.dot(&self.w_gate.t());
        let grad_w_gate = input.t().dot(&grad_logits);
        self.w_gate.scaled_add(-lr, &grad_w_gate);
        Ok(grad_input)
    }

    pub fn parameters(&self) -> usize {
        self.w_gate.len()
    }
}

#[derive(Debug)]
struct ForwardCache {
    scores: Array2<f32>,
    critical: CriticalData<f32>,
    encoder: GatingEncoder<f32>,
    decoder: GatingDecoder<f32>,
}

/// Mixture of Experts Layer
///
/// Combines a router, the fast dispatcher and a set of experts.
#[derive(Debug)]
pub struct MoELayer {
    router: Router,
    experts: Vec<Box<dyn Expert>>,
    config: RoutingConfig,
    dispatcher: FastDispatcher<f32>,
    model_dim: usize,
    cached: Option<ForwardCache>,
    cached_aux_loss: f64,
}

impl MoELayer {
    /// MoE layer with randomly initialized [`LinearExpert`]s.
    pub fn new(model_dim: usize, num_experts: usize, config: RoutingConfig) -> Result<Self> {
        let experts = (0..num_experts)
            .map(|_| LinearExpert::new(model_dim).map(|e| Box::new(e) as Box<dyn Expert>))
            .collect::<Result<Vec<_>>>()?;
        Self::with_experts(model_dim, experts, config)
    }

    pub fn with_experts(
        model_dim: usize,
        experts: Vec<Box<dyn Expert>>,
        config: RoutingConfig,
    ) -> Result<Self> {
        config.validate()?;
        if experts.is_empty() {
            return Err(DispatchError::invalid("MoE layer needs at least one expert"));
        }
        let num_experts = experts.len();
        Ok(MoELayer {
            router: Router::new(model_dim, num_experts)?,
            experts,
            dispatcher: FastDispatcher::new(num_experts, 0, model_dim).with_device(config.device),
            config,
            model_dim,
            cached: None,
            cached_aux_loss: 0.0,
        })
    }

    /// Replaces the randomly initialized router.
    pub fn with_router(mut self, router: Router) -> Result<Self> {
        let expected = (self.model_dim, self.experts.len());
        if router.w_gate.dim() != expected {
            return Err(DispatchError::shape(format!(
                "router weights are {:?}, expected {expected:?}",
                router.w_gate.dim()
            )));
        }
        self.router = router;
        Ok(self)
    }

    pub fn layer_type(&self) -> &str {
        "MoE"
    }

    pub fn num_experts(&self) -> usize {
        self.experts.len()
    }

    /// Weighted load balance loss from the last forward pass.
    pub fn auxiliary_loss(&self) -> f64 {
        self.cached_aux_loss
    }

    /// Fraction of the last batch's (token, rank) assignments each expert kept.
    pub fn expert_utilization(&self) -> Vec<f32> {
        let mut kept = vec![0usize; self.experts.len()];
        let Some(cache) = &self.cached else {
            return vec![0.0; self.experts.len()];
        };
        let critical = &cache.critical;
        for (indices, locations) in critical.indices.iter().zip(&critical.locations) {
            for (&e, &l) in indices.iter().zip(locations) {
                if (l as usize) < critical.capacity {
                    kept[e as usize] += 1;
                }
            }
        }
        let total = (critical.num_tokens() * critical.top_k()).max(1) as f32;
        kept.into_iter().map(|k| k as f32 / total).collect()
    }

    pub fn parameters(&self) -> usize {
        self.router.parameters() + self.experts.iter().map(|e| e.parameters()).sum::<usize>()
    }

    #[instrument(skip_all, fields(tokens = input.nrows()))]
    pub fn forward(&mut self, input: &Array2<f32>) -> Result<Array2<f32>> {
        if input.ncols() != self.model_dim {
            return Err(DispatchError::shape(format!(
                "MoE input width {} does not match model_dim {}",
                input.ncols(),
                self.model_dim
            )));
        }

        let scores = self.router.scores(input);
        let (critical, l_loss) = extract_critical_with(&scores, &self.config)?;
        self.dispatcher.update_from(&critical, self.config.is_postscore)?;

        let (dispatched, encoder) = self.dispatcher.encode_with_context(input)?;
        let capacity = critical.capacity;
        let mut expert_output = Array2::<f32>::zeros(dispatched.raw_dim());
        if capacity > 0 {
            for (e, expert) in self.experts.iter_mut().enumerate() {
                let rows = e * capacity..(e + 1) * capacity;
                let out = expert.forward(&dispatched.slice(s![rows.clone(), ..]).to_owned());
                if out.dim() != (capacity, self.model_dim) {
                    return Err(DispatchError::shape(format!(
                        "expert {e} returned {:?}, expected ({capacity}, {})",
                        out.dim(),
                        self.model_dim
                    )));
                }
                expert_output.slice_mut(s![rows, ..]).assign(&out);
            }
        }
        let (combined, decoder) = self.dispatcher.decode_with_context(&expert_output)?;

        self.cached_aux_loss = l_loss * self.config.load_balance_weight as f64;
        debug!(aux_loss = self.cached_aux_loss, capacity, "MoE forward");
        self.cached = Some(ForwardCache {
            scores,
            critical,
            encoder,
            decoder,
        });

        Ok(combined + input)
    }

    /// Back-propagates through decode, the experts, encode and the router.
    ///
    /// Experts and the router update their own parameters with `lr`.
    #[instrument(skip_all)]
    pub fn backward(&mut self, grads: &Array2<f32>, lr: f32) -> Result<Array2<f32>> {
        let cache = self
            .cached
            .take()
            .ok_or_else(|| DispatchError::invalid("MoE backward before forward"))?;
        let capacity = cache.critical.capacity;

        let decoded = cache.decoder.backward(grads)?;
        let mut grad_dispatched = Array2::<f32>::zeros(decoded.data.raw_dim());
        if capacity > 0 {
            for (e, expert) in self.experts.iter_mut().enumerate() {
                let rows = e * capacity..(e + 1) * capacity;
                let grad_in =
                    expert.backward(&decoded.data.slice(s![rows.clone(), ..]).to_owned(), lr);
                grad_dispatched.slice_mut(s![rows, ..]).assign(&grad_in);
            }
        }
        let encoded = cache.encoder.backward(&grad_dispatched)?;

        let gate_grads = if decoded.gates.is_empty() {
            encoded.gates
        } else {
            decoded.gates
        };
        let grad_scores = self.score_gradients(&cache.scores, &cache.critical, &gate_grads);
        let grad_router = self.router.backward(&grad_scores, lr)?;

        Ok(grads + &encoded.data + &grad_router)
    }

    /// d(objective)/d(scores) from the normalized-gate gradients plus the
    /// weighted load balance term.
    fn score_gradients(
        &self,
        scores: &Array2<f32>,
        critical: &CriticalData<f32>,
        gate_grads: &[Array1<f32>],
    ) -> Array2<f32> {
        let primary: Vec<usize> = critical.indices[0].iter().map(|&e| e as usize).collect();
        let mask0 = one_hot(&primary, critical.num_global_experts);
        let mut grad_scores = load_balance_grad(scores, &mask0, self.config.fp32_gate)
            * self.config.load_balance_weight;

        let top_k = critical.top_k();
        for t in 0..scores.nrows() {
            let experts: Vec<usize> = (0..top_k)
                .map(|k| critical.indices[k][t] as usize)
                .collect();
            let gg: Vec<f32> = gate_grads.iter().map(|g| g[t]).collect();
            if gg.is_empty() {
                continue;
            }

            if top_k == 1 {
                grad_scores[[t, experts[0]]] += gg[0];
                continue;
            }

            let raw_sum: f32 = experts.iter().map(|&e| scores[[t, e]]).sum();
            if raw_sum > f32::EPSILON {
                // g_k = r_k / S  ⇒  dL/dr_j = (gg_j - Σ_k gg_k g_k) / S
                let normalized: f32 = (0..top_k)
                    .map(|k| gg[k] * critical.gates[k][t])
                    .sum();
                for k in 0..top_k {
                    grad_scores[[t, experts[k]]] += (gg[k] - normalized) / raw_sum;
                }
            } else {
                for k in 0..top_k {
                    grad_scores[[t, experts[k]]] += gg[k] / f32::EPSILON;
                }
            }
        }
        grad_scores
    }
}
