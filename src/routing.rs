//! Slot assignment for capacity-bounded top-k routing
//!
//! Converts a gate matrix of shape (num_tokens, num_global_experts) into one
//! (indices, locations, gates) assignment stream per top-k rank:
//! - Top-K selection of experts per token
//! - Exclusive prefix-sum slot locations inside each expert's capacity buffer,
//!   optionally ordered by gate confidence (batch prioritized routing)
//! - Top-K gate normalization
//! - Auxiliary load balance loss to prevent routing collapse
//!
//! Locations at or beyond `capacity` are overflow: the scatter kernels skip
//! them, so those tokens are dropped for that rank.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::RoutingConfig;
use crate::dtype::{DType, Element};
use crate::errors::{DispatchError, Result};

/// Routing decisions consumed by the dispatcher.
///
/// Stream `k` holds the rank-`k` choice of every token. All streams have
/// length `num_tokens`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalData<A> {
    pub num_global_experts: usize,
    pub indices: Vec<Array1<i32>>,
    pub locations: Vec<Array1<i32>>,
    pub gates: Vec<Array1<A>>,
    pub capacity: usize,
}

impl<A: Element> CriticalData<A> {
    pub fn top_k(&self) -> usize {
        self.indices.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.indices.first().map_or(0, |i| i.len())
    }

    /// Number of tokens whose rank-`k` assignment overflowed the capacity.
    pub fn dropped(&self, k: usize) -> usize {
        self.locations.get(k).map_or(0, |locs| {
            locs.iter()
                .filter(|&&l| l as usize >= self.capacity)
                .count()
        })
    }
}

/// Select Top-K indices for each row in the scores matrix
///
/// Indices come back sorted by descending score. Equal scores keep the lower
/// index first.
///
/// # Example
///
/// ```ignore
/// let scores = array![[0.1, 0.5, 0.3, 0.2]];
/// let top_k = top_k_indices(&scores, 2);
/// assert_eq!(top_k[0], vec![1, 2]);
/// ```
pub fn top_k_indices<A: Element>(scores: &Array2<A>, k: usize) -> Vec<Vec<usize>> {
    let k = k.min(scores.ncols());

    scores
        .rows()
        .into_iter()
        .map(|row| {
            let mut indexed: Vec<(usize, A)> = row.iter().copied().enumerate().collect();
            // stable: ties keep ascending index order
            indexed.sort_by(|a, b| b.1.to_wide().total_cmp(&a.1.to_wide()));
            indexed.into_iter().take(k).map(|(idx, _)| idx).collect()
        })
        .collect()
}

/// One-hot expansion of expert ids into a (num_tokens, num_classes) mask.
pub fn one_hot(indices: &[usize], num_classes: usize) -> Array2<i32> {
    let mut mask = Array2::<i32>::zeros((indices.len(), num_classes));
    for (token, &expert) in indices.iter().enumerate() {
        mask[[token, expert]] = 1;
    }
    mask
}

/// Inclusive cumulative sum down the token axis, minus one.
///
/// For a one-hot mask, the entry at a token's own expert column is the
/// number of earlier tokens routed to that expert.
pub fn cumsum_sub_one(mask: &Array2<i32>) -> Array2<i32> {
    let mut out = Array2::<i32>::zeros(mask.raw_dim());
    let mut running = Array1::<i32>::zeros(mask.ncols());
    for (src, mut dst) in mask.rows().into_iter().zip(out.rows_mut()) {
        running += &src;
        dst.assign(&(&running - 1));
    }
    out
}

/// Token order for batch prioritized routing: most confident token first.
pub fn priority_order<A: Element>(gates: &Array2<A>) -> Vec<usize> {
    let confidence: Vec<A> = gates
        .rows()
        .into_iter()
        .map(|row| row.iter().fold(A::neg_infinity(), |m, &v| m.max(v)))
        .collect();

    let mut order: Vec<usize> = (0..gates.nrows()).collect();
    order.sort_by(|&a, &b| confidence[b].to_wide().total_cmp(&confidence[a].to_wide()));
    order
}

/// Slot locations computed in `order`, then scattered back to token order.
///
/// Entries outside the mask are zero.
pub fn sorted_locations(mask: &Array2<i32>, order: &[usize]) -> Array2<i32> {
    let sorted = mask.select(Axis(0), order);
    let sorted_cumsum = cumsum_sub_one(&sorted) * &sorted;

    let mut out = Array2::<i32>::zeros(mask.raw_dim());
    for (rank, &token) in order.iter().enumerate() {
        out.row_mut(token).assign(&sorted_cumsum.row(rank));
    }
    out
}

fn uses_sum_branch<A: Element>(fp32_gate: bool) -> bool {
    A::DTYPE == DType::F32 || fp32_gate
}

/// Compute load balance loss to prevent routing collapse
///
/// ```text
/// L_b = E × Σ(i=1 to E) me_i × ce_i
/// ```
///
/// Where `me_i` aggregates the gate scores of expert i over the batch and
/// `ce_i` aggregates the rank-0 assignments to expert i.
///
/// With float32 gates (or `fp32_gate`), both are sums accumulated in `f32`
/// and the result is divided by `num_tokens²`. Otherwise both are means and
/// no extra division is applied. The two branches agree in magnitude.
pub fn load_balance<A: Element>(gates: &Array2<A>, mask0: &Array2<i32>, fp32_gate: bool) -> f64 {
    let (num_tokens, num_global_experts) = gates.dim();
    if num_tokens == 0 || num_global_experts == 0 {
        return 0.0;
    }

    if uses_sum_branch::<A>(fp32_gate) {
        let me = gates.mapv(|g| g.cast::<f32>()).sum_axis(Axis(0));
        let ce = mask0.mapv(|m| m as f32).sum_axis(Axis(0));
        let scale = (num_global_experts as f64 / (num_tokens * num_tokens) as f64) as f32;
        ((&me * &ce).sum() * scale) as f64
    } else {
        let n = num_tokens as f64;
        let me = gates.mapv(|g| g.to_wide()).sum_axis(Axis(0)) / n;
        let ce = mask0.mapv(|m| m as f64).sum_axis(Axis(0)) / n;
        let loss = (&me * &ce).sum() * num_global_experts as f64;
        A::from_wide(loss).to_wide()
    }
}

/// Gradient of [`load_balance`] with respect to the gate matrix.
///
/// The rank-0 mask is piecewise constant in the gates and contributes no
/// gradient, so every token receives the same row.
pub fn load_balance_grad<A: Element>(
    gates: &Array2<A>,
    mask0: &Array2<i32>,
    fp32_gate: bool,
) -> Array2<A> {
    let (num_tokens, num_global_experts) = gates.dim();
    if num_tokens == 0 {
        return Array2::zeros(gates.raw_dim());
    }

    let n = num_tokens as f64;
    let counts = mask0.mapv(|m| m as f64).sum_axis(Axis(0));
    let row = if uses_sum_branch::<A>(fp32_gate) {
        counts * (num_global_experts as f64 / (n * n))
    } else {
        counts / n * (num_global_experts as f64 / n)
    };

    Array2::from_shape_fn(gates.raw_dim(), |(_, e)| A::from_wide(row[e]))
}

/// Numerically stable row softmax.
pub fn softmax(x: &Array2<f32>) -> Array2<f32> {
    let mut result = x.clone();
    for mut row in result.rows_mut() {
        let max_val = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max_val).exp());
        let sum_exp = row.sum();
        row.mapv_inplace(|v| v / sum_exp);
    }
    result
}

/// Compute top-k routing decisions and the load balance loss.
///
/// Returns the assignment streams plus the auxiliary loss, which the caller
/// must add to its training objective.
#[instrument(skip(gates), fields(tokens = gates.nrows(), experts = gates.ncols()))]
pub fn extract_critical<A: Element>(
    gates: &Array2<A>,
    top_k: usize,
    capacity_factor: f64,
    fp32_gate: bool,
    batch_prioritized_routing: bool,
) -> Result<(CriticalData<A>, f64)> {
    let (num_tokens, num_global_experts) = gates.dim();

    if num_global_experts == 0 {
        return Err(DispatchError::invalid("gate matrix has no expert columns"));
    }
    if top_k == 0 || top_k > num_global_experts {
        return Err(DispatchError::invalid(format!(
            "top_k must be in [1, {num_global_experts}], got {top_k}"
        )));
    }
    if !capacity_factor.is_finite() || capacity_factor <= 0.0 {
        return Err(DispatchError::invalid(format!(
            "capacity_factor must be positive, got {capacity_factor}"
        )));
    }
    if let Some(((token, expert), _)) = gates.indexed_iter().find(|(_, g)| !g.is_finite()) {
        return Err(DispatchError::invalid(format!(
            "gate ({token}, {expert}) is not finite"
        )));
    }

    let ranked = top_k_indices(gates, top_k);
    let indices_s: Vec<Vec<usize>> = (0..top_k)
        .map(|k| ranked.iter().map(|experts| experts[k]).collect())
        .collect();
    let masks_se: Vec<Array2<i32>> = indices_s
        .iter()
        .map(|indices| one_hot(indices, num_global_experts))
        .collect();
    let mut gates_s: Vec<Array1<A>> = indices_s
        .iter()
        .map(|indices| {
            indices
                .iter()
                .enumerate()
                .map(|(token, &expert)| gates[[token, expert]])
                .collect()
        })
        .collect();

    let l_loss = load_balance(gates, &masks_se[0], fp32_gate);

    let order = batch_prioritized_routing.then(|| priority_order(gates));
    let compute_location = |mask: &Array2<i32>| match &order {
        Some(order) => sorted_locations(mask, order),
        None => cumsum_sub_one(mask),
    };

    let mut acc_base = Array1::<i32>::zeros(num_global_experts);
    let mut locations_s = Vec::with_capacity(top_k);
    for k in 0..top_k {
        if k > 0 {
            acc_base += &masks_se[k - 1].sum_axis(Axis(0));
        }
        let locations = compute_location(&masks_se[k]);
        locations_s.push(
            indices_s[k]
                .iter()
                .enumerate()
                .map(|(token, &expert)| locations[[token, expert]] + acc_base[expert])
                .collect::<Array1<i32>>(),
        );
    }

    if top_k > 1 {
        let eps = A::epsilon();
        let denom_s = gates_s
            .iter()
            .fold(Array1::<A>::zeros(num_tokens), |acc, g| acc + g)
            .mapv(|d| d.max(eps));
        for g in gates_s.iter_mut() {
            g.zip_mut_with(&denom_s, |v, &d| *v = *v / d);
        }
    }

    let per_expert = num_tokens.div_ceil(num_global_experts);
    let capacity = top_k * (capacity_factor * per_expert as f64) as usize;

    let critical = CriticalData {
        num_global_experts,
        indices: indices_s
            .into_iter()
            .map(|indices| indices.into_iter().map(|e| e as i32).collect())
            .collect(),
        locations: locations_s,
        gates: gates_s,
        capacity,
    };

    let dropped: Vec<usize> = (0..top_k).map(|k| critical.dropped(k)).collect();
    if dropped.iter().any(|&d| d > 0) {
        warn!(capacity, ?dropped, "Tokens exceeded expert capacity and were dropped");
    }
    debug!(capacity, loss = l_loss, "Computed routing assignment");

    Ok((critical, l_loss))
}

/// [`extract_critical`] driven by a [`RoutingConfig`].
pub fn extract_critical_with<A: Element>(
    gates: &Array2<A>,
    config: &RoutingConfig,
) -> Result<(CriticalData<A>, f64)> {
    config.validate()?;
    extract_critical(
        gates,
        config.top_k,
        config.capacity_factor,
        config.fp32_gate,
        config.batch_prioritized_routing,
    )
}
