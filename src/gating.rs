//! Differentiable encode/decode
//!
//! Each op is a context object: `forward` runs the op and captures what the
//! backward pass needs (the frozen [`DispatchPlan`] and the forward input);
//! `backward` maps an upstream gradient to gradients w.r.t. the data and,
//! when the op applied real gates, w.r.t. each gate stream.
//!
//! ```text
//! encode:  y[slot(t,k)] += g[t,k] · x[t]
//!          dx[t]   = Σ_k g[t,k] · dy[slot(t,k)]
//!          dg[t,k] = x[t] · dy[slot(t,k)]
//!
//! decode:  y[t]    = Σ_k g[t,k] · e[slot(t,k)]
//!          de[slot(t,k)] += g[t,k] · dy[t]
//!          dg[t,k] = dy[t] · e[slot(t,k)]
//! ```
//!
//! Dropped tokens (location ≥ capacity) contribute nothing forward and get
//! zero gradient backward.

use std::sync::Arc;

use ndarray::{Array1, Array2};

use crate::dispatch::DispatchPlan;
use crate::dtype::Element;
use crate::errors::Result;

/// Gradients returned by a backward pass.
#[derive(Debug, Clone)]
pub struct GatingGrads<A> {
    /// Gradient w.r.t. the op's data input
    pub data: Array2<A>,
    /// Gradient w.r.t. each gate stream, empty when the op ran with unit weights
    pub gates: Vec<Array1<A>>,
}

/// Saved state of one encode (token → expert buffer).
#[derive(Debug)]
pub struct GatingEncoder<A> {
    plan: Arc<DispatchPlan<A>>,
    saved_input: Array2<A>,
    gated: bool,
}

impl<A: Element> GatingEncoder<A> {
    pub fn forward(plan: Arc<DispatchPlan<A>>, input: &Array2<A>) -> Result<(Self, Array2<A>)> {
        plan.check_tokens("encode input", input)?;
        let gated = !plan.is_postscore();
        let dispatched = plan.scatter(input, gated)?;
        let ctx = GatingEncoder {
            plan,
            saved_input: input.clone(),
            gated,
        };
        Ok((ctx, dispatched))
    }

    pub fn backward(&self, grad_dispatched: &Array2<A>) -> Result<GatingGrads<A>> {
        self.plan.check_slots("encode gradient", grad_dispatched)?;
        let data = self.plan.gather(grad_dispatched, self.gated)?;
        let gates = if self.gated {
            self.plan.gate_grads(&self.saved_input, grad_dispatched)?
        } else {
            Vec::new()
        };
        Ok(GatingGrads { data, gates })
    }

    pub fn plan(&self) -> &DispatchPlan<A> {
        &self.plan
    }

    pub fn is_gated(&self) -> bool {
        self.gated
    }
}

/// Saved state of one decode (expert buffer → tokens).
#[derive(Debug)]
pub struct GatingDecoder<A> {
    plan: Arc<DispatchPlan<A>>,
    saved_expert_output: Array2<A>,
    gated: bool,
}

impl<A: Element> GatingDecoder<A> {
    pub fn forward(
        plan: Arc<DispatchPlan<A>>,
        expert_output: &Array2<A>,
    ) -> Result<(Self, Array2<A>)> {
        plan.check_slots("decode input", expert_output)?;
        let gated = plan.is_postscore();
        let combined = plan.gather(expert_output, gated)?;
        let ctx = GatingDecoder {
            plan,
            saved_expert_output: expert_output.clone(),
            gated,
        };
        Ok((ctx, combined))
    }

    pub fn backward(&self, grad_combined: &Array2<A>) -> Result<GatingGrads<A>> {
        self.plan.check_tokens("decode gradient", grad_combined)?;
        let data = self.plan.scatter(grad_combined, self.gated)?;
        let gates = if self.gated {
            self.plan.gate_grads(grad_combined, &self.saved_expert_output)?
        } else {
            Vec::new()
        };
        Ok(GatingGrads { data, gates })
    }

    pub fn plan(&self) -> &DispatchPlan<A> {
        &self.plan
    }

    pub fn is_gated(&self) -> bool {
        self.gated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::FastDispatcher;
    use ndarray::array;

    #[test]
    fn test_postscore_encoder_has_no_gate_grads() {
        let mut dispatcher = FastDispatcher::<f64>::new(2, 1, 2);
        dispatcher
            .update(&[array![1, 0]], &[array![0, 0]], &[array![0.3, 0.7]], 0, true)
            .unwrap();
        let x = array![[1.0, 2.0], [3.0, 4.0]];
        let (buffer, encoder) = dispatcher.encode_with_context(&x).unwrap();
        assert_eq!(buffer, array![[3.0, 4.0], [1.0, 2.0]]);
        assert!(!encoder.is_gated());

        let grads = encoder.backward(&array![[1.0, 1.0], [2.0, 2.0]]).unwrap();
        assert_eq!(grads.data, array![[2.0, 2.0], [1.0, 1.0]]);
        assert!(grads.gates.is_empty());
    }

    #[test]
    fn test_postscore_decoder_gate_grads() {
        let mut dispatcher = FastDispatcher::<f64>::new(2, 1, 2);
        dispatcher
            .update(&[array![1, 0]], &[array![0, 0]], &[array![0.3, 0.7]], 0, true)
            .unwrap();
        let expert_out = array![[1.0, 0.0], [0.0, 2.0]];
        let (combined, decoder) = dispatcher.decode_with_context(&expert_out).unwrap();
        assert_eq!(combined, array![[0.0, 0.6], [0.7, 0.0]]);

        let grads = decoder.backward(&array![[1.0, 1.0], [1.0, 2.0]]).unwrap();
        assert_eq!(grads.gates.len(), 1);
        assert_eq!(grads.gates[0], array![2.0, 1.0]);
        assert_eq!(grads.data, array![[0.7, 1.4], [0.3, 0.3]]);
    }

    #[test]
    fn test_backward_checks_gradient_shape() {
        let mut dispatcher = FastDispatcher::<f32>::new(2, 1, 2);
        dispatcher
            .update(&[array![0]], &[array![0]], &[array![1.0f32]], 0, false)
            .unwrap();
        let (_, encoder) = dispatcher
            .encode_with_context(&array![[1.0f32, 1.0]])
            .unwrap();
        assert!(encoder.backward(&Array2::zeros((3, 2))).is_err());
    }
}
