//! Fast dispatcher: drives the scatter kernels over every top-k stream
//!
//! ```text
//! gates → extract_critical → update(indices, locations, gates, capacity)
//!       → encode(tokens)  [num_tokens, model_dim] → [num_experts * capacity, model_dim]
//!       → experts
//!       → decode(buffer)  [num_experts * capacity, model_dim] → [num_tokens, model_dim]
//! ```
//!
//! Each `update` freezes a [`DispatchPlan`]. Encoder and decoder contexts hold
//! the plan they ran with, so a later `update` never changes a pending backward.

use std::sync::Arc;

use half::f16;
use ndarray::{Array1, Array2};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::dtype::{DType, DeviceClass, Element};
use crate::errors::{DispatchError, Result};
use crate::gating::{GatingDecoder, GatingEncoder};
use crate::kernels::{KernelExtent, KernelHandle, KernelRegistry, ScatterBackend, ScatterKernel};
use crate::routing::CriticalData;

/// Scalars fixed for one forward/backward pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchConfig {
    pub num_global_experts: usize,
    pub capacity: usize,
    pub model_dim: usize,
    /// `model_dim` divided by the kernel's packed lanes
    pub aligned_dim: usize,
    /// Dtype the kernels compute in
    pub dtype: DType,
    /// Dtype of the caller's arrays
    pub original_dtype: DType,
    pub sample_size: usize,
    pub backend: ScatterBackend,
}

impl DispatchConfig {
    /// Rows of the dispatch buffer.
    pub fn slot_rows(&self) -> usize {
        self.num_global_experts * self.capacity
    }

    pub fn extent(&self) -> KernelExtent {
        KernelExtent {
            token_count: self.sample_size,
            aligned_dim: self.aligned_dim,
            capacity: self.capacity,
        }
    }
}

/// Frozen assignment streams plus the kernel bound for them.
#[derive(Debug)]
pub struct DispatchPlan<A> {
    config: DispatchConfig,
    kernel: KernelHandle,
    indices: Vec<Array1<i32>>,
    locations: Vec<Array1<i32>>,
    gates: Vec<Array1<A>>,
    is_postscore: bool,
}

impl<A: Element> DispatchPlan<A> {
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn is_postscore(&self) -> bool {
        self.is_postscore
    }

    pub fn top_k(&self) -> usize {
        self.indices.len()
    }

    pub fn kernel(&self) -> &KernelHandle {
        &self.kernel
    }

    pub(crate) fn check_tokens(&self, what: &str, data: &Array2<A>) -> Result<()> {
        let expected = (self.config.sample_size, self.config.model_dim);
        if data.dim() != expected {
            return Err(DispatchError::shape(format!(
                "{what} is {:?}, expected {expected:?}",
                data.dim()
            )));
        }
        Ok(())
    }

    pub(crate) fn check_slots(&self, what: &str, data: &Array2<A>) -> Result<()> {
        let expected = (self.config.slot_rows(), self.config.model_dim);
        if data.dim() != expected {
            return Err(DispatchError::shape(format!(
                "{what} is {:?}, expected {expected:?}",
                data.dim()
            )));
        }
        Ok(())
    }

    /// Sum over streams of the forward scatter of `src` into a zeroed buffer.
    pub(crate) fn scatter(&self, src: &Array2<A>, weighted: bool) -> Result<Array2<A>> {
        match &self.kernel {
            KernelHandle::F16(k) => scatter_with::<A, f16>(self, &**k, src, weighted),
            KernelHandle::F32(k) => scatter_with::<A, f32>(self, &**k, src, weighted),
            KernelHandle::F64(k) => scatter_with::<A, f64>(self, &**k, src, weighted),
        }
    }

    /// Sum over streams of the gather of `src` back to token order.
    pub(crate) fn gather(&self, src: &Array2<A>, weighted: bool) -> Result<Array2<A>> {
        match &self.kernel {
            KernelHandle::F16(k) => gather_with::<A, f16>(self, &**k, src, weighted),
            KernelHandle::F32(k) => gather_with::<A, f32>(self, &**k, src, weighted),
            KernelHandle::F64(k) => gather_with::<A, f64>(self, &**k, src, weighted),
        }
    }

    /// Per-stream `dot(tokens[t], slots[slot of t])`.
    pub(crate) fn gate_grads(
        &self,
        tokens: &Array2<A>,
        slots: &Array2<A>,
    ) -> Result<Vec<Array1<A>>> {
        match &self.kernel {
            KernelHandle::F16(k) => gate_grads_with::<A, f16>(self, &**k, tokens, slots),
            KernelHandle::F32(k) => gate_grads_with::<A, f32>(self, &**k, tokens, slots),
            KernelHandle::F64(k) => gate_grads_with::<A, f64>(self, &**k, tokens, slots),
        }
    }

    fn compute_gate<C: Element>(&self, k: usize, weighted: bool) -> Option<Array1<C>> {
        weighted.then(|| self.gates[k].mapv(|g| g.cast::<C>()))
    }
}

fn scatter_with<A: Element, C: Element>(
    plan: &DispatchPlan<A>,
    kernel: &dyn ScatterKernel<C>,
    src: &Array2<A>,
    weighted: bool,
) -> Result<Array2<A>> {
    let config = plan.config;
    let src = src.mapv(|v| v.cast::<C>());
    let mut dst = Array2::<C>::zeros((config.slot_rows(), config.model_dim));
    for k in 0..plan.top_k() {
        let gate = plan.compute_gate::<C>(k, weighted);
        kernel.forward_scatter(
            gate.as_ref().map(|g| g.view()),
            plan.indices[k].view(),
            plan.locations[k].view(),
            src.view(),
            dst.view_mut(),
            config.extent(),
        )?;
    }
    Ok(dst.mapv(|v| v.cast::<A>()))
}

fn gather_with<A: Element, C: Element>(
    plan: &DispatchPlan<A>,
    kernel: &dyn ScatterKernel<C>,
    src: &Array2<A>,
    weighted: bool,
) -> Result<Array2<A>> {
    let config = plan.config;
    let src = src.mapv(|v| v.cast::<C>());
    let mut dst = Array2::<C>::zeros((config.sample_size, config.model_dim));
    for k in 0..plan.top_k() {
        let gate = plan.compute_gate::<C>(k, weighted);
        kernel.backward_data_gather(
            gate.as_ref().map(|g| g.view()),
            plan.indices[k].view(),
            plan.locations[k].view(),
            dst.view_mut(),
            src.view(),
            config.extent(),
        )?;
    }
    Ok(dst.mapv(|v| v.cast::<A>()))
}

fn gate_grads_with<A: Element, C: Element>(
    plan: &DispatchPlan<A>,
    kernel: &dyn ScatterKernel<C>,
    tokens: &Array2<A>,
    slots: &Array2<A>,
) -> Result<Vec<Array1<A>>> {
    let config = plan.config;
    let lhs = tokens.mapv(|v| v.cast::<C>());
    let rhs = slots.mapv(|v| v.cast::<C>());
    (0..plan.top_k())
        .map(|k| {
            let mut out = Array1::<C>::zeros(config.sample_size);
            kernel.backward_gate_reduce(
                out.view_mut(),
                plan.indices[k].view(),
                plan.locations[k].view(),
                lhs.view(),
                rhs.view(),
                config.extent(),
            )?;
            Ok(out.mapv(|v| v.cast::<A>()))
        })
        .collect()
}

/// Dispatcher for one MoE layer.
///
/// Kernel handles are looked up in the [`KernelRegistry`] and rebound only
/// when the backend implied by (device class, element dtype) changes.
#[derive(Debug)]
pub struct FastDispatcher<A> {
    num_global_experts: usize,
    capacity: usize,
    model_dim: usize,
    device: DeviceClass,
    registry: &'static KernelRegistry,
    bound: Option<(ScatterBackend, KernelHandle)>,
    plan: Option<Arc<DispatchPlan<A>>>,
}

impl<A: Element> FastDispatcher<A> {
    pub fn new(num_global_experts: usize, capacity: usize, model_dim: usize) -> Self {
        FastDispatcher {
            num_global_experts,
            capacity,
            model_dim,
            device: DeviceClass::default(),
            registry: KernelRegistry::global(),
            bound: None,
            plan: None,
        }
    }

    pub fn with_device(mut self, device: DeviceClass) -> Self {
        self.device = device;
        self
    }

    /// Resolve kernels from `registry` instead of the process-wide one.
    pub fn with_registry(mut self, registry: &'static KernelRegistry) -> Self {
        self.registry = registry;
        self.bound = None;
        self
    }

    pub fn device(&self) -> DeviceClass {
        self.device
    }

    pub fn set_device(&mut self, device: DeviceClass) {
        self.device = device;
    }

    pub fn config(&self) -> Option<&DispatchConfig> {
        self.plan.as_ref().map(|p| p.config())
    }

    pub fn plan(&self) -> Result<Arc<DispatchPlan<A>>> {
        self.plan
            .clone()
            .ok_or_else(|| DispatchError::invalid("dispatcher used before update"))
    }

    fn bind(&mut self) -> Result<(ScatterBackend, KernelHandle)> {
        let backend = ScatterBackend::select(self.device, A::DTYPE)?;
        if let Some((bound, handle)) = &self.bound {
            if *bound == backend {
                return Ok((backend, handle.clone()));
            }
        }
        let handle = self.registry.get_or_specialize(backend)?;
        debug!(%backend, kernel = handle.name(), "Bound scatter kernels");
        self.bound = Some((backend, handle.clone()));
        Ok((backend, handle))
    }

    /// Install new assignment streams.
    ///
    /// `capacity == 0` keeps the dispatcher's current capacity. Locations at
    /// or beyond capacity are accepted; those tokens are dropped.
    #[instrument(
        skip_all,
        fields(streams = indices.len(), capacity = capacity, is_postscore = is_postscore)
    )]
    pub fn update(
        &mut self,
        indices: &[Array1<i32>],
        locations: &[Array1<i32>],
        gates: &[Array1<A>],
        capacity: usize,
        is_postscore: bool,
    ) -> Result<()> {
        if indices.is_empty() {
            return Err(DispatchError::shape("at least one assignment stream is required"));
        }
        if locations.len() != indices.len() || gates.len() != indices.len() {
            return Err(DispatchError::shape(format!(
                "stream counts differ: {} indices, {} locations, {} gates",
                indices.len(),
                locations.len(),
                gates.len()
            )));
        }

        let sample_size = indices[0].len();
        for (k, ((i, l), g)) in indices.iter().zip(locations).zip(gates).enumerate() {
            if i.len() != sample_size || l.len() != sample_size || g.len() != sample_size {
                return Err(DispatchError::shape(format!(
                    "stream {k} lengths ({}, {}, {}) differ from sample size {sample_size}",
                    i.len(),
                    l.len(),
                    g.len()
                )));
            }
            if let Some(&bad) = i
                .iter()
                .find(|&&e| e < 0 || e as usize >= self.num_global_experts)
            {
                return Err(DispatchError::invalid(format!(
                    "stream {k} routes to expert {bad}, outside [0, {})",
                    self.num_global_experts
                )));
            }
            if let Some(&bad) = l.iter().find(|&&loc| loc < 0) {
                return Err(DispatchError::invalid(format!(
                    "stream {k} has negative location {bad}"
                )));
            }
        }

        let capacity = if capacity > 0 { capacity } else { self.capacity };

        let (backend, kernel) = self.bind()?;
        let lanes = kernel.lanes();
        if self.model_dim % lanes != 0 {
            return Err(DispatchError::shape(format!(
                "model_dim {} is not a multiple of {lanes} packed lanes for {backend}",
                self.model_dim
            )));
        }

        let config = DispatchConfig {
            num_global_experts: self.num_global_experts,
            capacity,
            model_dim: self.model_dim,
            aligned_dim: self.model_dim / lanes,
            dtype: backend.compute_dtype(),
            original_dtype: A::DTYPE,
            sample_size,
            backend,
        };

        self.capacity = capacity;
        self.plan = Some(Arc::new(DispatchPlan {
            config,
            kernel,
            indices: indices.to_vec(),
            locations: locations.to_vec(),
            gates: gates.to_vec(),
            is_postscore,
        }));
        Ok(())
    }

    pub fn update_from(&mut self, critical: &CriticalData<A>, is_postscore: bool) -> Result<()> {
        if critical.num_global_experts != self.num_global_experts {
            return Err(DispatchError::shape(format!(
                "routing covers {} experts, dispatcher has {}",
                critical.num_global_experts, self.num_global_experts
            )));
        }
        self.update(
            &critical.indices,
            &critical.locations,
            &critical.gates,
            critical.capacity,
            is_postscore,
        )
    }

    /// Tokens → per-expert buffer. Gates apply here unless post-score.
    pub fn encode(&self, data: &Array2<A>) -> Result<Array2<A>> {
        self.encode_with_context(data).map(|(out, _)| out)
    }

    /// Per-expert buffer → tokens. Gates apply here when post-score.
    pub fn decode(&self, data: &Array2<A>) -> Result<Array2<A>> {
        self.decode_with_context(data).map(|(out, _)| out)
    }

    /// [`encode`](Self::encode) keeping the context needed for backward.
    pub fn encode_with_context(&self, data: &Array2<A>) -> Result<(Array2<A>, GatingEncoder<A>)> {
        let (ctx, out) = GatingEncoder::forward(self.plan()?, data)?;
        Ok((out, ctx))
    }

    /// [`decode`](Self::decode) keeping the context needed for backward.
    pub fn decode_with_context(&self, data: &Array2<A>) -> Result<(Array2<A>, GatingDecoder<A>)> {
        let (ctx, out) = GatingDecoder::forward(self.plan()?, data)?;
        Ok((out, ctx))
    }
}

/// One-shot encode with a throwaway host dispatcher.
pub fn fast_encode<A: Element>(
    data: &Array2<A>,
    critical: &CriticalData<A>,
    is_postscore: bool,
) -> Result<Array2<A>> {
    let mut dispatcher = FastDispatcher::new(critical.num_global_experts, 0, data.ncols());
    dispatcher.update_from(critical, is_postscore)?;
    dispatcher.encode(data)
}

/// One-shot decode with a throwaway host dispatcher.
pub fn fast_decode<A: Element>(
    data: &Array2<A>,
    critical: &CriticalData<A>,
    is_postscore: bool,
) -> Result<Array2<A>> {
    let mut dispatcher = FastDispatcher::new(critical.num_global_experts, 0, data.ncols());
    dispatcher.update_from(critical, is_postscore)?;
    dispatcher.decode(data)
}
