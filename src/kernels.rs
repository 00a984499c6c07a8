//! Scatter kernel interface and the process-wide kernel registry
//!
//! Every kernel implements the same three primitives over one assignment
//! stream `(gate, index, location)`:
//!
//! ```text
//! forward_scatter:       dst[index[t]*capacity + location[t]] += gate[t] * src[t]
//! backward_data_gather:  dst_grad[t] += gate[t] * src_grad[index[t]*capacity + location[t]]
//! backward_gate_reduce:  out[t] = dot(lhs[t], rhs[index[t]*capacity + location[t]])
//! ```
//!
//! Kernels bounds-check every slot themselves: a negative index or location,
//! a location at or beyond `capacity`, or a row past the end of the slot
//! operand is skipped (a dropped token). Callers never pre-filter overflow.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use half::f16;
use ndarray::parallel::prelude::*;
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, Zip};
use serde::Serialize;
use tracing::{debug, info};

use crate::dtype::{DType, DeviceClass, Element};
use crate::errors::{DispatchError, Result};

/// Scalar arguments shared by all three primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelExtent {
    pub token_count: usize,
    pub aligned_dim: usize,
    pub capacity: usize,
}

impl KernelExtent {
    /// Row of the slot operand addressed by a token, `None` if the token is dropped.
    pub fn slot_row(&self, index: i32, location: i32, rows: usize) -> Option<usize> {
        if index < 0 || location < 0 {
            return None;
        }
        let location = location as usize;
        if location >= self.capacity {
            return None;
        }
        let row = index as usize * self.capacity + location;
        (row < rows).then_some(row)
    }
}

/// Capability contract for the three dispatch primitives.
///
/// `gate = None` means every token is weighted by one. All primitives
/// accumulate into their destination except `backward_gate_reduce`, which
/// writes every entry of `out`.
pub trait ScatterKernel<T: Element>: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Elements processed per packed column (`model_dim = aligned_dim * lanes`).
    fn lanes(&self) -> usize {
        1
    }

    fn forward_scatter(
        &self,
        gate: Option<ArrayView1<'_, T>>,
        index: ArrayView1<'_, i32>,
        location: ArrayView1<'_, i32>,
        src: ArrayView2<'_, T>,
        dst: ArrayViewMut2<'_, T>,
        extent: KernelExtent,
    ) -> Result<()>;

    fn backward_data_gather(
        &self,
        gate: Option<ArrayView1<'_, T>>,
        index: ArrayView1<'_, i32>,
        location: ArrayView1<'_, i32>,
        dst_grad: ArrayViewMut2<'_, T>,
        src_grad: ArrayView2<'_, T>,
        extent: KernelExtent,
    ) -> Result<()>;

    fn backward_gate_reduce(
        &self,
        out: ArrayViewMut1<'_, T>,
        index: ArrayView1<'_, i32>,
        location: ArrayView1<'_, i32>,
        lhs: ArrayView2<'_, T>,
        rhs: ArrayView2<'_, T>,
        extent: KernelExtent,
    ) -> Result<()>;
}

/// Validates stream lengths and operand shapes against the extent.
#[allow(clippy::too_many_arguments)]
fn check_operands(
    kernel: &str,
    extent: KernelExtent,
    lanes: usize,
    gate_len: Option<usize>,
    index_len: usize,
    location_len: usize,
    token_shape: (usize, usize),
    slot_shape: (usize, usize),
) -> Result<()> {
    let n = extent.token_count;
    if index_len != n || location_len != n || gate_len.is_some_and(|g| g != n) {
        return Err(DispatchError::shape(format!(
            "{kernel}: stream lengths (index {index_len}, location {location_len}, \
             gate {gate_len:?}) do not match token_count {n}"
        )));
    }
    let dim = extent.aligned_dim * lanes;
    if token_shape != (n, dim) {
        return Err(DispatchError::shape(format!(
            "{kernel}: token operand is {token_shape:?}, expected ({n}, {dim})"
        )));
    }
    if slot_shape.1 != dim {
        return Err(DispatchError::shape(format!(
            "{kernel}: slot operand width {} does not match {dim}",
            slot_shape.1
        )));
    }
    if extent.capacity > 0 && slot_shape.0 % extent.capacity != 0 {
        return Err(DispatchError::shape(format!(
            "{kernel}: slot operand has {} rows, not a multiple of capacity {}",
            slot_shape.0, extent.capacity
        )));
    }
    Ok(())
}

fn weight<T: Element>(gate: &Option<ArrayView1<'_, T>>, token: usize) -> T {
    gate.as_ref().map_or(T::one(), |g| g[token])
}

/// Sequential reference kernel running on the calling thread.
#[derive(Debug, Default)]
pub struct HostScatter<T> {
    _marker: PhantomData<T>,
}

impl<T: Element> HostScatter<T> {
    pub fn new() -> Self {
        HostScatter {
            _marker: PhantomData,
        }
    }
}

impl<T: Element> ScatterKernel<T> for HostScatter<T> {
    fn name(&self) -> &str {
        "host-scatter"
    }

    fn forward_scatter(
        &self,
        gate: Option<ArrayView1<'_, T>>,
        index: ArrayView1<'_, i32>,
        location: ArrayView1<'_, i32>,
        src: ArrayView2<'_, T>,
        mut dst: ArrayViewMut2<'_, T>,
        extent: KernelExtent,
    ) -> Result<()> {
        check_operands(
            "forward_scatter",
            extent,
            self.lanes(),
            gate.as_ref().map(|g| g.len()),
            index.len(),
            location.len(),
            src.dim(),
            dst.dim(),
        )?;

        let rows = dst.nrows();
        for t in 0..extent.token_count {
            if let Some(row) = extent.slot_row(index[t], location[t], rows) {
                let w = weight(&gate, t);
                dst.row_mut(row)
                    .zip_mut_with(&src.row(t), |d, &s| *d = *d + w * s);
            }
        }
        Ok(())
    }

    fn backward_data_gather(
        &self,
        gate: Option<ArrayView1<'_, T>>,
        index: ArrayView1<'_, i32>,
        location: ArrayView1<'_, i32>,
        mut dst_grad: ArrayViewMut2<'_, T>,
        src_grad: ArrayView2<'_, T>,
        extent: KernelExtent,
    ) -> Result<()> {
        check_operands(
            "backward_data_gather",
            extent,
            self.lanes(),
            gate.as_ref().map(|g| g.len()),
            index.len(),
            location.len(),
            dst_grad.dim(),
            src_grad.dim(),
        )?;

        let rows = src_grad.nrows();
        for t in 0..extent.token_count {
            if let Some(row) = extent.slot_row(index[t], location[t], rows) {
                let w = weight(&gate, t);
                dst_grad
                    .row_mut(t)
                    .zip_mut_with(&src_grad.row(row), |d, &s| *d = *d + w * s);
            }
        }
        Ok(())
    }

    fn backward_gate_reduce(
        &self,
        mut out: ArrayViewMut1<'_, T>,
        index: ArrayView1<'_, i32>,
        location: ArrayView1<'_, i32>,
        lhs: ArrayView2<'_, T>,
        rhs: ArrayView2<'_, T>,
        extent: KernelExtent,
    ) -> Result<()> {
        check_operands(
            "backward_gate_reduce",
            extent,
            self.lanes(),
            Some(out.len()),
            index.len(),
            location.len(),
            lhs.dim(),
            rhs.dim(),
        )?;

        let rows = rhs.nrows();
        for t in 0..extent.token_count {
            out[t] = match extent.slot_row(index[t], location[t], rows) {
                Some(row) => lhs
                    .row(t)
                    .iter()
                    .zip(rhs.row(row).iter())
                    .fold(T::zero(), |acc, (&a, &b)| acc + a * b),
                None => T::zero(),
            };
        }
        Ok(())
    }
}

/// Data-parallel kernel: one work item per destination row, executed on a
/// dedicated rayon pool. Rows are processed in packs of `lanes` elements,
/// each pack accumulated in `f64` before rounding back.
#[derive(Debug)]
pub struct ParallelScatter<T> {
    pool: rayon::ThreadPool,
    lanes: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> ParallelScatter<T> {
    pub fn new(lanes: usize) -> Result<Self> {
        if lanes == 0 {
            return Err(DispatchError::KernelInit {
                message: "packed lanes must be at least 1".to_string(),
            });
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .thread_name(|i| format!("moe-scatter-{i}"))
            .build()
            .map_err(|e| DispatchError::KernelInit {
                message: format!("failed to start scatter thread pool: {e}"),
            })?;
        Ok(ParallelScatter {
            pool,
            lanes,
            _marker: PhantomData,
        })
    }
}

fn axpy_packed<T: Element>(
    mut dst: ArrayViewMut1<'_, T>,
    src: ArrayView1<'_, T>,
    w: T,
    lanes: usize,
) {
    let w = w.to_wide();
    for (mut d, s) in dst.exact_chunks_mut(lanes).into_iter().zip(src.exact_chunks(lanes)) {
        d.zip_mut_with(&s, |x, &y| *x = T::from_wide(x.to_wide() + w * y.to_wide()));
    }
}

/// Groups tokens by destination row (CSR layout): tokens for `row` are
/// `tokens[offsets[row]..offsets[row + 1]]`, in ascending token order.
fn slot_owners(
    index: &ArrayView1<'_, i32>,
    location: &ArrayView1<'_, i32>,
    extent: KernelExtent,
    rows: usize,
) -> (Vec<usize>, Vec<usize>) {
    let slots: Vec<Option<usize>> = (0..extent.token_count)
        .map(|t| extent.slot_row(index[t], location[t], rows))
        .collect();

    let mut offsets = vec![0usize; rows + 1];
    for &row in slots.iter().flatten() {
        offsets[row + 1] += 1;
    }
    for row in 0..rows {
        offsets[row + 1] += offsets[row];
    }

    let mut cursor = offsets.clone();
    let mut tokens = vec![0usize; offsets[rows]];
    for (t, slot) in slots.iter().enumerate() {
        if let Some(row) = *slot {
            tokens[cursor[row]] = t;
            cursor[row] += 1;
        }
    }
    (offsets, tokens)
}

impl<T: Element> ScatterKernel<T> for ParallelScatter<T> {
    fn name(&self) -> &str {
        "parallel-scatter"
    }

    fn lanes(&self) -> usize {
        self.lanes
    }

    fn forward_scatter(
        &self,
        gate: Option<ArrayView1<'_, T>>,
        index: ArrayView1<'_, i32>,
        location: ArrayView1<'_, i32>,
        src: ArrayView2<'_, T>,
        mut dst: ArrayViewMut2<'_, T>,
        extent: KernelExtent,
    ) -> Result<()> {
        check_operands(
            "forward_scatter",
            extent,
            self.lanes,
            gate.as_ref().map(|g| g.len()),
            index.len(),
            location.len(),
            src.dim(),
            dst.dim(),
        )?;

        let (offsets, tokens) = slot_owners(&index, &location, extent, dst.nrows());
        let lanes = self.lanes;
        self.pool.install(|| {
            dst.axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(row, mut d)| {
                    for &t in &tokens[offsets[row]..offsets[row + 1]] {
                        axpy_packed(d.view_mut(), src.row(t), weight(&gate, t), lanes);
                    }
                });
        });
        Ok(())
    }

    fn backward_data_gather(
        &self,
        gate: Option<ArrayView1<'_, T>>,
        index: ArrayView1<'_, i32>,
        location: ArrayView1<'_, i32>,
        mut dst_grad: ArrayViewMut2<'_, T>,
        src_grad: ArrayView2<'_, T>,
        extent: KernelExtent,
    ) -> Result<()> {
        check_operands(
            "backward_data_gather",
            extent,
            self.lanes,
            gate.as_ref().map(|g| g.len()),
            index.len(),
            location.len(),
            dst_grad.dim(),
            src_grad.dim(),
        )?;

        let rows = src_grad.nrows();
        let lanes = self.lanes;
        self.pool.install(|| {
            dst_grad
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(t, d)| {
                    if let Some(row) = extent.slot_row(index[t], location[t], rows) {
                        axpy_packed(d, src_grad.row(row), weight(&gate, t), lanes);
                    }
                });
        });
        Ok(())
    }

    fn backward_gate_reduce(
        &self,
        out: ArrayViewMut1<'_, T>,
        index: ArrayView1<'_, i32>,
        location: ArrayView1<'_, i32>,
        lhs: ArrayView2<'_, T>,
        rhs: ArrayView2<'_, T>,
        extent: KernelExtent,
    ) -> Result<()> {
        check_operands(
            "backward_gate_reduce",
            extent,
            self.lanes,
            Some(out.len()),
            index.len(),
            location.len(),
            lhs.dim(),
            rhs.dim(),
        )?;

        let rows = rhs.nrows();
        self.pool.install(|| {
            Zip::indexed(out).par_for_each(|t, o| {
                *o = match extent.slot_row(index[t], location[t], rows) {
                    Some(row) => {
                        let dot = lhs
                            .row(t)
                            .iter()
                            .zip(rhs.row(row).iter())
                            .map(|(&a, &b)| a.to_wide() * b.to_wide())
                            .sum::<f64>();
                        T::from_wide(dot)
                    }
                    None => T::zero(),
                };
            });
        });
        Ok(())
    }
}

/// Kernel specialization, one per (device class, compute dtype) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScatterBackend {
    HostF32,
    HostF64,
    AcceleratorF16,
    AcceleratorF32,
}

impl ScatterBackend {
    /// Picks the backend for data of `dtype` on `device`.
    ///
    /// Host has no half precision path, so `F16` is upgraded to `F32`.
    /// The accelerator has no double precision path.
    pub fn select(device: DeviceClass, dtype: DType) -> Result<Self> {
        match (device, dtype) {
            (DeviceClass::Host, DType::F16 | DType::F32) => Ok(ScatterBackend::HostF32),
            (DeviceClass::Host, DType::F64) => Ok(ScatterBackend::HostF64),
            (DeviceClass::Accelerator, DType::F16) => Ok(ScatterBackend::AcceleratorF16),
            (DeviceClass::Accelerator, DType::F32) => Ok(ScatterBackend::AcceleratorF32),
            (DeviceClass::Accelerator, DType::F64) => Err(DispatchError::UnsupportedDtype {
                backend: DeviceClass::Accelerator.to_string(),
                dtype,
            }),
        }
    }

    pub fn device(self) -> DeviceClass {
        match self {
            ScatterBackend::HostF32 | ScatterBackend::HostF64 => DeviceClass::Host,
            ScatterBackend::AcceleratorF16 | ScatterBackend::AcceleratorF32 => {
                DeviceClass::Accelerator
            }
        }
    }

    pub fn compute_dtype(self) -> DType {
        match self {
            ScatterBackend::AcceleratorF16 => DType::F16,
            ScatterBackend::HostF32 | ScatterBackend::AcceleratorF32 => DType::F32,
            ScatterBackend::HostF64 => DType::F64,
        }
    }

    pub fn lanes(self) -> usize {
        match self {
            ScatterBackend::AcceleratorF16 => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for ScatterBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.device(), self.compute_dtype())
    }
}

/// A bound kernel, typed by its compute dtype.
#[derive(Debug, Clone)]
pub enum KernelHandle {
    F16(Arc<dyn ScatterKernel<f16>>),
    F32(Arc<dyn ScatterKernel<f32>>),
    F64(Arc<dyn ScatterKernel<f64>>),
}

impl KernelHandle {
    /// Builds the built-in kernel for `backend`.
    pub fn specialize(backend: ScatterBackend) -> Result<Self> {
        debug!(%backend, "Specializing scatter kernels");
        let handle = match backend {
            ScatterBackend::HostF32 => KernelHandle::F32(Arc::new(HostScatter::<f32>::new())),
            ScatterBackend::HostF64 => KernelHandle::F64(Arc::new(HostScatter::<f64>::new())),
            ScatterBackend::AcceleratorF16 => {
                KernelHandle::F16(Arc::new(ParallelScatter::<f16>::new(backend.lanes())?))
            }
            ScatterBackend::AcceleratorF32 => {
                KernelHandle::F32(Arc::new(ParallelScatter::<f32>::new(backend.lanes())?))
            }
        };
        Ok(handle)
    }

    pub fn dtype(&self) -> DType {
        match self {
            KernelHandle::F16(_) => DType::F16,
            KernelHandle::F32(_) => DType::F32,
            KernelHandle::F64(_) => DType::F64,
        }
    }

    pub fn lanes(&self) -> usize {
        match self {
            KernelHandle::F16(k) => k.lanes(),
            KernelHandle::F32(k) => k.lanes(),
            KernelHandle::F64(k) => k.lanes(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            KernelHandle::F16(k) => k.name(),
            KernelHandle::F32(k) => k.name(),
            KernelHandle::F64(k) => k.name(),
        }
    }

    /// True when both handles point at the same kernel instance.
    pub fn same_kernel(&self, other: &KernelHandle) -> bool {
        fn addr<K: ?Sized>(k: &Arc<K>) -> *const () {
            Arc::as_ptr(k) as *const ()
        }
        match (self, other) {
            (KernelHandle::F16(a), KernelHandle::F16(b)) => addr(a) == addr(b),
            (KernelHandle::F32(a), KernelHandle::F32(b)) => addr(a) == addr(b),
            (KernelHandle::F64(a), KernelHandle::F64(b)) => addr(a) == addr(b),
            _ => false,
        }
    }
}

static GLOBAL_REGISTRY: LazyLock<KernelRegistry> = LazyLock::new(KernelRegistry::default);

/// Memoized kernel handles keyed by backend.
///
/// Population happens under the lock, so concurrent first use of a backend
/// specializes it exactly once.
#[derive(Debug, Default)]
pub struct KernelRegistry {
    handles: Mutex<HashMap<ScatterBackend, KernelHandle>>,
}

impl KernelRegistry {
    /// The process-wide registry used by every dispatcher.
    pub fn global() -> &'static KernelRegistry {
        &GLOBAL_REGISTRY
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ScatterBackend, KernelHandle>>> {
        self.handles.lock().map_err(|_| DispatchError::KernelInit {
            message: "kernel registry lock poisoned".to_string(),
        })
    }

    pub fn get_or_specialize(&self, backend: ScatterBackend) -> Result<KernelHandle> {
        let mut handles = self.lock()?;
        if let Some(handle) = handles.get(&backend) {
            return Ok(handle.clone());
        }
        let handle = KernelHandle::specialize(backend)?;
        info!(%backend, kernel = handle.name(), "Registered scatter kernels");
        handles.insert(backend, handle.clone());
        Ok(handle)
    }

    /// Installs an external kernel for `backend`, returning the previous one.
    pub fn register(
        &self,
        backend: ScatterBackend,
        handle: KernelHandle,
    ) -> Result<Option<KernelHandle>> {
        if handle.dtype() != backend.compute_dtype() {
            return Err(DispatchError::UnsupportedDtype {
                backend: backend.to_string(),
                dtype: handle.dtype(),
            });
        }
        if handle.lanes() != backend.lanes() {
            return Err(DispatchError::KernelInit {
                message: format!(
                    "kernel {} packs {} lanes, backend {backend} expects {}",
                    handle.name(),
                    handle.lanes(),
                    backend.lanes()
                ),
            });
        }
        info!(%backend, kernel = handle.name(), "Registered external scatter kernels");
        Ok(self.lock()?.insert(backend, handle))
    }

    pub fn is_bound(&self, backend: ScatterBackend) -> bool {
        self.lock().map(|h| h.contains_key(&backend)).unwrap_or(false)
    }
}
