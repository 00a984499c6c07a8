use approx::assert_abs_diff_eq;
use half::f16;
use moe_dispatch::{
    CriticalData, DType, DeviceClass, DispatchError, FastDispatcher, KernelRegistry,
    ScatterBackend, extract_critical, fast_decode, fast_encode,
};
use ndarray::{Array1, Array2, array};

fn tokens(n: usize, dim: usize) -> Array2<f32> {
    Array2::from_shape_fn((n, dim), |(i, j)| ((i * dim + j) as f32 * 0.37).sin())
}

fn isolated_registry() -> &'static KernelRegistry {
    Box::leak(Box::new(KernelRegistry::default()))
}

#[test]
fn test_unit_gate_round_trip_is_exact() {
    let x = tokens(4, 6);
    for device in [DeviceClass::Host, DeviceClass::Accelerator] {
        let mut dispatcher = FastDispatcher::<f32>::new(2, 2, 6).with_device(device);
        dispatcher
            .update(
                &[array![0, 1, 0, 1]],
                &[array![0, 0, 1, 1]],
                &[Array1::ones(4)],
                0,
                true,
            )
            .unwrap();

        let buffer = dispatcher.encode(&x).unwrap();
        assert_eq!(buffer.dim(), (4, 6));
        assert_eq!(buffer.row(0), x.row(0));
        assert_eq!(buffer.row(1), x.row(2));
        assert_eq!(buffer.row(2), x.row(1));
        assert_eq!(buffer.row(3), x.row(3));

        let back = dispatcher.decode(&buffer).unwrap();
        assert_eq!(back, x, "round trip on {device}");
    }
}

#[test]
fn test_overflowing_tokens_are_dropped() {
    let x = tokens(4, 3);
    let mut dispatcher = FastDispatcher::<f32>::new(2, 2, 3);
    dispatcher
        .update(
            &[array![0, 0, 0, 0]],
            &[array![0, 1, 2, 3]],
            &[Array1::ones(4)],
            0,
            false,
        )
        .unwrap();

    let buffer = dispatcher.encode(&x).unwrap();
    assert_eq!(buffer.slice(ndarray::s![0..2, ..]), x.slice(ndarray::s![0..2, ..]));
    assert!(buffer.slice(ndarray::s![2..4, ..]).iter().all(|&v| v == 0.0));

    let back = dispatcher.decode(&buffer).unwrap();
    assert_eq!(back.row(0), x.row(0));
    assert_eq!(back.row(1), x.row(1));
    assert!(back.row(2).iter().all(|&v| v == 0.0));
    assert!(back.row(3).iter().all(|&v| v == 0.0));
}

#[test]
fn test_prescore_and_postscore_agree_for_identity_experts() {
    let x = tokens(3, 4);
    let indices = [array![1, 0, 1]];
    let locations = [array![0, 0, 1]];
    let gates = [array![0.25f32, 0.5, 2.0]];

    let mut pre = FastDispatcher::<f32>::new(2, 2, 4);
    pre.update(&indices, &locations, &gates, 0, false).unwrap();
    let mut post = FastDispatcher::<f32>::new(2, 2, 4);
    post.update(&indices, &locations, &gates, 0, true).unwrap();

    let pre_buffer = pre.encode(&x).unwrap();
    let post_buffer = post.encode(&x).unwrap();
    // gates only touch the pre-score buffer
    assert_eq!(post_buffer.row(2), x.row(0));
    assert_eq!(pre_buffer.row(2), x.row(0).mapv(|v| v * 0.25));

    let pre_out = pre.decode(&pre_buffer).unwrap();
    let post_out = post.decode(&post_buffer).unwrap();
    assert_eq!(pre_out, post_out);
    for t in 0..3 {
        let expected = x.row(t).mapv(|v| v * gates[0][t]);
        assert_eq!(pre_out.row(t), expected);
    }
}

#[test]
fn test_accelerator_matches_host() {
    let scores = Array2::from_shape_fn((12, 4), |(i, j)| ((i * 4 + j) as f32 * 1.3).cos().abs());
    let (critical, _) = extract_critical(&scores, 2, 1.0, false, false).unwrap();
    let x = tokens(12, 8);

    let mut host = FastDispatcher::<f32>::new(4, 0, 8);
    host.update_from(&critical, false).unwrap();
    let mut accel = FastDispatcher::<f32>::new(4, 0, 8).with_device(DeviceClass::Accelerator);
    accel.update_from(&critical, false).unwrap();
    assert_eq!(accel.config().unwrap().backend, ScatterBackend::AcceleratorF32);

    let host_buffer = host.encode(&x).unwrap();
    let accel_buffer = accel.encode(&x).unwrap();
    for (h, a) in host_buffer.iter().zip(accel_buffer.iter()) {
        assert_abs_diff_eq!(*h, *a, epsilon = 1e-6);
    }

    let host_out = host.decode(&host_buffer).unwrap();
    let accel_out = accel.decode(&accel_buffer).unwrap();
    for (h, a) in host_out.iter().zip(accel_out.iter()) {
        assert_abs_diff_eq!(*h, *a, epsilon = 1e-5);
    }
}

#[test]
fn test_half_precision_paths() {
    let x = tokens(4, 4).mapv(f16::from_f32);
    let indices = [array![0, 1, 1, 0]];
    let locations = [array![0, 0, 1, 1]];
    let gates = [Array1::from_elem(4, f16::ONE)];

    let mut host = FastDispatcher::<f16>::new(2, 2, 4);
    host.update(&indices, &locations, &gates, 0, true).unwrap();
    let config = *host.config().unwrap();
    assert_eq!(config.backend, ScatterBackend::HostF32);
    assert_eq!(config.dtype, DType::F32);
    assert_eq!(config.original_dtype, DType::F16);
    assert_eq!(config.aligned_dim, 4);

    let mut accel = FastDispatcher::<f16>::new(2, 2, 4).with_device(DeviceClass::Accelerator);
    accel.update(&indices, &locations, &gates, 0, true).unwrap();
    let config = *accel.config().unwrap();
    assert_eq!(config.backend, ScatterBackend::AcceleratorF16);
    assert_eq!(config.dtype, DType::F16);
    assert_eq!(config.aligned_dim, 2);

    for dispatcher in [&host, &accel] {
        let back = dispatcher.decode(&dispatcher.encode(&x).unwrap()).unwrap();
        assert_eq!(back, x);
    }
}

#[test]
fn test_shape_errors() {
    let mut dispatcher = FastDispatcher::<f32>::new(2, 2, 3);
    dispatcher
        .update(&[array![0, 1]], &[array![0, 0]], &[array![1.0f32, 1.0]], 0, true)
        .unwrap();

    let err = dispatcher.encode(&Array2::zeros((3, 3))).unwrap_err();
    assert!(matches!(err, DispatchError::ShapeMismatch { .. }));
    let err = dispatcher.encode(&Array2::zeros((2, 4))).unwrap_err();
    assert!(matches!(err, DispatchError::ShapeMismatch { .. }));
    let err = dispatcher.decode(&Array2::zeros((3, 3))).unwrap_err();
    assert!(matches!(err, DispatchError::ShapeMismatch { .. }));
}

#[test]
fn test_capacity_update_changes_buffer() {
    let mut dispatcher = FastDispatcher::<f64>::new(2, 1, 2);
    let x = array![[1.0, 2.0], [3.0, 4.0]];
    dispatcher
        .update(&[array![0, 0]], &[array![0, 1]], &[array![1.0, 1.0]], 0, true)
        .unwrap();
    assert_eq!(dispatcher.encode(&x).unwrap().nrows(), 2);
    assert_eq!(dispatcher.decode(&dispatcher.encode(&x).unwrap()).unwrap().row(1).sum(), 0.0);

    dispatcher
        .update(&[array![0, 0]], &[array![0, 1]], &[array![1.0, 1.0]], 2, true)
        .unwrap();
    assert_eq!(dispatcher.config().unwrap().capacity, 2);
    assert_eq!(dispatcher.encode(&x).unwrap().nrows(), 4);
    assert_eq!(dispatcher.decode(&dispatcher.encode(&x).unwrap()).unwrap(), x);
}

#[test]
fn test_kernels_are_memoized_per_backend() {
    let registry = isolated_registry();
    assert!(!registry.is_bound(ScatterBackend::AcceleratorF32));

    let mut a = FastDispatcher::<f32>::new(2, 1, 2)
        .with_device(DeviceClass::Accelerator)
        .with_registry(registry);
    let mut b = FastDispatcher::<f32>::new(2, 1, 2)
        .with_device(DeviceClass::Accelerator)
        .with_registry(registry);
    for dispatcher in [&mut a, &mut b] {
        dispatcher
            .update(&[array![0]], &[array![0]], &[array![1.0f32]], 0, true)
            .unwrap();
    }

    assert!(registry.is_bound(ScatterBackend::AcceleratorF32));
    assert!(!registry.is_bound(ScatterBackend::HostF32));
    let ka = a.plan().unwrap().kernel().clone();
    let kb = b.plan().unwrap().kernel().clone();
    assert!(ka.same_kernel(&kb));
}

#[test]
fn test_switching_device_rebinds() {
    let registry = isolated_registry();
    let mut dispatcher = FastDispatcher::<f32>::new(2, 1, 2).with_registry(registry);
    dispatcher
        .update(&[array![0]], &[array![0]], &[array![1.0f32]], 0, true)
        .unwrap();
    assert_eq!(dispatcher.config().unwrap().backend, ScatterBackend::HostF32);

    dispatcher.set_device(DeviceClass::Accelerator);
    dispatcher
        .update(&[array![0]], &[array![0]], &[array![1.0f32]], 0, true)
        .unwrap();
    assert_eq!(dispatcher.config().unwrap().backend, ScatterBackend::AcceleratorF32);
    assert!(registry.is_bound(ScatterBackend::HostF32));
    assert!(registry.is_bound(ScatterBackend::AcceleratorF32));
}

#[test]
fn test_fast_encode_decode_with_routing() {
    let scores: Array2<f64> = array![[0.9, 0.1], [0.8, 0.2], [0.3, 0.7], [0.4, 0.6]];
    let (critical, _) = extract_critical(&scores, 1, 1.0, false, false).unwrap();
    let x = array![[1.0, 0.0], [0.0, 1.0], [2.0, 2.0], [1.0, -1.0]];

    let buffer = fast_encode(&x, &critical, true).unwrap();
    assert_eq!(buffer.dim(), (4, 2));
    assert_eq!(buffer, array![[1.0, 0.0], [0.0, 1.0], [2.0, 2.0], [1.0, -1.0]]);

    let combined = fast_decode(&buffer, &critical, true).unwrap();
    for t in 0..4 {
        let gate = scores.row(t).fold(0.0f64, |m, &v| m.max(v));
        for j in 0..2 {
            assert_abs_diff_eq!(combined[[t, j]], x[[t, j]] * gate, epsilon = 1e-12);
        }
    }
}

#[test]
fn test_fast_decode_rejects_mismatched_buffer() {
    let critical = CriticalData::<f32> {
        num_global_experts: 2,
        indices: vec![array![0, 1]],
        locations: vec![array![0, 0]],
        gates: vec![array![1.0, 1.0]],
        capacity: 1,
    };
    let err = fast_decode(&Array2::<f32>::zeros((3, 2)), &critical, true).unwrap_err();
    assert!(matches!(err, DispatchError::ShapeMismatch { .. }));
}
