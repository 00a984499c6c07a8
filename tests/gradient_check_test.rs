use approx::assert_abs_diff_eq;
use moe_dispatch::{CriticalData, FastDispatcher, extract_critical, fast_decode, fast_encode};
use ndarray::Array2;

const H: f64 = 1e-6;
const TOL: f64 = 1e-6;

fn routing() -> CriticalData<f64> {
    let scores = Array2::from_shape_fn((6, 3), |(i, j)| {
        let v = ((i * 3 + j) as f64 * 0.71).sin();
        v * v + 0.05
    });
    // capacity 2 · floor(0.75 · 2) = 2 drops some rank-1 assignments
    let (critical, _) = extract_critical(&scores, 2, 0.75, false, false).unwrap();
    assert!((0..2).map(|k| critical.dropped(k)).sum::<usize>() > 0);
    critical
}

fn pattern(rows: usize, cols: usize, phase: f64) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |(i, j)| ((i * cols + j) as f64 * 0.43 + phase).cos())
}

fn encode_loss(x: &Array2<f64>, critical: &CriticalData<f64>, w: &Array2<f64>) -> f64 {
    (&fast_encode(x, critical, false).unwrap() * w).sum()
}

fn decode_loss(e: &Array2<f64>, critical: &CriticalData<f64>, w: &Array2<f64>) -> f64 {
    (&fast_decode(e, critical, true).unwrap() * w).sum()
}

#[test]
fn test_encode_gradients_match_finite_differences() {
    let critical = routing();
    let dim = 4;
    let slots = critical.num_global_experts * critical.capacity;
    let x = pattern(critical.num_tokens(), dim, 0.0);
    let w = pattern(slots, dim, 1.0);

    let mut dispatcher = FastDispatcher::new(critical.num_global_experts, 0, dim);
    dispatcher.update_from(&critical, false).unwrap();
    let (_, encoder) = dispatcher.encode_with_context(&x).unwrap();
    let grads = encoder.backward(&w).unwrap();
    assert_eq!(grads.gates.len(), 2);

    for t in 0..x.nrows() {
        for j in 0..dim {
            let mut plus = x.clone();
            plus[[t, j]] += H;
            let mut minus = x.clone();
            minus[[t, j]] -= H;
            let numeric = (encode_loss(&plus, &critical, &w)
                - encode_loss(&minus, &critical, &w))
                / (2.0 * H);
            assert_abs_diff_eq!(grads.data[[t, j]], numeric, epsilon = TOL);
        }
    }

    for k in 0..critical.top_k() {
        for t in 0..x.nrows() {
            let mut plus = critical.clone();
            plus.gates[k][t] += H;
            let mut minus = critical.clone();
            minus.gates[k][t] -= H;
            let numeric = (encode_loss(&x, &plus, &w) - encode_loss(&x, &minus, &w)) / (2.0 * H);
            assert_abs_diff_eq!(grads.gates[k][t], numeric, epsilon = TOL);
            if critical.locations[k][t] as usize >= critical.capacity {
                assert_eq!(grads.gates[k][t], 0.0);
            }
        }
    }
}

#[test]
fn test_decode_gradients_match_finite_differences() {
    let critical = routing();
    let dim = 3;
    let slots = critical.num_global_experts * critical.capacity;
    let e = pattern(slots, dim, 0.5);
    let w = pattern(critical.num_tokens(), dim, 2.0);

    let mut dispatcher = FastDispatcher::new(critical.num_global_experts, 0, dim);
    dispatcher.update_from(&critical, true).unwrap();
    let (_, decoder) = dispatcher.decode_with_context(&e).unwrap();
    let grads = decoder.backward(&w).unwrap();
    assert_eq!(grads.data.dim(), (slots, dim));

    for s in 0..slots {
        for j in 0..dim {
            let mut plus = e.clone();
            plus[[s, j]] += H;
            let mut minus = e.clone();
            minus[[s, j]] -= H;
            let numeric = (decode_loss(&plus, &critical, &w)
                - decode_loss(&minus, &critical, &w))
                / (2.0 * H);
            assert_abs_diff_eq!(grads.data[[s, j]], numeric, epsilon = TOL);
        }
    }

    for k in 0..critical.top_k() {
        for t in 0..critical.num_tokens() {
            let mut plus = critical.clone();
            plus.gates[k][t] += H;
            let mut minus = critical.clone();
            minus.gates[k][t] -= H;
            let numeric = (decode_loss(&e, &plus, &w) - decode_loss(&e, &minus, &w)) / (2.0 * H);
            assert_abs_diff_eq!(grads.gates[k][t], numeric, epsilon = TOL);
        }
    }
}

#[test]
fn test_ungated_ops_pass_gradients_straight_through() {
    let critical = routing();
    let dim = 2;
    let x = pattern(critical.num_tokens(), dim, 0.3);

    let mut dispatcher = FastDispatcher::new(critical.num_global_experts, 0, dim);
    dispatcher.update_from(&critical, true).unwrap();
    let (buffer, encoder) = dispatcher.encode_with_context(&x).unwrap();
    let grads = encoder.backward(&buffer).unwrap();
    assert!(grads.gates.is_empty());

    // dL/dx for L = ½‖encode(x)‖² counts each kept copy of a token once
    for t in 0..x.nrows() {
        let kept = (0..critical.top_k())
            .filter(|&k| (critical.locations[k][t] as usize) < critical.capacity)
            .count() as f64;
        for j in 0..dim {
            assert_abs_diff_eq!(grads.data[[t, j]], kept * x[[t, j]], epsilon = 1e-12);
        }
    }
}
