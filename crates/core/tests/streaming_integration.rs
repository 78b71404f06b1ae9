//! Integration tests for carrying recurrent state across calls.
//!
//! Covers chunked prefill through `initial_state` / final state, token-by-token
//! decode through `DplrState::step`, and a packed multi-sequence batch driven
//! by `DplrStateManager::gather` / `scatter`.

use candle_core::{DType, Device, Tensor};
use dplr_core::{fused_recurrent_rwkv7, DplrState, DplrStateManager, ScanConfig};

const HEADS: usize = 2;
const KEY_DIM: usize = 4;
const VALUE_DIM: usize = 4;

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// `[r, w, k, v, a, b]` for a single sequence, `[1, T, H, *]`.
fn random_streams(seq_len: usize) -> [Tensor; 6] {
    let dev = Device::Cpu;
    let kshape = (1, seq_len, HEADS, KEY_DIM);
    let vshape = (1, seq_len, HEADS, VALUE_DIM);
    [
        Tensor::randn(0f32, 1.0, kshape, &dev).unwrap(),
        Tensor::rand(0f32, 1.0, kshape, &dev)
            .unwrap()
            .affine(-0.9, -0.05)
            .unwrap(),
        Tensor::randn(0f32, 0.5, kshape, &dev).unwrap(),
        Tensor::randn(0f32, 1.0, vshape, &dev).unwrap(),
        Tensor::randn(0f32, 0.2, kshape, &dev).unwrap(),
        Tensor::randn(0f32, 0.2, kshape, &dev).unwrap(),
    ]
}

fn slice(streams: &[Tensor; 6], start: usize, len: usize) -> [Tensor; 6] {
    streams
        .clone()
        .map(|t| t.narrow(1, start, len).unwrap())
}

fn scan(
    streams: &[Tensor; 6],
    initial_state: Option<&Tensor>,
    cu_seqlens: Option<&[usize]>,
) -> (Tensor, Tensor) {
    let [r, w, k, v, a, b] = streams;
    let (out, state) =
        fused_recurrent_rwkv7(r, w, k, v, a, b, initial_state, cu_seqlens, &ScanConfig::rwkv7())
            .unwrap();
    (out, state.unwrap())
}

fn max_diff(x: &Tensor, y: &Tensor) -> f32 {
    (x - y)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap()
}

// ─── Chunked prefill ─────────────────────────────────────────────────────────

#[test]
fn test_chunked_prefill_matches_full_scan() {
    let streams = random_streams(10);
    let (full_out, full_state) = scan(&streams, None, None);

    let (out1, state1) = scan(&slice(&streams, 0, 4), None, None);
    let (out2, state2) = scan(&slice(&streams, 4, 6), Some(&state1), None);

    let chunked = Tensor::cat(&[&out1, &out2], 1).unwrap();
    let diff = max_diff(&chunked, &full_out);
    assert!(diff < 1e-5, "chunked vs full output mismatch: {diff}");
    let diff = max_diff(&state2, &full_state);
    assert!(diff < 1e-5, "chunked vs full state mismatch: {diff}");
}

#[test]
fn test_empty_chunk_returns_fresh_state() {
    let (_, carried) = scan(&random_streams(3), None, None);

    // A zero-length chunk passes the state through as a new tensor.
    let (out, passed) = scan(&random_streams(0), Some(&carried), None);
    assert_eq!(out.dims(), &[1, 0, HEADS, VALUE_DIM]);
    assert_ne!(passed.id(), carried.id());
    assert_eq!(max_diff(&passed, &carried), 0.0);

    // Same for an empty segment inside a packed call.
    let states = Tensor::cat(&[&carried, &carried], 0).unwrap();
    let (_, finals) = scan(&random_streams(2), Some(&states), Some(&[0, 2, 2][..]));
    let passed = finals.narrow(0, 1, 1).unwrap();
    assert_eq!(max_diff(&passed, &carried), 0.0);
}

// ─── Token-by-token decode ───────────────────────────────────────────────────

#[test]
fn test_prefill_then_decode() {
    let streams = random_streams(8);
    let (full_out, _) = scan(&streams, None, None);

    // Prefill 5 tokens, then decode the remaining 3 one at a time.
    let (_, prefill_state) = scan(&slice(&streams, 0, 5), None, None);
    let mut state = DplrState {
        tensor: prefill_state,
    };
    for t in 5..8 {
        let [r, w, k, v, a, b] = streams.clone().map(|x| x.get(0).unwrap().get(t).unwrap());
        let y = state.step(&r, &w, &k, &v, &a, &b, 1.0).unwrap();
        let expected = full_out.get(0).unwrap().get(t).unwrap();
        let diff = max_diff(&y, &expected);
        assert!(diff < 1e-5, "decode step {t} mismatch: {diff}");
    }
}

// ─── Multi-sequence batches through the state manager ───────────────────────

#[test]
fn test_manager_drives_packed_batches() {
    let mut mgr = DplrStateManager::new(HEADS, KEY_DIM, VALUE_DIM, DType::F32, Device::Cpu);
    let seq_ids = [11u64, 42];
    for id in seq_ids {
        mgr.allocate_state(id).unwrap();
    }

    let seq_a = random_streams(7);
    let seq_b = random_streams(5);
    let (ref_a, ref_state_a) = scan(&seq_a, None, None);
    let (ref_b, ref_state_b) = scan(&seq_b, None, None);

    // Two rounds: first 4 + 3 tokens, then 3 + 2 tokens, packed each time.
    let rounds = [((0, 4), (0, 3)), ((4, 3), (3, 2))];
    for ((a_start, a_len), (b_start, b_len)) in rounds {
        let chunk_a = slice(&seq_a, a_start, a_len);
        let chunk_b = slice(&seq_b, b_start, b_len);
        let packed: [Tensor; 6] = std::array::from_fn(|i| {
            Tensor::cat(&[&chunk_a[i], &chunk_b[i]], 1).unwrap()
        });
        let cu_seqlens = [0, a_len, a_len + b_len];

        let initial = mgr.gather(&seq_ids).unwrap();
        let (out, final_state) = scan(&packed, Some(&initial), Some(&cu_seqlens[..]));
        mgr.scatter(&seq_ids, &final_state).unwrap();

        let out_a = out.narrow(1, 0, a_len).unwrap();
        let out_b = out.narrow(1, a_len, b_len).unwrap();
        let diff_a = max_diff(&out_a, &ref_a.narrow(1, a_start, a_len).unwrap());
        let diff_b = max_diff(&out_b, &ref_b.narrow(1, b_start, b_len).unwrap());
        assert!(diff_a < 1e-5, "sequence 11 mismatch: {diff_a}");
        assert!(diff_b < 1e-5, "sequence 42 mismatch: {diff_b}");
    }

    let diff = max_diff(&mgr.get_state(11).unwrap().tensor, &ref_state_a);
    assert!(diff < 1e-5, "sequence 11 final state mismatch: {diff}");
    let diff = max_diff(&mgr.get_state(42).unwrap().tensor, &ref_state_b);
    assert!(diff < 1e-5, "sequence 42 final state mismatch: {diff}");

    mgr.free_state(11);
    assert_eq!(mgr.num_active_sequences(), 1);
}
