use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustml_kernels::*;

fn random_vec(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

#[test]
fn gemv_within_tolerance_of_reference() {
    let mut rng = StdRng::seed_from_u64(3);
    // large enough to take the parallel path at the default threshold
    let (rows, cols) = (300, 257);
    let w = random_vec(&mut rng, rows * cols);
    let x = random_vec(&mut rng, cols);
    let b = random_vec(&mut rng, rows);

    let mut fast = vec![0.0; rows];
    let mut reference = vec![0.0; rows];
    gemv(WeightView::F32(&w), rows, cols, &x, Some(&b), &mut fast);
    gemv_ref(&w, rows, cols, &x, Some(&b), &mut reference);

    for r in 0..rows {
        let magnitude: f32 =
            w[r * cols..(r + 1) * cols].iter().zip(&x).map(|(a, b)| (a * b).abs()).sum::<f32>() + b[r].abs();
        assert!(
            (fast[r] - reference[r]).abs() <= GEMV_TOLERANCE * magnitude.max(1.0),
            "row {}: {} vs {}",
            r,
            fast[r],
            reference[r]
        );
    }
}

#[test]
fn packed_gemv_matches_unpacked_weights() {
    let mut rng = StdRng::seed_from_u64(5);
    let (rows, cols) = (16, 24);
    let w = random_vec(&mut rng, rows * cols);
    let x = random_vec(&mut rng, cols);

    for dtype in [PackedDType::F16, PackedDType::BF16] {
        let mut bits = vec![0u16; w.len()];
        pack(dtype, &w, &mut bits);
        let mut rounded = vec![0.0f32; w.len()];
        unpack(dtype, &bits, &mut rounded);

        let mut packed_out = vec![0.0; rows];
        match dtype {
            PackedDType::F16 => gemv_f16(&bits, rows, cols, &x, None, &mut packed_out),
            PackedDType::BF16 => gemv_bf16(&bits, rows, cols, &x, None, &mut packed_out),
        }
        let mut expected = vec![0.0; rows];
        gemv_ref(&rounded, rows, cols, &x, None, &mut expected);
        for r in 0..rows {
            assert!((packed_out[r] - expected[r]).abs() < 1e-4, "{:?} row {}", dtype, r);
        }
    }
}

#[test]
fn pack_round_trip_within_half_ulp() {
    let mut rng = StdRng::seed_from_u64(9);
    let values: Vec<f32> = (0..512).map(|_| rng.gen_range(-1000.0f32..1000.0)).collect();
    for dtype in [PackedDType::F16, PackedDType::BF16] {
        let mut bits = vec![0u16; values.len()];
        pack(dtype, &values, &mut bits);
        let mut back = vec![0.0f32; values.len()];
        unpack(dtype, &bits, &mut back);
        for (&v, &b) in values.iter().zip(&back) {
            assert!(b.is_finite());
            assert!((v - b).abs() <= dtype.round_trip_bound(v), "{:?}: {} -> {}", dtype, v, b);
        }
    }
}

#[test]
fn row_batched_matmul_matches_per_row_gemv() {
    let w = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // [3, 2]
    let x = [1.0, 0.0, 0.0, 1.0]; // two rows
    let mut y = [0.0; 6];
    matmul_rows(WeightView::F32(&w), 3, 2, &x, 2, None, &mut y);
    assert_eq!(y, [1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);

    let mut dx = [0.0; 4];
    matmul_rows_transposed_acc(WeightView::F32(&w), 3, 2, &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0], 2, &mut dx);
    assert_eq!(dx, [1.0, 2.0, 5.0, 6.0]);
}
