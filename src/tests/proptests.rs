use proptest::prelude::*;

use crate::sparse::CsrMatrix;
use crate::vector::{Quat, V3};

proptest! {
    /// CSR mat-vec agrees with a dense reference for arbitrary triplets.
    #[test]
    fn csr_matvec_matches_dense(
        triplets in prop::collection::vec((0usize..6, 0usize..6, -100.0f64..100.0), 0..30),
        x in prop::collection::vec(-10.0f64..10.0, 6),
    ) {
        let matrix = CsrMatrix::from_triplets(6, 6, triplets.clone()).unwrap();
        let mut dense = [[0.0; 6]; 6];
        for (r, c, v) in triplets {
            dense[r][c] += v;
        }
        let y = matrix.mul_vec(&x).unwrap();
        for i in 0..6 {
            let expected: f64 = (0..6).map(|j| dense[i][j] * x[j]).sum();
            prop_assert!((y[i] - expected).abs() < 1e-9);
        }
    }

    /// Transposed mat-vec agrees with the same dense reference.
    #[test]
    fn csr_transpose_matvec_matches_dense(
        triplets in prop::collection::vec((0usize..5, 0usize..4, -100.0f64..100.0), 0..20),
        x in prop::collection::vec(-10.0f64..10.0, 5),
    ) {
        let matrix = CsrMatrix::from_triplets(5, 4, triplets.clone()).unwrap();
        let mut dense = [[0.0; 4]; 5];
        for (r, c, v) in triplets {
            dense[r][c] += v;
        }
        let y = matrix.transpose_mul_vec(&x).unwrap();
        for j in 0..4 {
            let expected: f64 = (0..5).map(|i| dense[i][j] * x[i]).sum();
            prop_assert!((y[j] - expected).abs() < 1e-9);
        }
    }

    /// Quaternion rotation never changes a vector's length.
    #[test]
    fn rotation_preserves_length(
        qw in -1.0f64..1.0, qx in -1.0f64..1.0, qy in -1.0f64..1.0, qz in -1.0f64..1.0,
        vx in -100.0f64..100.0, vy in -100.0f64..100.0, vz in -100.0f64..100.0,
    ) {
        let q = Quat::new(qw, qx, qy, qz);
        prop_assume!(q.norm() > 1e-3);
        let q = q.normalized();
        let v = V3::new(vx, vy, vz);
        let rotated = q.rotate(v);
        prop_assert!((rotated.magnitude() - v.magnitude()).abs() < 1e-8 * (1.0 + v.magnitude()));
    }

    /// Distance residuals are symmetric in their endpoints.
    #[test]
    fn distance_residual_is_symmetric(
        ax in -10.0f64..10.0, ay in -10.0f64..10.0, az in -10.0f64..10.0,
        bx in -10.0f64..10.0, by in -10.0f64..10.0, bz in -10.0f64..10.0,
        target in 0.0f64..10.0,
    ) {
        use crate::residuals::Residual;
        let forward = Residual::Distance { a: [0, 1, 2], b: [3, 4, 5], target };
        let backward = Residual::Distance { a: [3, 4, 5], b: [0, 1, 2], target };
        let x = [ax, ay, az, bx, by, bz];
        let mut r0 = Vec::new();
        let mut r1 = Vec::new();
        forward.residual(&x, &mut r0);
        backward.residual(&x, &mut r1);
        prop_assert!((r0[0] - r1[0]).abs() < 1e-12);
    }
}
