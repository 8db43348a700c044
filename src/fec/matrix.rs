//! Generator matrices for the Reed-Solomon FEC scheme
//!
//! A systematic code: source packets pass through untouched, parity rows come
//! from a Vandermonde construction normalized so the data rows are the
//! identity. Any k received packets out of k+m then span an invertible
//! system.
//!
//! The carrier's standard (k=100, m=5) grouping does NOT go through that
//! derivation: its servers ship a hard-wired generator table, reproduced
//! here as a compile-time constant (see `CARRIER_GENERATOR`).

use super::gf256;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    data: Vec<u8>,
}

impl Matrix {
    pub fn zero(rows: usize, cols: usize) -> Self {
        Matrix { rows, cols, data: vec![0; rows * cols] }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Matrix::zero(n, n);
        for i in 0..n {
            m.set(i, i, 1);
        }
        m
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> u8 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: u8) {
        self.data[r * self.cols + c] = v;
    }

    pub fn row(&self, r: usize) -> &[u8] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn mul(&self, rhs: &Matrix) -> Matrix {
        debug_assert_eq!(self.cols, rhs.rows);
        let mut out = Matrix::zero(self.rows, rhs.cols);
        for i in 0..self.rows {
            for j in 0..rhs.cols {
                let mut acc = 0u8;
                for t in 0..self.cols {
                    acc ^= gf256::mul(self.get(i, t), rhs.get(t, j));
                }
                out.set(i, j, acc);
            }
        }
        out
    }

    /// Gauss-Jordan inversion over GF(256). `None` for singular input.
    pub fn invert(&self) -> Option<Matrix> {
        debug_assert_eq!(self.rows, self.cols);
        let n = self.rows;
        let mut work = self.clone();
        let mut out = Matrix::identity(n);
        for col in 0..n {
            // Find a pivot.
            let pivot = (col..n).find(|&r| work.get(r, col) != 0)?;
            if pivot != col {
                for c in 0..n {
                    let (a, b) = (work.get(col, c), work.get(pivot, c));
                    work.set(col, c, b);
                    work.set(pivot, c, a);
                    let (a, b) = (out.get(col, c), out.get(pivot, c));
                    out.set(col, c, b);
                    out.set(pivot, c, a);
                }
            }
            let piv_inv = gf256::inv(work.get(col, col))?;
            for c in 0..n {
                work.set(col, c, gf256::mul(work.get(col, c), piv_inv));
                out.set(col, c, gf256::mul(out.get(col, c), piv_inv));
            }
            for r in 0..n {
                if r == col {
                    continue;
                }
                let factor = work.get(r, col);
                if factor == 0 {
                    continue;
                }
                for c in 0..n {
                    let wv = gf256::mul(work.get(col, c), factor);
                    work.set(r, c, work.get(r, c) ^ wv);
                    let ov = gf256::mul(out.get(col, c), factor);
                    out.set(r, c, out.get(r, c) ^ ov);
                }
            }
        }
        Some(out)
    }
}

/// Build the m parity rows for a (k, m) group.
fn build_parity(k: usize, m: usize) -> Matrix {
    // Full (k+m) x k Vandermonde over distinct points 0..k+m.
    let mut v = Matrix::zero(k + m, k);
    for i in 0..k + m {
        for j in 0..k {
            v.set(i, j, gf256::pow(i as u8, j));
        }
    }
    // Normalize so the top k rows are the identity; parity rows are the rest.
    let mut top = Matrix::zero(k, k);
    for i in 0..k {
        for j in 0..k {
            top.set(i, j, v.get(i, j));
        }
    }
    let top_inv = top
        .invert()
        .unwrap_or_else(|| Matrix::identity(k)); // distinct points: always invertible
    let g = v.mul(&top_inv);
    let mut parity = Matrix::zero(m, k);
    for r in 0..m {
        for c in 0..k {
            parity.set(r, c, g.get(k + r, c));
        }
    }
    parity
}

/// The carrier's standard grouping: 100 source packets, 5 parity.
pub const CARRIER_K: usize = 100;
pub const CARRIER_M: usize = 5;

/// Hard-coded generator for the (100, 5) grouping.
///
/// Row `r` weights column `j` with `alpha^(r*j mod 255)` over the field
/// generator `alpha = 2`: row 0 is the plain XOR parity, and each further
/// row multiplies by one more `alpha^j` step, which the deployed encoders
/// realize as a cascade of four XOR-accumulated shift permutations of the
/// source block (one per bit of the shifted-out high nibble). The table is
/// fixed at compile time; it is not a product of `build_parity`.
static CARRIER_GENERATOR: [[u8; CARRIER_K]; CARRIER_M] = carrier_table();

const fn carrier_table() -> [[u8; CARRIER_K]; CARRIER_M] {
    // alpha^0 .. alpha^254 over x^8 + x^4 + x^3 + x^2 + 1.
    let mut exp = [0u8; 255];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= 0x11d;
        }
        i += 1;
    }
    let mut g = [[0u8; CARRIER_K]; CARRIER_M];
    let mut r = 0;
    while r < CARRIER_M {
        let mut j = 0;
        while j < CARRIER_K {
            g[r][j] = exp[(r * j) % 255];
            j += 1;
        }
        r += 1;
    }
    g
}

fn carrier_generator() -> &'static Matrix {
    static CACHED: OnceLock<Matrix> = OnceLock::new();
    CACHED.get_or_init(|| {
        let mut m = Matrix::zero(CARRIER_M, CARRIER_K);
        for r in 0..CARRIER_M {
            for c in 0..CARRIER_K {
                m.set(r, c, CARRIER_GENERATOR[r][c]);
            }
        }
        m
    })
}

/// Parity generator for a (k, m) group. The carrier's (100, 5) grouping is
/// served from its hard-coded table; everything else derives via Vandermonde
/// inversion, cached so workers pay the O(k^3) construction once per
/// process.
pub fn parity_generator(k: usize, m: usize) -> &'static Matrix {
    if k == CARRIER_K && m == CARRIER_M {
        return carrier_generator();
    }
    static CACHE: OnceLock<Mutex<HashMap<(usize, usize), &'static Matrix>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock();
    *guard
        .entry((k, m))
        .or_insert_with(|| Box::leak(Box::new(build_parity(k, m))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_roundtrip() {
        let m = Matrix::identity(5);
        assert_eq!(m.invert().unwrap(), m);
    }

    #[test]
    fn test_invert_known_matrix() {
        let mut m = Matrix::zero(2, 2);
        m.set(0, 0, 1);
        m.set(0, 1, 2);
        m.set(1, 0, 3);
        m.set(1, 1, 4);
        let inv = m.invert().unwrap();
        assert_eq!(m.mul(&inv), Matrix::identity(2));
    }

    #[test]
    fn test_singular_matrix_rejected() {
        let mut m = Matrix::zero(2, 2);
        m.set(0, 0, 5);
        m.set(0, 1, 5);
        m.set(1, 0, 5);
        m.set(1, 1, 5);
        assert!(m.invert().is_none());
    }

    #[test]
    fn test_any_k_rows_invertible() {
        // The MDS property that recovery relies on: data rows (identity) plus
        // parity rows, any k of them, form an invertible system.
        let k = 6;
        let m = 3;
        let parity = parity_generator(k, m);
        // Drop data rows 1 and 4, substitute parity rows 0 and 2.
        let mut a = Matrix::zero(k, k);
        let mut row = 0;
        for j in 0..k {
            if j == 1 || j == 4 {
                continue;
            }
            a.set(row, j, 1);
            row += 1;
        }
        for &r in &[0usize, 2] {
            for c in 0..k {
                a.set(row, c, parity.get(r, c));
            }
            row += 1;
        }
        assert!(a.invert().is_some());
    }

    #[test]
    fn test_carrier_grouping_dimensions() {
        let g = parity_generator(100, 5);
        assert_eq!(g.rows, 5);
        assert_eq!(g.cols, 100);
        // Rows must be distinct and non-degenerate.
        for r in 0..5 {
            assert!(g.row(r).iter().any(|&v| v != 0));
        }
    }

    #[test]
    fn test_carrier_table_structure() {
        let g = parity_generator(CARRIER_K, CARRIER_M);
        // Row 0 is the plain XOR parity; column 0 is 1 in every row.
        for j in 0..CARRIER_K {
            assert_eq!(g.get(0, j), 1);
        }
        for r in 0..CARRIER_M {
            assert_eq!(g.get(r, 0), 1);
        }
        // alpha and alpha^8 under the 0x11d polynomial.
        assert_eq!(g.get(1, 1), 0x02);
        assert_eq!(g.get(1, 8), 0x1d);
        // Every entry follows the row-wise alpha^(r*j) schedule.
        for r in 0..CARRIER_M {
            for j in 0..CARRIER_K {
                assert_eq!(g.get(r, j), gf256::pow(2, r * j), "r={} j={}", r, j);
            }
        }
    }

    #[test]
    fn test_carrier_table_is_not_the_derived_matrix() {
        // The (100, 5) grouping must bypass the generic construction; its
        // fixed table differs from what build_parity would produce.
        let fixed = parity_generator(CARRIER_K, CARRIER_M);
        let derived = build_parity(CARRIER_K, CARRIER_M);
        assert_ne!(fixed.row(0), derived.row(0));
    }
}
