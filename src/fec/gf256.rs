//! GF(2^8) arithmetic for Reed-Solomon recovery
//!
//! Field defined by the irreducible polynomial x^8 + x^4 + x^3 + x^2 + 1
//! (modulus byte 0x1d), matching the upstream FEC encoder.

use std::sync::OnceLock;

const POLY: u16 = 0x11d;

struct Tables {
    exp: [u8; 512],
    log: [u8; 256],
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= POLY;
            }
        }
        // Doubled exp table avoids a modulo in mul().
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        Tables { exp, log }
    })
}

#[inline]
pub fn add(a: u8, b: u8) -> u8 {
    a ^ b
}

#[inline]
pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = tables();
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

/// Multiplicative inverse; zero has none.
pub fn inv(a: u8) -> Option<u8> {
    if a == 0 {
        return None;
    }
    let t = tables();
    Some(t.exp[255 - t.log[a as usize] as usize])
}

pub fn div(a: u8, b: u8) -> Option<u8> {
    Some(mul(a, inv(b)?))
}

/// `a` raised to `n` over the field.
pub fn pow(a: u8, n: usize) -> u8 {
    if n == 0 {
        return 1;
    }
    if a == 0 {
        return 0;
    }
    let t = tables();
    let e = (t.log[a as usize] as usize * n) % 255;
    t.exp[e]
}

/// `dst ^= coeff * src` over a whole block.
pub fn mul_add_slice(dst: &mut [u8], src: &[u8], coeff: u8) {
    if coeff == 0 {
        return;
    }
    if coeff == 1 {
        for (d, s) in dst.iter_mut().zip(src) {
            *d ^= *s;
        }
        return;
    }
    let t = tables();
    let log_c = t.log[coeff as usize] as usize;
    for (d, s) in dst.iter_mut().zip(src) {
        if *s != 0 {
            *d ^= t.exp[log_c + t.log[*s as usize] as usize];
        }
    }
}
