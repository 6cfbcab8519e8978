//! (t, n) Shamir secret sharing over GF(2^8).
//!
//! Each secret byte is the constant term of an independent random polynomial of degree
//! t-1; share `x` holds the evaluation at `x` (1..=n) for every byte. Any t shares
//! recover the secret via Lagrange interpolation at zero; fewer reveal nothing.
//!
//! Shares carry no integrity protection here. Callers publish a commitment to the secret
//! and check the reconstruction against it.
//!
//! Field: the AES polynomial x^8 + x^4 + x^3 + x + 1 with generator 3. Table lookups are
//! not constant-time.

use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;

const fn build_tables() -> ([u8; 256], [u8; 255]) {
    let mut log = [0u8; 256];
    let mut exp = [0u8; 255];
    let mut x: u8 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x;
        log[x as usize] = i as u8;
        let mut doubled = x << 1;
        if x & 0x80 != 0 {
            doubled ^= 0x1b;
        }
        x ^= doubled;
        i += 1;
    }
    (log, exp)
}

const TABLES: ([u8; 256], [u8; 255]) = build_tables();
const LOG: [u8; 256] = TABLES.0;
const EXP: [u8; 255] = TABLES.1;

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    EXP[(LOG[a as usize] as usize + LOG[b as usize] as usize) % 255]
}

fn gf_div(a: u8, b: u8) -> u8 {
    debug_assert!(b != 0);
    if a == 0 {
        return 0;
    }
    EXP[(LOG[a as usize] as usize + 255 - LOG[b as usize] as usize) % 255]
}

/// One share. Deliberately not `Serialize`; use [`RawShare::to_bytes`] only to feed
/// the share straight into a sealing operation.
#[derive(Clone, PartialEq, Eq)]
pub struct RawShare {
    index: u8,
    value: Zeroizing<Vec<u8>>,
}

impl RawShare {
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// `index || value`, zeroized on drop.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(1 + self.value.len()));
        out.push(self.index);
        out.extend_from_slice(&self.value);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        match bytes.split_first() {
            Some((&0, _)) => Err(CryptoError::InvalidShare("index 0 is the secret".into())),
            Some((&index, rest)) if !rest.is_empty() => Ok(Self {
                index,
                value: Zeroizing::new(rest.to_vec()),
            }),
            _ => Err(CryptoError::InvalidShare("share too short".into())),
        }
    }

    /// Public commitment to this share, bound to a context (key reference + epoch).
    pub fn commitment(&self, context: &str) -> String {
        crate::hash::commitment(context, &self.to_bytes())
    }
}

impl std::fmt::Debug for RawShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RawShare(index={}, len={})", self.index, self.value.len())
    }
}

/// Split `secret` into `shares` shares, any `threshold` of which reconstruct it.
pub fn split(secret: &[u8], threshold: u8, shares: u8) -> Result<Vec<RawShare>, CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::SharingParameters("empty secret".into()));
    }
    if threshold == 0 || shares == 0 || threshold > shares {
        return Err(CryptoError::SharingParameters(format!(
            "need 1 <= t <= n, got t={threshold} n={shares}"
        )));
    }

    let mut out: Vec<RawShare> = (1..=shares)
        .map(|index| RawShare {
            index,
            value: Zeroizing::new(Vec::with_capacity(secret.len())),
        })
        .collect();

    let mut coefficients = vec![0u8; threshold as usize];
    for &byte in secret {
        coefficients[0] = byte;
        rand::rngs::OsRng.fill_bytes(&mut coefficients[1..]);
        for share in out.iter_mut() {
            // Horner evaluation at x = share.index
            let mut y = 0u8;
            for &c in coefficients.iter().rev() {
                y = gf_mul(y, share.index) ^ c;
            }
            share.value.push(y);
        }
    }
    coefficients.zeroize();
    Ok(out)
}

/// Reconstruct the secret from shares. With fewer than the original threshold the
/// result is garbage, not an error; verify it against a commitment.
pub fn combine(shares: &[RawShare]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let first = shares
        .first()
        .ok_or_else(|| CryptoError::InvalidShare("no shares supplied".into()))?;
    let len = first.len();
    for (i, share) in shares.iter().enumerate() {
        if share.index == 0 {
            return Err(CryptoError::InvalidShare("index 0 is the secret".into()));
        }
        if share.len() != len {
            return Err(CryptoError::InvalidShare("share lengths differ".into()));
        }
        if shares[..i].iter().any(|s| s.index == share.index) {
            return Err(CryptoError::InvalidShare(format!(
                "duplicate share index {}",
                share.index
            )));
        }
    }

    // Lagrange basis at zero: l_i = prod_{j != i} x_j / (x_j - x_i); subtraction is xor.
    let basis: Vec<u8> = shares
        .iter()
        .map(|si| {
            shares
                .iter()
                .filter(|sj| sj.index != si.index)
                .fold(1u8, |acc, sj| {
                    gf_mul(acc, gf_div(sj.index, sj.index ^ si.index))
                })
        })
        .collect();

    let mut secret = Zeroizing::new(vec![0u8; len]);
    for (pos, out) in secret.iter_mut().enumerate() {
        *out = shares
            .iter()
            .zip(basis.iter())
            .fold(0u8, |acc, (share, &l)| acc ^ gf_mul(share.value[pos], l));
    }
    Ok(secret)
}
