//! Group key material for threshold BLS signatures.
//!
//! Keys live on BLS12-381 with public keys in G1 and signatures in G2
//! (`blst::min_pk`). A dealer splits the group secret with a polynomial of
//! degree `t - 1`; the member at position `i - 1` in a group holds the
//! evaluation at `x = i`. Any `t` partial signatures over the same message
//! interpolate at `x = 0` to the signature of the group secret, which
//! verifies against the group public key.

use blst::min_pk;
use blst::BLST_ERROR;
use rand::RngCore;
use serde::{Serialize, Deserialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::hash::Hash;

use field::{Point, Scalar};

pub const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("malformed key or signature: {0:?}")]
    Blst(BLST_ERROR),
    #[error("share id must be non-zero")]
    ZeroId,
    #[error("duplicate share id {0}")]
    DuplicateId(u64),
    #[error("no shares to recover from")]
    NoShares,
    #[error("threshold {threshold} is not in 1..={size}")]
    BadThreshold { threshold: usize, size: usize },
}

/// Serialized group (or member share) public key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(pub Vec<u8>);

impl PublicKey {
    pub fn get(&self) -> Result<min_pk::PublicKey, Error> {
        min_pk::PublicKey::from_bytes(&self.0).map_err(Error::Blst)
    }

    pub fn verify(&self, msg: &Hash, sig: &[u8]) -> bool {
        let pk = match self.get() {
            Ok(pk) => pk,
            Err(_) => return false
        };
        let sig = match min_pk::Signature::from_bytes(sig) {
            Ok(sig) => sig,
            Err(_) => return false
        };
        sig.verify(true, msg.as_bytes(), DST, &[], &pk, true) == BLST_ERROR::BLST_SUCCESS
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..self.0.len().min(4)]))
    }
}

/// One member's share of a group secret.
#[derive(Clone)]
pub struct SecretShare {
    pub id: u64,
    sk: min_pk::SecretKey
}

impl SecretShare {
    pub fn from_bytes(id: u64, bytes: &[u8]) -> Result<Self, Error> {
        if id == 0 {
            return Err(Error::ZeroId);
        }
        let sk = min_pk::SecretKey::from_bytes(bytes).map_err(Error::Blst)?;
        Ok(Self { id, sk })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.sk.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.sk.sk_to_pk().to_bytes().to_vec())
    }

    pub fn sign(&self, msg: &Hash) -> Vec<u8> {
        self.sk.sign(msg.as_bytes(), DST, &[]).to_bytes().to_vec()
    }
}

impl fmt::Debug for SecretShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretShare").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Splits a fresh group secret into `size` shares, any `threshold` of
/// which can sign for the group.
pub fn deal<R: RngCore>(rng: &mut R, size: usize, threshold: usize) -> Result<(PublicKey, Vec<SecretShare>), Error> {
    if threshold == 0 || threshold > size {
        return Err(Error::BadThreshold { threshold, size });
    }
    let mut coeffs = Vec::with_capacity(threshold);
    let mut ikm = [0u8; 32];
    for _ in 0..threshold {
        rng.fill_bytes(&mut ikm);
        let sk = min_pk::SecretKey::key_gen(&ikm, &[]).map_err(Error::Blst)?;
        coeffs.push(Scalar::from_secret_key(&sk));
    }
    let group = PublicKey(coeffs[0].to_secret_key().map_err(Error::Blst)?.sk_to_pk().to_bytes().to_vec());
    let mut shares = Vec::with_capacity(size);
    for id in 1..=size as u64 {
        let x = Scalar::from_u64(id);
        let mut acc = coeffs[threshold - 1].clone();
        for coeff in coeffs[..threshold - 1].iter().rev() {
            acc = &(&acc * &x) + coeff;
        }
        shares.push(SecretShare { id, sk: acc.to_secret_key().map_err(Error::Blst)? });
    }
    Ok((group, shares))
}

/// Interpolates partial signatures `(id, sig)` into the group signature.
///
/// The caller passes exactly the shares to combine; with fewer than the
/// dealing threshold the result is simply not a valid group signature.
pub fn recover(shares: &[(u64, &[u8])]) -> Result<Vec<u8>, Error> {
    if shares.is_empty() {
        return Err(Error::NoShares);
    }
    let mut seen = BTreeSet::new();
    for (id, _) in shares {
        if *id == 0 {
            return Err(Error::ZeroId);
        }
        if !seen.insert(*id) {
            return Err(Error::DuplicateId(*id));
        }
    }
    let xs: Vec<Scalar> = shares.iter().map(|(id, _)| Scalar::from_u64(*id)).collect();
    let mut acc: Option<Point> = None;
    for (i, (_, sig)) in shares.iter().enumerate() {
        let lambda = lagrange_at_zero(&xs, i);
        let term = &Point::from_bytes(sig).map_err(Error::Blst)? * &lambda;
        acc = Some(match acc {
            None => term,
            Some(sum) => &sum + &term
        });
    }
    let sum = acc.ok_or(Error::NoShares)?;
    Ok(sum.to_bytes().to_vec())
}

// prod_{j != i} x_j / (x_j - x_i)
fn lagrange_at_zero(xs: &[Scalar], i: usize) -> Scalar {
    let mut num = Scalar::from_u64(1);
    let mut den = Scalar::from_u64(1);
    for (j, xj) in xs.iter().enumerate() {
        if j == i {
            continue;
        }
        num = &num * xj;
        den = &den * &(xj - &xs[i]);
    }
    &num * &den.inverse()
}

/// Scalar field and G2 arithmetic on blst's raw bindings. This is the only
/// module allowed to use `unsafe`; every call writes into a default
/// initialized value or a fixed-size buffer it owns.
#[allow(unsafe_code)]
mod field {
    use blst::{blst_fr, blst_p2, blst_p2_affine, blst_scalar, min_pk, BLST_ERROR};
    use std::ops::{Add, Mul, Sub};

    const SIG_LEN: usize = 96;

    /// Element of the BLS12-381 scalar field.
    #[derive(Clone)]
    pub struct Scalar(blst_fr);

    impl Scalar {
        pub fn from_u64(x: u64) -> Self {
            let limbs = [x, 0, 0, 0];
            let mut out = blst_fr::default();
            unsafe { blst::blst_fr_from_uint64(&mut out, limbs.as_ptr()) };
            Scalar(out)
        }

        pub fn from_secret_key(sk: &min_pk::SecretKey) -> Self {
            let bytes = sk.to_bytes();
            let mut scalar = blst_scalar::default();
            let mut out = blst_fr::default();
            unsafe {
                blst::blst_scalar_from_bendian(&mut scalar, bytes.as_ptr());
                blst::blst_fr_from_scalar(&mut out, &scalar);
            }
            Scalar(out)
        }

        pub fn to_secret_key(&self) -> Result<min_pk::SecretKey, BLST_ERROR> {
            min_pk::SecretKey::from_bytes(&self.to_bendian())
        }

        /// Zero maps to zero.
        pub fn inverse(&self) -> Self {
            let mut out = blst_fr::default();
            unsafe { blst::blst_fr_inverse(&mut out, &self.0) };
            Scalar(out)
        }

        fn to_blst_scalar(&self) -> blst_scalar {
            let mut out = blst_scalar::default();
            unsafe { blst::blst_scalar_from_fr(&mut out, &self.0) };
            out
        }

        fn to_bendian(&self) -> [u8; 32] {
            let scalar = self.to_blst_scalar();
            let mut out = [0u8; 32];
            unsafe { blst::blst_bendian_from_scalar(out.as_mut_ptr(), &scalar) };
            out
        }
    }

    impl<'a> Add<&'a Scalar> for &'a Scalar {
        type Output = Scalar;

        fn add(self, rhs: &'a Scalar) -> Scalar {
            let mut out = blst_fr::default();
            unsafe { blst::blst_fr_add(&mut out, &self.0, &rhs.0) };
            Scalar(out)
        }
    }

    impl<'a> Sub<&'a Scalar> for &'a Scalar {
        type Output = Scalar;

        fn sub(self, rhs: &'a Scalar) -> Scalar {
            let mut out = blst_fr::default();
            unsafe { blst::blst_fr_sub(&mut out, &self.0, &rhs.0) };
            Scalar(out)
        }
    }

    impl<'a> Mul<&'a Scalar> for &'a Scalar {
        type Output = Scalar;

        fn mul(self, rhs: &'a Scalar) -> Scalar {
            let mut out = blst_fr::default();
            unsafe { blst::blst_fr_mul(&mut out, &self.0, &rhs.0) };
            Scalar(out)
        }
    }

    /// Point of G2, where signatures live.
    #[derive(Clone)]
    pub struct Point(blst_p2);

    impl Point {
        /// Decodes a compressed signature, rejecting points outside G2.
        pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLST_ERROR> {
            if bytes.len() != SIG_LEN {
                return Err(BLST_ERROR::BLST_BAD_ENCODING);
            }
            let mut affine = blst_p2_affine::default();
            let mut out = blst_p2::default();
            unsafe {
                let err = blst::blst_p2_uncompress(&mut affine, bytes.as_ptr());
                if err != BLST_ERROR::BLST_SUCCESS {
                    return Err(err);
                }
                if !blst::blst_p2_affine_in_g2(&affine) {
                    return Err(BLST_ERROR::BLST_POINT_NOT_IN_GROUP);
                }
                blst::blst_p2_from_affine(&mut out, &affine);
            }
            Ok(Point(out))
        }

        pub fn to_bytes(&self) -> [u8; SIG_LEN] {
            let mut out = [0u8; SIG_LEN];
            unsafe { blst::blst_p2_compress(out.as_mut_ptr(), &self.0) };
            out
        }
    }

    impl<'a> Add<&'a Point> for &'a Point {
        type Output = Point;

        fn add(self, rhs: &'a Point) -> Point {
            let mut out = blst_p2::default();
            unsafe { blst::blst_p2_add_or_double(&mut out, &self.0, &rhs.0) };
            Point(out)
        }
    }

    impl<'a> Mul<&'a Scalar> for &'a Point {
        type Output = Point;

        fn mul(self, k: &'a Scalar) -> Point {
            let scalar = k.to_blst_scalar();
            let mut out = blst_p2::default();
            unsafe { blst::blst_p2_mult(&mut out, &self.0, scalar.b.as_ptr(), 255) };
            Point(out)
        }
    }

}
