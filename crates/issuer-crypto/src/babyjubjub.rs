//! Baby Jubjub curve arithmetic and EdDSA-Poseidon signatures.
//!
//! The curve is the twisted Edwards curve `a·x² + y² = 1 + d·x²·y²` with
//! `a = 168700`, `d = 168696` over the BN254 scalar field. Signatures follow
//! the circomlib `EdDSAPoseidonVerifier`:
//!
//! ```text
//! A  = B8 · s
//! R8 = B8 · r
//! hm = Poseidon(R8.x, R8.y, A.x, A.y, msg)
//! S  = r + 8 · hm · s  (mod l)
//! check: B8 · S == R8 + A · (8 · hm)
//! ```
//!
//! Secret scalars and nonces are derived with SHA-512.

use crate::{poseidon::hash_inputs, CryptoError, Fr, Hash};
use ark_ff::{BigInteger, Field, One, PrimeField, Zero};
use num_bigint::BigUint;
use rand::RngCore;
use sha2::{Digest, Sha512};
use std::str::FromStr;
use std::sync::OnceLock;
use zeroize::Zeroize;

const COEFF_A: u64 = 168_700;
const COEFF_D: u64 = 168_696;

const BASE8_X: &str =
    "5299619240641551281634865583518297030282874472190772894086521144482721001553";
const BASE8_Y: &str =
    "16950150798460657717958625567821834550301663161624707787222815936182638968203";
const SUBORDER: &str =
    "2736030358979909402780800718157159386076813972158567259200215660948447373041";

/// Order of the prime subgroup generated by [`Point::base8`].
pub fn suborder() -> &'static BigUint {
    static SUB: OnceLock<BigUint> = OnceLock::new();
    SUB.get_or_init(|| BigUint::from_str(SUBORDER).unwrap_or_default())
}

fn fr_from_decimal(s: &str) -> Fr {
    Fr::from_str(s).unwrap_or_default()
}

fn fr_to_biguint(fr: &Fr) -> BigUint {
    BigUint::from_bytes_le(&fr.into_bigint().to_bytes_le())
}

/// Whether a coordinate counts as "negative" for point compression.
fn is_negative(c: &Fr) -> bool {
    let half = fr_to_biguint(&-Fr::one()) >> 1u32;
    fr_to_biguint(c) > half
}

/// An affine Baby Jubjub point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub x: Fr,
    pub y: Fr,
}

impl Point {
    pub fn identity() -> Self {
        Self {
            x: Fr::zero(),
            y: Fr::one(),
        }
    }

    /// The generator of the prime subgroup.
    pub fn base8() -> Self {
        Self {
            x: fr_from_decimal(BASE8_X),
            y: fr_from_decimal(BASE8_Y),
        }
    }

    pub fn is_on_curve(&self) -> bool {
        let x2 = self.x.square();
        let y2 = self.y.square();
        Fr::from(COEFF_A) * x2 + y2 == Fr::one() + Fr::from(COEFF_D) * x2 * y2
    }

    /// Complete twisted Edwards addition.
    pub fn add(&self, other: &Point) -> Point {
        let a = Fr::from(COEFF_A);
        let d = Fr::from(COEFF_D);
        let x1x2 = self.x * other.x;
        let y1y2 = self.y * other.y;
        let dxy = d * x1x2 * y1y2;
        // d is a non-square, so neither denominator vanishes on the curve.
        let x_den = (Fr::one() + dxy).inverse().unwrap_or_default();
        let y_den = (Fr::one() - dxy).inverse().unwrap_or_default();
        Point {
            x: (self.x * other.y + self.y * other.x) * x_den,
            y: (y1y2 - a * x1x2) * y_den,
        }
    }

    /// Scalar multiplication by an unsigned little-endian integer.
    pub fn mul(&self, scalar: &BigUint) -> Point {
        let mut acc = Point::identity();
        let mut base = *self;
        for i in 0..scalar.bits() {
            if scalar.bit(i) {
                acc = acc.add(&base);
            }
            base = base.add(&base);
        }
        acc
    }

    pub fn in_subgroup(&self) -> bool {
        self.is_on_curve() && self.mul(suborder()) == Point::identity()
    }

    /// 32-byte compressed form: little-endian `y` with the top bit set when
    /// `x` is negative.
    pub fn compress(&self) -> [u8; 32] {
        let mut out = *Hash::from_fr(&self.y).as_le_bytes();
        if is_negative(&self.x) {
            out[31] |= 0x80;
        }
        out
    }

    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPoint`] when `y` is not canonical or no
    /// `x` satisfies the curve equation.
    pub fn decompress(bytes: &[u8; 32]) -> Result<Point, CryptoError> {
        let mut buf = *bytes;
        let sign = buf[31] & 0x80 != 0;
        buf[31] &= 0x7f;
        let y = Hash::from_le_bytes(buf)
            .map_err(|_| CryptoError::InvalidPoint)?
            .to_fr();

        let y2 = y.square();
        let num = Fr::one() - y2;
        let den = (Fr::from(COEFF_A) - Fr::from(COEFF_D) * y2)
            .inverse()
            .ok_or(CryptoError::InvalidPoint)?;
        let mut x = (num * den).sqrt().ok_or(CryptoError::InvalidPoint)?;
        if is_negative(&x) != sign {
            x = -x;
        }
        let point = Point { x, y };
        if !point.is_on_curve() {
            return Err(CryptoError::InvalidPoint);
        }
        Ok(point)
    }
}

/// A Baby Jubjub private key: 32 random bytes.
#[derive(Clone)]
pub struct PrivateKey([u8; 32]);

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn expanded(&self) -> [u8; 64] {
        let digest = Sha512::digest(self.0);
        let mut out = [0u8; 64];
        out.copy_from_slice(&digest);
        out
    }

    /// The secret scalar `s = prune(H(k)[..32]) >> 3`.
    fn scalar(&self) -> BigUint {
        let mut h = self.expanded();
        let mut low = [0u8; 32];
        low.copy_from_slice(&h[..32]);
        low[0] &= 0xf8;
        low[31] &= 0x7f;
        low[31] |= 0x40;
        let s = BigUint::from_bytes_le(&low) >> 3u32;
        h.zeroize();
        low.zeroize();
        s
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(Point::base8().mul(&self.scalar()))
    }

    /// Signs a field element with EdDSA-Poseidon.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::PoseidonError`] if hashing fails.
    pub fn sign_poseidon(&self, msg: &Fr) -> Result<Signature, CryptoError> {
        let l = suborder();
        let mut h = self.expanded();
        let mut nonce_input = Vec::with_capacity(64);
        nonce_input.extend_from_slice(&h[32..]);
        nonce_input.extend_from_slice(Hash::from_fr(msg).as_le_bytes());
        let r = BigUint::from_bytes_le(&Sha512::digest(&nonce_input)) % l;
        h.zeroize();
        nonce_input.zeroize();

        let r8 = Point::base8().mul(&r);
        let a = self.public();
        let hm = hash_inputs(&[r8.x, r8.y, a.0.x, a.0.y, *msg])?;
        let s = (r + fr_to_biguint(&hm) * 8u32 * self.scalar()) % l;
        Ok(Signature { r8, s })
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// A Baby Jubjub public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub Point);

impl PublicKey {
    pub fn point(&self) -> &Point {
        &self.0
    }

    pub fn compress(&self) -> [u8; 32] {
        self.0.compress()
    }

    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPoint`] if the bytes are not a point of
    /// the prime subgroup.
    pub fn decompress(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let point = Point::decompress(bytes)?;
        if !point.in_subgroup() {
            return Err(CryptoError::InvalidPoint);
        }
        Ok(Self(point))
    }

    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the signature does not
    /// verify, or [`CryptoError::PoseidonError`] if hashing fails.
    pub fn verify_poseidon(&self, msg: &Fr, sig: &Signature) -> Result<(), CryptoError> {
        if &sig.s >= suborder() || !sig.r8.is_on_curve() {
            return Err(CryptoError::InvalidSignature);
        }
        let hm = hash_inputs(&[sig.r8.x, sig.r8.y, self.0.x, self.0.y, *msg])?;
        let left = Point::base8().mul(&sig.s);
        let right = sig.r8.add(&self.0.mul(&(fr_to_biguint(&hm) * 8u32)));
        if left != right {
            return Err(CryptoError::InvalidSignature);
        }
        Ok(())
    }
}

/// An EdDSA-Poseidon signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub r8: Point,
    pub s: BigUint,
}

impl Signature {
    /// 64-byte compressed form: compressed `R8` followed by little-endian `S`.
    pub fn compress(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.r8.compress());
        let s = self.s.to_bytes_le();
        out[32..32 + s.len()].copy_from_slice(&s);
        out
    }

    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the slice is not 64 bytes
    /// or `R8` is not a curve point.
    pub fn decompress(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 64 {
            return Err(CryptoError::InvalidSignature);
        }
        let mut r8 = [0u8; 32];
        r8.copy_from_slice(&bytes[..32]);
        let r8 = Point::decompress(&r8).map_err(|_| CryptoError::InvalidSignature)?;
        let s = BigUint::from_bytes_le(&bytes[32..]);
        if &s >= suborder() {
            return Err(CryptoError::InvalidSignature);
        }
        Ok(Self { r8, s })
    }

    /// `S` as a decimal string, for circuit inputs.
    pub fn s_decimal(&self) -> String {
        self.s.to_string()
    }
}
