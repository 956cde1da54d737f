use crate::{CryptoError, Fr, Hash};
use ark_ff::{PrimeField, Zero};
use light_poseidon::{Poseidon, PoseidonHasher};

/// Field elements absorbed per sponge round in [`hash_bytes`].
const BYTES_FRAME: usize = 6;

/// Bytes packed into one field element by [`hash_bytes`].
const BYTES_PER_ELEMENT: usize = 31;

/// Hashes a slice of field elements using Poseidon with BN254 parameters compatible with Circom.
///
/// # Errors
///
/// Returns [`CryptoError::PoseidonError`] if the number of inputs is not supported
/// or if the hashing fails.
pub fn hash_inputs(inputs: &[Fr]) -> Result<Fr, CryptoError> {
    let mut poseidon = Poseidon::<Fr>::new_circom(inputs.len())
        .map_err(|e| CryptoError::PoseidonError(format!("Failed to initialize Poseidon: {:?}", e)))?;

    poseidon
        .hash(inputs)
        .map_err(|e| CryptoError::PoseidonError(format!("Poseidon hash failed: {:?}", e)))
}

/// Poseidon over [`Hash`] values.
///
/// # Errors
///
/// See [`hash_inputs`].
pub fn hash(inputs: &[Hash]) -> Result<Hash, CryptoError> {
    let frs: Vec<Fr> = inputs.iter().map(Hash::to_fr).collect();
    hash_inputs(&frs).map(Hash::from)
}

/// Hashes an arbitrary byte string.
///
/// The bytes are cut into 31-byte little-endian chunks which are absorbed
/// in frames of six elements; the first slot of each following frame
/// carries the previous frame's digest.
///
/// # Errors
///
/// See [`hash_inputs`].
pub fn hash_bytes(bytes: &[u8]) -> Result<Fr, CryptoError> {
    let mut frame = vec![Fr::zero(); BYTES_FRAME];
    let mut k = 0;
    let mut dirty = false;
    let mut digest = Fr::zero();

    let mut chunks = bytes.chunks(BYTES_PER_ELEMENT).peekable();
    while let Some(chunk) = chunks.next() {
        frame[k] = Fr::from_le_bytes_mod_order(chunk);
        dirty = true;
        if k == BYTES_FRAME - 1 && chunks.peek().is_some() {
            digest = hash_inputs(&frame)?;
            frame = vec![Fr::zero(); BYTES_FRAME];
            frame[0] = digest;
            k = 1;
            dirty = false;
        } else {
            k += 1;
        }
    }

    if dirty || bytes.is_empty() {
        digest = hash_inputs(&frame)?;
    }
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poseidon_hash_deterministic() {
        let input = vec![Fr::from(1), Fr::from(2)];
        let hash1 = hash_inputs(&input).expect("hashing should succeed");
        let hash2 = hash_inputs(&input).expect("hashing should succeed");
        assert_eq!(hash1, hash2);
    }

    #[test]
    fn circom_vector_for_two_inputs() {
        // poseidon([1, 2]) from circomlibjs.
        let expected = Hash::from_decimal(
            "7853200120776062878684798364095072458815029376092732009249414926327459813530",
        )
        .expect("vector is canonical");
        let out = hash(&[Hash::from_u64(1), Hash::from_u64(2)]).expect("hashing should succeed");
        assert_eq!(out, expected);
    }

    #[test]
    fn supports_state_and_claim_arities() {
        for n in 1..=6 {
            let inputs: Vec<Fr> = (0..n).map(|i| Fr::from(i as u64)).collect();
            assert!(hash_inputs(&inputs).is_ok(), "arity {n} should be supported");
        }
    }

    #[test]
    fn hash_bytes_spans_frames() {
        let short = hash_bytes(b"KYCAgeCredential").expect("hashing should succeed");
        let again = hash_bytes(b"KYCAgeCredential").expect("hashing should succeed");
        assert_eq!(short, again);

        let long = vec![7u8; BYTES_PER_ELEMENT * BYTES_FRAME * 2 + 5];
        let a = hash_bytes(&long).expect("hashing should succeed");
        let mut other = long.clone();
        other[long.len() - 1] = 8;
        let b = hash_bytes(&other).expect("hashing should succeed");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_bytes_of_empty_input_is_defined() {
        assert!(hash_bytes(&[]).is_ok());
    }
}
