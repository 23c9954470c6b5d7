//! Turns a raw `r || s` signature from the module into an EIP-155 transaction signature.
use crate::agent_error::{AgentError, ErrorKind};
use ethsign_types::{Address, TransactionSignature};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use num_bigint::BigUint;
use num_traits::Zero;
use slog::Logger;
use std::ops::Range;

/// Order of the secp256k1 group.
const SECP256K1_ORDER: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe,
    0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c, 0xd0, 0x36, 0x41, 0x41,
];

/// Recovery bytes tried, bitcoin style: 27 + recovery id, plus the compressed-key offsets.
const RECOVERY_CANDIDATES: Range<u8> = 27..35;

fn curve_order() -> BigUint {
    BigUint::from_bytes_be(&SECP256K1_ORDER)
}

/// Brings `s` into the lower half of the curve order (EIP-2). Values already there are kept.
pub fn normalize_s(s: BigUint) -> BigUint {
    let order = curve_order();
    let half = &order >> 1u32;
    if s > half {
        order - s
    } else {
        s
    }
}

fn to_field_bytes(value: &BigUint) -> Option<[u8; 32]> {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; 32];
    let offset = out.len().checked_sub(bytes.len())?;
    out[offset..].copy_from_slice(&bytes);
    Some(out)
}

/// The first candidate byte whose recovered public key belongs to `from`.
pub fn find_recovery_candidate(
    digest: &[u8],
    r: &BigUint,
    s: &BigUint,
    from: &Address,
    logger: &Logger,
) -> Option<u8> {
    let signature = Signature::from_scalars(to_field_bytes(r)?, to_field_bytes(s)?).ok()?;
    RECOVERY_CANDIDATES.into_iter().find(|candidate| {
        let recovery_id = match RecoveryId::from_byte((candidate - 27) & 3) {
            Some(recovery_id) => recovery_id,
            None => return false,
        };
        let recovered = match VerifyingKey::recover_from_prehash(digest, &signature, recovery_id) {
            Ok(key) => key,
            Err(_) => {
                slog::trace!(logger, "no key recovered"; "candidate" => *candidate);
                return false;
            }
        };
        let address = Address::from_public_key(recovered.to_encoded_point(false).as_bytes());
        slog::debug!(logger, "recovered candidate key"; "candidate" => *candidate, "address" => ?address);
        matches!(address, Ok(address) if address == *from)
    })
}

/// The EIP-155 `v` for a recovery candidate: the candidate itself without a chain id,
/// `candidate - 27 + 35 + 2 * chain_id` otherwise.
pub fn chain_bound_v(candidate: u8, chain_id: &BigUint) -> BigUint {
    if chain_id.is_zero() {
        BigUint::from(candidate)
    } else {
        BigUint::from(candidate.saturating_sub(27)) + 35u32 + chain_id * 2u32
    }
}

/// Splits a raw module signature, normalizes it to low S and binds it to `chain_id`, checking
/// that it recovers to `from`.
pub fn finalize_signature(
    raw: &[u8],
    digest: &[u8],
    from: &Address,
    chain_id: &BigUint,
    logger: &Logger,
) -> Result<TransactionSignature, AgentError> {
    if raw.len() != 64 {
        return Err(AgentError::new(
            ErrorKind::Internal,
            format!("the module returned a {} byte signature", raw.len()),
        ));
    }
    let (r, s) = raw.split_at(32);
    let r = BigUint::from_bytes_be(r);
    let s = normalize_s(BigUint::from_bytes_be(s));

    let candidate = find_recovery_candidate(digest, &r, &s, from, logger).ok_or_else(|| {
        AgentError::new(ErrorKind::Internal, "unable to find EC recovery value")
    })?;

    Ok(TransactionSignature {
        v: chain_bound_v(candidate, chain_id),
        r,
        s,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::discard_logger;
    use k256::ecdsa::signature::hazmat::PrehashSigner;
    use k256::ecdsa::SigningKey;

    fn test_key() -> SigningKey {
        let bytes =
            hex::decode("10009c4e2421b90f6488b8dd2f1e8d1b611c43b8b76924fe3f4b22f81dd0a266")
                .unwrap();
        SigningKey::from_slice(&bytes).unwrap()
    }

    fn test_address() -> Address {
        "0xa2c16184fA76cD6D16685900292683dF905e4Bf2".parse().unwrap()
    }

    #[test]
    fn low_s_normalization() {
        let order = curve_order();
        let half: BigUint = &order >> 1;
        assert_eq!(normalize_s(&order - 1u32), BigUint::from(1u32));
        assert_eq!(normalize_s(half.clone()), half);
        assert_eq!(normalize_s(&half + 1u32), half);
        assert_eq!(normalize_s(BigUint::from(7u32)), BigUint::from(7u32));

        let high = &order - 12345u32;
        let once = normalize_s(high);
        assert_eq!(once, BigUint::from(12345u32));
        assert_eq!(normalize_s(once.clone()), once);
    }

    #[test]
    fn order_matches_the_curve() {
        let minus_one = BigUint::from_bytes_be(&(-k256::Scalar::ONE).to_bytes());
        assert_eq!(minus_one + 1u32, curve_order());
    }

    #[test]
    fn eip155_v() {
        let chain_id = BigUint::from(0xAF2Cu32);
        assert_eq!(chain_bound_v(27, &chain_id), BigUint::from(89723u32));
        assert_eq!(chain_bound_v(28, &chain_id), BigUint::from(89724u32));
        assert_eq!(chain_bound_v(27, &BigUint::from(1u32)), BigUint::from(37u32));
        assert_eq!(chain_bound_v(28, &BigUint::zero()), BigUint::from(28u32));
    }

    #[test]
    fn recovers_the_signer() {
        let digest = ethsign_types::keccak256(b"transfer");
        let signature: Signature = test_key().sign_prehash(&digest).unwrap();
        let raw = signature.to_bytes();
        let signature = finalize_signature(
            &raw,
            &digest,
            &test_address(),
            &BigUint::zero(),
            &discard_logger(),
        )
        .unwrap();
        assert_eq!(signature.r, BigUint::from_bytes_be(&raw[..32]));

        let candidate = u8::try_from(&signature.v).unwrap();
        assert!(candidate == 27 || candidate == 28);
        let recovered = VerifyingKey::recover_from_prehash(
            &digest,
            &Signature::from_scalars(
                to_field_bytes(&signature.r).unwrap(),
                to_field_bytes(&signature.s).unwrap(),
            )
            .unwrap(),
            RecoveryId::from_byte(candidate - 27).unwrap(),
        )
        .unwrap();
        assert_eq!(&recovered, test_key().verifying_key());
    }

    #[test]
    fn normalizes_high_s_before_recovery() {
        let digest = ethsign_types::keccak256(b"transfer");
        let signature: Signature = test_key().sign_prehash(&digest).unwrap();
        let low = finalize_signature(
            &signature.to_bytes(),
            &digest,
            &test_address(),
            &BigUint::from(1u32),
            &discard_logger(),
        )
        .unwrap();

        let s = BigUint::from_bytes_be(&signature.to_bytes()[32..]);
        let mut high = signature.to_bytes()[..32].to_vec();
        high.extend_from_slice(&to_field_bytes(&(curve_order() - s)).unwrap());
        let normalized = finalize_signature(
            &high,
            &digest,
            &test_address(),
            &BigUint::from(1u32),
            &discard_logger(),
        )
        .unwrap();
        assert_eq!(normalized, low);
    }

    #[test]
    fn foreign_signature_is_internal_error() {
        let digest = ethsign_types::keccak256(b"transfer");
        let other = SigningKey::from_slice(&[7; 32]).unwrap();
        let signature: Signature = other.sign_prehash(&digest).unwrap();
        let err = finalize_signature(
            &signature.to_bytes(),
            &digest,
            &test_address(),
            &BigUint::from(1u32),
            &discard_logger(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.message(), "unable to find EC recovery value");
    }

    #[test]
    fn malformed_signatures() {
        let digest = ethsign_types::keccak256(b"transfer");
        let err = finalize_signature(
            &[1; 63],
            &digest,
            &test_address(),
            &BigUint::zero(),
            &discard_logger(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);

        // r = 0 is not a signature at all.
        let err = finalize_signature(
            &[0; 64],
            &digest,
            &test_address(),
            &BigUint::zero(),
            &discard_logger(),
        )
        .unwrap_err();
        assert_eq!(err.message(), "unable to find EC recovery value");
    }
}
