pub mod combined;
pub mod oidc;

use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::AlgorithmParameters;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("no key matches the token header")]
    UnknownKey,
    #[error("token validation failed: {0}")]
    Validation(#[from] jsonwebtoken::errors::Error),
    #[error("token claim mismatch: {0}")]
    ClaimMismatch(&'static str),
    #[error("key material is invalid: {0}")]
    KeyMaterial(String),
    #[error("key set fetch failed: {0}")]
    Fetch(String),
}

pub(crate) fn decoding_key_for_algorithm(
    alg: &AlgorithmParameters,
) -> Result<DecodingKey, TokenError> {
    let key = match alg {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e),
        AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y),
        AlgorithmParameters::OctetKeyPair(octet) => DecodingKey::from_ed_components(&octet.x),
        _ => return Err(TokenError::UnknownKey),
    };
    key.map_err(TokenError::Validation)
}
