/// Signed assertions and certificate bundles
///
/// An assertion is a compact JWS over `{aud, exp}` plus any extra claims,
/// with `exp` in milliseconds since the epoch. A bundle is the certificate
/// chain followed by the assertion, joined with `~`.

use crate::crypto::{KeyPair, PublicKey};
use crate::error::{PtuError, PtuResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use k256::ecdsa::{
    signature::{Signer, Verifier},
    Signature,
};
use serde_json::{json, Map, Value};

fn encode_segment(value: &Value) -> PtuResult<String> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| PtuError::Signing(format!("Failed to serialize assertion: {}", e)))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

fn decode_segment(segment: &str) -> PtuResult<Value> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| PtuError::Signing(format!("Invalid assertion encoding: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| PtuError::Signing(format!("Invalid assertion JSON: {}", e)))
}

/// Sign an assertion for `audience` valid until `expires_at`
///
/// `aud` and `exp` always override same-named entries in `claims`.
pub fn sign_assertion(
    keys: &KeyPair,
    claims: Map<String, Value>,
    audience: &str,
    expires_at: DateTime<Utc>,
) -> PtuResult<String> {
    let header = json!({
        "alg": keys.algorithm().jws_name(),
        "kid": keys.public_key().key_id(),
    });

    let mut payload = claims;
    payload.insert("aud".to_string(), Value::String(audience.to_string()));
    payload.insert("exp".to_string(), json!(expires_at.timestamp_millis()));

    let signing_input = format!(
        "{}.{}",
        encode_segment(&header)?,
        encode_segment(&Value::Object(payload))?
    );
    let signature: Signature = keys.signing_key().sign(signing_input.as_bytes());

    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

/// Check an assertion signature and return its payload
pub fn verify_assertion(assertion: &str, public_key: &PublicKey) -> PtuResult<Value> {
    let mut parts = assertion.split('.');
    let (header, payload, signature) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(h), Some(p), Some(s), None) => (h, p, s),
        _ => {
            return Err(PtuError::Signing(
                "Assertion must have three segments".to_string(),
            ))
        }
    };

    let sig_bytes = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|e| PtuError::Signing(format!("Invalid signature encoding: {}", e)))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| PtuError::Signing(format!("Invalid signature: {}", e)))?;

    public_key
        .verifying_key()?
        .verify(format!("{}.{}", header, payload).as_bytes(), &signature)
        .map_err(|_| PtuError::Signing("Assertion signature does not verify".to_string()))?;

    decode_segment(payload)
}

/// Join a certificate chain and an assertion into one bundle
pub fn bundle(certificates: &[String], assertion: &str) -> String {
    certificates
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(assertion))
        .collect::<Vec<_>>()
        .join("~")
}

/// Split a bundle back into its certificates and assertion
pub fn split_bundle(bundle: &str) -> PtuResult<(Vec<String>, String)> {
    let mut parts: Vec<String> = bundle.split('~').map(str::to_string).collect();
    match parts.pop() {
        Some(assertion) if !assertion.is_empty() => Ok((parts, assertion)),
        _ => Err(PtuError::Signing("Bundle has no assertion".to_string())),
    }
}
