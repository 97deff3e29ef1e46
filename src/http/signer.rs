//! AWS SigV4 request signing
//!
//! Templates targeting AWS endpoints declare `signature: aws`; the signer
//! reads `aws-id` and `aws-secret` from the merged template variables and
//! signs the request in place.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{ErrorClass, ErrorX, Result};
use crate::http::client::RequestSpec;

type HmacSha256 = Hmac<Sha256>;

/// Variable names consumed by the signer and pruned from event meta before
/// emission.
pub const AWS_INTERNAL_VARS: &[&str] = &["aws-id", "aws-secret", "region", "service"];

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_SERVICE: &str = "sts";

/// Signs the request in place with AWS signature v4. Fails `data-missing`
/// when the key variables are absent.
pub fn sign_aws(
    spec: &mut RequestSpec,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let access_key = lookup("aws-id").ok_or_else(|| {
        ErrorX::with_class(ErrorClass::DataMissing, "aws-id variable not provided")
    })?;
    let secret_key = lookup("aws-secret").ok_or_else(|| {
        ErrorX::with_class(ErrorClass::DataMissing, "aws-secret variable not provided")
    })?;
    let region = lookup("region").unwrap_or_else(|| DEFAULT_REGION.to_string());
    let service = lookup("service").unwrap_or_else(|| DEFAULT_SERVICE.to_string());

    let url = Url::parse(&spec.url)?;
    let host = url.host_str().unwrap_or_default().to_string();
    let now = Utc::now();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();

    spec.headers.retain(|(k, _)| {
        !k.eq_ignore_ascii_case("x-amz-date") && !k.eq_ignore_ascii_case("authorization")
    });
    spec.headers.push(("Host".into(), host.clone()));
    spec.headers.push(("X-Amz-Date".into(), amz_date.clone()));

    let payload_hash = hex_sha256(spec.body.as_deref().unwrap_or_default().as_bytes());

    // Canonical request over the signed headers host and x-amz-date.
    let mut path = url.path().to_string();
    if path.is_empty() {
        path.push('/');
    }
    let canonical_query = url.query().unwrap_or_default();
    let canonical_headers = format!("host:{host}\nx-amz-date:{amz_date}\n");
    let signed_headers = "host;x-amz-date";
    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        spec.method, path, canonical_query, canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!("{date_stamp}/{region}/{service}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex::encode_lower(&hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    spec.headers.push((
        "Authorization".into(),
        format!(
            "AWS4-HMAC-SHA256 Credential={access_key}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}"
        ),
    ));
    Ok(())
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode_lower(&hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

mod hex {
    pub fn encode_lower(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn signing_adds_date_and_authorization() {
        let mut vars = HashMap::new();
        vars.insert("aws-id".to_string(), "AKIDEXAMPLE".to_string());
        vars.insert("aws-secret".to_string(), "secret".to_string());

        let mut spec = RequestSpec::get("https://sts.amazonaws.com/?Action=GetCallerIdentity");
        sign_aws(&mut spec, |k| vars.get(k).cloned()).expect("sign");

        assert!(spec.headers.iter().any(|(k, _)| k == "X-Amz-Date"));
        let auth = spec
            .headers
            .iter()
            .find(|(k, _)| k == "Authorization")
            .map(|(_, v)| v.as_str())
            .expect("authorization header");
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    }

    #[test]
    fn missing_keys_fail_data_missing() {
        let mut spec = RequestSpec::get("https://sts.amazonaws.com/");
        let err = sign_aws(&mut spec, |_| None).expect_err("must fail");
        assert!(err.is_class(crate::error::ErrorClass::DataMissing));
    }
}
