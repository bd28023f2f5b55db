//! OAuth 1.0a request signing (HMAC-SHA1) for Twitter and Tumblr.
//!
//! Only query and form-urlencoded parameters take part in the signature.
//! Multipart and JSON bodies are sent unsigned, which is what both APIs expect.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha1::Sha1;
use uuid::Uuid;

type HmacSha1 = Hmac<Sha1>;

/// Everything except the RFC 3986 unreserved characters.
const RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Consumer and token key pairs of one account.
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub consumer_key: &'a str,
    pub consumer_secret: &'a str,
    pub token: &'a str,
    pub token_secret: &'a str,
}

fn encode(s: &str) -> String {
    utf8_percent_encode(s, RESERVED).to_string()
}

/// `Authorization` header value for one request, with a fresh nonce and timestamp.
pub fn authorization(
    method: &str,
    url: &str,
    params: &[(&str, &str)],
    credentials: &Credentials<'_>,
) -> Result<String, InvalidLength> {
    let nonce = Uuid::new_v4().simple().to_string();
    let timestamp = Utc::now().timestamp().to_string();
    authorization_with(method, url, params, credentials, &nonce, &timestamp)
}

pub(crate) fn authorization_with(
    method: &str,
    url: &str,
    params: &[(&str, &str)],
    credentials: &Credentials<'_>,
    nonce: &str,
    timestamp: &str,
) -> Result<String, InvalidLength> {
    let oauth = [
        ("oauth_consumer_key", credentials.consumer_key),
        ("oauth_nonce", nonce),
        ("oauth_signature_method", "HMAC-SHA1"),
        ("oauth_timestamp", timestamp),
        ("oauth_token", credentials.token),
        ("oauth_version", "1.0"),
    ];
    let signed: Vec<(&str, &str)> = params.iter().chain(oauth.iter()).copied().collect();
    let signature = signature(
        method,
        url,
        &signed,
        credentials.consumer_secret,
        credentials.token_secret,
    )?;

    let mut fields: Vec<String> = oauth
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", encode(v)))
        .collect();
    fields.push(format!("oauth_signature=\"{}\"", encode(&signature)));
    fields.sort();
    Ok(format!("OAuth {}", fields.join(", ")))
}

/// Base64 HMAC-SHA1 over the signature base string. `url` must not carry a query.
pub fn signature(
    method: &str,
    url: &str,
    params: &[(&str, &str)],
    consumer_secret: &str,
    token_secret: &str,
) -> Result<String, InvalidLength> {
    let mut pairs: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (encode(k), encode(v)))
        .collect();
    pairs.sort();
    let parameter_string = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let base = format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        encode(url),
        encode(&parameter_string)
    );
    let key = format!("{}&{}", encode(consumer_secret), encode(token_secret));

    let mut mac = HmacSha1::new_from_slice(key.as_bytes())?;
    mac.update(base.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}
