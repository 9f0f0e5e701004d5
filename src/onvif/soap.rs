//! SOAP envelope and WS-UsernameToken construction: digest is SHA1 over nonce || created ||
//! password, base64-encoded, wrapped around an arbitrary SOAP body so probe.rs can reuse it
//! for every ONVIF call.

use base64::prelude::*;
use chrono::Utc;
use sha1::{Digest, Sha1};

/// WS-UsernameToken password digest per the WS-Security UsernameToken profile:
/// `Base64(SHA1(nonce + created + password))`.
fn security_header(user: &str, password: &str) -> String {
    let nonce_raw: [u8; 16] = rand::random();
    let nonce = BASE64_STANDARD.encode(nonce_raw);
    let created = Utc::now().format("%Y-%m-%dT%H:%M:%S.000Z").to_string();

    let mut hasher = Sha1::new();
    hasher.update(nonce_raw);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    let digest = BASE64_STANDARD.encode(hasher.finalize());

    format!(
        r#"<wsse:Security xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd" xmlns:wsu="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd">
  <wsse:UsernameToken wsu:Id="UsernameToken-1">
    <wsse:Username>{user}</wsse:Username>
    <wsse:Password Type="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest">{digest}</wsse:Password>
    <wsse:Nonce EncodingType="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary">{nonce}</wsse:Nonce>
    <wsu:Created>{created}</wsu:Created>
  </wsse:UsernameToken>
</wsse:Security>"#
    )
}

/// Wrap `body` in a SOAP 1.2 envelope. The security header is omitted for an empty
/// username, treating `("", "")` as a genuinely anonymous call rather than sending an
/// empty-credential WS-Security block.
pub fn envelope(user: &str, password: &str, body: &str) -> String {
    let header = if user.is_empty() {
        String::new()
    } else {
        format!("<Header>{}</Header>", security_header(user, password))
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope xmlns="http://www.w3.org/2003/05/soap-envelope">{header}<Body>{body}</Body></Envelope>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_envelope_has_no_security_header() {
        let env = envelope("", "", "<GetHostname xmlns=\"http://www.onvif.org/ver10/device/wsdl\"/>");
        assert!(!env.contains("wsse:Security"));
    }

    #[test]
    fn credentialed_envelope_carries_digest() {
        let env = envelope("admin", "admin", "<GetHostname/>");
        assert!(env.contains("wsse:UsernameToken"));
        assert!(env.contains("PasswordDigest"));
    }
}
