//! X.509 decoding of certificate objects read from tokens

use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use crate::error::InspectError;
use crate::models::CertificateRecord;

/// Decode a DER certificate read from the token `owner_serial`
pub fn decode(owner_serial: &str, raw: Vec<u8>) -> Result<CertificateRecord, InspectError> {
    let (_, cert) = parse_x509_certificate(&raw).map_err(|e| InspectError::Parse {
        serial: owner_serial.to_string(),
        reason: e.to_string(),
    })?;

    let certificate_id = cert.tbs_certificate.serial.to_string();
    let subject = cert.subject().to_string();
    let issuer = cert.issuer().to_string();
    let algorithm = key_algorithm(&cert).to_string();
    drop(cert);

    Ok(CertificateRecord {
        owner_serial: owner_serial.to_string(),
        certificate_id,
        raw,
        subject,
        issuer,
        algorithm,
    })
}

fn key_algorithm(cert: &X509Certificate<'_>) -> &'static str {
    match cert.public_key().parsed() {
        Ok(PublicKey::RSA(_)) => "RSA",
        Ok(PublicKey::EC(_)) => "ECDSA",
        Ok(PublicKey::DSA(_)) => "DSA",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSA_CERT: &[u8] = include_bytes!("../../tests/fixtures/rsa_token_holder.der");
    const EC_CERT: &[u8] = include_bytes!("../../tests/fixtures/ec_signing_key.der");

    #[test]
    fn test_decodes_rsa_certificate() {
        let record = decode("ABC123", RSA_CERT.to_vec()).unwrap();

        assert_eq!(record.owner_serial, "ABC123");
        assert_eq!(record.certificate_id, "4660");
        assert_eq!(record.algorithm, "RSA");
        assert!(record.subject.contains("CN=Token Holder"));
        assert!(record.issuer.contains("O=Example Org"));
        assert_eq!(record.raw, RSA_CERT);
    }

    #[test]
    fn test_decodes_ec_certificate() {
        let record = decode("ABC123", EC_CERT.to_vec()).unwrap();

        assert_eq!(record.certificate_id, "305419896");
        assert_eq!(record.algorithm, "ECDSA");
        assert!(record.subject.contains("CN=Signing Key"));
    }

    #[test]
    fn test_malformed_der_is_parse_error() {
        let err = decode("ABC123", vec![0x30, 0x03, 0x01]).unwrap_err();
        assert_eq!(err.kind(), "ParseError");
        assert!(err.to_string().contains("ABC123"));
    }
}
