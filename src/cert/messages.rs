//! Certificate service payloads.
//!
//! PEM blocks travel inside JSON strings, so their newlines are escaped on
//! the wire.  `serde_json` does the escaping in both directions.

use serde::Serialize;
use serde_json::Value;

use crate::error::MalformedError;
use crate::jobs::dispatcher::ROTATION_OPERATIONS;

/// `certName` of the identity this device presents to the broker.
pub const CLIENT_CERT_NAME: &str = "client";

/// Parsed rotation job document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationJob {
    pub operation: String,
    pub cert_name: String,
}

impl RotationJob {
    /// Whether this device can act on the job at all.
    pub fn targets_client_identity(&self) -> bool {
        ROTATION_OPERATIONS.contains(&self.operation.as_str()) && self.cert_name == CLIENT_CERT_NAME
    }
}

fn str_field<'a>(v: &'a Value, field: &'static str) -> Result<&'a str, MalformedError> {
    v.get(field)
        .ok_or(MalformedError::MissingField(field))?
        .as_str()
        .ok_or(MalformedError::InvalidValue(field))
}

pub fn parse_rotation_job(document: &[u8]) -> Result<RotationJob, MalformedError> {
    let root: Value = serde_json::from_slice(document).map_err(|_| MalformedError::InvalidJson)?;
    Ok(RotationJob {
        operation: str_field(&root, "operation")?.to_owned(),
        cert_name: str_field(&root, "certName")?.to_owned(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CsrRequest<'a> {
    certificate_signing_request: &'a str,
}

pub fn csr_request_payload(csr_pem: &str) -> Vec<u8> {
    serde_json::to_vec(&CsrRequest {
        certificate_signing_request: csr_pem,
    })
    .unwrap_or_default()
}

/// Accepted response to a signing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCertificate {
    pub certificate_id: String,
    pub certificate_pem: String,
}

pub fn parse_signed_certificate(payload: &[u8]) -> Result<SignedCertificate, MalformedError> {
    let root: Value = serde_json::from_slice(payload).map_err(|_| MalformedError::InvalidJson)?;
    let cert = SignedCertificate {
        certificate_id: str_field(&root, "certificateId")?.to_owned(),
        certificate_pem: str_field(&root, "certificatePem")?.to_owned(),
    };
    if cert.certificate_id.is_empty() {
        return Err(MalformedError::InvalidValue("certificateId"));
    }
    if !cert.certificate_pem.contains("-----BEGIN CERTIFICATE-----") {
        return Err(MalformedError::InvalidValue("certificatePem"));
    }
    Ok(cert)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RevokeRequest<'a> {
    certificate_id: &'a str,
}

pub fn revoke_payload(certificate_id: &str) -> Vec<u8> {
    serde_json::to_vec(&RevokeRequest { certificate_id }).unwrap_or_default()
}

/// Certificate issued by fleet provisioning, with the token that binds it
/// to the registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedCertificate {
    pub certificate: SignedCertificate,
    pub ownership_token: String,
}

pub fn parse_created_certificate(payload: &[u8]) -> Result<CreatedCertificate, MalformedError> {
    let certificate = parse_signed_certificate(payload)?;
    let root: Value = serde_json::from_slice(payload).map_err(|_| MalformedError::InvalidJson)?;
    let ownership_token = str_field(&root, "certificateOwnershipToken")?.to_owned();
    if ownership_token.is_empty() {
        return Err(MalformedError::InvalidValue("certificateOwnershipToken"));
    }
    Ok(CreatedCertificate {
        certificate,
        ownership_token,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterParameters<'a> {
    mac_address: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterThing<'a> {
    certificate_ownership_token: &'a str,
    parameters: RegisterParameters<'a>,
}

pub fn register_thing_payload(ownership_token: &str, mac_address: &str) -> Vec<u8> {
    serde_json::to_vec(&RegisterThing {
        certificate_ownership_token: ownership_token,
        parameters: RegisterParameters { mac_address },
    })
    .unwrap_or_default()
}

/// Thing name assigned by the provisioning template.
pub fn parse_registered_thing(payload: &[u8]) -> Result<String, MalformedError> {
    let root: Value = serde_json::from_slice(payload).map_err(|_| MalformedError::InvalidJson)?;
    let name = str_field(&root, "thingName")?;
    if name.is_empty() {
        return Err(MalformedError::InvalidValue("thingName"));
    }
    Ok(name.to_owned())
}

/// One-line summary of a service rejection, for the log.
pub fn rejection_summary(payload: &[u8]) -> String {
    let Ok(root) = serde_json::from_slice::<Value>(payload) else {
        return format!("<{} bytes, not JSON>", payload.len());
    };
    let code = root.get("errorCode").and_then(Value::as_str).unwrap_or("?");
    let message = root.get("errorMessage").and_then(Value::as_str).unwrap_or("");
    format!("{code}: {message}")
}
