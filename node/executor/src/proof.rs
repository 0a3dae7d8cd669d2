//! Proof of task: binds an execution result to a certificate observed at a
//! known time.

use crate::{config::ProofSource, error::ProofError};
use chrono::{DateTime, Utc};
use keeper_common::{crypto::sha256_hex, ProofBundle, ProofData};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{self, pki_types::ServerName, ClientConfig, RootCertStore},
    TlsConnector,
};
use tracing::debug;

/// Host whose TLS certificate anchors proofs.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsProofConfig {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub server_name: String,
}

impl TlsProofConfig {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            port: 443,
            timeout: Duration::from_secs(10),
            server_name: host.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerCertificate {
    pub der: Vec<u8>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
}

/// Certificate chain as seen at `observed_at`, leaf first.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateState {
    pub peer_certificates: Vec<PeerCertificate>,
    pub observed_at: DateTime<Utc>,
}

impl CertificateState {
    pub fn from_der(der: Vec<u8>, observed_at: DateTime<Utc>) -> Self {
        Self {
            peer_certificates: vec![PeerCertificate {
                der,
                not_before: None,
                not_after: None,
            }],
            observed_at,
        }
    }
}

/// Derive the proof for `bundle` from already-observed certificate state.
pub fn generate_proof(bundle: &ProofBundle, state: &CertificateState) -> Result<ProofData, ProofError> {
    let leaf = state
        .peer_certificates
        .first()
        .ok_or(ProofError::NoCertificates)?;
    validate_certificate(leaf, state.observed_at)?;

    let response = bundle.response_bytes()?;
    Ok(ProofData {
        task_id: bundle.trigger_data.task_id,
        proof_of_task: sha256_hex(&response),
        certificate_hash: sha256_hex(&leaf.der),
        certificate_timestamp: state.observed_at,
    })
}

/// Same as [`generate_proof`], with the certificate taken from a live handshake.
pub async fn generate_proof_with_tls(
    bundle: &ProofBundle,
    config: &TlsProofConfig,
) -> Result<ProofData, ProofError> {
    let state = establish_tls_connection(config).await?;
    generate_proof(bundle, &state)
}

/// Certificate state for the configured proof source.
pub async fn certificate_state(source: &ProofSource) -> Result<CertificateState, ProofError> {
    match source {
        ProofSource::Tls(config) => establish_tls_connection(config).await,
        ProofSource::Certificate(der) => Ok(CertificateState::from_der(der.clone(), Utc::now())),
    }
}

fn validate_certificate(cert: &PeerCertificate, at: DateTime<Utc>) -> Result<(), ProofError> {
    if cert.der.is_empty() {
        return Err(ProofError::InvalidCertificate(
            "certificate raw data is empty".into(),
        ));
    }
    if let Some(not_before) = cert.not_before {
        if at < not_before {
            return Err(ProofError::InvalidCertificate(format!(
                "certificate not yet valid (valid from {})",
                not_before
            )));
        }
    }
    if let Some(not_after) = cert.not_after {
        if at > not_after {
            return Err(ProofError::InvalidCertificate(format!(
                "certificate expired at {}",
                not_after
            )));
        }
    }
    Ok(())
}

/// Handshake with the configured host, verifying its chain against the
/// bundled web PKI roots.
pub async fn establish_tls_connection(config: &TlsProofConfig) -> Result<CertificateState, ProofError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let client_config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| ProofError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));

    let server_name = ServerName::try_from(config.server_name.clone())
        .map_err(|e| ProofError::Tls(format!("invalid server name {}: {}", config.server_name, e)))?;

    let handshake = async {
        let tcp = TcpStream::connect((config.host.as_str(), config.port)).await?;
        connector.connect(server_name, tcp).await
    };
    let stream = tokio::time::timeout(config.timeout, handshake)
        .await
        .map_err(|_| {
            ProofError::Tls(format!(
                "handshake with {}:{} timed out after {:?}",
                config.host, config.port, config.timeout
            ))
        })?
        .map_err(|e| ProofError::Tls(format!("{}:{}: {}", config.host, config.port, e)))?;
    let observed_at = Utc::now();

    let (_, session) = stream.get_ref();
    let peer_certificates: Vec<PeerCertificate> = session
        .peer_certificates()
        .unwrap_or_default()
        .iter()
        .map(|cert| PeerCertificate {
            der: cert.as_ref().to_vec(),
            // validity was checked against the handshake time by the verifier
            not_before: None,
            not_after: None,
        })
        .collect();
    if peer_certificates.is_empty() {
        return Err(ProofError::NoCertificates);
    }

    debug!(host = %config.host, chain = peer_certificates.len(), "TLS certificate chain observed");
    Ok(CertificateState {
        peer_certificates,
        observed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use keeper_common::{ActionData, Job, TriggerData};

    fn bundle(task_id: i64) -> Result<ProofBundle> {
        let job: Job = serde_json::from_str(
            r#"{"job_id":3,"task_definition_id":1,"created_at":"2024-05-01T00:00:00Z",
                "target_contract_address":"0x0000000000000000000000000000000000000001",
                "target_function":"setValue"}"#,
        )?;
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut action = ActionData::not_submitted(at);
        action.status = true;
        action.action_tx_hash = format!("0x{}", "ab".repeat(32));
        action.gas_used = "21000".into();
        Ok(ProofBundle::new(job, TriggerData { task_id, timestamp: at }, action))
    }

    fn state() -> CertificateState {
        CertificateState::from_der(vec![0x30, 0x82, 0x01, 0x0a], Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap())
    }

    #[test]
    fn proof_is_deterministic() -> Result<()> {
        let first = generate_proof(&bundle(1)?, &state())?;
        let second = generate_proof(&bundle(1)?, &state())?;
        assert_eq!(first, second);
        assert_eq!(first.proof_of_task.len(), 64);
        assert_eq!(first.certificate_hash, sha256_hex(&[0x30, 0x82, 0x01, 0x0a]));
        assert_eq!(first.certificate_timestamp, state().observed_at);
        Ok(())
    }

    #[test]
    fn task_id_changes_only_the_task_id() -> Result<()> {
        let one = generate_proof(&bundle(1)?, &state())?;
        let two = generate_proof(&bundle(2)?, &state())?;
        assert_eq!(one.task_id, 1);
        assert_eq!(two.task_id, 2);
        assert_eq!(one.proof_of_task, two.proof_of_task);
        assert_eq!(one.certificate_hash, two.certificate_hash);
        assert_eq!(one.certificate_timestamp, two.certificate_timestamp);
        Ok(())
    }

    #[test]
    fn proof_depends_on_action_data() -> Result<()> {
        let original = bundle(1)?;
        let mut changed = original.clone();
        changed.action_data.gas_used = "21001".into();
        assert_ne!(
            generate_proof(&original, &state())?.proof_of_task,
            generate_proof(&changed, &state())?.proof_of_task
        );
        Ok(())
    }

    #[test]
    fn rejects_missing_or_unusable_certificates() -> Result<()> {
        let bundle = bundle(1)?;
        let observed_at = state().observed_at;

        let empty_chain = CertificateState {
            peer_certificates: Vec::new(),
            observed_at,
        };
        assert!(matches!(
            generate_proof(&bundle, &empty_chain),
            Err(ProofError::NoCertificates)
        ));

        let empty_der = CertificateState::from_der(Vec::new(), observed_at);
        assert!(matches!(
            generate_proof(&bundle, &empty_der),
            Err(ProofError::InvalidCertificate(_))
        ));

        let mut expired = state();
        expired.peer_certificates[0].not_after = Some(observed_at - ChronoDuration::days(1));
        assert!(matches!(
            generate_proof(&bundle, &expired),
            Err(ProofError::InvalidCertificate(_))
        ));

        let mut early = state();
        early.peer_certificates[0].not_before = Some(observed_at + ChronoDuration::days(1));
        assert!(matches!(
            generate_proof(&bundle, &early),
            Err(ProofError::InvalidCertificate(_))
        ));
        Ok(())
    }

    #[test]
    fn tls_config_defaults() {
        let config = TlsProofConfig::new("example.com");
        assert_eq!(config.port, 443);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.server_name, "example.com");
    }
}
