//! Integration tests for the remote HSM backend against a scripted HTTP server.

mod common;

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use common::{fixture, init_logging, simple_pdf, Recorded, Reply, ScriptedServer, SELF_SIGNED_PASSWORD};
use pdf_signflow::backend::{
    GenerateKeyRequest, LocalP12Backend, RemoteHsmBackend, SignContext, SigningBackend,
};
use pdf_signflow::signatures::{
    DigestAlgorithm, DocumentId, KeyReference, SignatureProvenance, SignerMetadata,
    SigningRequest, VerificationStatus,
};
use pdf_signflow::store::{MemoryStore, SignatureRecordStore};
use pdf_signflow::{
    EngineConfig, Environment, Error, HsmConfig, MockPolicy, RecordStatus, SigningPipeline,
};
use serde_json::{json, Value};

const SECRET: &str = "hsm-shared-secret";
const UNREACHABLE: &str = "http://127.0.0.1:1";

/// Scripted HSM that signs with the self-signed test key.
fn signing_hsm() -> ScriptedServer {
    let key = LocalP12Backend::open(fixture("self_signed.p12"), SELF_SIGNED_PASSWORD).unwrap();
    ScriptedServer::start(move |request: &Recorded| match request.path.as_str() {
        "/hsm/status" => Reply::json(200, json!({ "success": true })),
        "/hsm/sign/cms" => {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            let signer = SignerMetadata::new(body["signerInfo"]["name"].as_str().unwrap_or("?"));
            let digest = body["data"].as_str().unwrap_or_default();
            match key.sign(digest, &SignContext::new(DigestAlgorithm::Sha256, &signer)) {
                Ok(signed) => Reply::json(
                    200,
                    json!({ "success": true, "data": { "signature": signed.cms_base64() } }),
                ),
                Err(e) => Reply::json(400, json!({ "success": false, "error": e.to_string() })),
            }
        },
        _ => Reply::not_found(),
    })
}

fn hsm_config(base_url: &str, policy: MockPolicy) -> HsmConfig {
    HsmConfig::new(base_url, SECRET)
        .with_key_id("key-1")
        .with_mock_policy(policy)
        .with_probe_timeout(1)
}

fn pipeline(config: EngineConfig) -> (SigningPipeline, Arc<MemoryStore>, DocumentId) {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let document = DocumentId::new("invoice-17");
    store.put_document(document.clone(), simple_pdf(1)).unwrap();
    let pipeline = SigningPipeline::new(config, store.clone(), store.clone()).unwrap();
    (pipeline, store, document)
}

fn hsm_request(document: &DocumentId) -> SigningRequest {
    SigningRequest::new(
        document.clone(),
        SignerMetadata::new("Hannah Sign").with_reason("Invoice release"),
        KeyReference::Hsm { key_id: None },
    )
    .with_reserved_bytes(16000)
}

fn digest_256() -> String {
    "ab".repeat(32)
}

mod remote_signing_tests {
    use super::*;

    #[test]
    fn test_hsm_signature_verifies() {
        let server = signing_hsm();
        let config = EngineConfig::new().with_hsm(hsm_config(&server.base_url, MockPolicy::Disabled));
        let (pipeline, store, document) = pipeline(config);

        let record = pipeline.run(&hsm_request(&document)).unwrap();
        assert_eq!(record.provenance, Some(SignatureProvenance::Hsm));
        // Chain recovered from the CMS since the HSM returned none
        assert_eq!(record.certificate_chain.len(), 1);

        let bytes = store
            .signed_output(record.signed_path.as_ref().unwrap())
            .unwrap()
            .unwrap();
        let report = pipeline.verify(&document, &bytes).unwrap();
        assert_eq!(report.status, VerificationStatus::Verified);
        assert!(!report.latest().unwrap().mock);

        assert_eq!(server.count("/hsm/status"), 1);
        assert_eq!(server.count("/hsm/sign/cms"), 1);
    }

    #[test]
    fn test_sign_request_shape_and_token() {
        use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

        let server = signing_hsm();
        let backend =
            RemoteHsmBackend::new(hsm_config(&server.base_url, MockPolicy::Disabled), None).unwrap();
        let signer = SignerMetadata::new("Hannah Sign").with_location("Hamburg");
        backend
            .sign(&digest_256(), &SignContext::new(DigestAlgorithm::Sha256, &signer))
            .unwrap();

        let sign = server
            .requests()
            .into_iter()
            .find(|r| r.path == "/hsm/sign/cms")
            .unwrap();
        assert_eq!(sign.method, "POST");
        let body: Value = serde_json::from_slice(&sign.body).unwrap();
        assert_eq!(body["keyId"], "key-1");
        assert_eq!(body["data"], digest_256());
        assert_eq!(body["certificateChain"], json!([]));
        assert_eq!(body["signerInfo"]["name"], "Hannah Sign");
        assert_eq!(body["signerInfo"]["location"], "Hamburg");
        assert_eq!(body["signerInfo"]["algorithm"], "SHA-256");

        let token = sign
            .authorization
            .as_deref()
            .and_then(|h| h.strip_prefix("Bearer "))
            .unwrap();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        let claims = decode::<Value>(token, &DecodingKey::from_secret(SECRET.as_bytes()), &validation)
            .unwrap()
            .claims;
        assert_eq!(claims["scope"], "sign");
        assert!(claims["exp"].as_u64().unwrap() > claims["iat"].as_u64().unwrap());
    }

    #[test]
    fn test_flat_response_accepted() {
        let key = LocalP12Backend::open(fixture("self_signed.p12"), SELF_SIGNED_PASSWORD).unwrap();
        let chain = BASE64.encode(key.credentials().certificate());
        let server = ScriptedServer::start(move |request: &Recorded| match request.path.as_str() {
            "/hsm/status" => Reply::json(200, json!({ "success": true })),
            "/hsm/sign/cms" => {
                let body: Value = serde_json::from_slice(&request.body).unwrap();
                let signer = SignerMetadata::new("flat");
                let signed = key
                    .sign(
                        body["data"].as_str().unwrap(),
                        &SignContext::new(DigestAlgorithm::Sha256, &signer),
                    )
                    .unwrap();
                Reply::json(
                    200,
                    json!({
                        "success": true,
                        "signature": signed.cms_base64(),
                        "certificateChain": [chain.clone()],
                    }),
                )
            },
            _ => Reply::not_found(),
        });

        let backend =
            RemoteHsmBackend::new(hsm_config(&server.base_url, MockPolicy::Disabled), None).unwrap();
        let signer = SignerMetadata::new("Hannah");
        let signed = backend
            .sign(&digest_256(), &SignContext::new(DigestAlgorithm::Sha256, &signer))
            .unwrap();
        assert_eq!(signed.provenance, SignatureProvenance::Hsm);
        assert_eq!(signed.certificate_chain.len(), 1);
    }

    #[test]
    fn test_refusal_is_not_retryable() {
        let server = ScriptedServer::start(|request: &Recorded| match request.path.as_str() {
            "/hsm/status" => Reply::json(200, json!({ "success": true })),
            _ => Reply::json(403, json!({ "success": false, "error": "key disabled" })),
        });
        let backend =
            RemoteHsmBackend::new(hsm_config(&server.base_url, MockPolicy::Disabled), None).unwrap();
        let signer = SignerMetadata::new("Hannah");
        let err = backend
            .sign(&digest_256(), &SignContext::new(DigestAlgorithm::Sha256, &signer))
            .unwrap_err();
        assert!(matches!(err, Error::SigningFailed { transient: false, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_server_error_is_retryable() {
        let server = ScriptedServer::start(|request: &Recorded| match request.path.as_str() {
            "/hsm/status" => Reply::json(200, json!({ "success": true })),
            _ => Reply::json(502, json!({ "success": false, "error": "upstream" })),
        });
        let backend =
            RemoteHsmBackend::new(hsm_config(&server.base_url, MockPolicy::Disabled), None).unwrap();
        let signer = SignerMetadata::new("Hannah");
        let err = backend
            .sign(&digest_256(), &SignContext::new(DigestAlgorithm::Sha256, &signer))
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_wrong_digest_length_never_reaches_hsm() {
        let server = signing_hsm();
        let backend =
            RemoteHsmBackend::new(hsm_config(&server.base_url, MockPolicy::Disabled), None).unwrap();
        let signer = SignerMetadata::new("Hannah");
        assert!(backend
            .sign("abcd", &SignContext::new(DigestAlgorithm::Sha256, &signer))
            .is_err());
        assert!(server.requests().is_empty());
    }
}

mod unavailable_tests {
    use super::*;

    #[test]
    fn test_unreachable_hsm_without_mock() {
        let config = EngineConfig::new().with_hsm(hsm_config(UNREACHABLE, MockPolicy::Disabled));
        let (pipeline, store, document) = pipeline(config);

        let err = pipeline.run(&hsm_request(&document)).unwrap_err();
        assert!(matches!(err, Error::SigningBackendUnavailable(_)));
        assert!(err.is_retryable());

        let records = store.list_signature_records(&document).unwrap();
        assert!(records.iter().all(|r| r.status == RecordStatus::Failed));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].digest_hex.len(), 64);
        assert_eq!(store.output_count().unwrap(), 0);
    }

    #[test]
    fn test_status_probe_failure_without_mock() {
        let server = ScriptedServer::start(|request: &Recorded| match request.path.as_str() {
            "/hsm/status" => Reply::json(200, json!({ "success": false })),
            _ => Reply::not_found(),
        });
        let backend =
            RemoteHsmBackend::new(hsm_config(&server.base_url, MockPolicy::Disabled), None).unwrap();
        assert!(!backend.is_available());

        let signer = SignerMetadata::new("Hannah");
        let err = backend
            .sign(&digest_256(), &SignContext::new(DigestAlgorithm::Sha256, &signer))
            .unwrap_err();
        assert!(matches!(err, Error::SigningBackendUnavailable(_)));
        assert_eq!(server.count("/hsm/sign/cms"), 0);
    }

    #[test]
    fn test_missing_key_id_is_config_error() {
        let config = EngineConfig::new().with_hsm(HsmConfig::new(UNREACHABLE, SECRET));
        let (pipeline, _store, document) = pipeline(config);
        let err = pipeline.run(&hsm_request(&document)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}

#[cfg(feature = "mock-signer")]
mod mock_fallback_tests {
    use super::*;

    #[test]
    fn test_fallback_when_unavailable() {
        let config =
            EngineConfig::new().with_hsm(hsm_config(UNREACHABLE, MockPolicy::OnUnavailable));
        let (pipeline, store, document) = pipeline(config);

        let record = pipeline.run(&hsm_request(&document)).unwrap();
        assert_eq!(record.provenance, Some(SignatureProvenance::Mock));
        assert!(record.certificate_chain.is_empty());

        let bytes = store
            .signed_output(record.signed_path.as_ref().unwrap())
            .unwrap()
            .unwrap();
        let report = pipeline.verify(&document, &bytes).unwrap();
        assert!(report.is_signed);
        assert!(!report.is_valid);
        assert_eq!(report.status, VerificationStatus::SignedUnverifiable);
        assert!(report.latest().unwrap().mock);
    }

    #[test]
    fn test_fallback_on_transient_sign_failure() {
        let server = ScriptedServer::start(|request: &Recorded| match request.path.as_str() {
            "/hsm/status" => Reply::json(200, json!({ "success": true })),
            _ => Reply::json(503, json!({ "success": false })),
        });
        let backend = RemoteHsmBackend::new(
            hsm_config(&server.base_url, MockPolicy::OnUnavailable),
            None,
        )
        .unwrap();
        let signer = SignerMetadata::new("Hannah");
        let signed = backend
            .sign(&digest_256(), &SignContext::new(DigestAlgorithm::Sha256, &signer))
            .unwrap();
        assert_eq!(signed.provenance, SignatureProvenance::Mock);
        assert_eq!(server.count("/hsm/sign/cms"), 1);
    }

    #[test]
    fn test_no_fallback_on_refusal() {
        let server = ScriptedServer::start(|request: &Recorded| match request.path.as_str() {
            "/hsm/status" => Reply::json(200, json!({ "success": true })),
            _ => Reply::json(400, json!({ "success": false, "error": "bad key" })),
        });
        let backend = RemoteHsmBackend::new(
            hsm_config(&server.base_url, MockPolicy::OnUnavailable),
            None,
        )
        .unwrap();
        let signer = SignerMetadata::new("Hannah");
        let err = backend
            .sign(&digest_256(), &SignContext::new(DigestAlgorithm::Sha256, &signer))
            .unwrap_err();
        assert!(matches!(err, Error::SigningFailed { .. }));
    }

    #[test]
    fn test_always_never_contacts_hsm() {
        let server = signing_hsm();
        let backend =
            RemoteHsmBackend::new(hsm_config(&server.base_url, MockPolicy::Always), None).unwrap();
        let signer = SignerMetadata::new("Hannah");
        let first = backend
            .sign(&digest_256(), &SignContext::new(DigestAlgorithm::Sha256, &signer))
            .unwrap();
        let second = backend
            .sign(&digest_256(), &SignContext::new(DigestAlgorithm::Sha256, &signer))
            .unwrap();
        assert_eq!(first.provenance, SignatureProvenance::Mock);
        assert_eq!(first.cms_der, second.cms_der, "mock output is deterministic");
        assert!(server.requests().is_empty());
    }

    #[test]
    fn test_mock_refused_in_production() {
        let config = EngineConfig::new()
            .with_environment(Environment::Production)
            .with_hsm(hsm_config(UNREACHABLE, MockPolicy::Always));
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let store = Arc::new(MemoryStore::new());
        assert!(SigningPipeline::new(config, store.clone(), store).is_err());
    }
}

mod key_management_tests {
    use super::*;

    fn key_server() -> ScriptedServer {
        ScriptedServer::start(|request: &Recorded| match request.path.as_str() {
            "/hsm/keys/generate" => {
                let body: Value = serde_json::from_slice(&request.body).unwrap();
                Reply::json(
                    200,
                    json!({
                        "success": true,
                        "data": {
                            "keyId": format!("generated-{}", body["label"].as_str().unwrap_or("none")),
                            "publicKey": "MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEA",
                        },
                    }),
                )
            },
            "/hsm/keys" => Reply::json(
                200,
                json!({
                    "keys": [
                        { "keyId": "key-1", "algorithm": "RSA-2048", "label": "primary" },
                        { "keyId": "key-2" },
                    ],
                }),
            ),
            _ => Reply::not_found(),
        })
    }

    #[test]
    fn test_generate_key() {
        let server = key_server();
        let backend =
            RemoteHsmBackend::new(hsm_config(&server.base_url, MockPolicy::Disabled), None).unwrap();
        let key = backend.generate_key(&GenerateKeyRequest::rsa_2048("tenant-a")).unwrap();
        assert_eq!(key.key_id, "generated-tenant-a");
        assert!(!key.public_key.is_empty());

        let sent: Value = serde_json::from_slice(&server.requests()[0].body).unwrap();
        assert_eq!(sent["algorithm"], "RSA-2048");
        assert!(server.requests()[0].authorization.is_some());
    }

    #[test]
    fn test_list_keys_bare_payload() {
        let server = key_server();
        let backend =
            RemoteHsmBackend::new(hsm_config(&server.base_url, MockPolicy::Disabled), None).unwrap();
        let keys = backend.list_keys().unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].label.as_deref(), Some("primary"));
        assert_eq!(keys[1].algorithm, None);
        assert_eq!(server.requests()[0].method, "GET");
    }

    #[test]
    fn test_key_management_failure() {
        let server = ScriptedServer::start(|_: &Recorded| {
            Reply::json(200, json!({ "success": false, "error": "quota exceeded" }))
        });
        let backend =
            RemoteHsmBackend::new(hsm_config(&server.base_url, MockPolicy::Disabled), None).unwrap();
        let err = backend.generate_key(&GenerateKeyRequest::rsa_2048("x")).unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }
}
