//! Prepare -> digest -> sign -> (timestamp) -> embed.
//!
//! [`sign_document`] runs the PDF-level steps over bytes in memory.
//! [`SigningPipeline`] wraps them with the collaborators: it reads the
//! document from the file store, resolves the backend from the request's key
//! reference, writes the output to a distinct path and builds the
//! [`SignatureRecord`]. Success records are persisted by the caller once it
//! has committed whatever state change the signature belongs to; failure
//! records are persisted immediately.

use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{
    BackendResolver, DefaultBackendResolver, SignContext, SignedDigest, SigningBackend,
};
use crate::config::{EngineConfig, TsaConfig};
use crate::error::{Error, Result};
use crate::signatures::{
    digest_byte_range, CertificateSummary, DigestAlgorithm, DocumentDigest, DocumentId,
    PlaceholderOptions, PlaceholderPreparer, SignatureEmbedder, SignatureProvenance,
    SignatureVerifier, SignedCms, SigningRequest, TsaClient, VerificationReport,
};
use crate::store::{DocumentStore, SignatureRecordStore};
use crate::workflow::WorkflowId;

/// Outcome of a signing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Signed output was produced
    Success,
    /// Signing failed; `error` holds the detail
    Failed,
}

/// Persisted result of one signing attempt. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRecord {
    /// Record id
    pub id: Uuid,
    /// Signed document
    pub document_id: DocumentId,
    /// Workflow the signature belongs to
    #[serde(default)]
    pub workflow_id: Option<WorkflowId>,
    /// Signer name
    pub signer_identity: String,
    /// Organization the signer acts for
    #[serde(default)]
    pub organization: Option<String>,
    /// Byte-range digest (lowercase hex); empty when signing failed earlier
    pub digest_hex: String,
    /// Digest algorithm
    pub digest_algorithm: DigestAlgorithm,
    /// DER CMS, base64
    #[serde(default)]
    pub cms_base64: Option<String>,
    /// DER certificates, leaf first, base64
    #[serde(default)]
    pub certificate_chain: Vec<String>,
    /// Backend kind
    #[serde(default)]
    pub provenance: Option<SignatureProvenance>,
    /// Outcome
    pub status: RecordStatus,
    /// Where the signed output was written
    #[serde(default)]
    pub signed_path: Option<PathBuf>,
    /// Failure detail
    #[serde(default)]
    pub error: Option<String>,
    /// When the attempt finished
    pub timestamp: DateTime<Utc>,
}

impl SignatureRecord {
    /// Whether this record describes a produced signature.
    pub fn is_success(&self) -> bool {
        self.status == RecordStatus::Success
    }

    /// Decode the stored chain.
    pub fn certificate_ders(&self) -> Result<Vec<Vec<u8>>> {
        self.certificate_chain
            .iter()
            .map(|b64| {
                BASE64
                    .decode(b64)
                    .map_err(|e| Error::Storage(format!("corrupt certificate in record: {}", e)))
            })
            .collect()
    }

    /// Subject, issuer and validity of each stored certificate.
    pub fn certificate_summaries(&self) -> Result<Vec<CertificateSummary>> {
        self.certificate_ders()?
            .iter()
            .map(|der| CertificateSummary::from_der(der))
            .collect()
    }

    fn failed(
        request: &SigningRequest,
        workflow_id: Option<WorkflowId>,
        digest: Option<&DocumentDigest>,
        err: &Error,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id: request.document_id.clone(),
            workflow_id,
            signer_identity: request.signer.name.clone(),
            organization: request.signer.organization.clone(),
            digest_hex: digest.map(DocumentDigest::hex).unwrap_or_default(),
            digest_algorithm: request.digest_algorithm,
            cms_base64: None,
            certificate_chain: Vec::new(),
            provenance: None,
            status: RecordStatus::Failed,
            signed_path: None,
            error: Some(err.to_string()),
            timestamp: Utc::now(),
        }
    }
}

/// Output of [`sign_document`].
#[derive(Debug, Clone)]
pub struct SignedPdf {
    /// Signed PDF bytes
    pub bytes: Vec<u8>,
    /// Digest that was signed
    pub digest: DocumentDigest,
    /// Backend result, including any attached timestamp
    pub signature: SignedDigest,
    /// Name of the signature field
    pub field_name: String,
    /// Whether an RFC 3161 token was attached
    pub timestamped: bool,
}

/// Sign `pdf` in memory with SHA-256.
pub fn sign_document(
    pdf: &[u8],
    options: &PlaceholderOptions,
    backend: &dyn SigningBackend,
) -> Result<SignedPdf> {
    sign_document_with(pdf, options, DigestAlgorithm::Sha256, backend, None)
}

/// Sign `pdf` in memory, optionally timestamping the signature.
///
/// Only locally built CMS structures are timestamped; HSM blobs are used
/// as returned and mock signatures are never sent to a TSA.
pub fn sign_document_with(
    pdf: &[u8],
    options: &PlaceholderOptions,
    algorithm: DigestAlgorithm,
    backend: &dyn SigningBackend,
    tsa: Option<&TsaClient>,
) -> Result<SignedPdf> {
    sign_prepared(pdf, options, algorithm, backend, tsa, &mut None)
}

fn sign_prepared(
    pdf: &[u8],
    options: &PlaceholderOptions,
    algorithm: DigestAlgorithm,
    backend: &dyn SigningBackend,
    tsa: Option<&TsaClient>,
    digest_out: &mut Option<DocumentDigest>,
) -> Result<SignedPdf> {
    let prepared = PlaceholderPreparer::new(options.clone()).prepare(pdf)?;
    let digest = prepared.digest(algorithm)?;
    *digest_out = Some(digest.clone());
    debug!(
        "Signing {} digest {} with backend {}",
        algorithm,
        digest.hex(),
        backend.name()
    );

    let mut signature = backend.sign(&digest.hex(), &SignContext::new(algorithm, &options.signer))?;
    if signature.cms_der.is_empty() {
        return Err(Error::signing_failed(format!(
            "backend {} returned an empty signature",
            backend.name()
        )));
    }

    let mut timestamped = false;
    if let Some(tsa) = tsa {
        if signature.provenance == SignatureProvenance::LocalKey {
            let cms = SignedCms::from_der(std::mem::take(&mut signature.cms_der));
            signature.cms_der = tsa.timestamp_cms(&cms)?.into_der();
            timestamped = true;
        } else {
            debug!(
                "Skipping timestamp for {:?} signature from {}",
                signature.provenance, signature.backend
            );
        }
    }

    let bytes = SignatureEmbedder::new().embed(&prepared, &signature.cms_der)?;

    // The embedder must not have moved anything the digest covers
    let after = digest_byte_range(&bytes, &prepared.byte_range(), algorithm)?;
    if after.bytes != digest.bytes {
        return Err(Error::DigestMismatch {
            expected: digest.hex(),
            computed: after.hex(),
        });
    }

    Ok(SignedPdf {
        bytes,
        digest,
        signature,
        field_name: prepared.field_name().to_string(),
        timestamped,
    })
}

/// Signed output written to the file store, with its not yet persisted
/// success record.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Success record; insert it with [`SigningPipeline::record_success`]
    pub record: SignatureRecord,
    /// Signed document
    pub pdf: SignedPdf,
}

/// Signing pipeline wired to its collaborators.
pub struct SigningPipeline {
    config: EngineConfig,
    documents: Arc<dyn DocumentStore>,
    records: Arc<dyn SignatureRecordStore>,
    resolver: Arc<dyn BackendResolver>,
    verifier: SignatureVerifier,
}

impl SigningPipeline {
    /// Pipeline resolving backends from `config`.
    pub fn new(
        config: EngineConfig,
        documents: Arc<dyn DocumentStore>,
        records: Arc<dyn SignatureRecordStore>,
    ) -> Result<Self> {
        let resolver = Arc::new(DefaultBackendResolver::new(config.clone())?);
        Self::with_resolver(config, documents, records, resolver)
    }

    /// Pipeline with a custom backend resolver.
    pub fn with_resolver(
        config: EngineConfig,
        documents: Arc<dyn DocumentStore>,
        records: Arc<dyn SignatureRecordStore>,
        resolver: Arc<dyn BackendResolver>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            documents,
            records,
            resolver,
            verifier: SignatureVerifier::new(),
        })
    }

    /// Trust `root_der` when verifying.
    pub fn with_trusted_root(mut self, root_der: Vec<u8>) -> Self {
        self.verifier.add_trusted_root(root_der);
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn placeholder_options(&self, request: &SigningRequest) -> PlaceholderOptions {
        let mut options = PlaceholderOptions::new(request.signer.clone())
            .with_reserved_bytes(
                request
                    .reserved_bytes
                    .unwrap_or(self.config.signing.reserved_bytes),
            )
            .with_field_name_prefix(self.config.signing.field_name_prefix.clone());
        if let Some(appearance) = &request.appearance {
            options = options.with_appearance(appearance.clone());
        }
        options
    }

    fn tsa_client(&self, request: &SigningRequest) -> Result<Option<TsaClient>> {
        let config = match (&request.tsa_url, &self.config.tsa) {
            (Some(url), Some(configured)) if url == &configured.url => configured.clone(),
            (Some(url), Some(configured)) => TsaConfig {
                url: url.clone(),
                timeout_secs: configured.timeout_secs,
                username: None,
                password: None,
            },
            (Some(url), None) => TsaConfig::new(url.clone()),
            (None, Some(configured)) => configured.clone(),
            (None, None) => return Ok(None),
        };
        TsaClient::new(config).map(Some)
    }

    /// Produce signed output without persisting a success record.
    ///
    /// The output is written to a new path; the original is never touched.
    /// Errors are returned as-is together with the digest computed so far.
    fn produce(
        &self,
        request: &SigningRequest,
        workflow_id: Option<WorkflowId>,
        digest: &mut Option<DocumentDigest>,
    ) -> Result<PipelineOutput> {
        let pdf = self.documents.read(&request.document_id)?;
        let backend = self.resolver.resolve(&request.key)?;
        let tsa = self.tsa_client(request)?;
        let options = self.placeholder_options(request);

        let signed = sign_prepared(
            &pdf,
            &options,
            request.digest_algorithm,
            backend.as_ref(),
            tsa.as_ref(),
            digest,
        )?;
        if signed.signature.provenance == SignatureProvenance::Mock {
            warn!(
                "Document {} carries a MOCK signature; it is not legally meaningful",
                request.document_id
            );
        }

        let id = Uuid::new_v4();
        let path = self
            .documents
            .write_signed(&request.document_id, id, &signed.bytes)?;

        let record = SignatureRecord {
            id,
            document_id: request.document_id.clone(),
            workflow_id,
            signer_identity: request.signer.name.clone(),
            organization: request.signer.organization.clone(),
            digest_hex: signed.digest.hex(),
            digest_algorithm: request.digest_algorithm,
            cms_base64: Some(signed.signature.cms_base64()),
            certificate_chain: signed
                .signature
                .certificate_chain
                .iter()
                .map(|der| BASE64.encode(der))
                .collect(),
            provenance: Some(signed.signature.provenance),
            status: RecordStatus::Success,
            signed_path: Some(path),
            error: None,
            timestamp: Utc::now(),
        };
        Ok(PipelineOutput {
            record,
            pdf: signed,
        })
    }

    /// Run the pipeline; failures are persisted as `failed` records and
    /// returned. The success record is not persisted.
    pub fn execute(
        &self,
        request: &SigningRequest,
        workflow_id: Option<WorkflowId>,
    ) -> Result<PipelineOutput> {
        let mut digest = None;
        match self.produce(request, workflow_id, &mut digest) {
            Ok(output) => {
                info!(
                    "Signed document {} ({} bytes, backend {})",
                    request.document_id,
                    output.pdf.bytes.len(),
                    output.pdf.signature.backend
                );
                Ok(output)
            },
            Err(e) => {
                self.record_failure(request, workflow_id, digest.as_ref(), &e)?;
                Err(e)
            },
        }
    }

    /// Persist the success record of `output`.
    pub fn record_success(&self, output: &PipelineOutput) -> Result<SignatureRecord> {
        self.records.insert_signature_record(&output.record)?;
        debug!("Persisted success record {}", output.record.id);
        Ok(output.record.clone())
    }

    /// Persist a `failed` record for `err`.
    pub fn record_failure(
        &self,
        request: &SigningRequest,
        workflow_id: Option<WorkflowId>,
        digest: Option<&DocumentDigest>,
        err: &Error,
    ) -> Result<SignatureRecord> {
        let record = SignatureRecord::failed(request, workflow_id, digest, err);
        error!(
            "Signing document {} failed (record {}): {}",
            request.document_id, record.id, err
        );
        self.records.insert_signature_record(&record)?;
        Ok(record)
    }

    /// Drop output that will not be committed.
    pub fn discard(&self, output: &PipelineOutput) -> Result<()> {
        if let Some(path) = &output.record.signed_path {
            debug!("Discarding uncommitted output {}", path.display());
            self.documents.remove(path)?;
        }
        Ok(())
    }

    /// Sign and persist the success record in one step.
    pub fn run(&self, request: &SigningRequest) -> Result<SignatureRecord> {
        let output = self.execute(request, None)?;
        self.record_success(&output)
    }

    /// Verify `data` against the latest record of `document_id`.
    pub fn verify(&self, document_id: &DocumentId, data: &[u8]) -> Result<VerificationReport> {
        let record = self.records.find_latest_signature_record(document_id)?;
        self.verifier.verify_with_record(data, record.as_ref())
    }

    /// Verify the signed output a record points at.
    pub fn verify_record(&self, record: &SignatureRecord) -> Result<VerificationReport> {
        let path = record.signed_path.as_ref().ok_or_else(|| {
            Error::NotFound(format!("record {} has no signed output", record.id))
        })?;
        let data = std::fs::read(path)?;
        self.verifier.verify_with_record(&data, Some(record))
    }
}

impl std::fmt::Debug for SigningPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
