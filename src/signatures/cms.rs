//! CMS/PKCS#7 SignedData construction and parsing.
//!
//! The builder produces a PAdES-style SignedData with these signed attributes:
//! - content-type (id-data)
//! - signing-time
//! - message-digest
//! - signing-certificate-v2 (ESS, binds the leaf certificate hash)
//!
//! An RFC 3161 timestamp token can be attached afterwards as the unsigned
//! attribute id-aa-timeStampToken.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Datelike, Utc};
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedData, SignerIdentifier, SignerInfo,
    SignerInfos,
};
use der::asn1::{GeneralizedTime, Null, ObjectIdentifier, OctetString, SetOfVec, UtcTime};
use der::{Any, Decode, Encode, Sequence, SliceReader};
use rsa::RsaPrivateKey;
use spki::AlgorithmIdentifierOwned;
use x509_cert::attr::Attribute;
use x509_cert::ext::pkix::SubjectKeyIdentifier;
use x509_cert::Certificate;

use super::types::DigestAlgorithm;
use crate::error::{Error, Result};

/// id-data
pub const OID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
/// id-signedData
pub const OID_SIGNED_DATA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
/// id-contentType
pub const OID_CONTENT_TYPE: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.3");
/// id-messageDigest
pub const OID_MESSAGE_DIGEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");
/// id-signingTime
pub const OID_SIGNING_TIME: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.5");
/// id-aa-signingCertificateV2
pub const OID_SIGNING_CERTIFICATE_V2: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.2.47");
/// id-aa-timeStampToken
pub const OID_TIMESTAMP_TOKEN: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.2.14");
/// rsaEncryption
pub const OID_RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
/// hmacWithSHA256, used only by the development mock signer
pub const OID_HMAC_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.2.9");

/// What the SignedData carries as content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CmsProfile {
    /// No encapsulated content; messageDigest is the byte-range digest.
    #[default]
    Detached,
    /// Encapsulated content is the byte-range digest itself and
    /// messageDigest is the hash of that digest.
    DigestAsContent,
}

/// Produces the signature value over the DER-encoded signed attributes.
pub trait RawSigner {
    /// AlgorithmIdentifier written into `SignerInfo.signatureAlgorithm`.
    fn signature_algorithm(&self) -> Result<AlgorithmIdentifierOwned>;

    /// Sign `message`, hashing it with `digest` first where applicable.
    fn sign_raw(&self, digest: DigestAlgorithm, message: &[u8]) -> Result<Vec<u8>>;
}

/// RSA PKCS#1 v1.5 signer.
pub struct RsaSigner {
    key: RsaPrivateKey,
}

impl RsaSigner {
    /// Wrap a private key.
    pub fn new(key: RsaPrivateKey) -> Self {
        Self { key }
    }
}

impl RawSigner for RsaSigner {
    fn signature_algorithm(&self) -> Result<AlgorithmIdentifierOwned> {
        Ok(AlgorithmIdentifierOwned {
            oid: OID_RSA_ENCRYPTION,
            parameters: Some(Any::encode_from(&Null).map_err(encoding_error)?),
        })
    }

    fn sign_raw(&self, digest: DigestAlgorithm, message: &[u8]) -> Result<Vec<u8>> {
        use rsa::pkcs1v15::SigningKey;
        use signature::{SignatureEncoding, Signer};

        let signature = match digest {
            DigestAlgorithm::Sha1 => {
                return Err(Error::Unsupported("SHA-1 signatures are not produced".into()))
            },
            DigestAlgorithm::Sha256 => SigningKey::<sha2::Sha256>::new(self.key.clone())
                .try_sign(message)
                .map(|s| s.to_vec()),
            DigestAlgorithm::Sha384 => SigningKey::<sha2::Sha384>::new(self.key.clone())
                .try_sign(message)
                .map(|s| s.to_vec()),
            DigestAlgorithm::Sha512 => SigningKey::<sha2::Sha512>::new(self.key.clone())
                .try_sign(message)
                .map(|s| s.to_vec()),
        };
        signature.map_err(|e| Error::signing_failed(format!("RSA signing failed: {}", e)))
    }
}

/// How the SignerInfo names its signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerId {
    /// Issuer and serial number of the leaf certificate
    IssuerAndSerial,
    /// Subject key identifier (no certificate required)
    KeyIdentifier(Vec<u8>),
}

/// Certificates and signer identifier written into the SignedData.
#[derive(Debug, Clone)]
pub struct CmsIdentity {
    /// DER certificates, leaf first
    certificates: Vec<Vec<u8>>,
    signer_id: SignerId,
}

impl CmsIdentity {
    /// Identity with a leaf certificate and its chain (intermediates, root).
    pub fn from_chain(leaf: Vec<u8>, chain: Vec<Vec<u8>>) -> Self {
        let mut certificates = Vec::with_capacity(chain.len() + 1);
        certificates.push(leaf);
        certificates.extend(chain);
        Self {
            certificates,
            signer_id: SignerId::IssuerAndSerial,
        }
    }

    /// Certificate-less identity named by a key identifier.
    pub fn key_identifier(key_id: impl Into<Vec<u8>>) -> Self {
        Self {
            certificates: Vec::new(),
            signer_id: SignerId::KeyIdentifier(key_id.into()),
        }
    }

    /// DER certificates, leaf first.
    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.certificates
    }

    /// Leaf certificate, if any.
    pub fn leaf(&self) -> Option<&[u8]> {
        self.certificates.first().map(Vec::as_slice)
    }
}

/// ESSCertIDv2 with the optional issuerSerial left out.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct EssCertIdV2 {
    /// Absent when SHA-256 (the DEFAULT)
    #[asn1(optional = "true")]
    hash_algorithm: Option<AlgorithmIdentifierOwned>,
    cert_hash: OctetString,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct SigningCertificateV2 {
    certs: Vec<EssCertIdV2>,
}

/// Builder for detached CMS SignedData structures.
#[derive(Debug, Clone)]
pub struct CmsBuilder {
    profile: CmsProfile,
    digest_algorithm: DigestAlgorithm,
    signing_time: Option<DateTime<Utc>>,
    signing_certificate: bool,
}

impl Default for CmsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CmsBuilder {
    /// Detached SHA-256 builder including the ESS signing-certificate-v2 attribute.
    pub fn new() -> Self {
        Self {
            profile: CmsProfile::Detached,
            digest_algorithm: DigestAlgorithm::Sha256,
            signing_time: None,
            signing_certificate: true,
        }
    }

    /// Select the content profile.
    pub fn with_profile(mut self, profile: CmsProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Select the digest algorithm.
    pub fn with_digest_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.digest_algorithm = algorithm;
        self
    }

    /// Pin the signing-time attribute instead of using the current time.
    pub fn with_signing_time(mut self, at: DateTime<Utc>) -> Self {
        self.signing_time = Some(at);
        self
    }

    /// Leave out the ESS signing-certificate-v2 attribute.
    pub fn without_signing_certificate(mut self) -> Self {
        self.signing_certificate = false;
        self
    }

    /// Build the SignedData for a byte-range `digest`.
    pub fn build(
        &self,
        digest: &[u8],
        identity: &CmsIdentity,
        signer: &dyn RawSigner,
    ) -> Result<SignedCms> {
        if digest.len() != self.digest_algorithm.output_len() {
            return Err(Error::signing_failed(format!(
                "digest is {} bytes, {} produces {}",
                digest.len(),
                self.digest_algorithm,
                self.digest_algorithm.output_len()
            )));
        }

        let certificates = identity
            .certificates
            .iter()
            .map(|der| {
                Certificate::from_der(der)
                    .map_err(|e| Error::signing_failed(format!("invalid certificate: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let (sid, version) = match &identity.signer_id {
            SignerId::IssuerAndSerial => {
                let leaf = certificates.first().ok_or_else(|| {
                    Error::signing_failed("issuer-and-serial signer without a certificate")
                })?;
                (
                    SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                        issuer: leaf.tbs_certificate.issuer.clone(),
                        serial_number: leaf.tbs_certificate.serial_number.clone(),
                    }),
                    CmsVersion::V1,
                )
            },
            SignerId::KeyIdentifier(kid) => (
                SignerIdentifier::SubjectKeyIdentifier(SubjectKeyIdentifier(
                    OctetString::new(kid.clone()).map_err(encoding_error)?,
                )),
                CmsVersion::V3,
            ),
        };

        let (econtent, message_digest) = match self.profile {
            CmsProfile::Detached => (None, digest.to_vec()),
            CmsProfile::DigestAsContent => (
                Some(
                    Any::encode_from(&OctetString::new(digest.to_vec()).map_err(encoding_error)?)
                        .map_err(encoding_error)?,
                ),
                self.digest_algorithm.digest(digest),
            ),
        };

        let signing_time = self.signing_time.unwrap_or_else(Utc::now);
        let mut attributes = vec![
            attribute(OID_CONTENT_TYPE, Any::encode_from(&OID_DATA).map_err(encoding_error)?)?,
            attribute(OID_SIGNING_TIME, encode_time(signing_time)?)?,
            attribute(
                OID_MESSAGE_DIGEST,
                Any::encode_from(&OctetString::new(message_digest).map_err(encoding_error)?)
                    .map_err(encoding_error)?,
            )?,
        ];
        if self.signing_certificate {
            if let Some(leaf) = identity.leaf() {
                attributes.push(self.signing_certificate_attribute(leaf)?);
            }
        }
        let signed_attrs = SetOfVec::try_from(attributes).map_err(encoding_error)?;

        let signed_attrs_der = signed_attrs.to_der().map_err(encoding_error)?;
        let signature = signer.sign_raw(self.digest_algorithm, &signed_attrs_der)?;

        let digest_alg = AlgorithmIdentifierOwned {
            oid: self.digest_algorithm.oid(),
            parameters: None,
        };

        let signer_info = SignerInfo {
            version,
            sid,
            digest_alg: digest_alg.clone(),
            signed_attrs: Some(signed_attrs),
            signature_algorithm: signer.signature_algorithm()?,
            signature: OctetString::new(signature).map_err(encoding_error)?,
            unsigned_attrs: None,
        };

        let certificate_set = if certificates.is_empty() {
            None
        } else {
            Some(CertificateSet(
                SetOfVec::try_from(
                    certificates
                        .into_iter()
                        .map(CertificateChoices::Certificate)
                        .collect::<Vec<_>>(),
                )
                .map_err(encoding_error)?,
            ))
        };

        let signed_data = SignedData {
            version,
            digest_algorithms: SetOfVec::try_from(vec![digest_alg]).map_err(encoding_error)?,
            encap_content_info: EncapsulatedContentInfo {
                econtent_type: OID_DATA,
                econtent,
            },
            certificates: certificate_set,
            crls: None,
            signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info]).map_err(encoding_error)?),
        };

        let content_info = ContentInfo {
            content_type: OID_SIGNED_DATA,
            content: Any::encode_from(&signed_data).map_err(encoding_error)?,
        };

        Ok(SignedCms {
            der: content_info.to_der().map_err(encoding_error)?,
        })
    }

    fn signing_certificate_attribute(&self, leaf: &[u8]) -> Result<Attribute> {
        let hash_algorithm = match self.digest_algorithm {
            DigestAlgorithm::Sha256 => None,
            other => Some(AlgorithmIdentifierOwned {
                oid: other.oid(),
                parameters: None,
            }),
        };
        let value = SigningCertificateV2 {
            certs: vec![EssCertIdV2 {
                hash_algorithm,
                cert_hash: OctetString::new(self.digest_algorithm.digest(leaf))
                    .map_err(encoding_error)?,
            }],
        };
        attribute(
            OID_SIGNING_CERTIFICATE_V2,
            Any::encode_from(&value).map_err(encoding_error)?,
        )
    }
}

/// A DER-encoded CMS ContentInfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCms {
    der: Vec<u8>,
}

impl SignedCms {
    /// Wrap DER bytes without inspecting them.
    pub fn from_der(der: Vec<u8>) -> Self {
        Self { der }
    }

    /// DER bytes.
    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    /// Consume into DER bytes.
    pub fn into_der(self) -> Vec<u8> {
        self.der
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.der.len()
    }

    /// Whether the encoding is empty.
    pub fn is_empty(&self) -> bool {
        self.der.is_empty()
    }

    /// Base64 for transport.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.der)
    }
}

/// Read-only view of a decoded SignedData.
#[derive(Debug, Clone)]
pub struct ParsedCms {
    signed_data: SignedData,
}

impl ParsedCms {
    /// Decode a ContentInfo, ignoring any zero padding after it.
    pub fn from_der_padded(bytes: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(bytes).map_err(decoding_error)?;
        let content_info = ContentInfo::decode(&mut reader).map_err(decoding_error)?;
        if content_info.content_type != OID_SIGNED_DATA {
            return Err(Error::VerificationFailed(format!(
                "content type {} is not signedData",
                content_info.content_type
            )));
        }
        let signed_data = content_info
            .content
            .decode_as::<SignedData>()
            .map_err(decoding_error)?;
        Ok(Self { signed_data })
    }

    /// The underlying SignedData.
    pub fn signed_data(&self) -> &SignedData {
        &self.signed_data
    }

    /// The single SignerInfo this crate produces and verifies.
    pub fn signer_info(&self) -> Result<&SignerInfo> {
        self.signed_data
            .signer_infos
            .0
            .iter()
            .next()
            .ok_or_else(|| Error::VerificationFailed("SignedData has no SignerInfo".into()))
    }

    /// Embedded certificates as DER, in encoding order.
    pub fn certificates(&self) -> Vec<Vec<u8>> {
        let Some(set) = &self.signed_data.certificates else {
            return Vec::new();
        };
        set.0
            .iter()
            .filter_map(|choice| match choice {
                CertificateChoices::Certificate(cert) => cert.to_der().ok(),
                _ => None,
            })
            .collect()
    }

    /// The certificate named by the SignerInfo's issuer and serial number.
    pub fn signer_certificate(&self) -> Result<Option<Vec<u8>>> {
        let SignerIdentifier::IssuerAndSerialNumber(ias) = &self.signer_info()?.sid else {
            return Ok(None);
        };
        let Some(set) = &self.signed_data.certificates else {
            return Ok(None);
        };
        for choice in set.0.iter() {
            if let CertificateChoices::Certificate(cert) = choice {
                if cert.tbs_certificate.issuer == ias.issuer
                    && cert.tbs_certificate.serial_number == ias.serial_number
                {
                    return Ok(Some(cert.to_der().map_err(decoding_error)?));
                }
            }
        }
        Ok(None)
    }

    /// Digest algorithm of the SignerInfo.
    pub fn digest_algorithm(&self) -> Result<DigestAlgorithm> {
        let oid = self.signer_info()?.digest_alg.oid;
        DigestAlgorithm::from_oid(&oid)
            .ok_or_else(|| Error::Unsupported(format!("digest algorithm {}", oid)))
    }

    /// Signature algorithm OID of the SignerInfo.
    pub fn signature_algorithm(&self) -> Result<ObjectIdentifier> {
        Ok(self.signer_info()?.signature_algorithm.oid)
    }

    /// Whether the signature was produced by the development mock signer.
    pub fn is_mock(&self) -> bool {
        self.signature_algorithm()
            .map(|oid| oid == OID_HMAC_SHA256)
            .unwrap_or(false)
    }

    /// Raw signature value.
    pub fn signature(&self) -> Result<&[u8]> {
        Ok(self.signer_info()?.signature.as_bytes())
    }

    /// DER of the signed attributes as a SET OF, which is what gets signed.
    pub fn signed_attributes_der(&self) -> Result<Vec<u8>> {
        let attrs = self
            .signer_info()?
            .signed_attrs
            .as_ref()
            .ok_or_else(|| Error::VerificationFailed("SignerInfo has no signed attributes".into()))?;
        attrs.to_der().map_err(decoding_error)
    }

    fn signed_attribute(&self, oid: ObjectIdentifier) -> Result<Option<Any>> {
        let Some(attrs) = &self.signer_info()?.signed_attrs else {
            return Ok(None);
        };
        Ok(attrs
            .iter()
            .find(|attr| attr.oid == oid)
            .and_then(|attr| attr.values.iter().next().cloned()))
    }

    /// The messageDigest signed attribute.
    pub fn message_digest(&self) -> Result<Vec<u8>> {
        let value = self
            .signed_attribute(OID_MESSAGE_DIGEST)?
            .ok_or_else(|| Error::VerificationFailed("messageDigest attribute missing".into()))?;
        let digest = value.decode_as::<OctetString>().map_err(decoding_error)?;
        Ok(digest.as_bytes().to_vec())
    }

    /// The signingTime signed attribute, if present.
    pub fn signing_time(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(value) = self.signed_attribute(OID_SIGNING_TIME)? else {
            return Ok(None);
        };
        let duration = match value.decode_as::<UtcTime>() {
            Ok(t) => t.to_unix_duration(),
            Err(_) => value
                .decode_as::<GeneralizedTime>()
                .map_err(decoding_error)?
                .to_unix_duration(),
        };
        Ok(DateTime::<Utc>::from_timestamp(duration.as_secs() as i64, 0))
    }

    /// Encapsulated content octets, if the SignedData is not detached.
    pub fn encapsulated_content(&self) -> Result<Option<Vec<u8>>> {
        match &self.signed_data.encap_content_info.econtent {
            None => Ok(None),
            Some(any) => {
                let octets = any.decode_as::<OctetString>().map_err(decoding_error)?;
                Ok(Some(octets.as_bytes().to_vec()))
            },
        }
    }

    /// Whether an RFC 3161 token is attached.
    pub fn has_timestamp(&self) -> bool {
        self.signer_info()
            .ok()
            .and_then(|si| si.unsigned_attrs.as_ref())
            .map(|attrs| attrs.iter().any(|a| a.oid == OID_TIMESTAMP_TOKEN))
            .unwrap_or(false)
    }
}

/// Signature value of the first SignerInfo; the input of an RFC 3161 imprint.
pub fn signature_value(cms_der: &[u8]) -> Result<Vec<u8>> {
    Ok(ParsedCms::from_der_padded(cms_der)?.signature()?.to_vec())
}

/// Attach an RFC 3161 timestamp token as an unsigned attribute.
pub fn attach_timestamp(cms_der: &[u8], token_der: &[u8]) -> Result<SignedCms> {
    let parsed = ParsedCms::from_der_padded(cms_der)?;
    let token = Any::from_der(token_der)
        .map_err(|e| Error::Timestamp {
            message: format!("invalid timestamp token: {}", e),
            transient: false,
        })?;

    let mut signed_data = parsed.signed_data;
    let mut signer_infos: Vec<SignerInfo> = signed_data.signer_infos.0.iter().cloned().collect();
    let signer_info = signer_infos
        .first_mut()
        .ok_or_else(|| Error::VerificationFailed("SignedData has no SignerInfo".into()))?;

    let mut unsigned: Vec<Attribute> = signer_info
        .unsigned_attrs
        .as_ref()
        .map(|attrs| attrs.iter().filter(|a| a.oid != OID_TIMESTAMP_TOKEN).cloned().collect())
        .unwrap_or_default();
    unsigned.push(attribute(OID_TIMESTAMP_TOKEN, token)?);
    signer_info.unsigned_attrs = Some(SetOfVec::try_from(unsigned).map_err(encoding_error)?);

    signed_data.signer_infos = SignerInfos(SetOfVec::try_from(signer_infos).map_err(encoding_error)?);
    let content_info = ContentInfo {
        content_type: OID_SIGNED_DATA,
        content: Any::encode_from(&signed_data).map_err(encoding_error)?,
    };
    Ok(SignedCms {
        der: content_info.to_der().map_err(encoding_error)?,
    })
}

fn attribute(oid: ObjectIdentifier, value: Any) -> Result<Attribute> {
    Ok(Attribute {
        oid,
        values: SetOfVec::try_from(vec![value]).map_err(encoding_error)?,
    })
}

/// UTCTime before 2050, GeneralizedTime after (RFC 5652 section 11.3).
fn encode_time(at: DateTime<Utc>) -> Result<Any> {
    let since_epoch = Duration::from_secs(at.timestamp().max(0) as u64);
    if at.year() < 2050 {
        let time = UtcTime::from_unix_duration(since_epoch).map_err(encoding_error)?;
        Any::encode_from(&time).map_err(encoding_error)
    } else {
        let time = GeneralizedTime::from_unix_duration(since_epoch).map_err(encoding_error)?;
        Any::encode_from(&time).map_err(encoding_error)
    }
}

fn encoding_error(e: der::Error) -> Error {
    Error::signing_failed(format!("CMS encoding failed: {}", e))
}

fn decoding_error(e: der::Error) -> Error {
    Error::VerificationFailed(format!("invalid CMS structure: {}", e))
}
