//! RFC 3161 timestamp authority client.
//!
//! The message imprint is the SHA-256 hash of the SignerInfo signature value,
//! and the returned token is attached as the id-aa-timeStampToken unsigned
//! attribute. A token is only accepted when its TSTInfo echoes the request's
//! imprint and nonce.

use cms::content_info::ContentInfo;
use cms::signed_data::SignedData;
use der::asn1::{BitString, GeneralizedTime, Null, ObjectIdentifier, OctetString};
use der::{Any, Decode, DecodeValue, Encode, FixedTag, Header, Reader, Sequence, Tag, Tagged};
use log::{debug, info};
use spki::AlgorithmIdentifierOwned;

use super::cms::{attach_timestamp, signature_value, SignedCms, OID_SIGNED_DATA};
use super::types::DigestAlgorithm;
use crate::config::TsaConfig;
use crate::error::{Error, Result};

/// id-ct-TSTInfo
pub const OID_TST_INFO: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.1.4");

/// `MessageImprint ::= SEQUENCE { hashAlgorithm, hashedMessage }`
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct MessageImprint {
    /// Hash algorithm of the imprint
    pub hash_algorithm: AlgorithmIdentifierOwned,
    /// Hash value
    pub hashed_message: OctetString,
}

/// `TimeStampReq` without policy and extensions.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TimeStampReq {
    /// Always 1
    pub version: u8,
    /// Imprint of the timestamped data
    pub message_imprint: MessageImprint,
    /// Replay protection
    #[asn1(optional = "true")]
    pub nonce: Option<u64>,
    /// Ask the TSA to include its certificate
    pub cert_req: bool,
}

impl TimeStampReq {
    /// Request for `data`, hashed with SHA-256.
    pub fn for_data(data: &[u8], nonce: u64) -> Result<Self> {
        Ok(Self {
            version: 1,
            message_imprint: MessageImprint {
                hash_algorithm: AlgorithmIdentifierOwned {
                    oid: DigestAlgorithm::Sha256.oid(),
                    parameters: Some(Any::encode_from(&Null).map_err(request_error)?),
                },
                hashed_message: OctetString::new(DigestAlgorithm::Sha256.digest(data))
                    .map_err(request_error)?,
            },
            nonce: Some(nonce),
            cert_req: true,
        })
    }
}

/// The parts of `TSTInfo` checked against the request.
///
/// Fields after `genTime` are skipped except the nonce, the only top-level
/// INTEGER among them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TstInfo {
    /// Imprint the TSA stamped
    pub message_imprint: MessageImprint,
    /// When the token was produced
    pub gen_time: GeneralizedTime,
    /// Echo of the request nonce
    pub nonce: Option<u64>,
}

impl<'a> DecodeValue<'a> for TstInfo {
    fn decode_value<R: Reader<'a>>(reader: &mut R, header: Header) -> der::Result<Self> {
        reader.read_nested(header.length, |reader| {
            let _version = u8::decode(reader)?;
            let _policy = ObjectIdentifier::decode(reader)?;
            let message_imprint = MessageImprint::decode(reader)?;
            let _serial_number = Any::decode(reader)?;
            let gen_time = GeneralizedTime::decode(reader)?;

            let mut nonce = None;
            while !reader.is_finished() {
                let field = Any::decode(reader)?;
                if field.tag() == Tag::Integer {
                    nonce = Some(field.decode_as::<u64>()?);
                }
            }
            Ok(Self {
                message_imprint,
                gen_time,
                nonce,
            })
        })
    }
}

impl FixedTag for TstInfo {
    const TAG: Tag = Tag::Sequence;
}

/// `PKIStatusInfo`
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct PkiStatusInfo {
    /// 0 granted, 1 granted with mods, 2 rejection, 3 waiting, 4/5 revocation
    pub status: u32,
    /// Free text from the TSA
    #[asn1(optional = "true")]
    pub status_string: Option<Vec<String>>,
    /// Failure bits
    #[asn1(optional = "true")]
    pub fail_info: Option<BitString>,
}

/// `TimeStampResp`
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TimeStampResp {
    /// Outcome
    pub status: PkiStatusInfo,
    /// Token, present when granted
    #[asn1(optional = "true")]
    pub time_stamp_token: Option<ContentInfo>,
}

/// Build a DER `TimeStampReq` for `data`, hashed with SHA-256.
pub fn build_request(data: &[u8], nonce: u64) -> Result<Vec<u8>> {
    TimeStampReq::for_data(data, nonce)?.to_der().map_err(request_error)
}

fn invalid_token(message: impl Into<String>) -> Error {
    Error::Timestamp {
        message: message.into(),
        transient: false,
    }
}

/// Parse a DER `TimeStampResp` answering `request` and return the DER token.
pub fn parse_response(bytes: &[u8], request: &TimeStampReq) -> Result<Vec<u8>> {
    let response = TimeStampResp::from_der(bytes)
        .map_err(|e| invalid_token(format!("invalid TimeStampResp: {}", e)))?;

    if response.status.status > 1 {
        let text = response
            .status
            .status_string
            .map(|parts| parts.join("; "))
            .unwrap_or_default();
        return Err(Error::Timestamp {
            message: format!("TSA refused request (status {}): {}", response.status.status, text),
            // 3 = waiting
            transient: response.status.status == 3,
        });
    }

    let token = response.time_stamp_token.ok_or_else(|| Error::Timestamp {
        message: "granted response carries no token".into(),
        transient: false,
    })?;
    if token.content_type != OID_SIGNED_DATA {
        return Err(Error::Timestamp {
            message: format!("token content type {} is not signedData", token.content_type),
            transient: false,
        });
    }
    let signed_data = token.content.decode_as::<SignedData>().map_err(|e| Error::Timestamp {
        message: format!("invalid token SignedData: {}", e),
        transient: false,
    })?;
    if signed_data.encap_content_info.econtent_type != OID_TST_INFO {
        return Err(Error::Timestamp {
            message: "token does not encapsulate a TSTInfo".into(),
            transient: false,
        });
    }

    let tst_info = signed_data
        .encap_content_info
        .econtent
        .as_ref()
        .ok_or_else(|| invalid_token("token carries no TSTInfo content"))?
        .decode_as::<OctetString>()
        .and_then(|content| TstInfo::from_der(content.as_bytes()))
        .map_err(|e| invalid_token(format!("invalid TSTInfo: {}", e)))?;

    let expected = &request.message_imprint;
    if tst_info.message_imprint.hash_algorithm.oid != expected.hash_algorithm.oid
        || tst_info.message_imprint.hashed_message != expected.hashed_message
    {
        return Err(invalid_token("timestamp token covers different data"));
    }
    if request.nonce.is_some() && tst_info.nonce != request.nonce {
        return Err(invalid_token(format!(
            "timestamp nonce mismatch: sent {:?}, received {:?}",
            request.nonce, tst_info.nonce
        )));
    }
    debug!("TSA token generated at {:?}", tst_info.gen_time);

    token.to_der().map_err(|e| Error::Timestamp {
        message: format!("cannot re-encode token: {}", e),
        transient: false,
    })
}

/// Blocking RFC 3161 client.
#[derive(Debug, Clone)]
pub struct TsaClient {
    config: TsaConfig,
    http: reqwest::blocking::Client,
}

impl TsaClient {
    /// Create a client for the configured endpoint.
    pub fn new(config: TsaConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Config(format!("failed to create TSA HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    /// Endpoint URL.
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Request a token over `data`.
    pub fn request_token(&self, data: &[u8]) -> Result<Vec<u8>> {
        let request = TimeStampReq::for_data(data, nonce())?;
        let body = request.to_der().map_err(request_error)?;
        info!("Requesting timestamp from {}", self.config.url);

        let mut http_request = self
            .http
            .post(&self.config.url)
            .header("Content-Type", "application/timestamp-query")
            .header("Accept", "application/timestamp-reply")
            .body(body);
        if let Some(user) = &self.config.username {
            http_request = http_request.basic_auth(user, self.config.password.as_ref());
        }

        let response = http_request.send().map_err(|e| Error::Timestamp {
            message: format!("TSA request failed: {}", e),
            transient: e.is_timeout() || e.is_connect(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Timestamp {
                message: format!("TSA returned HTTP {}", status.as_u16()),
                transient: status.is_server_error(),
            });
        }

        let bytes = response.bytes().map_err(|e| Error::Timestamp {
            message: format!("failed to read TSA response: {}", e),
            transient: true,
        })?;
        let token = parse_response(&bytes, &request)?;
        debug!("Received {} byte timestamp token (nonce {:?})", token.len(), request.nonce);
        Ok(token)
    }

    /// Timestamp the signature value of `cms` and attach the token.
    pub fn timestamp_cms(&self, cms: &SignedCms) -> Result<SignedCms> {
        let signature = signature_value(cms.as_der())?;
        let token = self.request_token(&signature)?;
        attach_timestamp(cms.as_der(), &token)
    }
}

fn nonce() -> u64 {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let mut first = [0u8; 8];
    first.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(first) >> 1
}

fn request_error(e: der::Error) -> Error {
    Error::Timestamp {
        message: format!("cannot encode TimeStampReq: {}", e),
        transient: false,
    }
}
