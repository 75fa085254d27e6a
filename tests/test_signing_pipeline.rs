//! Integration tests for the prepare -> digest -> sign -> embed -> verify path.

mod common;

use std::sync::Arc;

use common::{fixture, init_logging, simple_pdf, CHAIN_PASSWORD, SELF_SIGNED_PASSWORD};
use pdf_signflow::backend::{LocalP12Backend, SignContext, SigningBackend};
use pdf_signflow::signatures::{
    compute_digest, cross_check, DigestAlgorithm, DigestPolicy, DocumentId, KeyReference,
    PlaceholderOptions, PlaceholderPreparer, Rect, SignatureEmbedder, SignatureVerifier,
    SignerMetadata, SigningRequest, VerificationStatus, WidgetAppearance,
};
use pdf_signflow::store::{FsDocumentStore, MemoryStore, SignatureRecordStore};
use pdf_signflow::{sign_document, EngineConfig, Error, RecordStatus, SigningPipeline};
use tempfile::tempdir;

fn local_backend() -> LocalP12Backend {
    LocalP12Backend::open(fixture("self_signed.p12"), SELF_SIGNED_PASSWORD)
        .expect("self-signed fixture should open")
}

fn alice() -> SignerMetadata {
    SignerMetadata::new("Alice Example")
        .with_reason("Contract approval")
        .with_location("Berlin")
}

mod end_to_end_tests {
    use super::*;

    #[test]
    fn test_sign_and_verify_one_page() {
        init_logging();
        let pdf = simple_pdf(1);
        let options = PlaceholderOptions::new(alice()).with_reserved_bytes(16000);

        let signed = sign_document(&pdf, &options, &local_backend()).unwrap();
        assert!(signed.bytes.starts_with(&pdf), "incremental update must keep the original");
        assert!(!signed.timestamped);

        let report = SignatureVerifier::new().verify_document(&signed.bytes).unwrap();
        assert!(report.is_signed);
        assert!(report.is_valid, "messages: {:?}", report.messages);
        assert_eq!(report.status, VerificationStatus::Verified);
        assert_eq!(report.signature_count, 1);

        let check = report.latest().unwrap();
        assert!(check.covers_whole_document);
        assert_eq!(check.info.signer_name.as_deref(), Some("Alice Example"));
        assert_eq!(check.info.reason.as_deref(), Some("Contract approval"));
        assert_eq!(check.digest_hex.as_deref(), Some(signed.digest.hex().as_str()));
        assert!(check.signer_subject.as_deref().unwrap().contains("Test Signer"));
        assert!(!check.mock);
    }

    #[test]
    fn test_step_by_step_matches_sign_document() {
        let pdf = simple_pdf(2);
        let options = PlaceholderOptions::new(alice()).with_reserved_bytes(12000);
        let prepared = PlaceholderPreparer::new(options.clone()).prepare(&pdf).unwrap();

        let digest = compute_digest(
            prepared.bytes(),
            DigestPolicy::ExplicitByteRange,
            DigestAlgorithm::Sha256,
        )
        .unwrap();
        assert_eq!(digest, prepared.digest(DigestAlgorithm::Sha256).unwrap());

        let backend = local_backend();
        let signer = alice();
        let signature = backend
            .sign(&digest.hex(), &SignContext::new(DigestAlgorithm::Sha256, &signer))
            .unwrap();
        let signed = SignatureEmbedder::new().embed(&prepared, &signature.cms_der).unwrap();

        assert_eq!(signed.len(), prepared.bytes().len());
        let report = SignatureVerifier::new().verify_document(&signed).unwrap();
        assert_eq!(report.status, VerificationStatus::Verified);
    }

    #[test]
    fn test_unsigned_document() {
        let report = SignatureVerifier::new().verify_document(&simple_pdf(1)).unwrap();
        assert!(!report.is_signed);
        assert!(!report.is_valid);
        assert_eq!(report.status, VerificationStatus::Unsigned);
    }

    #[test]
    fn test_tampering_invalidates() {
        let pdf = simple_pdf(1);
        let options = PlaceholderOptions::new(alice()).with_reserved_bytes(16000);
        let mut signed = sign_document(&pdf, &options, &local_backend()).unwrap().bytes;

        // Binary marker in the header comment, inside the first signed range
        signed[10] ^= 0x01;

        let report = SignatureVerifier::new().verify_document(&signed).unwrap();
        assert!(report.is_signed);
        assert!(!report.is_valid);
        assert_eq!(report.status, VerificationStatus::Invalid);
    }

    #[test]
    fn test_appended_bytes_are_reported() {
        let pdf = simple_pdf(1);
        let options = PlaceholderOptions::new(alice()).with_reserved_bytes(16000);
        let mut signed = sign_document(&pdf, &options, &local_backend()).unwrap().bytes;
        signed.extend_from_slice(b"\n% trailing edit\n");

        let report = SignatureVerifier::new().verify_document(&signed).unwrap();
        assert!(report.is_signed);
        assert!(!report.is_valid);
        assert!(!report.latest().unwrap().covers_whole_document);
        assert!(report
            .messages
            .iter()
            .any(|m| m.contains("modified after the last signature")));
    }

    #[test]
    fn test_second_signature_keeps_first() {
        let pdf = simple_pdf(1);
        let first = sign_document(
            &pdf,
            &PlaceholderOptions::new(SignerMetadata::new("First")).with_reserved_bytes(12000),
            &local_backend(),
        )
        .unwrap();
        let second = sign_document(
            &first.bytes,
            &PlaceholderOptions::new(SignerMetadata::new("Second")).with_reserved_bytes(12000),
            &local_backend(),
        )
        .unwrap();
        assert_ne!(first.field_name, second.field_name);

        let report = SignatureVerifier::new().verify_document(&second.bytes).unwrap();
        assert_eq!(report.signature_count, 2);
        assert_eq!(report.status, VerificationStatus::Verified);
        assert!(!report.signatures[0].covers_whole_document);
        assert!(report.signatures[1].covers_whole_document);
    }
}

mod digest_policy_tests {
    use super::*;

    #[test]
    fn test_policies_agree_on_prepared_and_signed() {
        let pdf = simple_pdf(3);
        let options = PlaceholderOptions::new(alice()).with_reserved_bytes(9000);
        let prepared = PlaceholderPreparer::new(options.clone()).prepare(&pdf).unwrap();

        for algorithm in [
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384,
            DigestAlgorithm::Sha512,
        ] {
            let explicit =
                compute_digest(prepared.bytes(), DigestPolicy::ExplicitByteRange, algorithm)
                    .unwrap();
            let relative =
                compute_digest(prepared.bytes(), DigestPolicy::ContentsRelative, algorithm)
                    .unwrap();
            assert_eq!(explicit.bytes, relative.bytes);
            assert_eq!(explicit.bytes.len(), algorithm.output_len());
        }

        let signed = sign_document(&pdf, &options, &local_backend()).unwrap();
        let after = cross_check(&signed.bytes, DigestAlgorithm::Sha256).unwrap();
        assert_eq!(after.bytes, signed.digest.bytes);
    }

    fn marker_text_signer() -> SignerMetadata {
        SignerMetadata::new("Eve /ByteRange [0 1 2 3]")
            .with_reason("per clause /ByteRange [0 1 2 3]")
            .with_location("see /Contents <00>")
            .with_contact_info("/SubFilter /adbe.pkcs7.detached /Contents <FFFF> >>")
    }

    #[test]
    fn test_policies_agree_with_marker_text_in_metadata() {
        let stamp = WidgetAppearance::new(0, Rect::new(72.0, 72.0, 220.0, 60.0));
        let appearances = [
            None,
            Some(stamp.clone()),
            Some(stamp.with_stamp_text("Signed /ByteRange [0 10 20 30]\n/Contents <ABCD> endstream")),
        ];
        for appearance in appearances {
            let mut options =
                PlaceholderOptions::new(marker_text_signer()).with_reserved_bytes(16000);
            if let Some(appearance) = appearance {
                options = options.with_appearance(appearance);
            }

            let prepared = PlaceholderPreparer::new(options.clone()).prepare(&simple_pdf(1)).unwrap();
            let digest = cross_check(prepared.bytes(), DigestAlgorithm::Sha256).unwrap();
            assert_eq!(digest.byte_range, prepared.byte_range());

            let signed = sign_document(&simple_pdf(1), &options, &local_backend()).unwrap();
            let after = cross_check(&signed.bytes, DigestAlgorithm::Sha256).unwrap();
            assert_eq!(after.bytes, signed.digest.bytes);

            let report = SignatureVerifier::new().verify_document(&signed.bytes).unwrap();
            assert_eq!(report.status, VerificationStatus::Verified, "{:?}", report.messages);
            assert_eq!(report.signature_count, 1);
            let check = report.latest().unwrap();
            assert_eq!(check.info.reason.as_deref(), Some("per clause /ByteRange [0 1 2 3]"));
            assert_eq!(check.info.location.as_deref(), Some("see /Contents <00>"));
        }
    }

    #[test]
    fn test_unprepared_document_has_no_digest() {
        let err = cross_check(&simple_pdf(1), DigestAlgorithm::Sha256).unwrap_err();
        assert!(matches!(err, Error::MalformedDocument(_)));
    }
}

mod reservation_tests {
    use super::*;

    #[test]
    fn test_signature_too_large() {
        let options = PlaceholderOptions::new(alice()).with_reserved_bytes(64);
        let err = sign_document(&simple_pdf(1), &options, &local_backend()).unwrap_err();
        match err {
            Error::SignatureTooLarge { required, reserved } => {
                assert_eq!(reserved, 64);
                assert!(required > reserved);
            },
            other => panic!("expected SignatureTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_reservation_refused() {
        let options = PlaceholderOptions::new(alice()).with_reserved_bytes(0);
        assert!(sign_document(&simple_pdf(1), &options, &local_backend()).is_err());
    }

    #[test]
    fn test_not_a_pdf() {
        let options = PlaceholderOptions::new(alice());
        let err = sign_document(b"plain text, not a PDF", &options, &local_backend()).unwrap_err();
        assert!(matches!(err, Error::MalformedDocument(_)));
    }
}

mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn embedding_preserves_length_and_digest(pages in 1usize..4, reserved in 4096usize..9000) {
            let pdf = simple_pdf(pages);
            let options = PlaceholderOptions::new(alice()).with_reserved_bytes(reserved);
            let prepared = PlaceholderPreparer::new(options).prepare(&pdf).unwrap();
            prop_assert_eq!(prepared.reserved_bytes(), reserved);

            let digest = prepared.digest(DigestAlgorithm::Sha256).unwrap();
            let signer = alice();
            let signature = local_backend()
                .sign(&digest.hex(), &SignContext::new(DigestAlgorithm::Sha256, &signer))
                .unwrap();
            let signed = SignatureEmbedder::new().embed(&prepared, &signature.cms_der).unwrap();

            prop_assert_eq!(signed.len(), prepared.bytes().len());
            let after = cross_check(&signed, DigestAlgorithm::Sha256).unwrap();
            prop_assert_eq!(after.bytes, digest.bytes);
        }

        #[test]
        fn arbitrary_metadata_keeps_policies_in_agreement(
            name in "\\PC{1,40}",
            reason in proptest::option::of("[ -~]{0,60}"),
            location in proptest::option::of("\\PC{0,30}"),
            contact in proptest::option::of("[ -~]{0,40}"),
            stamp in proptest::option::of("[ -~\n]{1,80}"),
        ) {
            let mut signer = SignerMetadata::new(name);
            if let Some(reason) = reason {
                signer = signer.with_reason(reason);
            }
            if let Some(location) = location {
                signer = signer.with_location(location);
            }
            if let Some(contact) = contact {
                signer = signer.with_contact_info(contact);
            }
            let mut options = PlaceholderOptions::new(signer).with_reserved_bytes(16000);
            if let Some(text) = stamp {
                options = options.with_appearance(
                    WidgetAppearance::new(0, Rect::new(50.0, 50.0, 200.0, 60.0)).with_stamp_text(text),
                );
            }

            let prepared = PlaceholderPreparer::new(options.clone()).prepare(&simple_pdf(1)).unwrap();
            prop_assert!(cross_check(prepared.bytes(), DigestAlgorithm::Sha256).is_ok());

            let signed = sign_document(&simple_pdf(1), &options, &local_backend()).unwrap();
            prop_assert!(cross_check(&signed.bytes, DigestAlgorithm::Sha256).is_ok());
            let report = SignatureVerifier::new().verify_document(&signed.bytes).unwrap();
            prop_assert_eq!(report.status, VerificationStatus::Verified);
            prop_assert_eq!(report.signature_count, 1);
        }
    }
}

mod pipeline_tests {
    use super::*;

    fn request(document: &str) -> SigningRequest {
        SigningRequest::new(
            DocumentId::new(document),
            alice().with_organization("Example GmbH"),
            KeyReference::LocalP12 {
                path: fixture("self_signed.p12"),
                password: SELF_SIGNED_PASSWORD.to_string(),
            },
        )
    }

    #[test]
    fn test_run_writes_new_output_and_record() {
        init_logging();
        let dir = tempdir().unwrap();
        let original = simple_pdf(1);
        std::fs::write(dir.path().join("contract.pdf"), &original).unwrap();

        let documents = Arc::new(FsDocumentStore::new(dir.path()).unwrap());
        let records = Arc::new(MemoryStore::new());
        let pipeline =
            SigningPipeline::new(EngineConfig::new(), documents, records.clone()).unwrap();

        let record = pipeline.run(&request("contract")).unwrap();
        assert_eq!(record.status, RecordStatus::Success);
        assert_eq!(record.signer_identity, "Alice Example");
        assert_eq!(record.organization.as_deref(), Some("Example GmbH"));
        assert_eq!(record.certificate_chain.len(), 1);

        let path = record.signed_path.clone().unwrap();
        assert_ne!(path, dir.path().join("contract.pdf"));
        assert_eq!(std::fs::read(dir.path().join("contract.pdf")).unwrap(), original);

        let signed = std::fs::read(&path).unwrap();
        let report = pipeline.verify(&DocumentId::new("contract"), &signed).unwrap();
        assert_eq!(report.status, VerificationStatus::Verified);
        let summary = report.record.unwrap();
        assert!(summary.matches_document);
        assert_eq!(summary.record_id, record.id);

        let latest = records
            .find_latest_signature_record(&DocumentId::new("contract"))
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, record.id);
        assert_eq!(pipeline.verify_record(&latest).unwrap().status, VerificationStatus::Verified);
    }

    #[test]
    fn test_signed_without_record_is_unverifiable() {
        let dir = tempdir().unwrap();
        let documents = Arc::new(FsDocumentStore::new(dir.path()).unwrap());
        let pipeline =
            SigningPipeline::new(EngineConfig::new(), documents, Arc::new(MemoryStore::new()))
                .unwrap();

        let signed = sign_document(
            &simple_pdf(1),
            &PlaceholderOptions::new(alice()).with_reserved_bytes(16000),
            &local_backend(),
        )
        .unwrap();
        let report = pipeline.verify(&DocumentId::new("elsewhere"), &signed.bytes).unwrap();
        assert!(report.is_signed);
        assert_eq!(report.status, VerificationStatus::SignedUnverifiable);
        assert!(report.record.is_none());
    }

    #[test]
    fn test_missing_document_records_failure() {
        let dir = tempdir().unwrap();
        let records = Arc::new(MemoryStore::new());
        let pipeline = SigningPipeline::new(
            EngineConfig::new(),
            Arc::new(FsDocumentStore::new(dir.path()).unwrap()),
            records.clone(),
        )
        .unwrap();

        let err = pipeline.run(&request("missing")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let stored = records.list_signature_records(&DocumentId::new("missing")).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, RecordStatus::Failed);
        assert!(stored[0].error.is_some());
    }

    #[test]
    fn test_wrong_password_fails() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("contract.pdf"), simple_pdf(1)).unwrap();
        let pipeline = SigningPipeline::new(
            EngineConfig::new(),
            Arc::new(FsDocumentStore::new(dir.path()).unwrap()),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();

        let mut request = request("contract");
        request.key = KeyReference::LocalP12 {
            path: fixture("self_signed.p12"),
            password: "wrong".to_string(),
        };
        assert!(pipeline.run(&request).is_err());
        // Only the original is in the store directory
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}

mod trust_tests {
    use super::*;

    fn chain_backend() -> LocalP12Backend {
        LocalP12Backend::open(fixture("chain.p12"), CHAIN_PASSWORD).unwrap()
    }

    #[test]
    fn test_chain_embedded_and_trusted() {
        let backend = chain_backend();
        let full_chain = backend.credentials().full_chain();
        assert_eq!(full_chain.len(), 2);
        let root = full_chain.last().unwrap().clone();

        let signed = sign_document(
            &simple_pdf(1),
            &PlaceholderOptions::new(SignerMetadata::new("Chained")).with_reserved_bytes(16000),
            &backend,
        )
        .unwrap();
        assert_eq!(signed.signature.certificate_chain.len(), 2);

        let report = SignatureVerifier::new()
            .with_trusted_root(root)
            .verify_document(&signed.bytes)
            .unwrap();
        assert_eq!(report.status, VerificationStatus::Verified);

        let check = report.latest().unwrap();
        assert!(check.signer_subject.as_deref().unwrap().contains("Chained Signer"));
        assert_eq!(check.certificate_chain.len(), 2);
        assert!(check.certificate_chain[1].subject.contains("Test Root CA"));
    }

    #[test]
    fn test_untrusted_root() {
        let other_root = local_backend().credentials().certificate().to_vec();
        let signed = sign_document(
            &simple_pdf(1),
            &PlaceholderOptions::new(SignerMetadata::new("Chained")).with_reserved_bytes(16000),
            &chain_backend(),
        )
        .unwrap();

        let report = SignatureVerifier::new()
            .with_trusted_root(other_root)
            .verify_document(&signed.bytes)
            .unwrap();
        assert!(report.is_signed);
        assert!(!report.is_valid);
        assert_eq!(report.status, VerificationStatus::SignedUnverifiable);
        assert!(report.latest().unwrap().messages.iter().any(|m| m.contains("not trusted")));
    }
}
