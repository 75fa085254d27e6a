//! Sign and verify PDFs from the command line.
//!
//! Usage:
//!   pdf_signflow prepare <input.pdf> <output.pdf> [--reserve BYTES] [--name NAME]
//!                        [--reason TEXT] [--visible PAGE,X,Y,W,H]
//!   pdf_signflow digest <prepared.pdf> [--algorithm sha256|sha384|sha512]
//!   pdf_signflow sign-local <input.pdf> <output.pdf> --p12 FILE [--password PW]
//!                        [--name NAME] [--reason TEXT] [--location TEXT]
//!                        [--tsa URL] [--reserve BYTES] [--visible PAGE,X,Y,W,H]
//!   pdf_signflow verify <signed.pdf> [--trust ROOT.der]
//!
//! Environment:
//!   PDF_SIGNFLOW_CONFIG         JSON engine configuration (signing defaults, TSA)
//!   PDF_SIGNFLOW_P12            default PKCS#12 file for sign-local
//!   PDF_SIGNFLOW_P12_PASSWORD   its password (preferred over --password)
//!   PDF_SIGNFLOW_TSA_URL        timestamp authority for sign-local
//!   PDF_SIGNFLOW_RESERVED_BYTES placeholder size
//!   RUST_LOG                    log filter

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use pdf_signflow::backend::LocalP12Backend;
use pdf_signflow::pipeline::sign_document_with;
use pdf_signflow::signatures::{
    cross_check, PlaceholderOptions, PlaceholderPreparer, Rect, SignatureVerifier, SignerMetadata,
    TsaClient, VerificationStatus, WidgetAppearance,
};
use pdf_signflow::{EngineConfig, Error, Result, TsaConfig};

const USAGE: &str = "usage: pdf_signflow <prepare|digest|sign-local|verify> <file> [output] [options]";

struct Args {
    command: String,
    positional: Vec<String>,
    options: HashMap<String, String>,
}

impl Args {
    fn from_env() -> Option<Self> {
        let mut args = std::env::args().skip(1);
        let command = args.next()?;
        let rest: Vec<String> = args.collect();

        let mut positional = Vec::new();
        let mut options = HashMap::new();
        let mut i = 0;
        while i < rest.len() {
            if let Some(name) = rest[i].strip_prefix("--") {
                i += 1;
                if i < rest.len() {
                    options.insert(name.to_string(), rest[i].clone());
                }
            } else {
                positional.push(rest[i].clone());
            }
            i += 1;
        }

        Some(Self {
            command,
            positional,
            options,
        })
    }

    fn input(&self, index: usize, what: &str) -> Result<PathBuf> {
        self.positional
            .get(index)
            .map(PathBuf::from)
            .ok_or_else(|| Error::Config(format!("missing {} path\n{}", what, USAGE)))
    }

    /// Option value, falling back to an environment variable.
    fn get(&self, name: &str, env: Option<&str>) -> Option<String> {
        self.options
            .get(name)
            .cloned()
            .or_else(|| env.and_then(|var| std::env::var(var).ok()))
    }
}

fn load_config() -> Result<EngineConfig> {
    let config = match std::env::var("PDF_SIGNFLOW_CONFIG") {
        Ok(path) => EngineConfig::from_json(&fs::read_to_string(path)?)?,
        Err(_) => EngineConfig::new(),
    };
    config.validate()?;
    Ok(config)
}

fn parse_visible(value: &str) -> Result<WidgetAppearance> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    let invalid = || Error::Config(format!("--visible expects PAGE,X,Y,W,H, got '{}'", value));
    if parts.len() != 5 {
        return Err(invalid());
    }
    let page: usize = parts[0].parse().map_err(|_| invalid())?;
    let mut numbers = [0f32; 4];
    for (slot, part) in numbers.iter_mut().zip(&parts[1..]) {
        *slot = part.parse().map_err(|_| invalid())?;
    }
    Ok(WidgetAppearance::new(
        page,
        Rect::new(numbers[0], numbers[1], numbers[2], numbers[3]),
    ))
}

fn placeholder_options(
    args: &Args,
    config: &EngineConfig,
    default_name: &str,
) -> Result<PlaceholderOptions> {
    let name = args
        .get("name", None)
        .unwrap_or_else(|| default_name.to_string());
    let mut signer = SignerMetadata::new(name);
    signer.reason = args.get("reason", None);
    signer.location = args.get("location", None);
    signer.contact_info = args.get("contact", None);
    signer.organization = args.get("organization", None);

    let reserved = match args.get("reserve", Some("PDF_SIGNFLOW_RESERVED_BYTES")) {
        Some(value) => value
            .parse()
            .map_err(|_| Error::Config(format!("invalid reservation '{}'", value)))?,
        None => config.signing.reserved_bytes,
    };

    let mut options = PlaceholderOptions::new(signer)
        .with_reserved_bytes(reserved)
        .with_field_name_prefix(config.signing.field_name_prefix.clone());
    if let Some(visible) = args.get("visible", None) {
        options = options.with_appearance(parse_visible(&visible)?);
    }
    Ok(options)
}

fn prepare(args: &Args, config: &EngineConfig) -> Result<()> {
    let input = args.input(0, "input")?;
    let output = args.input(1, "output")?;
    let options = placeholder_options(args, config, "Signer")?;

    let prepared = PlaceholderPreparer::new(options).prepare(&fs::read(&input)?)?;
    fs::write(&output, prepared.bytes())?;
    println!(
        "{}: field {}, {} bytes reserved, ByteRange {:?}",
        output.display(),
        prepared.field_name(),
        prepared.reserved_bytes(),
        prepared.byte_range().to_array()
    );
    Ok(())
}

fn digest(args: &Args, config: &EngineConfig) -> Result<()> {
    let input = args.input(0, "input")?;
    let algorithm = match args.get("algorithm", None) {
        Some(name) => serde_json::from_value(serde_json::Value::String(name.to_lowercase()))
            .map_err(|_| Error::Config(format!("unknown digest algorithm '{}'", name)))?,
        None => config.signing.digest_algorithm,
    };

    let digest = cross_check(&fs::read(&input)?, algorithm)?;
    println!("{} {}", algorithm, digest.hex());
    Ok(())
}

fn sign_local(args: &Args, config: &EngineConfig) -> Result<()> {
    let input = args.input(0, "input")?;
    let output = args.input(1, "output")?;
    if input == output {
        return Err(Error::Config("refusing to sign in place; choose a different output".into()));
    }

    let p12 = args
        .get("p12", Some("PDF_SIGNFLOW_P12"))
        .ok_or_else(|| Error::Config("--p12 or PDF_SIGNFLOW_P12 is required".into()))?;
    let password = std::env::var("PDF_SIGNFLOW_P12_PASSWORD")
        .ok()
        .or_else(|| args.get("password", None))
        .unwrap_or_default();
    let backend = LocalP12Backend::open(&p12, &password)?;
    let default_name = backend
        .credentials()
        .summary()
        .map(|s| s.subject)
        .unwrap_or_else(|_| "Signer".to_string());

    let options = placeholder_options(args, config, &default_name)?;
    let tsa = match args.get("tsa", Some("PDF_SIGNFLOW_TSA_URL")) {
        Some(url) => Some(TsaClient::new(TsaConfig::new(url))?),
        None => config.tsa.clone().map(TsaClient::new).transpose()?,
    };

    let signed = sign_document_with(
        &fs::read(&input)?,
        &options,
        config.signing.digest_algorithm,
        &backend,
        tsa.as_ref(),
    )?;
    fs::write(&output, &signed.bytes)?;
    println!(
        "{}: signed field {} ({} digest {}{})",
        output.display(),
        signed.field_name,
        signed.digest.algorithm,
        signed.digest.hex(),
        if signed.timestamped { ", timestamped" } else { "" }
    );
    Ok(())
}

fn verify(args: &Args) -> Result<bool> {
    let input = args.input(0, "input")?;
    let mut verifier = SignatureVerifier::new();
    if let Some(root) = args.get("trust", None) {
        verifier.add_trusted_root(fs::read(root)?);
    }

    let report = verifier.verify_document(&fs::read(&input)?)?;
    println!("{}: {:?}", input.display(), report.status);
    println!(
        "  signed: {}  valid: {}  signatures: {}",
        report.is_signed, report.is_valid, report.signature_count
    );
    for (i, check) in report.signatures.iter().enumerate() {
        println!(
            "  #{} {:?} ByteRange {:?}{}",
            i + 1,
            check.status,
            check.byte_range.to_array(),
            if check.covers_whole_document { "" } else { " (partial)" }
        );
        if let Some(subject) = &check.signer_subject {
            println!("     signer: {}", subject);
        }
        if let Some(name) = &check.info.signer_name {
            println!("     name: {}", name);
        }
        if let Some(at) = check.signing_time {
            println!("     signed at: {}", at.to_rfc3339());
        }
        if check.mock {
            println!("     MOCK signature (not legally meaningful)");
        }
        for message in &check.messages {
            println!("     - {}", message);
        }
    }
    for message in &report.messages {
        println!("  - {}", message);
    }
    Ok(report.status == VerificationStatus::Verified)
}

fn run(args: &Args) -> Result<bool> {
    let config = load_config()?;
    match args.command.as_str() {
        "prepare" => prepare(args, &config).map(|_| true),
        "digest" => digest(args, &config).map(|_| true),
        "sign-local" => sign_local(args, &config).map(|_| true),
        "verify" => verify(args),
        other => Err(Error::Config(format!("unknown command '{}'\n{}", other, USAGE))),
    }
}

fn main() -> ExitCode {
    env_logger::init();

    let Some(args) = Args::from_env() else {
        eprintln!("{}", USAGE);
        return ExitCode::from(2);
    };

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(2)
        },
    }
}
