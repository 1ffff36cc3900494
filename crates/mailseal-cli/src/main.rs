//! MailSeal - S/MIME protection command line

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use mailseal_common::config::{Config, LoggingConfig, SmtpConfig};
use mailseal_common::types::{EmailAddress, ProtectionFlags, TransferEncoding};
use mailseal_core::smime::mime::Entity;
use mailseal_core::smime::reader::{self, Layer};
use mailseal_core::{
    ComposedMessage, ProtectedBody, ProtectionMode, ProtectionPipeline, ProtectionRequest,
    SigningIdentity,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Debug, Parser)]
#[command(name = "mailseal", version, about = "Sign and encrypt outbound mail with S/MIME")]
struct Cli {
    /// Configuration file (defaults to ./mailseal.toml, then /etc/mailseal/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Protect a message body and write or relay the result
    Protect(ProtectArgs),
    /// Decrypt and verify a protected message
    Open(OpenArgs),
}

#[derive(Debug, clap::Args)]
struct ProtectArgs {
    /// MIME entity to protect; a file without headers is sent as text/plain
    #[arg(long)]
    body: PathBuf,

    #[arg(long)]
    from: String,

    #[arg(long, num_args = 1..)]
    to: Vec<String>,

    #[arg(long, num_args = 1..)]
    cc: Vec<String>,

    #[arg(long, num_args = 1..)]
    bcc: Vec<String>,

    #[arg(long)]
    subject: Option<String>,

    #[arg(long, value_enum, default_value_t = ModeArg::None)]
    mode: ModeArg,

    /// Write the message here instead of stdout
    #[arg(long, conflicts_with = "send")]
    out: Option<PathBuf>,

    /// Relay through the configured SMTP server
    #[arg(long)]
    send: bool,
}

#[derive(Debug, clap::Args)]
struct OpenArgs {
    /// Complete message, headers included
    #[arg(long)]
    message: PathBuf,

    /// Recipient certificate (PEM)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// Recipient private key (PEM)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Write the innermost content here instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    None,
    Signed,
    Encrypted,
    SignedEncrypted,
    Triple,
}

impl ModeArg {
    fn flags(self) -> ProtectionFlags {
        match self {
            ModeArg::None => ProtectionFlags::empty(),
            ModeArg::Signed => ProtectionFlags::SIGNED,
            ModeArg::Encrypted => ProtectionFlags::ENVELOPE_ENCRYPTED,
            ModeArg::SignedEncrypted => {
                ProtectionFlags::SIGNED | ProtectionFlags::ENVELOPE_ENCRYPTED
            }
            ModeArg::Triple => ProtectionFlags::TRIPLE_WRAPPED,
        }
    }
}

/// Body file split into the entity to protect and its unprotected rendition
#[derive(Debug, PartialEq, Eq)]
struct Content {
    entity: Vec<u8>,
    native_type: String,
    native_encoding: TransferEncoding,
    native_body: Vec<u8>,
}

impl Content {
    fn from_bytes(raw: Vec<u8>) -> Result<Self> {
        if let Ok(entity) = Entity::parse(&raw) {
            if entity.has_content_type() {
                let native_encoding = if entity.is_base64() {
                    TransferEncoding::Base64
                } else {
                    TransferEncoding::SevenBit
                };
                return Ok(Self {
                    native_type: entity.content_type().to_string(),
                    native_encoding,
                    native_body: entity.decoded_body(),
                    entity: raw.clone(),
                });
            }
        }

        let mut entity = format!("Content-Type: {}\r\n\r\n", DEFAULT_CONTENT_TYPE).into_bytes();
        entity.extend_from_slice(&raw);
        Ok(Self {
            entity,
            native_type: DEFAULT_CONTENT_TYPE.to_string(),
            native_encoding: TransferEncoding::SevenBit,
            native_body: raw,
        })
    }

    /// Unprotected output uses the entity's own headers at the top level
    fn unprotected(&self) -> ProtectedBody {
        ProtectedBody {
            bytes: self.native_body.clone(),
            content_type: self.native_type.clone(),
            transfer_encoding: self.native_encoding,
            mode: ProtectionMode::None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load_or_default()?,
    };

    init_logging(&config.logging);

    match cli.command {
        Command::Protect(args) => protect(config, args).await,
        Command::Open(args) => open(args).await,
    }
}

async fn protect(config: Config, args: ProtectArgs) -> Result<()> {
    let raw = std::fs::read(&args.body)
        .with_context(|| format!("Failed to read {}", args.body.display()))?;
    let content = Content::from_bytes(raw)?;

    let message = ComposedMessage::new(args.from.clone())
        .to(args.to.clone())
        .cc(args.cc.clone())
        .bcc(args.bcc.clone());
    let message = match &args.subject {
        Some(subject) => message.subject(subject.clone()),
        None => message,
    };

    let smime = config.smime.clone();
    let flags = args.mode.flags();
    let (to, cc, bcc) = (args.to.clone(), args.cc.clone(), args.bcc.clone());

    // RSA and CMS work stays off the async runtime
    let body = tokio::task::spawn_blocking(move || -> Result<ProtectedBody> {
        let pipeline = ProtectionPipeline::from_config(&smime)?;
        let request = ProtectionRequest::new(&content.entity)
            .to(&to)
            .cc(&cc)
            .bcc(&bcc)
            .flags(flags)
            .policy(smime.policy_flags())
            .native(content.native_type.clone(), content.native_encoding);
        let body = pipeline.protect(&request)?;
        Ok(match body.mode {
            ProtectionMode::None => content.unprotected(),
            _ => body,
        })
    })
    .await??;

    info!(
        message_id = %message.message_id(),
        mode = %body.mode,
        "Message composed"
    );
    let rendered = message.render(&body);

    if args.send {
        send(&config.smtp, &message, rendered).await
    } else {
        write_output(args.out.as_deref(), &rendered)
    }
}

async fn open(args: OpenArgs) -> Result<()> {
    let message = std::fs::read(&args.message)
        .with_context(|| format!("Failed to read {}", args.message.display()))?;

    let identities = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => vec![SigningIdentity::from_pem_files(cert, key)?],
        _ => Vec::new(),
    };

    let opened =
        tokio::task::spawn_blocking(move || reader::open_message(&message, &identities)).await??;

    for (depth, layer) in opened.layers.iter().enumerate() {
        match layer {
            Layer::Signed(info) => eprintln!(
                "{}: signed by {} ({} certificates{})",
                depth,
                info.signer.subject(),
                info.certificates,
                info.signing_time
                    .map(|t| format!(", signed at {}", t.to_rfc3339()))
                    .unwrap_or_default()
            ),
            Layer::Enveloped { recipient } => {
                eprintln!("{}: encrypted for {}", depth, recipient.subject())
            }
        }
    }
    if opened.layers.is_empty() {
        eprintln!("message carries no S/MIME protection");
    }

    write_output(args.out.as_deref(), &opened.content)
}

fn write_output(path: Option<&Path>, data: &[u8]) -> Result<()> {
    match path {
        Some(path) => {
            std::fs::write(path, data)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), bytes = data.len(), "Message written");
        }
        None => {
            use std::io::Write;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(data)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn to_lettre(address: &EmailAddress) -> Result<Address> {
    Address::new(&address.local, &address.domain)
        .with_context(|| format!("Invalid address: {}", address))
}

async fn send(smtp: &SmtpConfig, message: &ComposedMessage, rendered: Vec<u8>) -> Result<()> {
    let from = message
        .from_address()
        .context("Sender address is not a valid mailbox")?;
    let recipients = message
        .envelope_recipients()
        .iter()
        .map(to_lettre)
        .collect::<Result<Vec<_>>>()?;
    if recipients.is_empty() {
        bail!("No envelope recipients");
    }
    let envelope = Envelope::new(Some(to_lettre(&from)?), recipients)?;

    let mut transport = if smtp.starttls {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)?
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
    }
    .port(smtp.port);

    if let (Some(username), Some(password)) = (&smtp.username, &smtp.password) {
        transport = transport.credentials(Credentials::new(username.clone(), password.clone()));
    }

    let mailer = transport
        .timeout(Some(Duration::from_secs(smtp.timeout_secs)))
        .build();

    let response = mailer
        .send_raw(&envelope, &rendered)
        .await
        .with_context(|| format!("Relay through {}:{} failed", smtp.host, smtp.port))?;
    debug!("SMTP response: {:?}", response);
    info!(
        message_id = %message.message_id(),
        relay = %smtp.host,
        "Message relayed"
    );
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},mailseal=debug", config.level)));

    // stdout carries the message itself
    if config.format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init();
    }
}
