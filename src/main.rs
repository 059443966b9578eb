mod api;
mod console;

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use triage_backend::agent::prompt::{Consciousness, Vitals};
use triage_backend::context::encode_base64;
use triage_backend::server::TriageRequest;

use api::{ApiClient, ConsoleEvent};
use console::Console;

/// Submit one consultation to the triage backend and follow it live.
#[derive(Parser, Debug)]
#[command(name = "triage", about = "Emergency triage console")]
struct Cli {
    /// Voice recording to transcribe
    #[arg(long)]
    audio: Option<PathBuf>,
    /// Chest X-ray to analyse
    #[arg(long)]
    image: Option<PathBuf>,
    /// Heart rate (bpm)
    #[arg(long)]
    hr: Option<u32>,
    /// Systolic blood pressure (mmHg)
    #[arg(long)]
    sbp: Option<u32>,
    /// Respiratory rate (breaths/min)
    #[arg(long)]
    rr: Option<u32>,
    /// Temperature (°C)
    #[arg(long)]
    temp: Option<f32>,
    /// Oxygen saturation (%)
    #[arg(long)]
    spo2: Option<u32>,
    /// AVPU level: A, V, P or U
    #[arg(long, value_parser = parse_avpu)]
    avpu: Option<Consciousness>,
    /// Patient is on supplemental oxygen
    #[arg(long)]
    oxygen: bool,
    /// Free-text presentation
    notes: Vec<String>,
}

impl Cli {
    fn vitals(&self) -> Option<Vitals> {
        let vitals = Vitals {
            heart_rate: self.hr,
            systolic_bp: self.sbp,
            respiratory_rate: self.rr,
            temperature: self.temp,
            spo2: self.spo2,
            consciousness: self.avpu,
            on_oxygen: self.oxygen.then_some(true),
        };
        (!vitals.is_empty()).then_some(vitals)
    }

    fn into_request(self) -> Result<TriageRequest> {
        let audio_base64 = read_attachment(self.audio.as_ref())?;
        let image_base64 = read_attachment(self.image.as_ref())?;
        Ok(TriageRequest {
            vitals: self.vitals(),
            input: self.notes.join(" "),
            history: Vec::new(),
            audio_base64,
            image_base64,
        })
    }
}

fn parse_avpu(raw: &str) -> Result<Consciousness, String> {
    Consciousness::parse(raw).ok_or_else(|| format!("expected A, V, P or U, got {:?}", raw))
}

fn read_attachment(path: Option<&PathBuf>) -> Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    tracing::debug!("Attached {} ({} bytes)", path.display(), bytes.len());
    Ok(Some(encode_base64(&bytes)))
}

async fn run(cli: Cli) -> Result<i32> {
    let request = cli.into_request()?;
    let client = ApiClient::from_env();

    tracing::info!("Backend API: {}", client.base_url());
    if !client.has_token() {
        tracing::warn!(
            "TRIAGE_BACKEND_TOKEN is unset/empty; requests will fail unless backend auth mode is disabled"
        );
    }
    match client.health().await {
        Ok(true) => {}
        Ok(false) => tracing::warn!("Backend health check did not report ok"),
        Err(error) => tracing::warn!("Backend health check failed: {:#}", error),
    }

    let (tx, rx) = flume::unbounded::<ConsoleEvent>();
    let stream = tokio::spawn(async move { client.stream_triage(&request, &tx).await });

    let color = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    let mut console = Console::new(color);
    while let Ok(event) = rx.recv_async().await {
        println!("{}", console.render(&event));
    }

    stream
        .await
        .context("Triage stream task failed")?
        .context("Triage stream failed")?;
    Ok(console.exit_code())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,triage=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("Failed to start async runtime: {}", error);
            std::process::exit(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("error: {:#}", error);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vitals_are_collected_from_flags() {
        let cli = Cli::parse_from([
            "triage", "--hr", "128", "--temp", "38.5", "--avpu", "v", "--oxygen", "cough", "fever",
        ]);
        let request = cli.into_request().unwrap();
        assert_eq!(request.input, "cough fever");
        let vitals = request.vitals.unwrap();
        assert_eq!(vitals.heart_rate, Some(128));
        assert_eq!(vitals.consciousness, Some(Consciousness::Voice));
        assert_eq!(vitals.on_oxygen, Some(true));
        assert!(vitals.spo2.is_none());
    }

    #[test]
    fn no_vitals_flags_means_no_vitals() {
        let cli = Cli::parse_from(["triage", "headache"]);
        assert!(cli.vitals().is_none());
    }

    #[test]
    fn rejects_unknown_avpu() {
        assert!(Cli::try_parse_from(["triage", "--avpu", "X", "notes"]).is_err());
    }

    #[test]
    fn attachments_are_base64_encoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice.wav");
        std::fs::write(&path, b"hello world").unwrap();
        let cli = Cli::parse_from(["triage", "--audio", path.to_str().unwrap()]);
        let request = cli.into_request().unwrap();
        assert_eq!(request.audio_base64.as_deref(), Some("aGVsbG8gd29ybGQ="));
        assert!(request.image_base64.is_none());
    }

    #[test]
    fn missing_attachment_is_an_error() {
        let cli = Cli::parse_from(["triage", "--image", "/nonexistent/film.jpg", "x"]);
        assert!(cli.into_request().is_err());
    }
}
