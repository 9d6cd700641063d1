//! Output formatting for `tokenwatch scan`
//!
//! Handles:
//! - Human-readable listing of devices, tokens and certificates
//! - JSON output of the same data
//! - Summary counts

use anyhow::Result;
use serde::Serialize;
use std::fmt::Write as _;

use crate::models::InspectedToken;
use crate::monitor::DeviceSurvey;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOutput {
    pub devices: Vec<DeviceOutput>,
    pub summary: ScanSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceOutput {
    pub device: String,
    pub vendor: String,
    pub product: String,
    pub tokens: Vec<TokenOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorOutput>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenOutput {
    pub serial_number: String,
    pub label: String,
    pub manufacturer: String,
    pub model: String,
    pub certificates: Vec<CertificateOutput>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateOutput {
    pub id: String,
    pub subject: String,
    pub issuer: String,
    pub algorithm: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorOutput {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub candidates: usize,
    pub tokens: usize,
    pub certificates: usize,
    pub failed: usize,
}

impl ScanOutput {
    pub fn from_surveys(surveys: Vec<DeviceSurvey>) -> Self {
        let mut summary = ScanSummary {
            candidates: surveys.len(),
            ..ScanSummary::default()
        };

        let devices = surveys
            .into_iter()
            .map(|survey| {
                let (tokens, error) = match survey.result {
                    Ok(tokens) => (tokens.into_iter().map(token_output).collect::<Vec<_>>(), None),
                    Err(e) => {
                        summary.failed += 1;
                        let error = ErrorOutput {
                            kind: e.kind().to_string(),
                            message: e.to_string(),
                        };
                        (Vec::new(), Some(error))
                    }
                };
                summary.tokens += tokens.len();
                summary.certificates += tokens.iter().map(|t| t.certificates.len()).sum::<usize>();

                DeviceOutput {
                    device: survey.device.key(),
                    vendor: survey.device.vendor_code,
                    product: survey.device.product_code,
                    tokens,
                    error,
                }
            })
            .collect();

        Self { devices, summary }
    }
}

fn token_output(inspected: InspectedToken) -> TokenOutput {
    TokenOutput {
        serial_number: inspected.token.serial_number,
        label: inspected.token.label,
        manufacturer: inspected.token.manufacturer,
        model: inspected.token.model,
        certificates: inspected
            .certificates
            .into_iter()
            .map(|cert| CertificateOutput {
                id: cert.certificate_id,
                subject: cert.subject,
                issuer: cert.issuer,
                algorithm: cert.algorithm,
            })
            .collect(),
    }
}

/// Render the human-readable listing
pub fn render_human(output: &ScanOutput) -> String {
    let mut text = String::new();

    if output.devices.is_empty() {
        text.push_str("No token devices found.\n");
    }

    for device in &output.devices {
        let _ = writeln!(text, "{}:", device.device);
        if let Some(error) = &device.error {
            let _ = writeln!(text, "  error ({}): {}", error.kind, error.message);
        }
        for token in &device.tokens {
            let _ = writeln!(
                text,
                "  token {} \"{}\" ({} {})",
                token.serial_number, token.label, token.manufacturer, token.model
            );
            for cert in &token.certificates {
                let _ = writeln!(text, "    certificate {} [{}]", cert.id, cert.algorithm);
                let _ = writeln!(text, "      subject: {}", cert.subject);
                let _ = writeln!(text, "      issuer:  {}", cert.issuer);
            }
        }
        text.push('\n');
    }

    let summary = &output.summary;
    text.push_str("Scan Summary:\n");
    let _ = writeln!(text, "  Candidates: {} devices", summary.candidates);
    let _ = writeln!(text, "  Tokens: {}", summary.tokens);
    let _ = writeln!(text, "  Certificates: {}", summary.certificates);
    if summary.failed > 0 {
        let _ = writeln!(text, "  Failed: {} devices", summary.failed);
    }
    text
}

/// Format output in human-readable format
pub fn format_human(output: &ScanOutput) -> Result<()> {
    print!("{}", render_human(output));
    Ok(())
}

/// Format output as pretty-printed JSON
pub fn format_json(output: &ScanOutput) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(output)?);
    Ok(())
}
