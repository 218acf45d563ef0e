//! Per-VM hardware identifiers.
//!
//! macOS guests need a unique machine identifier: a binary property list
//! holding a random ECID, base64-encoded.

use crate::error::{Error, Result};
use base64::Engine;
use rand::Rng;
use std::io::Write;
use std::process::{Command, Stdio};

/// Generates opaque per-VM identifiers.
pub trait MachineIdGenerator: Send + Sync {
    /// Produce a new identifier.
    fn generate(&self) -> Result<String>;
}

/// Upper bound (exclusive) for generated ECIDs.
const ECID_MAX: u64 = (1u64 << 63) - 1;

/// ECID property-list generator.
#[derive(Debug, Clone)]
pub struct EcidGenerator {
    program: String,
    args: Vec<String>,
}

impl Default for EcidGenerator {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            Self::with_converter("plutil", ["-convert", "binary1", "-o", "-", "-"])
        } else {
            Self::with_converter("plistutil", ["-i", "-", "-o", "-", "-f", "bin"])
        }
    }
}

impl EcidGenerator {
    /// Use a custom XML-to-binary plist converter that reads stdin and
    /// writes stdout.
    pub fn with_converter<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Random ECID in `[1, 2^63 - 1)`.
    pub fn random_ecid() -> u64 {
        rand::rngs::OsRng.gen_range(1..ECID_MAX)
    }

    fn convert(&self, xml: &str) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::MachineId(format!("failed to run {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(xml.as_bytes())
                .map_err(|e| Error::MachineId(format!("write to {}: {}", self.program, e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| Error::MachineId(format!("wait for {}: {}", self.program, e)))?;
        if !output.status.success() {
            return Err(Error::MachineId(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(Error::MachineId(format!("{} produced no output", self.program)));
        }
        Ok(output.stdout)
    }
}

/// XML property list holding `ecid`.
pub fn render_plist(ecid: u64) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>ECID</key>
    <integer>{}</integer>
</dict>
</plist>
"#,
        ecid
    )
}

impl MachineIdGenerator for EcidGenerator {
    fn generate(&self) -> Result<String> {
        let ecid = Self::random_ecid();
        let binary = self.convert(&render_plist(ecid))?;
        tracing::debug!(bytes = binary.len(), "generated machine identifier");
        Ok(base64::engine::general_purpose::STANDARD.encode(binary))
    }
}
