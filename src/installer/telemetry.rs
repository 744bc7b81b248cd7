//! Telemetry submission client.
//!
//! Consent-gated, anonymized, best-effort: no failure mode of this module may
//! affect the installation outcome. The payload carries no PII; disk sizes
//! are bucketed and CPU models reduced to a family token.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::installer::globalstorage::{self as gs_keys, GlobalStorage};

pub const SCHEMA_VERSION: &str = "1.0.0";
const USER_AGENT: &str = "zforge-telemetry/1.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payload {
    pub schema_version: String,
    /// Random per-submission UUID; deliberately not a machine identifier.
    pub install_id: String,
    pub iso_version: String,
    pub installer_version: String,
    pub status: String,
    pub hardware: Hardware,
    pub choices: Choices,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Hardware {
    pub kernel: String,
    pub cpu_family: String,
    pub ram_mib: u64,
    pub disks: Vec<Disk>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Disk {
    /// Transport type: nvme, sata, sas, usb.
    pub r#type: String,
    pub size_bucket: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Choices {
    pub locale: String,
    pub keyboard: String,
    pub timezone: String,
    pub raid_type: String,
    pub encryption: bool,
    pub hardening_profile: String,
}

/// Round a disk size down to a coarse bucket so exact capacities never leave
/// the machine.
pub fn size_bucket(bytes: u64) -> &'static str {
    const GIB: u64 = 1 << 30;
    const TIB: u64 = 1 << 40;
    if bytes <= 128 * GIB {
        "<=128GiB"
    } else if bytes <= 512 * GIB {
        "<=512GiB"
    } else if bytes <= 2 * TIB {
        "<=2TiB"
    } else if bytes <= 8 * TIB {
        "<=8TiB"
    } else {
        ">8TiB"
    }
}

/// First token of the CPU model string: vendor family without the exact SKU.
pub fn cpu_family(model_name: &str) -> String {
    model_name
        .split_whitespace()
        .next()
        .unwrap_or("unknown")
        .to_string()
}

/// Generate a random v4 UUID from the kernel entropy pool.
pub fn random_install_id() -> Result<String> {
    use std::io::Read;
    let mut bytes = [0u8; 16];
    std::fs::File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut bytes))
        .context("reading /dev/urandom")?;
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Ok(format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3],
        bytes[4], bytes[5],
        bytes[6], bytes[7],
        bytes[8], bytes[9],
        bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
    ))
}

/// Assemble the payload from globalstorage and collected hardware facts.
pub fn build_payload(gs: &GlobalStorage, hardware: Hardware, status: &str) -> Result<Payload> {
    Ok(Payload {
        schema_version: SCHEMA_VERSION.to_string(),
        install_id: random_install_id()?,
        iso_version: gs
            .str_value(gs_keys::K_ISO_VERSION)
            .unwrap_or("unknown")
            .to_string(),
        installer_version: env!("CARGO_PKG_VERSION").to_string(),
        status: status.to_string(),
        hardware,
        choices: Choices {
            locale: gs.str_value("locale").unwrap_or("unknown").to_string(),
            keyboard: gs.str_value("keyboard_layout").unwrap_or("unknown").to_string(),
            timezone: gs.str_value("timezone").unwrap_or("unknown").to_string(),
            raid_type: gs
                .str_value(gs_keys::K_NEW_POOL_RAID)
                .unwrap_or("unknown")
                .to_string(),
            encryption: gs.bool_value(gs_keys::K_ENCRYPTION_ENABLED),
            hardening_profile: gs
                .str_value(gs_keys::K_HARDENING_PROFILE)
                .unwrap_or("none")
                .to_string(),
        },
    })
}

/// Submission outcome; informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Submitted,
    SkippedNoConsent,
    SkippedNoEndpoint,
    Failed,
}

/// Run the telemetry job. Never returns an error: failures are logged and
/// swallowed so the install result is unaffected.
pub fn run(gs: &GlobalStorage, hardware: Hardware, status: &str) -> Outcome {
    if !gs.bool_value(gs_keys::K_TELEMETRY_CONSENT) {
        log::info!("telemetry skipped: no consent");
        return Outcome::SkippedNoConsent;
    }

    let endpoint = match gs.str_value(gs_keys::K_TELEMETRY_ENDPOINT) {
        Some(url) if url.starts_with("https://") || url.starts_with("http://") => url.to_string(),
        Some(other) => {
            log::warn!("telemetry skipped: invalid endpoint '{other}'");
            return Outcome::SkippedNoEndpoint;
        }
        None => {
            log::info!("telemetry skipped: no endpoint configured");
            return Outcome::SkippedNoEndpoint;
        }
    };

    let payload = match build_payload(gs, hardware, status) {
        Ok(payload) => payload,
        Err(e) => {
            log::warn!("telemetry payload assembly failed: {e:#}");
            return Outcome::Failed;
        }
    };

    match submit(&endpoint, &payload) {
        Ok(()) => {
            log::info!("telemetry submitted to {endpoint}");
            Outcome::Submitted
        }
        Err(e) => {
            log::warn!("telemetry submission failed (ignored): {e:#}");
            Outcome::Failed
        }
    }
}

/// Best-effort HTTPS POST with a 10 s timeout.
fn submit(endpoint: &str, payload: &Payload) -> Result<()> {
    let agent = ureq::AgentBuilder::new()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(USER_AGENT)
        .build();
    let body = serde_json::to_string(payload).context("serializing telemetry payload")?;
    let response = agent
        .post(endpoint)
        .set("Content-Type", "application/json")
        .send_string(&body)
        .context("POSTing telemetry payload")?;
    anyhow::ensure!(
        response.status() < 300,
        "telemetry endpoint returned {}",
        response.status()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_size_buckets() {
        assert_eq!(size_bucket(120 << 30), "<=128GiB");
        assert_eq!(size_bucket(256 << 30), "<=512GiB");
        assert_eq!(size_bucket(1 << 40), "<=2TiB");
        assert_eq!(size_bucket(4 << 40), "<=8TiB");
        assert_eq!(size_bucket(16 << 40), ">8TiB");
    }

    #[test]
    fn test_cpu_family_drops_sku() {
        assert_eq!(cpu_family("Intel(R) Xeon(R) CPU E5-2680 v2 @ 2.80GHz"), "Intel(R)");
        assert_eq!(cpu_family(""), "unknown");
    }

    #[test]
    fn test_install_id_is_uuid_shaped() {
        let id = random_install_id().unwrap();
        assert_eq!(id.len(), 36);
        assert_eq!(id.matches('-').count(), 4);
        assert_eq!(&id[14..15], "4");

        // Two ids must differ; this is a random identifier, not a machine id.
        assert_ne!(id, random_install_id().unwrap());
    }

    #[test]
    fn test_no_consent_skips_without_error() {
        let gs = GlobalStorage::new();
        let outcome = run(&gs, Hardware::default(), "success");
        assert_eq!(outcome, Outcome::SkippedNoConsent);
    }

    #[test]
    fn test_consent_without_endpoint_skips() {
        let mut gs = GlobalStorage::new();
        gs.insert(gs_keys::K_TELEMETRY_CONSENT, json!(true));
        let outcome = run(&gs, Hardware::default(), "success");
        assert_eq!(outcome, Outcome::SkippedNoEndpoint);
    }

    #[test]
    fn test_invalid_endpoint_scheme_skips() {
        let mut gs = GlobalStorage::new();
        gs.insert(gs_keys::K_TELEMETRY_CONSENT, json!(true));
        gs.insert(gs_keys::K_TELEMETRY_ENDPOINT, json!("ftp://example.org"));
        let outcome = run(&gs, Hardware::default(), "success");
        assert_eq!(outcome, Outcome::SkippedNoEndpoint);
    }

    #[test]
    fn test_payload_shape_has_no_raw_hardware() {
        let mut gs = GlobalStorage::new();
        gs.insert(gs_keys::K_ISO_VERSION, json!("3.0"));
        gs.insert(gs_keys::K_NEW_POOL_RAID, json!("mirror"));
        gs.insert(gs_keys::K_ENCRYPTION_ENABLED, json!(true));
        gs.insert(gs_keys::K_HARDENING_PROFILE, json!("server"));

        let hardware = Hardware {
            kernel: "6.8.12-pve".to_string(),
            cpu_family: cpu_family("AMD EPYC 7302P 16-Core Processor"),
            ram_mib: 65536,
            disks: vec![Disk {
                r#type: "nvme".to_string(),
                size_bucket: size_bucket(1 << 40).to_string(),
            }],
        };
        let payload = build_payload(&gs, hardware, "success").unwrap();

        assert_eq!(payload.schema_version, SCHEMA_VERSION);
        assert_eq!(payload.iso_version, "3.0");
        assert_eq!(payload.choices.raid_type, "mirror");
        assert!(payload.choices.encryption);
        assert_eq!(payload.hardware.disks[0].size_bucket, "<=2TiB");

        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("7302P"), "exact CPU SKU must not leak");
    }
}
