//! Build specification loading and validation.
//!
//! The YAML build spec (plus optional per-server hardware overlays) is parsed,
//! deep-merged, defaulted and validated into a [`BuildPlan`]. Unknown
//! top-level sections are tolerated with a warning; unknown keys inside the
//! enumerated sections (`builder_config`, `zfs_config`, `bootloader_config`,
//! `dracut_config`) are fatal, as are unrecognized enumerated values.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::errors::BuildErrorKind;

/// Canonical pipeline order. Also the default when the spec omits `modules`.
pub const DEFAULT_MODULE_ORDER: &[&str] = &[
    "WorkspaceSetup",
    "Debootstrap",
    "KernelAcquisition",
    "ZFSBuild",
    "DracutConfig",
    "ProxmoxIntegration",
    "BootloaderSetup",
    "LiveEnvironment",
    "CalamaresIntegration",
    "SecurityHardening",
    "EncryptionSupport",
    "ISOGeneration",
];

// =============================================================================
// Enumerated value types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebianRelease {
    Bullseye,
    Bookworm,
    Trixie,
}

impl DebianRelease {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebianRelease::Bullseye => "bullseye",
            DebianRelease::Bookworm => "bookworm",
            DebianRelease::Trixie => "trixie",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidType {
    Stripe,
    Mirror,
    Raidz1,
    Raidz2,
    Raidz3,
}

impl RaidType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaidType::Stripe => "stripe",
            RaidType::Mirror => "mirror",
            RaidType::Raidz1 => "raidz1",
            RaidType::Raidz2 => "raidz2",
            RaidType::Raidz3 => "raidz3",
        }
    }

    /// Minimum disks a vdev of this type accepts.
    pub fn min_disks(&self) -> usize {
        match self {
            RaidType::Stripe => 1,
            RaidType::Mirror => 2,
            RaidType::Raidz1 => 2,
            RaidType::Raidz2 => 3,
            RaidType::Raidz3 => 4,
        }
    }
}

impl FromStr for RaidType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stripe" => Ok(RaidType::Stripe),
            "mirror" => Ok(RaidType::Mirror),
            "raidz1" => Ok(RaidType::Raidz1),
            "raidz2" => Ok(RaidType::Raidz2),
            "raidz3" => Ok(RaidType::Raidz3),
            other => anyhow::bail!("invalid RAID type '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardeningProfile {
    Baseline,
    Server,
    None,
}

impl HardeningProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            HardeningProfile::Baseline => "baseline",
            HardeningProfile::Server => "server",
            HardeningProfile::None => "none",
        }
    }
}

impl FromStr for HardeningProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "baseline" => Ok(HardeningProfile::Baseline),
            "server" => Ok(HardeningProfile::Server),
            "none" => Ok(HardeningProfile::None),
            other => anyhow::bail!("invalid hardening profile '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DracutCompression {
    Zstd,
    Gzip,
    Lz4,
    Xz,
}

impl DracutCompression {
    pub fn as_str(&self) -> &'static str {
        match self {
            DracutCompression::Zstd => "zstd",
            DracutCompression::Gzip => "gzip",
            DracutCompression::Lz4 => "lz4",
            DracutCompression::Xz => "xz",
        }
    }
}

/// ZFS dataset compression: lz4, zstd, zstd-N (1..19), gzip, gzip-N (1..9),
/// or off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZfsCompression {
    Lz4,
    Zstd,
    ZstdLevel(u8),
    Gzip,
    GzipLevel(u8),
    Off,
}

impl fmt::Display for ZfsCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZfsCompression::Lz4 => write!(f, "lz4"),
            ZfsCompression::Zstd => write!(f, "zstd"),
            ZfsCompression::ZstdLevel(n) => write!(f, "zstd-{n}"),
            ZfsCompression::Gzip => write!(f, "gzip"),
            ZfsCompression::GzipLevel(n) => write!(f, "gzip-{n}"),
            ZfsCompression::Off => write!(f, "off"),
        }
    }
}

impl FromStr for ZfsCompression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lz4" => return Ok(ZfsCompression::Lz4),
            "zstd" => return Ok(ZfsCompression::Zstd),
            "gzip" => return Ok(ZfsCompression::Gzip),
            "off" => return Ok(ZfsCompression::Off),
            _ => {}
        }
        if let Some(level) = s.strip_prefix("zstd-") {
            let n: u8 = level
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid zstd level '{level}'"))?;
            anyhow::ensure!((1..=19).contains(&n), "zstd level must be 1..19, got {n}");
            return Ok(ZfsCompression::ZstdLevel(n));
        }
        if let Some(level) = s.strip_prefix("gzip-") {
            let n: u8 = level
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid gzip level '{level}'"))?;
            anyhow::ensure!((1..=9).contains(&n), "gzip level must be 1..9, got {n}");
            return Ok(ZfsCompression::GzipLevel(n));
        }
        anyhow::bail!("invalid compression '{s}'")
    }
}

/// ZFS alignment shift: `auto` or one of 9, 12, 13.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ashift {
    Auto,
    Value(u8),
}

impl fmt::Display for Ashift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ashift::Auto => write!(f, "auto"),
            Ashift::Value(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for Ashift {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "auto" {
            return Ok(Ashift::Auto);
        }
        let n: u8 = s
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid ashift '{s}'"))?;
        anyhow::ensure!(
            matches!(n, 9 | 12 | 13),
            "ashift must be auto, 9, 12 or 13, got {n}"
        );
        Ok(Ashift::Value(n))
    }
}

/// ARC size cap: `auto` or a byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcMax {
    Auto,
    Bytes(u64),
}

impl fmt::Display for ArcMax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArcMax::Auto => write!(f, "auto"),
            ArcMax::Bytes(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for ArcMax {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "auto" {
            return Ok(ArcMax::Auto);
        }
        let n: u64 = s
            .parse()
            .map_err(|_| anyhow::anyhow!("ARC max must be 'auto' or bytes, got '{s}'"))?;
        Ok(ArcMax::Bytes(n))
    }
}

/// Kernel selection: `latest` or an explicit version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelSelector {
    Latest,
    Version(String),
}

impl fmt::Display for KernelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelSelector::Latest => write!(f, "latest"),
            KernelSelector::Version(v) => write!(f, "{v}"),
        }
    }
}

impl FromStr for KernelSelector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            anyhow::bail!("kernel version must not be empty");
        }
        if s == "latest" {
            Ok(KernelSelector::Latest)
        } else {
            Ok(KernelSelector::Version(s.to_string()))
        }
    }
}

/// Serde plumbing for the string-shaped value types above.
macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(ZfsCompression);
string_serde!(KernelSelector);

impl Serialize for Ashift {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Accepts `auto`, a bare integer, or a quoted integer.
impl<'de> Deserialize<'de> for Ashift {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AshiftVisitor;

        impl serde::de::Visitor<'_> for AshiftVisitor {
            type Value = Ashift;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("\"auto\", 9, 12 or 13")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Ashift, E> {
                v.parse().map_err(serde::de::Error::custom)
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Ashift, E> {
                v.to_string().parse().map_err(serde::de::Error::custom)
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Ashift, E> {
                v.to_string().parse().map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_any(AshiftVisitor)
    }
}

impl Serialize for ArcMax {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Accepts `auto`, a bare byte count, or a quoted one.
impl<'de> Deserialize<'de> for ArcMax {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ArcMaxVisitor;

        impl serde::de::Visitor<'_> for ArcMaxVisitor {
            type Value = ArcMax;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("\"auto\" or a non-negative byte count")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<ArcMax, E> {
                v.parse().map_err(serde::de::Error::custom)
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<ArcMax, E> {
                Ok(ArcMax::Bytes(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<ArcMax, E> {
                u64::try_from(v)
                    .map(ArcMax::Bytes)
                    .map_err(|_| serde::de::Error::custom("ARC max must be non-negative"))
            }
        }

        deserializer.deserialize_any(ArcMaxVisitor)
    }
}

// =============================================================================
// Spec sections
// =============================================================================

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BuilderConfig {
    pub debian_release: DebianRelease,
    pub kernel_version: KernelSelector,
    pub output_iso_name: String,
    pub iso_label: String,
    pub version_tag: String,
    pub workspace_path: PathBuf,
    pub cache_packages: bool,
    /// Source tree holding the custom installer modules to stage.
    pub installer_modules_path: PathBuf,
    /// Seconds of subprocess silence before the watchdog cancels it.
    pub stall_timeout_secs: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            debian_release: DebianRelease::Bookworm,
            kernel_version: KernelSelector::Latest,
            output_iso_name: "zforge-proxmox.iso".to_string(),
            iso_label: "ZFORGE_PROXMOX".to_string(),
            version_tag: "3.0".to_string(),
            workspace_path: PathBuf::from("/tmp/zforge_workspace"),
            cache_packages: true,
            installer_modules_path: PathBuf::from("calamares/modules"),
            stall_timeout_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxmoxConfig {
    pub version: String,
    pub minimal_install: bool,
    pub include_packages: Vec<String>,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            version: "latest".to_string(),
            minimal_install: false,
            include_packages: vec![
                "proxmox-ve".to_string(),
                "pve-firmware".to_string(),
                "pve-zsync".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EncryptionDefaults {
    pub algorithm: String,
    pub pbkdf_iterations: u32,
    pub prompt_at_boot: bool,
}

impl Default for EncryptionDefaults {
    fn default() -> Self {
        Self {
            algorithm: "aes-256-gcm".to_string(),
            pbkdf_iterations: 350_000,
            prompt_at_boot: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ZfsConfig {
    pub build_from_source: bool,
    pub version: String,
    pub default_compression: ZfsCompression,
    pub default_raid_type: RaidType,
    pub default_ashift: Ashift,
    pub default_arc_max: ArcMax,
    pub encryption: EncryptionDefaults,
}

impl Default for ZfsConfig {
    fn default() -> Self {
        Self {
            build_from_source: true,
            version: "latest".to_string(),
            default_compression: ZfsCompression::Lz4,
            default_raid_type: RaidType::Mirror,
            default_ashift: Ashift::Auto,
            default_arc_max: ArcMax::Auto,
            encryption: EncryptionDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BootloaderConfig {
    /// Fixed to "zfsbootmenu"; anything else fails validation.
    pub primary: String,
    pub enable_opencore: bool,
    pub opencore_drivers: Vec<String>,
    /// Skip the BIOS/isolinux side of the hybrid image.
    pub uefi_only: bool,
    /// How many ZFSBootMenu EFI image copies the installer places on the ESP.
    pub zbm_image_copies: u32,
}

impl Default for BootloaderConfig {
    fn default() -> Self {
        Self {
            primary: "zfsbootmenu".to_string(),
            enable_opencore: false,
            opencore_drivers: vec![
                "OpenRuntime.efi".to_string(),
                "NvmExpressDxe.efi".to_string(),
            ],
            uefi_only: false,
            zbm_image_copies: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DracutSettings {
    pub modules: Vec<String>,
    pub compression: DracutCompression,
    pub hostonly: bool,
    pub kernel_cmdline: String,
    pub extra_drivers: Vec<String>,
}

impl Default for DracutSettings {
    fn default() -> Self {
        Self {
            modules: vec!["zfs".to_string(), "systemd".to_string()],
            compression: DracutCompression::Zstd,
            hostonly: true,
            kernel_cmdline: "root=zfs:AUTO".to_string(),
            extra_drivers: vec!["nvme".to_string()],
        }
    }
}

/// Per-server knobs supplied by hardware overlay files (R420, R730xd, ...).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub preset: Option<String>,
    /// Extra kernel command line for serial consoles, e.g. "console=ttyS0,115200n8".
    pub serial_console: Option<String>,
    /// PCIe device path template for the OpenCore chainload entry.
    pub opencore_device_path: Option<String>,
    pub extra_drivers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub hardening_profile: HardeningProfile,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            hardening_profile: HardeningProfile::Baseline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDecl {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ModuleDecl {
    pub fn enabled(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
        }
    }
}

// =============================================================================
// BuildPlan
// =============================================================================

/// The validated build specification.
///
/// Serializing a plan yields a normalized spec file that loads back into an
/// identical plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub builder_config: BuilderConfig,
    pub proxmox_config: ProxmoxConfig,
    pub zfs_config: ZfsConfig,
    pub bootloader_config: BootloaderConfig,
    pub dracut_config: DracutSettings,
    pub hardware_config: HardwareConfig,
    pub telemetry_config: TelemetryConfig,
    pub security_config: SecurityConfig,
    pub modules: Vec<ModuleDecl>,
}

/// Raw spec file shape: every section optional, unknown top-level sections
/// collected (and warned about) instead of rejected.
#[derive(Debug, Default, Deserialize)]
struct SpecFile {
    builder_config: Option<BuilderConfig>,
    proxmox_config: Option<ProxmoxConfig>,
    zfs_config: Option<ZfsConfig>,
    bootloader_config: Option<BootloaderConfig>,
    dracut_config: Option<DracutSettings>,
    hardware_config: Option<HardwareConfig>,
    telemetry_config: Option<TelemetryConfig>,
    security_config: Option<SecurityConfig>,
    modules: Option<Vec<ModuleDecl>>,
    #[serde(flatten)]
    unknown_sections: BTreeMap<String, serde_yaml::Value>,
}

impl BuildPlan {
    /// Load a spec file plus zero or more overlay files.
    pub fn load(spec_path: &Path, overlay_paths: &[PathBuf]) -> Result<Self> {
        let mut value = read_yaml(spec_path)?;
        for overlay in overlay_paths {
            let overlay_value = read_yaml(overlay)?;
            deep_merge(&mut value, overlay_value);
        }
        Self::from_value(value)
    }

    /// Build a plan from an already-merged YAML document.
    pub fn from_value(value: serde_yaml::Value) -> Result<Self> {
        let file: SpecFile = serde_yaml::from_value(value).map_err(classify_parse_error)?;

        for section in file.unknown_sections.keys() {
            log::warn!("ignoring unknown spec section '{}'", section);
        }

        let explicit_modules = file.modules.is_some();
        let plan = BuildPlan {
            builder_config: file.builder_config.unwrap_or_default(),
            proxmox_config: file.proxmox_config.unwrap_or_default(),
            zfs_config: file.zfs_config.unwrap_or_default(),
            bootloader_config: file.bootloader_config.unwrap_or_default(),
            dracut_config: file.dracut_config.unwrap_or_default(),
            hardware_config: file.hardware_config.unwrap_or_default(),
            telemetry_config: file.telemetry_config.unwrap_or_default(),
            security_config: file.security_config.unwrap_or_default(),
            modules: file.modules.unwrap_or_else(default_modules),
        };
        plan.validate(explicit_modules)?;
        Ok(plan)
    }

    /// Normalized YAML form of the plan.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("serializing build plan")
    }

    fn validate(&self, explicit_modules: bool) -> Result<()> {
        let mut problems = Vec::new();

        if self.bootloader_config.primary != "zfsbootmenu" {
            problems.push(format!(
                "bootloader_config.primary: must be 'zfsbootmenu', got '{}'",
                self.bootloader_config.primary
            ));
        }
        if self.bootloader_config.zbm_image_copies == 0 {
            problems.push("bootloader_config.zbm_image_copies: must be at least 1".to_string());
        }
        for decl in &self.modules {
            if !DEFAULT_MODULE_ORDER.contains(&decl.name.as_str()) {
                problems.push(format!("modules: unknown module '{}'", decl.name));
            }
        }
        if self.proxmox_config.include_packages.is_empty() {
            problems.push("proxmox_config.include_packages: must not be empty".to_string());
        }

        if explicit_modules && self.modules.is_empty() {
            return Err(anyhow::anyhow!("spec declares an empty module list")
                .context(BuildErrorKind::MissingRequired));
        }

        if !problems.is_empty() {
            return Err(anyhow::anyhow!(
                "invalid specification:\n  {}",
                problems.join("\n  ")
            )
            .context(BuildErrorKind::Validation));
        }
        Ok(())
    }

    /// Kernel command line for the live media boot entries.
    pub fn live_cmdline(&self) -> String {
        let mut cmdline = "boot=live components quiet splash".to_string();
        if let Some(serial) = &self.hardware_config.serial_console {
            cmdline.push(' ');
            cmdline.push_str(serial);
        }
        cmdline
    }
}

/// The canonical module pipeline with every stage enabled.
pub fn default_modules() -> Vec<ModuleDecl> {
    DEFAULT_MODULE_ORDER
        .iter()
        .map(|name| ModuleDecl::enabled(name))
        .collect()
}

fn read_yaml(path: &Path) -> Result<serde_yaml::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading spec file '{}'", path.display()))
        .context(BuildErrorKind::Validation)?;
    let value: serde_yaml::Value = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing spec file '{}'", path.display()))
        .context(BuildErrorKind::Validation)?;
    // An empty file parses to null; treat it as an empty spec.
    if value.is_null() {
        return Ok(serde_yaml::Value::Mapping(Default::default()));
    }
    Ok(value)
}

/// Classify serde errors: unknown keys inside enumerated sections are
/// `UnknownOption`, everything else is `Validation`.
fn classify_parse_error(err: serde_yaml::Error) -> anyhow::Error {
    let message = err.to_string();
    let kind = if message.contains("unknown field") {
        BuildErrorKind::UnknownOption
    } else {
        BuildErrorKind::Validation
    };
    anyhow::Error::new(err)
        .context(kind)
        .context("invalid specification")
}

/// Deep-merge `overlay` onto `base`: mappings merge recursively, scalars and
/// lists replace.
pub fn deep_merge(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_from_str(yaml: &str) -> Result<BuildPlan> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        let value = if value.is_null() {
            serde_yaml::Value::Mapping(Default::default())
        } else {
            value
        };
        BuildPlan::from_value(value)
    }

    #[test]
    fn test_empty_spec_gets_defaults() {
        let plan = plan_from_str("").unwrap();
        assert_eq!(plan.builder_config.debian_release, DebianRelease::Bookworm);
        assert_eq!(plan.builder_config.kernel_version, KernelSelector::Latest);
        assert!(plan.zfs_config.build_from_source);
        assert_eq!(plan.zfs_config.default_compression, ZfsCompression::Lz4);
        assert_eq!(plan.dracut_config.compression, DracutCompression::Zstd);
        assert_eq!(plan.modules.len(), DEFAULT_MODULE_ORDER.len());
        assert!(plan.modules.iter().all(|m| m.enabled));
    }

    #[test]
    fn test_unknown_key_in_enumerated_section_is_fatal() {
        let err = plan_from_str("zfs_config:\n  frobnicate: true\n").unwrap_err();
        assert_eq!(
            crate::errors::kind_of(&err),
            Some(BuildErrorKind::UnknownOption)
        );
    }

    #[test]
    fn test_unknown_top_level_section_is_tolerated() {
        let plan = plan_from_str("observability:\n  enabled: true\n").unwrap();
        assert_eq!(plan.builder_config.debian_release, DebianRelease::Bookworm);
    }

    #[test]
    fn test_bad_release_is_fatal() {
        let err = plan_from_str("builder_config:\n  debian_release: sid\n").unwrap_err();
        assert_eq!(
            crate::errors::kind_of(&err),
            Some(BuildErrorKind::Validation)
        );
    }

    #[test]
    fn test_compression_levels() {
        assert_eq!(
            "zstd-19".parse::<ZfsCompression>().unwrap(),
            ZfsCompression::ZstdLevel(19)
        );
        assert_eq!(
            "gzip-9".parse::<ZfsCompression>().unwrap(),
            ZfsCompression::GzipLevel(9)
        );
        assert!("zstd-20".parse::<ZfsCompression>().is_err());
        assert!("gzip-0".parse::<ZfsCompression>().is_err());
        assert!("lzma".parse::<ZfsCompression>().is_err());
        assert_eq!(ZfsCompression::ZstdLevel(3).to_string(), "zstd-3");
    }

    #[test]
    fn test_ashift_values() {
        assert_eq!("auto".parse::<Ashift>().unwrap(), Ashift::Auto);
        assert_eq!("12".parse::<Ashift>().unwrap(), Ashift::Value(12));
        assert!("10".parse::<Ashift>().is_err());
    }

    #[test]
    fn test_ashift_accepts_bare_integers_in_yaml() {
        let plan = plan_from_str("zfs_config:\n  default_ashift: 12\n").unwrap();
        assert_eq!(plan.zfs_config.default_ashift, Ashift::Value(12));

        let plan = plan_from_str("zfs_config:\n  default_arc_max: 8589934592\n").unwrap();
        assert_eq!(plan.zfs_config.default_arc_max, ArcMax::Bytes(8589934592));
    }

    #[test]
    fn test_arc_max_values() {
        assert_eq!("auto".parse::<ArcMax>().unwrap(), ArcMax::Auto);
        assert_eq!(
            "8589934592".parse::<ArcMax>().unwrap(),
            ArcMax::Bytes(8589934592)
        );
        assert!("-1".parse::<ArcMax>().is_err());
        assert!("8G".parse::<ArcMax>().is_err());
    }

    #[test]
    fn test_empty_module_list_is_missing_required() {
        let err = plan_from_str("modules: []\n").unwrap_err();
        assert_eq!(
            crate::errors::kind_of(&err),
            Some(BuildErrorKind::MissingRequired)
        );
    }

    #[test]
    fn test_unknown_module_name_is_validation_error() {
        let err = plan_from_str("modules:\n  - name: FluxCapacitor\n").unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("FluxCapacitor"));
    }

    #[test]
    fn test_primary_bootloader_is_fixed() {
        let err = plan_from_str("bootloader_config:\n  primary: grub\n").unwrap_err();
        assert_eq!(
            crate::errors::kind_of(&err),
            Some(BuildErrorKind::Validation)
        );
    }

    #[test]
    fn test_deep_merge_replaces_scalars_and_lists() {
        let mut base: serde_yaml::Value = serde_yaml::from_str(
            "builder_config:\n  debian_release: bookworm\nbootloader_config:\n  opencore_drivers: [A.efi, B.efi]\n",
        )
        .unwrap();
        let overlay: serde_yaml::Value = serde_yaml::from_str(
            "bootloader_config:\n  opencore_drivers: [C.efi]\nhardware_config:\n  serial_console: console=ttyS0,115200n8\n",
        )
        .unwrap();
        deep_merge(&mut base, overlay);
        let plan = BuildPlan::from_value(base).unwrap();

        // List replaced, not concatenated; untouched scalar survives.
        assert_eq!(plan.bootloader_config.opencore_drivers, vec!["C.efi"]);
        assert_eq!(plan.builder_config.debian_release, DebianRelease::Bookworm);
        assert_eq!(
            plan.hardware_config.serial_console.as_deref(),
            Some("console=ttyS0,115200n8")
        );
    }

    #[test]
    fn test_round_trip_is_identity() {
        let plan = plan_from_str(
            "builder_config:\n  debian_release: trixie\n  kernel_version: '6.8'\nzfs_config:\n  default_compression: zstd-7\n  default_ashift: '12'\n",
        )
        .unwrap();
        let yaml = plan.to_yaml().unwrap();
        let reloaded = plan_from_str(&yaml).unwrap();
        assert_eq!(plan, reloaded);
    }

    #[test]
    fn test_live_cmdline_includes_serial_console() {
        let plan = plan_from_str(
            "hardware_config:\n  serial_console: console=ttyS1,57600\n",
        )
        .unwrap();
        assert!(plan.live_cmdline().ends_with("console=ttyS1,57600"));
    }

    #[test]
    fn test_enable_flags_skip_but_never_reorder() {
        let plan = plan_from_str(
            "modules:\n  - name: WorkspaceSetup\n  - name: Debootstrap\n    enabled: false\n  - name: ISOGeneration\n",
        )
        .unwrap();
        let names: Vec<&str> = plan.modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["WorkspaceSetup", "Debootstrap", "ISOGeneration"]);
        assert!(!plan.modules[1].enabled);
    }
}
