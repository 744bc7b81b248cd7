//! Security hardening profiles.
//!
//! Shared between the build-time SecurityHardening module (which stages the
//! assets into the live image) and the installer-side `apply-hardening` job
//! (which writes them into the installed target).

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::spec::HardeningProfile;

/// Sysctl drop-in applied by the baseline profile: no SUID core dumps, full
/// ASLR, basic TCP hardening.
pub const BASELINE_SYSCTL: &[(&str, &str)] = &[
    ("fs.suid_dumpable", "0"),
    ("kernel.randomize_va_space", "2"),
    ("net.ipv4.tcp_syncookies", "1"),
    ("net.ipv4.rfc1337", "1"),
    ("net.ipv4.conf.all.rp_filter", "1"),
    ("net.ipv4.conf.default.rp_filter", "1"),
    ("net.ipv4.conf.all.accept_source_route", "0"),
    ("net.ipv4.conf.default.accept_source_route", "0"),
    ("net.ipv4.conf.all.accept_redirects", "0"),
    ("net.ipv4.conf.default.accept_redirects", "0"),
    ("net.ipv6.conf.all.accept_redirects", "0"),
    ("net.ipv6.conf.default.accept_redirects", "0"),
];

/// Extra sysctls for the server profile.
pub const SERVER_SYSCTL: &[(&str, &str)] = &[
    ("net.ipv4.icmp_echo_ignore_broadcasts", "1"),
    ("net.ipv4.icmp_ignore_bogus_error_responses", "1"),
];

/// Uncommon filesystems and protocols blacklisted by the baseline profile.
pub const MODULE_BLACKLIST: &[&str] = &[
    "cramfs", "freevxfs", "jffs2", "hfs", "hfsplus", "udf", "dccp", "sctp", "rds", "tipc",
];

/// sshd drop-in for the server profile.
pub const SSHD_HARDENING: &[(&str, &str)] = &[
    ("PermitRootLogin", "no"),
    ("PasswordAuthentication", "no"),
    ("ChallengeResponseAuthentication", "no"),
    ("X11Forwarding", "no"),
    ("MaxAuthTries", "3"),
    ("ClientAliveInterval", "300"),
    ("ClientAliveCountMax", "2"),
    ("PermitEmptyPasswords", "no"),
    ("AllowAgentForwarding", "no"),
];

const UMASK: &str = "027";

/// Write the assets for `profile` into the filesystem rooted at `root`.
/// `none` writes nothing.
pub fn write_assets(root: &Path, profile: HardeningProfile) -> Result<()> {
    match profile {
        HardeningProfile::None => Ok(()),
        HardeningProfile::Baseline => write_baseline(root),
        HardeningProfile::Server => {
            write_baseline(root)?;
            write_server(root)
        }
    }
}

fn write_baseline(root: &Path) -> Result<()> {
    let sysctl_dir = root.join("etc/sysctl.d");
    fs::create_dir_all(&sysctl_dir).context("creating sysctl.d")?;
    fs::write(
        sysctl_dir.join("99-zforge-hardening.conf"),
        render_sysctl(BASELINE_SYSCTL),
    )
    .context("writing baseline sysctl drop-in")?;

    let modprobe_dir = root.join("etc/modprobe.d");
    fs::create_dir_all(&modprobe_dir).context("creating modprobe.d")?;
    let blacklist: String = MODULE_BLACKLIST
        .iter()
        .map(|module| format!("install {module} /bin/false\n"))
        .collect();
    fs::write(modprobe_dir.join("zforge-blacklist.conf"), blacklist)
        .context("writing module blacklist")?;

    set_login_umask(root)?;
    Ok(())
}

fn write_server(root: &Path) -> Result<()> {
    let sysctl_dir = root.join("etc/sysctl.d");
    fs::write(
        sysctl_dir.join("99-zforge-server.conf"),
        render_sysctl(SERVER_SYSCTL),
    )
    .context("writing server sysctl drop-in")?;

    let sshd_dir = root.join("etc/ssh/sshd_config.d");
    fs::create_dir_all(&sshd_dir).context("creating sshd_config.d")?;
    let sshd: String = SSHD_HARDENING
        .iter()
        .map(|(key, value)| format!("{key} {value}\n"))
        .collect();
    fs::write(sshd_dir.join("99-zforge.conf"), sshd).context("writing sshd drop-in")?;

    write_firewall(root)?;
    Ok(())
}

/// Default-deny inbound nftables ruleset with SSH allowed.
fn write_firewall(root: &Path) -> Result<()> {
    let ruleset = "#!/usr/sbin/nft -f\n\
        \n\
        flush ruleset\n\
        \n\
        table inet filter {\n\
        \tchain input {\n\
        \t\ttype filter hook input priority 0; policy drop;\n\
        \t\tct state established,related accept\n\
        \t\tiif lo accept\n\
        \t\ttcp dport 22 ct state new accept\n\
        \t\tip protocol icmp accept\n\
        \t\tip6 nexthdr ipv6-icmp accept\n\
        \t}\n\
        \tchain forward {\n\
        \t\ttype filter hook forward priority 0; policy drop;\n\
        \t}\n\
        \tchain output {\n\
        \t\ttype filter hook output priority 0; policy accept;\n\
        \t}\n\
        }\n";
    let etc = root.join("etc");
    fs::create_dir_all(&etc).context("creating etc")?;
    fs::write(etc.join("nftables.conf"), ruleset).context("writing nftables ruleset")?;
    Ok(())
}

fn render_sysctl(settings: &[(&str, &str)]) -> String {
    let mut out = String::from("# Z-Forge hardening\n");
    for (key, value) in settings {
        out.push_str(&format!("{key} = {value}\n"));
    }
    out
}

/// Set UMASK in login.defs, replacing an existing assignment if present.
fn set_login_umask(root: &Path) -> Result<()> {
    let path = root.join("etc/login.defs");
    let content = fs::read_to_string(&path).unwrap_or_default();

    let mut lines: Vec<String> = Vec::new();
    let mut replaced = false;
    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("UMASK") || trimmed.starts_with("#UMASK") {
            if !replaced {
                lines.push(format!("UMASK\t\t{UMASK}"));
                replaced = true;
            }
            continue;
        }
        lines.push(line.to_string());
    }
    if !replaced {
        lines.push(format!("UMASK\t\t{UMASK}"));
    }

    fs::create_dir_all(path.parent().unwrap()).context("creating etc")?;
    fs::write(&path, lines.join("\n") + "\n").context("writing login.defs")?;
    Ok(())
}
