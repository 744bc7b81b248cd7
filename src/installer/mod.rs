//! Installer-side contracts staged into the live ISO.
//!
//! These are the job steps the `zforge-install` runner executes on the target
//! machine: pool detection and creation, bootloader installation, security
//! hardening and the telemetry submission client. View modules communicate
//! with them through the globalstorage map.

pub mod bootloader;
pub mod detect;
pub mod globalstorage;
pub mod hardening;
pub mod state;
pub mod telemetry;
pub mod zpool;
