//! User agent sent with every remote procedure call.
//!
//! Format: `session-sync/{version} ({os}-{kernel}-{arch}) {client}`

use std::env;
use sysinfo::System;

/// Generates the user agent string.
///
/// `client` identifies the front end issuing the call (e.g. `"desktop/2.4.0"`);
/// when absent the CLI identifies itself.
pub fn generate_user_agent(client: Option<&str>) -> String {
    let version = env!("CARGO_PKG_VERSION");

    let client_part = match client.map(sanitize_client_string) {
        Some(c) if !c.trim().is_empty() => c.trim().to_string(),
        _ => format!("session-sync-cli/{}", version),
    };

    format!("session-sync/{} ({}) {}", version, platform_info(), client_part)
}

/// Removes surrounding double quotes, which some shells pass through
fn sanitize_client_string(client: &str) -> String {
    if client.starts_with('"') && client.ends_with('"') && client.len() >= 2 {
        client[1..client.len() - 1].to_string()
    } else {
        client.to_string()
    }
}

fn platform_info() -> String {
    let os_name = System::name().unwrap_or_else(|| "unknown".to_string());
    let kernel_version = System::kernel_version().unwrap_or_else(|| "unknown".to_string());

    let arch = match env::consts::ARCH {
        "aarch64" => "arm64",
        arch => arch,
    };

    format!(
        "{}-{}-{}",
        os_name.to_lowercase().replace(' ', "_"),
        kernel_version.to_lowercase(),
        arch
    )
}
