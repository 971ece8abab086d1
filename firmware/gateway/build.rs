fn main() {
    println!("cargo:rustc-link-arg=-Tdefmt.x");
    println!("cargo:rustc-link-arg=-Tlinkall.x");

    // Build script that injects the firmware version string and the device's
    // network identity (AP credentials, mDNS hostname, optional station
    // credentials / static IPv4) as compile-time env vars. Values come from
    // the environment or a repo-root .env file; the AP/hostname settings have
    // working defaults so a bare checkout builds.

    println!("cargo:rerun-if-changed=src/");
    println!("cargo:rerun-if-changed=assets/");
    if let Some(repo_root) = repo_root_from_manifest() {
        let env_path = repo_root.join(".env");
        if env_path.exists() {
            println!("cargo:rerun-if-changed={}", env_path.display());
        }
    }

    let pkg_name = std::env::var("CARGO_PKG_NAME").unwrap_or_else(|_| "unknown".to_string());
    let pkg_ver = std::env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());
    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let git_info = git_describe().unwrap_or_else(|| "git unknown".to_string());

    let version_string = format!(
        "{name} {ver} (profile {profile}, {git})",
        name = pkg_name,
        ver = pkg_ver,
        git = git_info,
    );
    println!("cargo:rustc-env=MODGATE_FW_VERSION={}", version_string);

    let mut cfg = std::collections::HashMap::new();
    if let Some(repo_root) = repo_root_from_manifest() {
        let env_path = repo_root.join(".env");
        if env_path.exists() {
            cfg.extend(load_env_file(&env_path));
        }
    }

    let ap_ssid = get_cfg("MODGATE_AP_SSID", &cfg).unwrap_or_else(|| "ModGate-Setup".to_string());
    let ap_psk = get_cfg("MODGATE_AP_PSK", &cfg).unwrap_or_else(|| "modgate123".to_string());
    if !ap_psk.is_empty() && ap_psk.len() < 8 {
        eprintln!("error: MODGATE_AP_PSK must be empty (open AP) or at least 8 characters (WPA2).");
        std::process::exit(1);
    }
    let hostname = get_cfg("MODGATE_HOSTNAME", &cfg).unwrap_or_else(|| "modgate".to_string());

    println!("cargo:rustc-env=MODGATE_AP_SSID={}", ap_ssid);
    println!("cargo:rustc-env=MODGATE_AP_PSK={}", ap_psk);
    println!("cargo:rustc-env=MODGATE_HOSTNAME={}", hostname);

    // Optional station-side configuration: when SSID+PSK are present the
    // device auto-joins at boot in addition to running the config AP.
    for key in [
        "MODGATE_STA_SSID",
        "MODGATE_STA_PSK",
        "MODGATE_STA_STATIC_IP",
        "MODGATE_STA_NETMASK",
        "MODGATE_STA_GATEWAY",
        "MODGATE_STA_DNS",
    ] {
        if let Some(value) = get_cfg(key, &cfg) {
            println!("cargo:rustc-env={}={}", key, value);
        }
    }
}

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

fn repo_root_from_manifest() -> Option<PathBuf> {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").ok()?);
    manifest_dir.parent()?.parent().map(|p| p.to_path_buf())
}

fn git_describe() -> Option<String> {
    let repo_root = repo_root_from_manifest()?;
    let output = Command::new("git")
        .arg("-C")
        .arg(&repo_root)
        .args(["describe", "--tags", "--dirty", "--always"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let s = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if s.is_empty() { None } else { Some(s) }
}

fn load_env_file(path: &std::path::Path) -> std::collections::HashMap<String, String> {
    let mut map = std::collections::HashMap::new();

    let contents = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return map,
    };

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim();
            if !key.is_empty() && !value.is_empty() {
                map.insert(key.to_string(), value.to_string());
            }
        }
    }

    map
}

fn get_cfg(key: &str, file_cfg: &std::collections::HashMap<String, String>) -> Option<String> {
    if let Ok(v) = env::var(key) {
        let v = v.trim();
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }
    if let Some(v) = file_cfg.get(key) {
        let v = v.trim();
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }
    None
}
