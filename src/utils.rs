//! Shared helpers: path resolution, binary lookup, public-IP discovery, and
//! the set-identity command runner.

use {
    crate::error::{Error, Result},
    log::{debug, error},
    std::{
        env, fs,
        net::IpAddr,
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// IP echo services queried in order until one returns a usable address.
const PUBLIC_IP_SERVICES: &[&str] = &[
    "https://api.ipify.org",
    "https://icanhazip.com",
    "https://ident.me",
    "https://checkip.amazonaws.com",
];

const PUBLIC_IP_TIMEOUT: Duration = Duration::from_secs(10);

/// Expand a leading `~/` against `$HOME` and normalize to an absolute path.
pub fn resolve_path(path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(Error::Configuration("path is empty".to_string()));
    }

    let expanded = if let Some(rest) = path.strip_prefix("~/") {
        let home = env::var("HOME")
            .map_err(|_| Error::Configuration("HOME is not set, cannot expand ~".to_string()))?;
        Path::new(&home).join(rest)
    } else {
        PathBuf::from(path)
    };

    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        let cwd = env::current_dir()?;
        Ok(cwd.join(expanded))
    }
}

/// Resolve a directory path and require that it exists.
pub fn resolve_and_validate_dir(dir: &str) -> Result<PathBuf> {
    let resolved = resolve_path(dir)?;
    if !resolved.is_dir() {
        return Err(Error::Configuration(format!(
            "invalid dir: {dir}, must be an existing directory"
        )));
    }
    Ok(resolved)
}

pub fn file_exists(path: &Path) -> bool {
    path.is_file()
}

pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Look up a binary on `$PATH`, as the shell would.
pub fn ensure_bin(bin: &str) -> Result<()> {
    let bin_path = Path::new(bin);
    if bin_path.is_absolute() {
        if bin_path.is_file() {
            return Ok(());
        }
        return Err(Error::Configuration(format!("{bin} not found")));
    }

    let path = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&path) {
        if dir.join(bin).is_file() {
            return Ok(());
        }
    }
    Err(Error::Configuration(format!("{bin} not found on PATH")))
}

/// Run a whitespace-separated command line, capturing combined output.
///
/// In dry-run mode the command is logged and never executed. Failures carry
/// the child's output so the operator sees what the validator binary said.
pub async fn run_command(command_line: &str, dry_run: bool) -> Result<()> {
    if dry_run {
        debug!("dry run: {command_line}");
        return Ok(());
    }

    let mut parts = command_line.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| Error::Switchover("empty command".to_string()))?;

    let output = tokio::process::Command::new(program)
        .args(parts)
        .output()
        .await
        .map_err(|err| Error::Switchover(format!("failed to spawn {program}: {err}")))?;

    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("command failed: {command_line}\nstdout: {stdout}\nstderr: {stderr}");
        return Err(Error::Switchover(format!(
            "{command_line} exited with {}",
            output.status
        )));
    }

    debug!("command output: {}", String::from_utf8_lossy(&output.stdout));
    Ok(())
}

/// Discover this host's public IP by querying HTTPS echo services.
pub async fn get_public_ip() -> Result<String> {
    debug!("getting public IP...");
    let client = reqwest::Client::builder()
        .timeout(PUBLIC_IP_TIMEOUT)
        .build()
        .map_err(|err| Error::Configuration(format!("failed to build http client: {err}")))?;

    let mut last_err = String::from("no services configured");
    for service in PUBLIC_IP_SERVICES {
        match fetch_ip(&client, service).await {
            Ok(ip) if is_valid_public_ip(&ip) => {
                debug!("public IP {ip} collected from {service}");
                return Ok(ip);
            }
            Ok(ip) => {
                debug!("invalid IP {ip} received from {service}");
                last_err = format!("{service} returned non-public address {ip}");
            }
            Err(err) => {
                debug!("failed to get IP from {service}: {err}");
                last_err = err.to_string();
            }
        }
    }

    Err(Error::Configuration(format!(
        "failed to get public IP from all services: {last_err}"
    )))
}

async fn fetch_ip(client: &reqwest::Client, service: &str) -> Result<String> {
    let response = client
        .get(service)
        .send()
        .await
        .map_err(|err| Error::Rpc(format!("GET {service}: {err}")))?;
    if !response.status().is_success() {
        return Err(Error::Rpc(format!(
            "{service} returned status {}",
            response.status()
        )));
    }
    let body = response
        .text()
        .await
        .map_err(|err| Error::Rpc(format!("reading {service} response: {err}")))?;
    Ok(body.trim().to_string())
}

/// A usable public IP: parses, and is not loopback/private/link-local.
pub fn is_valid_public_ip(ip: &str) -> bool {
    let Ok(addr) = ip.parse::<IpAddr>() else {
        return false;
    };
    match addr {
        IpAddr::V4(v4) => {
            !v4.is_loopback() && !v4.is_private() && !v4.is_link_local() && !v4.is_unspecified()
        }
        IpAddr::V6(v6) => !v6.is_loopback() && !v6.is_unspecified(),
    }
}

/// A peer address must look like `host:port`.
pub fn is_valid_host_port(address: &str) -> bool {
    let Some((host, port)) = address.rsplit_once(':') else {
        return false;
    };
    !host.is_empty() && port.parse::<u16>().is_ok()
}
