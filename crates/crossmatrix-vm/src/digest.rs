use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest as _, Sha256};

use crate::VmBackend;

/// `<runtime> image inspect --format {{.Id}} <image>`, normalized to `sha256:<hex>`.
pub(crate) fn docker_like_image_id(backend: VmBackend, image: &str) -> Result<String> {
    let bin = backend.bin();
    let mut cmd = std::process::Command::new(bin);
    cmd.args(["image", "inspect", "--format", "{{.Id}}", image]);
    let out = crate::run_command_capped(cmd, Some(10_000), 64 * 1024, 64 * 1024)
        .with_context(|| format!("{bin} image inspect Id {image}"))?;
    if out.timed_out {
        anyhow::bail!("{bin} image inspect timed out");
    }
    if out.exit_status != 0 {
        let stderr = String::from_utf8_lossy(&out.stderr);
        anyhow::bail!("{bin} image inspect failed: {stderr}");
    }
    let s = String::from_utf8_lossy(&out.stdout);
    normalize_sha256_digest(s.trim())
}

/// Accepts `sha256:<64-hex>` (docker) or bare `<64-hex>` (podman).
pub fn normalize_sha256_digest(raw: &str) -> Result<String> {
    let s = raw.trim();
    let hex = s.strip_prefix("sha256:").unwrap_or(s);
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        anyhow::bail!("invalid digest {raw:?} (expected sha256:<64-hex>)");
    }
    Ok(format!("sha256:{}", hex.to_ascii_lowercase()))
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut h = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok(format!("sha256:{:x}", h.finalize()))
}
