//! Preflight & quota checks (spec §4.E). Grounded on the teacher's
//! `commands::detect_gpu`/`probe_nvidia`/`probe_vulkan` (shell out to
//! `nvidia-smi`/`vulkaninfo`, fall back to library-path sniffing on Linux,
//! `cfg!(target_os = "macos")` for Metal) for the GPU half, and on
//! `sysinfo` (already a teacher dependency) for the free-disk-space half.

use serde::Serialize;
use sysinfo::Disks;

#[derive(Debug, Clone, Serialize)]
pub struct StorageCheck {
    pub available_bytes: u64,
    pub required_bytes: u64,
    pub sufficient: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuCheck {
    pub has_nvidia: bool,
    pub has_vulkan: bool,
    pub has_metal: bool,
    pub estimated_vram_bytes: Option<u64>,
    pub has_f16_shaders: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub can_proceed: bool,
    pub storage: StorageCheck,
    pub gpu: GpuCheck,
    pub warnings: Vec<String>,
    pub blockers: Vec<String>,
}

fn probe_nvidia() -> (bool, Option<u64>) {
    let output = std::process::Command::new("nvidia-smi")
        .arg("--query-gpu=memory.total")
        .arg("--format=csv,noheader,nounits")
        .output();

    match output {
        Ok(o) if o.status.success() => {
            let stdout = String::from_utf8_lossy(&o.stdout);
            let mb: Option<u64> = stdout.lines().next().and_then(|l| l.trim().parse().ok());
            (true, mb.map(|mb| mb * 1024 * 1024))
        }
        _ => (false, None),
    }
}

fn probe_vulkan() -> bool {
    if let Ok(output) = std::process::Command::new("vulkaninfo").arg("--summary").output() {
        if output.status.success() {
            return true;
        }
    }

    #[cfg(target_os = "linux")]
    {
        if std::path::Path::new("/usr/lib/libvulkan.so.1").exists()
            || std::path::Path::new("/usr/lib/x86_64-linux-gnu/libvulkan.so.1").exists()
            || std::path::Path::new("/usr/lib64/libvulkan.so.1").exists()
        {
            return true;
        }
    }

    false
}

pub(crate) fn free_space_at(path: &std::path::Path) -> u64 {
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if path.starts_with(mount) {
            let depth = mount.components().count();
            if best.map_or(true, |(best_depth, _)| depth > best_depth) {
                best = Some((depth, disk.available_space()));
            }
        }
    }
    best.map(|(_, space)| space).unwrap_or(0)
}

/// Run all three checks for a planned download of `required_bytes` landing
/// under `target_dir`, with an optional VRAM requirement in bytes (spec
/// §4.E `{download_size, vram_required}`).
pub fn run(target_dir: &std::path::Path, required_bytes: u64, vram_required: Option<u64>) -> PreflightReport {
    let available = free_space_at(target_dir);
    let storage = StorageCheck {
        available_bytes: available,
        required_bytes,
        sufficient: available >= required_bytes,
    };

    let (has_nvidia, nvidia_vram) = probe_nvidia();
    let has_vulkan = probe_vulkan();
    let has_metal = cfg!(target_os = "macos");
    let has_platform_storage = target_dir.exists() || target_dir.parent().map(|p| p.exists()).unwrap_or(false);

    let gpu = GpuCheck {
        has_nvidia,
        has_vulkan,
        has_metal,
        estimated_vram_bytes: nvidia_vram,
        has_f16_shaders: has_nvidia || has_metal,
    };

    let mut warnings = Vec::new();
    let mut blockers = Vec::new();

    if !has_platform_storage {
        blockers.push("no platform persistent storage".to_string());
    }
    if !has_nvidia && !has_vulkan && !has_metal {
        blockers.push("no GPU facility detected".to_string());
    }
    if !storage.sufficient {
        blockers.push(format!(
            "insufficient free space: need {} bytes, have {}",
            storage.required_bytes, storage.available_bytes
        ));
    }
    if let Some(required) = vram_required {
        match gpu.estimated_vram_bytes {
            Some(available) if available < required => {
                blockers.push(format!(
                    "insufficient estimated VRAM: need {required} bytes, have {available}"
                ));
            }
            None => {
                blockers.push("insufficient estimated VRAM: none detected".to_string());
            }
            _ => {}
        }
    }
    if !gpu.has_f16_shaders {
        warnings.push("no F16 shader feature available".to_string());
    }
    if let (true, Some(vram)) = (has_nvidia, gpu.estimated_vram_bytes) {
        if vram < 4 * 1024 * 1024 * 1024 {
            warnings.push("low headroom on discrete GPU".to_string());
        }
    }

    PreflightReport {
        can_proceed: blockers.is_empty(),
        storage,
        gpu,
        warnings,
        blockers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_space_is_reported_as_a_blocker() {
        let dir = tempfile::tempdir().unwrap();
        let report = run(dir.path(), u64::MAX, None);
        assert!(!report.storage.sufficient);
        assert!(!report.can_proceed);
        assert!(report.blockers.iter().any(|b| b.contains("free space")));
    }

    #[test]
    fn zero_byte_requirement_never_blocks_on_storage() {
        let dir = tempfile::tempdir().unwrap();
        let report = run(dir.path(), 0, None);
        assert!(report.storage.sufficient);
    }
}
