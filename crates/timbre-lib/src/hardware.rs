//! Hardware selection for the engine process.

use std::path::PathBuf;
use std::process::Command;

use timbre_core::types::{GpuId, GpuInfo};

const VISIBLE_DEVICES_VAR: &str = "CUDA_VISIBLE_DEVICES";

/// Chooses the accelerator an engine run may see and enumerates what exists.
pub trait HardwareSelector: Send + Sync {
    /// Environment variables to set on top of the inherited environment.
    fn environment(&self, gpu: &GpuId) -> Vec<(String, String)>;

    /// Accelerators available to the engine. Blocking.
    fn gpu_info(&self) -> Result<Vec<GpuInfo>, String>;
}

/// NVIDIA selection via `CUDA_VISIBLE_DEVICES`, enumeration via `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct CudaSelector {
    nvidia_smi: PathBuf,
}

impl Default for CudaSelector {
    fn default() -> Self {
        Self::new("nvidia-smi")
    }
}

impl CudaSelector {
    pub fn new(nvidia_smi: impl Into<PathBuf>) -> Self {
        Self {
            nvidia_smi: nvidia_smi.into(),
        }
    }
}

impl HardwareSelector for CudaSelector {
    fn environment(&self, gpu: &GpuId) -> Vec<(String, String)> {
        // An empty device list hides every GPU, forcing the CPU path.
        let visible = if gpu.is_cpu() { String::new() } else { gpu.to_string() };
        vec![(VISIBLE_DEVICES_VAR.to_string(), visible)]
    }

    fn gpu_info(&self) -> Result<Vec<GpuInfo>, String> {
        let output = match Command::new(&self.nvidia_smi)
            .args([
                "--query-gpu=index,name,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .output()
        {
            Ok(o) => o,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{} not installed; reporting no GPUs", self.nvidia_smi.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(format!("failed to run {}: {e}", self.nvidia_smi.display())),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "{} exited with {}: {}",
                self.nvidia_smi.display(),
                output.status,
                stderr.trim()
            ));
        }

        parse_gpu_query(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `index, name, memory.total` CSV rows.
fn parse_gpu_query(stdout: &str) -> Result<Vec<GpuInfo>, String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let mut fields = line.splitn(3, ',').map(str::trim);
            let index = fields
                .next()
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or_else(|| format!("unexpected nvidia-smi row: {line:?}"))?;
            let name = fields.next().unwrap_or_default().to_string();
            let memory_total_mib = fields.next().and_then(|s| s.parse::<u64>().ok());
            Ok(GpuInfo {
                index,
                name,
                memory_total_mib,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_device_by_id() {
        let env = CudaSelector::default().environment(&GpuId::Name("1".into()));
        assert_eq!(env, vec![("CUDA_VISIBLE_DEVICES".to_string(), "1".to_string())]);

        let env = CudaSelector::default().environment(&GpuId::Index(0));
        assert_eq!(env[0].1, "0");
    }

    #[test]
    fn empty_id_hides_all_devices() {
        let env = CudaSelector::default().environment(&GpuId::Name(String::new()));
        assert_eq!(env, vec![("CUDA_VISIBLE_DEVICES".to_string(), String::new())]);
    }

    #[test]
    fn parses_query_rows() {
        let out = "0, NVIDIA GeForce RTX 3090, 24576\n1, Tesla T4, [N/A]\n\n";
        let gpus = parse_gpu_query(out).unwrap();
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].name, "NVIDIA GeForce RTX 3090");
        assert_eq!(gpus[0].memory_total_mib, Some(24576));
        assert_eq!(gpus[1].index, 1);
        assert_eq!(gpus[1].memory_total_mib, None);
    }

    #[test]
    fn rejects_garbage_rows() {
        assert!(parse_gpu_query("No devices were found").is_err());
    }

    #[test]
    fn missing_tool_reports_no_gpus() {
        let selector = CudaSelector::new("/nonexistent/nvidia-smi");
        assert_eq!(selector.gpu_info().unwrap(), Vec::new());
    }
}
