//! Hardware encoder selection

use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// NVIDIA device node probed on Linux
pub const NVIDIA_DEVICE: &str = "/dev/nvidia0";
/// DRM render node probed on Linux (VA-API)
pub const VAAPI_DEVICE: &str = "/dev/dri/renderD128";

/// H.264 encoder profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwAccel {
    Nvenc,
    Vaapi,
    Qsv,
    Software,
}

impl HwAccel {
    /// ffmpeg encoder name for this profile
    pub fn encoder(&self) -> &'static str {
        match self {
            HwAccel::Nvenc => "h264_nvenc",
            HwAccel::Vaapi => "h264_vaapi",
            HwAccel::Qsv => "h264_qsv",
            HwAccel::Software => "libx264",
        }
    }

    /// Pick a profile for a platform, given a way to test device nodes
    pub fn probe_with(os: &str, exists: impl Fn(&Path) -> bool) -> Self {
        match os {
            "linux" if exists(Path::new(NVIDIA_DEVICE)) => HwAccel::Nvenc,
            "linux" if exists(Path::new(VAAPI_DEVICE)) => HwAccel::Vaapi,
            "windows" => HwAccel::Qsv,
            _ => HwAccel::Software,
        }
    }

    /// Probe the host this process runs on
    pub fn detect() -> Self {
        let accel = Self::probe_with(std::env::consts::OS, |path| path.exists());
        log::info!("Selected video encoder: {}", accel.encoder());
        accel
    }
}

impl fmt::Display for HwAccel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HwAccel::Nvenc => "nvenc",
            HwAccel::Vaapi => "vaapi",
            HwAccel::Qsv => "qsv",
            HwAccel::Software => "software",
        };
        f.write_str(name)
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown hardware acceleration profile: {0}")]
pub struct UnknownHwAccel(pub String);

impl FromStr for HwAccel {
    type Err = UnknownHwAccel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nvenc" => Ok(HwAccel::Nvenc),
            "vaapi" => Ok(HwAccel::Vaapi),
            "qsv" => Ok(HwAccel::Qsv),
            "software" => Ok(HwAccel::Software),
            _ => Err(UnknownHwAccel(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_prefers_nvidia() {
        let accel = HwAccel::probe_with("linux", |_| true);
        assert_eq!(accel, HwAccel::Nvenc);
        assert_eq!(accel.encoder(), "h264_nvenc");
    }

    #[test]
    fn test_linux_vaapi_when_only_render_node() {
        let accel = HwAccel::probe_with("linux", |p| p == Path::new(VAAPI_DEVICE));
        assert_eq!(accel, HwAccel::Vaapi);
    }

    #[test]
    fn test_linux_without_devices_is_software() {
        assert_eq!(HwAccel::probe_with("linux", |_| false), HwAccel::Software);
    }

    #[test]
    fn test_windows_uses_qsv() {
        assert_eq!(HwAccel::probe_with("windows", |_| false), HwAccel::Qsv);
    }

    #[test]
    fn test_other_platforms_use_software() {
        assert_eq!(HwAccel::probe_with("macos", |_| true), HwAccel::Software);
        assert_eq!(HwAccel::Software.encoder(), "libx264");
    }

    #[test]
    fn test_parse_round_trips_display() {
        for accel in [HwAccel::Nvenc, HwAccel::Vaapi, HwAccel::Qsv, HwAccel::Software] {
            assert_eq!(accel.to_string().parse::<HwAccel>(), Ok(accel));
        }
        assert!("cuda".parse::<HwAccel>().is_err());
    }
}
