use std::process::{Command, Stdio};

/// Availability of the external binaries the engine shells out to
#[derive(Debug, Clone)]
pub struct DependencyStatus {
    pub ffmpeg: bool,
}

impl DependencyStatus {
    /// Probe the configured encoder binary
    pub fn check(ffmpeg_path: &str) -> Self {
        Self {
            ffmpeg: check_command(ffmpeg_path, &["-version"]),
        }
    }

    pub fn all_present(&self) -> bool {
        self.ffmpeg
    }
}

/// Check if a command runs at all
fn check_command(cmd: &str, args: &[&str]) -> bool {
    Command::new(cmd)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_reported_absent() {
        let status = DependencyStatus::check("/definitely/not/an/encoder");
        assert!(!status.ffmpeg);
        assert!(!status.all_present());
    }
}
