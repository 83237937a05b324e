//! External in-place converter
//!
//! Writes the domain description into the work directory and runs the
//! configured program against it, with output appended to a log file next
//! to the descriptor.

use crate::capabilities::{ConversionJob, Converter};
use crate::descriptor::render_libvirt_xml;
use crate::error::{ProviderError, ProviderResult};

use async_trait::async_trait;
use convhost_common::{ConversionConfig, VmSpec};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::info;

/// Descriptor file name inside the work directory
pub const DESCRIPTOR_FILE: &str = "metadata.xml";
/// Converter log file name inside the work directory
pub const LOG_FILE: &str = "virt-v2v.log";

pub struct CommandConverter {
    config: ConversionConfig,
    work_dir: PathBuf,
}

impl CommandConverter {
    pub fn new(config: ConversionConfig, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            work_dir: work_dir.into(),
        }
    }

    fn args(&self, descriptor: &Path) -> Vec<String> {
        let descriptor = descriptor.display().to_string();
        self.config
            .args
            .iter()
            .map(|arg| arg.replace("{descriptor}", &descriptor))
            .collect()
    }
}

#[async_trait]
impl Converter for CommandConverter {
    async fn start(&self, spec: &VmSpec) -> ProviderResult<Box<dyn ConversionJob>> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let descriptor = self.work_dir.join(DESCRIPTOR_FILE);
        tokio::fs::write(&descriptor, render_libvirt_xml(spec)?).await?;

        let log_path = self.work_dir.join(LOG_FILE);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let stderr = log.try_clone()?;

        let args = self.args(&descriptor);
        let child = Command::new(&self.config.program)
            .args(&args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| {
                ProviderError::Converter(format!("failed to start {}: {e}", self.config.program))
            })?;

        info!(
            "Started {} {} (pid {:?}), log in {}",
            self.config.program,
            args.join(" "),
            child.id(),
            log_path.display()
        );
        Ok(Box::new(CommandJob { child }))
    }
}

pub struct CommandJob {
    child: Child,
}

#[async_trait]
impl ConversionJob for CommandJob {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> ProviderResult<i32> {
        let status = self.child.wait().await?;
        // Killed by a signal: no exit code
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convhost_common::CpuTopology;
    use std::collections::BTreeMap;

    fn spec() -> VmSpec {
        VmSpec {
            name: "web01".to_string(),
            cpu: CpuTopology::default(),
            memory: 1 << 30,
            disks: vec!["d1".to_string()],
            disk_paths: vec![PathBuf::from("/dev/vdb")],
            nics: Vec::new(),
            operating_system: None,
        }
    }

    fn shell(script: &str) -> ConversionConfig {
        ConversionConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "sh".to_string(), "{descriptor}".to_string()],
            env: BTreeMap::from([("CONVHOST_TEST".to_string(), "yes".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_successful_conversion_logs_output() {
        let dir = tempfile::tempdir().unwrap();
        let converter = CommandConverter::new(
            shell("echo converting $1 $CONVHOST_TEST; test -s \"$1\""),
            dir.path(),
        );

        let mut job = converter.start(&spec()).await.unwrap();
        assert!(job.pid().is_some());
        assert_eq!(job.wait().await.unwrap(), 0);

        let log = std::fs::read_to_string(dir.path().join(LOG_FILE)).unwrap();
        assert!(log.contains("metadata.xml yes"));
        let xml = std::fs::read_to_string(dir.path().join(DESCRIPTOR_FILE)).unwrap();
        assert!(xml.contains("/dev/vdb"));
    }

    #[tokio::test]
    async fn test_failing_conversion_reports_status() {
        let dir = tempfile::tempdir().unwrap();
        let converter = CommandConverter::new(shell("echo boom >&2; exit 1"), dir.path());
        let mut job = converter.start(&spec()).await.unwrap();
        assert_eq!(job.wait().await.unwrap(), 1);
        let log = std::fs::read_to_string(dir.path().join(LOG_FILE)).unwrap();
        assert!(log.contains("boom"));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConversionConfig {
            program: "/nonexistent/virt-v2v".to_string(),
            ..ConversionConfig::default()
        };
        let err = CommandConverter::new(config, dir.path())
            .start(&spec())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::Converter(_)));
    }

    #[test]
    fn test_descriptor_placeholder() {
        let converter = CommandConverter::new(ConversionConfig::default(), "/tmp/web01");
        assert_eq!(
            converter.args(Path::new("/tmp/web01/metadata.xml")),
            vec!["--verbose", "-i", "libvirtxml", "/tmp/web01/metadata.xml", "--in-place"]
        );
    }
}
