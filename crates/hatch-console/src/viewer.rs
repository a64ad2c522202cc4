//! Launching an external SPICE viewer.

use crate::error::{Error, Result};

/// Starts a graphical viewer pointed at a proxy URI.
pub trait ViewerLauncher: Send + Sync {
    /// `Ok(None)` when no viewer is available on this host.
    fn launch(&self, uri: &str) -> Result<Option<tokio::process::Child>>;
}

/// Tries each configured viewer command in order.
#[derive(Debug, Clone)]
pub struct CommandViewer {
    candidates: Vec<hatch_config::ViewerCandidate>,
}

impl CommandViewer {
    #[must_use]
    pub fn new(config: &hatch_config::ViewerConfig) -> Self {
        Self {
            candidates: config.candidates.clone(),
        }
    }
}

impl ViewerLauncher for CommandViewer {
    fn launch(&self, uri: &str) -> Result<Option<tokio::process::Child>> {
        for candidate in &self.candidates {
            let spawned = tokio::process::Command::new(&candidate.program)
                .args(candidate.args_for(uri))
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .kill_on_drop(true)
                .spawn();
            match spawned {
                Ok(child) => {
                    tracing::info!("started viewer {}", candidate.program);
                    return Ok(Some(child));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!("viewer {} not found", candidate.program);
                }
                Err(e) => {
                    return Err(Error::Viewer(format!(
                        "failed to start {}: {e}",
                        candidate.program
                    )));
                }
            }
        }
        Ok(None)
    }
}

/// Never launches anything; the user connects a viewer by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoViewer;

impl ViewerLauncher for NoViewer {
    fn launch(&self, _uri: &str) -> Result<Option<tokio::process::Child>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viewer(candidates: &[(&str, &[&str])]) -> CommandViewer {
        CommandViewer::new(&hatch_config::ViewerConfig {
            candidates: candidates
                .iter()
                .map(|(program, args)| hatch_config::ViewerCandidate {
                    program: (*program).to_string(),
                    args: args.iter().map(|a| (*a).to_string()).collect(),
                })
                .collect(),
        })
    }

    #[tokio::test]
    async fn test_missing_viewers_yield_none() {
        let viewer = viewer(&[("hatch-no-such-viewer", &["{uri}"])]);
        assert!(viewer.launch("spice://127.0.0.1:1").unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_falls_through_to_next_candidate() {
        let viewer = viewer(&[
            ("hatch-no-such-viewer", &["{uri}"]),
            ("sh", &["-c", "test \"$0\" = spice://127.0.0.1:1", "{uri}"]),
        ]);
        let mut child = viewer.launch("spice://127.0.0.1:1").unwrap().unwrap();
        assert!(child.wait().await.unwrap().success());
    }
}
