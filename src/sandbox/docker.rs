//! Container runtime backed by the Docker CLI.

use super::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ExecSession, ExecSpec, RuntimeError,
    RuntimeResult,
};
use async_trait::async_trait;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const EXEC_CHANNEL_DEPTH: usize = 64;
const READ_CHUNK: usize = 4096;

/// Runs `docker` (or a compatible CLI such as `podman`) as a subprocess.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: PathBuf,
}

impl DockerCli {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, args: &[String]) -> RuntimeResult<std::process::Output> {
        debug!(bin = %self.bin.display(), ?args, "runtime command");
        Ok(Command::new(&self.bin).args(args).output().await?)
    }

    fn failure(&self, args: &[String], output: &std::process::Output) -> RuntimeError {
        RuntimeError::CommandFailed {
            command: format!("{} {}", self.bin.display(), args.join(" ")),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    async fn inspect_many(&self, names: &[String]) -> RuntimeResult<Vec<ContainerInfo>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["inspect".to_string(), "--type".into(), "container".into()];
        args.extend(names.iter().cloned());
        let output = self.run(&args).await?;
        // A missing container makes inspect exit non-zero but still print
        // the ones it found.
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() && stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") {
                return Ok(Vec::new());
            }
            return Err(self.failure(&args, &output));
        }
        parse_inspect(&stdout)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inspected {
    id: String,
    name: String,
    state: InspectedState,
    network_settings: Option<InspectedNetwork>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedState {
    running: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedNetwork {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<PortBinding>>>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    host_port: String,
}

fn parse_inspect(stdout: &str) -> RuntimeResult<Vec<ContainerInfo>> {
    let inspected: Vec<Inspected> =
        serde_json::from_str(stdout).map_err(|e| RuntimeError::Parse(e.to_string()))?;
    Ok(inspected
        .into_iter()
        .map(|c| {
            let mut ports = HashMap::new();
            let published = c.network_settings.and_then(|n| n.ports).unwrap_or_default();
            for (key, bindings) in published {
                // "5173/tcp" -> 5173
                let Some(container_port) = key.split('/').next().and_then(|p| p.parse().ok()) else {
                    continue;
                };
                let host_port = bindings
                    .unwrap_or_default()
                    .iter()
                    .find_map(|b| b.host_port.parse::<u16>().ok().filter(|p| *p != 0));
                if let Some(host_port) = host_port {
                    ports.insert(container_port, host_port);
                }
            }
            ContainerInfo {
                id: c.id,
                name: c.name.trim_start_matches('/').to_string(),
                running: c.state.running,
                ports,
            }
        })
        .collect())
}

fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".into(),
        spec.name.clone(),
        "--user".into(),
        spec.user.clone(),
        "--workdir".into(),
        spec.mount_point.clone(),
        // Empty host port: the OS picks one.
        "-p".into(),
        spec.service_port.to_string(),
        "-v".into(),
        format!("{}:{}", spec.host_dir.display(), spec.mount_point),
        "-i".into(),
        "-t".into(),
    ];
    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn inspect(&self, name_or_id: &str) -> RuntimeResult<Option<ContainerInfo>> {
        Ok(self
            .inspect_many(&[name_or_id.to_string()])
            .await?
            .into_iter()
            .next())
    }

    async fn list(&self, prefix: &str) -> RuntimeResult<Vec<ContainerInfo>> {
        let args = vec![
            "ps".to_string(),
            "-a".into(),
            "--filter".into(),
            format!("name=^{prefix}"),
            "--format".into(),
            "{{.Names}}".into(),
        ];
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(self.failure(&args, &output));
        }
        let names: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|n| n.starts_with(prefix))
            .map(str::to_string)
            .collect();
        self.inspect_many(&names).await
    }

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let args = create_args(spec);
        let output = self.run(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("already in use") || stderr.contains("Conflict") {
                return Err(RuntimeError::Conflict(spec.name.clone()));
            }
            return Err(self.failure(&args, &output));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::Parse("create printed no container id".into()));
        }
        info!(name = %spec.name, id = %id, image = %spec.image, "container created");
        Ok(id)
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        let args = vec!["start".to_string(), id.to_string()];
        let output = self.run(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") {
                return Err(RuntimeError::NotFound(id.to_string()));
            }
            return Err(self.failure(&args, &output));
        }
        info!(id, "container started");
        Ok(())
    }

    async fn exec_interactive(&self, id: &str, spec: &ExecSpec) -> RuntimeResult<ExecSession> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RuntimeError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&self.bin);
        cmd.args([
            "exec",
            "-i",
            "-t",
            "-u",
            spec.user.as_str(),
            "-w",
            spec.workdir.as_str(),
            id,
        ]);
        cmd.args(&spec.command);
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| RuntimeError::Pty(e.to_string()))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| RuntimeError::Pty(e.to_string()))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| RuntimeError::Pty(e.to_string()))?;
        let mut killer = child.clone_killer();
        let master = pair.master;

        let (out_tx, out_rx) = mpsc::channel(EXEC_CHANNEL_DEPTH);
        let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(EXEC_CHANNEL_DEPTH);

        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if out_tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = out_tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        });

        tokio::task::spawn_blocking(move || {
            while let Some(bytes) = in_rx.blocking_recv() {
                if let Err(e) = writer.write_all(&bytes).and_then(|()| writer.flush()) {
                    debug!(error = %e, "exec stdin closed");
                    break;
                }
            }
        });

        let container = id.to_string();
        tokio::task::spawn_blocking(move || match child.wait() {
            Ok(status) => debug!(container = %container, ?status, "exec exited"),
            Err(e) => warn!(container = %container, error = %e, "exec wait failed"),
        });

        info!(id, command = ?spec.command, "exec attached");
        Ok(ExecSession::new(out_rx, in_tx, move || {
            if let Err(e) = killer.kill() {
                debug!(error = %e, "exec already gone");
            }
            drop(master);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspect_output_yields_published_ports() {
        let stdout = r#"[{
            "Id": "abc123",
            "Name": "/project-p1",
            "State": {"Status": "running", "Running": true},
            "NetworkSettings": {"Ports": {
                "5173/tcp": [{"HostIp": "0.0.0.0", "HostPort": "49153"}, {"HostIp": "::", "HostPort": "49153"}],
                "22/tcp": null
            }}
        }]"#;
        let info = parse_inspect(stdout).unwrap().remove(0);
        assert_eq!(info.id, "abc123");
        assert_eq!(info.name, "project-p1");
        assert!(info.running);
        assert_eq!(info.host_port(5173), Some(49153));
        assert_eq!(info.host_port(22), None);
    }

    #[test]
    fn stopped_container_has_no_ports() {
        let stdout = r#"[{
            "Id": "abc123",
            "Name": "/project-p1",
            "State": {"Status": "exited", "Running": false},
            "NetworkSettings": {"Ports": {}}
        }]"#;
        let info = parse_inspect(stdout).unwrap().remove(0);
        assert!(!info.running);
        assert!(info.ports.is_empty());
    }

    #[test]
    fn create_publishes_service_port_and_mounts_project() {
        let spec = ContainerSpec {
            name: "project-p1".into(),
            image: "sandbox".into(),
            user: "sandbox".into(),
            env: vec![("HOST".into(), "0.0.0.0".into())],
            service_port: 5173,
            host_dir: PathBuf::from("/tmp/p1"),
            mount_point: "/home/sandbox/app".into(),
            labels: vec![("collabd.project".into(), "p1".into())],
            command: vec!["bash".into()],
        };
        let args = create_args(&spec);
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name project-p1"));
        assert!(joined.contains("-p 5173 "));
        assert!(joined.contains("-v /tmp/p1:/home/sandbox/app"));
        assert!(joined.contains("-e HOST=0.0.0.0"));
        assert!(joined.ends_with("sandbox bash"));
    }
}
