//! Spawning a debuggee process under the debug client.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use tempfile::NamedTempFile;

use crate::config::ManagerConfig;
use crate::error::SessionError;

/// What to run under the debugger.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub script: PathBuf,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
}

impl LaunchOptions {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
            working_directory: None,
        }
    }
}

/// A spawned debuggee process, killed when dropped.
///
/// Holds the one-time token file alive for the child's lifetime so the token
/// never crosses the command line.
pub(crate) struct SpawnedDebuggee {
    child: Child,
    _auth_file: NamedTempFile,
}

impl SpawnedDebuggee {
    pub(crate) fn spawn(
        config: &ManagerConfig,
        listen_port: u16,
        procuuid: &str,
        password: &str,
        options: &LaunchOptions,
    ) -> Result<Self, SessionError> {
        if !cfg!(any(unix, windows)) {
            return Err(SessionError::SpawnUnsupported(
                std::env::consts::OS.to_owned(),
            ));
        }

        let auth_file = write_auth_file(password)?;
        let mut command = build_command(config, listen_port, procuuid, options);
        command.env("DEBUG_CLIENT_AUTH_FILE", auth_file.path());
        if let Some(dir) = &options.working_directory {
            command.current_dir(dir);
        }

        tracing::debug!(
            port = listen_port,
            script = %options.script.display(),
            "starting debuggee process"
        );
        let child = command.spawn()?;
        Ok(Self {
            child,
            _auth_file: auth_file,
        })
    }

    pub(crate) fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for SpawnedDebuggee {
    fn drop(&mut self) {
        if let Ok(Some(status)) = self.child.try_wait() {
            tracing::debug!(%status, "debuggee already exited");
            return;
        }
        tracing::debug!("terminating debuggee");
        match self.child.kill() {
            Ok(_) => {
                tracing::debug!("debuggee terminated");
                let _ = self.child.wait();
            }
            Err(e) => tracing::warn!(error = %e, "could not terminate debuggee process"),
        }
    }
}

/// The argument list passed to the client binary.
pub(crate) fn client_arguments(
    config: &ManagerConfig,
    listen_port: u16,
    procuuid: &str,
    options: &LaunchOptions,
) -> Vec<String> {
    let mut args = vec![
        "--host".to_owned(),
        config.listen_host.clone(),
        "--port".to_owned(),
        listen_port.to_string(),
        "--procuuid".to_owned(),
        procuuid.to_owned(),
        "--".to_owned(),
        options.script.to_string_lossy().into_owned(),
    ];
    args.extend(options.args.iter().cloned());
    args
}

fn build_command(
    config: &ManagerConfig,
    listen_port: u16,
    procuuid: &str,
    options: &LaunchOptions,
) -> Command {
    let args = client_arguments(config, listen_port, procuuid, options);
    match &config.terminal {
        // Run inside the user's terminal so console-mode scripts keep a
        // screen of their own.
        Some(template) => {
            let mut rendered = config.client_binary.to_string_lossy().into_owned();
            for arg in &args {
                rendered.push(' ');
                rendered.push_str(arg);
            }
            let line = template.replace("{command}", &rendered);
            let mut command = Command::new("sh");
            command.arg("-c").arg(line);
            command
        }
        None => {
            let mut command = Command::new(&config.client_binary);
            command
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            command
        }
    }
}

fn write_auth_file(password: &str) -> Result<NamedTempFile, SessionError> {
    let mut file = tempfile::Builder::new()
        .prefix("debug-auth-")
        .tempfile()?;
    // The token must not be readable by other users.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(password.as_bytes())?;
    file.flush()?;
    Ok(file)
}
