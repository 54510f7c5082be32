use super::CommandSpec;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::time::{timeout, Duration};

const KILL_SETTLE: Duration = Duration::from_secs(2);

/// Environment applied to every spawned command when running non-interactively in CI.
fn ci_env(spec: &CommandSpec) -> Vec<(&'static str, &'static str)> {
    let mut vars = vec![("CI", "1")];
    for (key, value) in [("FORCE_COLOR", "0"), ("TERM", "dumb")] {
        if !spec.env.contains_key(key) && std::env::var_os(key).is_none() {
            vars.push((key, value));
        }
    }
    vars
}

pub(crate) fn shell_command(spec: &CommandSpec, ci: bool) -> Command {
    #[cfg(unix)]
    let mut command = {
        let mut command = Command::new("sh");
        command.arg("-c").arg(&spec.command);
        // Own process group so termination reaches everything the shell started.
        // Attached commands stay in the foreground group to keep terminal input.
        if !spec.attach_terminal {
            command.process_group(0);
        }
        command
    };

    #[cfg(windows)]
    let mut command = {
        let mut command = Command::new("cmd");
        command.args(["/d", "/s", "/c"]).arg(&spec.command);
        command
    };

    command.current_dir(&spec.working_dir).kill_on_drop(true);

    if ci && !spec.attach_terminal {
        for (key, value) in ci_env(spec) {
            command.env(key, value);
        }
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    if spec.attach_terminal {
        command
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
    } else {
        command
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
    }
    command
}

pub(crate) fn spawn_error_message(spec: &CommandSpec, error: &std::io::Error) -> String {
    if !spec.working_dir.exists() {
        return format!("working directory not found: {}", spec.working_dir.display());
    }
    format!("failed to spawn process: {}", error)
}

pub(crate) fn exit_code_of(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Graceful terminate, then force kill once `grace` has elapsed.
pub(crate) async fn terminate_then_kill(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = child.id() else {
            return;
        };
        let group = Pid::from_raw(pid as i32);
        let _ = killpg(group, Signal::SIGTERM);

        let exited = timeout(grace, child.wait()).await.is_ok();
        // Sweep the group either way: the shell may exit while its children linger.
        let _ = killpg(group, Signal::SIGKILL);
        if exited {
            return;
        }
    }

    #[cfg(windows)]
    {
        if let Some(pid) = child.id() {
            let _ = Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .output()
                .await;
        }
        if timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }

    let _ = child.start_kill();
    let _ = timeout(KILL_SETTLE, child.wait()).await;
}
