//! Echo server configuration.
//!
//! Listeners come from the command line (`--listen <network>=<address>`);
//! restart behaviour comes from environment variables.
//!
//! # Environment Variables
//!
//! - `LISTEN_FDS`: Set by the previous generation when listeners were handed down
//! - `LISTEN_PID`: Set by systemd socket activation. When it names this
//!   process the parent is the service manager and is never signalled
//! - `WADDLE_HANDOFF_KILL_PARENT`: Stop the previous generation once serving
//!   (`true`/`false`). Default: `true`

use std::fmt;
use std::str::FromStr;

use tracing::info;
use waddle_handoff::LISTEN_FDS;

/// One `--listen` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenArg {
    pub network: String,
    pub address: String,
}

impl FromStr for ListenArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (network, address) = s
            .split_once('=')
            .ok_or_else(|| format!("expected <network>=<address>, got {s:?}"))?;
        if network.is_empty() {
            return Err(format!("missing network in {s:?}"));
        }
        Ok(Self {
            network: network.to_string(),
            address: address.to_string(),
        })
    }
}

impl fmt::Display for ListenArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.network, self.address)
    }
}

/// Restart-related configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct EchoConfig {
    /// Whether this process was started with inherited listeners.
    pub inherited: bool,
    /// Listeners came from systemd socket activation, not a previous generation.
    pub socket_activated: bool,
    /// Send SIGTERM to the parent once serving on inherited listeners.
    pub kill_parent: bool,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            inherited: false,
            socket_activated: false,
            kill_parent: true,
        }
    }
}

impl EchoConfig {
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var(LISTEN_FDS).ok().as_deref(),
            std::env::var("LISTEN_PID").ok().as_deref(),
            std::env::var("WADDLE_HANDOFF_KILL_PARENT").ok().as_deref(),
            std::process::id(),
        )
    }

    fn from_values(
        listen_fds: Option<&str>,
        listen_pid: Option<&str>,
        kill_parent: Option<&str>,
        own_pid: u32,
    ) -> Self {
        let inherited = listen_fds
            .and_then(|v| v.parse::<usize>().ok())
            .is_some_and(|count| count > 0);
        let socket_activated = listen_pid
            .and_then(|v| v.parse::<u32>().ok())
            .is_some_and(|pid| pid == own_pid);

        let kill_parent = match kill_parent.map(str::to_lowercase).as_deref() {
            Some("false" | "0" | "no" | "off") => false,
            _ => true,
        };

        Self {
            inherited,
            socket_activated,
            kill_parent,
        }
    }

    /// Whether the parent is a previous generation that should be stopped.
    pub fn should_stop_parent(&self) -> bool {
        self.inherited && self.kill_parent && !self.socket_activated
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        if self.socket_activated {
            info!("Started by socket activation");
        } else if self.inherited {
            info!("Started by a previous generation (inherited listeners)");
        } else {
            info!("Cold start");
        }
        info!("Kill parent after handoff: {}", self.kill_parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_arg_parsing() {
        let arg: ListenArg = "tcp=:7007".parse().unwrap();
        assert_eq!(arg.network, "tcp");
        assert_eq!(arg.address, ":7007");
        assert_eq!(arg.to_string(), "tcp=:7007");

        let arg: ListenArg = "unix=/run/echo=1.sock".parse().unwrap();
        assert_eq!(arg.address, "/run/echo=1.sock");

        assert!("tcp:7007".parse::<ListenArg>().is_err());
        assert!("=:7007".parse::<ListenArg>().is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = EchoConfig::from_values(None, None, None, 100);
        assert!(!config.inherited);
        assert!(config.kill_parent);
        assert!(!config.should_stop_parent());
    }

    #[test]
    fn test_config_from_values() {
        let config = EchoConfig::from_values(Some("2"), None, Some("OFF"), 100);
        assert!(config.inherited);
        assert!(!config.kill_parent);
        assert!(!config.should_stop_parent());

        assert!(!EchoConfig::from_values(Some("0"), None, None, 100).inherited);
        assert!(!EchoConfig::from_values(Some("abc"), None, None, 100).inherited);
    }

    #[test]
    fn test_socket_activation_keeps_parent() {
        // systemd names us in LISTEN_PID: the parent is the service manager.
        let activated = EchoConfig::from_values(Some("1"), Some("100"), None, 100);
        assert!(activated.socket_activated);
        assert!(!activated.should_stop_parent());

        // A stale LISTEN_PID from an earlier generation is not ours.
        let handed_down = EchoConfig::from_values(Some("1"), Some("42"), None, 100);
        assert!(!handed_down.socket_activated);
        assert!(handed_down.should_stop_parent());
    }
}
