//! Listener registry.
//!
//! [`Net`] hands out listeners, preferring ones inherited from the parent
//! process, and remembers every listener it handed out so that
//! [`Net::start_process`] can pass them on to the next process.

use std::ffi::OsString;
use std::net::TcpListener;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::addr::{same_addr, ListenAddr, Network, TcpAddr, UnixAddr};
use crate::error::{Error, Result};
use crate::inherit::{self, LISTEN_FDS, LISTEN_FDS_START};
use crate::listener::{self, Listener, UnixListener};
use crate::once::OnceGuard;
use crate::process::{self, capture_launch_context};

const DEFAULT_BACKLOG: i32 = 1024;

/// A listener owned by this process generation. Holds its own duplicate of
/// the descriptor so it outlives the caller's handle.
#[derive(Debug)]
struct ActiveListener {
    fd: OwnedFd,
    network: Network,
    addr: ListenAddr,
}

#[derive(Debug, Default)]
struct Registry {
    /// Claimed entries are set to `None` so indices stay stable.
    inherited: Vec<Option<Listener>>,
    /// Append-only.
    active: Vec<Arc<ActiveListener>>,
}

#[derive(Debug, Clone)]
struct Config {
    path_prefix: OsString,
    fd_start: RawFd,
    backlog: i32,
    listen_fds: Option<String>,
    args: Option<Vec<OsString>>,
    working_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path_prefix: OsString::new(),
            fd_start: LISTEN_FDS_START,
            backlog: DEFAULT_BACKLOG,
            listen_fds: None,
            args: None,
            working_dir: None,
        }
    }
}

/// Builder for [`Net`].
#[derive(Debug, Clone, Default)]
pub struct NetBuilder {
    config: Config,
}

impl NetBuilder {
    /// Builder seeded from `WADDLE_HANDOFF_PATH_PREFIX` and
    /// `WADDLE_HANDOFF_BACKLOG`. Unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        let mut builder = Self::default();
        if let Some(prefix) = std::env::var_os("WADDLE_HANDOFF_PATH_PREFIX") {
            builder = builder.path_prefix(prefix);
        }
        if let Some(backlog) = std::env::var("WADDLE_HANDOFF_BACKLOG")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            builder = builder.backlog(backlog);
        }
        builder
    }

    /// Prepended to `argv[0]` when locating the binary to restart.
    pub fn path_prefix(mut self, prefix: impl Into<OsString>) -> Self {
        self.config.path_prefix = prefix.into();
        self
    }

    /// Listen backlog for freshly bound sockets.
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.config.backlog = backlog;
        self
    }

    /// First inherited descriptor. Only test harnesses should change this.
    pub fn fd_start(mut self, fd: RawFd) -> Self {
        self.config.fd_start = fd;
        self
    }

    /// Use this value instead of reading `LISTEN_FDS` from the environment.
    pub fn listen_fds(mut self, value: impl Into<String>) -> Self {
        self.config.listen_fds = Some(value.into());
        self
    }

    /// Arguments for the next process (`args[0]` locates the binary).
    /// Defaults to the arguments this process was started with.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.config.args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    /// Working directory for the next process. Defaults to the directory
    /// this process was started in.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.working_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Net {
        capture_launch_context();
        Net {
            registry: Mutex::new(Registry::default()),
            inherit_once: OnceGuard::new(),
            start_once: OnceGuard::new(),
            kill_once: OnceGuard::new(),
            config: self.config,
        }
    }
}

/// Listener registry for graceful restarts.
///
/// Usually one per process, shared behind an `Arc` or a `static`.
pub struct Net {
    registry: Mutex<Registry>,
    inherit_once: OnceGuard<Result<()>>,
    start_once: OnceGuard<Result<i32>>,
    kill_once: OnceGuard<Result<()>>,
    config: Config,
}

impl Default for Net {
    fn default() -> Self {
        Self::new()
    }
}

impl Net {
    pub fn new() -> Self {
        NetBuilder::default().build()
    }

    pub fn builder() -> NetBuilder {
        NetBuilder::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load inherited listeners once. Later calls replay the first result.
    fn inherit(&self) -> Result<()> {
        self.inherit_once.run(|| {
            let value = match &self.config.listen_fds {
                Some(value) => Some(value.clone()),
                None => std::env::var_os(LISTEN_FDS).map(|v| v.to_string_lossy().into_owned()),
            };
            let count = inherit::parse_count(value.as_deref())?;

            let mut registry = self.registry();
            inherit::load(self.config.fd_start, count, &mut registry.inherited)
        })
    }

    /// Announce on `address` for a stream-oriented network: `tcp`, `tcp4`,
    /// `tcp6`, `unix` or `unixpacket`.
    ///
    /// Returns the inherited listener for the same network and address if
    /// there is one, otherwise binds a new one.
    pub fn listen(&self, network: &str, address: &str) -> Result<Listener> {
        let network: Network = network.parse()?;
        if network.is_tcp() {
            let addr = TcpAddr::resolve(network, address)?;
            self.listen_tcp(network, &addr).map(Listener::Tcp)
        } else {
            let addr = UnixAddr::new(network, address)?;
            self.listen_unix(network, &addr).map(Listener::Unix)
        }
    }

    /// Like [`Net::listen`] for `tcp`, `tcp4` or `tcp6`.
    pub fn listen_tcp(&self, network: Network, addr: &TcpAddr) -> Result<TcpListener> {
        if !network.is_tcp() {
            return Err(Error::UnknownNetwork(network.to_string()));
        }
        self.inherit()?;

        if let Some(listener) = self.claim(&ListenAddr::Tcp(*addr))? {
            return listener
                .into_tcp()
                .map_err(|other| Error::UnknownNetwork(other.network().to_string()));
        }

        let listener = listener::bind_tcp(network, addr, self.config.backlog)
            .map_err(|e| Error::bind(network, addr, e))?;
        let bound = listener
            .local_addr()
            .map(|a| ListenAddr::Tcp(TcpAddr::from(a)))
            .unwrap_or(ListenAddr::Tcp(*addr));
        self.record(&listener, network, bound)?;
        Ok(listener)
    }

    /// Like [`Net::listen`] for `unix` or `unixpacket`.
    pub fn listen_unix(&self, network: Network, addr: &UnixAddr) -> Result<UnixListener> {
        if !network.is_unix() || addr.network() != network {
            return Err(Error::UnknownNetwork(network.to_string()));
        }
        self.inherit()?;

        if let Some(listener) = self.claim(&ListenAddr::Unix(addr.clone()))? {
            return listener
                .into_unix()
                .map_err(|other| Error::UnknownNetwork(other.network().to_string()));
        }

        let listener = listener::bind_unix(addr, self.config.backlog)
            .map_err(|e| Error::bind(network, addr, e))?;
        let bound = ListenAddr::Unix(listener.local_addr().clone());
        self.record(&listener, network, bound)?;
        Ok(listener)
    }

    /// Take the first unclaimed inherited listener matching `wanted` and
    /// move it to the active set.
    fn claim(&self, wanted: &ListenAddr) -> Result<Option<Listener>> {
        let mut registry = self.registry();

        let found = registry.inherited.iter().position(|slot| {
            slot.as_ref()
                .and_then(|l| l.local_addr().ok())
                .is_some_and(|addr| same_addr(&addr, wanted))
        });
        let Some(index) = found else {
            return Ok(None);
        };
        let Some(listener) = registry.inherited[index].take() else {
            return Ok(None);
        };

        let fd = match listener.as_fd().try_clone_to_owned() {
            Ok(fd) => fd,
            Err(e) => {
                let err = Error::bind(listener.network(), wanted, e);
                registry.inherited[index] = Some(listener);
                return Err(err);
            }
        };

        let addr = listener.local_addr().unwrap_or_else(|_| wanted.clone());
        info!(
            fd = listener.as_raw_fd(),
            addr = %addr,
            requested = %wanted,
            "Claimed inherited listener"
        );
        registry.active.push(Arc::new(ActiveListener {
            fd,
            network: listener.network(),
            addr,
        }));
        Ok(Some(listener))
    }

    fn record(&self, listener: &impl AsFd, network: Network, addr: ListenAddr) -> Result<()> {
        let fd = listener
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| Error::bind(network, &addr, e))?;

        info!(
            fd = listener.as_fd().as_raw_fd(),
            network = %network,
            addr = %addr,
            "Bound fresh listener"
        );
        self.registry().active.push(Arc::new(ActiveListener { fd, network, addr }));
        Ok(())
    }

    /// Number of inherited listeners not yet claimed.
    pub fn unclaimed_count(&self) -> usize {
        self.registry().inherited.iter().flatten().count()
    }

    /// Number of listeners that will be passed on by [`Net::start_process`].
    pub fn active_count(&self) -> usize {
        self.registry().active.len()
    }

    /// Addresses of the active listeners, in handoff order.
    pub fn active_addrs(&self) -> Vec<ListenAddr> {
        self.registry()
            .active
            .iter()
            .map(|l| l.addr.clone())
            .collect()
    }

    /// Start a new process passing it the active listeners.
    ///
    /// This doesn't fork a copy of the running image: the binary is located
    /// again from the original `argv[0]`, so a freshly deployed build (or a
    /// symlink that now points to one) is what starts. Runs once; later
    /// calls return the first result. Returns the new process id.
    pub fn start_process(&self) -> Result<i32> {
        self.start_once.run(|| self.launch())
    }

    fn launch(&self) -> Result<i32> {
        let listeners: Vec<Arc<ActiveListener>> = self.registry().active.clone();

        // Closed when this function returns, whatever the outcome.
        let mut fds: Vec<OwnedFd> = Vec::with_capacity(listeners.len());
        for l in &listeners {
            let fd = l.fd.try_clone().map_err(|e| Error::DescriptorExtraction {
                fd: l.fd.as_raw_fd(),
                source: Arc::new(e),
            })?;
            fds.push(fd);
        }

        let context = capture_launch_context();
        let args = self.config.args.as_deref().unwrap_or(context.args());
        let working_dir = self
            .config
            .working_dir
            .as_deref()
            .or(context.working_dir());

        let mut program = self.config.path_prefix.clone();
        if let Some(arg0) = args.first() {
            program.push(arg0);
        }
        let program = PathBuf::from(program);

        let path_var = std::env::var_os("PATH");
        let exe = process::look_path(&program, working_dir, path_var.as_deref()).map_err(|e| {
            Error::PathResolution {
                program: program.clone(),
                source: Arc::new(e),
            }
        })?;

        let env = process::child_environment(std::env::vars_os(), fds.len());

        for l in &listeners {
            debug!(network = %l.network, addr = %l.addr, "Passing listener to new process");
        }
        info!(
            exe = %exe.display(),
            listener_count = fds.len(),
            "Starting new process"
        );

        let pid = process::spawn(&exe, args, &env, working_dir, &fds).map_err(|e| {
            Error::Launch {
                program: exe.clone(),
                source: Arc::new(e),
            }
        })?;

        info!(pid, exe = %exe.display(), "New process started");
        Ok(pid)
    }

    /// Send `signal` to `pid`, typically to stop the previous generation
    /// once this one is serving. Runs once; later calls return the first
    /// result without sending anything.
    pub fn kill(&self, pid: i32, signal: i32) -> Result<()> {
        self.kill_once.run(|| {
            // SAFETY: kill has no memory-safety preconditions.
            if unsafe { libc::kill(pid, signal) } != 0 {
                return Err(Error::Signal {
                    pid,
                    signal,
                    source: Arc::new(std::io::Error::last_os_error()),
                });
            }
            info!(pid, signal, "Sent signal");
            Ok(())
        })
    }
}
