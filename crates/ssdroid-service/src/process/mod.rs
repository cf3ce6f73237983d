//! Guarded native processes
//!
//! Every process started by [`GuardedProcessPool`] is supervised by a guard task that respawns it when it exits.
//! A process that exits within [`MIN_VIABLE_RUNTIME`] is considered broken and is not respawned.
//!
//! ```plain
//!   start() ──> Starting ──> Running ──> Exited ──(ran long enough)──> Starting ──> ...
//!                                          │
//!                                          └──(exited too fast)──> Dead
//! ```

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use cfg_if::cfg_if;
use futures::future::{self, BoxFuture};
use log::{debug, error, info, trace, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::{oneshot, watch},
    task::JoinHandle,
    time,
};

pub use self::scanner::{NoopProcessScanner, ProcessScanner};

mod scanner;

/// A process exiting sooner than this after being spawned is not respawned
pub const MIN_VIABLE_RUNTIME: Duration = Duration::from_secs(1);

const TERMINATE_WAIT: Duration = Duration::from_millis(500);
const KILL_WAIT: Duration = Duration::from_millis(1000);

/// Guarded process error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The process could not be spawned
    #[error("failed to launch {name}, {source}")]
    LaunchFailure {
        name: String,
        #[source]
        source: io::Error,
    },
    /// The process exited within the minimum viable runtime
    #[error("{name} exits too fast")]
    CrashLoop { name: String },
}

impl Error {
    /// Command name of the failing process
    pub fn name(&self) -> &str {
        match *self {
            Error::LaunchFailure { ref name, .. } => name,
            Error::CrashLoop { ref name } => name,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::LaunchFailure { source, .. } => source,
            e => io::Error::new(ErrorKind::Other, e),
        }
    }
}

/// Lifecycle of a guarded process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Being spawned
    Starting,
    /// Spawned and not yet exited
    Running,
    /// Exited, a respawn decision is pending
    Exited,
    /// No longer guarded, either stopped by [`GuardedProcessPool::kill_all`] or given up on
    Dead,
}

/// Receives errors that stopped a guard
pub type FatalCallback = Arc<dyn Fn(Error) + Send + Sync>;

/// Invoked after every respawn
pub type RestartCallback = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Observer of one guarded process
#[derive(Clone)]
pub struct ProcessHandle {
    name: Arc<str>,
    state: watch::Receiver<GuardState>,
    spawns: Arc<AtomicUsize>,
}

impl ProcessHandle {
    /// Command name, the executable's file stem
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> GuardState {
        *self.state.borrow()
    }

    /// Number of times the process has been spawned
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::Acquire)
    }

    /// Wait until the guard reaches a state satisfying `f`
    pub async fn wait_for_state<F>(&mut self, f: F) -> GuardState
    where
        F: FnMut(&GuardState) -> bool,
    {
        match self.state.wait_for(f).await {
            Ok(state) => *state,
            // The guard is gone
            Err(..) => GuardState::Dead,
        }
    }
}

struct Guard {
    name: Arc<str>,
    abort_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// A set of native processes, each restarted when it exits
pub struct GuardedProcessPool {
    sandbox_dir: PathBuf,
    on_fatal: FatalCallback,
    guards: Mutex<Vec<Guard>>,
}

impl GuardedProcessPool {
    /// Create a pool, processes run in `sandbox_dir` and errors stopping a guard go to `on_fatal`
    pub fn new<P: Into<PathBuf>>(sandbox_dir: P, on_fatal: FatalCallback) -> GuardedProcessPool {
        GuardedProcessPool {
            sandbox_dir: sandbox_dir.into(),
            on_fatal,
            guards: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `argv` and start guarding it
    ///
    /// The first spawn happens before returning, so a missing executable fails here with
    /// [`Error::LaunchFailure`]. Must be called inside of a tokio runtime.
    pub fn start(&self, argv: Vec<String>, on_restart: Option<RestartCallback>) -> io::Result<ProcessHandle> {
        let program = match argv.first() {
            Some(p) => p,
            None => return Err(io::Error::new(ErrorKind::InvalidInput, "empty command line")),
        };
        let name: Arc<str> = command_name(program).into();

        debug!("start process: {}", argv.join(" "));
        let child = match spawn_child(&argv, &self.sandbox_dir) {
            Ok(c) => c,
            Err(source) => {
                error!("failed to launch {}, error: {}", name, source);
                return Err(Error::LaunchFailure {
                    name: name.to_string(),
                    source,
                }
                .into());
            }
        };

        let (state_tx, state_rx) = watch::channel(GuardState::Running);
        let (abort_tx, abort_rx) = oneshot::channel();
        let spawns = Arc::new(AtomicUsize::new(1));

        let looper = GuardLooper {
            name: name.clone(),
            argv,
            sandbox_dir: self.sandbox_dir.clone(),
            state: state_tx,
            spawns: spawns.clone(),
            on_fatal: self.on_fatal.clone(),
            on_restart,
        };
        let task = tokio::spawn(looper.run(child, abort_rx));

        self.guards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Guard {
                name: name.clone(),
                abort_tx,
                task,
            });

        Ok(ProcessHandle {
            name,
            state: state_rx,
            spawns,
        })
    }

    /// Stop every guard and terminate its process, returns when all of them are gone
    pub async fn kill_all(&self) {
        let guards = std::mem::take(&mut *self.guards.lock().unwrap_or_else(PoisonError::into_inner));
        if guards.is_empty() {
            return;
        }

        let mut tasks = Vec::with_capacity(guards.len());
        for guard in guards {
            trace!("stopping guard of {}", guard.name);
            let _ = guard.abort_tx.send(());
            tasks.push(guard.task);
        }

        for result in future::join_all(tasks).await {
            if let Err(err) = result {
                error!("process guard task failed, error: {}", err);
            }
        }
    }

    /// Number of active guards
    pub fn len(&self) -> usize {
        self.guards.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct GuardLooper {
    name: Arc<str>,
    argv: Vec<String>,
    sandbox_dir: PathBuf,
    state: watch::Sender<GuardState>,
    spawns: Arc<AtomicUsize>,
    on_fatal: FatalCallback,
    on_restart: Option<RestartCallback>,
}

impl GuardLooper {
    async fn run(self, mut child: Child, mut abort_rx: oneshot::Receiver<()>) {
        let mut first_run = true;

        loop {
            let start_time = Instant::now();
            pump_output(&self.name, &mut child);
            self.state.send_replace(GuardState::Running);

            tokio::select! {
                _ = &mut abort_rx => {
                    debug!("guard stopped, destroy process: {}", self.name);
                    terminate(&self.name, &mut child).await;
                    self.state.send_replace(GuardState::Dead);
                    return;
                }
                status = child.wait() => {
                    self.state.send_replace(GuardState::Exited);
                    log_exit(&self.name, status);
                }
            }

            if start_time.elapsed() < MIN_VIABLE_RUNTIME {
                warn!("process exit too fast, stop guard: {}", self.name);
                self.state.send_replace(GuardState::Dead);
                if first_run {
                    (self.on_fatal)(Error::CrashLoop {
                        name: self.name.to_string(),
                    });
                }
                return;
            }

            self.state.send_replace(GuardState::Starting);
            debug!("restart process: {}", self.argv.join(" "));
            child = match spawn_child(&self.argv, &self.sandbox_dir) {
                Ok(c) => c,
                Err(source) => {
                    error!("failed to respawn {}, error: {}", self.name, source);
                    self.state.send_replace(GuardState::Dead);
                    (self.on_fatal)(Error::LaunchFailure {
                        name: self.name.to_string(),
                        source,
                    });
                    return;
                }
            };
            self.spawns.fetch_add(1, Ordering::AcqRel);
            first_run = false;

            if let Some(ref on_restart) = self.on_restart {
                tokio::select! {
                    _ = &mut abort_rx => {
                        terminate(&self.name, &mut child).await;
                        self.state.send_replace(GuardState::Dead);
                        return;
                    }
                    _ = on_restart() => {}
                }
            }
        }
    }
}

fn command_name(program: &str) -> String {
    Path::new(program)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_owned())
}

fn spawn_child(argv: &[String], sandbox_dir: &Path) -> io::Result<Child> {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(sandbox_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.spawn()
}

fn pump_output(name: &Arc<str>, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_lines(name.clone(), stdout, false));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_lines(name.clone(), stderr, true));
    }
}

async fn pump_lines<R>(name: Arc<str>, reader: R, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    // read errors only mean the pipe is gone
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            error!(target: &*name, "{}", line);
        } else {
            info!(target: &*name, "{}", line);
        }
    }
}

fn log_exit(name: &str, status: io::Result<ExitStatus>) {
    match status {
        Ok(status) => debug!("process {} exited with {}", name, status),
        Err(err) => error!("process {} waitpid error: {}", name, err),
    }
}

/// Terminate `child`, escalating from SIGTERM to SIGKILL
async fn terminate(name: &str, child: &mut Child) {
    if send_sigterm(name, child) {
        if let Ok(status) = time::timeout(TERMINATE_WAIT, child.wait()).await {
            debug!("process {} is terminated gracefully with {:?}", name, status);
            return;
        }
    }

    if let Err(err) = child.start_kill() {
        // already reaped
        trace!("killing process {}, error: {}", name, err);
    }
    if time::timeout(KILL_WAIT, child.wait()).await.is_ok() {
        return;
    }

    warn!("process {} isn't terminated in {:?}", name, TERMINATE_WAIT + KILL_WAIT);
    let _ = child.wait().await;
}

cfg_if! {
    if #[cfg(unix)] {
        /// Ask `child` to exit, `false` if it could not be signaled
        fn send_sigterm(name: &str, child: &Child) -> bool {
            let id = match child.id() {
                Some(id) => id,
                None => return false,
            };
            let ret = unsafe { libc::kill(id as libc::pid_t, libc::SIGTERM) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                error!("terminating process {} ({}), error: {}", name, id, err);
                return false;
            }
            true
        }
    } else {
        fn send_sigterm(_name: &str, _child: &Child) -> bool {
            false
        }
    }
}
