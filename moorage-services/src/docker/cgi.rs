use std::{
    cell::RefCell,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    rc::Rc,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use http::{
    header::{CONTENT_LENGTH, CONTENT_TYPE, HOST},
    StatusCode,
};
use moorage_core::{
    agent::{Docker, Harbor, TimerHandler},
    error::HttpError,
    ship::{CgiProcess, CgiStdErrShip, CgiStdOutShip},
    tour::{Tour, TourId, TourKey},
    transporter::Timeouts,
};
use tracing::{debug, info, warn};

use super::resolve;

const SERVER_SOFTWARE: &str = concat!("moorage/", env!("CARGO_PKG_VERSION"));

/// Process slots of one CGI route, shared by every agent.
#[derive(Debug, Clone)]
pub struct CgiSlots {
    running: Arc<AtomicUsize>,
    max: usize,
}

impl CgiSlots {
    pub fn new(max: usize) -> Self {
        Self {
            running: Arc::new(AtomicUsize::new(0)),
            max: max.max(1),
        }
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    fn acquire(&self) -> bool {
        self.running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        let _ = self
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Children whose output was consumed but which have not exited yet.
///
/// Polled on every agent ring; children outliving their deadline are killed.
#[derive(Clone, Default)]
pub struct Reaper {
    children: Rc<RefCell<Vec<(Child, Instant)>>>,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.children.borrow().len()
    }

    fn adopt(&self, child: Child, deadline: Instant) {
        self.children.borrow_mut().push((child, deadline));
    }

    /// Waits for exited children and kills the overdue ones. Returns how many are
    /// still pending.
    pub fn reap(&self, now: Instant) -> usize {
        let mut children = self.children.borrow_mut();
        children.retain_mut(|(child, deadline)| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = child.id(), %status, "cgi child reaped");
                false
            }
            Ok(None) if now >= *deadline => {
                warn!(pid = child.id(), "cgi child overdue, killing");
                let _ = child.kill();
                let _ = child.wait();
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid = child.id(), "cgi child wait failed: {e}");
                false
            }
        });
        children.len()
    }
}

impl TimerHandler for Reaper {
    fn on_ring(&mut self, _harbor: &mut Harbor) {
        self.reap(Instant::now());
    }
}

/// A spawned CGI script holding one slot until released.
struct ChildProcess {
    child: Option<Child>,
    pid: u32,
    deadline: Instant,
    slots: CgiSlots,
    reaper: Reaper,
}

impl CgiProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn kill(&mut self) {
        if let Some(child) = &mut self.child {
            if let Err(e) = child.kill() {
                debug!(pid = self.pid, "cgi kill failed: {e}");
            }
        }
    }

    fn release(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        self.slots.release();
        match child.try_wait() {
            Ok(Some(status)) => debug!(pid = self.pid, %status, "cgi child exited"),
            _ => self.reaper.adopt(child, self.deadline),
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.kill();
            self.release();
        }
    }
}

/// Runs scripts under a root directory as CGI/1.1 children.
///
/// When every slot is taken the tour waits in the agent's postpone queue until a
/// child is released.
#[derive(Clone)]
pub struct CgiDocker {
    root: PathBuf,
    slots: CgiSlots,
    timeout: Duration,
    timeouts: Timeouts,
    reaper: Reaper,
}

impl CgiDocker {
    pub fn new(root: impl Into<PathBuf>, slots: CgiSlots, timeout_sec: u64, reaper: Reaper) -> Self {
        Self {
            root: root.into(),
            slots,
            timeout: Duration::from_secs(timeout_sec),
            timeouts: Timeouts::new(timeout_sec, timeout_sec),
            reaper,
        }
    }

    fn command(&self, script: &Path, tour: &Tour) -> Command {
        let req = &tour.req;
        let mut cmd = Command::new(script);
        cmd.env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("GATEWAY_INTERFACE", "CGI/1.1")
            .env("SERVER_SOFTWARE", SERVER_SOFTWARE)
            .env("SERVER_PROTOCOL", format!("{:?}", req.version))
            .env("REQUEST_METHOD", req.method.as_str())
            .env("REQUEST_URI", req.uri.to_string())
            .env("SCRIPT_NAME", req.uri.path())
            .env("SCRIPT_FILENAME", script)
            .env("QUERY_STRING", req.uri.query().unwrap_or_default());
        if req.content_length > 0 {
            cmd.env("CONTENT_LENGTH", req.content_length.to_string());
        }
        if let Some(ct) = req.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
            cmd.env("CONTENT_TYPE", ct);
        }
        if let Some(host) = req.headers.get(HOST).and_then(|v| v.to_str().ok()) {
            let name = host.rsplit_once(':').map_or(host, |(name, _)| name);
            cmd.env("SERVER_NAME", name);
        }
        for (name, value) in req.headers.iter() {
            if *name == CONTENT_TYPE || *name == CONTENT_LENGTH {
                continue;
            }
            let Ok(value) = value.to_str() else {
                continue;
            };
            let var = format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
            cmd.env(var, value);
        }
        if let Some(dir) = script.parent() {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn postpone(&self, harbor: &mut Harbor, tour: TourKey, check: TourId) {
        debug!(tour = %tour, running = self.slots.running(), "cgi slots exhausted, tour postponed");
        let docker = self.clone();
        harbor.add_postpone(Box::new(move |harbor: &mut Harbor| {
            if !harbor.deck.tours.is_live(tour, check) {
                return;
            }
            if let Err(err) = docker.arrive(harbor, tour, check) {
                let deck = &mut harbor.deck;
                if let Some(t) = deck.tours.checked_mut(tour, check) {
                    t.res_send_error(check, err, &mut deck.posts);
                }
            }
        }));
    }
}

impl Docker for CgiDocker {
    fn arrive(&self, harbor: &mut Harbor, tour: TourKey, check: TourId) -> Result<(), HttpError> {
        let Some(t) = harbor.deck.tours.get(tour).filter(|t| t.id() == check) else {
            return Ok(());
        };
        let script = resolve(&self.root, t.req.uri.path())?;
        if !script.is_file() {
            return Err(HttpError::not_found(format!("{} not found", t.req.uri.path())));
        }
        if !self.slots.acquire() {
            self.postpone(harbor, tour, check);
            return Ok(());
        }
        let mut cmd = self.command(&script, t);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.slots.release();
                return Err(HttpError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("{} not started: {e}", script.display()),
                ));
            }
        };
        let pid = child.id();
        let (stdin, stdout, stderr) = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let process = ChildProcess {
            child: Some(child),
            pid,
            deadline: Instant::now() + self.timeout,
            slots: self.slots.clone(),
            reaper: self.reaper.clone(),
        };
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            return Err(HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, "cgi pipes missing"));
        };
        info!(tour = %tour, pid, script = %script.display(), "cgi started");

        CgiStdOutShip::sail(harbor, Box::new(process), stdout, stdin, self.timeouts, tour, check)
            .map_err(|e| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("cgi output not read: {e}")))?;
        if let Err(e) = CgiStdErrShip::sail(harbor, stderr, self.timeouts, pid) {
            warn!(pid, "cgi stderr not read: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_cap_running_children() {
        let slots = CgiSlots::new(2);
        let other_agent = slots.clone();
        assert!(slots.acquire());
        assert!(other_agent.acquire());
        assert!(!slots.acquire());
        other_agent.release();
        assert_eq!(slots.running(), 1);
        assert!(slots.acquire());
        slots.release();
        slots.release();
        slots.release();
        assert_eq!(slots.running(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn reaper_kills_overdue_children() {
        let reaper = Reaper::new();
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        reaper.adopt(child, Instant::now() + Duration::from_secs(3600));
        assert_eq!(reaper.reap(Instant::now()), 1);
        assert_eq!(reaper.reap(Instant::now() + Duration::from_secs(7200)), 0);
    }
}
