//! Spawning and tracking sandboxed executor processes. The argument vector
//! is assembled as owned strings and materialized into null-terminated form
//! only at the exec boundary.
use std::ffi::CString;
use std::io;
use std::path::PathBuf;
use std::time::Instant;

use nix::fcntl::{open, OFlag};
use nix::sys::signal::{self, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, getpid, ForkResult, Pid};
use thiserror::Error;

use api::allocation::AllocationRequest;
use api::ManagerCredentials;

use crate::config::{ExecutorSettings, SandboxConfiguration, SandboxType};

/// Pin offsets handed to consecutive pinned executors wrap at this bound.
/// Undocumented tunable carried over from the previous deployment.
pub const PIN_COUNTER_WRAP: i32 = 36;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("fork failed: {0}")]
    Fork(nix::Error),
    #[error("cannot determine the executor path: {0}")]
    ExecutorPath(io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorStatus {
    Running,
    /// Exited normally with this code.
    Finished(i32),
    /// Killed by this signal, or `-1` when the exit reason is unknown.
    FinishedFail(i32),
}

/// A spawned executor the manager still accounts for.
pub struct ActiveExecutor {
    pid: Pid,
    pub cores: i16,
    pub allocation_begin: Instant,
    pub allocation_finished: Option<Instant>,
}

impl ActiveExecutor {
    fn new(pid: Pid, cores: i16, allocation_begin: Instant) -> Self {
        ActiveExecutor {
            pid,
            cores,
            allocation_begin,
            allocation_finished: None,
        }
    }

    pub fn id(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Non-blocking wait. Reaps the child when it has exited.
    pub fn check(&self) -> ExecutorStatus {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => ExecutorStatus::Running,
            Ok(WaitStatus::Exited(_, code)) => ExecutorStatus::Finished(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => ExecutorStatus::FinishedFail(sig as i32),
            Ok(_) => ExecutorStatus::Running,
            Err(_) => ExecutorStatus::FinishedFail(-1),
        }
    }

    pub fn kill(&self) {
        let _ = signal::kill(self.pid, Signal::SIGKILL);
    }
}

/// The executor binary ships next to the manager binary; both are built
/// into one directory, which containers see through the shared volume.
pub fn default_executor_path() -> Result<PathBuf, SpawnError> {
    let exe = std::env::current_exe().map_err(SpawnError::ExecutorPath)?;
    let dir = exe.parent().ok_or_else(|| {
        SpawnError::ExecutorPath(io::Error::new(
            io::ErrorKind::NotFound,
            "manager binary has no parent directory",
        ))
    })?;
    Ok(dir.join("executor"))
}

pub struct ExecutorSpawner {
    exec: ExecutorSettings,
    sandbox: SandboxType,
    sandbox_config: SandboxConfiguration,
    executor_path: PathBuf,
    pin_counter: i32,
}

impl ExecutorSpawner {
    pub fn new(
        exec: ExecutorSettings,
        sandbox_config: Option<SandboxConfiguration>,
    ) -> Result<Self, SpawnError> {
        let sandbox = exec.sandbox();
        Ok(ExecutorSpawner {
            exec,
            sandbox,
            sandbox_config: sandbox_config.unwrap_or_default(),
            executor_path: default_executor_path()?,
            pin_counter: 0,
        })
    }

    /// Point the spawner at a different executor binary. Used by tests and
    /// by deployments that do not colocate the binaries.
    pub fn set_executor_path(&mut self, path: PathBuf) {
        self.executor_path = path;
    }

    /// The command-line contract of the inner executor binary.
    fn executor_args(
        &self,
        request: &AllocationRequest,
        credentials: &ManagerCredentials,
        pin_spec: &str,
    ) -> Vec<String> {
        vec![
            "-a".to_owned(),
            request.listen_address.clone(),
            "-p".to_owned(),
            request.listen_port.to_string(),
            "--polling-mgr".to_owned(),
            "thread".to_owned(),
            "-r".to_owned(),
            self.exec.repetitions.to_string(),
            "-x".to_owned(),
            self.exec.recv_buffer_size.to_string(),
            "-s".to_owned(),
            request.input_buf_size.to_string(),
            "--pin-threads".to_owned(),
            pin_spec.to_owned(),
            "--fast".to_owned(),
            request.cores.to_string(),
            "--warmup-iters".to_owned(),
            self.exec.warmup_iters.to_string(),
            "--max-inline-data".to_owned(),
            self.exec.max_inline_data.to_string(),
            "--func-size".to_owned(),
            request.func_buf_size.to_string(),
            "--timeout".to_owned(),
            request.hot_timeout_ms.to_string(),
            "--mgr-address".to_owned(),
            credentials.addr.clone(),
            "--mgr-port".to_owned(),
            credentials.port.to_string(),
            "--mgr-secret".to_owned(),
            credentials.secret.to_string(),
            "--mgr-buf-addr".to_owned(),
            credentials.r_addr.to_string(),
            "--mgr-buf-rkey".to_owned(),
            credentials.r_key.to_string(),
        ]
    }

    /// Full program + argument vector for the configured sandbox kind.
    pub fn argv(
        &self,
        request: &AllocationRequest,
        credentials: &ManagerCredentials,
        pin_spec: &str,
    ) -> (String, Vec<String>) {
        let inner = self.executor_args(request, credentials, pin_spec);
        match self.sandbox {
            SandboxType::Process => {
                (self.executor_path.display().to_string(), inner)
            }
            SandboxType::Docker => {
                let docker = &self.exec.docker;
                let mut args = vec![
                    "run".to_owned(),
                    "--rm".to_owned(),
                    "-i".to_owned(),
                    format!("--net={}", docker.network),
                    format!("--ip={}", docker.ip),
                    "--volume".to_owned(),
                    format!("{}:/opt", docker.volume),
                ];
                self.sandbox_config
                    .generate_args(&mut args, &self.sandbox_config.user);
                args.push(format!(
                    "{}:{}/{}",
                    docker.registry_ip, docker.registry_port, docker.image
                ));
                args.push("/opt/bin/executor".to_owned());
                args.extend(inner);
                ("docker_rdma_sriov".to_owned(), args)
            }
            SandboxType::Sarus => {
                let mut args = vec!["run".to_owned()];
                self.sandbox_config
                    .generate_args(&mut args, &self.sandbox_config.user);
                args.push(self.sandbox_config.name.clone());
                args.push(self.executor_path.display().to_string());
                args.extend(inner);
                ("sarus".to_owned(), args)
            }
        }
    }

    /// Fork and exec one executor. The parent returns immediately with the
    /// child recorded; exec failures inside the child surface later as a
    /// `Finished(1)` from [`ActiveExecutor::check`].
    pub fn spawn(
        &mut self,
        request: &AllocationRequest,
        credentials: &ManagerCredentials,
    ) -> Result<ActiveExecutor, SpawnError> {
        let allocation_begin = Instant::now();
        let pin_spec = if self.exec.pin_threads {
            self.pin_counter.to_string()
        } else {
            "-1".to_owned()
        };
        let (program, args) = self.argv(request, credentials, &pin_spec);
        log::debug!("spawning {:?} sandbox: {} {}", self.sandbox, program, args.join(" "));

        // Materialize the null-terminated argv before forking.
        let program_c = CString::new(program).expect("argv strings contain no NUL");
        let mut argv_c = Vec::with_capacity(args.len() + 1);
        argv_c.push(program_c.clone());
        argv_c.extend(
            args.into_iter()
                .map(|a| CString::new(a).expect("argv strings contain no NUL")),
        );

        match unsafe { fork() } {
            Err(e) => {
                log::error!("fork failed! {}", e);
                Err(SpawnError::Fork(e))
            }
            Ok(ForkResult::Child) => child_exec(&program_c, &argv_c),
            Ok(ForkResult::Parent { child }) => {
                if self.exec.pin_threads {
                    self.pin_counter += 1;
                    if self.pin_counter == PIN_COUNTER_WRAP {
                        self.pin_counter = 0;
                    }
                }
                log::info!(
                    "started executor {} for {} cores at {}:{}",
                    child,
                    request.cores,
                    request.listen_address,
                    request.listen_port
                );
                Ok(ActiveExecutor::new(child, request.cores, allocation_begin))
            }
        }
    }
}

/// Child-side setup: a private log file over stdout and stderr, then exec.
/// Never returns.
fn child_exec(program: &CString, argv: &[CString]) -> ! {
    let pid = getpid();
    let log_name = format!("executor_{}", pid);
    match open(
        log_name.as_str(),
        OFlag::O_RDWR | OFlag::O_CREAT,
        Mode::S_IRUSR | Mode::S_IWUSR,
    ) {
        Ok(fd) => {
            let _ = dup2(fd, 1);
            let _ = dup2(fd, 2);
            if let Err(e) = execvp(program, argv) {
                // stderr already points at the log file.
                eprintln!("executor process failed {}, reason {}", e as i32, e);
                let _ = close(fd);
            }
        }
        Err(e) => {
            eprintln!("cannot open executor log {}: {}", log_name, e);
        }
    }
    unsafe { libc::_exit(1) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DockerSettings;
    use std::collections::HashMap;
    use std::process::Command;
    use std::time::Duration;

    fn settings(sandbox: Option<SandboxType>) -> ExecutorSettings {
        ExecutorSettings {
            repetitions: 100,
            warmup_iters: 10,
            pin_threads: false,
            sandbox_type: sandbox,
            docker: DockerSettings {
                use_docker: false,
                image: "rdma-executor".to_owned(),
                network: "testnet".to_owned(),
                ip: "172.31.82.200".to_owned(),
                volume: "/shared/build".to_owned(),
                registry_ip: "127.0.0.1".to_owned(),
                registry_port: 5000,
            },
            max_inline_data: 220,
            recv_buffer_size: 32,
        }
    }

    /// Spawner tests write `executor_<pid>` logs into the working
    /// directory, so they serialize and run inside a scratch directory.
    fn in_tempdir<R>(body: impl FnOnce() -> R) -> R {
        use std::sync::Mutex;
        static CWD_LOCK: Mutex<()> = Mutex::new(());
        let _guard = CWD_LOCK.lock().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let old = std::env::current_dir().unwrap();
        std::env::set_current_dir(scratch.path()).unwrap();
        let result = body();
        std::env::set_current_dir(old).unwrap();
        result
    }

    fn request() -> AllocationRequest {
        AllocationRequest {
            listen_address: "127.0.0.1".to_owned(),
            listen_port: 20000,
            cores: 1,
            hot_timeout_ms: 5000,
            input_buf_size: 1024,
            func_buf_size: 4096,
        }
    }

    fn credentials() -> ManagerCredentials {
        ManagerCredentials {
            addr: "127.0.0.1".to_owned(),
            port: 10000,
            secret: 9,
            r_addr: 0x7000,
            r_key: 17,
        }
    }

    #[test]
    fn process_argv_follows_the_contract() {
        let mut spawner = ExecutorSpawner::new(settings(None), None).unwrap();
        spawner.set_executor_path(PathBuf::from("/srv/bin/executor"));
        let (program, args) = spawner.argv(&request(), &credentials(), "-1");
        assert_eq!(program, "/srv/bin/executor");
        assert_eq!(
            &args[..6],
            &["-a", "127.0.0.1", "-p", "20000", "--polling-mgr", "thread"]
        );
        let joined = args.join(" ");
        assert!(joined.contains("--fast 1"));
        assert!(joined.contains("--timeout 5000"));
        assert!(joined.contains("--mgr-secret 9"));
        assert!(joined.ends_with("--mgr-buf-addr 28672 --mgr-buf-rkey 17"));
    }

    #[test]
    fn docker_argv_wraps_the_executor() {
        let mut exec = settings(Some(SandboxType::Docker));
        exec.docker.use_docker = true;
        let spawner = ExecutorSpawner::new(exec, Some(SandboxConfiguration::default())).unwrap();
        let (program, args) = spawner.argv(&request(), &credentials(), "-1");
        assert_eq!(program, "docker_rdma_sriov");
        assert_eq!(
            &args[..7],
            &[
                "run",
                "--rm",
                "-i",
                "--net=testnet",
                "--ip=172.31.82.200",
                "--volume",
                "/shared/build:/opt",
            ]
        );
        let image = args.iter().position(|a| a == "127.0.0.1:5000/rdma-executor");
        let inner = args.iter().position(|a| a == "/opt/bin/executor");
        assert!(image.is_some() && inner == Some(image.unwrap() + 1));
    }

    #[test]
    fn sarus_argv_substitutes_the_user() {
        let config = SandboxConfiguration {
            devices: vec!["/dev/infiniband".to_owned()],
            mounts: vec![],
            mount_filesystem: vec!["/home/{user}".to_owned()],
            env: HashMap::new(),
            user: "svc".to_owned(),
            name: "ember-executor".to_owned(),
        };
        let mut spawner =
            ExecutorSpawner::new(settings(Some(SandboxType::Sarus)), Some(config)).unwrap();
        spawner.set_executor_path(PathBuf::from("/srv/bin/executor"));
        let (program, args) = spawner.argv(&request(), &credentials(), "-1");
        assert_eq!(program, "sarus");
        assert_eq!(args[0], "run");
        assert!(args.contains(&"--mount=type=bind,source=/home/svc,destination=/home/svc".to_owned()));
        let name = args.iter().position(|a| a == "ember-executor").unwrap();
        assert_eq!(args[name + 1], "/srv/bin/executor");
    }

    #[test]
    fn pinned_executors_get_sequential_offsets() {
        in_tempdir(|| {
            let mut exec = settings(None);
            exec.pin_threads = true;
            let mut spawner = ExecutorSpawner::new(exec, None).unwrap();
            spawner.set_executor_path(PathBuf::from("/bin/true"));
            for expected in 0..PIN_COUNTER_WRAP {
                assert_eq!(spawner.pin_counter, expected);
                let executor = spawner.spawn(&request(), &credentials()).unwrap();
                wait_done(&executor);
            }
            // Wrapped back around.
            assert_eq!(spawner.pin_counter, 0);
        });
    }

    fn wait_done(executor: &ActiveExecutor) -> ExecutorStatus {
        for _ in 0..200 {
            match executor.check() {
                ExecutorStatus::Running => std::thread::sleep(Duration::from_millis(10)),
                done => return done,
            }
        }
        panic!("executor {} never finished", executor.id());
    }

    #[test]
    fn check_reports_exit_codes() {
        let child = Command::new("sh").arg("-c").arg("exit 7").spawn().unwrap();
        let executor = ActiveExecutor::new(
            Pid::from_raw(child.id() as i32),
            1,
            Instant::now(),
        );
        assert_eq!(wait_done(&executor), ExecutorStatus::Finished(7));
    }

    #[test]
    fn check_reports_signals() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let executor = ActiveExecutor::new(
            Pid::from_raw(child.id() as i32),
            1,
            Instant::now(),
        );
        assert_eq!(executor.check(), ExecutorStatus::Running);
        executor.kill();
        assert_eq!(
            wait_done(&executor),
            ExecutorStatus::FinishedFail(Signal::SIGKILL as i32)
        );
    }

    #[test]
    fn spawn_failure_exits_one() {
        in_tempdir(|| {
            let mut spawner = ExecutorSpawner::new(settings(None), None).unwrap();
            spawner.set_executor_path(PathBuf::from("/nonexistent/executor-binary"));
            let executor = spawner.spawn(&request(), &credentials()).unwrap();
            assert_eq!(wait_done(&executor), ExecutorStatus::Finished(1));
        });
    }
}
