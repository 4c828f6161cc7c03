use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use nix::sys::signal;

use executor_manager::config::Settings;
use executor_manager::executor::ExecutorSpawner;
use executor_manager::manager::Manager;
use executor_manager::resmgr::ResourceManagerClient;

#[derive(Debug, Clone, Parser)]
#[command(name = "executor_manager")]
struct Opts {
    /// Manager config path
    #[arg(short, long)]
    config: PathBuf,
    /// Device database path
    #[arg(long)]
    device_database: PathBuf,
    /// Do not register with the resource manager
    #[arg(long)]
    skip_resource_manager: bool,
    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

static CLOSING: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: i32) {
    CLOSING.store(true, Ordering::Relaxed);
}

fn main() -> ExitCode {
    let opts = Opts::parse();
    init_env_log("EMBER_LOG", if opts.verbose { "debug" } else { "info" });

    let settings = match Settings::load(&opts.config, &opts.device_database) {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("configuration error: {}", e);
            return ExitCode::from(1);
        }
    };

    // Process SIGINT and SIGTERM into the closing flag every endpoint loop
    // observes.
    let sig_action = signal::SigAction::new(
        signal::SigHandler::Handler(handle_signal),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    for sig in [signal::SIGINT, signal::SIGTERM] {
        if unsafe { signal::sigaction(sig, &sig_action) }.is_err() {
            log::error!("failed to register the {:?} handler", sig);
            return ExitCode::from(1);
        }
    }

    // The verbs library refuses huge-page-backed regions without this.
    std::env::set_var("RDMAV_HUGEPAGES_SAFE", "1");

    let spawner = match ExecutorSpawner::new(
        settings.executor.clone(),
        settings.sandboxes.get(&settings.executor.sandbox()).cloned(),
    ) {
        Ok(spawner) => spawner,
        Err(e) => {
            log::error!("cannot set up the executor spawner: {}", e);
            return ExitCode::from(1);
        }
    };

    let resmgr = if opts.skip_resource_manager {
        log::info!("running without a resource manager");
        None
    } else {
        Some(ResourceManagerClient::new(&settings.config))
    };

    let mut manager = match Manager::new(&settings, spawner, resmgr) {
        Ok(manager) => manager,
        Err(e) => {
            log::error!("RDMA initialization failed: {}", e);
            return ExitCode::from(2);
        }
    };
    match manager.run(&CLOSING) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal RDMA error: {}", e);
            ExitCode::from(2)
        }
    }
}

fn init_env_log(filter_env: &str, default_level: &str) {
    use chrono::Utc;
    use std::io::Write;

    let env = env_logger::Env::new().filter_or(filter_env, default_level);
    env_logger::Builder::from_env(env)
        .format(|buf, record| {
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
                level_style.value(record.level()),
                record.file().unwrap_or("<unnamed>"),
                record.line().unwrap_or(0),
                &record.args()
            )
        })
        .init();
}
