use meshwire::{services, Config, Server, ShutdownHandle};
use std::process::ExitCode;
use std::sync::OnceLock;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

static SHUTDOWN: OnceLock<ShutdownHandle> = OnceLock::new();

extern "C" fn on_signal(_: libc::c_int) {
    if let Some(handle) = SHUTDOWN.get() {
        handle.shutdown();
    }
}

fn install_signal_handlers(handle: ShutdownHandle) {
    let _ = SHUTDOWN.set(handle);
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only does an atomic store and a waker write.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("meshwire: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        role = ?config.role,
        workers = config.workers,
        tick_ms = config.tick_ms,
        upstreams = ?config.upstreams,
        "Starting meshwire server"
    );

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> meshwire::Result<()> {
    let mut server = Server::bind(config.clone())?;
    services::install(&mut server, &config)?;
    install_signal_handlers(server.shutdown_handle());
    server.run()
}
