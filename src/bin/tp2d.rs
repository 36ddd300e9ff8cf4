//! tp2d - TP2.0 / KWP2000 diagnostics gateway daemon
//!
//! Usage: `tp2d [config.json] [can-interface]`
//!
//! Binds the fabric endpoints from the configuration record, spawns the
//! command worker and runs the polling loop until SIGINT/SIGTERM.

#[cfg(target_os = "linux")]
fn main() {
    env_logger::init();
    if let Err(code) = linux::run() {
        std::process::exit(code);
    }
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("tp2d requires Linux (socketCAN)");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
mod linux {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, OnceLock};

    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

    use tp2d::bus::SystemEvents;
    use tp2d::bus::zeromq::{ZmqControlEndpoint, ZmqPublisher, ZmqSystemEvents};
    use tp2d::config::Config;
    use tp2d::control;
    use tp2d::hardware::socketcan::SocketCanInterface;
    use tp2d::scheduler::{GatewayState, Scheduler};

    static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    extern "C" fn on_signal(_: i32) {
        if let Some(flag) = SHUTDOWN.get() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    fn install_signal_handlers(flag: Arc<AtomicBool>) {
        let _ = SHUTDOWN.set(flag);
        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe {
            let _ = signal::sigaction(Signal::SIGINT, &action);
            let _ = signal::sigaction(Signal::SIGTERM, &action);
        }
    }

    pub fn run() -> Result<(), i32> {
        let mut args = std::env::args().skip(1);
        let config_path = args.next().unwrap_or_else(|| "config.json".to_string());
        let can_if = args.next().unwrap_or_else(|| "can0".to_string());

        let config = Config::load(&config_path).map_err(|e| {
            log::error!("{e}");
            1
        })?;

        let context = zmq::Context::new();
        let publisher = ZmqPublisher::bind(&context, &config.zmq.tp2_stream).map_err(|e| {
            log::error!("{e}");
            1
        })?;
        let endpoint = ZmqControlEndpoint::bind(&context, &config.zmq.tp2_command).map_err(|e| {
            log::error!("{e}");
            1
        })?;
        let events: Option<Box<dyn SystemEvents>> =
            match ZmqSystemEvents::connect(&context, &config.zmq.system_events) {
                Ok(events) => Some(Box::new(events)),
                Err(e) => {
                    log::warn!("ignition monitor unavailable ({e}); polling stays enabled");
                    None
                }
            };

        let state = Arc::new(Mutex::new(GatewayState::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        install_signal_handlers(shutdown.clone());

        let control_state = state.clone();
        let control_shutdown = shutdown.clone();
        let control_worker = std::thread::Builder::new()
            .name("tp2d-control".into())
            .spawn(move || control::serve(control_state, Box::new(endpoint), control_shutdown))
            .map_err(|e| {
                log::error!("spawning control worker failed: {e}");
                1
            })?;

        let mut scheduler = Scheduler::new(
            state,
            Box::new(SocketCanInterface::new(can_if)),
            Box::new(publisher),
            events,
            shutdown,
        );
        scheduler.run();

        if control_worker.join().is_err() {
            log::error!("control worker panicked");
        }
        log::info!("tp2d exiting");
        Ok(())
    }
}
