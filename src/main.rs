use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use telemetry_bridge::config::BridgeConfig;
use telemetry_bridge::console::{ConsoleCommand, HELP};
use telemetry_bridge::events::{EventKind, EventLog, EventReporter};
use telemetry_bridge::mqtt::{ConnectionManager, ConnectionState, RumqttcTransport, SessionHandle};
use telemetry_bridge::serial;
use telemetry_bridge::telemetry::{line_queue, DispatcherGate, DispatcherHandle, LineSender};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = BridgeConfig::load(config_path.as_deref()).await?;
    setup_logging(config.log_level()?);

    // Event stream and console history
    let (events, mut event_rx) = EventReporter::channel(config.events.channel_capacity);
    let history = Arc::new(Mutex::new(EventLog::with_capacity(config.events.history)));
    let history_writer = history.clone();
    let _event_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            history_writer.lock().await.push(event);
        }
    });

    // MQTT session
    let manager = ConnectionManager::new(
        Box::new(RumqttcTransport::new(config.mqtt_config())),
        config.broker_address()?,
        config.backoff(),
        events.clone(),
    );
    let (session, session_task) = SessionHandle::spawn(manager);
    if let Err(e) = session.connect().await {
        events.failure("MQTT connect failed", &e);
    }

    // Serial link and dispatcher
    let (lines, line_rx) = line_queue(config.dispatch.queue_capacity, config.dispatch.overflow);
    let (reader, writer) = serial::open(&config.serial)?;
    let _reader_thread = reader
        .spawn(lines.clone(), events.clone())
        .map_err(|e| eyre!("Failed to start serial reader: {}", e))?;
    events.status(format!("serial port {} open", config.serial.port));

    let shutdown = CancellationToken::new();
    let gate = DispatcherGate::new(session.clone(), Box::new(writer), events.clone());
    let (dispatcher, dispatcher_task) = DispatcherHandle::spawn(gate, line_rx, shutdown.clone());
    if config.dispatch.start_sending {
        spawn_start(&dispatcher);
    }

    info!("Bridge running ({})", HELP);
    run_console(&dispatcher, &session, &lines, &history).await;

    // Orderly shutdown: STOP gets a grace period, then everything is cancelled
    if dispatcher.is_sending() {
        let grace = Duration::from_millis(config.dispatch.shutdown_grace_ms);
        match tokio::time::timeout(grace, dispatcher.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Stop failed during shutdown: {}", e),
            Err(_) => warn!("STOP not delivered within {:?}", grace),
        }
    }
    shutdown.cancel();
    if let Err(e) = dispatcher_task.await {
        warn!("Dispatcher worker ended abnormally: {}", e);
    }
    session.disconnect().await;
    session.dispose().await;
    drop(session);
    if let Err(e) = session_task.await {
        warn!("Session worker ended abnormally: {}", e);
    }
    info!("Bridge stopped");

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Runs START in the background so the console stays responsive while the
/// broker is unreachable; `stop` cancels it
fn spawn_start(dispatcher: &DispatcherHandle) {
    let dispatcher = dispatcher.clone();
    tokio::spawn(async move {
        if let Err(e) = dispatcher.start().await {
            println!("start failed: {e}");
        }
    });
}

fn spawn_stop(dispatcher: &DispatcherHandle) {
    let dispatcher = dispatcher.clone();
    tokio::spawn(async move {
        if let Err(e) = dispatcher.stop().await {
            println!("stop failed: {e}");
        }
    });
}

/// Points the session at a new broker
///
/// A publish that is retrying picks the address up on its next attempt. An
/// idle open session is reconnected in the background.
fn retarget(session: &SessionHandle, address: &str) {
    if let Err(e) = session.update_address(address) {
        println!("{e}");
        return;
    }
    if session.state() == ConnectionState::Connected {
        let session = session.clone();
        tokio::spawn(async move {
            session.disconnect().await;
            if let Err(e) = session.connect().await {
                println!("{e}");
            }
        });
    }
}

/// Reads operator commands until `quit` or Ctrl-C
async fn run_console(
    dispatcher: &DispatcherHandle,
    session: &SessionHandle,
    lines: &LineSender,
    history: &Mutex<EventLog>,
) {
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return;
            }
            line = input.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Console input closed, running until Ctrl-C");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to wait for Ctrl-C: {}", e);
                }
                return;
            }
            Err(e) => {
                warn!("Console read failed: {}", e);
                return;
            }
        };

        let command = match ConsoleCommand::parse(&line) {
            Some(Ok(command)) => command,
            Some(Err(e)) => {
                println!("{e}");
                continue;
            }
            None => continue,
        };

        match command {
            ConsoleCommand::Start => spawn_start(dispatcher),
            ConsoleCommand::Stop => spawn_stop(dispatcher),
            ConsoleCommand::Broker(address) => retarget(session, &address),
            ConsoleCommand::Status => {
                let history = history.lock().await;
                println!(
                    "mqtt: {:?} | sending: {} | queued lines: {} | dropped lines: {}",
                    session.state(),
                    dispatcher.is_sending(),
                    lines.len(),
                    lines.dropped()
                );
                if let Some(event) = history.last(EventKind::Status) {
                    println!("last status: {event}");
                }
                if let Some(event) = history.last(EventKind::Error) {
                    println!("last error:  {event}");
                }
            }
            ConsoleCommand::History => {
                for line in history.lock().await.render() {
                    println!("{line}");
                }
            }
            ConsoleCommand::Ports => match serial::available_ports() {
                Ok(ports) if ports.is_empty() => println!("no serial ports found"),
                Ok(ports) => ports.iter().for_each(|port| println!("{port}")),
                Err(e) => println!("{e}"),
            },
            ConsoleCommand::Help => println!("{HELP}"),
            ConsoleCommand::Quit => return,
        }
    }
}
