use color_eyre::{eyre::eyre, Result};
use gpio_mqtt_bridge::bridge::{Bridge, BridgeError, SignalListener, EXIT_CONFIG};
use gpio_mqtt_bridge::config::{BridgeConfig, LoggingConfig, APP_NAME};
use gpio_mqtt_bridge::gpio::create_driver;
use gpio_mqtt_bridge::mqtt::MqttHandler;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    // Config zuerst, das Logging hängt davon ab
    let config = match load_config() {
        Ok(config) => config,
        Err(report) => {
            eprintln!("Error: {:?}", report);
            std::process::exit(EXIT_CONFIG);
        }
    };
    setup_logging(&config.logging)?;
    info!("Starting {} {}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let code = match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(config: BridgeConfig) -> Result<i32, BridgeError> {
    let mut signals = SignalListener::install().map_err(BridgeError::Signals)?;

    let driver = create_driver(config.gpio.family, &config.gpio.driver_options())?;
    let bridge = Bridge::create(&config, driver);

    let mut handler = MqttHandler::new(&config.mqtt, bridge.topic_layout().clone(), APP_NAME)?;
    if let Err(e) = handler.connect().await {
        bridge.driver().release().await;
        return Err(e.into());
    }

    let mut running = bridge.start(handler);
    let termination = running.run_until(signals.recv()).await;
    let stopped = running.stop().await;
    Ok(stopped.finish(&termination))
}

fn load_config() -> Result<BridgeConfig> {
    let path = match std::env::args_os().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => BridgeConfig::default_path()?,
    };
    BridgeConfig::load(&path)
        .map_err(|e| eyre!(e).wrap_err(format!("Failed to load {}", path.display())))
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging(logging: &LoggingConfig) -> Result<()> {
    let builder = FmtSubscriber::builder()
        .with_max_level(Level::from(logging.level))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| eyre!("Cannot open log file {}: {}", path.display(), e))?;
            builder
                .with_ansi(false)
                .with_writer(std::io::stdout.and(Mutex::new(file)))
                .init();
        }
        None => builder.init(),
    }
    Ok(())
}
