use clap::{App, Arg, ArgMatches};
use flapbus::config::ServerConfig;
use flapbus::sim::SimulatedBus;
use flapbus::{BusClient, DeviceRegistry, Dispatcher, SerialTransport, Transport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{error, info, warn, Level};

type SharedDispatcher = Arc<Mutex<Dispatcher<Box<dyn Transport>>>>;

/// First simulated unit address; further units count up from here.
const SIMULATED_BASE_ADDRESS: u16 = 1;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = cli().get_matches();

    if matches.is_present("verbose") {
        tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();
    } else {
        tracing_subscriber::fmt::init();
    }

    println!("🔤 Split-Flap Bus Server");
    println!("========================");

    let config = build_config(&matches)?;
    config.validate()?;

    let transport = open_transport(&config)?;
    let client = BusClient::new(transport, &config.bus);
    let registry =
        DeviceRegistry::new(client).with_inter_command_delay(config.bus.inter_command_delay());
    let dispatcher: SharedDispatcher = Arc::new(Mutex::new(Dispatcher::new(
        registry,
        config.registry_file.clone(),
    )));

    if config.load_on_start {
        let shared = Arc::clone(&dispatcher);
        let path = config.registry_file.clone();
        let mut guard = shared.lock_owned().await;
        let loaded = tokio::task::spawn_blocking(move || guard.registry_mut().load(&path)).await?;
        match loaded {
            Ok(count) => info!("📂 Restored {} devices", count),
            Err(e) => warn!("⚠️ Registry not restored from {}: {}", config.registry_file.display(), e),
        }
    }

    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!("🌐 TCP server listening on {}", config.listen_addr());

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("🔗 New client connected: {}", addr);
                    let client_dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, client_dispatcher).await {
                            warn!("Client {} error: {}", addr, e);
                        }
                        info!("🔌 Client {} disconnected", addr);
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("🔤 Split-Flap Bus Server stopped");
    Ok(())
}

fn cli() -> App<'static, 'static> {
    App::new("flapbus-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Serves split-flap bus commands over TCP")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("device")
                .short("d")
                .long("device")
                .value_name("PATH")
                .help("Serial device of the RS-485 adapter")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("baud")
                .short("b")
                .long("baud")
                .value_name("RATE")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("simulate")
                .long("simulate")
                .value_name("UNITS")
                .help("Run against simulated units instead of a serial device")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("bind")
                .long("bind")
                .value_name("ADDR")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("wire")
                .short("w")
                .long("wire")
                .value_name("VARIANT")
                .help("Wire generation: v1 (end marker) or v2 (crc)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("retries")
                .long("retries")
                .value_name("N")
                .help("Decode attempts per request")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("byte-timeout")
                .long("byte-timeout")
                .value_name("MS")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("registry-file")
                .short("f")
                .long("registry-file")
                .value_name("FILE")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("load")
                .long("load")
                .help("Restore the registry file at startup"),
        )
        .arg(
            Arg::with_name("direction-control")
                .long("direction-control")
                .help("Toggle DTR around transmissions"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log every frame"),
        )
}

fn parsed<T>(matches: &ArgMatches, name: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + 'static,
{
    match matches.value_of(name) {
        Some(raw) => Ok(Some(raw.parse::<T>().map_err(|e| {
            Box::<dyn std::error::Error>::from(format!("--{}: {}", name, e))
        })?)),
        None => Ok(None),
    }
}

fn build_config(matches: &ArgMatches) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = match matches.value_of("config") {
        Some(path) => ServerConfig::from_json_file(Path::new(path))?,
        None => ServerConfig::default(),
    };

    if let Some(device) = matches.value_of("device") {
        config.device = Some(device.to_string());
    }
    if let Some(bind) = matches.value_of("bind") {
        config.bind = bind.to_string();
    }
    if let Some(file) = matches.value_of("registry-file") {
        config.registry_file = PathBuf::from(file);
    }
    if let Some(baud) = parsed(matches, "baud")? {
        config.baud = baud;
    }
    if let Some(units) = parsed(matches, "simulate")? {
        config.simulate = Some(units);
    }
    if let Some(port) = parsed(matches, "port")? {
        config.port = port;
    }
    if let Some(wire) = parsed(matches, "wire")? {
        config.bus.wire = wire;
    }
    if let Some(retries) = parsed(matches, "retries")? {
        config.bus.retry_count = retries;
    }
    if let Some(timeout) = parsed(matches, "byte-timeout")? {
        config.bus.byte_timeout_ms = timeout;
    }
    if matches.is_present("load") {
        config.load_on_start = true;
    }
    if matches.is_present("direction-control") {
        config.bus.direction_control = true;
    }
    Ok(config)
}

fn open_transport(config: &ServerConfig) -> Result<Box<dyn Transport>, Box<dyn std::error::Error>> {
    if let Some(units) = config.simulate {
        let addresses = (0..units).map(|i| SIMULATED_BASE_ADDRESS.saturating_add(i));
        info!("🧪 Simulating {} units on a {} bus", units, config.bus.wire);
        return Ok(Box::new(SimulatedBus::with_units(config.bus.wire, addresses)));
    }

    let path = config
        .device
        .as_deref()
        .ok_or("no serial device configured")?;
    let serial = SerialTransport::open(
        path,
        config.baud,
        config.bus.byte_timeout(),
        config.bus.direction_control,
    )?;
    Ok(Box::new(serial))
}

async fn handle_client(
    stream: TcpStream,
    dispatcher: SharedDispatcher,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);

    let mut line = String::new();
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => break, // Client disconnected
            Ok(_) => {
                let request = line.trim().to_string();
                if request.is_empty() {
                    continue;
                }

                info!("📨 Received request: {}", request);
                let reply = execute(&dispatcher, request).await;
                writer.write_all(reply.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                info!("📤 Sent reply: {}", reply);
            }
            Err(e) => {
                error!("Error reading from client: {}", e);
                break;
            }
        }
    }

    Ok(())
}

/// Runs one request on the blocking pool while holding the bus lock.
///
/// The lock is taken before the blocking task starts, so requests reach the
/// bus in the order their lock requests were queued.
async fn execute(dispatcher: &SharedDispatcher, request: String) -> String {
    let mut guard = Arc::clone(dispatcher).lock_owned().await;
    match tokio::task::spawn_blocking(move || guard.handle_line(&request)).await {
        Ok(reply) => reply,
        Err(e) => {
            error!("❌ Request task failed: {}", e);
            serde_json::json!({ "error": "internal error", "detail": e.to_string() }).to_string()
        }
    }
}
