use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";

// A full describeAll against a bus of silent units takes a while.
const REPLY_TIMEOUT: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = cli().get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("table");
    let verbose = matches.is_present("verbose");

    let (name, sub_matches) = match matches.subcommand() {
        (name, Some(sub_matches)) => (name, sub_matches),
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Register unit 10 at column 0, row 0", "flapctl register 10 0 0".bright_cyan());
            println!("  {} Show every unit and the grid", "flapctl dump".bright_cyan());
            println!("  {} Spell text on row 0", "flapctl print 0 0 HELLO".bright_cyan());
            return Ok(());
        }
    };

    let request = build_request(name, sub_matches)?;
    if verbose {
        println!("{} {}:{}", "Connecting to".dimmed(), host, port);
        println!("{} {}", "Request:".dimmed(), request);
    }

    let reply = send_request(host, port, &request.to_string()).await?;
    print_reply(name, &reply, format);
    Ok(())
}

fn cli() -> App<'static, 'static> {
    let address = || Arg::with_name("address").help("Unit bus address").required(true);
    let x = || Arg::with_name("x").help("Grid column (0-19)").required(true);
    let y = || Arg::with_name("y").help("Grid row (0-3)").required(true);
    let id = || Arg::with_name("id").help("Registry slot id").required(true);
    let path = || Arg::with_name("path").help("Registry file (server default when omitted)");

    App::new("flapctl")
        .version(env!("CARGO_PKG_VERSION"))
        .about("🔤 Split-flap display bus control")
        .setting(AppSettings::VersionlessSubcommands)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Server host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Server port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Show the request being sent")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("register")
                .about("➕ Register a unit at a grid position")
                .arg(address())
                .arg(x())
                .arg(y()),
        )
        .subcommand(SubCommand::with_name("remove").about("➖ Remove a registry slot").arg(id()))
        .subcommand(SubCommand::with_name("refresh").about("🔄 Poll every registered unit"))
        .subcommand(SubCommand::with_name("describe").about("🔍 Show one registry slot").arg(id()))
        .subcommand(SubCommand::with_name("dump").about("📋 Show every slot and the grid map"))
        .subcommand(SubCommand::with_name("save").about("💾 Save the registry").arg(path()))
        .subcommand(SubCommand::with_name("load").about("📂 Load the registry").arg(path()))
        .subcommand(
            SubCommand::with_name("print")
                .about("🔤 Spell text along a row")
                .arg(x())
                .arg(y())
                .arg(Arg::with_name("text").required(true)),
        )
        .subcommand(
            SubCommand::with_name("flap")
                .about("🎯 Show a flap index on the unit at a grid position")
                .arg(x())
                .arg(y())
                .arg(Arg::with_name("flap").required(true)),
        )
        .subcommand(SubCommand::with_name("ping").about("🏓 Ping a unit").arg(address()))
        .subcommand(
            SubCommand::with_name("set-address")
                .about("🔀 Change a unit's bus address")
                .arg(address())
                .arg(Arg::with_name("new-address").required(true)),
        )
        .subcommand(
            SubCommand::with_name("set-calibration")
                .about("🎚️  Change a unit's calibration offset")
                .arg(address())
                .arg(Arg::with_name("calibration").required(true)),
        )
        .subcommand(SubCommand::with_name("reset").about("♻️  Reboot a unit").arg(address()))
        .subcommand(
            SubCommand::with_name("display")
                .about("🎯 Show a flap index on a unit by address")
                .arg(address())
                .arg(Arg::with_name("flap").required(true))
                .arg(
                    Arg::with_name("full")
                        .long("full")
                        .help("Make one extra revolution first"),
                ),
        )
        .subcommand(
            SubCommand::with_name("power")
                .about("🔋 Switch a unit's motor power")
                .arg(address())
                .arg(
                    Arg::with_name("state")
                        .required(true)
                        .possible_values(&["on", "off", "enable", "disable"]),
                ),
        )
}

fn normalize_state(state: &str) -> bool {
    matches!(state, "on" | "enable")
}

fn number(matches: &ArgMatches, name: &str) -> Result<Value, String> {
    let raw = matches.value_of(name).ok_or(format!("missing {name}"))?;
    raw.parse::<i64>()
        .map(Value::from)
        .map_err(|_| format!("{name} must be a number, got '{raw}'"))
}

fn build_request(name: &str, matches: &ArgMatches) -> Result<Value, String> {
    let mut args = Map::new();
    let mut put_numbers = |keys: &[(&str, &str)]| -> Result<(), String> {
        for (arg, key) in keys {
            args.insert((*key).to_string(), number(matches, arg)?);
        }
        Ok(())
    };

    let command = match name {
        "register" => {
            put_numbers(&[("address", "address"), ("x", "x"), ("y", "y")])?;
            "register"
        }
        "remove" => {
            put_numbers(&[("id", "id")])?;
            "remove"
        }
        "refresh" => "refresh",
        "describe" => {
            put_numbers(&[("id", "id")])?;
            "describe"
        }
        "dump" => "describeAll",
        "save" | "load" => name,
        "print" => "renderText",
        "flap" => {
            put_numbers(&[("x", "x"), ("y", "y"), ("flap", "flap")])?;
            "renderFlapIndex"
        }
        "ping" | "reset" => {
            put_numbers(&[("address", "address")])?;
            name
        }
        "set-address" => {
            put_numbers(&[("address", "address"), ("new-address", "newAddress")])?;
            "setAddress"
        }
        "set-calibration" => {
            put_numbers(&[("address", "address"), ("calibration", "calibration")])?;
            "setCalibration"
        }
        "display" => {
            put_numbers(&[("address", "address"), ("flap", "flap")])?;
            "display"
        }
        "power" => {
            put_numbers(&[("address", "address")])?;
            "power"
        }
        other => return Err(format!("unknown subcommand '{other}'")),
    };

    match name {
        "save" | "load" => {
            if let Some(path) = matches.value_of("path") {
                args.insert("path".into(), json!(path));
            }
        }
        "print" => {
            args.insert("x".into(), number(matches, "x")?);
            args.insert("y".into(), number(matches, "y")?);
            args.insert("string".into(), json!(matches.value_of("text").unwrap_or_default()));
        }
        "display" => {
            args.insert("full".into(), json!(matches.is_present("full")));
        }
        "power" => {
            let state = matches.value_of("state").unwrap_or("off");
            args.insert("power".into(), json!(normalize_state(state)));
        }
        _ => {}
    }

    args.insert("command".into(), json!(command));
    Ok(Value::Object(args))
}

async fn send_request(host: &str, port: u16, request: &str) -> Result<String, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{} Failed to connect to flapbus server at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Server is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "flapbus-server --device /dev/ttyUSB0".bright_cyan());
                eprintln!("   or");
                eprintln!("   {}", "flapbus-server --simulate 4".bright_cyan());
            } else {
                eprintln!("{} Network error: {}", "🔌".yellow(), e.to_string().bright_red());
            }
            return Err(e.into());
        }
    };

    let (reader, mut writer) = stream.into_split();
    let exchange = async {
        writer.write_all(request.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        let mut reply = String::new();
        let n = BufReader::new(reader).read_line(&mut reply).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Server closed connection",
            ));
        }
        Ok(reply.trim_end().to_string())
    };

    match tokio::time::timeout(REPLY_TIMEOUT, exchange).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            eprintln!("{} No reply within {} seconds", "⏰".yellow(), REPLY_TIMEOUT.as_secs());
            Err("Command timeout".into())
        }
    }
}

fn print_reply(name: &str, reply: &str, format: &str) {
    if format == "json" {
        println!("{}", reply);
        return;
    }

    let Ok(parsed) = serde_json::from_str::<Value>(reply) else {
        println!("{}", reply);
        return;
    };

    if let Some(error) = parsed.get("error").and_then(Value::as_str) {
        let detail = parsed.get("detail").and_then(Value::as_str).unwrap_or("");
        println!("{} {}: {}", "❌".red(), error.bright_red(), detail);
        return;
    }

    match name {
        "describe" => print_device(&parsed),
        "dump" => print_overview(&parsed),
        "ping" => {
            if parsed["success"] == true {
                println!("{} {}", "✅".green(), "Unit is responsive".bright_green());
            } else {
                let detail = parsed["detail"].as_str().unwrap_or("no reply");
                println!("{} {} ({})", "❌".red(), "Ping failed".bright_red(), detail);
            }
        }
        _ => {
            println!("{} {}", "✅".green(), name.bright_white());
            if let Some(fields) = parsed.as_object() {
                for (key, value) in fields.iter().filter(|(k, _)| k.as_str() != "ack") {
                    println!("   {}: {}", key.dimmed(), value.to_string().bright_cyan());
                }
            }
        }
    }
}

fn state_colored(state: &str) -> ColoredString {
    match state.trim() {
        "ONLINE" | "ENABLED" => state.bright_green(),
        "OFFLINE" | "UNKNOWN" => state.bright_red(),
        "FAILED" => state.red().bold(),
        "NEW" | "DISABLED" => state.yellow(),
        _ => state.dimmed(),
    }
}

fn print_device(device: &Value) {
    let status = &device["status"];
    let position = match (device["position"]["x"].as_i64(), device["position"]["y"].as_i64()) {
        (Some(x), Some(y)) => format!("({}, {})", x, y),
        _ => "unplaced".to_string(),
    };

    println!("\n{} {}", "🔤 Slot".bright_blue().bold(), device["id"].to_string().bright_blue().bold());
    println!("{}", "══════════════════════".bright_blue());
    println!("Address:     0x{:04X}", device["address"].as_u64().unwrap_or(0));
    println!("Position:    {}", position);
    println!("Calibration: {}", device["calibration"]);
    println!("State:       {}", state_colored(status["device"].as_str().unwrap_or("?")));
    println!("Power:       {}", state_colored(status["power"].as_str().unwrap_or("?")));
    println!("Voltage:     {:.2} V", status["voltage"].as_f64().unwrap_or(0.0));
    println!("Rotations:   {}", status["rotations"]);
    println!(
        "Flap:        {} {:?}",
        device["flapID"],
        device["flapChar"].as_str().unwrap_or("")
    );

    if let Some(flags) = status["flags"].as_object() {
        let raised: Vec<&str> = flags
            .iter()
            .filter(|(_, v)| v.as_bool() == Some(true))
            .map(|(k, _)| k.as_str())
            .collect();
        if raised.is_empty() {
            println!("Flags:       {}", "none".dimmed());
        } else {
            println!("Flags:       {}", raised.join(", ").bright_yellow());
        }
    }
}

fn print_overview(overview: &Value) {
    println!(
        "\n{} {} registered, {} online",
        "📋".bright_blue(),
        overview["devices_all"].to_string().bright_white(),
        overview["devices_online"].to_string().bright_green()
    );

    println!("{}", "┌──────┬─────────┬────────────┬──────────┬──────────┬──────┐".bright_white());
    println!("{}", "│ Slot │ Address │ Position   │ State    │ Power    │ Flap │".bright_white());
    println!("{}", "├──────┼─────────┼────────────┼──────────┼──────────┼──────┤".bright_white());
    for device in overview["devices"].as_array().into_iter().flatten() {
        let position = match (device["position"]["x"].as_i64(), device["position"]["y"].as_i64()) {
            (Some(x), Some(y)) => format!("({}, {})", x, y),
            _ => "-".to_string(),
        };
        let state = device["status"]["device"].as_str().unwrap_or("?");
        let power = device["status"]["power"].as_str().unwrap_or("?");
        println!(
            "│ {:>4} │ 0x{:04X}  │ {:<10} │ {} │ {} │ {:>4} │",
            device["id"],
            device["address"].as_u64().unwrap_or(0),
            position,
            state_colored(&format!("{:<8}", state)),
            state_colored(&format!("{:<8}", power)),
            device["flapChar"].as_str().unwrap_or("")
        );
    }
    println!("{}", "└──────┴─────────┴────────────┴──────────┴──────────┴──────┘".bright_white());

    println!("\n{}", "🗺️  Grid".bright_blue().bold());
    for row in overview["map"].as_array().into_iter().flatten() {
        let cells: Vec<String> = row
            .as_array()
            .into_iter()
            .flatten()
            .map(|cell| match cell.as_i64() {
                Some(id) if id >= 0 => format!("{:>3}", id),
                _ => format!("{:>3}", "·").dimmed().to_string(),
            })
            .collect();
        println!("  {}", cells.join(""));
    }
}
