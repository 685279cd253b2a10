use clap::{App, Arg};
use serde_derive::Deserialize;
use std::fs;
use std::io::BufRead;
use std::time::Duration;
use tftpd::logging;
use tftpd::message;
use tftpd::Server;

/// Optional JSON config file; command-line flags win over it.
#[derive(Deserialize, Default)]
struct Config {
    port: Option<u16>,
    host: Option<String>,
    threads: Option<usize>,
    timeout_ms: Option<u64>,
    block_size: Option<usize>,
}

fn main() {
    let matches = App::new("TFTP Server")
        .version("1.0")
        .about("Serves files over TFTP from a root directory.")
        .arg(
            Arg::with_name("ROOT")
                .help("Directory served to clients")
                .required(true),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("Path to a JSON config file"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .takes_value(true)
                .help("UDP control port (default 69)"),
        )
        .arg(
            Arg::with_name("host")
                .long("host")
                .takes_value(true)
                .help("Bind address (default 0.0.0.0)"),
        )
        .arg(
            Arg::with_name("threads")
                .short("t")
                .long("threads")
                .takes_value(true)
                .help("Number of concurrent transfers"),
        )
        .get_matches();

    let root = matches.value_of("ROOT").unwrap();

    let config: Config = match matches.value_of("config") {
        Some(path) => serde_json::from_reader(
            fs::File::open(path).expect("Error opening config file"),
        )
        .expect("Error parsing config file"),
        None => Config::default(),
    };

    let logger = logging::init();

    let port = matches
        .value_of("port")
        .map(|raw| raw.parse().expect("Invalid port"))
        .or(config.port)
        .unwrap_or(message::DEFAULT_PORT);
    let host = matches
        .value_of("host")
        .map(str::to_string)
        .or(config.host)
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let threads = matches
        .value_of("threads")
        .map(|raw| raw.parse().expect("Invalid thread count"))
        .or(config.threads)
        .unwrap_or(4);

    let mut server = Server::new(&logger);
    server
        .set_root_directory(root)
        .set_port(port)
        .set_host(&host)
        .set_thread_count(threads);

    if let Some(timeout_ms) = config.timeout_ms {
        server.set_timeout(Duration::from_millis(timeout_ms));
    }
    if let Some(block_size) = config.block_size {
        server.set_block_size(block_size);
    }

    if let Err(err) = server.start() {
        logging::crit!(logger, "server failed to start"; "error" => ?err);
        std::process::exit(1);
    }

    logging::info!(logger, "serving"; "root" => root, "host" => %host, "port" => port);

    // Foreground driver: run until stdin delivers a line or closes.
    let stdin = std::io::stdin();
    let mut line = String::new();
    let _ = stdin.lock().read_line(&mut line);

    logging::info!(logger, "shutting down");
    server.stop();
}
