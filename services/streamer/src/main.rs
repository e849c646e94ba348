use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Arg, ArgAction, Command};
use streamer::{SampleFile, StreamerConfig};
use tracing::{error, info};

fn validate_socket_addr(value: &str) -> Result<String, String> {
    value
        .parse::<SocketAddr>()
        .map(|_| value.to_owned())
        .map_err(|_| "Invalid socket address".to_owned())
}

fn validate_keyid(value: &str) -> Result<String, String> {
    if value.is_empty() || value.contains(',') {
        return Err("Key id must be non-empty and comma-free".to_owned());
    }
    Ok(value.to_owned())
}

fn validate_data_format(value: &str) -> Result<u32, String> {
    match value {
        "0" => Ok(0),
        "1" => Ok(1),
        _ => Err("Data format must be 0 or 1".to_owned()),
    }
}

fn validate_existing_file(value: &str) -> Result<String, String> {
    if !std::path::Path::new(value).is_file() {
        return Err("File does not exist".to_owned());
    }
    Ok(value.to_owned())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "streamer starting");

    let matches = Command::new("S4PP Streamer")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Uploads a sample file to an S4PP collector")
        .arg(
            Arg::new("collector")
                .help("The socket address of the collector. Eg. 192.168.0.40:4404")
                .value_name("collector_addr")
                .value_parser(validate_socket_addr)
                .required(true),
        )
        .arg(
            Arg::new("keyid")
                .help("The key identifier to authenticate with")
                .short('k')
                .long("keyid")
                .value_parser(validate_keyid)
                .required(true),
        )
        .arg(
            Arg::new("secret_file")
                .help("File holding the shared secret (read verbatim, trailing newline trimmed)")
                .short('s')
                .long("secret-file")
                .value_parser(validate_existing_file)
                .required(true),
        )
        .arg(
            Arg::new("file")
                .help("The sample file to upload")
                .short('f')
                .long("file")
                .value_parser(validate_existing_file)
                .required(true),
        )
        .arg(
            Arg::new("basetime")
                .help("Sequence base time; defaults to the current epoch seconds")
                .short('b')
                .long("basetime")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("divisor")
                .help("Time divisor for fixed-point timestamps")
                .short('d')
                .long("divisor")
                .value_parser(clap::value_parser!(i64))
                .default_value("1"),
        )
        .arg(
            Arg::new("format")
                .help("Data format of the sample rows")
                .short('t')
                .long("format")
                .value_parser(validate_data_format)
                .default_value("0"),
        )
        .arg(
            Arg::new("hide")
                .help("Encrypt the upload with the negotiated block cipher")
                .long("hide")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let secret_path: &String = matches.get_one("secret_file").unwrap();
    let secret = match std::fs::read_to_string(secret_path) {
        Ok(s) => s.trim_end_matches(['\r', '\n']).as_bytes().to_vec(),
        Err(e) => {
            error!(error = %e, "failed to read the secret file");
            std::process::exit(1);
        }
    };

    let file_path: &String = matches.get_one("file").unwrap();
    let samples = match std::fs::read_to_string(file_path).map_err(|e| e.to_string()) {
        Ok(text) => match SampleFile::parse(&text) {
            Ok(samples) => samples,
            Err(e) => {
                error!(error = %e, "failed to parse the sample file");
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!(error = %e, "failed to read the sample file");
            std::process::exit(1);
        }
    };

    let basetime = matches.get_one::<i64>("basetime").copied().unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    });

    let cfg = StreamerConfig {
        collector: matches.get_one::<String>("collector").unwrap().clone(),
        keyid: matches.get_one::<String>("keyid").unwrap().clone(),
        secret,
        hide: matches.get_flag("hide"),
        basetime,
        time_divisor: *matches.get_one::<i64>("divisor").unwrap(),
        data_format: *matches.get_one::<u32>("format").unwrap(),
        response_timeout: Duration::from_secs(30),
    };

    match streamer::upload(&cfg, &samples).await {
        Ok(outcome) if outcome.committed => {
            info!(seqid = outcome.seqid, "upload committed");
        }
        Ok(outcome) => {
            error!(seqid = outcome.seqid, "collector failed to store the sequence");
            std::process::exit(2);
        }
        Err(e) => {
            error!(error = %e, "upload failed");
            std::process::exit(1);
        }
    }
}
