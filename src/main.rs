use clap::{Arg, Command};
use filter_rspamd::config::DEFAULT_CONFIG_PATH;
use filter_rspamd::protocol::{decode_line, encode_line};
use filter_rspamd::rspamd::{RspamdClient, Scanner};
use filter_rspamd::session::{ControlKey, Session};
use filter_rspamd::verdict::{self, ScanOutcome};
use filter_rspamd::{Config, Smtpd};
use log::LevelFilter;
use std::io::Write;
use std::process;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let matches = Command::new("filter-rspamd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("OpenSMTPD filter that scans messages with Rspamd")
        .long_about(
            "filter-rspamd is spawned by smtpd(8) as a filter process. It tracks \
             each SMTP session, submits every message to Rspamd, adds the X-Spam-* \
             headers and rejects at commit when Rspamd says so.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Scan a message file once and print the result")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("url")
                .long("url")
                .value_name("URL")
                .help("Rspamd base URL, overrides the configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    // stdout belongs to smtpd, env_logger writes to stderr
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);

    let mut config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if let Some(url) = matches.get_one::<String>("url") {
        config.rspamd_url = url.clone();
        if let Err(e) = config.validate() {
            eprintln!("Invalid --url: {e}");
            process::exit(1);
        }
    }

    if matches.get_flag("test-config") {
        println!("Configuration OK");
        println!("  Rspamd URL: {}", config.rspamd_url);
        match config.timeout_seconds {
            Some(seconds) => println!("  Timeout: {seconds}s"),
            None => println!("  Timeout: client default"),
        }
        println!("  Reject: {}", config.reject_replies.reject);
        println!("  Greylist: {}", config.reject_replies.greylist);
        println!("  Soft reject: {}", config.reject_replies.soft_reject);
        return;
    }

    if let Some(email_file) = matches.get_one::<String>("test-email") {
        test_email_file(&config, email_file).await;
        return;
    }

    log::info!("Starting filter-rspamd {}", env!("CARGO_PKG_VERSION"));

    let mut smtpd = match Smtpd::new(&config) {
        Ok(smtpd) => smtpd,
        Err(e) => {
            log::error!("Failed to create filter: {e}");
            process::exit(1);
        }
    };

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    if let Err(e) = smtpd.run(stdin, tokio::io::stdout()).await {
        log::error!("Filter error: {e}");
        process::exit(1);
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

async fn test_email_file(config: &Config, email_file: &str) {
    println!("Testing email file: {email_file}");
    println!();

    let content = match std::fs::read(email_file) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Error reading email file: {e}");
            process::exit(1);
        }
    };

    let client = match RspamdClient::new(config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Error creating Rspamd client: {e}");
            process::exit(1);
        }
    };

    // feed the file through the same path smtpd lines take, dot-stuffed
    let mut session = Session::new("test-email");
    session.control.set(ControlKey::Pass, "all");
    session.begin_body();
    let content = content.strip_suffix(b"\n").unwrap_or(&content[..]);
    for raw in content.split(|&b| b == b'\n').filter(|_| !content.is_empty()) {
        let line = decode_line(raw.strip_suffix(b"\r").unwrap_or(raw));
        if line.starts_with('.') {
            session.push(&format!(".{line}"));
        } else {
            session.push(&line);
        }
    }
    session.push(".");

    let Some(message) = session.message.as_ref() else {
        eprintln!("Message could not be reassembled");
        process::exit(1);
    };
    let outcome = client.scan(&session.control, message).await;

    match &outcome {
        ScanOutcome::NoVerdict => {
            println!("Result: NO VERDICT (Rspamd unreachable or reply unusable)");
            println!("   The message would pass through unmodified.");
        }
        ScanOutcome::Verdict(v) => {
            println!("Result: {}", v.action);
            println!("   Score: {}", v.score_header());
            println!("   Symbols: {}", v.symbols.join(", "));
            if let Some(subject) = &v.subject {
                let subject = encode_line(subject);
                println!("   Subject: {}", String::from_utf8_lossy(&subject));
            }
        }
    }

    verdict::apply(&mut session, &outcome, &config.reject_replies);
    match session.take_reject_reason() {
        Some(reason) => println!("   Commit: reject ({reason})"),
        None => println!("   Commit: proceed"),
    }

    if let Some(message) = &session.message {
        println!();
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(&encode_line(&message.to_scan_text())) {
            eprintln!("Error writing message: {e}");
            process::exit(1);
        }
    }
}
