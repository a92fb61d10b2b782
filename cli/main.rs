// Copyright 2018-2025 the Deno authors. MIT license.

use anyhow::Context;
use clap::Arg;
use clap::Command;
use nexec_ipc::Server;

fn cli() -> Command {
  Command::new("nexec")
    .about("Out-of-process native-code execution service")
    .arg(
      Arg::new("pipe")
        .long("pipe")
        .value_name("NAME")
        .help(
          "Endpoint name; maps to \\\\.\\pipe\\<NAME> on Windows and \
           /tmp/<NAME> elsewhere",
        )
        .required(true),
    )
    .arg(
      Arg::new("log-level")
        .long("log-level")
        .value_name("LEVEL")
        .help("error, warn, info, debug or trace")
        .default_value("info"),
    )
}

fn init_logging(level: &str) {
  env_logger::Builder::from_env(
    env_logger::Env::new()
      .filter_or("NEXEC_LOG", level)
      .write_style("NEXEC_LOG_STYLE"),
  )
  .format_timestamp(None)
  .init();
}

fn run() -> anyhow::Result<()> {
  let matches = cli().get_matches();
  let pipe_name = matches
    .get_one::<String>("pipe")
    .expect("--pipe is required by clap");
  let log_level = matches
    .get_one::<String>("log-level")
    .expect("--log-level has a default");
  init_logging(log_level);

  let server = Server::bind(pipe_name)
    .with_context(|| format!("failed to bind endpoint '{pipe_name}'"))?;
  server.run();
  Ok(())
}

fn main() {
  if let Err(e) = run() {
    eprintln!("Error: {e:#}");
    std::process::exit(1);
  }
}
